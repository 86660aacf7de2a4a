//! Structural type descriptions
//!
//! Rust has no runtime reflection, so types describe their own structure
//! through [`Describe`]. The synthesizer walks these descriptions; it never
//! inspects values.

use std::any::{TypeId, type_name};
use std::collections::{BTreeMap, HashMap};

/// Builds the shape of a type on demand
pub type ShapeFn = fn() -> TypeShape;

/// Identity plus lazily built shape of a described type
#[derive(Clone, Copy)]
pub struct TypeRef {
    id: TypeId,
    type_name: &'static str,
    shape: ShapeFn,
}

impl TypeRef {
    pub fn of<T: Describe>() -> Self {
        T::type_ref()
    }

    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Full Rust type path, used to disambiguate definition names
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn shape(&self) -> TypeShape {
        (self.shape)()
    }
}

impl std::fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypeRef").field(&self.type_name).finish()
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeRef {}

/// Structural description of one type
#[derive(Clone, Debug)]
pub enum TypeShape {
    String,
    Integer,
    Number,
    Boolean,
    /// Any JSON value
    Any,
    Array(TypeRef),
    /// Object with string keys and uniform values
    Map(TypeRef),
    /// Nullable wrapper; fields of this shape are not required
    Optional(TypeRef),
    Struct(StructShape),
}

impl TypeShape {
    /// JSON Schema type name of primitive shapes
    pub const fn primitive_name(&self) -> Option<&'static str> {
        match self {
            Self::String => Some("string"),
            Self::Integer => Some("integer"),
            Self::Number => Some("number"),
            Self::Boolean => Some("boolean"),
            _ => None,
        }
    }
}

/// A structure with named fields
#[derive(Clone, Debug, Default)]
pub struct StructShape {
    /// Declared name; empty for anonymous structures
    pub name: String,
    pub description: Option<String>,
    pub fields: Vec<FieldShape>,
}

impl StructShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldShape) -> Self {
        self.fields.push(field);
        self
    }
}

impl From<StructShape> for TypeShape {
    fn from(shape: StructShape) -> Self {
        Self::Struct(shape)
    }
}

/// A structure field plus its schema directives
#[derive(Clone, Debug)]
pub struct FieldShape {
    pub name: String,
    pub ty: TypeRef,
    pub description: Option<String>,
    /// Allowed values as written; parsed into the field's primitive type
    pub enum_values: Vec<String>,
    /// Explicit override of the required computation
    pub required: Option<bool>,
    pub default: Option<serde_json::Value>,
}

impl FieldShape {
    pub fn of<T: Describe>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: T::type_ref(),
            description: None,
            enum_values: Vec::new(),
            required: None,
            default: None,
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    #[must_use]
    pub fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Types that can describe their own structure
///
/// ```rust,ignore
/// struct Weather { city: String, unit: Option<String> }
///
/// impl Describe for Weather {
///     fn shape() -> TypeShape {
///         StructShape::new("Weather")
///             .field(FieldShape::of::<String>("city").description("City name"))
///             .field(FieldShape::of::<Option<String>>("unit").enum_values(["c", "f"]))
///             .into()
///     }
/// }
/// ```
pub trait Describe: 'static {
    fn shape() -> TypeShape;

    /// Identity used for cycle detection and caching. Transparent wrappers
    /// such as `Box<T>` forward to the wrapped type.
    fn type_ref() -> TypeRef
    where
        Self: Sized,
    {
        TypeRef {
            id: TypeId::of::<Self>(),
            type_name: type_name::<Self>(),
            shape: Self::shape,
        }
    }
}

macro_rules! describe_primitive {
    ($shape:ident: $($ty:ty),+) => {
        $(
            impl Describe for $ty {
                fn shape() -> TypeShape {
                    TypeShape::$shape
                }
            }
        )+
    };
}

describe_primitive!(String: String, char);
describe_primitive!(Boolean: bool);
describe_primitive!(Integer: i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
describe_primitive!(Number: f32, f64);
describe_primitive!(Any: serde_json::Value);

impl<T: Describe> Describe for Vec<T> {
    fn shape() -> TypeShape {
        TypeShape::Array(T::type_ref())
    }
}

impl<T: Describe> Describe for Option<T> {
    fn shape() -> TypeShape {
        TypeShape::Optional(T::type_ref())
    }
}

impl<T: Describe> Describe for Box<T> {
    fn shape() -> TypeShape {
        T::shape()
    }

    fn type_ref() -> TypeRef {
        T::type_ref()
    }
}

impl<V: Describe, S: 'static> Describe for HashMap<String, V, S> {
    fn shape() -> TypeShape {
        TypeShape::Map(V::type_ref())
    }
}

impl<V: Describe> Describe for BTreeMap<String, V> {
    fn shape() -> TypeShape {
        TypeShape::Map(V::type_ref())
    }
}
