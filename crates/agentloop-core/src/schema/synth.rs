//! Schema synthesis from type shapes
//!
//! Two passes over the type graph. The first finds every structure that can
//! reach itself; the second emits the schema, moving exactly those structures
//! into `$defs` and pointing at them with `$ref`. The root is always inlined.

use std::collections::{HashMap, HashSet};
use std::any::TypeId;

use indexmap::IndexMap;
use serde_json::Value;

use super::shape::{FieldShape, StructShape, TypeRef, TypeShape};
use super::{Schema, SchemaError};

/// Placeholder definition name for anonymous structures
const ANONYMOUS_DEF: &str = "Object";

/// Synthesize the schema of `root`
pub fn synthesize(root: TypeRef) -> Result<Schema, SchemaError> {
    let mut synth = Synthesizer {
        recursive: recursive_structs(root),
        names: HashMap::new(),
        taken: HashSet::new(),
        defs: IndexMap::new(),
    };

    let mut schema = synth.emit(root, true)?;
    schema.defs = synth.defs;
    Ok(schema)
}

struct Synthesizer {
    /// Structures that reach themselves
    recursive: HashSet<TypeId>,
    /// Definition name per structure, assigned on first encounter
    names: HashMap<TypeId, String>,
    taken: HashSet<String>,
    defs: IndexMap<String, Schema>,
}

impl Synthesizer {
    fn emit(&mut self, ty: TypeRef, is_root: bool) -> Result<Schema, SchemaError> {
        match ty.shape() {
            TypeShape::String => Ok(Schema::string()),
            TypeShape::Integer => Ok(Schema::integer()),
            TypeShape::Number => Ok(Schema::number()),
            TypeShape::Boolean => Ok(Schema::boolean()),
            TypeShape::Any => Ok(Schema::default()),
            TypeShape::Array(item) => Ok(Schema::array(self.emit(item, false)?)),
            TypeShape::Map(value) => Ok(Schema::map(self.emit(value, false)?)),
            TypeShape::Optional(inner) => self.emit(inner, is_root),
            TypeShape::Struct(shape) => {
                if !self.recursive.contains(&ty.id()) {
                    return self.struct_body(&shape);
                }

                let name = self.def_name(ty, &shape);
                if !self.defs.contains_key(&name) {
                    // Reserve the slot first so self-references resolve to $ref
                    self.defs.insert(name.clone(), Schema::default());
                    let body = self.struct_body(&shape)?;
                    self.defs.insert(name.clone(), body);
                }

                if is_root {
                    Ok(self.defs.get(&name).cloned().unwrap_or_default())
                } else {
                    Ok(Schema::reference(format!("#/$defs/{name}")))
                }
            }
        }
    }

    fn struct_body(&mut self, shape: &StructShape) -> Result<Schema, SchemaError> {
        let mut schema = Schema::object();
        schema.description.clone_from(&shape.description);

        for field in &shape.fields {
            if schema.properties.contains_key(&field.name) {
                return Err(SchemaError::DuplicateField {
                    structure: shape.name.clone(),
                    field: field.name.clone(),
                });
            }

            let mut property = self.emit(field.ty, false)?;
            if let Some(description) = &field.description {
                property.description = Some(description.clone());
            }
            if !field.enum_values.is_empty() {
                apply_enum(field, field.ty, &mut property)?;
            }
            if let Some(default) = &field.default {
                property.default = Some(default.clone());
            }

            let optional = matches!(field.ty.shape(), TypeShape::Optional(_));
            if field.required.unwrap_or(!optional) {
                schema.required.push(field.name.clone());
            }
            schema.properties.insert(field.name.clone(), property);
        }

        Ok(schema)
    }

    fn def_name(&mut self, ty: TypeRef, shape: &StructShape) -> String {
        if let Some(name) = self.names.get(&ty.id()) {
            return name.clone();
        }

        let base = if shape.name.is_empty() {
            ANONYMOUS_DEF.to_owned()
        } else {
            shape.name.clone()
        };

        let mut name = base.clone();
        if self.taken.contains(&name) && !shape.name.is_empty() {
            // Same declared name, different type: qualify by type path
            name = qualified_name(ty.type_name());
        }
        let mut suffix = 2;
        while self.taken.contains(&name) {
            name = format!("{base}{suffix}");
            suffix += 1;
        }

        self.taken.insert(name.clone());
        self.names.insert(ty.id(), name.clone());
        name
    }
}

/// `my_crate::models::Node<T>` -> `my_crate.models.Node_T_`
fn qualified_name(type_name: &str) -> String {
    type_name
        .replace("::", ".")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

/// Attach parsed enum values to the primitive the field resolves to
fn apply_enum(field: &FieldShape, ty: TypeRef, schema: &mut Schema) -> Result<(), SchemaError> {
    let shape = ty.shape();
    match shape {
        TypeShape::Optional(inner) => apply_enum(field, inner, schema),
        TypeShape::Array(item) => match schema.items.as_deref_mut() {
            Some(items) => apply_enum(field, item, items),
            None => Err(unsupported_enum(field, ty)),
        },
        ref primitive => {
            let Some(expected) = primitive.primitive_name() else {
                return Err(unsupported_enum(field, ty));
            };
            schema.enum_values = field
                .enum_values
                .iter()
                .map(|raw| parse_enum_value(primitive, raw).ok_or_else(|| SchemaError::InvalidEnumValue {
                    field: field.name.clone(),
                    value: raw.clone(),
                    expected,
                }))
                .collect::<Result<_, _>>()?;
            Ok(())
        }
    }
}

fn unsupported_enum(field: &FieldShape, ty: TypeRef) -> SchemaError {
    SchemaError::UnsupportedEnumType {
        field: field.name.clone(),
        type_name: ty.type_name().to_owned(),
    }
}

fn parse_enum_value(shape: &TypeShape, raw: &str) -> Option<Value> {
    let raw = raw.trim();
    match shape {
        TypeShape::String => Some(Value::String(raw.to_owned())),
        TypeShape::Integer => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<u64>().map(Value::from))
            .ok(),
        TypeShape::Number => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        TypeShape::Boolean => raw.parse::<bool>().ok().map(Value::Bool),
        _ => None,
    }
}

/// Structures reachable from themselves through any chain of fields
fn recursive_structs(root: TypeRef) -> HashSet<TypeId> {
    let mut edges: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
    let mut pending = Vec::new();
    collect_structs(root, &mut pending);

    while let Some(ty) = pending.pop() {
        if edges.contains_key(&ty.id()) {
            continue;
        }
        let mut children = Vec::new();
        if let TypeShape::Struct(shape) = ty.shape() {
            for field in &shape.fields {
                collect_structs(field.ty, &mut children);
            }
        }
        edges.insert(ty.id(), children.iter().map(TypeRef::id).collect());
        pending.extend(children);
    }

    edges
        .keys()
        .copied()
        .filter(|&start| reaches(&edges, start))
        .collect()
}

/// Structure types directly under `ty`, looking through containers
fn collect_structs(ty: TypeRef, out: &mut Vec<TypeRef>) {
    match ty.shape() {
        TypeShape::Array(inner) | TypeShape::Map(inner) | TypeShape::Optional(inner) => {
            collect_structs(inner, out);
        }
        TypeShape::Struct(_) => out.push(ty),
        _ => {}
    }
}

fn reaches(edges: &HashMap<TypeId, Vec<TypeId>>, start: TypeId) -> bool {
    let mut visited = HashSet::new();
    let mut stack: Vec<TypeId> = edges.get(&start).cloned().unwrap_or_default();

    while let Some(id) = stack.pop() {
        if id == start {
            return true;
        }
        if visited.insert(id) {
            if let Some(next) = edges.get(&id) {
                stack.extend(next.iter().copied());
            }
        }
    }
    false
}
