//! Call Context
//!
//! Carries the caller's cancellation signal through middleware, providers,
//! streams and tools.

use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};

/// Per-call context passed down the provider stack
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context governed by an existing token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Context cancelled together with this one, but cancellable on its own
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Fail fast if the context is already cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` unless the context is cancelled first
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
            result = fut => result,
        }
    }
}
