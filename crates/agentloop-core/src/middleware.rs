//! Provider Middleware
//!
//! Each middleware wraps a [`SendFn`] and returns one with the same
//! signature, so policies compose freely:
//!
//! ```text
//! Timeout -> Retry -> Logging -> Provider
//! ```
//!
//! ```rust,ignore
//! let send = middleware::chain(provider, &[
//!     Arc::new(TimeoutMiddleware::new(&TimeoutConfig::default())),
//!     Arc::new(RetryMiddleware::new(RetryConfig::default())),
//!     Arc::new(LoggingMiddleware::new()),
//! ]);
//! let response = send(CallContext::new(), request).await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use tracing::Instrument;

use crate::config::{RetryConfig, TimeoutConfig};
use crate::context::CallContext;
use crate::error::{AgentError, Result};
use crate::provider::{ChatRequest, ChatResponse, LlmProvider};

pub const LLM_REQUEST_COUNT: &str = "llm.request.count";
pub const LLM_REQUEST_ERRORS: &str = "llm.request.errors";
pub const LLM_TOKEN_USAGE: &str = "llm.token.usage";
pub const LLM_REQUEST_DURATION: &str = "llm.request.duration";

/// Future returned by a [`SendFn`]
pub type SendFuture = BoxFuture<'static, Result<ChatResponse>>;

/// One non-streaming provider call
pub type SendFn = Arc<dyn Fn(CallContext, ChatRequest) -> SendFuture + Send + Sync>;

/// Wraps a send function with a policy
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: SendFn) -> SendFn;
}

/// Send function calling the provider directly
pub fn provider_send(provider: Arc<dyn LlmProvider>) -> SendFn {
    Arc::new(move |ctx: CallContext, request: ChatRequest| -> SendFuture {
        let provider = Arc::clone(&provider);
        Box::pin(async move { provider.send(&ctx, &request).await })
    })
}

/// Compose middlewares around a provider. The first middleware is the
/// outermost.
pub fn chain(provider: Arc<dyn LlmProvider>, middlewares: &[Arc<dyn Middleware>]) -> SendFn {
    middlewares
        .iter()
        .rev()
        .fold(provider_send(provider), |next, middleware| middleware.wrap(next))
}

/// Hard deadline over the wrapped call, retries included
pub struct TimeoutMiddleware {
    limit: Duration,
}

impl TimeoutMiddleware {
    pub const fn new(config: &TimeoutConfig) -> Self {
        Self::from_duration(config.duration())
    }

    pub const fn from_duration(limit: Duration) -> Self {
        Self { limit }
    }
}

impl Middleware for TimeoutMiddleware {
    fn wrap(&self, next: SendFn) -> SendFn {
        let limit = self.limit;
        Arc::new(move |ctx: CallContext, request: ChatRequest| -> SendFuture {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let inner = ctx.child();
                match tokio::time::timeout(limit, next(inner.clone(), request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        inner.cancel();
                        tracing::warn!(timeout = ?limit, "provider call timed out");
                        Err(AgentError::Timeout(limit))
                    }
                }
            })
        })
    }
}

/// Retries transport failures with capped exponential backoff
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl Middleware for RetryMiddleware {
    fn wrap(&self, next: SendFn) -> SendFn {
        let config = self.config.clone();
        Arc::new(move |ctx: CallContext, request: ChatRequest| -> SendFuture {
            let next = Arc::clone(&next);
            let config = config.clone();
            Box::pin(async move {
                let mut retry = 0;
                loop {
                    ctx.check()?;
                    let err = match next(ctx.clone(), request.clone()).await {
                        Ok(response) => return Ok(response),
                        Err(e) => e,
                    };
                    if !err.is_retryable() || retry >= config.max_retries {
                        return Err(err);
                    }

                    let delay = config.backoff(retry);
                    retry += 1;
                    tracing::warn!(
                        attempt = retry,
                        max_retries = config.max_retries,
                        delay = ?delay,
                        error = %err,
                        "retrying provider call"
                    );
                    tokio::select! {
                        biased;
                        () = ctx.cancelled() => return Err(AgentError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            })
        })
    }
}

/// Spans, structured logs and request metrics. Never changes the result.
pub struct LoggingMiddleware {
    requests: Counter<u64>,
    errors: Counter<u64>,
    tokens: Counter<u64>,
    duration: Histogram<f64>,
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingMiddleware {
    /// Instruments come from the global meter; they are no-ops until the
    /// application installs a meter provider.
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("agentloop");
        Self {
            requests: meter
                .u64_counter(LLM_REQUEST_COUNT)
                .with_description("Provider calls")
                .build(),
            errors: meter
                .u64_counter(LLM_REQUEST_ERRORS)
                .with_description("Failed provider calls")
                .build(),
            tokens: meter
                .u64_counter(LLM_TOKEN_USAGE)
                .with_description("Tokens consumed")
                .build(),
            duration: meter
                .f64_histogram(LLM_REQUEST_DURATION)
                .with_description("Provider call latency")
                .with_unit("s")
                .build(),
        }
    }
}

impl Middleware for LoggingMiddleware {
    fn wrap(&self, next: SendFn) -> SendFn {
        let requests = self.requests.clone();
        let errors = self.errors.clone();
        let tokens = self.tokens.clone();
        let duration = self.duration.clone();

        Arc::new(move |ctx: CallContext, request: ChatRequest| -> SendFuture {
            let next = Arc::clone(&next);
            let requests = requests.clone();
            let errors = errors.clone();
            let tokens = tokens.clone();
            let duration = duration.clone();

            let span = tracing::info_span!(
                "llm.request",
                model = %request.model,
                messages = request.messages.len(),
                tools = request.tools.len(),
            );

            Box::pin(
                async move {
                    let attributes = [KeyValue::new("model", request.model.clone())];
                    let start = Instant::now();
                    tracing::debug!("sending request");

                    let result = next(ctx, request).await;

                    let elapsed = start.elapsed();
                    requests.add(1, &attributes);
                    duration.record(elapsed.as_secs_f64(), &attributes);

                    match &result {
                        Ok(response) => {
                            if let Some(usage) = response.usage {
                                tokens.add(u64::from(usage.prompt_tokens), &with_kind(&attributes, "prompt"));
                                tokens.add(u64::from(usage.completion_tokens), &with_kind(&attributes, "completion"));
                            }
                            tracing::info!(
                                elapsed = ?elapsed,
                                finish_reason = ?response.finish_reason,
                                tool_calls = response.tool_calls.len(),
                                total_tokens = response.usage.map(|u| u.total_tokens),
                                "request completed"
                            );
                        }
                        Err(e) => {
                            errors.add(1, &with_kind(&attributes, &e.phase().to_string()));
                            tracing::warn!(elapsed = ?elapsed, phase = %e.phase(), error = %e, "request failed");
                        }
                    }
                    result
                }
                .instrument(span),
            )
        })
    }
}

fn with_kind(attributes: &[KeyValue], kind: &str) -> Vec<KeyValue> {
    let mut extended = attributes.to_vec();
    extended.push(KeyValue::new("kind", kind.to_owned()));
    extended
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::provider::EventStream;

    /// Fails `failures` times with the given error, then answers
    struct FlakyProvider {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> AgentError,
        delay: Duration,
    }

    impl FlakyProvider {
        fn new(failures: usize, error: fn() -> AgentError) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                error,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _ctx: &CallContext, _request: &ChatRequest) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(ChatResponse {
                    content: "ok".into(),
                    ..Default::default()
                })
            }
        }

        async fn start_stream(&self, _ctx: &CallContext, _request: &ChatRequest) -> Result<EventStream> {
            Err(AgentError::Config("streaming not supported".into()))
        }
    }

    fn fast_retry(max_retries: u32) -> Arc<dyn Middleware> {
        Arc::new(RetryMiddleware::new(RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        }))
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let provider = Arc::new(FlakyProvider::new(2, || AgentError::transport("connection reset")));
        let send = chain(provider.clone(), &[fast_retry(3)]);

        let response = send(CallContext::new(), ChatRequest::new("m")).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error() {
        let provider = Arc::new(FlakyProvider::new(10, || AgentError::http_status(503, "busy")));
        let send = chain(provider.clone(), &[fast_retry(2)]);

        let err = send(CallContext::new(), ChatRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport { status: Some(503), .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_malformed_response() {
        let provider = Arc::new(FlakyProvider::new(1, || AgentError::MalformedResponse("zero choices".into())));
        let send = chain(provider.clone(), &[fast_retry(3)]);

        assert!(send(CallContext::new(), ChatRequest::new("m")).await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_bounds_slow_provider() {
        let mut slow = FlakyProvider::new(0, || AgentError::transport("unused"));
        slow.delay = Duration::from_secs(5);
        let limit = Duration::from_millis(50);
        let timeout: Arc<dyn Middleware> = Arc::new(TimeoutMiddleware::from_duration(limit));
        let send = chain(Arc::new(slow), &[timeout]);

        let start = Instant::now();
        let err = send(CallContext::new(), ChatRequest::new("m")).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_cancellation());
        assert!(elapsed >= limit);
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_timeout_covers_retries() {
        let provider = Arc::new(FlakyProvider::new(usize::MAX, || AgentError::transport("down")));
        let retry: Arc<dyn Middleware> = Arc::new(RetryMiddleware::new(RetryConfig {
            max_retries: 100,
            initial_delay_ms: 20,
            max_delay_ms: 20,
            multiplier: 1.0,
        }));
        let timeout: Arc<dyn Middleware> = Arc::new(TimeoutMiddleware::from_duration(Duration::from_millis(60)));
        let send = chain(provider, &[timeout, retry]);

        let err = send(CallContext::new(), ChatRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_retrying() {
        let provider = Arc::new(FlakyProvider::new(usize::MAX, || AgentError::transport("down")));
        let send = chain(provider.clone(), &[fast_retry(5)]);

        let ctx = CallContext::new();
        ctx.cancel();
        let err = send(ctx, ChatRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let provider = Arc::new(FlakyProvider::new(0, || AgentError::transport("unused")));
        let logging: Arc<dyn Middleware> = Arc::new(LoggingMiddleware::new());
        let send = chain(provider, &[logging]);

        let response = send(CallContext::new(), ChatRequest::new("m")).await.unwrap();
        assert_eq!(response.content, "ok");
    }
}
