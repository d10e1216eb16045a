// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transient-failure retry for model calls.
//!
//! Rate limits (429), server errors (5xx), and network failures are retried
//! up to 3 attempts with exponential back-off before the error surfaces.
//! Only the *opening* of the stream is retried; once chunks are flowing, a
//! mid-stream error belongs to the executor's failure handling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{CompletionRequest, ModelProvider, ResponseStream};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

pub struct RetryProvider {
    inner: Arc<dyn ModelProvider>,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn ModelProvider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ModelProvider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.inner.complete(req.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                    warn!(
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient model error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.expect("loop ran at least once"))
    }
}

/// Classify an error as transient.  reqwest errors carry the status code in
/// the chain; anything else is matched on the rendered message, which is how
/// provider drivers report HTTP failures (`"<driver> error <status>: …"`).
pub(crate) fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(re) = cause.downcast_ref::<reqwest::Error>() {
            if re.is_timeout() || re.is_connect() {
                return true;
            }
            if let Some(status) = re.status() {
                return status.as_u16() == 429 || status.is_server_error();
            }
        }
    }
    let msg = err.to_string();
    msg.contains(" 429")
        || msg.contains("error 429")
        || msg.contains("error 500")
        || msg.contains("error 502")
        || msg.contains("error 503")
        || msg.contains("error 529")
        || msg.contains("connection reset")
        || msg.contains("request failed")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::ResponseEvent;

    /// Fails the first `fail_count` complete() calls, then succeeds.
    struct FlakyProvider {
        calls: AtomicU32,
        fail_count: u32,
        message: &'static str,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        fn model_name(&self) -> &str {
            "flaky-model"
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_count {
                anyhow::bail!("{}", self.message);
            }
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(ResponseEvent::TextDelta("ok".into())),
                Ok(ResponseEvent::Done),
            ])))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let flaky = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_count: 2,
            message: "flaky error 503: upstream overloaded",
        });
        let provider = RetryProvider::new(flaky.clone());
        let result = provider.complete(CompletionRequest::default()).await;
        assert!(result.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let flaky = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_count: 10,
            message: "flaky error 429: rate limited",
        });
        let provider = RetryProvider::new(flaky.clone());
        assert!(provider.complete(CompletionRequest::default()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        let flaky = Arc::new(FlakyProvider {
            calls: AtomicU32::new(0),
            fail_count: 10,
            message: "flaky error 401: bad api key",
        });
        let provider = RetryProvider::new(flaky.clone());
        assert!(provider.complete(CompletionRequest::default()).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&anyhow::anyhow!("openai error 429: slow down")));
        assert!(is_transient(&anyhow::anyhow!("openai error 503: overloaded")));
        assert!(!is_transient(&anyhow::anyhow!("openai error 400: bad request")));
        assert!(!is_transient(&anyhow::anyhow!("invalid model reference")));
    }
}
