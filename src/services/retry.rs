//! Retrying, rate-limited, cost-accounted access to the model API.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::cancel::CancelScope;
use super::limiter::ConcurrencyLimiter;
use super::model_client::{classify, ApiError, ApiErrorKind, Disposition, ModelClient, ModelRequest};
use super::pricing::{PriceEntry, PriceTable};
use super::task_error::TaskError;
use crate::models::task::Accounting;

/// Attempt cap and exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait after the `failure`-th retryable failure (0-based): `base * 2^failure`.
    pub fn delay_for(&self, failure: u32) -> Duration {
        let factor = 2u32.saturating_pow(failure);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Running accounting for one task, shared by all calls the task makes.
#[derive(Debug)]
pub struct Ledger {
    ceiling: f64,
    state: Mutex<Accounting>,
}

impl Ledger {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling,
            state: Mutex::new(Accounting::default()),
        }
    }

    pub fn snapshot(&self) -> Accounting {
        *self.lock()
    }

    fn ensure_headroom(&self) -> Result<(), TaskError> {
        let spent = self.lock().cost;
        if spent >= self.ceiling {
            return Err(TaskError::CostCeilingExceeded {
                spent,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    /// Record a finished call. Fails once the running cost passes the ceiling.
    fn charge(&self, tokens_in: u64, tokens_out: u64, cost: f64) -> Result<(), TaskError> {
        let mut state = self.lock();
        state.tokens_in += tokens_in;
        state.tokens_out += tokens_out;
        state.cost += cost;
        state.calls += 1;
        if state.cost > self.ceiling {
            return Err(TaskError::CostCeilingExceeded {
                spent: state.cost,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Accounting> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Successful model call with its accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("no price entry for provider {0:?}")]
pub struct UnknownProvider(pub String);

pub struct RetryingClient {
    model: Arc<dyn ModelClient>,
    limiter: ConcurrencyLimiter,
    policy: RetryPolicy,
    price: PriceEntry,
}

impl RetryingClient {
    pub fn new(
        model: Arc<dyn ModelClient>,
        limiter: ConcurrencyLimiter,
        policy: RetryPolicy,
        prices: &PriceTable,
    ) -> Result<Self, UnknownProvider> {
        let price = prices
            .get(model.provider())
            .copied()
            .ok_or_else(|| UnknownProvider(model.provider().to_string()))?;
        Ok(Self {
            model,
            limiter,
            policy,
            price,
        })
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Perform one logical call, retrying transient failures with backoff.
    ///
    /// A limiter permit is held only while the request is in flight, never
    /// across a backoff sleep.
    pub async fn invoke(
        &self,
        mut request: ModelRequest,
        ledger: &Ledger,
        scope: &CancelScope,
    ) -> Result<Completion, TaskError> {
        if request.max_tokens.is_none() {
            request.max_tokens = Some(self.price.max_tokens);
        }

        let mut attempt: u32 = 0;
        loop {
            scope.check()?;
            ledger.ensure_headroom()?;
            attempt += 1;

            let started = Instant::now();
            let result = {
                let _permit = self.limiter.acquire(scope).await?;
                scope.run(self.model.complete(&request)).await?
            };

            let error = match result {
                Ok(response) => {
                    let cost = self.price.cost(response.tokens_in, response.tokens_out);
                    metrics::histogram!("docflow_api_cost_usd").record(cost);
                    tracing::debug!(
                        attempt,
                        tokens_in = response.tokens_in,
                        tokens_out = response.tokens_out,
                        cost,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "Model call succeeded"
                    );
                    ledger.charge(response.tokens_in, response.tokens_out, cost)?;
                    return Ok(Completion {
                        text: response.text,
                        tokens_in: response.tokens_in,
                        tokens_out: response.tokens_out,
                        cost,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            if classify(&error) == Disposition::Fatal {
                tracing::error!(attempt, error = %error, "Model call failed (non-retryable)");
                return Err(fatal_task_error(error));
            }

            metrics::counter!("docflow_api_retries_total", "kind" => format!("{:?}", error.kind))
                .increment(1);

            if attempt >= self.policy.max_attempts {
                tracing::error!(attempt, error = %error, "Model call failed, retries exhausted");
                return Err(TaskError::TransientExhausted {
                    attempts: attempt,
                    last: error.to_string(),
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                retry_after_ms = error.retry_after.map(|d| d.as_millis() as u64),
                error = %error,
                "Model call failed, backing off"
            );
            scope.run(tokio::time::sleep(delay)).await?;
        }
    }
}

fn fatal_task_error(error: ApiError) -> TaskError {
    match error.kind {
        ApiErrorKind::Unauthorized => TaskError::Unauthorized(error.message),
        ApiErrorKind::QuotaExceeded => TaskError::QuotaExceeded(error.message),
        // The provider's body is logged above and stays out of the task record.
        ApiErrorKind::BadRequest => {
            TaskError::InvalidInput("the processing service rejected the request".to_string())
        }
        _ => TaskError::Internal(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::model_client::ModelResponse;
    use crate::services::task_error::ErrorKind;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    struct Scripted {
        replies: Mutex<VecDeque<Result<ModelResponse, ApiError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ModelResponse, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        fn provider(&self) -> &str {
            "anthropic"
        }

        async fn complete(&self, _request: &ModelRequest) -> Result<ModelResponse, ApiError> {
            self.calls.lock().unwrap().push(Instant::now());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::new(ApiErrorKind::ServerError, "script exhausted")))
        }
    }

    fn ok(tokens_in: u64, tokens_out: u64) -> Result<ModelResponse, ApiError> {
        Ok(ModelResponse {
            text: "done".into(),
            tokens_in,
            tokens_out,
        })
    }

    fn client(model: Arc<Scripted>) -> RetryingClient {
        RetryingClient::new(
            model,
            ConcurrencyLimiter::new(1),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
            },
            &PriceTable::default(),
        )
        .unwrap()
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let model = Scripted::new(vec![
            Err(ApiError::from_status(429, "slow down", None)),
            ok(1000, 500),
        ]);
        let client = client(model.clone());
        let ledger = Ledger::new(1.0);

        let completion = client
            .invoke(ModelRequest::default(), &ledger, &CancelScope::detached())
            .await
            .unwrap();

        assert_eq!(completion.attempts, 2);
        assert!((completion.cost - 0.0105).abs() < 1e-12);
        assert_eq!(ledger.snapshot().tokens_in, 1000);
        assert_eq!(client.limiter().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_with_strictly_increasing_delays() {
        let model = Scripted::new(vec![]);
        let client = client(model.clone());

        let err = client
            .invoke(ModelRequest::default(), &Ledger::new(1.0), &CancelScope::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::TransientExhausted { attempts: 3, .. }));
        let calls = model.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(second_gap > first_gap);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let model = Scripted::new(vec![Err(ApiError::from_status(401, "bad key", None))]);
        let client = client(model.clone());

        let err = client
            .invoke(ModelRequest::default(), &Ledger::new(1.0), &CancelScope::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::Unauthorized(_)));
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_is_reported_as_quota() {
        let model = Scripted::new(vec![Err(ApiError::from_status(
            402,
            "Your credit balance is too low",
            None,
        ))]);
        let client = client(model.clone());

        let err = client
            .invoke(ModelRequest::default(), &Ledger::new(1.0), &CancelScope::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::QuotaExceeded(_)));
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_rejection_body_stays_out_of_user_message() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"prompt is too long: 212000 tokens > 200000 maximum"}}"#;
        let model = Scripted::new(vec![Err(ApiError::from_status(400, body, None))]);
        let client = client(model.clone());

        let err = client
            .invoke(ModelRequest::default(), &Ledger::new(1.0), &CancelScope::detached())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let message = err.user_message();
        assert!(!message.contains("invalid_request_error"));
        assert!(!message.contains("212000"));
        assert_eq!(model.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cost_ceiling_stops_further_calls() {
        // 100k output tokens at $15/M = $1.50 per call.
        let model = Scripted::new(vec![ok(0, 100_000), ok(0, 100_000)]);
        let client = client(model.clone());
        let ledger = Ledger::new(2.0);

        client
            .invoke(ModelRequest::default(), &ledger, &CancelScope::detached())
            .await
            .unwrap();
        let err = client
            .invoke(ModelRequest::default(), &ledger, &CancelScope::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::CostCeilingExceeded { .. }));

        let err = client
            .invoke(ModelRequest::default(), &ledger, &CancelScope::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::CostCeilingExceeded { .. }));
        assert_eq!(model.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let model = Scripted::new(vec![]);
        let client = Arc::new(client(model.clone()));
        let task = CancellationToken::new();
        let scope = CancelScope::new(CancellationToken::new(), task.clone());

        let handle = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .invoke(ModelRequest::default(), &Ledger::new(1.0), &scope)
                    .await
            })
        };
        // First attempt fails immediately; cancel while sleeping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.cancel();

        assert!(matches!(handle.await.unwrap(), Err(TaskError::Cancelled)));
        assert_eq!(model.calls.lock().unwrap().len(), 1);
        assert_eq!(client.limiter().available(), 1);
    }
}
