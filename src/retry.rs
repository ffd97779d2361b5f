use std::future::Future;
use std::time::Duration;

/// Result of a single attempt, tagged so the retry loop never has to
/// inspect an error to decide whether another attempt is worthwhile.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    /// Retrying will never succeed (e.g. the resource is gone).
    Terminal(E),
    /// Worth another attempt after the configured delay.
    Transient(E),
}

/// Fixed attempt budget with a fixed pause between attempts.
///
/// A fixed delay keeps the sequential fetch stage predictable: a page with
/// one flaky item costs at most `(max_attempts - 1) * delay` of wall time.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("terminal failure: {0}")]
    Terminal(E),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E: std::fmt::Display> RetryError<E> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryError::Terminal(_))
    }

    /// The underlying cause of the final failed attempt.
    pub fn cause(&self) -> &E {
        match self {
            RetryError::Terminal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `operation` until it succeeds, reports a terminal failure, or the
/// attempt budget is spent.
///
/// A budget of zero is treated as one attempt.
pub async fn retry_with_delay<F, Fut, T, E>(
    config: &RetryConfig,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Attempt::Success(val) => return Ok(val),
            Attempt::Terminal(e) => return Err(RetryError::Terminal(e)),
            Attempt::Transient(e) => {
                if attempt >= total_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: total_attempts,
                        last: e,
                    });
                }
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}ms: {}",
                    attempt,
                    total_attempts,
                    config.delay.as_millis(),
                    e
                );
                tokio::time::sleep(config.delay).await;
                attempt += 1;
            }
        }
    }
}
