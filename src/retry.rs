use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use rand::Rng;

use crate::error::TransportErrorKind;

/// How the wait between attempts grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Every retry waits the configured retry wait.
    #[default]
    Fixed,
    /// The retry wait doubles with each retry, capped at `max`. Never shorter
    /// than the configured retry wait.
    Exponential { max: Duration },
}

/// Classified outcome of one failed attempt.
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timed_out: bool,
}

impl RetryDecision {
    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub(crate) fn with_transport_error(mut self, kind: TransportErrorKind) -> Self {
        self.transport_error_kind = Some(kind);
        self
    }

    pub(crate) fn timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    retries: usize,
    wait: Duration,
    backoff: Backoff,
    jitter_ratio: f64,
    retryable_status_codes: BTreeSet<u16>,
    retryable_transport_error_kinds: BTreeSet<TransportErrorKind>,
    retry_on_timeout: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("wait", &self.wait)
            .field("backoff", &self.backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retryable_status_codes", &self.retryable_status_codes)
            .field(
                "retryable_transport_error_kinds",
                &self.retryable_transport_error_kinds,
            )
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(retries: usize, wait: Duration) -> Self {
        Self {
            retries,
            wait,
            backoff: Backoff::Fixed,
            jitter_ratio: 0.0,
            retryable_status_codes: default_retryable_status_codes(),
            retryable_transport_error_kinds: default_retryable_transport_error_kinds(),
            retry_on_timeout: true,
            retry_classifier: None,
        }
    }

    /// Exactly one attempt.
    pub fn disabled() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Random extra wait of up to `ratio` times the computed wait, for fixed
    /// and exponential backoff alike. Only ever lengthens a wait.
    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.retryable_transport_error_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn backoff_mode(&self) -> Backoff {
        self.backoff
    }

    pub fn jitter(&self) -> f64 {
        self.jitter_ratio
    }

    /// Initial attempt plus retries.
    pub fn max_attempts(&self) -> usize {
        self.retries.saturating_add(1)
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Whether another attempt is both allowed by the budget and warranted by the outcome.
    pub fn should_retry(&self, decision: &RetryDecision) -> bool {
        decision.attempt < decision.max_attempts && self.is_retryable(decision)
    }

    /// Classifies the outcome alone, ignoring the remaining budget.
    pub fn is_retryable(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if let Some(status) = decision.status {
            return self.is_retryable_status(status);
        }
        if let Some(kind) = decision.transport_error_kind {
            return self.retryable_transport_error_kinds.contains(&kind);
        }
        if decision.timed_out {
            return self.retry_on_timeout;
        }
        false
    }

    /// Wait before retry number `retry_index` (1 for the first retry).
    pub fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let wait = match self.backoff {
            Backoff::Fixed => self.wait,
            Backoff::Exponential { max } => {
                let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
                let multiplier = 1_u128 << capped_exponent;
                let base_ms = self.wait.as_millis();
                let max_ms = max.as_millis().max(base_ms);
                let delay_ms = base_ms
                    .saturating_mul(multiplier)
                    .min(max_ms)
                    .min(u64::MAX as u128) as u64;
                Duration::from_millis(delay_ms)
            }
        };
        self.apply_jitter(wait)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }

        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms == 0 {
            return backoff;
        }
        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round() as u64;
        let high = backoff_ms.saturating_add(jitter_span);
        let sampled_ms = rand::rng().random_range(backoff_ms..=high);
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    std::iter::once(429_u16).chain(500..=599).collect()
}

fn default_retryable_transport_error_kinds() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::Dns,
        TransportErrorKind::Connect,
        TransportErrorKind::Read,
        TransportErrorKind::Timeout,
    ]
    .into_iter()
    .collect()
}
