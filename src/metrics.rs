use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub requests_started: u64,
    pub attempts: u64,
    pub retries: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub cancellations: u64,
    pub transport_errors: u64,
    pub http_status_errors: u64,
    pub dry_run_skips: u64,
    pub in_flight: u64,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ClientMetrics {
    inner: Arc<ClientMetricsInner>,
}

#[derive(Debug, Default)]
struct ClientMetricsInner {
    requests_started: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    cancellations: AtomicU64,
    transport_errors: AtomicU64,
    http_status_errors: AtomicU64,
    dry_run_skips: AtomicU64,
    in_flight: AtomicU64,
}

pub(crate) struct InFlightGuard {
    metrics: ClientMetrics,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ClientMetrics {
    pub(crate) fn record_request_started(&self) -> InFlightGuard {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dry_run_skip(&self) {
        self.inner.dry_run_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome<T>(&self, result: &Result<T, Error>) {
        let Err(error) = result else {
            self.inner
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error.last_error() {
            Error::Cancelled { .. } => {
                self.inner.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Error::Transport { .. } | Error::Timeout { .. } => {
                self.inner.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
            Error::HttpStatus { .. } => {
                self.inner
                    .http_status_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub(crate) fn snapshot(&self) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            cancellations: self.inner.cancellations.load(Ordering::Relaxed),
            transport_errors: self.inner.transport_errors.load(Ordering::Relaxed),
            http_status_errors: self.inner.http_status_errors.load(Ordering::Relaxed),
            dry_run_skips: self.inner.dry_run_skips.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
        }
    }
}
