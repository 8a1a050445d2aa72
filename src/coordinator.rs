use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::{DedupOptions, PendingWaitPolicy};
use crate::eligibility::EligibilityDetector;
use crate::error::{AppError, Result};
use crate::fingerprint::ContentFingerprint;
use crate::key_extractor::KeyExtractor;
use crate::observability::{get_metrics, mask_key, LatencyTimer};
use crate::request::RequestContext;
use crate::store::{CapturedResponse, ClaimOutcome, RecordStatus, RecordStore};

/// In-process counters for deduplication handling.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    pub total_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub claimed_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub conflict_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_operations: AtomicU64,
    pub store_failures: AtomicU64,
}

impl DedupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim(&self) {
        self.claimed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflict_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        let replays = self.replayed_requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            replays as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            claimed_requests: self.claimed_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            conflict_requests: self.conflict_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub claimed_requests: u64,
    pub replayed_requests: u64,
    pub conflict_requests: u64,
    pub completed_requests: u64,
    pub failed_operations: u64,
    pub store_failures: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Frees a Pending record when the in-flight operation future is dropped
/// before commit or abandon ran (caller cancellation). TTL expiry remains
/// the safety net when no runtime survives to run this.
struct ClaimGuard {
    store: Arc<dyn RecordStore>,
    key: String,
    armed: bool,
}

impl ClaimGuard {
    fn new(store: Arc<dyn RecordStore>, key: String) -> Self {
        Self {
            store,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&self.store);
            let key = std::mem::take(&mut self.key);
            handle.spawn(async move {
                if let Err(e) = store.abandon(&key).await {
                    warn!(key = %mask_key(&key), error = %e, "failed to abandon claim for cancelled request");
                }
            });
        }
    }
}

enum WaitOutcome {
    Completed,
    Vanished,
    TimedOut,
}

/// Orchestrates at-most-once execution around an operation invocation.
///
/// Per request: classify eligibility, extract the key, fingerprint the
/// content, claim the key atomically, then execute-and-commit or replay.
/// The Pending record is the mutual-exclusion token; no lock is held
/// across the operation itself.
pub struct DeduplicationCoordinator {
    store: Arc<dyn RecordStore>,
    detector: EligibilityDetector,
    extractor: KeyExtractor,
    options: DedupOptions,
    metrics: Arc<DedupMetrics>,
}

// A claim retry only happens when the observed record vanished between two
// store calls; a handful of rounds is plenty before giving up.
const MAX_CLAIM_ATTEMPTS: usize = 8;

impl DeduplicationCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        detector: EligibilityDetector,
        options: DedupOptions,
    ) -> Self {
        let extractor = KeyExtractor::from_header(options.key_header.clone());
        Self {
            store,
            detector,
            extractor,
            options,
            metrics: Arc::new(DedupMetrics::new()),
        }
    }

    /// Replaces the header-based extractor, e.g. with a body-field source.
    pub fn with_extractor(mut self, extractor: KeyExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn metrics(&self) -> Arc<DedupMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The background sweeper for this coordinator's store, if a cleanup
    /// interval is configured.
    pub fn cleanup_job(&self) -> Option<CleanupJob> {
        self.options
            .cleanup_interval
            .map(|interval| CleanupJob::new(Arc::clone(&self.store), interval))
    }

    /// Runs `operation` with at-most-once semantics. The main entry point.
    pub async fn execute<F, Fut>(
        &self,
        request: &RequestContext,
        operation: F,
    ) -> Result<CapturedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedResponse>>,
    {
        self.metrics.record_request();

        let Some(eligibility) = self.detector.classify(&request.identity()) else {
            self.metrics.record_bypass();
            return operation().await;
        };

        let Some(key) = self.extractor.extract(request) else {
            if self.options.require_key {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "deduplicated request arrived without an idempotency key"
                );
                get_metrics().record_missing_key();
                return Err(AppError::MissingKey(self.extractor.location().to_string()));
            }
            self.metrics.record_bypass();
            return operation().await;
        };

        let fingerprint =
            ContentFingerprint::compute(request, self.options.strict_content_validation);

        let deadline = match self.options.pending_wait {
            PendingWaitPolicy::FailFast => None,
            PendingWaitPolicy::Wait { timeout, .. } => Some(Instant::now() + timeout),
        };

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let timer = LatencyTimer::new();
            let claim = self
                .store
                .try_create(&key, &fingerprint, eligibility.ttl_seconds)
                .await;
            get_metrics().record_store_op("try_create", timer.elapsed_ms(), claim.is_ok());

            let outcome = match claim {
                Ok(outcome) => outcome,
                Err(e) if e.is_store_unavailable() && self.options.fail_open => {
                    self.metrics.record_store_failure();
                    warn!(
                        key = %mask_key(&key),
                        error = %e,
                        "record store unavailable; executing without at-most-once guarantee"
                    );
                    return operation().await;
                }
                Err(e) => {
                    self.metrics.record_store_failure();
                    error!(key = %mask_key(&key), error = %e, "record store claim failed");
                    return Err(e);
                }
            };

            match outcome {
                ClaimOutcome::Created => {
                    self.metrics.record_claim();
                    get_metrics().record_claim();
                    debug!(key = %mask_key(&key), "claimed idempotency key");
                    return self.run_claimed(&key, operation).await;
                }
                ClaimOutcome::AlreadyCompleted { fingerprint: stored } => {
                    self.check_fingerprint(&key, &fingerprint, &stored)?;
                    if let Some(response) = self.store.get_completed(&key).await? {
                        self.metrics.record_replay();
                        get_metrics().record_replay();
                        debug!(key = %mask_key(&key), status = response.status, "replaying stored response");
                        return Ok(response);
                    }
                    // Expired between claim and fetch; claim fresh.
                }
                ClaimOutcome::AlreadyPending { fingerprint: stored } => {
                    self.check_fingerprint(&key, &fingerprint, &stored)?;

                    let PendingWaitPolicy::Wait { poll_interval, .. } = self.options.pending_wait
                    else {
                        return Err(self.in_flight(&key));
                    };

                    let deadline = deadline.unwrap_or_else(Instant::now);
                    match self.wait_for_completion(&key, deadline, poll_interval).await? {
                        WaitOutcome::Completed => {
                            if let Some(response) = self.store.get_completed(&key).await? {
                                self.metrics.record_replay();
                                get_metrics().record_replay();
                                return Ok(response);
                            }
                        }
                        WaitOutcome::Vanished => {}
                        WaitOutcome::TimedOut => return Err(self.in_flight(&key)),
                    }
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(self.in_flight(&key));
                }
            }
        }

        Err(self.in_flight(&key))
    }

    async fn run_claimed<F, Fut>(&self, key: &str, operation: F) -> Result<CapturedResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CapturedResponse>>,
    {
        let mut guard = ClaimGuard::new(Arc::clone(&self.store), key.to_string());
        let result = operation().await;
        guard.disarm();

        match result {
            Ok(response) => {
                if let Err(e) = self.store.commit(key, &response).await {
                    // The operation ran; leaving the record Pending until
                    // expiry keeps duplicates from executing a second time.
                    error!(key = %mask_key(key), error = %e, "failed to commit captured response");
                }
                self.metrics.record_completed();
                get_metrics().record_completed();
                Ok(response)
            }
            Err(e) => {
                if let Err(abandon_err) = self.store.abandon(key).await {
                    error!(
                        key = %mask_key(key),
                        error = %abandon_err,
                        "failed to abandon claim after operation failure"
                    );
                }
                self.metrics.record_failed();
                get_metrics().record_operation_failure();
                Err(e)
            }
        }
    }

    async fn wait_for_completion(
        &self,
        key: &str,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<WaitOutcome> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;

            match self.store.get_status(key).await? {
                Some(RecordStatus::Pending) => continue,
                Some(RecordStatus::Completed) => return Ok(WaitOutcome::Completed),
                Some(RecordStatus::Expired) | None => return Ok(WaitOutcome::Vanished),
            }
        }
    }

    fn check_fingerprint(
        &self,
        key: &str,
        ours: &ContentFingerprint,
        stored: &ContentFingerprint,
    ) -> Result<()> {
        if self.options.strict_content_validation && ours != stored {
            warn!(key = %mask_key(key), "idempotency key replayed with different content");
            self.metrics.record_conflict();
            get_metrics().record_conflict("payload");
            return Err(AppError::PayloadConflict);
        }
        Ok(())
    }

    fn in_flight(&self, key: &str) -> AppError {
        debug!(key = %mask_key(key), "duplicate request still in flight");
        self.metrics.record_conflict();
        get_metrics().record_conflict("in_flight");
        AppError::InFlight {
            retry_after_secs: self.options.pending_wait.retry_after_secs(),
        }
    }
}

/// Background sweep of expired records.
pub struct CleanupJob {
    store: Arc<dyn RecordStore>,
    interval: Duration,
}

impl CleanupJob {
    pub fn new(store: Arc<dyn RecordStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub async fn run_once(&self) -> Result<u64> {
        let swept = self.store.sweep_expired().await?;
        get_metrics().record_sweep(swept);
        Ok(swept)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(swept) => {
                        if swept > 0 {
                            tracing::info!("swept {} expired deduplication records", swept);
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to sweep expired deduplication records: {}", e);
                    }
                }
            }
        })
    }
}
