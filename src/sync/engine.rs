//! Sync scheduler and executor
//!
//! The engine is the only component that dispatches operations to the
//! network. One drain cycle runs at a time; inside a cycle operations are
//! taken from the log in priority order and dispatched in bounded batches.
//!
//! Drain algorithm:
//! 1. Re-check connectivity; return [`DrainOutcome::Offline`] if unusable.
//! 2. Query pending operations, sort by priority then `local_timestamp`.
//! 3. Take the next `batch_size` not yet attempted in this cycle and dispatch
//!    them concurrently, waiting for every outcome.
//! 4. Persist each outcome (success removes, failure bumps the retry count,
//!    conflicts go through the resolver) and repeat from 2, so operations
//!    enqueued mid-drain join the next batch.
//! 5. Recompute and persist the state snapshot; schedule a backoff re-drain
//!    if any operation failed below the retry ceiling.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::backoff::BackoffPolicy;
use super::clock::{Clock, SystemClock};
use super::conflict::{ConflictResolver, ConflictStrategy, Resolution};
use super::events::SyncEvent;
use super::executor::{EntityExecutor, ExecutionOutcome, ExecutorRegistry};
use super::network::NetworkMonitor;
use crate::error::{Result, SyncError};
use crate::storage::{OperationLog, Storage, SyncStateStore};
use crate::types::{
    EngineConfig, LogCounts, OperationId, OperationType, Priority, SyncOperation, SyncState,
};

/// Sort operations into dispatch order: `critical > high > normal > low`,
/// oldest first within a tier. The sort is stable, so equal timestamps keep
/// log order.
pub fn sort_for_dispatch(ops: &mut [SyncOperation]) {
    ops.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.local_timestamp.cmp(&b.local_timestamp))
    });
}

/// Summary of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Operation ids in dispatch order
    pub dispatched: Vec<OperationId>,
    pub succeeded: usize,
    /// Failures still below the retry ceiling
    pub failed: usize,
    /// Failures that reached the retry ceiling
    pub exhausted: usize,
    pub conflicts_resolved: usize,
    pub conflicts_parked: usize,
    /// Operations without a registered executor
    pub skipped: usize,
    pub batches: usize,
    /// Delay of the backoff re-drain scheduled by this cycle
    pub retry_in: Option<Duration>,
}

/// Result of a drain request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Connectivity was unusable; nothing was dispatched
    Offline,
    /// Another drain cycle is active; this request was a no-op
    AlreadyRunning,
    Completed(DrainReport),
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Clears the single-flight flag when a drain ends, however it ends
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Releases a batch's in-flight claims when the batch ends, including when
/// the drain future is dropped mid-dispatch
struct InFlightBatch<'a> {
    set: &'a DashSet<OperationId>,
    ids: Vec<OperationId>,
}

impl<'a> InFlightBatch<'a> {
    fn new(set: &'a DashSet<OperationId>) -> Self {
        Self {
            set,
            ids: Vec::new(),
        }
    }

    fn claim(&mut self, id: OperationId) {
        self.set.insert(id.clone());
        self.ids.push(id);
    }
}

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.set.remove(id);
        }
    }
}

/// Holds `is_running` for the span of a drain. Dropped without `finish`,
/// the drain was cancelled and the state is put back to idle.
struct RunningState<'a> {
    engine: &'a SyncEngine,
    finished: bool,
}

impl<'a> RunningState<'a> {
    fn start(engine: &'a SyncEngine) -> Self {
        engine.inner.state.mark_running();
        Self {
            engine,
            finished: false,
        }
    }

    fn finish(
        mut self,
        counts: Option<LogCounts>,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) {
        self.finished = true;
        self.engine
            .inner
            .state
            .mark_finished(counts, completed_at, error);
    }
}

impl Drop for RunningState<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!("drain cancelled before completion");
        let inner = &self.engine.inner;
        inner.state.mark_interrupted(inner.log.counts().ok());
    }
}

struct EngineInner {
    config: EngineConfig,
    log: OperationLog,
    state: SyncStateStore,
    network: Arc<NetworkMonitor>,
    executors: ExecutorRegistry,
    resolver: RwLock<ConflictResolver>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    draining: AtomicBool,
    in_flight: DashSet<OperationId>,
    /// Held while picking a batch and while mutating rows from outside the
    /// scheduler, so a row is never rewritten while it is being dispatched.
    dispatch_gate: Mutex<()>,
    next_retry: Mutex<Option<Instant>>,
    events: broadcast::Sender<SyncEvent>,
}

/// Offline-first sync engine
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine over an opened storage
    pub fn new(storage: Storage, config: EngineConfig, network: Arc<NetworkMonitor>) -> Result<Self> {
        Self::with_clock(storage, config, network, Arc::new(SystemClock))
    }

    /// Create an engine with an injected clock
    pub fn with_clock(
        storage: Storage,
        config: EngineConfig,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let log = OperationLog::with_clock(storage.clone(), config.max_retries, clock.clone());
        let state = SyncStateStore::load(storage);
        let (events, _) = broadcast::channel(256);

        let inner = EngineInner {
            resolver: RwLock::new(ConflictResolver::new(config.conflict_strategy)),
            backoff: BackoffPolicy::from_config(&config),
            config,
            log,
            state,
            network,
            executors: ExecutorRegistry::new(),
            clock,
            draining: AtomicBool::new(false),
            in_flight: DashSet::new(),
            dispatch_gate: Mutex::new(()),
            next_retry: Mutex::new(None),
            events,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Route operations for `entity` to `executor`
    pub fn register_executor(&self, entity: impl Into<String>, executor: Arc<dyn EntityExecutor>) {
        self.inner.executors.register(entity, executor);
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.inner.executors
    }

    /// Replace the default field merge for one entity type
    pub fn set_custom_merge<F>(&self, entity: impl Into<String>, merge: F)
    where
        F: Fn(&Value, &Value, DateTime<Utc>) -> Value + Send + Sync + 'static,
    {
        self.inner.resolver.write().set_custom_merge(entity, merge);
    }

    /// Override the conflict strategy for one entity type
    pub fn set_entity_strategy(&self, entity: impl Into<String>, strategy: ConflictStrategy) {
        self.inner
            .resolver
            .write()
            .set_entity_strategy(entity, strategy);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.inner.network
    }

    pub fn log(&self) -> &OperationLog {
        &self.inner.log
    }

    // ------------------------------------------------------------------
    // Enqueue API
    // ------------------------------------------------------------------

    /// Persist a mutation for later replay. Never blocks on the network; when
    /// online (and `drain_on_enqueue` is set) a drain is started in the
    /// background. Store errors are returned to the caller.
    pub fn queue(
        &self,
        op_type: OperationType,
        entity: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<OperationId> {
        let id = self.inner.log.enqueue(op_type, entity, &payload, priority)?;
        self.refresh_counts();

        if self.inner.config.drain_on_enqueue && self.inner.network.is_usable() {
            self.spawn_drain();
        }
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Status API
    // ------------------------------------------------------------------

    pub fn get_state(&self) -> SyncState {
        self.inner.state.get()
    }

    /// Pending operations in log order
    pub fn get_pending(&self) -> Result<Vec<SyncOperation>> {
        self.inner.log.list_pending()
    }

    /// Operations at the retry ceiling
    pub fn get_failed(&self) -> Result<Vec<SyncOperation>> {
        self.inner.log.list_failed()
    }

    /// Operations parked on a manual conflict
    pub fn get_conflicts(&self) -> Result<Vec<SyncOperation>> {
        self.inner.log.list_conflicts()
    }

    pub fn get_operation(&self, id: &str) -> Result<Option<SyncOperation>> {
        self.inner.log.get(id)
    }

    /// State snapshots, one per change
    pub fn subscribe(&self) -> broadcast::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    /// Invoke `callback` on every state change until the engine is dropped
    pub fn subscribe_with<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(SyncState) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(state) => callback(state),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "state subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Per-operation and per-drain events
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Number of operations currently dispatched
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    // ------------------------------------------------------------------
    // Force / retry API
    // ------------------------------------------------------------------

    /// Drain now, regardless of the periodic schedule
    pub async fn force_sync(&self) -> Result<DrainOutcome> {
        tracing::info!("forced sync requested");
        self.drain().await
    }

    /// Reset every operation at the retry ceiling to `retry_count = 0` and
    /// attempt a drain. Returns how many operations were reset.
    pub async fn retry_failed_operations(&self) -> Result<usize> {
        let reset = {
            let _gate = self.inner.dispatch_gate.lock();
            self.inner.log.reset_failed()?
        };
        tracing::info!(reset, "reset failed operations");
        self.refresh_counts();
        self.drain().await?;
        Ok(reset)
    }

    /// Reset one operation's retry count and attempt a drain
    pub async fn retry_operation(&self, id: &str) -> Result<()> {
        self.mutate_idle(id, |log| log.reset_operation(id))?;
        self.drain().await?;
        Ok(())
    }

    /// Manual conflict resolution: `payload` replaces the parked operation's
    /// payload and the operation is re-dispatched with a fresh retry budget.
    pub async fn resolve_conflict(&self, id: &str, payload: Value) -> Result<()> {
        self.mutate_idle(id, |log| log.resolve_conflict(id, &payload))?;
        tracing::info!(op_id = %id, "conflict resolved manually");
        self.drain().await?;
        Ok(())
    }

    /// Fix up an operation's payload and give it a fresh retry budget
    pub async fn update_payload(&self, id: &str, payload: Value) -> Result<()> {
        self.mutate_idle(id, |log| log.update_payload(id, &payload))?;
        self.drain().await?;
        Ok(())
    }

    /// Remove an operation at the caller's request
    pub fn discard_operation(&self, id: &str) -> Result<bool> {
        self.mutate_idle(id, |log| log.discard(id))
    }

    /// Run a log mutation unless the operation is being dispatched
    fn mutate_idle<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&OperationLog) -> Result<T>,
    {
        let result = {
            let _gate = self.inner.dispatch_gate.lock();
            if self.inner.in_flight.contains(id) {
                return Err(SyncError::InFlight(id.to_string()));
            }
            f(&self.inner.log)?
        };
        self.refresh_counts();
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// The single drain entry point. Reconnect events, periodic wakes,
    /// enqueue and the force/retry APIs all come through here.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let inner = &self.inner;

        let Some(_guard) = DrainGuard::acquire(&inner.draining) else {
            tracing::debug!("drain already running");
            self.emit(SyncEvent::drain_skipped(self.now(), "already_running"));
            return Ok(DrainOutcome::AlreadyRunning);
        };

        if !inner.network.check_now().await.status.is_usable() {
            tracing::debug!("offline, drain skipped");
            self.emit(SyncEvent::drain_skipped(self.now(), "offline"));
            return Ok(DrainOutcome::Offline);
        }

        let running = RunningState::start(self);

        match self.run_cycle().await {
            Ok(mut report) => {
                let counts = match inner.log.counts() {
                    Ok(counts) => counts,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to count operations after drain");
                        running.finish(None, None, Some(e.to_string()));
                        return Err(e);
                    }
                };
                running.finish(Some(counts), Some(self.now()), None);

                if let Some(delay) = report.retry_in {
                    if inner.config.auto_retry {
                        self.schedule_retry(delay);
                    } else {
                        report.retry_in = None;
                    }
                }

                tracing::info!(
                    dispatched = report.dispatched.len(),
                    succeeded = report.succeeded,
                    failed = report.failed,
                    exhausted = report.exhausted,
                    conflicts_resolved = report.conflicts_resolved,
                    conflicts_parked = report.conflicts_parked,
                    pending = counts.pending,
                    "drain completed"
                );
                self.emit(SyncEvent::drain_completed(
                    self.now(),
                    report.dispatched.len(),
                    report.succeeded,
                ));
                Ok(DrainOutcome::Completed(report))
            }
            Err(e) => {
                tracing::error!(error = %e, "drain failed");
                let counts = inner.log.counts().ok();
                running.finish(counts, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_cycle(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        let mut report = DrainReport::default();
        let mut attempted: HashSet<OperationId> = HashSet::new();

        let pending_at_start = inner.log.counts()?.pending;
        tracing::info!(pending = pending_at_start, "drain started");
        self.emit(SyncEvent::drain_started(self.now(), pending_at_start as usize));

        loop {
            let (batch, _claims) = {
                let _gate = inner.dispatch_gate.lock();
                let mut candidates: Vec<SyncOperation> = inner
                    .log
                    .list_pending()?
                    .into_iter()
                    .filter(|op| !attempted.contains(&op.id) && !inner.in_flight.contains(&op.id))
                    .collect();
                if candidates.is_empty() {
                    break;
                }
                sort_for_dispatch(&mut candidates);
                candidates.truncate(inner.config.batch_size);

                let mut claims = InFlightBatch::new(&inner.in_flight);
                let mut batch = Vec::with_capacity(candidates.len());
                for op in candidates {
                    attempted.insert(op.id.clone());
                    match inner.executors.get(&op.entity) {
                        Some(executor) => {
                            claims.claim(op.id.clone());
                            report.dispatched.push(op.id.clone());
                            batch.push((op, executor));
                        }
                        None => {
                            tracing::warn!(op_id = %op.id, entity = %op.entity, "no executor registered, skipping");
                            report.skipped += 1;
                            self.emit(SyncEvent::executor_missing(self.now(), &op.id, &op.entity));
                        }
                    }
                }
                (batch, claims)
            };

            if batch.is_empty() {
                continue;
            }
            report.batches += 1;

            let outcomes = dispatch_batch(batch).await;
            for (op, outcome) in outcomes {
                self.apply_outcome(&op, outcome, &mut report)?;
            }
        }

        Ok(report)
    }

    fn apply_outcome(
        &self,
        op: &SyncOperation,
        outcome: ExecutionOutcome,
        report: &mut DrainReport,
    ) -> Result<()> {
        let inner = &self.inner;
        match outcome {
            ExecutionOutcome::Success => {
                inner.log.mark_succeeded(&op.id)?;
                report.succeeded += 1;
                tracing::debug!(op_id = %op.id, entity = %op.entity, "operation synced");
                self.emit(SyncEvent::operation_succeeded(self.now(), &op.id, &op.entity));
            }
            ExecutionOutcome::Failure { error } => {
                let retry_count = match inner.log.mark_failed(&op.id, &error) {
                    Ok(count) => count,
                    Err(SyncError::NotFound(_)) => {
                        tracing::warn!(op_id = %op.id, "failed operation no longer in log");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                if retry_count < inner.config.max_retries {
                    report.failed += 1;
                    let delay = inner.backoff.delay_for(retry_count);
                    report.retry_in = Some(report.retry_in.map_or(delay, |d| d.min(delay)));
                    tracing::warn!(
                        op_id = %op.id,
                        entity = %op.entity,
                        retry_count,
                        error = %error,
                        "operation failed, will retry"
                    );
                    self.emit(SyncEvent::operation_failed(
                        self.now(),
                        &op.id,
                        &op.entity,
                        retry_count,
                        &error,
                    ));
                } else {
                    report.exhausted += 1;
                    tracing::warn!(
                        op_id = %op.id,
                        entity = %op.entity,
                        retry_count,
                        error = %error,
                        "operation exhausted retries"
                    );
                    self.emit(SyncEvent::operation_exhausted(self.now(), &op.id, &op.entity));
                }
            }
            ExecutionOutcome::Conflict { server_snapshot } => {
                let resolution = inner.resolver.read().resolve_with_local_time(
                    &op.entity,
                    &op.payload,
                    Some(op.local_timestamp),
                    &server_snapshot,
                    self.now(),
                );
                match resolution {
                    Resolution::Resolved { strategy, record } => {
                        inner.log.replace_payload(&op.id, &record)?;
                        report.conflicts_resolved += 1;
                        // Re-dispatch on the next cycle
                        let delay = inner.backoff.base;
                        report.retry_in = Some(report.retry_in.map_or(delay, |d| d.min(delay)));
                        tracing::info!(op_id = %op.id, entity = %op.entity, strategy = %strategy, "conflict resolved");
                        self.emit(SyncEvent::conflict_resolved(
                            self.now(),
                            &op.id,
                            &op.entity,
                            strategy.as_str(),
                        ));
                    }
                    Resolution::Manual(_) => {
                        inner.log.mark_conflict(&op.id, &server_snapshot)?;
                        report.conflicts_parked += 1;
                        tracing::info!(op_id = %op.id, entity = %op.entity, "conflict parked for manual resolution");
                        self.emit(SyncEvent::conflict_parked(self.now(), &op.id, &op.entity));
                    }
                }
            }
        }
        Ok(())
    }

    /// Start a drain in the background if a runtime is available
    fn spawn_drain(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no async runtime, drain deferred");
            return;
        };
        let engine = self.clone();
        handle.spawn(async move {
            if let Err(e) = engine.drain().await {
                tracing::warn!(error = %e, "background drain failed");
            }
        });
    }

    /// Arrange a re-drain after `delay`. An earlier pending re-drain wins.
    fn schedule_retry(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut next = self.inner.next_retry.lock();
            if matches!(*next, Some(existing) if existing <= deadline) {
                return;
            }
            *next = Some(deadline);
        }

        tracing::debug!(delay_ms = delay.as_millis() as u64, "retry drain scheduled");
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut next = engine.inner.next_retry.lock();
                if *next == Some(deadline) {
                    *next = None;
                }
            }
            if let Err(e) = engine.drain().await {
                tracing::warn!(error = %e, "retry drain failed");
            }
        });
    }

    fn refresh_counts(&self) {
        match self.inner.log.counts() {
            Ok(counts) => {
                self.inner.state.refresh_counts(counts);
            }
            Err(e) => tracing::warn!(error = %e, "failed to refresh operation counts"),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }
}

/// Dispatch every operation of a batch concurrently and collect all outcomes.
/// Futures are polled in batch order, so dispatch order is the sorted order.
/// A panicking executor counts as a failure of its operation.
async fn dispatch_batch(
    batch: Vec<(SyncOperation, Arc<dyn EntityExecutor>)>,
) -> Vec<(SyncOperation, ExecutionOutcome)> {
    let calls = batch.into_iter().map(|(op, executor)| async move {
        tracing::debug!(op_id = %op.id, entity = %op.entity, retry_count = op.retry_count, "dispatching");
        let outcome = AssertUnwindSafe(executor.execute(&op))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(op_id = %op.id, entity = %op.entity, "executor panicked: {}", message);
                ExecutionOutcome::failure(format!("executor panicked: {}", message))
            });
        (op, outcome)
    });
    join_all(calls).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::executor::executor_fn;
    use crate::sync::network::ManualProbe;
    use chrono::TimeZone;
    use serde_json::json;

    fn op(id: &str, priority: Priority, millis: i64) -> SyncOperation {
        SyncOperation {
            id: id.into(),
            op_type: OperationType::Create,
            entity: "member".into(),
            payload: json!({}),
            local_timestamp: Utc.timestamp_millis_opt(millis).unwrap(),
            priority,
            retry_count: 0,
            last_error: None,
            conflict_data: None,
        }
    }

    fn engine(online: bool, config: EngineConfig) -> (SyncEngine, Arc<ManualProbe>) {
        let probe = Arc::new(if online {
            ManualProbe::online()
        } else {
            ManualProbe::offline()
        });
        let monitor = Arc::new(NetworkMonitor::new(probe.clone(), Duration::from_secs(5)));
        let engine = SyncEngine::new(Storage::open_in_memory().unwrap(), config, monitor).unwrap();
        (engine, probe)
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            drain_on_enqueue: false,
            auto_retry: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_sort_for_dispatch() {
        let mut ops = vec![
            op("low", Priority::Low, 1),
            op("normal-late", Priority::Normal, 9),
            op("critical", Priority::Critical, 5),
            op("normal-early", Priority::Normal, 2),
            op("high", Priority::High, 3),
        ];
        sort_for_dispatch(&mut ops);
        let ids: Vec<_> = ops.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["critical", "high", "normal-early", "normal-late", "low"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let probe = Arc::new(ManualProbe::online());
        let monitor = Arc::new(NetworkMonitor::new(probe, Duration::from_secs(5)));
        let config = EngineConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(matches!(
            SyncEngine::new(Storage::open_in_memory().unwrap(), config, monitor),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_success_removes_operation() {
        let (engine, _) = engine(true, quiet_config());
        engine.register_executor("member", executor_fn(|_| async { ExecutionOutcome::Success }));
        let id = engine
            .queue(OperationType::Create, "member", json!({"n": 1}), Priority::Normal)
            .unwrap();

        let outcome = engine.drain().await.unwrap();
        let report = outcome.report().unwrap();
        assert_eq!(report.dispatched, vec![id.clone()]);
        assert_eq!(report.succeeded, 1);
        assert!(engine.get_operation(&id).unwrap().is_none());

        let state = engine.get_state();
        assert_eq!(state.pending_count, 0);
        assert!(!state.is_running);
        assert!(state.last_sync_timestamp.is_some());
        assert_eq!(engine.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_entity_is_skipped() {
        let (engine, _) = engine(true, quiet_config());
        engine.register_executor("member", executor_fn(|_| async { ExecutionOutcome::Success }));
        let orphan = engine
            .queue(OperationType::Create, "unknown", json!({}), Priority::Critical)
            .unwrap();
        engine
            .queue(OperationType::Create, "member", json!({}), Priority::Low)
            .unwrap();

        let report = engine.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);

        let left = engine.get_operation(&orphan).unwrap().unwrap();
        assert_eq!(left.retry_count, 0);
    }

    #[tokio::test]
    async fn test_executor_panic_counts_as_failure() {
        let (engine, _) = engine(true, quiet_config());
        engine.register_executor(
            "member",
            executor_fn(|op| async move {
                if op.entity == "member" {
                    panic!("boom");
                }
                ExecutionOutcome::Success
            }),
        );
        let id = engine
            .queue(OperationType::Update, "member", json!({}), Priority::Normal)
            .unwrap();

        let report = engine.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.failed, 1);
        let op = engine.get_operation(&id).unwrap().unwrap();
        assert_eq!(op.retry_count, 1);
        assert!(op.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_failure_reports_backoff_delay() {
        let config = EngineConfig {
            drain_on_enqueue: false,
            auto_retry: true,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..Default::default()
        };
        let (engine, _) = engine(true, config);
        engine.register_executor(
            "member",
            executor_fn(|_| async { ExecutionOutcome::failure("503") }),
        );
        engine
            .queue(OperationType::Update, "member", json!({}), Priority::Normal)
            .unwrap();

        let report = engine.drain().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.retry_in, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_in_flight_operations_cannot_be_mutated() {
        let (engine, _) = engine(true, quiet_config());
        let gate = Arc::new(tokio::sync::Notify::new());
        let entered = Arc::new(tokio::sync::Notify::new());
        {
            let gate = gate.clone();
            let entered = entered.clone();
            engine.register_executor(
                "member",
                executor_fn(move |_| {
                    let gate = gate.clone();
                    let entered = entered.clone();
                    async move {
                        entered.notify_one();
                        gate.notified().await;
                        ExecutionOutcome::Success
                    }
                }),
            );
        }
        let id = engine
            .queue(OperationType::Update, "member", json!({}), Priority::Normal)
            .unwrap();

        let background = engine.clone();
        let drain = tokio::spawn(async move { background.drain().await });
        entered.notified().await;

        assert!(matches!(
            engine.discard_operation(&id),
            Err(SyncError::InFlight(_))
        ));

        gate.notify_one();
        drain.await.unwrap().unwrap();
        assert!(engine.get_operation(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let (engine, _) = engine(true, quiet_config());
        engine.register_executor("member", executor_fn(|_| async { ExecutionOutcome::Success }));
        let mut events = engine.events();
        engine
            .queue(OperationType::Create, "member", json!({}), Priority::Normal)
            .unwrap();
        engine.drain().await.unwrap();

        use crate::sync::events::SyncEventType;
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(
            seen,
            vec![
                SyncEventType::DrainStarted,
                SyncEventType::OperationSucceeded,
                SyncEventType::DrainCompleted,
            ]
        );
    }
}
