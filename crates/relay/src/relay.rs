//! Message relay
//!
//! Background service that polls the outbox for committed rows, leases them,
//! publishes them to the broker and records the outcome.
//!
//! ```text
//!   worker 0 ─┐                           ┌─► Published
//!   worker 1 ─┼─ get_pending ─► try_lease ─┼─► Pending (retry at next_retry_at)
//!   worker N ─┘   (partition)    (CAS)     └─► Dead
//!
//!   reaper ──── reclaim_expired_leases ──► Pending
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use outbox_store::{
    AggregateId, FailureOutcome, MessageId, OutboxMessage, OutboxStatus, Partition, StoreError,
    TransactionalStore,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerEnvelope, MessageBroker};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::reaper::LeaseReaper;
use crate::stats::{OutboxStats, RelayStats};

/// How `process` resolved a leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Published,
    /// Back to pending until `next_retry_at`.
    Retried { next_retry_at: DateTime<Utc> },
    DeadLettered,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Eligible rows returned by the store.
    pub fetched: usize,
    /// Rows this cycle won the lease for.
    pub leased: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Rows not attempted: leased elsewhere, behind a failed message of the
    /// same aggregate, or left for after shutdown.
    pub skipped: usize,
    /// Leases that were reclaimed while the publish was in flight.
    pub lost: usize,
    /// Store errors on individual rows.
    pub errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.fetched == 0
    }
}

struct Shared<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    broker: Arc<B>,
    config: RelayConfig,
    stats: Arc<RelayStats>,
    in_flight: Mutex<HashSet<MessageId>>,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Polls the outbox and publishes to a broker.
///
/// The relay keeps no delivery state of its own: everything lives in the
/// store, so a restarted relay simply picks up where the last one stopped.
pub struct MessageRelay<S: ?Sized, B: ?Sized> {
    shared: Arc<Shared<S, B>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl<S, B> MessageRelay<S, B>
where
    S: TransactionalStore + ?Sized + 'static,
    B: MessageBroker + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, broker: Arc<B>, config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                broker,
                config,
                stats: Arc::new(RelayStats::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawns one worker loop per partition plus the lease reaper.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let mut handles = Vec::new();
        for partition in Partition::all(self.shared.config.workers) {
            let shared = Arc::clone(&self.shared);
            let token = token.child_token();
            handles.push(tokio::spawn(async move {
                shared.run_worker(partition, token).await;
            }));
        }

        let reaper = LeaseReaper::new(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.stats),
            self.shared.config.batch_size,
        );
        handles.push(tokio::spawn(
            reaper.run(self.shared.config.reaper_interval, token.child_token()),
        ));

        tracing::info!(
            workers = self.shared.config.workers,
            batch_size = self.shared.config.batch_size,
            retry = %self.shared.config.retry,
            "message relay started"
        );
        *running = Some(Running { token, handles });
        Ok(())
    }

    /// Stops polling and waits for in-flight publishes.
    ///
    /// Workers finish the message they are on and lease nothing new. If they
    /// are still busy after the shutdown timeout they are aborted and their
    /// leases released, and `ShutdownTimeout` is returned.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Err(RelayError::NotRunning);
        };

        running.token.cancel();
        let joined = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            join_all(running.handles.iter_mut()),
        )
        .await;

        if joined.is_ok() {
            tracing::info!("message relay stopped");
            return Ok(());
        }

        for handle in &running.handles {
            handle.abort();
        }
        let in_flight: Vec<_> = self.shared.in_flight().drain().collect();
        let mut released = 0;
        for id in in_flight {
            match self.shared.store.release_lease(id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(message_id = %id, error = %e, "failed to release lease on shutdown")
                }
            }
        }
        tracing::warn!(released, "message relay shutdown timed out");
        Err(RelayError::ShutdownTimeout { released })
    }

    /// Runs one poll cycle over the whole outbox.
    pub async fn tick(&self) -> Result<TickReport> {
        self.shared.tick(Partition::single(), None).await
    }

    /// Runs one poll cycle over the aggregates owned by `partition`.
    pub async fn tick_partition(&self, partition: Partition) -> Result<TickReport> {
        self.shared.tick(partition, None).await
    }

    /// Publishes a message this relay has already leased and records the outcome.
    ///
    /// A row that is not `processing` with a live lease is refused before the
    /// broker sees it.
    pub async fn process(&self, message: OutboxMessage) -> Result<ProcessOutcome> {
        self.shared.process(message).await
    }

    /// Runs one reaper pass.
    pub async fn reap_expired_leases(&self) -> Result<Vec<MessageId>> {
        LeaseReaper::new(
            Arc::clone(&self.shared.store),
            Arc::clone(&self.shared.stats),
            self.shared.config.batch_size,
        )
        .reap()
        .await
    }

    /// Relay counters plus the current outbox breakdown.
    pub async fn get_stats(&self) -> Result<OutboxStats> {
        let rows = self.shared.store.status_counts().await?;
        let stats = OutboxStats {
            relay: self.shared.stats.snapshot(),
            rows,
        };
        stats.export_gauges();
        Ok(stats)
    }
}

impl<S, B> Shared<S, B>
where
    S: TransactionalStore + ?Sized + 'static,
    B: MessageBroker + ?Sized + 'static,
{
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<MessageId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_worker(&self, partition: Partition, token: CancellationToken) {
        tracing::info!(%partition, "relay worker started");
        loop {
            if token.is_cancelled() {
                break;
            }

            let full_batch = match self.tick(partition, Some(&token)).await {
                Ok(report) => {
                    if !report.is_idle() {
                        tracing::debug!(%partition, ?report, "relay tick");
                    }
                    report.fetched >= self.config.batch_size && report.leased > 0
                }
                Err(e) => {
                    tracing::error!(%partition, error = %e, "relay tick failed");
                    false
                }
            };

            if full_batch {
                continue;
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.polling_interval) => {}
            }
        }
        tracing::info!(%partition, "relay worker stopped");
    }

    async fn tick(
        &self,
        partition: Partition,
        token: Option<&CancellationToken>,
    ) -> Result<TickReport> {
        let rows = self
            .store
            .get_pending_outbox_for_partition(self.config.batch_size, partition)
            .await?;

        let mut report = TickReport {
            fetched: rows.len(),
            ..Default::default()
        };
        let mut blocked: HashSet<AggregateId> = HashSet::new();

        for row in rows {
            if token.is_some_and(CancellationToken::is_cancelled)
                || blocked.contains(&row.aggregate_id())
            {
                report.skipped += 1;
                continue;
            }

            let aggregate_id = row.aggregate_id();
            let leased = match self
                .store
                .try_lease(row.id(), self.config.lease_timeout)
                .await
            {
                Ok(Some(leased)) => leased,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    tracing::error!(message_id = %row.id(), error = %e, "lease attempt failed");
                    report.errors += 1;
                    blocked.insert(aggregate_id);
                    continue;
                }
            };
            report.leased += 1;

            let id = leased.id();
            self.in_flight().insert(id);
            let outcome = self.process(leased).await;
            self.in_flight().remove(&id);

            match outcome {
                Ok(ProcessOutcome::Published) => report.published += 1,
                Ok(ProcessOutcome::Retried { .. }) => {
                    report.retried += 1;
                    blocked.insert(aggregate_id);
                }
                Ok(ProcessOutcome::DeadLettered) => report.dead_lettered += 1,
                Err(RelayError::LeaseLost(_)) => {
                    report.lost += 1;
                    blocked.insert(aggregate_id);
                }
                Err(e) => {
                    tracing::error!(message_id = %id, error = %e, "failed to record publish outcome");
                    report.errors += 1;
                    blocked.insert(aggregate_id);
                }
            }
        }

        Ok(report)
    }

    #[tracing::instrument(
        skip(self, message),
        fields(
            message_id = %message.id(),
            event_type = %message.event_type(),
            retry_count = message.retry_count()
        )
    )]
    async fn process(&self, mut message: OutboxMessage) -> Result<ProcessOutcome> {
        self.check_leased(&message)?;
        self.stats.record_processed();

        let envelope = BrokerEnvelope::from(&message);
        let started = Instant::now();
        let published = self.broker.publish(&envelope).await;
        metrics::histogram!("outbox_publish_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let now = self.store.now();
        match published {
            Ok(()) => {
                message.mark_as_published(now)?;
                self.persist(&message).await?;
                self.stats.record_published(message.event_type());
                tracing::debug!("message published");
                Ok(ProcessOutcome::Published)
            }
            Err(err) if err.is_permanent() => {
                message.mark_as_dead_lettered(err.to_string())?;
                self.persist(&message).await?;
                self.stats.record_dead_lettered(message.event_type());
                tracing::error!(error = %err, "message rejected permanently, dead-lettered");
                Ok(ProcessOutcome::DeadLettered)
            }
            Err(err) => match message.mark_as_failed(err.to_string(), &self.config.retry, now)? {
                FailureOutcome::Retry { next_retry_at } => {
                    self.persist(&message).await?;
                    self.stats.record_failed_transient(message.event_type());
                    tracing::warn!(
                        error = %err,
                        attempt = message.retry_count(),
                        max_retries = message.max_retries(),
                        %next_retry_at,
                        "publish failed, retry scheduled"
                    );
                    Ok(ProcessOutcome::Retried { next_retry_at })
                }
                FailureOutcome::Dead => {
                    self.persist(&message).await?;
                    self.stats.record_dead_lettered(message.event_type());
                    let exhausted = RelayError::MaxRetriesExceeded {
                        id: message.id(),
                        retry_count: message.retry_count(),
                    };
                    tracing::error!(error = %err, "{exhausted}");
                    Ok(ProcessOutcome::DeadLettered)
                }
            },
        }
    }

    /// Only a row still holding an unexpired lease may reach the broker.
    fn check_leased(&self, message: &OutboxMessage) -> Result<()> {
        if message.status() != OutboxStatus::Processing {
            return Err(RelayError::NotLeased {
                id: message.id(),
                status: message.status(),
            });
        }
        let now = self.store.now();
        match message.lease_expires_at() {
            Some(expiry) if expiry > now => Ok(()),
            Some(_) => {
                self.stats.record_lease_lost();
                tracing::warn!("lease expired before publish");
                Err(RelayError::LeaseLost(message.id()))
            }
            None => Err(RelayError::NotLeased {
                id: message.id(),
                status: message.status(),
            }),
        }
    }

    async fn persist(&self, message: &OutboxMessage) -> Result<OutboxMessage> {
        match self
            .store
            .update_outbox_status(message.id(), message.to_update())
            .await
        {
            Ok(stored) => Ok(stored),
            Err(e) if e.is_lease_lost() => {
                self.stats.record_lease_lost();
                tracing::warn!(error = %e, "lease lost before outcome was recorded");
                Err(RelayError::LeaseLost(message.id()))
            }
            Err(e @ StoreError::MessageNotFound(_)) => {
                tracing::warn!(error = %e, "message vanished while leased");
                Err(RelayError::Store(e))
            }
            Err(e) => Err(RelayError::Store(e)),
        }
    }
}
