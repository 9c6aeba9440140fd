use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tendril_events::Bus;
use tendril_kernel::Kernel;
use tendril_topics as topics;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::config::DispatcherSettings;
use crate::counters;
use crate::deadline::DeadlineMonitor;
use crate::registry::Registry;
use crate::runner::{RunOutcome, Runner};

/// Polls the store for due strands and runs them on a bounded pool of
/// tokio tasks. Several dispatchers (in one or many processes) may share a
/// store; leases keep them from running the same strand twice.
pub struct Dispatcher {
    kernel: Kernel,
    runner: Arc<Runner>,
    bus: Bus,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    monitor: DeadlineMonitor,
}

impl Dispatcher {
    pub fn new(
        kernel: Kernel,
        registry: Arc<Registry>,
        bus: Bus,
        settings: DispatcherSettings,
    ) -> Self {
        let runner = Runner::new(kernel.clone(), registry, bus.clone())
            .with_lease(settings.lease)
            .with_run_budget(settings.run_budget());
        Self {
            monitor: DeadlineMonitor::new(kernel.clone(), bus.clone()),
            permits: Arc::new(Semaphore::new(settings.pool_size)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            runner: Arc::new(runner),
            kernel,
            bus,
            settings,
        }
    }

    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Due, lease-free strands not already running here, at most one per
    /// free pool slot.
    pub async fn scan(&self) -> Result<Vec<String>> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(Vec::new());
        }
        let skip: Vec<String> = self.in_flight.lock().await.iter().cloned().collect();
        self.kernel.due_strands_async(free, skip).await
    }

    /// Scans once and spawns a run for each strand found. Returns how many
    /// runs were started.
    pub async fn start_cohort(&self) -> Result<usize> {
        let ids = self.scan().await?;
        let mut started = 0;
        for id in ids {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            if !self.in_flight.lock().await.insert(id.clone()) {
                continue;
            }
            let runner = self.runner.clone();
            let in_flight = self.in_flight.clone();
            let bus = self.bus.clone();
            let timeout = self.settings.apoptosis_timeout();
            tokio::spawn(async move {
                let _permit = permit;
                match tokio::time::timeout(timeout, runner.run(&id)).await {
                    Ok(Ok(RunOutcome::Busy)) => {
                        debug!(strand = %id, "strand leased elsewhere");
                    }
                    Ok(Ok(outcome)) => {
                        debug!(strand = %id, outcome = ?outcome, "strand run finished");
                    }
                    Ok(Err(err)) => {
                        error!(strand = %id, error = %format!("{err:#}"), "strand run failed");
                    }
                    Err(_) => {
                        counters::apoptosis();
                        error!(
                            strand = %id,
                            timeout_secs = timeout.as_secs(),
                            "strand run exceeded apoptosis timeout; abandoning it"
                        );
                        bus.publish(
                            topics::TOPIC_DISPATCHER_APOPTOSIS,
                            Some(&id),
                            &json!({"timeout_secs": timeout.as_secs()}),
                        );
                    }
                }
                in_flight.lock().await.remove(&id);
            });
            started += 1;
        }
        Ok(started)
    }

    /// Dispatch loop; returns after `shutdown` resolves and in-flight runs
    /// have drained.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            pool_size = self.settings.pool_size,
            lease_secs = self.settings.lease.as_secs(),
            "dispatcher started"
        );
        self.bus.publish(
            topics::TOPIC_DISPATCHER_STARTED,
            None,
            &json!({"pool_size": self.settings.pool_size}),
        );
        let mut last_sweep: Option<Instant> = None;
        loop {
            if let Err(err) = self.start_cohort().await {
                error!(error = %format!("{err:#}"), "dispatcher scan failed");
            }
            if last_sweep.is_none_or(|t| t.elapsed() >= self.settings.deadline_sweep) {
                last_sweep = Some(Instant::now());
                self.housekeeping().await;
            }
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.settings.scan_interval) => {}
            }
        }
        info!("dispatcher stopping; draining in-flight runs");
        self.drain().await;
        self.bus
            .publish(topics::TOPIC_DISPATCHER_STOPPED, None, &json!({}));
        Ok(())
    }

    /// Waits until every spawned run has returned its pool slot.
    pub async fn drain(&self) {
        let slots = self.settings.pool_size as u32;
        match self.permits.acquire_many(slots).await {
            Ok(permits) => drop(permits),
            Err(err) => warn!(error = %err, "pool closed while draining"),
        }
    }

    async fn housekeeping(&self) {
        match self.monitor.sweep().await {
            Ok(pages) => {
                let created = pages.iter().filter(|p| p.created()).count();
                if created > 0 {
                    info!(created, "deadline sweep opened pages");
                }
            }
            Err(err) => error!(error = %format!("{err:#}"), "deadline sweep failed"),
        }
        if let Err(err) = self.collect_garbage().await {
            error!(error = %format!("{err:#}"), "finished strand purge failed");
        }
    }

    /// Deletes finished strands past the retention period.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let before = Utc::now() - chrono::Duration::from_std(self.settings.finished_retention)?;
        let purged = self.kernel.purge_finished_async(before).await?;
        if purged > 0 {
            counters::purged(purged);
            info!(purged, "purged finished strands");
            self.bus.publish(
                topics::TOPIC_DISPATCHER_GC,
                None,
                &json!({"purged": purged}),
            );
        }
        Ok(purged)
    }
}
