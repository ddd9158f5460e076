/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::collection_fetch::CollectionFetcher;
use crate::discovery::{ContactResolver, RelationDiscovery};
use crate::discovery_policy::{Clock, DiscoveryConfig};
use crate::relation_db::{now_ms, DiscoveryJob, RelationDb};
use anyhow::Result;
use rand::{thread_rng, Rng};
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// Drains the `discovery_jobs` queue one job at a time, so passes for the
/// same profile never overlap.
#[derive(Clone)]
pub struct DiscoveryWorker {
    notify: Arc<Notify>,
    tick: Duration,
    batch: u32,
    max_attempts: u32,
    base_backoff_secs: u64,
    max_backoff_secs: u64,
}

impl Default for DiscoveryWorker {
    fn default() -> Self {
        Self::new(&DiscoveryConfig::default())
    }
}

impl DiscoveryWorker {
    pub fn new(cfg: &DiscoveryConfig) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            tick: Duration::from_secs(cfg.worker_tick_secs.unwrap_or(30).max(1)),
            batch: cfg.worker_batch.unwrap_or(20).max(1),
            max_attempts: cfg.job_max_attempts.unwrap_or(5).max(1),
            base_backoff_secs: 60,
            max_backoff_secs: 6 * 3600,
        }
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Queues `url` for an immediate pass and wakes the worker.
    pub async fn enqueue(&self, db: &Arc<RelationDb>, url: &str) -> Result<()> {
        let db = db.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || db.enqueue_discovery(&url, now_ms())).await??;
        self.notify();
        Ok(())
    }

    pub fn start<R, F, C>(
        &self,
        shutdown: watch::Receiver<bool>,
        db: Arc<RelationDb>,
        discovery: Arc<RelationDiscovery<RelationDb, R, F, C>>,
    ) where
        R: ContactResolver + 'static,
        F: CollectionFetcher + 'static,
        C: Clock + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_loop(shutdown, db, discovery).await {
                warn!("discovery worker stopped: {e:#}");
            }
        });
    }

    async fn run_loop<R, F, C>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        db: Arc<RelationDb>,
        discovery: Arc<RelationDiscovery<RelationDb, R, F, C>>,
    ) -> Result<()>
    where
        R: ContactResolver + 'static,
        F: CollectionFetcher + 'static,
        C: Clock + 'static,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let processed = self.run_once(&db, &discovery).await?;
            if processed == 0 {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.tick) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        Ok(())
    }

    /// Processes the jobs due now. Returns how many were taken.
    pub async fn run_once<R, F, C>(
        &self,
        db: &Arc<RelationDb>,
        discovery: &RelationDiscovery<RelationDb, R, F, C>,
    ) -> Result<usize>
    where
        R: ContactResolver + 'static,
        F: CollectionFetcher + 'static,
        C: Clock + 'static,
    {
        let jobs = tokio::task::spawn_blocking({
            let db = db.clone();
            let batch = self.batch;
            move || db.fetch_due_discovery_jobs(now_ms(), batch)
        })
        .await??;

        let n = jobs.len();
        for job in jobs {
            if let Err(e) = self.process_one(db, discovery, job).await {
                warn!("discovery job error: {e:#}");
            }
        }
        Ok(n)
    }

    async fn process_one<R, F, C>(
        &self,
        db: &Arc<RelationDb>,
        discovery: &RelationDiscovery<RelationDb, R, F, C>,
        job: DiscoveryJob,
    ) -> Result<()>
    where
        R: ContactResolver + 'static,
        F: CollectionFetcher + 'static,
        C: Clock + 'static,
    {
        match discovery.discover_by_url(&job.url).await {
            Ok(outcome) => {
                debug!(url = %job.url, ?outcome, "discovery job done");
                let db = db.clone();
                tokio::task::spawn_blocking(move || db.finish_discovery_job(&job.url)).await??;
                Ok(())
            }
            Err(e) => {
                let attempt_no = job.attempt.saturating_add(1);
                self.reschedule(db, &job.url, attempt_no, &format!("{e:#}")).await
            }
        }
    }

    async fn reschedule(&self, db: &Arc<RelationDb>, url: &str, attempt_no: u32, err: &str) -> Result<()> {
        let db = db.clone();
        let url = url.to_string();
        let err = err.to_string();
        if attempt_no >= self.max_attempts {
            warn!(url = %url, attempt_no, "discovery job dropped: {err}");
            tokio::task::spawn_blocking(move || db.mark_discovery_job_dead(&url, &err)).await??;
            return Ok(());
        }

        let next = now_ms().saturating_add(
            next_backoff(attempt_no, self.base_backoff_secs, self.max_backoff_secs).as_millis() as i64,
        );
        tokio::task::spawn_blocking(move || db.retry_discovery_job(&url, attempt_no, next, &err)).await??;
        Ok(())
    }
}

fn next_backoff(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = base_secs.saturating_mul(1u64 << pow).min(max_secs);
    let jitter_ms: u64 = thread_rng().gen_range(0..1000);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
