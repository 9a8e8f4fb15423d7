use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{BatchOrchestrator, BatchSummary, PipelineError, SyncConfig};

/// Process-wide single-flight lock for full scans.
#[derive(Debug, Clone, Default)]
pub struct ScanGuard {
    running_since: Arc<Mutex<Option<DateTime<Utc>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub in_progress: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// Held for the duration of a scan; dropping it releases the guard.
#[derive(Debug)]
pub struct ScanPermit {
    guard: ScanGuard,
}

impl Drop for ScanPermit {
    fn drop(&mut self) {
        *self.guard.lock() = None;
    }
}

impl ScanGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.running_since
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn try_acquire(&self) -> Option<ScanPermit> {
        let mut slot = self.lock();
        if slot.is_some() {
            return None;
        }
        *slot = Some(Utc::now());
        Some(ScanPermit {
            guard: self.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    pub fn status(&self) -> ScanStatus {
        let started_at = *self.lock();
        ScanStatus {
            in_progress: started_at.is_some(),
            started_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started {
        #[serde(rename = "startedAt")]
        started_at: Option<DateTime<Utc>>,
    },
    AlreadyRunning {
        #[serde(rename = "startedAt")]
        started_at: Option<DateTime<Utc>>,
    },
}

/// Launches full scans behind a [`ScanGuard`].
#[derive(Clone)]
pub struct ScanTrigger {
    orchestrator: Arc<BatchOrchestrator>,
    guard: ScanGuard,
}

impl ScanTrigger {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, guard: ScanGuard) -> Self {
        Self {
            orchestrator,
            guard,
        }
    }

    pub fn guard(&self) -> &ScanGuard {
        &self.guard
    }

    /// Runs a full scan in the current task; `None` when another scan holds the guard.
    pub async fn run_guarded(&self) -> Option<Result<BatchSummary, PipelineError>> {
        let Some(_permit) = self.guard.try_acquire() else {
            warn!(status = ?self.guard.status(), "full scan already in progress; skipping");
            return None;
        };
        Some(self.orchestrator.run_full_scan().await)
    }

    /// Starts a full scan in the background and returns immediately.
    pub fn trigger(&self) -> TriggerOutcome {
        let Some(permit) = self.guard.try_acquire() else {
            let status = self.guard.status();
            warn!(started_at = ?status.started_at, "full scan already in progress; trigger ignored");
            return TriggerOutcome::AlreadyRunning {
                started_at: status.started_at,
            };
        };

        let started_at = self.guard.status().started_at;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = orchestrator.run_full_scan().await {
                error!(error = %err, "full scan failed");
            }
        });
        info!(?started_at, "full scan started");
        TriggerOutcome::Started { started_at }
    }
}

/// Weekly full-scan job; `None` unless the scheduler is enabled.
pub async fn build_scheduler(
    config: &SyncConfig,
    trigger: ScanTrigger,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.scan_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let trigger = trigger.clone();
        Box::pin(async move {
            info!("scheduled full scan firing");
            trigger.trigger();
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::*;

    #[test]
    fn guard_is_single_flight_and_released_on_drop() {
        let guard = ScanGuard::new();
        assert!(!guard.is_running());

        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_running());
        assert!(guard.status().started_at.is_some());
        assert!(guard.clone().try_acquire().is_none());

        drop(permit);
        assert_eq!(
            guard.status(),
            ScanStatus {
                in_progress: false,
                started_at: None
            }
        );
        assert!(guard.try_acquire().is_some());
    }

    async fn trigger_over(names: &[&str]) -> ScanTrigger {
        let store = seeded_store(names).await;
        let orch = orchestrator(store, ScriptedFetcher::default(), StubExtractor::default());
        ScanTrigger::new(Arc::new(orch), ScanGuard::new())
    }

    #[tokio::test]
    async fn trigger_while_running_is_a_no_op() {
        let trigger = trigger_over(&["Alpha"]).await;
        let held = trigger.guard().try_acquire().unwrap();

        assert!(matches!(trigger.trigger(), TriggerOutcome::AlreadyRunning { .. }));
        assert!(trigger.run_guarded().await.is_none());

        drop(held);
        let summary = trigger.run_guarded().await.unwrap().unwrap();
        assert_eq!(summary.processed, 1);
        assert!(!trigger.guard().is_running());
    }

    #[tokio::test]
    async fn background_scan_releases_guard_when_done() {
        let trigger = trigger_over(&["Alpha", "Beta"]).await;
        assert!(matches!(trigger.trigger(), TriggerOutcome::Started { started_at: Some(_) }));

        for _ in 0..200 {
            if !trigger.guard().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!trigger.guard().is_running());
        assert!(matches!(trigger.trigger(), TriggerOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let trigger = trigger_over(&[]).await;
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(build_scheduler(&config, trigger).await.unwrap().is_none());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(TriggerOutcome::AlreadyRunning { started_at: None }).unwrap();
        assert_eq!(json["outcome"], "already_running");
        assert!(json["startedAt"].is_null());
    }
}
