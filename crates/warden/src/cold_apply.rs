//! Cold-Apply Orchestrator - stop, apply, start
//!
//! A resource observed stopped is not stopped again, but is always started
//! once the change has been attempted.

use crate::platform::Host;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use warden_common::{PowerState, ReconciliationAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ColdApplyOutcome {
    Applied,
    /// Could not bring the resource down; nothing was changed
    StopFailed(String),
    /// The change was rejected; the resource was restarted
    ApplyFailed(String),
    /// The change went in, but the resource stayed down
    RestartFailed(String),
}

impl ColdApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ColdApplyOutcome::Applied)
    }
}

pub async fn cold_apply(host: &Host, action: &ReconciliationAction) -> ColdApplyOutcome {
    let (kind, id) = (action.kind, action.id);
    info!("Drift on {}", action.describe());

    if let Err(reason) = ensure_stopped(host, action).await {
        warn!("{} {}: stop failed, skipping {}: {}", kind, id, action.attribute, reason);
        return ColdApplyOutcome::StopFailed(reason);
    }

    let applied = host.apply(action).await;
    if let Err(e) = &applied {
        error!("{} {}: failed to apply {}: {}", kind, id, action.attribute, e);
    }

    if let Err(e) = host.start(kind, id).await {
        warn!(
            "{} {}: restart after {} failed, leaving stopped: {}",
            kind, id, action.attribute, e
        );
        return match applied {
            Ok(()) => ColdApplyOutcome::RestartFailed(e.to_string()),
            Err(apply_err) => ColdApplyOutcome::ApplyFailed(apply_err.to_string()),
        };
    }

    match applied {
        Ok(()) => {
            info!("{} {}: {} applied", kind, id, action.attribute);
            ColdApplyOutcome::Applied
        }
        Err(e) => ColdApplyOutcome::ApplyFailed(e.to_string()),
    }
}

async fn ensure_stopped(host: &Host, action: &ReconciliationAction) -> Result<(), String> {
    let (kind, id) = (action.kind, action.id);
    let state = host.power_state(kind, id).await.map_err(|e| e.to_string())?;
    if state == PowerState::Stopped {
        debug!("{} {} already stopped", kind, id);
        return Ok(());
    }

    if let Err(e) = host.graceful_stop(kind, id).await {
        warn!("{} {}: graceful shutdown failed: {}", kind, id, e);
    }

    // Status never changes in dry-run
    if host.is_dry_run() {
        return Ok(());
    }

    match host.power_state(kind, id).await {
        Ok(PowerState::Stopped) => Ok(()),
        Ok(state) => {
            info!("{} {} still {} after shutdown, forcing stop", kind, id, state);
            host.force_stop(kind, id).await.map_err(|e| e.to_string())
        }
        Err(e) => {
            warn!("{} {}: status after shutdown unavailable ({}), forcing stop", kind, id, e);
            host.force_stop(kind, id).await.map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::fake::FakeHost;
    use std::sync::Arc;
    use std::time::Duration;
    use warden_common::{ApplyOp, OpsJournal, ResourceKind, WardenConfig};

    fn host(fake: &Arc<FakeHost>, dry_run: bool) -> Host {
        let executor = Executor::new(
            fake.clone(),
            dry_run,
            Duration::from_secs(5),
            Duration::from_secs(5),
            OpsJournal::disabled("test"),
        );
        Host::new(executor, &WardenConfig::default())
    }

    fn memory_action(id: u32) -> ReconciliationAction {
        ReconciliationAction {
            id,
            kind: ResourceKind::Container,
            attribute: "memory".to_string(),
            old_value: Some("1024".to_string()),
            new_value: "2048".to_string(),
            cold: true,
            op: ApplyOp::Set {
                options: vec![("memory".to_string(), "2048".to_string())],
            },
        }
    }

    #[tokio::test]
    async fn test_running_resource_cycles() {
        let fake = Arc::new(
            FakeHost::new().with_container(101, PowerState::Running, &[("memory", "1024")]),
        );
        let outcome = cold_apply(&host(&fake, false), &memory_action(101)).await;

        assert_eq!(outcome, ColdApplyOutcome::Applied);
        assert_eq!(
            fake.mutating_calls(),
            vec![
                "pct shutdown 101 --timeout 60",
                "pct set 101 --memory 2048",
                "pct start 101",
            ]
        );
        let res = fake.resource(101).unwrap();
        assert_eq!(res.get("memory"), Some("2048"));
        assert_eq!(res.power, PowerState::Running);
    }

    #[tokio::test]
    async fn test_stopped_resource_is_started() {
        let fake = Arc::new(FakeHost::new().with_container(101, PowerState::Stopped, &[]));
        let outcome = cold_apply(&host(&fake, false), &memory_action(101)).await;

        assert!(outcome.is_applied());
        assert_eq!(
            fake.mutating_calls(),
            vec!["pct set 101 --memory 2048", "pct start 101"]
        );
        assert_eq!(fake.resource(101).unwrap().power, PowerState::Running);
    }

    #[tokio::test]
    async fn test_ignored_shutdown_forces_stop() {
        let fake = Arc::new(
            FakeHost::new()
                .with_container(101, PowerState::Running, &[])
                .ignore_shutdown(101),
        );
        cold_apply(&host(&fake, false), &memory_action(101)).await;
        assert_eq!(
            fake.mutating_calls(),
            vec![
                "pct shutdown 101 --timeout 60",
                "pct stop 101",
                "pct set 101 --memory 2048",
                "pct start 101",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_failure_skips_apply() {
        let fake = Arc::new(
            FakeHost::new()
                .with_container(101, PowerState::Running, &[("memory", "1024")])
                .ignore_shutdown(101)
                .fail_on("pct stop 101"),
        );
        let outcome = cold_apply(&host(&fake, false), &memory_action(101)).await;

        assert!(matches!(outcome, ColdApplyOutcome::StopFailed(_)));
        assert!(!fake.mutating_calls().iter().any(|c| c.contains(" set ")));
        assert_eq!(fake.resource(101).unwrap().get("memory"), Some("1024"));
    }

    #[tokio::test]
    async fn test_apply_failure_still_restarts() {
        let fake = Arc::new(
            FakeHost::new()
                .with_container(101, PowerState::Running, &[])
                .fail_on("pct set 101"),
        );
        let outcome = cold_apply(&host(&fake, false), &memory_action(101)).await;

        assert!(matches!(outcome, ColdApplyOutcome::ApplyFailed(_)));
        assert_eq!(fake.resource(101).unwrap().power, PowerState::Running);
    }

    #[tokio::test]
    async fn test_restart_failure_leaves_stopped() {
        let fake = Arc::new(
            FakeHost::new()
                .with_container(101, PowerState::Running, &[])
                .time_out_on("pct start 101"),
        );
        let outcome = cold_apply(&host(&fake, false), &memory_action(101)).await;

        assert!(matches!(outcome, ColdApplyOutcome::RestartFailed(_)));
        assert_eq!(fake.resource(101).unwrap().power, PowerState::Stopped);
    }

    #[tokio::test]
    async fn test_dry_run_issues_nothing() {
        let fake = Arc::new(FakeHost::new().with_container(101, PowerState::Running, &[]));
        let host = host(&fake, true);
        let outcome = cold_apply(&host, &memory_action(101)).await;

        assert!(outcome.is_applied());
        assert!(fake.mutating_calls().is_empty());
        assert_eq!(host.stats().simulated, 3);
    }
}
