//! Power-State Reconciler

use crate::platform::Host;
use serde::Serialize;
use tracing::{info, warn};
use warden_common::{DesiredState, PowerState, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    GracefulStop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum PowerOutcome {
    InSync,
    Changed(Transition),
    Failed(String),
}

/// Transition needed to move `observed` to `desired`. Unknown never transitions.
pub fn plan(desired: DesiredState, observed: PowerState) -> Option<Transition> {
    match (desired, observed) {
        (DesiredState::Running, PowerState::Stopped) => Some(Transition::Start),
        (DesiredState::Stopped, PowerState::Running) => Some(Transition::GracefulStop),
        _ => None,
    }
}

pub async fn reconcile_power(
    host: &Host,
    kind: ResourceKind,
    id: u32,
    desired: DesiredState,
) -> PowerOutcome {
    let observed = match host.power_state(kind, id).await {
        Ok(state) => state,
        Err(e) => {
            warn!("{} {}: status unavailable, skipping power reconcile: {}", kind, id, e);
            return PowerOutcome::Failed(e.to_string());
        }
    };

    let Some(transition) = plan(desired, observed) else {
        if observed == PowerState::Unknown {
            warn!("{} {}: power state unknown, leaving as is", kind, id);
        }
        return PowerOutcome::InSync;
    };

    info!("{} {}: {} but desired {}", kind, id, observed, desired);
    let result = match transition {
        Transition::Start => host.start(kind, id).await,
        Transition::GracefulStop => host.graceful_stop(kind, id).await,
    };
    match result {
        Ok(()) => PowerOutcome::Changed(transition),
        Err(e) => {
            warn!("{} {}: power transition {:?} failed: {}", kind, id, transition, e);
            PowerOutcome::Failed(e.to_string())
        }
    }
}
