//! Orchestrator event feed.
//!
//! Callers see a fixed vocabulary of events instead of internal step names.
//! Events go out over a broadcast channel; a send with no subscribers is
//! dropped silently.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::migration::{ProgressReporter, StepPhase, StepProgress};

/// Default broadcast capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum OrchestratorEvent {
    /// A public operation began
    OperationStart {
        /// Operation name
        operation: String,
    },
    /// A public operation finished successfully
    OperationComplete {
        /// Operation name
        operation: String,
        /// Outcome summary
        message: Option<String>,
    },
    /// A public operation failed
    OperationError {
        /// Operation name
        operation: String,
        /// Error kind
        kind: String,
        /// Error message
        message: String,
    },
    /// Migration progress
    MigrationProgress {
        /// Step name, when progress comes from a step transition
        step: Option<String>,
        /// Percent complete
        progress: u8,
        /// Detail
        message: Option<String>,
    },
    /// Health check progress
    HealthCheckProgress {
        /// Stage name
        stage: String,
        /// Percent complete
        progress: u8,
    },
    /// A rollback finished
    RollbackComplete {
        /// Backup restored
        backup_id: String,
    },
    /// A rollback failed
    RollbackError {
        /// Error message
        message: String,
    },
    /// Hybrid mode switched on
    HybridModeEnabled,
    /// Hybrid mode switched off
    HybridModeDisabled,
}

impl OrchestratorEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationStart { .. } => "operationStart",
            Self::OperationComplete { .. } => "operationComplete",
            Self::OperationError { .. } => "operationError",
            Self::MigrationProgress { .. } => "migrationProgress",
            Self::HealthCheckProgress { .. } => "healthCheckProgress",
            Self::RollbackComplete { .. } => "rollbackComplete",
            Self::RollbackError { .. } => "rollbackError",
            Self::HybridModeEnabled => "hybridModeEnabled",
            Self::HybridModeDisabled => "hybridModeDisabled",
        }
    }
}

/// Broadcast sender for [`OrchestratorEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus buffering `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event
    pub fn emit(&self, event: OrchestratorEvent) {
        trace!(event = event.name(), "orchestrator event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ProgressReporter for EventBus {
    fn on_step(&self, progress: &StepProgress) {
        if progress.phase == StepPhase::Started {
            return;
        }
        self.emit(OrchestratorEvent::MigrationProgress {
            step: Some(progress.step.to_string()),
            progress: progress.progress,
            message: progress.message.clone(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::MigrationStep;

    #[test]
    fn test_event_names_are_camel_case() {
        let event = OrchestratorEvent::RollbackComplete {
            backup_id: "b1".into(),
        };
        assert_eq!(event.name(), "rollbackComplete");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "rollbackComplete");
        assert_eq!(OrchestratorEvent::HybridModeDisabled.name(), "hybridModeDisabled");
    }

    #[tokio::test]
    async fn test_step_progress_becomes_migration_progress() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let mut progress = StepProgress {
            run_id: "r1".into(),
            step: MigrationStep::Export,
            phase: StepPhase::Started,
            progress: 0,
            message: None,
        };
        bus.on_step(&progress);
        progress.phase = StepPhase::Completed;
        progress.progress = 10;
        bus.on_step(&progress);

        match rx.recv().await.unwrap() {
            OrchestratorEvent::MigrationProgress { step, progress, .. } => {
                assert_eq!(step.as_deref(), Some("export"));
                assert_eq!(progress, 10);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        EventBus::new(1).emit(OrchestratorEvent::HybridModeEnabled);
    }
}
