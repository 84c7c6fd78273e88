use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event bus between the issuance core and the scheduler
pub struct EventBus {
    /// Domain record lifecycle (orchestrator → poller)
    pub issuance: broadcast::Sender<IssuanceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            issuance: broadcast::channel(256).0,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssuanceEvent {
    RecordCreated { domain: String },
    TextRecordMatched { domain: String },
    Completed { domain: String },
    FinalizeFailed { domain: String, error: String },
}

impl IssuanceEvent {
    pub fn domain(&self) -> &str {
        match self {
            Self::RecordCreated { domain }
            | Self::TextRecordMatched { domain }
            | Self::Completed { domain }
            | Self::FinalizeFailed { domain, .. } => domain,
        }
    }
}
