use dc_common::config::EnvConfig;
use dc_issuance::Orchestrator;
use std::sync::Arc;

/// Shared application state for all API routes.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub env: Arc<EnvConfig>,
}
