//! Shared application state.

use crate::config::ServerConfig;
use crate::languages::HandlerRegistry;
use crate::supervisor::TimeoutSupervisor;
use crate::trust::{ApprovalRequest, TrustGate};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything a session needs, constructed once and cloned per connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub handlers: Arc<HandlerRegistry>,
    pub trust: TrustGate,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    /// Build the state and return the approval queue for the operator.
    pub fn new(
        config: ServerConfig,
        handlers: HandlerRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (trust, approvals) = TrustGate::new();
        for token in &config.trusted_tokens {
            trust.approve(token);
        }
        let state = Self {
            config: Arc::new(config),
            handlers: Arc::new(handlers),
            trust,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        };
        (state, approvals)
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn supervisor(&self) -> TimeoutSupervisor {
        TimeoutSupervisor::new(self.config.deadline)
    }
}
