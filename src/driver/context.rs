//! Per-connection state assigned by the server.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{PgError, PgResult};
use crate::protocol::TransactionStatus;

/// State threaded through one connection; never shared across connections.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    process_id: Option<i32>,
    secret_key: Option<i32>,
    parameters: HashMap<String, String>,
    ready: bool,
    transaction_status: TransactionStatus,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record BackendKeyData. The identifiers are fixed once assigned.
    pub fn set_backend_key(&mut self, process_id: i32, secret_key: i32) -> PgResult<()> {
        match (self.process_id, self.secret_key) {
            (None, None) => {
                debug!(process_id, "backend key assigned");
                self.process_id = Some(process_id);
                self.secret_key = Some(secret_key);
                Ok(())
            }
            (Some(pid), Some(key)) if pid == process_id && key == secret_key => Ok(()),
            _ => {
                warn!(process_id, "ignoring second BackendKeyData");
                Err(PgError::Protocol(
                    "backend key data already assigned".to_string(),
                ))
            }
        }
    }

    /// Get the cancel key for this connection.
    pub fn cancel_key(&self) -> Option<(i32, i32)> {
        self.process_id.zip(self.secret_key)
    }

    pub fn process_id(&self) -> Option<i32> {
        self.process_id
    }

    pub fn set_parameter(&mut self, name: String, value: String) {
        self.parameters.insert(name, value);
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn mark_ready(&mut self, status: TransactionStatus) {
        self.ready = true;
        self.transaction_status = status;
    }

    /// A command went out; the server is busy until the next ReadyForQuery.
    pub fn mark_busy(&mut self) {
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }
}
