use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

/// Outbound side of a printer connection.
///
/// Calls never block: they queue a request for the event loop and return.
/// Errors mean the request could not be queued at all.
pub trait Transport: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<()>;
    fn unsubscribe(&self, topic: &str) -> Result<()>;
    fn publish(&self, topic: &str, payload: String) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct Topics {
    pub report: String,
    pub request: String,
}

impl Topics {
    pub fn for_serial(serial: &str) -> Self {
        Self {
            report: format!("device/{}/report", serial),
            request: format!("device/{}/request", serial),
        }
    }
}
