use std::sync::Arc;

use crate::status::PrinterSnapshot;

/// Messages from a printer session to whoever is watching it
#[derive(Debug, Clone)]
pub enum WorkerMsg {
    StatusUpdate(Arc<PrinterSnapshot>),

    Connected,
    Disconnected,
    Paused,
    /// terminal, carries the last snapshot
    Quit(Arc<PrinterSnapshot>),
}

impl WorkerMsg {
    pub fn snapshot(&self) -> Option<&Arc<PrinterSnapshot>> {
        match self {
            WorkerMsg::StatusUpdate(s) | WorkerMsg::Quit(s) => Some(s),
            _ => None,
        }
    }
}
