pub mod bambu_status;
pub mod decode;
pub mod hms;
pub mod reconcile;

use serde::{Deserialize, Serialize};

pub use bambu_status::PrinterSnapshot;
pub use reconcile::reduce;

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterState {
    Idle,
    Finished,
    Busy,
    Printing,
    Paused,
    Error,
    #[default]
    Disconnected,
    Unknown(String),
}

impl PrinterState {
    pub fn to_text(&self) -> &'static str {
        match self {
            PrinterState::Idle => "Idle",
            PrinterState::Finished => "Finished",
            PrinterState::Busy => "Busy",
            PrinterState::Printing => "Printing",
            PrinterState::Error => "Error",
            PrinterState::Paused => "Paused",
            PrinterState::Disconnected => "Disconnected",
            PrinterState::Unknown(_) => "Unknown",
        }
    }

    /// `gcode_state` as sent by the printer; a pause with an error code is an error
    pub fn from_gcode_state(gcode_state: &str, print_error: Option<i64>) -> Self {
        match gcode_state {
            "IDLE" | "READY" => PrinterState::Idle,
            "FINISH" => PrinterState::Finished,
            "CREATED" | "RUNNING" | "PREPARE" => PrinterState::Printing,
            "SLICING" | "INIT" => PrinterState::Busy,
            "PAUSE" => match print_error {
                Some(e) if e != 0 => PrinterState::Error,
                _ => PrinterState::Paused,
            },
            "FAILED" => PrinterState::Error,
            s => PrinterState::Unknown(s.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, PrinterState::Error)
    }
}
