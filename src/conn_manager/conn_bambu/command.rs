use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use serde_json::json;

/// Requests published on `device/<serial>/request`
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// ask for a full report
    PushAll,
    GetVersion,
    Pause,
    Resume,
    Stop,
    /// 1 silent, 2 standard, 3 sport, 4 ludicrous
    SetSpeed(u8),
    ChamberLight(bool),
    GcodeLine(String),
}

impl Command {
    pub fn get_payload(&self) -> String {
        let payload = match self {
            Command::PushAll => json!({
                "pushing": {
                    "sequence_id": "0",
                    "command": "pushall",
                    "version": 1,
                    "push_target": 1
                }
            }),
            Command::GetVersion => json!({
                "info": {
                    "sequence_id": "0",
                    "command": "get_version"
                }
            }),
            Command::Pause => Self::print_command("pause"),
            Command::Resume => Self::print_command("resume"),
            Command::Stop => Self::print_command("stop"),
            Command::SetSpeed(level) => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "print_speed",
                    "param": (*level).clamp(1, 4).to_string()
                }
            }),
            Command::ChamberLight(on) => json!({
                "system": {
                    "sequence_id": "0",
                    "command": "ledctrl",
                    "led_node": "chamber_light",
                    "led_mode": if *on { "on" } else { "off" },
                    "led_on_time": 500,
                    "led_off_time": 500,
                    "loop_times": 0,
                    "interval_time": 0
                }
            }),
            Command::GcodeLine(gcode) => json!({
                "print": {
                    "sequence_id": "0",
                    "command": "gcode_line",
                    "param": format!("{}\n", gcode.trim_end())
                }
            }),
        };
        payload.to_string()
    }

    fn print_command(command: &str) -> serde_json::Value {
        json!({
            "print": {
                "sequence_id": "0",
                "command": command,
                "param": ""
            }
        })
    }

    /// Safe to resend any number of times
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Command::PushAll | Command::GetVersion)
    }
}
