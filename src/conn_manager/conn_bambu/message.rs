//! Typed view over the JSON reports published by the printer.
//!
//! Every field is optional and every scalar is a [`Scalar`], so one badly typed
//! field never rejects the rest of a report. Nested objects go through
//! [`lenient`], which drops (and logs) a malformed object instead of failing.

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use serde::{de::DeserializeOwned, Deserialize, Deserializer};

#[derive(Debug, Clone)]
pub enum Message {
    Report(Box<Report>),
    Unknown(Option<String>),
}

/// A number or string as the firmware happens to send it
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
    Other(serde_json::Value),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            Scalar::Float(v) if v.is_finite() => Some(v.round() as i64),
            Scalar::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.round() as i64))
            }
            Scalar::Other(serde_json::Value::Bool(b)) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            Scalar::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// bitmask fields (`info`, `tray_exist_bits`, ...) arrive as hex strings
    pub fn as_hex(&self) -> Option<u64> {
        match self {
            Scalar::Int(v) if *v >= 0 => Some(*v as u64),
            Scalar::Text(s) => {
                let s = s.trim();
                let s = s.strip_prefix("0x").unwrap_or(s);
                u64::from_str_radix(s, 16).ok()
            }
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Other(serde_json::Value::Bool(b)) => Some(*b),
            Scalar::Int(v) => Some(*v != 0),
            Scalar::Text(s) => match s.trim() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Scalar::Text(s) => Some(s.clone()),
            Scalar::Int(v) => Some(v.to_string()),
            Scalar::Float(v) => Some(v.to_string()),
            _ => None,
        }
    }
}

/// Deserializes `T`, or logs and yields `None` if the value has the wrong shape
pub(crate) fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => match serde_json::from_value::<T>(value) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                warn!(
                    "skipping malformed {}: {}",
                    std::any::type_name::<T>().rsplit("::").next().unwrap_or("field"),
                    e
                );
                Ok(None)
            }
        },
    }
}

/// MARK: report

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Report {
    #[serde(default, deserialize_with = "lenient")]
    pub print: Option<PrintData>,
    #[serde(default, deserialize_with = "lenient")]
    pub info: Option<InfoData>,
    #[serde(default, deserialize_with = "lenient")]
    pub system: Option<SystemData>,
    #[serde(default, deserialize_with = "lenient")]
    pub xcam: Option<XcamData>,
}

impl Report {
    /// none of the known categories present
    pub fn is_empty(&self) -> bool {
        self.print.is_none() && self.info.is_none() && self.system.is_none() && self.xcam.is_none()
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PrintData {
    pub command: Option<Scalar>,
    pub sequence_id: Option<Scalar>,

    pub gcode_state: Option<Scalar>,
    pub mc_print_stage: Option<Scalar>,
    pub stg_cur: Option<Scalar>,
    pub mc_percent: Option<Scalar>,
    pub mc_remaining_time: Option<Scalar>,
    pub layer_num: Option<Scalar>,
    pub total_layer_num: Option<Scalar>,
    pub gcode_file: Option<Scalar>,
    pub subtask_name: Option<Scalar>,
    pub print_error: Option<Scalar>,
    pub spd_lvl: Option<Scalar>,
    pub wifi_signal: Option<Scalar>,

    pub nozzle_temper: Option<Scalar>,
    pub nozzle_target_temper: Option<Scalar>,
    pub bed_temper: Option<Scalar>,
    pub bed_target_temper: Option<Scalar>,
    pub chamber_temper: Option<Scalar>,

    pub cooling_fan_speed: Option<Scalar>,
    pub big_fan1_speed: Option<Scalar>,
    pub big_fan2_speed: Option<Scalar>,
    pub heatbreak_fan_speed: Option<Scalar>,

    pub ams_status: Option<Scalar>,
    /// echoed by `select_extruder`
    pub extruder_index: Option<Scalar>,

    #[serde(default, deserialize_with = "lenient")]
    pub ams: Option<AmsReport>,
    #[serde(default, deserialize_with = "lenient")]
    pub device: Option<Device>,
    #[serde(default, deserialize_with = "lenient")]
    pub hms: Option<Vec<HmsEntry>>,
    #[serde(default, deserialize_with = "lenient")]
    pub vt_tray: Option<TrayReport>,
    #[serde(default, deserialize_with = "lenient")]
    pub vir_slot: Option<Vec<TrayReport>>,
    #[serde(default, deserialize_with = "lenient")]
    pub lights_report: Option<Vec<LightReport>>,
    #[serde(default, deserialize_with = "lenient")]
    pub xcam: Option<XcamData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HmsEntry {
    pub attr: Option<Scalar>,
    pub code: Option<Scalar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LightReport {
    pub node: Option<Scalar>,
    pub mode: Option<Scalar>,
}

/// MARK: AMS

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AmsReport {
    #[serde(default, deserialize_with = "lenient")]
    pub ams: Option<Vec<AmsUnitReport>>,
    pub ams_exist_bits: Option<Scalar>,
    pub tray_exist_bits: Option<Scalar>,
    pub tray_now: Option<Scalar>,
    pub tray_pre: Option<Scalar>,
    pub tray_tar: Option<Scalar>,
    pub version: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AmsUnitReport {
    pub id: Option<Scalar>,
    pub humidity: Option<Scalar>,
    pub humidity_raw: Option<Scalar>,
    pub temp: Option<Scalar>,
    pub info: Option<Scalar>,
    pub dry_time: Option<Scalar>,
    /// only some firmwares send a per-unit mask
    pub tray_exist_bits: Option<Scalar>,
    #[serde(default, deserialize_with = "lenient")]
    pub tray: Option<Vec<TrayReport>>,
}

/// AMS trays and external spools (`vt_tray`, `vir_slot`) share this shape
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TrayReport {
    pub id: Option<Scalar>,
    pub tray_type: Option<Scalar>,
    pub tray_sub_brands: Option<Scalar>,
    pub tray_color: Option<Scalar>,
    pub remain: Option<Scalar>,
    pub k: Option<Scalar>,
    pub nozzle_temp_min: Option<Scalar>,
    pub nozzle_temp_max: Option<Scalar>,
}

/// MARK: device

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Device {
    #[serde(default, deserialize_with = "lenient")]
    pub airduct: Option<Airduct>,
    #[serde(default, deserialize_with = "lenient")]
    pub extruder: Option<Extruder>,
    /// packed actual | target << 16
    pub bed_temp: Option<Scalar>,
    /// packed actual | target << 16
    pub cham_temp: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Airduct {
    #[serde(rename = "modeCur")]
    pub mode_cur: Option<Scalar>,
    #[serde(default, deserialize_with = "lenient")]
    pub parts: Option<Vec<AirductPart>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AirductPart {
    pub id: Option<Scalar>,
    pub func: Option<Scalar>,
    pub state: Option<Scalar>,
    pub range: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Extruder {
    #[serde(default, deserialize_with = "lenient")]
    pub info: Option<Vec<ExtruderInfo>>,
    /// toolhead state bitmask, current extruder in bits 4..8
    pub state: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExtruderInfo {
    pub id: Option<Scalar>,
    /// packed actual | target << 16
    pub temp: Option<Scalar>,
    pub info: Option<Scalar>,
    pub stat: Option<Scalar>,
    pub snow: Option<Scalar>,
    pub spre: Option<Scalar>,
    pub star: Option<Scalar>,
}

/// MARK: info, system, xcam

#[derive(Debug, Default, Clone, Deserialize)]
pub struct InfoData {
    pub command: Option<Scalar>,
    #[serde(default, deserialize_with = "lenient")]
    pub module: Option<Vec<ModuleInfo>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ModuleInfo {
    pub name: Option<Scalar>,
    pub sn: Option<Scalar>,
    pub sw_ver: Option<Scalar>,
    pub hw_ver: Option<Scalar>,
    pub product_name: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SystemData {
    pub command: Option<Scalar>,
    pub result: Option<Scalar>,
    pub led_node: Option<Scalar>,
    pub led_mode: Option<Scalar>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct XcamData {
    pub command: Option<Scalar>,
    /// `xcam_control_set` names one detector
    pub module_name: Option<Scalar>,
    pub control: Option<Scalar>,
    pub enable: Option<Scalar>,
    pub print_halt: Option<Scalar>,
    pub halt_print_sensitivity: Option<Scalar>,

    pub first_layer_inspector: Option<Scalar>,
    pub spaghetti_detector: Option<Scalar>,
    pub buildplate_marker_detector: Option<Scalar>,
    pub printing_monitor: Option<Scalar>,
    pub allow_skip_parts: Option<Scalar>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_coercion() {
        let v: Scalar = serde_json::from_str("\"15\"").unwrap();
        assert_eq!(v.as_i64(), Some(15));
        let v: Scalar = serde_json::from_str("26.5").unwrap();
        assert_eq!(v.as_f64(), Some(26.5));
        let v: Scalar = serde_json::from_str("\"1103\"").unwrap();
        assert_eq!(v.as_hex(), Some(0x1103));
        let v: Scalar = serde_json::from_str("\"-65dBm\"").unwrap();
        assert_eq!(v.as_i64(), None);
        let v: Scalar = serde_json::from_str("{\"a\": 1}").unwrap();
        assert_eq!(v.as_f64(), None);
    }

    #[test]
    fn test_malformed_nested_object_is_dropped() {
        let json = r#"{"print": {"bed_temper": 60, "ams": "garbage", "device": {"extruder": 3}}}"#;
        let report: Report = serde_json::from_str(json).unwrap();
        let print = report.print.unwrap();
        assert_eq!(print.bed_temper.and_then(|v| v.as_f64()), Some(60.0));
        assert!(print.ams.is_none());
        assert!(print.device.unwrap().extruder.is_none());
    }

    #[test]
    fn test_empty_report() {
        let report: Report = serde_json::from_str(r#"{"mystery": {}}"#).unwrap();
        assert!(report.is_empty());
    }
}
