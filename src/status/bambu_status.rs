use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    decode::{
        resolve_ams_series, resolve_printer_model, AmsInfoFlags, AmsModel, AmsSeries, AmsState,
        ExtruderInfoState, ExtruderSide, ExtruderStatus, PrinterModel,
    },
    hms::HmsError,
    PrinterState,
};

/// Last known state of one printer.
///
/// Never mutated once published: the reconciler clones the previous value,
/// merges a report into the clone, and the connection swaps the new `Arc` in.
/// Fields absent from a report keep their previous value.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PrinterSnapshot {
    pub serial: Option<String>,
    pub printer_model: PrinterModel,
    pub firmware_version: Option<String>,

    /// derived from `gcode_state` and `print_error`
    pub state: PrinterState,
    pub gcode_state: Option<String>,
    pub stage_id: Option<i64>,
    pub stage_name: Option<String>,
    pub print_stage: Option<i64>,
    pub percent: Option<i64>,
    pub remaining_minutes: Option<i64>,
    pub layer_num: Option<i64>,
    pub total_layer_num: Option<i64>,
    pub gcode_file: Option<String>,
    pub subtask_name: Option<String>,
    pub speed_level: Option<i64>,
    pub wifi_signal: Option<String>,
    pub print_error: Option<i64>,
    pub print_error_message: Option<String>,

    /// nozzle of the active extruder, or the flat report fields on single nozzle printers
    pub nozzle_temp: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub flat_nozzle_temp: Option<f64>,
    pub flat_nozzle_target: Option<f64>,
    pub bed_temp: Option<f64>,
    pub bed_target: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub chamber_target: Option<f64>,

    pub fans: FanState,
    /// set once airduct data has been seen, never cleared
    pub has_duct: bool,
    pub duct: DuctState,

    pub ams_units: Vec<AmsUnitState>,
    pub ams_status: Option<i64>,
    pub ams_state: AmsState,
    pub ams_exist_bits: Option<u64>,
    pub tray_exist_bits: Option<u64>,
    pub ams_version: Option<i64>,
    pub tray_now: Option<i64>,
    pub tray_pre: Option<i64>,
    pub tray_tar: Option<i64>,
    pub active_tray: Option<i64>,
    pub target_tray: Option<i64>,
    pub is_external_spool_active: bool,
    pub virtual_trays: BTreeSet<i64>,
    pub external_spools: BTreeMap<i64, TrayState>,

    pub extruders: Vec<ExtruderState>,
    /// extruder id -> filament source (tray id)
    pub extruder_assignment: BTreeMap<i64, i64>,
    pub toolhead_state: Option<i64>,
    pub active_tool: ExtruderSide,

    pub hms: Vec<HmsError>,
    /// space separated messages of `hms`
    pub hms_message: String,

    pub chamber_light: Option<bool>,
    pub work_light: Option<bool>,
    pub xcam: XcamState,
    pub last_system_command: Option<SystemCommandResult>,
}

impl PrinterSnapshot {
    pub fn for_serial(serial: &str) -> Self {
        Self {
            serial: Some(serial.to_string()),
            printer_model: resolve_printer_model(serial),
            ..Default::default()
        }
    }

    pub fn ams_unit(&self, ams_id: &str) -> Option<&AmsUnitState> {
        self.ams_units.iter().find(|u| u.ams_id == ams_id)
    }

    pub fn extruder(&self, id: i64) -> Option<&ExtruderState> {
        self.extruders.iter().find(|e| e.id == id)
    }

    pub fn is_multi_extruder(&self) -> bool {
        self.extruders.len() > 1 || self.printer_model.is_multi_extruder()
    }

    pub fn time_remaining(&self) -> Option<chrono::Duration> {
        self.remaining_minutes.map(chrono::Duration::minutes)
    }

    pub fn has_critical_hms(&self) -> bool {
        self.hms.iter().any(|h| h.is_critical)
    }

    /// "Printing 42% L12/80 nozzle 220/220 bed 60/60"
    pub fn summary(&self) -> String {
        let mut out = format!("{}", self.state.to_text());
        if let Some(p) = self.percent {
            out.push_str(&format!(" {}%", p));
        }
        if let (Some(l), Some(t)) = (self.layer_num, self.total_layer_num) {
            out.push_str(&format!(" L{}/{}", l, t));
        }
        if let Some(n) = self.nozzle_temp {
            out.push_str(&format!(" nozzle {:.0}/{:.0}", n, self.nozzle_target.unwrap_or(0.)));
        }
        if let Some(b) = self.bed_temp {
            out.push_str(&format!(" bed {:.0}/{:.0}", b, self.bed_target.unwrap_or(0.)));
        }
        if let Some(tray) = self.active_tray {
            out.push_str(&format!(" tray {}", tray));
        }
        if !self.hms_message.is_empty() {
            out.push_str(&format!(" [{}]", self.hms_message));
        }
        out
    }
}

/// Percentages, 0..=100
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanState {
    pub part_cooling: Option<u8>,
    pub aux: Option<u8>,
    pub chamber: Option<u8>,
    pub heatbreak: Option<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DuctState {
    pub mode: Option<i64>,
    pub parts: BTreeMap<i64, DuctPart>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuctPart {
    pub func: Option<i64>,
    pub state: Option<i64>,
    pub range: Option<i64>,
}

/// One AMS unit, keyed by `ams_id`. Never removed once seen.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct AmsUnitState {
    pub ams_id: String,
    pub info_raw: Option<u32>,
    pub flags: AmsInfoFlags,
    pub temp: Option<f64>,
    pub humidity: Option<String>,
    pub humidity_raw: Option<i64>,
    pub dry_time: Option<i64>,
    pub tray_exists: [bool; 4],
    pub trays: BTreeMap<i64, TrayState>,

    pub serial: Option<String>,
    pub firmware_version: Option<String>,
    pub hw_version: Option<String>,
    pub model: AmsModel,
    /// humidity field carried the "no sensor" sentinel
    pub lite_humidity_sentinel: bool,
}

impl AmsUnitState {
    pub fn new(ams_id: &str) -> Self {
        Self {
            ams_id: ams_id.to_string(),
            ..Default::default()
        }
    }

    /// numeric id, 0..=3 for regular units, 128.. for AMS HT
    pub fn index(&self) -> Option<i64> {
        self.ams_id.parse().ok()
    }

    pub fn series(&self) -> AmsSeries {
        resolve_ams_series(self.model)
    }

    pub fn is_ams_lite(&self) -> bool {
        self.model == AmsModel::AmsLite || self.lite_humidity_sentinel
    }

    pub fn feeds(&self) -> ExtruderSide {
        self.flags.assigned_extruder
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TrayState {
    pub tray_type: Option<String>,
    pub sub_brand: Option<String>,
    pub color: Option<String>,
    pub remain: Option<i64>,
    pub k: Option<f64>,
    pub nozzle_temp_min: Option<i64>,
    pub nozzle_temp_max: Option<i64>,
}

/// Replaced wholesale whenever the device sends the extruder list
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ExtruderState {
    pub id: i64,
    pub temp: f64,
    pub target: f64,
    pub info_raw: u32,
    pub stat_raw: u32,
    pub info: ExtruderInfoState,
    pub status: ExtruderStatus,
    pub slot_now: Option<i64>,
    pub slot_prev: Option<i64>,
    pub slot_target: Option<i64>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct XcamState {
    pub first_layer_inspector: Option<bool>,
    pub spaghetti_detector: Option<bool>,
    pub buildplate_marker_detector: Option<bool>,
    pub printing_monitor: Option<bool>,
    pub print_halt: Option<bool>,
    pub halt_print_sensitivity: Option<String>,
    pub allow_skip_parts: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemCommandResult {
    pub command: String,
    pub result: Option<String>,
}
