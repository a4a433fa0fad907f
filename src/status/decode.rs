use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use serde::{Deserialize, Serialize};

/// MARK: stages

pub fn stage_name(id: i64) -> String {
    let name = match id {
        -1 | 255 => "Idle",
        0 => "Printing",
        1 => "Auto Bed Leveling",
        2 => "Heatbed Preheating",
        3 => "Sweeping XY Mech Mode",
        4 => "Changing Filament",
        5 => "M400 Pause",
        6 => "Paused Due To Filament Runout",
        7 => "Heating Hotend",
        8 => "Calibrating Extrusion",
        9 => "Scanning Bed Surface",
        10 => "Inspecting First Layer",
        11 => "Identifying Build Plate Type",
        12 => "Calibrating Micro Lidar",
        13 => "Homing Toolhead",
        14 => "Cleaning Nozzle Tip",
        15 => "Checking Extruder Temperature",
        16 => "Printing Was Paused By The User",
        17 => "Pause Of Front Cover Falling",
        18 => "Calibrating The Micro Lidar",
        19 => "Calibrating Extrusion Flow",
        20 => "Paused Due To Nozzle Temperature Malfunction",
        21 => "Paused Due To Heat Bed Temperature Malfunction",
        22 => "Filament Unloading",
        23 => "Skip Step Pause",
        24 => "Filament Loading",
        25 => "Motor Noise Calibration",
        26 => "Paused Due To Ams Lost",
        27 => "Paused Due To Low Speed Of The Heat Break Fan",
        28 => "Paused Due To Chamber Temperature Control",
        29 => "Cooling Chamber",
        30 => "Paused By The Gcode Inserted By User",
        31 => "Motor Noise Showoff",
        32 => "Nozzle Filament Covered Detected Pause",
        33 => "Cutter Error Pause",
        34 => "First Layer Error Pause",
        35 => "Nozzle Clog Pause",
        _ => {
            debug!("unknown print stage: {}", id);
            return format!("Stage [{}]", id);
        }
    };
    name.to_string()
}

/// MARK: fans, temps

/// Device fans report a gear in 0..=15
pub fn scale_fan_speed(raw: i64) -> u8 {
    if !(0..=15).contains(&raw) {
        warn!("fan speed out of range: {}", raw);
        return 0;
    }
    let pct = (raw as f64 / 15.0 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// low 16 bits = actual, high 16 bits = target
pub fn unpack_temperature(packed: u32) -> (u16, u16) {
    let actual = (packed & 0xFFFF) as u16;
    let target = ((packed >> 16) & 0xFFFF) as u16;
    (actual, target)
}

/// MARK: AMS info bits

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtruderSide {
    /// extruder 0, also the only extruder on single-nozzle printers
    #[default]
    Right,
    /// extruder 1
    Left,
}

impl ExtruderSide {
    pub fn id(&self) -> i64 {
        match self {
            ExtruderSide::Right => 0,
            ExtruderSide::Left => 1,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            0 => Some(ExtruderSide::Right),
            1 => Some(ExtruderSide::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmsInfoFlags {
    pub is_powered: bool,
    pub is_online: bool,
    pub rfid_ready: bool,
    pub hub_sensor_triggered: bool,
    pub circ_fan_on: bool,
    pub exhaust_fan_on: bool,
    pub humidity_sensor_ok: bool,
    pub heater_on: bool,
    pub is_rotating: bool,
    pub venting_active: bool,
    pub high_power_mode: bool,
    pub hardware_fault: bool,
    pub assigned_extruder: ExtruderSide,
}

pub fn decode_ams_info_bits(info: u32) -> AmsInfoFlags {
    let bit = |n: u32| (info >> n) & 1 == 1;
    AmsInfoFlags {
        is_powered: bit(0),
        is_online: bit(1),
        rfid_ready: bit(2),
        hub_sensor_triggered: bit(3),
        circ_fan_on: bit(4),
        exhaust_fan_on: bit(5),
        heater_on: bit(6),
        is_rotating: bit(7),
        assigned_extruder: if bit(8) {
            ExtruderSide::Left
        } else {
            ExtruderSide::Right
        },
        venting_active: bit(9),
        high_power_mode: bit(10),
        hardware_fault: bit(11),
        humidity_sensor_ok: bit(12),
    }
}

/// MARK: extruders

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtruderInfoState {
    #[default]
    NoNozzle,
    Empty,
    BufferLoaded,
    Loaded,
}

impl ExtruderInfoState {
    pub fn to_text(&self) -> &'static str {
        match self {
            ExtruderInfoState::NoNozzle => "No Nozzle",
            ExtruderInfoState::Empty => "Empty",
            ExtruderInfoState::BufferLoaded => "Buffer Loaded",
            ExtruderInfoState::Loaded => "Loaded",
        }
    }
}

const EXTRUDER_NOZZLE_PRESENT: u32 = 0x08;
const EXTRUDER_FILAMENT_AT_NOZZLE: u32 = 0x04;
const EXTRUDER_FILAMENT_IN_BUFFER: u32 = 0x02;

pub fn decode_extruder_info(info: u32) -> ExtruderInfoState {
    if info & EXTRUDER_NOZZLE_PRESENT == 0 {
        ExtruderInfoState::NoNozzle
    } else if info & EXTRUDER_FILAMENT_AT_NOZZLE != 0 {
        ExtruderInfoState::Loaded
    } else if info & EXTRUDER_FILAMENT_IN_BUFFER != 0 {
        ExtruderInfoState::BufferLoaded
    } else {
        ExtruderInfoState::Empty
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtruderStatus {
    #[default]
    Idle,
    Heating,
    Active,
}

impl ExtruderStatus {
    pub fn to_text(&self) -> &'static str {
        match self {
            ExtruderStatus::Idle => "Idle",
            ExtruderStatus::Heating => "Heating",
            ExtruderStatus::Active => "Active",
        }
    }
}

pub fn decode_extruder_status(stat: u32) -> ExtruderStatus {
    let working = (stat >> 8) & 0x3;
    if working != 0 {
        ExtruderStatus::Active
    } else if stat & 0x1 != 0 {
        ExtruderStatus::Heating
    } else {
        ExtruderStatus::Idle
    }
}

/// `snow`/`star`/`spre`: AMS id in the high byte, slot in the low byte
pub fn unpack_extruder_slot(packed: i64) -> Option<i64> {
    if packed < 0 || packed == 0xFFFF {
        return None;
    }
    let ams = (packed >> 8) & 0xFF;
    let slot = packed & 0xFF;
    match ams {
        0..=127 => Some(ams * 4 + slot),
        _ => Some(ams),
    }
}

/// MARK: AMS status

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmsState {
    /// 0
    #[default]
    Idle,
    /// 1
    FilamentChange(FilamentSwapStep),
    /// 2
    RfidIdentifying,
    /// 3
    Assist,
    /// 4
    Calibration,
    /// 0x10
    SelfCheck,
    /// 0x20
    Debug,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilamentSwapStep {
    Idling,
    HeatNozzle,
    CutFilament,
    PullBackCurrentFilament,
    PushNewFilament,
    PurgeOldFilament,
    FeedFilament,
    ConfirmExtruded,
    CheckFilamentPosition,
    Unknown(u8),
}

impl AmsState {
    pub fn to_text(&self) -> String {
        match self {
            AmsState::Idle => "Idle".to_string(),
            AmsState::FilamentChange(step) => format!("Filament Change: {:?}", step),
            AmsState::RfidIdentifying => "RFID Identifying".to_string(),
            AmsState::Assist => "Assist".to_string(),
            AmsState::Calibration => "Calibration".to_string(),
            AmsState::SelfCheck => "Self Check".to_string(),
            AmsState::Debug => "Debug".to_string(),
            AmsState::Unknown(code) => format!("Unknown [{}]", code),
        }
    }
}

pub fn decode_ams_status(raw: i64) -> AmsState {
    let main = ((raw >> 8) & 0xFF) as u8;
    let sub = (raw & 0xFF) as u8;
    match main {
        0x00 => AmsState::Idle,
        0x01 => AmsState::FilamentChange(match sub {
            0 => FilamentSwapStep::Idling,
            1 => FilamentSwapStep::HeatNozzle,
            2 => FilamentSwapStep::CutFilament,
            3 => FilamentSwapStep::PullBackCurrentFilament,
            4 => FilamentSwapStep::PushNewFilament,
            5 => FilamentSwapStep::PurgeOldFilament,
            6 => FilamentSwapStep::FeedFilament,
            7 => FilamentSwapStep::ConfirmExtruded,
            8 => FilamentSwapStep::CheckFilamentPosition,
            other => FilamentSwapStep::Unknown(other),
        }),
        0x02 => AmsState::RfidIdentifying,
        0x03 => AmsState::Assist,
        0x04 => AmsState::Calibration,
        0x10 => AmsState::SelfCheck,
        0x20 => AmsState::Debug,
        other => {
            debug!("unknown ams status: {:#x}", raw);
            AmsState::Unknown(other)
        }
    }
}

/// MARK: trays

/// nothing loaded
pub const TRAY_UNLOADED: i64 = 255;
/// external spool feeding the left extruder, or the only external spool
pub const EXTERNAL_SPOOL_LEFT: i64 = 254;
/// external spool feeding the right extruder on dual-nozzle printers
pub const EXTERNAL_SPOOL_RIGHT: i64 = 255;

pub fn is_external_spool(tray: i64) -> bool {
    matches!(tray, EXTERNAL_SPOOL_LEFT | EXTERNAL_SPOOL_RIGHT)
}

pub fn external_spool_for(side: ExtruderSide, multi_extruder: bool) -> i64 {
    match (multi_extruder, side) {
        (false, _) => EXTERNAL_SPOOL_LEFT,
        (true, ExtruderSide::Left) => EXTERNAL_SPOOL_LEFT,
        (true, ExtruderSide::Right) => EXTERNAL_SPOOL_RIGHT,
    }
}

/// Maps a raw tray index from the device onto a tray id.
///
/// Index 0..127 is an AMS tray (`ams_id * 4 + slot`), 128..=253 an AMS HT unit,
/// 254 the external spool and 255 nothing. A side without any AMS can only be fed
/// from its external spool, so whatever index it reports is the external spool.
pub fn resolve_tray(
    raw: i64,
    side: ExtruderSide,
    side_has_ams: bool,
    multi_extruder: bool,
) -> Option<i64> {
    match raw {
        TRAY_UNLOADED => None,
        EXTERNAL_SPOOL_LEFT => Some(external_spool_for(side, multi_extruder)),
        0..=253 if !side_has_ams => Some(external_spool_for(side, multi_extruder)),
        0..=253 => Some(raw),
        _ => {
            warn!("tray index out of range: {}", raw);
            None
        }
    }
}

/// MARK: models

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterModel {
    X1,
    X1C,
    X1E,
    P1P,
    P1S,
    A1,
    A1Mini,
    H2D,
    #[default]
    Unknown,
}

impl PrinterModel {
    pub fn is_multi_extruder(&self) -> bool {
        matches!(self, PrinterModel::H2D)
    }
}

pub fn resolve_printer_model(serial: &str) -> PrinterModel {
    const PREFIXES: &[(&str, PrinterModel)] = &[
        ("00M", PrinterModel::X1C),
        ("00W", PrinterModel::X1),
        ("03W", PrinterModel::X1E),
        ("01S", PrinterModel::P1P),
        ("01P", PrinterModel::P1S),
        ("030", PrinterModel::A1Mini),
        ("039", PrinterModel::A1),
        ("094", PrinterModel::H2D),
    ];
    PREFIXES
        .iter()
        .find(|(prefix, _)| serial.starts_with(prefix))
        .map(|(_, model)| *model)
        .unwrap_or_else(|| {
            debug!("unknown printer serial prefix: {:?}", serial.get(..3));
            PrinterModel::Unknown
        })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmsModel {
    Ams,
    AmsLite,
    Ams2Pro,
    AmsHt,
    #[default]
    Unknown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmsSeries {
    Gen1,
    Gen2,
    #[default]
    Unknown,
}

pub fn resolve_ams_model(serial: &str) -> AmsModel {
    const PREFIXES: &[(&str, AmsModel)] = &[
        ("006", AmsModel::Ams),
        ("03C", AmsModel::AmsLite),
        ("19C", AmsModel::Ams2Pro),
        ("19F", AmsModel::AmsHt),
    ];
    PREFIXES
        .iter()
        .find(|(prefix, _)| serial.starts_with(prefix))
        .map(|(_, model)| *model)
        .unwrap_or(AmsModel::Unknown)
}

pub fn resolve_ams_series(model: AmsModel) -> AmsSeries {
    match model {
        AmsModel::Ams | AmsModel::AmsLite => AmsSeries::Gen1,
        AmsModel::Ams2Pro | AmsModel::AmsHt => AmsSeries::Gen2,
        AmsModel::Unknown => AmsSeries::Unknown,
    }
}

/// Module names in `get_version` replies, used when the serial prefix is unknown
pub fn ams_model_from_module(name: &str, hw_ver: Option<&str>) -> AmsModel {
    if hw_ver.is_some_and(|hw| hw.starts_with("AMS_F1")) {
        return AmsModel::AmsLite;
    }
    match name {
        "ams" => AmsModel::Ams,
        "ams_f1" => AmsModel::AmsLite,
        "n3f" => AmsModel::AmsHt,
        "n3s" => AmsModel::Ams2Pro,
        _ => AmsModel::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(stage_name(0), "Printing");
        assert_eq!(stage_name(14), "Cleaning Nozzle Tip");
        assert_eq!(stage_name(255), "Idle");
        assert_eq!(stage_name(99), "Stage [99]");
    }

    #[test]
    fn test_fan_scaling() {
        assert_eq!(scale_fan_speed(15), 100);
        assert_eq!(scale_fan_speed(0), 0);
        assert_eq!(scale_fan_speed(8), 53);
        assert_eq!(scale_fan_speed(16), 0);
        assert_eq!(scale_fan_speed(-3), 0);
    }

    #[test]
    fn test_unpack_temperature() {
        for (actual, target) in [(0u32, 0u32), (220, 250), (65535, 65535), (25, 0), (0, 300)] {
            assert_eq!(
                unpack_temperature(actual | (target << 16)),
                (actual as u16, target as u16)
            );
        }
    }

    #[test]
    fn test_ams_info_sides() {
        // 1003 right side AMS 2, 1103 left side
        let right = decode_ams_info_bits(0x1003);
        assert!(right.is_powered);
        assert!(right.is_online);
        assert!(right.humidity_sensor_ok);
        assert!(!right.hardware_fault);
        assert_eq!(right.assigned_extruder, ExtruderSide::Right);

        let left = decode_ams_info_bits(0x1103);
        assert_eq!(left.assigned_extruder, ExtruderSide::Left);
    }

    #[test]
    fn test_bit_decoders_are_total() {
        for info in [0u32, 1, 0xFF, 0x1234_5678, u32::MAX] {
            let _ = decode_ams_info_bits(info);
            let _ = decode_extruder_info(info);
            let _ = decode_extruder_status(info);
        }
    }

    #[test]
    fn test_extruder_info_order() {
        assert_eq!(decode_extruder_info(0x06), ExtruderInfoState::NoNozzle);
        assert_eq!(decode_extruder_info(0x08), ExtruderInfoState::Empty);
        assert_eq!(decode_extruder_info(0x0A), ExtruderInfoState::BufferLoaded);
        assert_eq!(decode_extruder_info(0x0E), ExtruderInfoState::Loaded);
    }

    #[test]
    fn test_extruder_status_priority() {
        assert_eq!(decode_extruder_status(0x0), ExtruderStatus::Idle);
        assert_eq!(decode_extruder_status(0x1), ExtruderStatus::Heating);
        assert_eq!(decode_extruder_status(0x101), ExtruderStatus::Active);
        assert_eq!(decode_extruder_status(0x200), ExtruderStatus::Active);
    }

    #[test]
    fn test_ams_status() {
        assert_eq!(decode_ams_status(0), AmsState::Idle);
        assert_eq!(
            decode_ams_status(0x0102),
            AmsState::FilamentChange(FilamentSwapStep::CutFilament)
        );
        assert_eq!(decode_ams_status(0x1000), AmsState::SelfCheck);
        assert_eq!(decode_ams_status(0x7700), AmsState::Unknown(0x77));
    }

    #[test]
    fn test_resolve_tray() {
        assert_eq!(resolve_tray(255, ExtruderSide::Right, true, false), None);
        assert_eq!(resolve_tray(5, ExtruderSide::Right, true, false), Some(5));
        assert_eq!(
            resolve_tray(0, ExtruderSide::Left, false, true),
            Some(EXTERNAL_SPOOL_LEFT)
        );
        assert_eq!(
            resolve_tray(254, ExtruderSide::Right, true, true),
            Some(EXTERNAL_SPOOL_RIGHT)
        );
        assert_eq!(
            resolve_tray(254, ExtruderSide::Right, false, false),
            Some(EXTERNAL_SPOOL_LEFT)
        );
    }

    #[test]
    fn test_extruder_slot() {
        assert_eq!(unpack_extruder_slot(0x0102), Some(6));
        assert_eq!(unpack_extruder_slot(0x8000), Some(128));
        assert_eq!(unpack_extruder_slot(0xFE00), Some(254));
        assert_eq!(unpack_extruder_slot(0xFFFF), None);
    }

    #[test]
    fn test_models() {
        assert_eq!(resolve_printer_model("00M09A350100000"), PrinterModel::X1C);
        assert_eq!(resolve_printer_model("0948AB000000000"), PrinterModel::H2D);
        assert_eq!(resolve_printer_model("ZZZ"), PrinterModel::Unknown);
        assert_eq!(resolve_ams_model("03C12A000000000"), AmsModel::AmsLite);
        assert_eq!(resolve_ams_series(AmsModel::AmsHt), AmsSeries::Gen2);
        assert_eq!(resolve_ams_series(AmsModel::Unknown), AmsSeries::Unknown);
        assert_eq!(
            ams_model_from_module("ams", Some("AMS_F102")),
            AmsModel::AmsLite
        );
    }
}
