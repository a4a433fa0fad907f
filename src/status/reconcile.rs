//! Folds one report from the printer into the previous snapshot.
//!
//! `reduce` is total: unknown categories leave the snapshot as it was, fields
//! that fail to coerce keep their previous value, and nothing here returns an
//! error. Derived values (active tool, active tray, displayed nozzle
//! temperature, combined HMS message) are recomputed on every pass from the
//! merged raw fields.

use tracing::{debug, error, info, trace, warn};

use std::collections::BTreeSet;

use crate::conn_manager::conn_bambu::message::{
    AmsReport, AmsUnitReport, Device, ExtruderInfo, HmsEntry, InfoData, LightReport, Message,
    PrintData, Scalar, SystemData, TrayReport, XcamData,
};

use super::{
    bambu_status::{
        AmsUnitState, ExtruderState, PrinterSnapshot, SystemCommandResult, TrayState, XcamState,
    },
    decode::{
        ams_model_from_module, decode_ams_info_bits, decode_ams_status, decode_extruder_info,
        decode_extruder_status, is_external_spool, resolve_ams_model, resolve_printer_model,
        resolve_tray, scale_fan_speed, stage_name, unpack_extruder_slot, unpack_temperature,
        AmsModel, ExtruderSide, ExtruderStatus, PrinterModel,
    },
    hms::{decode_hms_error_code, decode_print_error, HmsError},
    PrinterState,
};

/// AMS Lite has no humidity sensor and reports an empty humidity level
pub const AMS_LITE_HUMIDITY_SENTINEL: &str = "";

/// airduct part ids that mirror a fan zone
const DUCT_PART_COOLING: i64 = 16;
const DUCT_PART_AUX: i64 = 32;
const DUCT_PART_CHAMBER: i64 = 48;

pub fn reduce(prev: &PrinterSnapshot, message: &Message) -> PrinterSnapshot {
    let report = match message {
        Message::Report(report) => report,
        Message::Unknown(raw) => {
            debug!(
                "ignoring unrecognised message: {}",
                raw.as_deref().map(|s| truncate(s, 120)).unwrap_or("<empty>")
            );
            return prev.clone();
        }
    };

    if report.is_empty() {
        debug!("report carries no known category");
        return prev.clone();
    }

    let mut next = prev.clone();
    let mut tool_select = None;

    if let Some(print) = &report.print {
        tool_select = apply_print(&mut next, print);
    }
    if let Some(info) = &report.info {
        apply_info(&mut next, info);
    }
    if let Some(system) = &report.system {
        apply_system(&mut next, system);
    }
    if let Some(xcam) = &report.xcam {
        apply_xcam(&mut next.xcam, xcam);
    }

    derive(&mut next, tool_select);
    next
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// MARK: coercion

fn coerce<T>(field: &str, value: &Option<Scalar>, f: impl Fn(&Scalar) -> Option<T>) -> Option<T> {
    let value = value.as_ref()?;
    let out = f(value);
    if out.is_none() {
        warn!("could not coerce {} = {:?}, keeping previous value", field, value);
    }
    out
}

fn int(field: &str, value: &Option<Scalar>) -> Option<i64> {
    coerce(field, value, Scalar::as_i64)
}

fn float(field: &str, value: &Option<Scalar>) -> Option<f64> {
    coerce(field, value, Scalar::as_f64)
}

fn hex(field: &str, value: &Option<Scalar>) -> Option<u64> {
    coerce(field, value, Scalar::as_hex)
}

fn text(field: &str, value: &Option<Scalar>) -> Option<String> {
    coerce(field, value, Scalar::as_text)
}

fn flag(field: &str, value: &Option<Scalar>) -> Option<bool> {
    coerce(field, value, Scalar::as_bool)
}

/// `merge!(dst, int, src, field)`: overwrite `dst` only when `src.field` is present and coerces
macro_rules! merge {
    ($dst:expr, $coerce:ident, $src:expr, $field:ident) => {
        if let Some(v) = $coerce(stringify!($field), &$src.$field) {
            $dst = Some(v);
        }
    };
}

/// MARK: print

/// Returns the extruder named by a `select_extruder` echo, if any
fn apply_print(s: &mut PrinterSnapshot, p: &PrintData) -> Option<i64> {
    merge!(s.gcode_state, text, p, gcode_state);
    merge!(s.print_stage, int, p, mc_print_stage);
    if let Some(stage) = int("stg_cur", &p.stg_cur) {
        s.stage_id = Some(stage);
        s.stage_name = Some(stage_name(stage));
    }
    merge!(s.percent, int, p, mc_percent);
    merge!(s.remaining_minutes, int, p, mc_remaining_time);
    merge!(s.layer_num, int, p, layer_num);
    merge!(s.total_layer_num, int, p, total_layer_num);
    merge!(s.gcode_file, text, p, gcode_file);
    merge!(s.subtask_name, text, p, subtask_name);
    merge!(s.speed_level, int, p, spd_lvl);
    merge!(s.wifi_signal, text, p, wifi_signal);
    if let Some(code) = int("print_error", &p.print_error) {
        s.print_error = Some(code);
        s.print_error_message = decode_print_error(code);
    }

    merge!(s.flat_nozzle_temp, float, p, nozzle_temper);
    merge!(s.flat_nozzle_target, float, p, nozzle_target_temper);
    merge!(s.bed_temp, float, p, bed_temper);
    merge!(s.bed_target, float, p, bed_target_temper);
    merge!(s.chamber_temp, float, p, chamber_temper);

    apply_fans(s, p);

    if let Some(status) = int("ams_status", &p.ams_status) {
        s.ams_status = Some(status);
        s.ams_state = decode_ams_status(status);
    }
    if let Some(ams) = &p.ams {
        apply_ams(s, ams);
    }
    if let Some(device) = &p.device {
        apply_device(s, device);
    }
    if let Some(hms) = &p.hms {
        s.hms = decode_hms_list(hms);
    }
    if let Some(tray) = &p.vt_tray {
        apply_virtual_tray(s, tray);
    }
    if let Some(slots) = &p.vir_slot {
        for tray in slots {
            apply_virtual_tray(s, tray);
        }
    }
    if let Some(lights) = &p.lights_report {
        apply_lights(s, lights);
    }
    if let Some(xcam) = &p.xcam {
        apply_xcam(&mut s.xcam, xcam);
    }

    match text("command", &p.command).as_deref() {
        Some("select_extruder") => int("extruder_index", &p.extruder_index),
        _ => None,
    }
}

fn apply_fans(s: &mut PrinterSnapshot, p: &PrintData) {
    if let Some(raw) = int("cooling_fan_speed", &p.cooling_fan_speed) {
        s.fans.part_cooling = Some(scale_fan_speed(raw));
    }
    if let Some(raw) = int("big_fan1_speed", &p.big_fan1_speed) {
        s.fans.aux = Some(scale_fan_speed(raw));
    }
    if let Some(raw) = int("big_fan2_speed", &p.big_fan2_speed) {
        s.fans.chamber = Some(scale_fan_speed(raw));
    }
    if let Some(raw) = int("heatbreak_fan_speed", &p.heatbreak_fan_speed) {
        s.fans.heatbreak = Some(scale_fan_speed(raw));
    }
}

fn decode_hms_list(entries: &[HmsEntry]) -> Vec<HmsError> {
    entries
        .iter()
        .filter_map(|e| {
            let attr = int("hms.attr", &e.attr)?;
            let code = int("hms.code", &e.code)?;
            Some(decode_hms_error_code(attr as u32, code as u32))
        })
        .collect()
}

fn set_light(s: &mut PrinterSnapshot, node: &str, mode: &str) {
    let on = matches!(mode, "on" | "flashing");
    match node {
        "chamber_light" | "chamber_light2" => s.chamber_light = Some(on),
        "work_light" => s.work_light = Some(on),
        other => trace!("ignoring light node {}", other),
    }
}

fn apply_lights(s: &mut PrinterSnapshot, lights: &[LightReport]) {
    for light in lights {
        if let (Some(node), Some(mode)) = (text("node", &light.node), text("mode", &light.mode)) {
            set_light(s, &node, &mode);
        }
    }
}

/// MARK: AMS

fn tray_mask(bits: u64) -> [bool; 4] {
    [
        bits & 0x1 != 0,
        bits & 0x2 != 0,
        bits & 0x4 != 0,
        bits & 0x8 != 0,
    ]
}

fn upsert_unit<'a>(units: &'a mut Vec<AmsUnitState>, ams_id: &str) -> &'a mut AmsUnitState {
    let idx = match units.iter().position(|u| u.ams_id == ams_id) {
        Some(idx) => idx,
        None => {
            debug!("new AMS unit: {}", ams_id);
            units.push(AmsUnitState::new(ams_id));
            units.len() - 1
        }
    };
    &mut units[idx]
}

fn apply_ams(s: &mut PrinterSnapshot, ams: &AmsReport) {
    merge!(s.ams_version, int, ams, version);
    merge!(s.ams_exist_bits, hex, ams, ams_exist_bits);
    merge!(s.tray_now, int, ams, tray_now);
    merge!(s.tray_pre, int, ams, tray_pre);
    merge!(s.tray_tar, int, ams, tray_tar);

    let root_bits = hex("tray_exist_bits", &ams.tray_exist_bits);
    if let Some(bits) = root_bits {
        s.tray_exist_bits = Some(bits);
    }

    let mut own_mask = BTreeSet::new();
    if let Some(units) = &ams.ams {
        for report in units {
            let Some(ams_id) = text("ams.id", &report.id) else {
                warn!("AMS unit without id, skipping");
                continue;
            };
            let unit = upsert_unit(&mut s.ams_units, &ams_id);
            merge_unit(unit, report);
            if let Some(mask) = hex("ams.tray_exist_bits", &report.tray_exist_bits) {
                unit.tray_exists = tray_mask(mask);
                own_mask.insert(ams_id);
            }
        }
    }

    // 4 bits per unit, unit 0 in the lowest nibble
    if let Some(bits) = root_bits {
        for unit in s.ams_units.iter_mut() {
            if own_mask.contains(&unit.ams_id) {
                continue;
            }
            if let Some(idx @ 0..=15) = unit.index() {
                unit.tray_exists = tray_mask(bits >> (idx as u32 * 4));
            }
        }
    }
}

fn merge_unit(unit: &mut AmsUnitState, r: &AmsUnitReport) {
    if let Some(info) = hex("ams.info", &r.info) {
        let info = info as u32;
        unit.info_raw = Some(info);
        unit.flags = decode_ams_info_bits(info);
    }
    merge!(unit.temp, float, r, temp);
    if let Some(humidity) = text("humidity", &r.humidity) {
        unit.lite_humidity_sentinel = humidity == AMS_LITE_HUMIDITY_SENTINEL;
        unit.humidity = Some(humidity);
    }
    merge!(unit.humidity_raw, int, r, humidity_raw);
    merge!(unit.dry_time, int, r, dry_time);

    if let Some(trays) = &r.tray {
        for tray in trays {
            let Some(id) = int("tray.id", &tray.id) else {
                continue;
            };
            merge_tray(unit.trays.entry(id).or_default(), tray);
        }
    }
}

fn merge_tray(t: &mut TrayState, r: &TrayReport) {
    merge!(t.tray_type, text, r, tray_type);
    merge!(t.sub_brand, text, r, tray_sub_brands);
    merge!(t.color, text, r, tray_color);
    merge!(t.remain, int, r, remain);
    merge!(t.k, float, r, k);
    merge!(t.nozzle_temp_min, int, r, nozzle_temp_min);
    merge!(t.nozzle_temp_max, int, r, nozzle_temp_max);
}

fn apply_virtual_tray(s: &mut PrinterSnapshot, tray: &TrayReport) {
    let Some(id) = int("vt_tray.id", &tray.id) else {
        warn!("external spool without id, skipping");
        return;
    };
    if !is_external_spool(id) {
        warn!("unexpected external spool id: {}", id);
    }
    s.virtual_trays.insert(id);
    merge_tray(s.external_spools.entry(id).or_default(), tray);
}

/// MARK: device

fn apply_device(s: &mut PrinterSnapshot, d: &Device) {
    if let Some(packed) = int("device.bed_temp", &d.bed_temp) {
        let (actual, target) = unpack_temperature(packed as u32);
        s.bed_temp = Some(actual as f64);
        s.bed_target = Some(target as f64);
    }
    if let Some(packed) = int("device.cham_temp", &d.cham_temp) {
        let (actual, target) = unpack_temperature(packed as u32);
        s.chamber_temp = Some(actual as f64);
        s.chamber_target = Some(target as f64);
    }

    if let Some(duct) = &d.airduct {
        if !s.has_duct {
            debug!("airduct data seen, printer has ducts");
        }
        s.has_duct = true;
        merge!(s.duct.mode, int, duct, mode_cur);
        for part in duct.parts.iter().flatten() {
            let Some(id) = int("airduct.id", &part.id) else {
                continue;
            };
            let entry = s.duct.parts.entry(id).or_default();
            merge!(entry.func, int, part, func);
            merge!(entry.range, int, part, range);
            let Some(state) = int("airduct.state", &part.state) else {
                continue;
            };
            entry.state = Some(state);
            let pct = Some(state.clamp(0, 100) as u8);
            match id {
                DUCT_PART_COOLING => s.fans.part_cooling = pct,
                DUCT_PART_AUX => s.fans.aux = pct,
                DUCT_PART_CHAMBER => s.fans.chamber = pct,
                _ => {}
            }
        }
    }

    if let Some(extruder) = &d.extruder {
        merge!(s.toolhead_state, int, extruder, state);
        // always the full list
        if let Some(info) = &extruder.info {
            let mut extruders: Vec<ExtruderState> = info
                .iter()
                .filter_map(|e| decode_extruder(e, &s.extruders))
                .collect();
            extruders.sort_by_key(|e| e.id);
            s.extruder_assignment = extruders
                .iter()
                .filter_map(|e| e.slot_now.map(|slot| (e.id, slot)))
                .collect();
            s.extruders = extruders;
        }
    }
}

/// Missing or uncoercible fields keep the value of the same extruder in `prev`
fn decode_extruder(info: &ExtruderInfo, prev: &[ExtruderState]) -> Option<ExtruderState> {
    let Some(id) = int("extruder.id", &info.id) else {
        warn!("extruder entry without id, skipping");
        return None;
    };
    let old = prev.iter().find(|e| e.id == id);

    let (temp, target) = match int("extruder.temp", &info.temp) {
        Some(packed) => {
            let (temp, target) = unpack_temperature(packed as u32);
            (temp as f64, target as f64)
        }
        None => old.map(|e| (e.temp, e.target)).unwrap_or((0., 0.)),
    };
    let info_raw = int("extruder.info", &info.info)
        .map(|v| v as u32)
        .or(old.map(|e| e.info_raw))
        .unwrap_or(0);
    let stat_raw = int("extruder.stat", &info.stat)
        .map(|v| v as u32)
        .or(old.map(|e| e.stat_raw))
        .unwrap_or(0);

    let slot = |field: &str, value: &Option<Scalar>, keep: fn(&ExtruderState) -> Option<i64>| {
        match int(field, value) {
            Some(packed) => unpack_extruder_slot(packed),
            None => old.and_then(keep),
        }
    };

    Some(ExtruderState {
        id,
        temp,
        target,
        info_raw,
        stat_raw,
        info: decode_extruder_info(info_raw),
        status: decode_extruder_status(stat_raw),
        slot_now: slot("snow", &info.snow, |e| e.slot_now),
        slot_prev: slot("spre", &info.spre, |e| e.slot_prev),
        slot_target: slot("star", &info.star, |e| e.slot_target),
    })
}

/// MARK: info, system, xcam

fn apply_info(s: &mut PrinterSnapshot, info: &InfoData) {
    let Some(modules) = &info.module else {
        trace!("info report without modules");
        return;
    };
    for module in modules {
        let Some(name) = text("module.name", &module.name) else {
            continue;
        };
        let sn = text("module.sn", &module.sn);
        let sw_ver = text("module.sw_ver", &module.sw_ver);
        let hw_ver = text("module.hw_ver", &module.hw_ver);

        if name == "ota" {
            if sw_ver.is_some() {
                s.firmware_version = sw_ver;
            }
            if let Some(sn) = sn {
                let model = resolve_printer_model(&sn);
                if model != PrinterModel::Unknown {
                    s.printer_model = model;
                }
                s.serial = Some(sn);
            }
            continue;
        }

        let Some((kind, ams_id)) = name.split_once('/') else {
            trace!("ignoring module {}", name);
            continue;
        };
        if !matches!(kind, "ams" | "ams_f1" | "n3f" | "n3s") {
            trace!("ignoring module {}", name);
            continue;
        }

        let unit = upsert_unit(&mut s.ams_units, ams_id);
        let by_module = ams_model_from_module(kind, hw_ver.as_deref());
        let by_serial = sn.as_deref().map(resolve_ams_model).unwrap_or_default();
        unit.model = match (by_module, by_serial) {
            (AmsModel::AmsLite, _) => AmsModel::AmsLite,
            (m, AmsModel::Unknown) => m,
            (_, m) => m,
        };
        if sn.is_some() {
            unit.serial = sn;
        }
        if sw_ver.is_some() {
            unit.firmware_version = sw_ver;
        }
        if hw_ver.is_some() {
            unit.hw_version = hw_ver;
        }
    }
}

fn apply_system(s: &mut PrinterSnapshot, sys: &SystemData) {
    let Some(command) = text("system.command", &sys.command) else {
        trace!("system report without command");
        return;
    };
    if command == "ledctrl" {
        if let (Some(node), Some(mode)) = (text("led_node", &sys.led_node), text("led_mode", &sys.led_mode)) {
            set_light(s, &node, &mode);
        }
    }
    s.last_system_command = Some(SystemCommandResult {
        command,
        result: text("system.result", &sys.result),
    });
}

fn apply_xcam(x: &mut XcamState, d: &XcamData) {
    merge!(x.first_layer_inspector, flag, d, first_layer_inspector);
    merge!(x.spaghetti_detector, flag, d, spaghetti_detector);
    merge!(x.buildplate_marker_detector, flag, d, buildplate_marker_detector);
    merge!(x.printing_monitor, flag, d, printing_monitor);
    merge!(x.print_halt, flag, d, print_halt);
    merge!(x.allow_skip_parts, flag, d, allow_skip_parts);
    merge!(x.halt_print_sensitivity, text, d, halt_print_sensitivity);

    // xcam_control_set names one detector
    let Some(module) = text("module_name", &d.module_name) else {
        return;
    };
    let Some(enabled) = flag("control", &d.control).or_else(|| flag("enable", &d.enable)) else {
        return;
    };
    match module.as_str() {
        "first_layer_inspector" => x.first_layer_inspector = Some(enabled),
        "spaghetti_detector" => x.spaghetti_detector = Some(enabled),
        "buildplate_marker_detector" => x.buildplate_marker_detector = Some(enabled),
        "printing_monitor" => x.printing_monitor = Some(enabled),
        other => debug!("unknown xcam module: {}", other),
    }
}

/// MARK: derived values

fn derive(s: &mut PrinterSnapshot, tool_select: Option<i64>) {
    if let Some(gcode_state) = &s.gcode_state {
        s.state = PrinterState::from_gcode_state(gcode_state, s.print_error);
    }

    s.active_tool = resolve_active_tool(s, tool_select);

    let multi = s.is_multi_extruder();
    let side = s.active_tool;
    let has_ams = side_has_ams(s, side);
    s.active_tray = s
        .tray_now
        .and_then(|raw| resolve_tray(raw, side, has_ams, multi));
    s.target_tray = s
        .tray_tar
        .and_then(|raw| resolve_tray(raw, side, has_ams, multi));
    s.is_external_spool_active = s.active_tray.is_some_and(is_external_spool);

    match s.extruder(side.id()).map(|e| (e.temp, e.target)) {
        Some((temp, target)) => {
            s.nozzle_temp = Some(temp);
            s.nozzle_target = Some(target);
        }
        None => {
            s.nozzle_temp = s.flat_nozzle_temp;
            s.nozzle_target = s.flat_nozzle_target;
        }
    }

    s.hms_message = s
        .hms
        .iter()
        .map(|h| h.message.as_str())
        .collect::<Vec<_>>()
        .join(" ");
}

/// Engaged extruder, then an explicit selection, then the toolhead bitmask while a
/// job runs, otherwise whatever was active before.
fn resolve_active_tool(s: &PrinterSnapshot, tool_select: Option<i64>) -> ExtruderSide {
    let engaged = s
        .extruders
        .iter()
        .find(|e| e.status == ExtruderStatus::Active)
        .map(|e| e.id);

    let from_toolhead = || {
        let job_idle = matches!(
            s.gcode_state.as_deref(),
            None | Some("IDLE") | Some("FINISH") | Some("READY")
        );
        if job_idle {
            None
        } else {
            s.toolhead_state.map(|state| (state >> 4) & 0xF)
        }
    };

    let Some(id) = engaged.or(tool_select).or_else(from_toolhead) else {
        return s.active_tool;
    };

    ExtruderSide::from_id(id).unwrap_or_else(|| {
        warn!("active tool id {} out of range, using the right extruder", id);
        ExtruderSide::default()
    })
}

fn side_has_ams(s: &PrinterSnapshot, side: ExtruderSide) -> bool {
    // units not listed yet, only the presence mask is known; units 0..=3 feed the main extruder
    if s.ams_units.is_empty() {
        return side == ExtruderSide::Right && s.ams_exist_bits.is_some_and(|bits| bits & 0xF != 0);
    }
    s.ams_units
        .iter()
        .filter(|u| u.feeds() == side)
        .any(|u| match (s.ams_exist_bits, u.index()) {
            (Some(bits), Some(idx @ 0..=15)) => (bits >> idx) & 1 == 1,
            _ => true,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conn_manager::conn_bambu::parse::parse_payload,
        status::decode::{AmsState, ExtruderInfoState, EXTERNAL_SPOOL_LEFT, EXTERNAL_SPOOL_RIGHT},
    };

    fn apply(prev: &PrinterSnapshot, json: &str) -> PrinterSnapshot {
        reduce(prev, &parse_payload(json.as_bytes()))
    }

    const H2D_DEVICE: &str = r#"{"print": {
        "gcode_state": "RUNNING",
        "ams": {"ams": [{"id": "0", "info": "1003", "humidity": "4", "temp": "24.5",
                          "tray": [{"id": "0", "tray_type": "PLA", "tray_color": "FF0000FF"}]}],
                "ams_exist_bits": "1", "tray_exist_bits": "f", "tray_now": "0", "tray_tar": "255"},
        "device": {"extruder": {"state": 2, "info": [
            {"id": 0, "temp": 13107420, "info": 14, "stat": 0, "snow": 1},
            {"id": 1, "temp": 14418140, "info": 8, "stat": 256, "snow": 65024}
        ]}}
    }}"#;

    #[test]
    fn test_additive_merge() {
        let base = apply(&PrinterSnapshot::default(), r#"{"print": {"bed_temper": 60}}"#);
        assert_eq!(base.bed_temp, Some(60.0));

        let next = apply(&base, r#"{"print": {"nozzle_temper": 210}}"#);
        assert_eq!(next.bed_temp, Some(60.0));
        assert_eq!(next.nozzle_temp, Some(210.0));
        assert_eq!(next.flat_nozzle_temp, Some(210.0));
        assert_eq!(base.nozzle_temp, None);
    }

    #[test]
    fn test_idempotent() {
        let msg = parse_payload(H2D_DEVICE.as_bytes());
        let once = reduce(&PrinterSnapshot::default(), &msg);
        let twice = reduce(&once, &msg);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unknown_category_is_ignored() {
        let base = apply(&PrinterSnapshot::default(), r#"{"print": {"bed_temper": 60}}"#);
        let next = apply(&base, r#"{"upgrade": {"status": "idle"}}"#);
        assert_eq!(base, next);
        let next = apply(&base, "garbage");
        assert_eq!(base, next);
    }

    #[test]
    fn test_bad_string_keeps_previous_value() {
        let base = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"mc_percent": "42", "layer_num": 3}}"#,
        );
        assert_eq!(base.percent, Some(42));
        let next = apply(&base, r#"{"print": {"mc_percent": "lots", "layer_num": "4"}}"#);
        assert_eq!(next.percent, Some(42));
        assert_eq!(next.layer_num, Some(4));
    }

    #[test]
    fn test_stage_and_state() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"gcode_state": "PREPARE", "stg_cur": 2, "mc_remaining_time": 75}}"#,
        );
        assert_eq!(s.state, PrinterState::Printing);
        assert_eq!(s.stage_name.as_deref(), Some("Heatbed Preheating"));
        assert_eq!(s.time_remaining(), Some(chrono::Duration::minutes(75)));

        let s = apply(&s, r#"{"print": {"stg_cur": 77}}"#);
        assert_eq!(s.stage_name.as_deref(), Some("Stage [77]"));
    }

    #[test]
    fn test_ams_units_merge_by_id() {
        let s = apply(&PrinterSnapshot::default(), H2D_DEVICE);
        assert_eq!(s.ams_units.len(), 1);
        let unit = s.ams_unit("0").unwrap();
        assert_eq!(unit.tray_exists, [true; 4]);
        assert_eq!(unit.temp, Some(24.5));
        assert_eq!(unit.trays[&0].tray_type.as_deref(), Some("PLA"));

        let s = apply(
            &s,
            r#"{"print": {"ams": {"ams": [{"id": "0", "humidity": "2"}, {"id": "1", "info": "1103"}],
                                  "tray_exist_bits": "35"}}}"#,
        );
        assert_eq!(s.ams_units.len(), 2);
        let unit = s.ams_unit("0").unwrap();
        assert_eq!(unit.humidity.as_deref(), Some("2"));
        assert_eq!(unit.temp, Some(24.5));
        assert_eq!(unit.trays[&0].color.as_deref(), Some("FF0000FF"));
        assert_eq!(unit.tray_exists, [true, false, true, false]);
        let unit = s.ams_unit("1").unwrap();
        assert_eq!(unit.feeds(), ExtruderSide::Left);
        assert_eq!(unit.tray_exists, [true, true, false, false]);
    }

    #[test]
    fn test_per_unit_tray_mask_wins() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"ams": {"ams": [{"id": "0", "tray_exist_bits": "1"}], "tray_exist_bits": "f"}}}"#,
        );
        assert_eq!(s.ams_unit("0").unwrap().tray_exists, [true, false, false, false]);
    }

    #[test]
    fn test_extruders_replaced_and_active_tool() {
        let s = apply(&PrinterSnapshot::default(), H2D_DEVICE);
        assert_eq!(s.extruders.len(), 2);
        assert_eq!(s.active_tool, ExtruderSide::Left);
        // 14418140 = 220 | 220 << 16
        assert_eq!(s.nozzle_temp, Some(220.0));
        assert_eq!(s.nozzle_target, Some(220.0));
        assert_eq!(s.extruder_assignment.get(&0), Some(&1));
        assert_eq!(s.extruder_assignment.get(&1), Some(&254));

        let s = apply(
            &s,
            r#"{"print": {"device": {"extruder": {"info": [{"id": 0, "temp": 200, "stat": 256}]}}}}"#,
        );
        assert_eq!(s.extruders.len(), 1);
        assert_eq!(s.active_tool, ExtruderSide::Right);
        assert_eq!(s.nozzle_temp, Some(200.0));
        assert_eq!(s.nozzle_target, Some(0.0));
    }

    #[test]
    fn test_tool_fallback_only_while_printing() {
        let idle = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"gcode_state": "IDLE", "device": {"extruder": {"state": 16}}}}"#,
        );
        assert_eq!(idle.active_tool, ExtruderSide::Right);

        let running = apply(&idle, r#"{"print": {"gcode_state": "RUNNING"}}"#);
        assert_eq!(running.active_tool, ExtruderSide::Left);

        let finished = apply(
            &running,
            r#"{"print": {"gcode_state": "FINISH", "device": {"extruder": {"state": 0}}}}"#,
        );
        assert_eq!(finished.active_tool, ExtruderSide::Left);
    }

    #[test]
    fn test_explicit_selection_and_out_of_range() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"command": "select_extruder", "extruder_index": 1}}"#,
        );
        assert_eq!(s.active_tool, ExtruderSide::Left);

        let s = apply(
            &s,
            r#"{"print": {"command": "select_extruder", "extruder_index": 7}}"#,
        );
        assert_eq!(s.active_tool, ExtruderSide::Right);
    }

    #[test]
    fn test_left_side_without_ams_uses_external_spool() {
        let s = apply(&PrinterSnapshot::default(), H2D_DEVICE);
        assert_eq!(s.active_tool, ExtruderSide::Left);
        assert_eq!(s.tray_now, Some(0));
        assert_eq!(s.active_tray, Some(EXTERNAL_SPOOL_LEFT));
        assert!(s.is_external_spool_active);
        assert_eq!(s.target_tray, None);
    }

    #[test]
    fn test_active_tray_on_ams_side() {
        let s = apply(
            &PrinterSnapshot::for_serial("00M09A350100000"),
            r#"{"print": {"ams": {"ams": [{"id": "0", "info": "1003"}], "tray_now": "2"}}}"#,
        );
        assert_eq!(s.active_tray, Some(2));
        assert!(!s.is_external_spool_active);

        let s = apply(&s, r#"{"print": {"ams": {"tray_now": "254"}}}"#);
        assert_eq!(s.active_tray, Some(EXTERNAL_SPOOL_LEFT));
        assert!(s.is_external_spool_active);

        let s = apply(&s, r#"{"print": {"ams": {"tray_now": "255"}}}"#);
        assert_eq!(s.active_tray, None);
    }

    #[test]
    fn test_ams_tray_before_units_are_listed() {
        let s = apply(
            &PrinterSnapshot::for_serial("00M09A350100000"),
            r#"{"print": {"ams": {"ams_exist_bits": "1", "tray_now": "2"}}}"#,
        );
        assert!(s.ams_units.is_empty());
        assert_eq!(s.active_tray, Some(2));

        let s = apply(
            &PrinterSnapshot::for_serial("00M09A350100000"),
            r#"{"print": {"ams": {"ams_exist_bits": "0", "tray_now": "2"}}}"#,
        );
        assert_eq!(s.active_tray, Some(EXTERNAL_SPOOL_LEFT));
    }

    #[test]
    fn test_bad_extruder_fields_keep_previous_values() {
        let base = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"device": {"extruder": {"info": [
                {"id": 0, "temp": 14418140, "info": 14, "stat": 256, "snow": 1}
            ]}}}}"#,
        );
        assert_eq!(base.nozzle_temp, Some(220.0));
        assert_eq!(base.extruders[0].info, ExtruderInfoState::Loaded);
        assert_eq!(base.extruders[0].status, ExtruderStatus::Active);

        let s = apply(
            &base,
            r#"{"print": {"device": {"extruder": {"info": [
                {"id": 0, "temp": "garbage", "info": "x", "stat": "?", "snow": 1}
            ]}}}}"#,
        );
        assert_eq!(s.nozzle_temp, Some(220.0));
        assert_eq!(s.nozzle_target, Some(220.0));
        assert_eq!(s.extruders[0].info, ExtruderInfoState::Loaded);
        assert_eq!(s.extruders[0].status, ExtruderStatus::Active);
        assert_eq!(s.active_tool, ExtruderSide::Right);

        // unseen extruder has nothing to fall back on
        let s = apply(
            &base,
            r#"{"print": {"device": {"extruder": {"info": [{"id": 1, "temp": "garbage"}]}}}}"#,
        );
        assert_eq!(s.extruders[0].temp, 0.0);
        assert_eq!(s.extruders[0].status, ExtruderStatus::Idle);
    }

    #[test]
    fn test_dual_nozzle_right_external_spool() {
        let s = apply(
            &PrinterSnapshot::for_serial("0948AB000000000"),
            r#"{"print": {"ams": {"tray_now": "254"}, "vir_slot": [{"id": "254"}, {"id": "255", "tray_type": "PETG"}]}}"#,
        );
        assert_eq!(s.active_tray, Some(EXTERNAL_SPOOL_RIGHT));
        assert!(s.virtual_trays.contains(&254));
        assert!(s.virtual_trays.contains(&255));
        assert_eq!(s.external_spools[&255].tray_type.as_deref(), Some("PETG"));
    }

    #[test]
    fn test_hms_decoded_and_joined() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"hms": [{"attr": 83886592, "code": 65537}, {"attr": 1, "code": 2}]}}"#,
        );
        assert_eq!(s.hms.len(), 2);
        assert_eq!(s.hms[0].module.as_str(), "AMS");
        assert_eq!(
            s.hms_message,
            "AMS A Slot 1 filament has run out. Unknown HMS Error"
        );

        let s = apply(&s, r#"{"print": {"hms": []}}"#);
        assert!(s.hms.is_empty());
        assert_eq!(s.hms_message, "");
    }

    #[test]
    fn test_fans_and_ducts() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"cooling_fan_speed": "15", "big_fan1_speed": "8", "heatbreak_fan_speed": "0"}}"#,
        );
        assert_eq!(s.fans.part_cooling, Some(100));
        assert_eq!(s.fans.aux, Some(53));
        assert_eq!(s.fans.heatbreak, Some(0));
        assert_eq!(s.fans.chamber, None);
        assert!(!s.has_duct);

        let s = apply(
            &s,
            r#"{"print": {"device": {"airduct": {"modeCur": 1, "parts": [{"id": 48, "func": 2, "state": 70}]}}}}"#,
        );
        assert!(s.has_duct);
        assert_eq!(s.duct.mode, Some(1));
        assert_eq!(s.fans.chamber, Some(70));

        let s = apply(&s, r#"{"print": {"cooling_fan_speed": "0"}}"#);
        assert!(s.has_duct);
        assert_eq!(s.fans.part_cooling, Some(0));
    }

    #[test]
    fn test_packed_bed_temp() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"bed_temper": 20, "device": {"bed_temp": 3932220}}}"#,
        );
        // 3932220 = 60 | 60 << 16
        assert_eq!(s.bed_temp, Some(60.0));
        assert_eq!(s.bed_target, Some(60.0));
    }

    #[test]
    fn test_ams_status_decoded() {
        let s = apply(&PrinterSnapshot::default(), r#"{"print": {"ams_status": 768}}"#);
        assert_eq!(s.ams_status, Some(768));
        assert_eq!(s.ams_state, AmsState::Assist);
    }

    #[test]
    fn test_info_modules() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"info": {"command": "get_version", "module": [
                {"name": "ota", "sw_ver": "01.08.02.00", "sn": "00M09A350100000"},
                {"name": "ams/0", "sn": "006A0B123456789", "sw_ver": "00.00.06.40", "hw_ver": "AMS08"},
                {"name": "ams/1", "sn": "", "hw_ver": "AMS_F102"},
                {"name": "n3f/128", "sn": "19F0000000000"}
            ]}}"#,
        );
        assert_eq!(s.firmware_version.as_deref(), Some("01.08.02.00"));
        assert_eq!(s.printer_model, PrinterModel::X1C);
        assert_eq!(s.ams_units.len(), 3);
        assert_eq!(s.ams_unit("0").unwrap().model, AmsModel::Ams);
        assert!(s.ams_unit("1").unwrap().is_ams_lite());
        assert_eq!(s.ams_unit("128").unwrap().model, AmsModel::AmsHt);
    }

    #[test]
    fn test_ams_lite_humidity_sentinel() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"print": {"ams": {"ams": [{"id": "0", "humidity": ""}]}}}"#,
        );
        let unit = s.ams_unit("0").unwrap();
        assert!(unit.is_ams_lite());
        assert_eq!(unit.model, AmsModel::Unknown);
    }

    #[test]
    fn test_system_and_xcam() {
        let s = apply(
            &PrinterSnapshot::default(),
            r#"{"system": {"command": "ledctrl", "led_node": "chamber_light", "led_mode": "on", "result": "success"}}"#,
        );
        assert_eq!(s.chamber_light, Some(true));
        assert_eq!(
            s.last_system_command.as_ref().map(|c| c.command.as_str()),
            Some("ledctrl")
        );

        let s = apply(
            &s,
            r#"{"xcam": {"command": "xcam_control_set", "module_name": "spaghetti_detector", "control": true}}"#,
        );
        assert_eq!(s.xcam.spaghetti_detector, Some(true));
        assert_eq!(s.chamber_light, Some(true));

        let s = apply(
            &s,
            r#"{"print": {"lights_report": [{"node": "chamber_light", "mode": "off"}], "xcam": {"first_layer_inspector": false}}}"#,
        );
        assert_eq!(s.chamber_light, Some(false));
        assert_eq!(s.xcam.first_layer_inspector, Some(false));
    }
}
