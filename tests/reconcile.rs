use bambu_watcher::{
    conn_manager::conn_bambu::parse::parse_payload,
    reduce,
    status::{
        decode::{AmsModel, AmsSeries, ExtruderSide, ExtruderStatus, PrinterModel},
        hms::HmsSeverity,
        PrinterState,
    },
    PrinterSnapshot,
};

const SERIAL: &str = "00M09A350100000";

/// trimmed from a real X1C pushall
const PUSHALL: &str = r#"{
  "print": {
    "command": "push_status",
    "sequence_id": "2021",
    "gcode_state": "RUNNING",
    "mc_print_stage": "2",
    "stg_cur": 0,
    "mc_percent": 37,
    "mc_remaining_time": 84,
    "layer_num": 41,
    "total_layer_num": 250,
    "gcode_file": "/data/Metadata/plate_1.gcode",
    "subtask_name": "benchy",
    "spd_lvl": 2,
    "wifi_signal": "-52dBm",
    "print_error": 0,
    "nozzle_temper": 219.8,
    "nozzle_target_temper": 220,
    "bed_temper": 54.9,
    "bed_target_temper": 55,
    "chamber_temper": 31,
    "cooling_fan_speed": "15",
    "big_fan1_speed": "0",
    "big_fan2_speed": "10",
    "heatbreak_fan_speed": "15",
    "ams_status": 0,
    "ams": {
      "ams": [
        {
          "id": "0",
          "humidity": "4",
          "temp": "27.1",
          "info": "1003",
          "tray": [
            {"id": "0", "tray_type": "PLA", "tray_sub_brands": "PLA Basic", "tray_color": "FFFFFFFF", "remain": 80},
            {"id": "1", "tray_type": "PETG", "tray_color": "000000FF", "remain": 15, "k": 0.02},
            {"id": "2"},
            {"id": "3"}
          ]
        }
      ],
      "ams_exist_bits": "1",
      "tray_exist_bits": "3",
      "tray_now": "1",
      "tray_pre": "1",
      "tray_tar": "1",
      "version": 11
    },
    "vt_tray": {"id": "254", "tray_type": "TPU", "tray_color": "FF0000FF"},
    "hms": [
      {"attr": 83886592, "code": 65537}
    ],
    "lights_report": [{"node": "chamber_light", "mode": "on"}],
    "xcam": {"spaghetti_detector": true, "print_halt": true, "halt_print_sensitivity": "medium"}
  }
}"#;

fn apply(prev: &PrinterSnapshot, json: &str) -> PrinterSnapshot {
    reduce(prev, &parse_payload(json.as_bytes()))
}

#[test]
fn full_report() {
    let s = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);

    assert_eq!(s.printer_model, PrinterModel::X1C);
    assert_eq!(s.state, PrinterState::Printing);
    assert_eq!(s.stage_name.as_deref(), Some("Printing"));
    assert_eq!(s.print_stage, Some(2));
    assert_eq!(s.percent, Some(37));
    assert_eq!(s.time_remaining(), Some(chrono::Duration::minutes(84)));
    assert_eq!(s.layer_num, Some(41));
    assert_eq!(s.wifi_signal.as_deref(), Some("-52dBm"));
    assert_eq!(s.print_error_message, None);

    assert_eq!(s.nozzle_temp, Some(219.8));
    assert_eq!(s.bed_target, Some(55.0));
    assert_eq!(s.fans.part_cooling, Some(100));
    assert_eq!(s.fans.chamber, Some(67));

    let unit = s.ams_unit("0").unwrap();
    assert_eq!(unit.tray_exists, [true, true, false, false]);
    assert_eq!(unit.trays[&1].remain, Some(15));
    assert_eq!(unit.trays[&0].sub_brand.as_deref(), Some("PLA Basic"));
    assert!(!unit.is_ams_lite());
    assert_eq!(s.active_tray, Some(1));
    assert!(!s.is_external_spool_active);
    assert_eq!(s.external_spools[&254].tray_type.as_deref(), Some("TPU"));

    assert_eq!(s.hms.len(), 1);
    assert_eq!(s.hms[0].severity, HmsSeverity::Warning);
    assert!(!s.has_critical_hms());
    assert_eq!(s.chamber_light, Some(true));
    assert_eq!(s.xcam.spaghetti_detector, Some(true));
    assert_eq!(s.xcam.halt_print_sensitivity.as_deref(), Some("medium"));
}

#[test]
fn partial_updates_keep_everything_else() {
    let full = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let next = apply(
        &full,
        r#"{"print": {"mc_percent": 38, "layer_num": 42, "command": "push_status"}}"#,
    );

    assert_eq!(next.percent, Some(38));
    assert_eq!(next.layer_num, Some(42));

    let mut expected = full.clone();
    expected.percent = Some(38);
    expected.layer_num = Some(42);
    assert_eq!(next, expected);
}

#[test]
fn same_message_twice_is_idempotent() {
    let full = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let again = apply(&full, PUSHALL);
    assert_eq!(full, again);
}

#[test]
fn paused_with_error() {
    let full = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let s = apply(
        &full,
        r#"{"print": {"gcode_state": "PAUSE", "print_error": 117473306}}"#,
    );
    assert_eq!(s.state, PrinterState::Error);
    assert!(s.print_error_message.is_some());

    let s = apply(&s, r#"{"print": {"gcode_state": "PAUSE", "print_error": 0}}"#);
    assert_eq!(s.state, PrinterState::Paused);
}

#[test]
fn switching_to_external_spool() {
    let full = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let s = apply(&full, r#"{"print": {"ams": {"tray_now": "254", "tray_tar": "255"}}}"#);
    assert_eq!(s.active_tray, Some(254));
    assert!(s.is_external_spool_active);
    assert_eq!(s.target_tray, None);
}

#[test]
fn dual_nozzle_printer() {
    let serial = "0948AB000000000";
    let s = apply(
        &PrinterSnapshot::for_serial(serial),
        r#"{"print": {
            "gcode_state": "RUNNING",
            "nozzle_temper": 25,
            "ams": {
                "ams": [
                    {"id": "0", "info": "1003", "humidity": "3", "tray": [{"id": "0", "tray_type": "PLA"}]},
                    {"id": "128", "info": "1103", "humidity": "2", "tray": [{"id": "0", "tray_type": "PA-CF"}]}
                ],
                "ams_exist_bits": "1",
                "tray_now": "128"
            },
            "device": {
                "extruder": {
                    "state": 272,
                    "info": [
                        {"id": 0, "temp": 14418140, "info": 14, "stat": 0, "snow": 1},
                        {"id": 1, "temp": 18350320, "info": 14, "stat": 768, "snow": 32768}
                    ]
                },
                "airduct": {"modeCur": 0, "parts": [{"id": 16, "func": 0, "state": 40}]}
            }
        }}"#,
    );

    assert_eq!(s.printer_model, PrinterModel::H2D);
    assert!(s.is_multi_extruder());
    assert_eq!(s.extruders.len(), 2);
    assert_eq!(s.extruders[1].status, ExtruderStatus::Active);
    assert_eq!(s.active_tool, ExtruderSide::Left);
    // 18350320 = 280 << 16 | 240
    assert_eq!(s.nozzle_temp, Some(240.0));
    assert_eq!(s.nozzle_target, Some(280.0));
    assert_eq!(s.flat_nozzle_temp, Some(25.0));

    assert_eq!(s.ams_unit("128").unwrap().feeds(), ExtruderSide::Left);
    assert_eq!(s.extruder_assignment.get(&1), Some(&128));
    assert_eq!(s.active_tray, Some(128));
    assert!(s.has_duct);
    assert_eq!(s.fans.part_cooling, Some(40));

    // extruder 0 takes over
    let s = apply(
        &s,
        r#"{"print": {"device": {"extruder": {"info": [
            {"id": 0, "temp": 14418140, "info": 14, "stat": 256, "snow": 1},
            {"id": 1, "temp": 18350320, "info": 14, "stat": 0, "snow": 32768}
        ]}}, "ams": {"tray_now": "1"}}}"#,
    );
    assert_eq!(s.active_tool, ExtruderSide::Right);
    assert_eq!(s.nozzle_temp, Some(220.0));
    assert_eq!(s.active_tray, Some(1));
}

#[test]
fn version_info() {
    let s = apply(
        &PrinterSnapshot::default(),
        r#"{"info": {"command": "get_version", "sequence_id": "0", "module": [
            {"name": "ota", "sw_ver": "01.09.00.00", "sn": "01P00A000000000"},
            {"name": "n3s/0", "sn": "19C06A000000000", "sw_ver": "00.00.07.00", "hw_ver": "N3S05"},
            {"name": "mc", "sw_ver": "00.00.30.00"}
        ]}}"#,
    );
    assert_eq!(s.printer_model, PrinterModel::P1S);
    assert_eq!(s.serial.as_deref(), Some("01P00A000000000"));
    assert_eq!(s.firmware_version.as_deref(), Some("01.09.00.00"));

    let unit = s.ams_unit("0").unwrap();
    assert_eq!(unit.model, AmsModel::Ams2Pro);
    assert_eq!(unit.series(), AmsSeries::Gen2);
    assert_eq!(unit.firmware_version.as_deref(), Some("00.00.07.00"));
}

#[test]
fn malformed_sections_are_skipped() {
    let full = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let s = apply(
        &full,
        r#"{"print": {"ams": "garbage", "hms": "oops", "nozzle_temper": "hot", "bed_temper": 56}}"#,
    );
    assert_eq!(s.ams_units, full.ams_units);
    assert_eq!(s.hms, full.hms);
    assert_eq!(s.nozzle_temp, full.nozzle_temp);
    assert_eq!(s.bed_temp, Some(56.0));
}

#[test]
fn snapshot_serializes() {
    let s = apply(&PrinterSnapshot::for_serial(SERIAL), PUSHALL);
    let v = serde_json::to_value(&s).unwrap();
    assert_eq!(v["percent"], 37);
    assert_eq!(v["ams_units"][0]["ams_id"], "0");
}
