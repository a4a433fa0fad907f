//! HMS ("health management system") code decoding.
//!
//! The device reports each active fault as an `(attr, code)` pair of 32-bit
//! integers. Together they form the 16 hex digit key used by the printer
//! wiki, printed as `AAAA_AAAA_CCCC_CCCC`.

use tracing::{debug, trace, warn};

use serde::{Deserialize, Serialize};

pub const UNKNOWN_HMS_ERROR: &str = "Unknown HMS Error";
pub const UNKNOWN_PRINT_ERROR: &str = "Unknown Print Error";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HmsLanguage {
    #[default]
    En,
    De,
}

impl HmsLanguage {
    fn wiki_prefix(&self) -> &'static str {
        match self {
            HmsLanguage::En => "en",
            HmsLanguage::De => "de",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HmsModule {
    Mainboard,
    Ams,
    Toolhead,
    Webcam,
    Hms,
    System,
}

impl HmsModule {
    pub fn from_attr(attr: u32) -> Self {
        match attr >> 24 {
            0x03 => HmsModule::Mainboard,
            0x05 => HmsModule::Ams,
            0x07 => HmsModule::Toolhead,
            0x0C => HmsModule::Webcam,
            0x12 => HmsModule::Hms,
            _ => HmsModule::System,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HmsModule::Mainboard => "Mainboard",
            HmsModule::Ams => "AMS",
            HmsModule::Toolhead => "Toolhead",
            HmsModule::Webcam => "Webcam",
            HmsModule::Hms => "HMS",
            HmsModule::System => "System",
        }
    }
}

impl std::fmt::Display for HmsModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HmsSeverity {
    Fatal,
    Error,
    Warning,
    Info,
}

impl HmsSeverity {
    pub fn from_attr(attr: u32) -> Self {
        match (attr >> 8) & 0xF {
            0 => HmsSeverity::Fatal,
            1 => HmsSeverity::Error,
            2 => HmsSeverity::Warning,
            _ => HmsSeverity::Info,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, HmsSeverity::Fatal | HmsSeverity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmsError {
    pub attr: u32,
    pub code: u32,
    pub message: String,
    pub module: HmsModule,
    pub severity: HmsSeverity,
    pub is_critical: bool,
    pub url: String,
}

impl HmsError {
    pub fn key(&self) -> String {
        hms_key(self.attr, self.code)
    }
}

pub fn hms_key(attr: u32, code: u32) -> String {
    format!("{:08X}{:08X}", attr, code)
}

/// `0500010000010001` -> `0500_0100_0001_0001`
pub fn hms_display_key(attr: u32, code: u32) -> String {
    format!(
        "{:04X}_{:04X}_{:04X}_{:04X}",
        attr >> 16,
        attr & 0xFFFF,
        code >> 16,
        code & 0xFFFF
    )
}

pub fn decode_hms_error_code(attr: u32, code: u32) -> HmsError {
    decode_hms_error_code_lang(attr, code, HmsLanguage::En)
}

pub fn decode_hms_error_code_lang(attr: u32, code: u32, lang: HmsLanguage) -> HmsError {
    let key = hms_key(attr, code);
    let message = match lookup(HMS_MESSAGES, &key, lang)
        .map(str::to_string)
        .or_else(|| lookup_ams_unit(attr, code, lang))
    {
        Some(msg) => msg,
        None => {
            debug!("unmapped hms code: {}", key);
            UNKNOWN_HMS_ERROR.to_string()
        }
    };
    let severity = HmsSeverity::from_attr(attr);
    HmsError {
        attr,
        code,
        message,
        module: HmsModule::from_attr(attr),
        severity,
        is_critical: severity.is_critical(),
        url: format!(
            "https://wiki.bambulab.com/{}/x1/troubleshooting/hmscode/{}",
            lang.wiki_prefix(),
            hms_display_key(attr, code)
        ),
    }
}

/// AMS codes repeat per unit in bits 16..24 of `attr`; the table only holds unit A
fn lookup_ams_unit(attr: u32, code: u32, lang: HmsLanguage) -> Option<String> {
    let unit = (attr >> 16) & 0xFF;
    if attr >> 24 != 0x05 || !(1..=3).contains(&unit) {
        return None;
    }
    let base = lookup(HMS_MESSAGES, &hms_key(attr & 0xFF00_FFFF, code), lang)?;
    let letter = char::from(b'A' + unit as u8);
    Some(base.replace("AMS A", &format!("AMS {}", letter)))
}

/// `print_error` carries one device error, 0 = none
pub fn decode_print_error(code: i64) -> Option<String> {
    if code == 0 {
        return None;
    }
    let key = format!("{:08X}", code as u32);
    match lookup(PRINT_ERRORS, &key, HmsLanguage::En) {
        Some(msg) => Some(msg.to_string()),
        None => {
            trace!("unmapped print error: {}", key);
            Some(format!("{} [{}]", UNKNOWN_PRINT_ERROR, key))
        }
    }
}

fn lookup(table: &[Entry], key: &str, lang: HmsLanguage) -> Option<&'static str> {
    let entry = table.iter().find(|e| e.key == key)?;
    match lang {
        HmsLanguage::En => Some(entry.en),
        HmsLanguage::De => Some(entry.de.unwrap_or(entry.en)),
    }
}

struct Entry {
    key: &'static str,
    en: &'static str,
    de: Option<&'static str>,
}

const fn e(key: &'static str, en: &'static str, de: &'static str) -> Entry {
    Entry {
        key,
        en,
        de: Some(de),
    }
}

const fn en(key: &'static str, en: &'static str) -> Entry {
    Entry { key, en, de: None }
}

/// MARK: tables

static HMS_MESSAGES: &[Entry] = &[
    // mainboard
    e(
        "0300010000010001",
        "The heatbed temperature is abnormal; the heater may be short-circuited.",
        "Die Temperatur des Heizbetts ist abnormal; die Heizung könnte kurzgeschlossen sein.",
    ),
    e(
        "0300010000010002",
        "The heatbed temperature is abnormal; the heater may be open-circuited.",
        "Die Temperatur des Heizbetts ist abnormal; der Heizkreis könnte unterbrochen sein.",
    ),
    e(
        "0300010000010003",
        "The heatbed temperature is abnormal; the thermal protection has been triggered.",
        "Die Temperatur des Heizbetts ist abnormal; der thermische Schutz wurde ausgelöst.",
    ),
    e(
        "0300020000010001",
        "The nozzle temperature is abnormal; the heater may be short-circuited.",
        "Die Düsentemperatur ist abnormal; die Heizung könnte kurzgeschlossen sein.",
    ),
    e(
        "0300020000010002",
        "The nozzle temperature is abnormal; the heater may be open-circuited.",
        "Die Düsentemperatur ist abnormal; der Heizkreis könnte unterbrochen sein.",
    ),
    e(
        "0300030000010001",
        "The heatbreak fan speed is abnormal.",
        "Die Drehzahl des Heatbreak-Lüfters ist abnormal.",
    ),
    e(
        "0300030000020002",
        "The speed of the part cooling fan is too slow or stopped.",
        "Der Bauteillüfter dreht zu langsam oder steht still.",
    ),
    en(
        "0300060000010001",
        "Motor-A has an open-circuit. There may be a loose connection, or the motor may have failed.",
    ),
    en(
        "0300060000010002",
        "Motor-A has a short-circuit. It may have failed.",
    ),
    e(
        "0300200000010001",
        "X axis homing abnormal: please check if the toolhead is stuck or the carbon rod has too much resistance.",
        "Referenzfahrt der X-Achse abnormal: Bitte prüfen, ob der Druckkopf blockiert ist.",
    ),
    e(
        "0300400000020001",
        "Data transmission over the serial port is abnormal; the software system may be faulty.",
        "Die Datenübertragung über die serielle Schnittstelle ist abnormal.",
    ),
    en(
        "0300910000010001",
        "The chamber temperature is abnormal; the chamber heater may be faulty.",
    ),
    // AMS
    e(
        "0500010000010001",
        "AMS A assist motor has slipped. The extrusion wheel may be worn down, or the filament may be too thin.",
        "Der Hilfsmotor von AMS A ist durchgerutscht. Das Extrusionsrad könnte abgenutzt sein.",
    ),
    e(
        "0500010000010003",
        "AMS A assist motor torque control is malfunctioning. The current sensor may be faulty.",
        "Die Drehmomentsteuerung des Hilfsmotors von AMS A funktioniert nicht richtig.",
    ),
    e(
        "0500020000010001",
        "AMS A Slot 1 filament has run out.",
        "Das Filament in AMS A Schacht 1 ist aufgebraucht.",
    ),
    e(
        "0500020000010002",
        "AMS A Slot 2 filament has run out.",
        "Das Filament in AMS A Schacht 2 ist aufgebraucht.",
    ),
    e(
        "0500020000010003",
        "AMS A Slot 3 filament has run out.",
        "Das Filament in AMS A Schacht 3 ist aufgebraucht.",
    ),
    e(
        "0500020000010004",
        "AMS A Slot 4 filament has run out.",
        "Das Filament in AMS A Schacht 4 ist aufgebraucht.",
    ),
    e(
        "0500020000020001",
        "AMS A Slot 1 filament may be broken in the PTFE tube.",
        "Das Filament aus AMS A Schacht 1 könnte im PTFE-Schlauch gebrochen sein.",
    ),
    en(
        "0500030000010001",
        "The AMS A RFID reader is abnormal; filament information cannot be read.",
    ),
    en(
        "0500040000010001",
        "Failed to feed the filament into the toolhead.",
    ),
    en(
        "0500040000020001",
        "Failed to pull back the filament from the toolhead to AMS.",
    ),
    en(
        "0500050000010001",
        "The AMS humidity sensor is abnormal.",
    ),
    en(
        "0500060000020001",
        "The AMS heater is abnormal; drying has been stopped.",
    ),
    // toolhead
    e(
        "0700010000010001",
        "The filament cutter sensor is malfunctioning.",
        "Der Sensor des Filamentschneiders funktioniert nicht.",
    ),
    e(
        "0700020000020001",
        "The nozzle is clogged with filament.",
        "Die Düse ist mit Filament verstopft.",
    ),
    en(
        "0700030000020001",
        "Filament runout detected on the left extruder.",
    ),
    en(
        "0700030000020002",
        "Filament runout detected on the right extruder.",
    ),
    // webcam
    e(
        "0C00010000010001",
        "The Micro Lidar camera is offline.",
        "Die Micro-Lidar-Kamera ist offline.",
    ),
    e(
        "0C00020000020001",
        "Spaghetti defects were detected by the AI Print Monitoring. Please check the quality of the printed model.",
        "Die KI-Drucküberwachung hat Spaghetti-Defekte erkannt.",
    ),
    en(
        "0C00030000020002",
        "First layer defects were detected by the Micro Lidar.",
    ),
    // HMS / system
    en(
        "1200010000030001",
        "The SD card is full or write-protected.",
    ),
    en(
        "1200020000030002",
        "The printer's firmware is out of date; please update.",
    ),
];

static PRINT_ERRORS: &[Entry] = &[
    en("0300400C", "Printing was cancelled."),
    en("0300800A", "A filament pile-up was detected by the AI Print Monitoring."),
    en("03008012", "The hotend cover is not installed."),
    en("0500400E", "Printing was paused by the user."),
    en("05004038", "The nozzle temperature is too low for the filament being used."),
    en("07008011", "AMS filament ran out. Please insert new filament into the same slot."),
    en("07FF8011", "External filament has run out; please load new filament."),
    en("0C004016", "The build plate was not detected."),
];
