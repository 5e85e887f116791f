//! Printer Status
//!
//! Cumulative view of what the printer has reported over the serial line,
//! plus the line parser that builds it.
//!
//! Every field is independently optional. A line only ever overwrites the
//! fields it actually carries, so the snapshot grows monotonically until the
//! printer reports a new value.

mod parser;

pub use parser::LineParser;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of raw lines retained for diagnostics
pub const DEFAULT_HISTORY_LINES: usize = 200;

/// Smallest raw-line history a parser will keep
pub const MIN_HISTORY_LINES: usize = 50;

/// Number of sensor readings carried by a calibration line
pub const CALIBRATION_READINGS: usize = 9;

/// Snapshot of everything known about the printer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    /// Firmware state code from `j:` lines
    pub state_code: Option<u32>,
    /// Secondary code that sometimes follows the state code
    pub sub_code: Option<u32>,
    /// Human-readable rendering of `state_code`
    pub state: Option<String>,

    /// Extruder temperature (°C)
    pub extruder_actual_c: Option<f64>,
    /// Extruder target temperature (°C)
    pub extruder_target_c: Option<f64>,
    /// Bed temperature (°C)
    pub bed_actual_c: Option<f64>,
    /// Bed target temperature (°C)
    pub bed_target_c: Option<f64>,

    /// Print progress (0-100)
    pub print_percent: Option<u8>,
    /// Minutes since the print started
    pub elapsed_min: Option<u32>,
    /// Estimated minutes left
    pub remaining_min: Option<u32>,

    /// Filament left on the spool (mm)
    pub filament_remaining_mm: Option<u64>,
    /// Number of spools the printer reports
    pub spool_count: Option<u32>,
    /// Serial numbers read from the spool tags
    pub filament_serials: Option<Vec<String>>,

    /// File the printer is working on
    pub file_name: Option<String>,
    /// Latest session token issued by the printer
    pub token: Option<String>,

    /// Printer model name
    pub model: Option<String>,
    /// Printer serial number
    pub printer_serial: Option<String>,
    /// Main firmware version
    pub firmware_version: Option<String>,
    /// Motion controller firmware version
    pub mcu_version: Option<String>,
    /// Preferred transfer packet size advertised by the printer
    pub packet_size: Option<u32>,

    /// Verbatim payloads of tags without a dedicated field (`s`, `o`, `z`, `p`)
    pub extra: BTreeMap<String, String>,

    /// When a field last changed
    pub updated_at: Option<DateTime<Utc>>,
}

impl PrinterStatus {
    /// Whether the printer reported a finished transfer or print
    pub fn is_complete(&self) -> bool {
        self.print_percent == Some(100)
    }
}

/// A calibration progress line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationEvent {
    /// Stage marker reported by the firmware (e.g. "start", "pressdetector")
    pub stage: String,
    /// Bed sensor readings, present only when all nine parse
    pub readings: Option<[i32; CALIBRATION_READINGS]>,
    /// The line as received
    pub raw: String,
}

/// Describe a firmware state code
pub fn describe_state(code: u32) -> String {
    let known = match code {
        9000 => "initializing",
        9001 => "heating",
        9002 => "printing",
        9003 => "calibrating",
        9004 => "calibration done",
        9005 => "printing in progress",
        9006 => "cooling done",
        9007 => "cooling end",
        9008 => "ending print",
        9009 => "ending print done",
        9100 => "job done",
        9101 => "job stopped",
        9500 => "idle",
        9501 => "stopped",
        9502 => "loading filament",
        9503 => "unloading filament",
        9504 => "auto calibrating",
        9505 => "jog mode",
        9506 => "fatal error",
        9511 => "load filament",
        9512 => "unload filament",
        9530 => "homing",
        9601 => "busy",
        9700 => "sleeping",
        _ => return format!("unknown ({code})"),
    };
    known.to_string()
}
