//! Protocol commands
//!
//! Defines the XYZv3 text commands understood by da Vinci firmware and the
//! classification of the lines they get back.

use serde::{Deserialize, Serialize};

/// Prefix shared by every firmware command
pub const COMMAND_PREFIX: &str = "XYZv3";

/// Commands sent to the printer as single text lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Request a full status dump
    QueryStatus,

    /// Request the printer signature (model, serial, firmware)
    QuerySignature,

    /// Read the filament tag
    QueryTagInfo,

    /// Announce the file about to be transferred
    QueryFileContext { filename: String, size: u64 },

    /// Open an upload slot (acknowledged transfers only)
    UploadInit { filename: String, size: u64 },

    /// Close the upload slot
    UploadFinish,

    /// Keep-alive sent between transfer blocks
    Heartbeat,

    /// Print job control
    Print {
        action: PrintAction,
        token: Option<String>,
    },

    /// Calibration step
    Calibrate(CalibrationStep),

    /// Read a configuration key
    ConfigGet(String),

    /// Console passthrough, sent verbatim
    Raw(String),
}

/// Print job control action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl PrintAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrintAction::Start => "start",
            PrintAction::Pause => "pause",
            PrintAction::Resume => "resume",
            PrintAction::Cancel => "cancel",
        }
    }
}

/// Steps of the bed calibration dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationStep {
    /// Begin a new calibration run
    Begin,
    /// The user lowered the detector
    DetectorLowered,
    /// Release the detector and finish
    Release,
}

impl CalibrationStep {
    fn wire_name(&self) -> &'static str {
        match self {
            CalibrationStep::Begin => "new",
            CalibrationStep::DetectorLowered => "detectorok",
            CalibrationStep::Release => "release",
        }
    }
}

impl Command {
    /// Render the command line, without the trailing newline
    pub fn line(&self) -> String {
        match self {
            Command::QueryStatus => format!("{COMMAND_PREFIX}/query=a"),
            Command::QuerySignature => format!("{COMMAND_PREFIX}/query=i"),
            Command::QueryTagInfo => format!("{COMMAND_PREFIX}/config=taginfo:get"),
            Command::QueryFileContext { filename, size } => {
                format!("{COMMAND_PREFIX}/config=filecontext:{filename},{size}")
            }
            Command::UploadInit { filename, size } => {
                format!("{COMMAND_PREFIX}/upload={filename},{size}")
            }
            Command::UploadFinish => format!("{COMMAND_PREFIX}/uploadDidFinish"),
            Command::Heartbeat => format!("{COMMAND_PREFIX}/query=j"),
            Command::Print { action, token } => {
                let mut body = serde_json::json!({
                    "command": "print",
                    "state": action.as_str(),
                });
                if let Some(token) = token {
                    body["token"] = serde_json::Value::String(token.clone());
                }
                format!("{COMMAND_PREFIX}/control={body}")
            }
            Command::Calibrate(step) => {
                format!("{COMMAND_PREFIX}/action=calibratejr:{}", step.wire_name())
            }
            Command::ConfigGet(key) => format!("{COMMAND_PREFIX}/config={key}:get"),
            Command::Raw(text) => text.clone(),
        }
    }

    /// Convert command to bytes, appending newline for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.line().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

/// How a response line terminates (or continues) an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Plain `ok` acknowledgement
    Ok,
    /// Final line of a multi-line response
    End,
    /// Firmware rejection (`E<code>`)
    Error,
    /// Anything else; more lines may follow
    Data,
}

impl ResponseKind {
    /// Classify a response line
    pub fn classify(line: &str) -> Self {
        let line = line.trim();
        if line.eq_ignore_ascii_case("ok") {
            return ResponseKind::Ok;
        }

        let mut chars = line.chars();
        if chars.next() == Some('E') && chars.next().is_some_and(|c| c.is_ascii_digit()) {
            return ResponseKind::Error;
        }

        if line.ends_with('$') {
            return ResponseKind::End;
        }
        if line.starts_with('{') {
            if let Ok(serde_json::Value::Object(object)) =
                serde_json::from_str::<serde_json::Value>(line)
            {
                if object.contains_key("result") {
                    return ResponseKind::End;
                }
            }
        }

        ResponseKind::Data
    }
}
