//! Line Parser
//!
//! Classifies serial lines and merges them into the cumulative status.
//!
//! Classification order (first match wins):
//! 1. `calibratejr…` lines -> [`PrinterEvent::Calibrate`]
//! 2. `j:<code>[,<sub>]` state lines -> [`PrinterEvent::Status`]
//! 3. single-letter telemetry (`t:`, `b:`, `f:`, `w:`, `d:`, and the generic
//!    `s:`/`o:`/`z:`/`p:`) -> status when a tracked field changed, log otherwise
//! 4. lines embedding a `{...}` object -> status for command responses,
//!    structured log otherwise, plus [`PrinterEvent::Token`] when a token rides along
//! 5. anything else -> unstructured log
//!
//! Numbers are parsed tolerantly: a value that does not parse is treated as
//! absent and never clears a field that is already known.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use super::{
    describe_state, CalibrationEvent, PrinterStatus, CALIBRATION_READINGS,
    DEFAULT_HISTORY_LINES, MIN_HISTORY_LINES,
};
use crate::events::{LogEvent, PrinterEvent};

const CALIBRATION_PREFIX: &str = "calibratejr";

/// Stateful line classifier
///
/// Lines must be fed in arrival order from a single reader.
#[derive(Debug, Clone)]
pub struct LineParser {
    status: PrinterStatus,
    /// Most recent raw lines, oldest first
    recent_lines: VecDeque<String>,
    history_limit: usize,
}

impl LineParser {
    /// Create a parser keeping the default raw-line history
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY_LINES)
    }

    /// Create a parser keeping `limit` raw lines (clamped to 50-200)
    pub fn with_history(limit: usize) -> Self {
        Self {
            status: PrinterStatus::default(),
            recent_lines: VecDeque::new(),
            history_limit: limit.clamp(MIN_HISTORY_LINES, DEFAULT_HISTORY_LINES),
        }
    }

    /// Current cumulative status
    pub fn status(&self) -> &PrinterStatus {
        &self.status
    }

    /// Most recent raw lines, oldest first
    pub fn recent_lines(&self) -> &VecDeque<String> {
        &self.recent_lines
    }

    /// Latest token seen, if any
    pub fn token(&self) -> Option<&str> {
        self.status.token.as_deref()
    }

    /// Classify one line and merge it into the status
    ///
    /// Never fails; unrecognized input becomes a log event.
    pub fn feed(&mut self, line: &str) -> Vec<PrinterEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        self.remember(line);

        if is_calibration_line(line) {
            let event = parse_calibration(line);
            tracing::debug!(stage = %event.stage, "calibration line");
            return vec![PrinterEvent::Calibrate(event)];
        }

        if let Some(payload) = line.strip_prefix("j:") {
            self.merge_state_code(payload);
            return vec![self.status_event()];
        }

        if let Some((tag, payload)) = split_tag(line) {
            let changed = self.merge_tagged(tag, payload);
            return if changed {
                vec![self.status_event()]
            } else {
                vec![PrinterEvent::Log(LogEvent::text(line))]
            };
        }

        if let Some(object) = extract_json_object(line) {
            return self.merge_json(line, object);
        }

        vec![PrinterEvent::Log(LogEvent::text(line))]
    }

    fn remember(&mut self, line: &str) {
        self.recent_lines.push_back(line.to_string());
        while self.recent_lines.len() > self.history_limit {
            self.recent_lines.pop_front();
        }
    }

    fn status_event(&self) -> PrinterEvent {
        PrinterEvent::Status(Arc::new(self.status.clone()))
    }

    fn touch(&mut self, changed: bool) -> bool {
        if changed {
            self.status.updated_at = Some(Utc::now());
        }
        changed
    }

    fn merge_state_code(&mut self, payload: &str) -> bool {
        let mut parts = payload.split(',');
        let code = parts.next().and_then(parse_num::<u32>);
        let sub = parts.next().and_then(parse_num::<u32>);

        let mut changed = assign(&mut self.status.state_code, code);
        changed |= assign(&mut self.status.sub_code, sub);
        changed |= assign(&mut self.status.state, code.map(describe_state));
        self.touch(changed)
    }

    fn merge_tagged(&mut self, tag: char, payload: &str) -> bool {
        let parts: Vec<&str> = payload.split(',').collect();
        let status = &mut self.status;

        let changed = match tag {
            't' => {
                // t:<count>,<actual>[,<target>]; a bare value is the actual temperature
                let (actual, target) = if parts.len() >= 2 {
                    (parts.get(1), parts.get(2))
                } else {
                    (parts.first(), None)
                };
                assign(
                    &mut status.extruder_actual_c,
                    actual.and_then(|s| parse_num(s)),
                ) | assign(
                    &mut status.extruder_target_c,
                    target.and_then(|s| parse_num(s)),
                )
            }
            'b' => {
                assign(
                    &mut status.bed_actual_c,
                    parts.first().and_then(|s| parse_num(s)),
                ) | assign(
                    &mut status.bed_target_c,
                    parts.get(1).and_then(|s| parse_num(s)),
                )
            }
            'f' => {
                assign(
                    &mut status.spool_count,
                    parts.first().and_then(|s| parse_num(s)),
                ) | assign(
                    &mut status.filament_remaining_mm,
                    parts.get(1).and_then(|s| parse_num(s)),
                )
            }
            'w' => {
                let serials: Vec<String> = parts
                    .iter()
                    .skip(1)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty() && *s != "-")
                    .map(str::to_string)
                    .collect();
                let serials = (!serials.is_empty()).then_some(serials);
                assign(&mut status.filament_serials, serials)
            }
            'd' => merge_progress(status, payload),
            _ => {
                // s/o/z/p carry firmware details we keep but don't interpret
                status.extra.insert(tag.to_string(), payload.to_string());
                false
            }
        };

        self.touch(changed)
    }

    fn merge_json(&mut self, line: &str, object: Map<String, Value>) -> Vec<PrinterEvent> {
        let mut events = Vec::new();

        let token = object
            .get("token")
            .and_then(Value::as_str)
            .or_else(|| {
                object
                    .get("data")
                    .and_then(|d| d.get("token"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);

        let is_response = ["data", "command", "result"]
            .iter()
            .any(|key| object.contains_key(*key));

        if is_response {
            let fields = object
                .get("data")
                .and_then(Value::as_object)
                .unwrap_or(&object);
            let changed = merge_json_fields(&mut self.status, fields);
            self.touch(changed);
            events.push(self.status_event());
        } else {
            events.push(PrinterEvent::Log(LogEvent::structured(
                line,
                Value::Object(object),
            )));
        }

        if let Some(token) = token {
            tracing::debug!("printer issued a new token");
            self.status.token = Some(token.clone());
            events.push(PrinterEvent::Token(token));
        }

        events
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Overwrite `slot` only when a value was carried and it differs
fn assign<T: PartialEq>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(&v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

/// Parse a number, accepting decimal notation for integer targets ("60.0")
fn parse_num<T: FromStr + FromF64>(s: &str) -> Option<T> {
    let s = s.trim();
    if let Ok(v) = s.parse::<T>() {
        return Some(v);
    }
    s.parse::<f64>().ok().and_then(T::from_f64)
}

/// Lossy conversion used when the wire carries a float where an integer is expected
trait FromF64: Sized {
    fn from_f64(v: f64) -> Option<Self>;
}

impl FromF64 for f64 {
    fn from_f64(v: f64) -> Option<Self> {
        v.is_finite().then_some(v)
    }
}

macro_rules! impl_from_f64_unsigned {
    ($($t:ty),*) => {
        $(impl FromF64 for $t {
            fn from_f64(v: f64) -> Option<Self> {
                (v.is_finite() && v >= 0.0 && v <= <$t>::MAX as f64).then(|| v.round() as $t)
            }
        })*
    };
}

impl_from_f64_unsigned!(u8, u32, u64);

impl FromF64 for i32 {
    fn from_f64(v: f64) -> Option<Self> {
        (v.is_finite() && v >= i32::MIN as f64 && v <= i32::MAX as f64).then(|| v.round() as i32)
    }
}

fn json_num<T: FromStr + FromF64>(value: &Value) -> Option<T> {
    match value {
        Value::Number(n) => n.as_f64().and_then(T::from_f64),
        Value::String(s) => parse_num(s),
        _ => None,
    }
}

fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Apply a composite `percent,elapsed,remaining` progress value
fn merge_progress(status: &mut PrinterStatus, composite: &str) -> bool {
    let parts: Vec<&str> = composite.split(',').collect();
    let percent = parts
        .first()
        .and_then(|s| parse_num::<u8>(s))
        .filter(|p| *p <= 100);
    assign(&mut status.print_percent, percent)
        | assign(
            &mut status.elapsed_min,
            parts.get(1).and_then(|s| parse_num(s)),
        )
        | assign(
            &mut status.remaining_min,
            parts.get(2).and_then(|s| parse_num(s)),
        )
}

fn merge_json_fields(status: &mut PrinterStatus, fields: &Map<String, Value>) -> bool {
    let num = |key: &str| fields.get(key).and_then(json_num::<f64>);
    let text = |key: &str| fields.get(key).and_then(json_text);

    let mut changed = assign(&mut status.extruder_actual_c, num("extruder_temp"));
    changed |= assign(&mut status.extruder_target_c, num("extruder_target"));
    changed |= assign(&mut status.bed_actual_c, num("bed_temp"));
    changed |= assign(&mut status.bed_target_c, num("bed_target"));

    if let Some(progress) = fields.get("progress") {
        let composite = match progress {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        };
        if let Some(composite) = composite {
            changed |= merge_progress(status, &composite);
        }
    }

    changed |= assign(&mut status.model, text("model"));
    changed |= assign(&mut status.printer_serial, text("sn"));
    changed |= assign(&mut status.firmware_version, text("fw_version"));
    changed |= assign(&mut status.mcu_version, text("mcu_version"));
    changed |= assign(
        &mut status.packet_size,
        fields.get("packet_size").and_then(json_num::<u32>),
    );
    changed |= assign(&mut status.file_name, text("file"));

    if let Some(filament) = fields.get("filament").and_then(Value::as_object) {
        changed |= assign(
            &mut status.filament_remaining_mm,
            filament.get("remain").and_then(json_num::<u64>),
        );
        changed |= assign(
            &mut status.filament_serials,
            filament
                .get("serial")
                .and_then(json_text)
                .map(|s| vec![s]),
        );
    }

    changed
}

fn is_calibration_line(line: &str) -> bool {
    line.len() >= CALIBRATION_PREFIX.len()
        && line.as_bytes()[..CALIBRATION_PREFIX.len()].eq_ignore_ascii_case(CALIBRATION_PREFIX.as_bytes())
}

/// `calibratejr:{"stat":"ok"},1,2,3,4,5,6,7,8,9`
fn parse_calibration(line: &str) -> CalibrationEvent {
    let body = &line[CALIBRATION_PREFIX.len()..];
    let body = body.trim_start_matches(|c: char| c == ':' || c == '=' || c.is_whitespace());

    let (stage, trailing) = match find_balanced_braces(body) {
        Some((start, end)) => {
            let inner = &body[start..=end];
            (stage_from_marker(inner), &body[end + 1..])
        }
        None => {
            // No marker object: the stage is whatever precedes the first comma
            let (head, tail) = body.split_once(',').unwrap_or((body, ""));
            (head.trim().to_string(), tail)
        }
    };

    let values: Vec<i32> = trailing
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(parse_num::<i32>)
        .collect();

    let readings = if values.len() == CALIBRATION_READINGS {
        let mut array = [0i32; CALIBRATION_READINGS];
        array.copy_from_slice(&values);
        Some(array)
    } else {
        None
    };

    CalibrationEvent {
        stage,
        readings,
        raw: line.to_string(),
    }
}

/// Pull the stage name out of a JSON-ish `{...}` marker
fn stage_from_marker(marker: &str) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(marker) {
        if let Some(stat) = object.get("stat").and_then(Value::as_str) {
            return stat.to_string();
        }
        if let Some(first) = object.values().find_map(Value::as_str) {
            return first.to_string();
        }
    }
    marker.to_string()
}

/// `t:...` style tag, returning the tag letter and its payload
fn split_tag(line: &str) -> Option<(char, &str)> {
    let mut chars = line.chars();
    let tag = chars.next()?;
    if chars.next()? != ':' {
        return None;
    }
    matches!(tag, 't' | 'b' | 'f' | 'w' | 'd' | 's' | 'o' | 'z' | 'p').then(|| (tag, &line[2..]))
}

/// Byte range of the first balanced `{...}` (inclusive), ignoring braces inside strings
fn find_balanced_braces(text: &str) -> Option<(usize, usize)> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset));
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_json_object(line: &str) -> Option<Map<String, Value>> {
    let (start, end) = find_balanced_braces(line)?;
    match serde_json::from_str::<Value>(&line[start..=end]) {
        Ok(Value::Object(object)) => Some(object),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("braced text is not JSON: {e}");
            None
        }
    }
}
