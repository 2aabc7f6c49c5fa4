//! G-code command templates and a minimal parameter parser.
//!
//! Commands sent to the host are rendered from named templates with `strfmt`
//! so that every numeric value is formatted in one place. The parser covers
//! the `NAME KEY=VALUE` and `M204 S<value>` shapes used by this module; it is
//! not a general G-code parser.

use std::collections::HashMap;

use crate::error::{AppResult, AutoZError};

/// Apply a Z offset without moving the toolhead.
pub const SET_GCODE_OFFSET: &str = "SET_GCODE_OFFSET Z={z} MOVE=0";

/// Set the maximum acceleration.
pub const SET_ACCEL: &str = "M204 S{accel}";

/// Render `template`, substituting `{key}` for each pair in `vars`.
pub fn render(template: &str, vars: &[(&str, String)]) -> AppResult<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    strfmt::strfmt(template, &vars)
        .map_err(|err| AutoZError::Gcode(format!("cannot render '{}': {}", template, err)))
}

/// `SET_GCODE_OFFSET` for an already-negated runtime offset.
pub fn set_gcode_offset(z: f64) -> AppResult<String> {
    render(SET_GCODE_OFFSET, &[("z", format!("{:.6}", z))])
}

/// `M204` for the given acceleration.
pub fn set_accel(accel: f64) -> AppResult<String> {
    render(SET_ACCEL, &[("accel", format!("{:.3}", accel))])
}

/// A parsed command line: upper-cased name plus parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    /// Command name, upper-cased.
    pub name: String,
    /// Parameters keyed by upper-cased name.
    pub params: HashMap<String, String>,
}

impl CommandLine {
    /// Parse one line. Returns `None` for blank lines and comments.
    ///
    /// Both `KEY=VALUE` and classic `S100` word forms are accepted.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.split(';').next().unwrap_or("").trim();
        let mut words = line.split_whitespace();
        let name = words.next()?.to_ascii_uppercase();
        let params = words
            .filter_map(|word| match word.split_once('=') {
                Some((k, v)) => Some((k.to_ascii_uppercase(), v.to_string())),
                None => {
                    let mut chars = word.chars();
                    let key = chars.next()?;
                    Some((key.to_ascii_uppercase().to_string(), chars.as_str().to_string()))
                }
            })
            .collect();
        Some(Self { name, params })
    }

    /// Parameter `key` as a float.
    pub fn float(&self, key: &str) -> AppResult<f64> {
        let raw = self
            .params
            .get(key)
            .ok_or_else(|| AutoZError::Gcode(format!("{}: missing {}", self.name, key)))?;
        raw.parse::<f64>()
            .map_err(|_| AutoZError::Gcode(format!("{}: invalid {}='{}'", self.name, key, raw)))
    }
}
