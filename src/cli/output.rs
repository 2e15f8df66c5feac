//! Payload formatting for terminal output

use crate::core::orchestrator::PayloadSummary;
use clap::ValueEnum;
use thiserror::Error;

/// Output format for payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Lossy UTF-8 text
    Raw,
    /// Space separated hex bytes
    #[default]
    Hex,
    /// Text with escape sequences shown
    Escaped,
    /// JSON object
    Json,
}

/// Format data for output
pub fn format_output(data: &[u8], format: OutputFormat) -> String {
    match format {
        OutputFormat::Raw => String::from_utf8_lossy(data).to_string(),
        OutputFormat::Hex => hex_format(data),
        OutputFormat::Escaped => escaped_format(data),
        OutputFormat::Json => json_format(data),
    }
}

/// Format a snapshot payload, or a dash when there is none
pub fn format_summary(summary: Option<&PayloadSummary>, format: OutputFormat) -> String {
    match summary {
        Some(summary) if format == OutputFormat::Json => serde_json::json!({
            "length": summary.len,
            "hex": hex::encode(&summary.data),
            "at": summary.at.to_rfc3339(),
        })
        .to_string(),
        Some(summary) => format_output(&summary.data, format),
        None => "-".to_string(),
    }
}

/// Payload argument could not be parsed
#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid hex payload: {0}")]
pub struct PayloadParseError(String);

/// Parse a payload argument: `hex:0102ff` is decoded, anything else is sent as text
pub fn parse_payload(arg: &str) -> Result<Vec<u8>, PayloadParseError> {
    match arg.strip_prefix("hex:") {
        Some(digits) => {
            let digits: String = digits.chars().filter(|c| !c.is_whitespace()).collect();
            hex::decode(&digits).map_err(|e| PayloadParseError(e.to_string()))
        }
        None => Ok(arg.as_bytes().to_vec()),
    }
}

fn hex_format(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" ")
}

fn escaped_format(data: &[u8]) -> String {
    data.iter()
        .map(|&b| match b {
            0x00 => "\\0".to_string(),
            0x09 => "\\t".to_string(),
            0x0a => "\\n".to_string(),
            0x0d => "\\r".to_string(),
            0x1b => "\\e".to_string(),
            0x20..=0x7e => (b as char).to_string(),
            _ => format!("\\x{b:02x}"),
        })
        .collect()
}

fn json_format(data: &[u8]) -> String {
    serde_json::json!({
        "data": String::from_utf8_lossy(data),
        "hex": hex::encode(data),
        "length": data.len()
    })
    .to_string()
}
