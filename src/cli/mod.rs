//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes mapped from device, broker and config errors
//! - Payload formatting and parsing

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use output::{format_output, format_summary, parse_payload, OutputFormat, PayloadParseError};
