//! Configuration file parser
//!
//! Reads `directive value` lines. Blank lines and lines starting with `#`
//! are ignored; unknown directives are logged and skipped.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use tracing::warn;

use super::Config;

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid line format
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Invalid parameter value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),
}

/// Parse a configuration file
pub fn parse_config_file(path: &Path) -> Result<Config, ConfigParseError> {
    let file = File::open(path).map_err(ConfigParseError::Io)?;
    parse_lines(BufReader::new(file))
}

/// Parse configuration text held in memory
pub fn parse_config_str(text: &str) -> Result<Config, ConfigParseError> {
    parse_lines(text.as_bytes())
}

fn parse_lines<R: BufRead>(reader: R) -> Result<Config, ConfigParseError> {
    let mut config = Config::default();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.splitn(2, char::is_whitespace).collect();
        if parts.len() != 2 {
            return Err(ConfigParseError::Format(line_num + 1, line.to_string()));
        }

        let param = parts[0].trim().to_lowercase();
        let value = parts[1].trim();

        apply_config_param(&mut config, &param, value, line_num + 1)?;
    }

    Ok(config)
}

/// Apply a configuration parameter to the config
fn apply_config_param(
    config: &mut Config,
    param: &str,
    value: &str,
    line_num: usize,
) -> Result<(), ConfigParseError> {
    match param {
        // Limits
        "memory-limit" | "maxmemory" => {
            config.limits.memory_limit = parse_size(param, value, line_num)? as usize;
        }
        "call-depth" => {
            config.limits.call_depth = parse_value(param, value, line_num)?;
        }
        "host-call-depth" => {
            config.limits.host_call_depth = parse_value(param, value, line_num)?;
        }
        "stack-limit" => {
            config.limits.stack_limit = parse_value(param, value, line_num)?;
        }

        // Collector
        "gc" => {
            config.gc.enabled = parse_yes_no(param, value, line_num)?;
        }
        "gc-pause" => {
            config.gc.pause = parse_value(param, value, line_num)?;
        }
        "gc-threshold" => {
            config.gc.threshold = parse_size(param, value, line_num)? as usize;
        }

        _ => {
            warn!(param, line = line_num, "unknown configuration parameter, skipping");
        }
    }

    Ok(())
}

/// Parse a value that implements FromStr
fn parse_value<T: FromStr>(param: &str, value: &str, line_num: usize) -> Result<T, ConfigParseError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.to_string()))
}

/// Parse a yes/no value
fn parse_yes_no(param: &str, value: &str, line_num: usize) -> Result<bool, ConfigParseError> {
    match value.to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(ConfigParseError::Value(param.to_string(), line_num, value.to_string())),
    }
}

/// Parse a size value (e.g., 64mb, 2gb)
fn parse_size(param: &str, value: &str, line_num: usize) -> Result<u64, ConfigParseError> {
    let value = value.trim().to_lowercase();
    let idx = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());

    if idx == 0 {
        return Err(ConfigParseError::Value(param.to_string(), line_num, value));
    }
    let num: u64 = value[..idx]
        .parse()
        .map_err(|_| ConfigParseError::Value(param.to_string(), line_num, value.clone()))?;

    let multiplier = match &value[idx..] {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return Err(ConfigParseError::Value(param.to_string(), line_num, value)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| ConfigParseError::Value(param.to_string(), line_num, value.clone()))
}
