//! Target expressions
//!
//! A target expression names one or more endpoints:
//!
//! - `3000` - a single port on the default host
//! - `10.10.10.10:2000` - a port on a specific host
//! - `2001,2002,2003` - a list of ports
//! - `2001-2003` - an inclusive range of ports
//! - `2001x3` - a start port and a count

use crate::{Endpoint, DEFAULT_HOST, MAX_TARGETS_PER_EXPRESSION};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetParseError {
    #[error("Port number must be an integer between 1 and 65535 but was \"{0}\"")]
    InvalidPort(String),

    #[error("Port lists must be comma-separated port numbers (eg. 2001,9042,9099): {0}")]
    InvalidPortList(Box<TargetParseError>),

    #[error("Too many \"-\" in port range")]
    TooManyRangeSeparators,

    #[error("Start port ({start}) should be lower than end port ({end})")]
    InvertedRange { start: u16, end: u16 },

    #[error("Too many \"x\" in port x count")]
    TooManyCountSeparators,

    #[error("Port count must be positive integer, was \"{0}\"")]
    InvalidCount(String),

    #[error("Port range starting at {start} with count {count} runs past 65535")]
    CountOverflow { start: u16, count: usize },

    #[error("Too many \":\" in address")]
    TooManyHostSeparators,

    #[error("Number of ports specified ({0}) exceeds the limit (1000)")]
    TooManyPorts(usize),
}

fn parse_port(input: &str) -> Result<u16, TargetParseError> {
    match input.trim().parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(TargetParseError::InvalidPort(input.to_string())),
    }
}

/// Parse the port part of a target expression into a list of ports.
pub fn parse_port_expression(input: &str) -> Result<Vec<u16>, TargetParseError> {
    if input.contains('-') {
        let parts: Vec<&str> = input.split('-').collect();
        if parts.len() > 2 {
            return Err(TargetParseError::TooManyRangeSeparators);
        }
        let start = parse_port(parts[0])?;
        let end = parse_port(parts[1])?;
        if start > end {
            return Err(TargetParseError::InvertedRange { start, end });
        }
        let count = (end - start) as usize + 1;
        if count > MAX_TARGETS_PER_EXPRESSION {
            return Err(TargetParseError::TooManyPorts(count));
        }
        return Ok((start..=end).collect());
    }

    if input.contains('x') {
        let parts: Vec<&str> = input.split('x').collect();
        if parts.len() > 2 {
            return Err(TargetParseError::TooManyCountSeparators);
        }
        let start = parse_port(parts[0])?;
        let count = parts[1]
            .trim()
            .parse::<usize>()
            .map_err(|_| TargetParseError::InvalidCount(parts[1].to_string()))?;
        if count > MAX_TARGETS_PER_EXPRESSION {
            return Err(TargetParseError::TooManyPorts(count));
        }
        if start as usize + count > u16::MAX as usize + 1 {
            return Err(TargetParseError::CountOverflow { start, count });
        }
        return Ok((0..count).map(|offset| start + offset as u16).collect());
    }

    let is_list = input.contains(',');
    let mut ports = Vec::new();
    for part in input.split(',') {
        match parse_port(part) {
            Ok(port) => ports.push(port),
            Err(e) if is_list => return Err(TargetParseError::InvalidPortList(Box::new(e))),
            Err(e) => return Err(e),
        }
    }
    if ports.len() > MAX_TARGETS_PER_EXPRESSION {
        return Err(TargetParseError::TooManyPorts(ports.len()));
    }
    Ok(ports)
}

/// Parse a full target expression (`[host:]ports`) into endpoints.
pub fn parse_target(input: &str) -> Result<Vec<Endpoint>, TargetParseError> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() > 2 {
        return Err(TargetParseError::TooManyHostSeparators);
    }

    let ports = parse_port_expression(parts[parts.len() - 1])?;
    let host = if parts.len() > 1 {
        parts[0].trim()
    } else {
        DEFAULT_HOST
    };

    Ok(ports
        .into_iter()
        .map(|port| Endpoint::new(host, port))
        .collect())
}

/// Validate a target expression, returning only the error (if any).
pub fn validate_target(input: &str) -> Option<TargetParseError> {
    parse_target(input).err()
}
