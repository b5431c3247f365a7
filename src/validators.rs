//! Input validation and sanitization
//!
//! Centralized validation for operator-supplied values before they reach
//! the policy store or the nft invocation surface.

use crate::core::error::{Error, Result};
use ipnetwork::IpNetwork;

fn validation(field: &str, message: impl Into<String>) -> Error {
    Error::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validates a rule name.
///
/// Constraints:
/// - Alphanumeric, underscores, and hyphens only: prevents injection into
///   nft arguments and keeps names file- and log-safe.
/// - Max 64 chars.
/// - Rejects "." and "..".
pub fn validate_rule_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(validation("name", "name cannot be empty"));
    }

    if name.len() > 64 {
        return Err(validation("name", "name too long (max 64 chars)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(validation(
            "name",
            "name contains invalid characters (use only a-z, 0-9, _, -)",
        ));
    }

    if name == "." || name == ".." {
        return Err(validation("name", "invalid name"));
    }

    Ok(())
}

/// Sanitizes a free-text description.
///
/// Keeps ASCII alphanumerics and a small punctuation set, truncates to 128
/// bytes. ASCII-only avoids multi-byte truncation issues in log lines.
pub fn sanitize_description(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | ','))
        .take(128)
        .collect()
}

/// Parses an address or CIDR into a network; bare addresses get a host
/// prefix.
pub fn parse_network(field: &str, input: &str) -> Result<IpNetwork> {
    input
        .trim()
        .parse()
        .map_err(|_| validation(field, format!("invalid address or network: {input}")))
}

/// Validates a single port number.
pub fn validate_port(port: u16) -> Result<u16> {
    if port == 0 {
        Err(validation("port", "port must be between 1 and 65535"))
    } else {
        Ok(port)
    }
}

/// Validates a port range.
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16)> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err(validation(
            "port",
            "start port must be less than or equal to end port",
        ))
    } else {
        Ok((start, end))
    }
}
