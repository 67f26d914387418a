//! Decoding of the loosely-typed configuration maps reported by beacon
//! nodes. Prysm's gateway reports CamelCase keys with decimal scalars and
//! hex byte arrays; the standard HTTP API reports UPPER_SNAKE keys in the
//! same encodings. Both go through these helpers.

use std::collections::HashMap;

use crate::errors::ClientError;
use crate::types::DomainType;

/// Looks up `key` and decodes it as an unsigned integer. Values are decimal
/// unless prefixed with `0x`.
pub fn u64_value(config: &HashMap<String, String>, key: &'static str) -> Result<u64, ClientError> {
    let raw = raw_value(config, key)?;
    let parsed = match raw.strip_prefix("0x") {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => raw.parse(),
    };
    parsed.map_err(|err| ClientError::ConfigFormat {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Looks up `key` and decodes it as a hex byte array, with or without a
/// leading `0x`.
pub fn bytes_value(
    config: &HashMap<String, String>,
    key: &'static str,
) -> Result<Vec<u8>, ClientError> {
    let raw = raw_value(config, key)?;
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).map_err(|err| ClientError::ConfigFormat {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

/// Looks up `key` and decodes it as a 4-byte domain separation tag.
pub fn domain_value(
    config: &HashMap<String, String>,
    key: &'static str,
) -> Result<DomainType, ClientError> {
    let bytes = bytes_value(config, key)?;
    if bytes.len() != DomainType::LENGTH {
        return Err(ClientError::ConfigFormat {
            key,
            value: raw_value(config, key)?.to_string(),
            reason: format!("expected {} bytes, got {}", DomainType::LENGTH, bytes.len()),
        });
    }
    let mut domain = [0u8; DomainType::LENGTH];
    domain.copy_from_slice(&bytes);
    Ok(DomainType(domain))
}

fn raw_value<'a>(
    config: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, ClientError> {
    config
        .get(key)
        .map(String::as_str)
        .ok_or(ClientError::MissingKey(key))
}
