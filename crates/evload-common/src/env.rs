//! Typed environment variable readers
//!
//! Empty values are treated the same as unset ones, so `FOO=` in a `.env`
//! file falls back to the default instead of failing to parse.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::{CommonError, Result};

/// Read a variable, returning `None` when it is unset or blank
pub fn var_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a variable that must be present
pub fn require(key: &str) -> Result<String> {
    var_opt(key).ok_or_else(|| CommonError::MissingEnv(key.to_string()))
}

/// Read and parse a variable, falling back to `default` when unset
pub fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match var_opt(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

/// Read and parse an optional variable
pub fn parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    var_opt(key).map(|raw| parse(key, &raw)).transpose()
}

/// Read a boolean flag; accepts true/false, 1/0, yes/no, on/off
pub fn flag(key: &str, default: bool) -> Result<bool> {
    let Some(raw) = var_opt(key) else {
        return Ok(default);
    };

    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CommonError::InvalidEnv {
            key: key.to_string(),
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| CommonError::InvalidEnv {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
