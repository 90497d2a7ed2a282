//! Environment overrides for worker thread counts and pipeline switches.

use crate::{Error, Result};
use std::env;

pub const CPU_THREADS_VAR: &str = "RUSTCV_CPU_THREADS";

fn read_var(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(v) => Ok(Some(v)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::ConfigError(format!("Failed to read {name}: {e}"))),
    }
}

/// Worker thread count requested through `RUSTCV_CPU_THREADS`, if set.
pub fn read_cpu_threads_from_env() -> Result<Option<usize>> {
    read_var(CPU_THREADS_VAR)?
        .map(|raw| parse_cpu_threads(&raw))
        .transpose()
}

pub fn parse_cpu_threads(raw: &str) -> Result<usize> {
    let parsed: usize = raw.trim().parse().map_err(|_| {
        Error::ConfigError(format!(
            "{CPU_THREADS_VAR} must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::ConfigError(format!("{CPU_THREADS_VAR} must be >= 1")));
    }
    Ok(parsed)
}

/// Boolean switch accepting `0`, `1`, `true`, `false`, `on`, `off` (case-insensitive).
pub fn read_bool_from_env(name: &str) -> Result<Option<bool>> {
    read_var(name)?.map(|raw| parse_bool(name, &raw)).transpose()
}

pub fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        _ => Err(Error::ConfigError(format!(
            "{name} must be one of 0/1/true/false, got '{raw}'"
        ))),
    }
}

/// Hardware threads on this machine, honouring `RUSTCV_CPU_THREADS` when it is valid.
pub fn available_cpu_threads() -> usize {
    match read_cpu_threads_from_env() {
        Ok(Some(n)) => n,
        Ok(None) => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        Err(e) => {
            tracing::warn!("ignoring thread override: {e}");
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
