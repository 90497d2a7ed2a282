//! Tagged parameter documents for disparity methods.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Parameters of one disparity method, tagged with the method's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodParams {
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl MethodParams {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Map::new(),
        }
    }

    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> Result<Self> {
        self.set(key, value)?;
        Ok(self)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        self.params.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Typed lookup; `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.params
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| {
                    Error::InvalidParameters(format!(
                        "parameter '{key}' of method '{}': {e}",
                        self.method
                    ))
                })
            })
            .transpose()
    }

    /// Fails unless these parameters were exported by `expected`.
    pub fn check_method(&self, expected: &str) -> Result<()> {
        if self.method == expected {
            Ok(())
        } else {
            Err(Error::ConfigError(format!(
                "parameters belong to method '{}', not '{expected}'",
                self.method
            )))
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            Error::ConfigError(format!("cannot write parameters to {}: {e}", path.display()))
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::ConfigError(format!("cannot read parameters from {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}
