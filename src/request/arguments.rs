//! Typed extraction of request arguments.
//!
//! Handlers call into `Arguments` before doing any work so that a missing or
//! malformed argument is rejected before files are staged or the engine is
//! touched.

use std::collections::HashMap;

use url::Url;

use super::types::ArgValue;
use crate::error::AnalysisError;

/// Read-only view over a request's argument map.
#[derive(Debug, Clone, Copy)]
pub struct Arguments<'a> {
    values: &'a HashMap<String, ArgValue>,
}

impl<'a> Arguments<'a> {
    pub fn new(values: &'a HashMap<String, ArgValue>) -> Self {
        Self { values }
    }

    fn get(&self, name: &str) -> Result<&'a ArgValue, AnalysisError> {
        self.values
            .get(name)
            .ok_or_else(|| AnalysisError::MissingArgument(name.to_string()))
    }

    /// Returns a required, non-empty string argument.
    pub fn string(&self, name: &str) -> Result<&'a str, AnalysisError> {
        match self.get(name)? {
            ArgValue::String(s) if !s.trim().is_empty() => Ok(s.as_str()),
            ArgValue::String(_) => Err(AnalysisError::invalid_argument(name, "must not be empty")),
            other => Err(AnalysisError::invalid_argument(
                name,
                format!("expected a string, got a {}", other.type_name()),
            )),
        }
    }

    /// Returns an optional string argument.
    pub fn optional_string(&self, name: &str) -> Result<Option<&'a str>, AnalysisError> {
        if self.values.contains_key(name) {
            self.string(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Returns a required finite number. Numbers sent as strings are accepted.
    pub fn number(&self, name: &str) -> Result<f64, AnalysisError> {
        let value = match self.get(name)? {
            ArgValue::Number(n) => *n,
            ArgValue::String(s) => s.trim().parse::<f64>().map_err(|_| {
                AnalysisError::invalid_argument(name, format!("'{}' is not a number", s))
            })?,
            ArgValue::Boolean(_) => {
                return Err(AnalysisError::invalid_argument(
                    name,
                    "expected a number, got a boolean",
                ))
            }
        };

        if !value.is_finite() {
            return Err(AnalysisError::invalid_argument(name, "must be a finite number"));
        }
        Ok(value)
    }

    /// Returns a required URL argument.
    pub fn url(&self, name: &str) -> Result<Url, AnalysisError> {
        let raw = self.string(name)?;
        Url::parse(raw).map_err(|e| {
            AnalysisError::invalid_argument(name, format!("malformed URL '{}': {}", raw, e))
        })
    }
}
