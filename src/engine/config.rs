//! Engine session configuration.

use std::path::PathBuf;

use crate::config::{parse_env_list, ConfigError};

/// Configuration for R engine sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// R executable used to start sessions.
    pub r_binary: PathBuf,
    /// Directory holding user-installed R packages (`R_LIBS_USER`).
    pub lib_user_path: PathBuf,
    /// Packages loaded once when a session starts.
    pub required_packages: Vec<String>,
    /// Package providing the analysis functions.
    pub api_package: String,
    /// X display used by plotting functions.
    pub display: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            r_binary: PathBuf::from("R"),
            lib_user_path: PathBuf::from("/root/workspace"),
            required_packages: vec!["plotrix".to_string(), "pals".to_string()],
            api_package: "pals".to_string(),
            display: "localhost:100.0".to_string(),
        }
    }
}

impl EngineConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ANALYSIS_R_BINARY`: R executable (default: R)
    /// - `ANALYSIS_R_LIBS_USER`: user library path (default: /root/workspace)
    /// - `ANALYSIS_R_PACKAGES`: comma-separated packages loaded at startup
    /// - `ANALYSIS_R_PACKAGE`: analysis API package (default: pals)
    /// - `ANALYSIS_R_DISPLAY`: X display for plotting (default: localhost:100.0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("ANALYSIS_R_BINARY") {
            config.r_binary = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANALYSIS_R_LIBS_USER") {
            config.lib_user_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("ANALYSIS_R_PACKAGES") {
            config.required_packages = parse_env_list(&val);
        }

        if let Ok(val) = std::env::var("ANALYSIS_R_PACKAGE") {
            config.api_package = val;
        }

        if let Ok(val) = std::env::var("ANALYSIS_R_DISPLAY") {
            config.display = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.r_binary.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "r_binary cannot be empty".to_string(),
            ));
        }

        if self.api_package.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_package cannot be empty".to_string(),
            ));
        }

        if self.required_packages.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "required_packages cannot contain empty names".to_string(),
            ));
        }

        Ok(())
    }

    /// Packages to load at startup, with the API package last and no repeats.
    pub fn packages_to_load(&self) -> Vec<&str> {
        let mut packages: Vec<&str> = Vec::new();
        for package in self
            .required_packages
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.api_package.as_str()))
        {
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        packages
    }

    pub fn with_r_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.r_binary = binary.into();
        self
    }

    pub fn with_lib_user_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lib_user_path = path.into();
        self
    }

    pub fn with_api_package(mut self, package: impl Into<String>) -> Self {
        self.api_package = package.into();
        self
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = display.into();
        self
    }
}
