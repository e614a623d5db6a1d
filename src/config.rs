//!
//! Kernel configuration.
//!
//! Everything has a default, so `KernelConfig::default()` is a complete,
//! valid configuration. A JSON document only needs the fields it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelResult, Status};
use crate::object::handle::MAX_HANDLE_COUNT;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Ceiling on outstanding handles across every handle table.
    pub max_handles: usize,
    /// Outstanding handle count above which allocations log a warning.
    /// Defaults to 7/8 of `max_handles`.
    pub high_handle_count: Option<usize>,
    /// Program entry the first process is started at.
    pub userboot_entry: String,
    /// Arguments carried in the bootstrap message.
    pub userboot_args: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_handles: MAX_HANDLE_COUNT,
            high_handle_count: None,
            userboot_entry: "userboot".to_string(),
            userboot_args: Vec::new(),
        }
    }
}

impl KernelConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> KernelResult<Self> {
        let config: KernelConfig = serde_json::from_str(json).map_err(|e| {
            tracing::warn!(error = %e, "rejecting malformed kernel configuration");
            Status::InvalidArgs
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            tracing::warn!(path = %path.as_ref().display(), error = %e, "cannot read kernel configuration");
            Status::NotFound
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> KernelResult<()> {
        if self.max_handles == 0 || self.max_handles > MAX_HANDLE_COUNT {
            return Err(Status::InvalidArgs);
        }
        if matches!(self.high_handle_count, Some(high) if high > self.max_handles) {
            return Err(Status::InvalidArgs);
        }
        if self.userboot_entry.is_empty() {
            return Err(Status::InvalidArgs);
        }
        Ok(())
    }

    pub fn high_handle_count(&self) -> usize {
        self.high_handle_count
            .unwrap_or((self.max_handles * 7) / 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = KernelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_handles, 256 * 1024);
        assert_eq!(config.high_handle_count(), 7 * 32 * 1024);
        assert_eq!(config.userboot_entry, "userboot");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = KernelConfig::from_json(r#"{ "max_handles": 64, "userboot_args": ["-v"] }"#)
            .expect("valid config");
        assert_eq!(config.max_handles, 64);
        assert_eq!(config.high_handle_count(), 56);
        assert_eq!(config.userboot_args, vec!["-v".to_string()]);
        assert_eq!(config.userboot_entry, "userboot");
    }

    #[test]
    fn out_of_range_ceilings_are_rejected() {
        assert_eq!(KernelConfig::from_json(r#"{ "max_handles": 0 }"#), Err(Status::InvalidArgs));
        assert_eq!(
            KernelConfig::from_json(r#"{ "max_handles": 99999999 }"#),
            Err(Status::InvalidArgs)
        );
        assert_eq!(
            KernelConfig::from_json(r#"{ "max_handles": 8, "high_handle_count": 9 }"#),
            Err(Status::InvalidArgs)
        );
        assert_eq!(KernelConfig::from_json("not json"), Err(Status::InvalidArgs));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "userboot_entry": "init" }}"#).expect("write config");
        let config = KernelConfig::load(file.path()).expect("load");
        assert_eq!(config.userboot_entry, "init");

        let missing = file.path().with_extension("missing");
        assert_eq!(KernelConfig::load(missing), Err(Status::NotFound));
    }
}
