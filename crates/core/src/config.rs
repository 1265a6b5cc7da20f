//! Device session configuration.
//!
//! Built in code with the builder methods, or loaded from TOML:
//!
//! ```toml
//! backend = "auto"        # auto | cuda | host
//! device_index = 0
//! pinned = false
//! host_memory_bytes = 1073741824
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GemmError, Result};

/// Default capacity of the host-emulated device (1 GiB).
pub const DEFAULT_HOST_MEMORY_BYTES: usize = 1 << 30;

/// Which compute backend a session should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Try CUDA, fall back to the host-emulated device (default).
    #[default]
    Auto,
    /// Require CUDA; session creation fails without it.
    Cuda,
    /// Always use the host-emulated device.
    Host,
}

/// Options for opening a device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Backend selection policy.
    pub backend: BackendKind,
    /// Ordinal of the GPU to bind.
    pub device_index: usize,
    /// Stage transfers through page-locked host memory.
    pub pinned: bool,
    /// Capacity reported and enforced by the host-emulated device.
    pub host_memory_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            device_index: 0,
            pinned: false,
            host_memory_bytes: DEFAULT_HOST_MEMORY_BYTES,
        }
    }
}

impl SessionConfig {
    /// Default configuration (`auto` backend, device 0, pageable transfers).
    pub fn new() -> Self {
        Self::default()
    }

    /// Host-emulated device with the given capacity.
    pub fn host(host_memory_bytes: usize) -> Self {
        Self::new()
            .backend(BackendKind::Host)
            .host_memory_bytes(host_memory_bytes)
    }

    /// Set the backend policy.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the GPU ordinal.
    pub fn device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    /// Enable or disable pinned staging for transfers.
    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Set the host-emulated device capacity.
    pub fn host_memory_bytes(mut self, bytes: usize) -> Self {
        self.host_memory_bytes = bytes;
        self
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(src).map_err(|e| GemmError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|source| GemmError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    /// Reject settings no backend can honour.
    pub fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Host && self.host_memory_bytes == 0 {
            return Err(GemmError::Config(
                "host backend requires host_memory_bytes > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::new();
        assert_eq!(cfg.backend, BackendKind::Auto);
        assert_eq!(cfg.device_index, 0);
        assert!(!cfg.pinned);
        assert_eq!(cfg.host_memory_bytes, DEFAULT_HOST_MEMORY_BYTES);
    }

    #[test]
    fn test_builder() {
        let cfg = SessionConfig::new()
            .backend(BackendKind::Cuda)
            .device_index(1)
            .pinned(true);
        assert_eq!(cfg.backend, BackendKind::Cuda);
        assert_eq!(cfg.device_index, 1);
        assert!(cfg.pinned);
    }

    #[test]
    fn test_from_toml_partial() {
        let cfg = SessionConfig::from_toml_str("backend = \"host\"\nhost_memory_bytes = 4096\n").unwrap();
        assert_eq!(cfg, SessionConfig::host(4096));
    }

    #[test]
    fn test_from_toml_rejects_unknown_backend() {
        let err = SessionConfig::from_toml_str("backend = \"opencl\"").unwrap_err();
        assert!(matches!(err, GemmError::Config(_)));
    }

    #[test]
    fn test_zero_host_capacity_rejected() {
        assert!(SessionConfig::from_toml_str("backend = \"host\"\nhost_memory_bytes = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pinned = true\ndevice_index = 2").unwrap();
        let cfg = SessionConfig::load(file.path()).unwrap();
        assert!(cfg.pinned);
        assert_eq!(cfg.device_index, 2);
        assert_eq!(cfg.backend, BackendKind::Auto);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SessionConfig::load("/nonexistent/batchgemm.toml").unwrap_err();
        assert!(matches!(err, GemmError::ConfigIo { .. }));
    }
}
