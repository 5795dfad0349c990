use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VmmError};

/// Base of the demo guest's single memory slot.
pub const DEFAULT_GUEST_BASE: u64 = 0xF0000;
/// Size of the demo guest's single memory slot (64 KiB).
pub const DEFAULT_GUEST_SIZE: u64 = 0x10000;

/// Main configuration for one guest run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmConfig {
    /// API version the host must report
    pub expected_api_version: i32,
    /// Caller-assigned vCPU id
    pub vcpu_id: u64,
    /// Guest memory slots, attached in order
    pub memory: Vec<MemorySlotConfig>,
    /// Initial instruction pointer
    pub entry_point: u64,
    /// Guest-physical address the payload is copied to
    pub payload_addr: u64,
    /// Raw guest image (None = built-in demo guest)
    pub payload: Option<PathBuf>,
    /// Switch the vCPU to flat 32-bit protected mode before the first resume
    pub flat_protected_mode: bool,
    /// What to do with exit reasons the dispatcher does not model
    pub unknown_exits: UnknownExitPolicy,
    /// Port I/O backend
    pub io: IoMode,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            expected_api_version: kvm_bindings::KVM_API_VERSION as i32,
            vcpu_id: 0,
            memory: vec![MemorySlotConfig {
                slot: 0,
                guest_phys_addr: DEFAULT_GUEST_BASE,
                size: DEFAULT_GUEST_SIZE,
                read_only: false,
                log_dirty: false,
            }],
            entry_point: DEFAULT_GUEST_BASE,
            payload_addr: DEFAULT_GUEST_BASE,
            payload: None,
            flat_protected_mode: true,
            unknown_exits: UnknownExitPolicy::Fatal,
            io: IoMode::Console,
        }
    }
}

/// One guest-physical memory slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySlotConfig {
    pub slot: u32,
    pub guest_phys_addr: u64,
    pub size: u64,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub log_dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownExitPolicy {
    /// Stop the run loop and surface `UnknownExit`.
    #[default]
    Fatal,
    /// Log the exit and resume the guest. Must be opted into.
    LogAndContinue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Prompt on stdin for input, print received values to stdout.
    #[default]
    Console,
    /// In-memory echo: reads return the last value written to the port.
    Echo,
}

impl VmmConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| VmmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VmmError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Checks that do not need the host. Alignment and overlap are left to
    /// the VM, which knows the host page size.
    pub fn validate(&self) -> Result<()> {
        if self.memory.is_empty() {
            return Err(VmmError::Config("at least one memory slot is required".into()));
        }
        if let Some(m) = self.memory.iter().find(|m| m.size == 0) {
            return Err(VmmError::Config(format!("memory slot {} has zero size", m.slot)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_matches_demo_layout() {
        let config = VmmConfig::default();
        assert_eq!(config.expected_api_version, 12);
        assert_eq!(config.memory.len(), 1);
        assert_eq!(config.memory[0].guest_phys_addr, 0xF0000);
        assert_eq!(config.memory[0].size, 0x10000);
        assert_eq!(config.unknown_exits, UnknownExitPolicy::Fatal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            VmmConfig::from_json_str(r#"{ "unknown_exits": "log_and_continue", "io": "echo" }"#)
                .unwrap();
        assert_eq!(config.unknown_exits, UnknownExitPolicy::LogAndContinue);
        assert_eq!(config.io, IoMode::Echo);
        assert_eq!(config.entry_point, DEFAULT_GUEST_BASE);
    }

    #[test]
    fn test_rejects_empty_memory() {
        let err = VmmConfig::from_json_str(r#"{ "memory": [] }"#).unwrap_err();
        assert!(matches!(err, VmmError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_sized_slot() {
        let json = r#"{ "memory": [ { "slot": 3, "guest_phys_addr": 0, "size": 0 } ] }"#;
        let err = VmmConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("slot 3"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "vcpu_id": 4, "memory": [ {{ "slot": 1, "guest_phys_addr": 4096, "size": 8192, "read_only": true }} ] }}"#
        )
        .unwrap();

        let config = VmmConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.vcpu_id, 4);
        assert_eq!(config.memory[0].slot, 1);
        assert!(config.memory[0].read_only);
        assert!(!config.memory[0].log_dirty);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = VmmConfig::from_json_file(Path::new("/nonexistent/microvmm.json")).unwrap_err();
        assert!(matches!(err, VmmError::Config(_)));
    }
}
