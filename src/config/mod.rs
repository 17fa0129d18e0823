//! Execution-mode configuration
//!
//! The coherence layer never owns the decision of *where* code executes; it
//! only queries a mode snapshot. `ExecConfig` is that snapshot, held by the
//! `MemoryManager` as an explicitly owned value rather than process-global
//! state, so the single-logical-owner assumption stays visible in the API.
//!
//! # Environment Variables
//!
//! - `MEMFORGE_DEVICE`: "1"/"on" enables the device at startup
//! - `MEMFORGE_PROVIDER`: device provider selection ("host", "hip", "opencl")

use serde::{Deserialize, Serialize};

use crate::error::{MemForgeError, MemResult};

/// Environment variable enabling the device at startup
const DEVICE_ENV: &str = "MEMFORGE_DEVICE";

/// Environment variable selecting the device provider
const PROVIDER_ENV: &str = "MEMFORGE_PROVIDER";

/// Device memory provider selection
///
/// Exactly one provider is active for the lifetime of a manager; the choice
/// is never made per buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Device memory simulated with host allocations (default, used in tests)
    #[default]
    HostEmulation,
    /// Driver-managed linear device addresses (HIP)
    HipDriver,
    /// Opaque device memory objects (OpenCL)
    OpenCl,
}

impl ProviderKind {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "host" | "emulation" => Some(ProviderKind::HostEmulation),
            "hip" | "rocm" => Some(ProviderKind::HipDriver),
            "opencl" | "cl" => Some(ProviderKind::OpenCl),
            _ => None,
        }
    }
}

/// Snapshot of the execution mode the coherence layer is gated by
///
/// Three flags drive every operation:
/// - `active`: whether the manager tracks anything at all. Inactive means
///   every call is a passthrough no-op.
/// - `device_enabled`: whether kernels currently run on the device.
/// - `device_ever_enabled`: sticky; set the first time the device is enabled
///   and never cleared. Resolving an untracked address is fatal from that
///   point on, even while the device is currently disabled, whereas erasing
///   an untracked address is only fatal while the device is enabled *right
///   now*. That asymmetry is deliberate and preserved from the original
///   design.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    active: bool,
    device_enabled: bool,
    device_ever_enabled: bool,
    provider: ProviderKind,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            active: true,
            device_enabled: false,
            device_ever_enabled: false,
            provider: ProviderKind::default(),
        }
    }
}

impl ExecConfig {
    /// Create an active configuration with the device initially disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an inactive configuration (the manager passes every call through)
    pub fn inactive() -> Self {
        ExecConfig {
            active: false,
            ..Self::default()
        }
    }

    /// Build a configuration from environment variables
    pub fn from_env() -> MemResult<Self> {
        let mut config = Self::new();

        if let Ok(value) = std::env::var(PROVIDER_ENV) {
            config.provider = ProviderKind::from_str(&value).ok_or_else(|| {
                MemForgeError::InvalidConfiguration(format!(
                    "unrecognized {} value: {}",
                    PROVIDER_ENV, value
                ))
            })?;
        }

        if let Ok(value) = std::env::var(DEVICE_ENV) {
            match value.to_lowercase().as_str() {
                "1" | "on" | "true" => config.enable_device(),
                "0" | "off" | "false" => {}
                other => {
                    return Err(MemForgeError::InvalidConfiguration(format!(
                        "unrecognized {} value: {}",
                        DEVICE_ENV, other
                    )))
                }
            }
        }

        Ok(config)
    }

    /// Set the device provider
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    /// Enable device execution; also sets the sticky `device_ever_enabled` flag
    pub fn enable_device(&mut self) {
        self.device_enabled = true;
        self.device_ever_enabled = true;
    }

    /// Disable device execution; `device_ever_enabled` stays set
    pub fn disable_device(&mut self) {
        self.device_enabled = false;
    }

    /// Whether the manager tracks buffers at all
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the device is currently enabled
    pub fn device_enabled(&self) -> bool {
        self.device_enabled
    }

    /// Whether a device has ever been enabled on this configuration
    pub fn device_ever_enabled(&self) -> bool {
        self.device_ever_enabled
    }

    /// Whether operations should target the device right now
    pub fn using_device(&self) -> bool {
        self.active && self.device_enabled
    }

    /// The configured device provider
    pub fn provider(&self) -> ProviderKind {
        self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_is_active_host_only() {
        let config = ExecConfig::new();
        assert!(config.is_active());
        assert!(!config.device_enabled());
        assert!(!config.device_ever_enabled());
        assert!(!config.using_device());
        assert_eq!(config.provider(), ProviderKind::HostEmulation);
    }

    #[test]
    fn test_inactive() {
        let config = ExecConfig::inactive();
        assert!(!config.is_active());
        assert!(!config.using_device());
    }

    #[test]
    fn test_ever_enabled_is_sticky() {
        let mut config = ExecConfig::new();
        config.enable_device();
        assert!(config.device_enabled());
        assert!(config.device_ever_enabled());

        config.disable_device();
        assert!(!config.device_enabled());
        assert!(config.device_ever_enabled());
        assert!(!config.using_device());
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!(
            ProviderKind::from_str("host"),
            Some(ProviderKind::HostEmulation)
        );
        assert_eq!(ProviderKind::from_str("hip"), Some(ProviderKind::HipDriver));
        assert_eq!(ProviderKind::from_str("rocm"), Some(ProviderKind::HipDriver));
        assert_eq!(ProviderKind::from_str("OpenCL"), Some(ProviderKind::OpenCl));
        assert_eq!(ProviderKind::from_str("cuda"), None);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        std::env::remove_var(DEVICE_ENV);
        std::env::remove_var(PROVIDER_ENV);
        let config = ExecConfig::from_env().unwrap();
        assert!(!config.device_enabled());
        assert_eq!(config.provider(), ProviderKind::HostEmulation);
    }

    #[test]
    #[serial]
    fn test_from_env_device_on() {
        std::env::set_var(DEVICE_ENV, "on");
        std::env::set_var(PROVIDER_ENV, "hip");
        let config = ExecConfig::from_env().unwrap();
        assert!(config.device_enabled());
        assert!(config.device_ever_enabled());
        assert_eq!(config.provider(), ProviderKind::HipDriver);
        std::env::remove_var(DEVICE_ENV);
        std::env::remove_var(PROVIDER_ENV);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var(PROVIDER_ENV, "quantum");
        let err = ExecConfig::from_env().unwrap_err();
        assert!(matches!(err, MemForgeError::InvalidConfiguration(_)));
        std::env::remove_var(PROVIDER_ENV);
    }
}
