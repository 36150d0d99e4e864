use crate::core::error::{Error, Result};
use crate::elevation::ElevationMethod;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/applyd/config.json";

/// Paths of the native tools each backend drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub iptables_save: String,
    pub iptables_restore: String,
    pub ip6tables_save: String,
    pub ip6tables_restore: String,
    pub ipset: String,
    pub ip: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            iptables_save: "/sbin/iptables-save".to_string(),
            iptables_restore: "/sbin/iptables-restore".to_string(),
            ip6tables_save: "/sbin/ip6tables-save".to_string(),
            ip6tables_restore: "/sbin/ip6tables-restore".to_string(),
            ipset: "/usr/sbin/ipset".to_string(),
            ip: "/sbin/ip".to_string(),
        }
    }
}

/// What to do when a tunnel of the same name exists with different endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelUpdatePolicy {
    /// Issue a plain add; the kernel rejects it while the old tunnel exists
    #[default]
    Add,
    /// Delete the existing tunnel, then add the new one
    Replace,
}

/// Complete applyd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the fragment directories (`<base_dir>/iptables`, `<base_dir>/route4`, ...)
    pub base_dir: PathBuf,
    pub tools: ToolPaths,
    pub elevation: ElevationMethod,
    /// JSON-lines record of every mutating command
    pub audit_log: Option<PathBuf>,
    /// Write tracing output here instead of stderr
    pub log_file: Option<PathBuf>,
    /// Upper bound on delete/requery rounds when removing an address everywhere
    pub vip_removal_max_rounds: u32,
    pub tunnel_update: TunnelUpdatePolicy,
    /// Treat "File exists" from `ip -6 neigh add proxy` as success
    pub neigh_proxy_tolerate_existing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/etc/apply.d"),
            tools: ToolPaths::default(),
            elevation: ElevationMethod::None,
            audit_log: None,
            log_file: None,
            vip_removal_max_rounds: 5,
            tunnel_update: TunnelUpdatePolicy::Add,
            neigh_proxy_tolerate_existing: true,
        }
    }
}

impl AppConfig {
    fn validate(&self) -> Result<()> {
        if self.vip_removal_max_rounds == 0 {
            return Err(Error::Config(
                "vip_removal_max_rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads the config from `path`, or returns defaults if the file does not exist.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed, or holds
/// out-of-range values.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let json = crate::utils::try_read_text_file(path, "")?;
    if json.trim().is_empty() {
        tracing::debug!(path = %path.display(), "No config file; using defaults");
        return Ok(AppConfig::default());
    }
    let config: AppConfig = serde_json::from_str(&json)?;
    config.validate()?;
    Ok(config)
}
