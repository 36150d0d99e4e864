//! Privilege elevation for native networking tools
//!
//! applyd normally runs as root from a boot script or a config-management
//! hook. When it does not, every native tool invocation can be wrapped in an
//! elevation helper.
//!
//! # Elevation Strategy
//!
//! 1. Running as root: the tool is executed directly.
//! 2. `APPLYD_ELEVATION_METHOD` set: that method is used (`none`, `sudo`, `run0`, `pkexec`).
//! 3. Otherwise the method from the config file is used (default `none`).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - The elevation helper binary is checked for availability

use serde::{Deserialize, Serialize};
use std::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `APPLYD_ELEVATION_METHOD`
    #[error("Invalid APPLYD_ELEVATION_METHOD '{0}'. Valid options: none, sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// How native tools are elevated when applyd is not running as root
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ElevationMethod {
    #[default]
    None,
    Sudo,
    Run0,
    Pkexec,
}

impl ElevationMethod {
    /// Resolves the effective method, letting the environment override the config.
    pub fn resolve(configured: Self) -> Result<Self, ElevationError> {
        match std::env::var("APPLYD_ELEVATION_METHOD") {
            Ok(method) if !method.is_empty() => method
                .parse()
                .map_err(|_| ElevationError::InvalidMethod(method)),
            _ => Ok(configured),
        }
    }

    fn helper(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sudo => Some("sudo"),
            Self::Run0 => Some("run0"),
            Self::Pkexec => Some("pkexec"),
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Returns true when the current process runs with uid 0
pub fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

/// Builds a command for `program`, wrapped in the elevation helper if needed.
///
/// # Errors
///
/// Returns `MethodNotAvailable` if the helper binary is not in PATH.
pub fn build_command(
    method: ElevationMethod,
    program: &str,
    args: &[String],
) -> Result<Command, ElevationError> {
    let helper = if is_root() { None } else { method.helper() };

    match helper {
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        Some(helper) => {
            if !binary_exists(helper) {
                return Err(ElevationError::MethodNotAvailable(helper.to_string()));
            }
            let mut cmd = Command::new(helper);
            cmd.arg(program).args(args);
            Ok(cmd)
        }
    }
}
