//! The reconciler seam shared by every backend
//!
//! Each backend implements [`Reconciler`]: read current kernel state, read
//! and merge the fragment directory, compute what differs and run the native
//! commands that close the gap. The trait only fixes the entry point; parse,
//! normalize, diff and apply are entirely backend specific.

use crate::core::error::Result;
use crate::utils;
use std::path::Path;
use tracing::info;

/// Kernel state domains applyd converges, in the order they are applied.
///
/// The `Display` form is the name of the backend's fragment subdirectory.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Backend {
    /// Sets go first: iptables rules may reference them
    Ipset,
    Iptables,
    Ip6tables,
    #[strum(serialize = "ip6neigh")]
    Ip6Neigh,
    Tunnel,
    Vips,
    Route4,
    Route6,
}

impl Backend {
    pub const fn description(self) -> &'static str {
        match self {
            Backend::Ipset => "ipsets (atomic swap on change)",
            Backend::Iptables => "IPv4 firewall (atomic iptables-restore)",
            Backend::Ip6tables => "IPv6 firewall (atomic ip6tables-restore)",
            Backend::Ip6Neigh => "IPv6 neighbor proxies (always applied)",
            Backend::Tunnel => "ip6ip6 tunnels (add-only)",
            Backend::Vips => "interface addresses (add or remove everywhere)",
            Backend::Route4 => "IPv4 routes (add-only)",
            Backend::Route6 => "IPv6 routes (add-only)",
        }
    }
}

/// Converges one backend's kernel state to a fragment directory.
pub trait Reconciler {
    fn backend(&self) -> Backend;

    /// Runs one query → merge → diff → apply pass against `dir`.
    ///
    /// A missing `dir` is not an error: nothing is queried or changed.
    fn apply(&mut self, dir: &Path) -> Result<()>;
}

/// Returns whether `dir` exists, logging the skip when it does not.
pub(crate) fn fragment_dir_present(backend: Backend, dir: &Path) -> Result<bool> {
    if utils::is_directory(dir)? {
        Ok(true)
    } else {
        info!(%backend, dir = %dir.display(), "Directory not found; skipping");
        Ok(false)
    }
}

/// Reads one fragment file; a file that vanished mid-pass reads as empty.
pub(crate) fn read_fragment(dir: &Path, name: &str) -> Result<String> {
    Ok(utils::try_read_text_file(&dir.join(name), "")?)
}
