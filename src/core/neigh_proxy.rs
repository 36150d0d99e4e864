//! IPv6 neighbor proxy entries
//!
//! `ip` offers no listing of proxy entries that this backend relies on, so
//! there is no current state: every entry in every fragment is added on each
//! pass. A fragment line looks like the command that would create it,
//! `ip -6 neigh add proxy 2001:db8::5 dev eth0`, or just `proxy 2001:db8::5`.

use crate::command::{Executor, Invocation};
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::utils;
use std::path::Path;
use tracing::{debug, info};

/// Output of `ip neigh add` when the entry is already present
const ALREADY_EXISTS: &str = "File exists";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NeighborProxy {
    // Field order gives the (device, address) sort order
    pub device: Option<String>,
    pub address: String,
}

impl NeighborProxy {
    fn add_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-6", "neigh", "add", "proxy", self.address.as_str()]
            .iter()
            .map(ToString::to_string)
            .collect();
        if let Some(device) = &self.device {
            args.push("dev".to_string());
            args.push(device.clone());
        }
        args
    }
}

/// Parses a fragment into entries sorted by device, then address.
///
/// Keywords are case-insensitive; values are kept as written. `ip`, `-6`,
/// `neigh` and `add` are noise; `proxy` and `dev` take a value. Lines without
/// `proxy` yield no entry.
pub fn parse_proxies(text: &str, origin: &str) -> Result<Vec<NeighborProxy>> {
    let mut entries = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut address = None;
        let mut device = None;
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            let keyword = token.to_ascii_lowercase();
            match keyword.as_str() {
                "ip" | "-6" | "neigh" | "add" => {}
                "proxy" | "dev" => {
                    let Some(value) = tokens.next() else {
                        return Err(Error::parse(
                            origin,
                            line,
                            format!("missing value for '{keyword}'"),
                        ));
                    };
                    if keyword == "proxy" {
                        address = Some(value.to_string());
                    } else {
                        device = Some(value.to_string());
                    }
                }
                _ => {
                    return Err(Error::parse(origin, line, format!("unknown token '{token}'")));
                }
            }
        }

        if let Some(address) = address {
            entries.push(NeighborProxy { device, address });
        }
    }

    entries.sort();
    Ok(entries)
}

pub struct NeighborProxyReconciler<'a> {
    exec: &'a Executor,
    tool: String,
    tolerate_existing: bool,
}

impl<'a> NeighborProxyReconciler<'a> {
    pub fn new(exec: &'a Executor, tool: impl Into<String>, tolerate_existing: bool) -> Self {
        Self {
            exec,
            tool: tool.into(),
            tolerate_existing,
        }
    }

    fn add(&self, proxy: &NeighborProxy) -> Result<()> {
        let inv = Invocation::new(&self.tool).args(proxy.add_args());
        let Err(e) = self.exec.mutate("ip6neigh", &inv) else {
            return Ok(());
        };

        let output = e.tool_output().unwrap_or_default();
        if self.tolerate_existing && output.contains(ALREADY_EXISTS) {
            debug!(address = %proxy.address, "ip6neigh: Proxy entry already present");
            return Ok(());
        }
        Err(e)
    }
}

impl Reconciler for NeighborProxyReconciler<'_> {
    fn backend(&self) -> Backend {
        Backend::Ip6Neigh
    }

    fn apply(&mut self, dir: &Path) -> Result<()> {
        if !backend::fragment_dir_present(self.backend(), dir)? {
            return Ok(());
        }

        for name in utils::list_file_names(dir)? {
            let text = backend::read_fragment(dir, &name)?;
            let proxies = parse_proxies(&text, &dir.join(&name).display().to_string())?;

            info!(file = %name, entries = proxies.len(), "ip6neigh: Applying");
            for proxy in &proxies {
                self.add(proxy)?;
            }
        }
        Ok(())
    }
}
