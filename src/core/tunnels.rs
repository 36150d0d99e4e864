//! ip6ip6 tunnel reconciliation
//!
//! The fragment file name is the tunnel name; its content is the spec in
//! `ip -6 tunnel show` form (`ipv6/ipv6 remote R local L ...`). Only mode
//! and endpoints are modeled. Kernel tunnels without a fragment are left
//! alone.

use crate::command::{Executor, Invocation};
use crate::config::TunnelUpdatePolicy;
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::{utils, validators};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Mode keyword as printed by `ip -6 tunnel show`
pub const SHOW_MODE: &str = "ipv6/ipv6";

/// Mode keyword accepted by `ip -6 tunnel add`
pub const ADD_MODE: &str = "ip6ip6";

/// Reported attributes that are accepted but not modeled
const IGNORED_ATTRS: &[&str] = &[
    "encaplimit",
    "hoplimit",
    "tclass",
    "flowlabel",
    "flowinfo",
    "(flowinfo",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub name: String,
    pub mode: String,
    pub local: Option<String>,
    pub remote: Option<String>,
}

impl Tunnel {
    /// Parses a spec such as `ipv6/ipv6 remote 2001:db8::2 local 2001:db8::1 hoplimit 64`.
    pub fn parse(name: &str, spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let mut fields = spec.split_whitespace();

        match fields.next() {
            Some(SHOW_MODE) => {}
            Some(other) => {
                return Err(Error::parse(name, spec, format!("unsupported tunnel mode '{other}'")));
            }
            None => return Err(Error::parse(name, spec, "empty tunnel spec")),
        }

        let mut tunnel = Tunnel {
            name: name.to_string(),
            mode: ADD_MODE.to_string(),
            local: None,
            remote: None,
        };

        while let Some(key) = fields.next() {
            let Some(value) = fields.next() else {
                return Err(Error::parse(name, spec, format!("missing value for '{key}'")));
            };
            match key {
                "local" => tunnel.local = Some(value.to_string()),
                "remote" => tunnel.remote = Some(value.to_string()),
                k if IGNORED_ATTRS.contains(&k) => {}
                other => {
                    return Err(Error::parse(name, spec, format!("unknown key '{other}'")));
                }
            }
        }

        Ok(tunnel)
    }

    /// Mode and endpoints equal; unmodeled attributes are not compared.
    pub fn matches(&self, other: &Tunnel) -> bool {
        self.mode == other.mode && self.local == other.local && self.remote == other.remote
    }

    fn add_args(&self) -> Vec<String> {
        let mut args = vec![
            "-6".to_string(),
            "tunnel".to_string(),
            "add".to_string(),
            self.name.clone(),
            "mode".to_string(),
            self.mode.clone(),
        ];
        if let Some(local) = &self.local {
            args.extend(["local".to_string(), local.clone()]);
        }
        if let Some(remote) = &self.remote {
            args.extend(["remote".to_string(), remote.clone()]);
        }
        args
    }
}

/// Parses `ip -6 tunnel show` output, keeping only ip6ip6 tunnels.
pub fn parse_tunnel_list(output: &str) -> Result<BTreeMap<String, Tunnel>> {
    let mut tunnels = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((label, spec)) = line.split_once(char::is_whitespace) else {
            return Err(Error::parse("tunnel show", line, "expected '<name>: <spec>'"));
        };
        let Some(name) = label.strip_suffix(':') else {
            return Err(Error::parse("tunnel show", line, "expected '<name>: <spec>'"));
        };
        if spec.split_whitespace().next() != Some(SHOW_MODE) {
            debug!(tunnel = %name, "Skipping tunnel with unmanaged mode");
            continue;
        }
        tunnels.insert(name.to_string(), Tunnel::parse(name, spec)?);
    }
    Ok(tunnels)
}

pub struct TunnelReconciler<'a> {
    exec: &'a Executor,
    tool: String,
    update: TunnelUpdatePolicy,
}

impl<'a> TunnelReconciler<'a> {
    pub fn new(exec: &'a Executor, tool: impl Into<String>, update: TunnelUpdatePolicy) -> Self {
        Self {
            exec,
            tool: tool.into(),
            update,
        }
    }

    pub fn current_state(&self) -> Result<BTreeMap<String, Tunnel>> {
        let show = Invocation::new(&self.tool).args(["-6", "tunnel", "show"]);
        let output = self.exec.query(&show)?;
        parse_tunnel_list(&output)
    }

    fn read_fragment(dir: &Path, name: &str) -> Result<Tunnel> {
        let origin = dir.join(name).display().to_string();
        if let Err(message) = validators::validate_interface_name(name) {
            return Err(Error::Validation {
                field: origin,
                message,
            });
        }
        let text = backend::read_fragment(dir, name)?;
        Tunnel::parse(name, &text).map_err(|e| match e {
            Error::Parse { line, reason, .. } => Error::parse(origin, line, reason),
            other => other,
        })
    }

    fn create(&self, tunnel: &Tunnel) -> Result<()> {
        info!(tunnel = %tunnel.name, "tunnel: Creating");
        let add = Invocation::new(&self.tool).args(tunnel.add_args());
        self.exec.mutate("tunnel", &add)?;
        Ok(())
    }
}

impl Reconciler for TunnelReconciler<'_> {
    fn backend(&self) -> Backend {
        Backend::Tunnel
    }

    fn apply(&mut self, dir: &Path) -> Result<()> {
        if !backend::fragment_dir_present(self.backend(), dir)? {
            return Ok(());
        }

        let mut unmanaged = self.current_state()?;

        for name in utils::list_file_names(dir)? {
            let desired = Self::read_fragment(dir, &name)?;

            match unmanaged.remove(&name) {
                Some(current) if current.matches(&desired) => {
                    debug!(tunnel = %name, "tunnel: Configuration matches");
                }
                Some(current) => match self.update {
                    TunnelUpdatePolicy::Add => {
                        warn!(
                            tunnel = %name,
                            current_local = ?current.local,
                            current_remote = ?current.remote,
                            "tunnel: Endpoints changed; adding over the existing tunnel"
                        );
                        self.create(&desired)?;
                    }
                    TunnelUpdatePolicy::Replace => {
                        info!(tunnel = %name, "tunnel: Endpoints changed; replacing");
                        let del = Invocation::new(&self.tool)
                            .args(["-6", "tunnel", "del", name.as_str()]);
                        self.exec.mutate("tunnel", &del)?;
                        self.create(&desired)?;
                    }
                },
                None => self.create(&desired)?,
            }
        }

        for name in unmanaged.keys() {
            info!(tunnel = %name, "tunnel: Ignoring tunnel not on disk");
        }
        Ok(())
    }
}
