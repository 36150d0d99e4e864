//! iptables / ip6tables reconciliation
//!
//! Current state comes from `iptables-save`, desired state from the union of
//! every fragment file in the directory (same save/restore syntax). Both are
//! normalized so the kernel's spelling of a rule compares equal to the
//! fragment's. If anything differs the whole desired ruleset is handed to
//! `iptables-restore` in one atomic replace; there is no per-rule patching.
//!
//! # Merge semantics
//!
//! - tables and chains are unioned by name
//! - rules of a chain are concatenated in fragment order (order is semantic)
//! - a chain policy of `-` yields to a concrete one; two different concrete
//!   policies resolve to the later fragment, with a warning

use crate::command::{Executor, Invocation};
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::utils;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

/// Policy placeholder for user-defined chains
pub const NO_POLICY: &str = "-";

/// Name of the fragment written by `save`
pub const SAVED_FRAGMENT: &str = "10-saved";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Arguments after `-A <chain>`
    pub spec: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub default_policy: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    fn new(name: &str, default_policy: &str) -> Self {
        Self {
            name: name.to_string(),
            default_policy: default_policy.to_string(),
            rules: Vec::new(),
        }
    }

    fn merge(&mut self, other: Chain) {
        if self.default_policy != other.default_policy {
            if is_unset(&self.default_policy) {
                self.default_policy = other.default_policy;
            } else if !is_unset(&other.default_policy) {
                warn!(
                    chain = %self.name,
                    old = %self.default_policy,
                    new = %other.default_policy,
                    "Merging different default policies; later fragment wins"
                );
                self.default_policy = other.default_policy;
            }
        }
        if self.default_policy.is_empty() {
            self.default_policy = NO_POLICY.to_string();
        }
        self.rules.extend(other.rules);
    }

    fn matches(&self, other: &Chain) -> bool {
        if self.default_policy != other.default_policy {
            debug!(chain = %self.name, desired = %self.default_policy, current = %other.default_policy, "Policy mismatch");
            return false;
        }
        if self.rules.len() != other.rules.len() {
            debug!(chain = %self.name, desired = self.rules.len(), current = other.rules.len(), "Rule count mismatch");
            return false;
        }
        for (a, b) in self.rules.iter().zip(&other.rules) {
            if a.spec != b.spec {
                debug!(chain = %self.name, desired = %a.spec, current = %b.spec, "Rule mismatch");
                return false;
            }
        }
        true
    }
}

fn is_unset(policy: &str) -> bool {
    policy.is_empty() || policy == NO_POLICY
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub chains: BTreeMap<String, Chain>,
}

impl Table {
    fn merge(&mut self, other: Table) {
        for (name, chain) in other.chains {
            match self.chains.get_mut(&name) {
                Some(existing) => existing.merge(chain),
                None => {
                    self.chains.insert(name, chain);
                }
            }
        }
    }

    fn matches(&self, other: &Table) -> bool {
        self.chains.len() == other.chains.len()
            && self.chains.iter().all(|(name, chain)| {
                other.chains.get(name).is_some_and(|o| chain.matches(o))
            })
    }
}

/// A parsed `iptables-save` dump or fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesState {
    pub ipv6: bool,
    pub tables: BTreeMap<String, Table>,
}

impl IptablesState {
    pub fn new(ipv6: bool) -> Self {
        Self {
            ipv6,
            tables: BTreeMap::new(),
        }
    }

    /// Parses save/restore text and normalizes the result.
    ///
    /// `origin` names the source (file path or tool) in error messages.
    pub fn parse(ipv6: bool, text: &str, origin: &str) -> Result<Self> {
        let mut state = Self::new(ipv6);
        let mut current: Option<String> = None;

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('*') {
                if state.tables.contains_key(name) {
                    return Err(Error::DuplicateEntity {
                        kind: "table",
                        name: name.to_string(),
                        origin: origin.to_string(),
                    });
                }
                state.tables.insert(
                    name.to_string(),
                    Table {
                        name: name.to_string(),
                        chains: BTreeMap::new(),
                    },
                );
                current = Some(name.to_string());
            } else if let Some(decl) = line.strip_prefix(':') {
                // `:INPUT ACCEPT [12:3456]`, counters ignored
                let fields: Vec<&str> = decl.split_whitespace().collect();
                if fields.len() < 2 {
                    return Err(Error::parse(origin, line, "chain declaration needs a policy"));
                }
                let table = open_table(&mut state, current.as_deref(), origin, line)?;
                if table.chains.contains_key(fields[0]) {
                    return Err(Error::DuplicateEntity {
                        kind: "chain",
                        name: fields[0].to_string(),
                        origin: origin.to_string(),
                    });
                }
                table
                    .chains
                    .insert(fields[0].to_string(), Chain::new(fields[0], fields[1]));
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let mut fields = rest.split_whitespace();
                let Some(chain_name) = fields.next() else {
                    return Err(Error::parse(origin, line, "rule without chain"));
                };
                let spec = fields.collect::<Vec<_>>().join(" ");
                let table = open_table(&mut state, current.as_deref(), origin, line)?;
                table
                    .chains
                    .entry(chain_name.to_string())
                    .or_insert_with(|| Chain::new(chain_name, ""))
                    .rules
                    .push(Rule { spec });
            } else if line == "COMMIT" {
                if current.take().is_none() {
                    return Err(Error::parse(origin, line, "unexpected COMMIT"));
                }
            } else {
                return Err(Error::parse(origin, line, "unrecognized line"));
            }
        }

        state.normalize();
        Ok(state)
    }

    /// Canonicalizes rule specs and fills in missing chain policies.
    pub fn normalize(&mut self) {
        let ipv6 = self.ipv6;
        for table in self.tables.values_mut() {
            for chain in table.chains.values_mut() {
                if chain.default_policy.is_empty() {
                    chain.default_policy = NO_POLICY.to_string();
                }
                for rule in &mut chain.rules {
                    rule.spec = normalize_rule_spec(&rule.spec, ipv6);
                }
            }
        }
    }

    /// Merges a later fragment into this state.
    pub fn merge(&mut self, other: IptablesState) -> Result<()> {
        if self.ipv6 != other.ipv6 {
            return Err(Error::Validation {
                field: "ipv6".to_string(),
                message: "cannot merge IPv4 and IPv6 tables".to_string(),
            });
        }
        for (name, table) in other.tables {
            match self.tables.get_mut(&name) {
                Some(existing) => existing.merge(table),
                None => {
                    self.tables.insert(name, table);
                }
            }
        }
        Ok(())
    }

    /// Deep, order-sensitive comparison of two normalized states.
    pub fn matches(&self, other: &IptablesState) -> bool {
        self.ipv6 == other.ipv6
            && self.tables.len() == other.tables.len()
            && self.tables.iter().all(|(name, table)| {
                other.tables.get(name).is_some_and(|o| table.matches(o))
            })
    }

    /// Renders restore-file syntax: per table, all chain declarations, then all rules.
    pub fn to_restore_text(&self) -> String {
        let mut out = String::new();
        for table in self.tables.values() {
            let _ = writeln!(out, "*{}", table.name);
            for chain in table.chains.values() {
                let policy = if chain.default_policy.is_empty() {
                    NO_POLICY
                } else {
                    &chain.default_policy
                };
                let _ = writeln!(out, ":{} {}", chain.name, policy);
            }
            for chain in table.chains.values() {
                for rule in &chain.rules {
                    if rule.spec.is_empty() {
                        let _ = writeln!(out, "-A {}", chain.name);
                    } else {
                        let _ = writeln!(out, "-A {} {}", chain.name, rule.spec);
                    }
                }
            }
            out.push_str("COMMIT\n");
        }
        out
    }
}

fn open_table<'s>(
    state: &'s mut IptablesState,
    current: Option<&str>,
    origin: &str,
    line: &str,
) -> Result<&'s mut Table> {
    current
        .and_then(|name| state.tables.get_mut(name))
        .ok_or_else(|| Error::parse(origin, line, "no open table"))
}

/// Rewrites a rule's arguments into the form `iptables-save` prints.
///
/// - `-p icmpv6` becomes `-p ipv6-icmp`
/// - `-s`/`-d` addresses gain `/32` or `/128` and have host bits masked
/// - `-s`/`-d` of the whole address space is dropped
pub fn normalize_rule_spec(spec: &str, ipv6: bool) -> String {
    let mut fields: Vec<Option<String>> = spec
        .split_whitespace()
        .map(|f| Some(f.to_string()))
        .collect();

    let mut i = 0;
    while i + 1 < fields.len() {
        match fields[i].as_deref() {
            Some("-p") => {
                if fields[i + 1].as_deref() == Some("icmpv6") {
                    fields[i + 1] = Some("ipv6-icmp".to_string());
                }
                i += 1;
            }
            Some("-s" | "-d") => {
                let addr = normalize_address(fields[i + 1].as_deref().unwrap_or_default(), ipv6);
                if addr == "0.0.0.0/0" || addr == "::/0" {
                    fields[i] = None;
                    fields[i + 1] = None;
                } else {
                    fields[i + 1] = Some(addr);
                }
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    fields.into_iter().flatten().collect::<Vec<_>>().join(" ")
}

fn normalize_address(addr: &str, ipv6: bool) -> String {
    let with_prefix = if addr.contains('/') {
        addr.to_string()
    } else if ipv6 {
        format!("{addr}/128")
    } else {
        format!("{addr}/32")
    };
    // Hostnames and exotic masks are left as written
    match with_prefix.parse::<IpNetwork>() {
        Ok(net) => format!("{}/{}", net.network(), net.prefix()),
        Err(_) => with_prefix,
    }
}

/// Changed lines between two restore texts, `- ` removed and `+ ` added.
pub fn restore_diff(old: &str, new: &str) -> String {
    let diff = similar::TextDiff::from_lines(old, new);
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => continue,
        };
        let _ = write!(result, "{sign}{change}");
    }
    result
}

/// Reconciles one address family's firewall tables.
pub struct IptablesReconciler<'a> {
    exec: &'a Executor,
    ipv6: bool,
    save_tool: String,
    restore_tool: String,
}

impl<'a> IptablesReconciler<'a> {
    pub fn new(
        exec: &'a Executor,
        ipv6: bool,
        save_tool: impl Into<String>,
        restore_tool: impl Into<String>,
    ) -> Self {
        Self {
            exec,
            ipv6,
            save_tool: save_tool.into(),
            restore_tool: restore_tool.into(),
        }
    }

    fn label(&self) -> &'static str {
        if self.ipv6 { "ip6tables" } else { "iptables" }
    }

    /// Dumps and parses the live ruleset.
    pub fn current_state(&self) -> Result<IptablesState> {
        let output = self.exec.query(&Invocation::new(&self.save_tool))?;
        IptablesState::parse(self.ipv6, &output, &self.save_tool)
    }

    /// Merges every fragment in `dir`; `None` if the directory holds no files.
    pub fn desired_state(&self, dir: &Path) -> Result<Option<IptablesState>> {
        let mut desired: Option<IptablesState> = None;
        for name in utils::list_file_names(dir)? {
            let text = backend::read_fragment(dir, &name)?;
            let origin = dir.join(&name).display().to_string();
            let state = IptablesState::parse(self.ipv6, &text, &origin)?;
            match desired.as_mut() {
                Some(merged) => merged.merge(state)?,
                None => desired = Some(state),
            }
        }
        Ok(desired)
    }

    /// Writes the live ruleset into `dir/10-saved`, unless it is already identical.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let conf = self.current_state()?.to_restore_text();
        utils::ensure_dir(dir)?;
        let path = dir.join(SAVED_FRAGMENT);
        if utils::try_read_text_file(&path, "")? == conf {
            debug!(path = %path.display(), "Saved configuration unchanged");
            return Ok(());
        }
        utils::write_file_atomic(&path, &conf)?;
        info!(path = %path.display(), "{}: saved current configuration", self.label());
        Ok(())
    }
}

impl Reconciler for IptablesReconciler<'_> {
    fn backend(&self) -> Backend {
        if self.ipv6 {
            Backend::Ip6tables
        } else {
            Backend::Iptables
        }
    }

    fn apply(&mut self, dir: &Path) -> Result<()> {
        if !backend::fragment_dir_present(self.backend(), dir)? {
            return Ok(());
        }

        let current = self.current_state()?;

        let Some(desired) = self.desired_state(dir)? else {
            info!(dir = %dir.display(), "{}: No configuration found", self.label());
            return Ok(());
        };

        if desired.matches(&current) {
            debug!("{}: Configuration matches", self.label());
            return Ok(());
        }

        let new = desired.to_restore_text();
        info!(
            "{}: Applying new configuration\n{}",
            self.label(),
            restore_diff(&current.to_restore_text(), &new)
        );

        let restore = Invocation::new(&self.restore_tool).stdin(new);
        self.exec.mutate(self.label(), &restore)?;
        Ok(())
    }
}
