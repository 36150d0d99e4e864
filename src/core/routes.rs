//! Route reconciliation, one instance per IP version
//!
//! Routes are compared by their reconstructed `ip route add` command line,
//! so two routes are the same exactly when applyd would install them with
//! the same arguments. Missing routes are added; kernel routes without a
//! fragment are logged and left in place, since DHCP clients and routing
//! daemons install their own.

use crate::command::{Executor, Invocation};
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::utils;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub dest: String,
    pub src: Option<String>,
    pub protocol: Option<String>,
    pub metric: Option<String>,
    /// Error code of an `unreachable` route; not part of the identity
    pub error_code: Option<String>,
    pub via: Option<String>,
    pub scope: Option<String>,
    pub device: Option<String>,
}

impl Route {
    /// Parses one `ip route show` entry.
    ///
    /// A leading `unreachable` is dropped. The kernel annotations `pref`,
    /// `expires` and `linkdown` are accepted and discarded.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut fields = line.split_whitespace().peekable();

        if fields.peek() == Some(&"unreachable") {
            fields.next();
        }
        let Some(dest) = fields.next() else {
            return Err(Error::parse("route", line, "missing destination"));
        };

        let mut route = Route {
            dest: dest.to_string(),
            ..Route::default()
        };

        while let Some(key) = fields.next() {
            let slot = match key {
                "dev" => &mut route.device,
                "proto" => &mut route.protocol,
                "metric" => &mut route.metric,
                "error" => &mut route.error_code,
                "via" => &mut route.via,
                "scope" => &mut route.scope,
                "src" => &mut route.src,
                "linkdown" => continue,
                "pref" | "expires" => {
                    if fields.next().is_none() {
                        return Err(Error::parse(
                            "route",
                            line,
                            format!("missing value for '{key}'"),
                        ));
                    }
                    continue;
                }
                other => {
                    return Err(Error::parse("route", line, format!("unknown key '{other}'")));
                }
            };
            let Some(value) = fields.next() else {
                return Err(Error::parse("route", line, format!("missing value for '{key}'")));
            };
            *slot = Some(value.to_string());
        }

        Ok(route)
    }

    /// `[-6] route add <dest> [proto] [scope] [metric] [via] [src] [dev]`
    pub fn add_args(&self, ipv6: bool) -> Vec<String> {
        let mut args = Vec::new();
        if ipv6 {
            args.push("-6".to_string());
        }
        args.push("route".to_string());
        args.push("add".to_string());
        args.push(self.dest.clone());

        let optional = [
            ("proto", &self.protocol),
            ("scope", &self.scope),
            ("metric", &self.metric),
            ("via", &self.via),
            ("src", &self.src),
            ("dev", &self.device),
        ];
        for (keyword, value) in optional {
            if let Some(value) = value {
                args.push(keyword.to_string());
                args.push(value.clone());
            }
        }
        args
    }

    /// Identity of the route: its add arguments joined by spaces.
    pub fn key(&self, ipv6: bool) -> String {
        self.add_args(ipv6).join(" ")
    }
}

pub struct RouteReconciler<'a> {
    exec: &'a Executor,
    ipv6: bool,
    tool: String,
}

impl<'a> RouteReconciler<'a> {
    pub fn new(exec: &'a Executor, ipv6: bool, tool: impl Into<String>) -> Self {
        Self {
            exec,
            ipv6,
            tool: tool.into(),
        }
    }

    fn label(&self) -> &'static str {
        if self.ipv6 { "route6" } else { "route4" }
    }

    fn family_args(&self) -> Vec<&'static str> {
        if self.ipv6 { vec!["-6"] } else { Vec::new() }
    }

    /// Kernel routes keyed by their reconstructed spec
    pub fn current_state(&self) -> Result<BTreeMap<String, Route>> {
        let show = Invocation::new(&self.tool)
            .args(self.family_args())
            .args(["route", "show"]);
        let output = self.exec.query(&show)?;

        let mut routes = BTreeMap::new();
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            let route = Route::parse(line)?;
            routes.insert(route.key(self.ipv6), route);
        }
        Ok(routes)
    }
}

impl Reconciler for RouteReconciler<'_> {
    fn backend(&self) -> Backend {
        if self.ipv6 {
            Backend::Route6
        } else {
            Backend::Route4
        }
    }

    fn apply(&mut self, dir: &Path) -> Result<()> {
        if !backend::fragment_dir_present(self.backend(), dir)? {
            return Ok(());
        }

        let mut unmanaged = self.current_state()?;

        for name in utils::list_file_names(dir)? {
            let text = backend::read_fragment(dir, &name)?;
            let route = Route::parse(&text).map_err(|e| match e {
                Error::Parse { line, reason, .. } => {
                    Error::parse(dir.join(&name).display().to_string(), line, reason)
                }
                other => other,
            })?;
            let key = route.key(self.ipv6);

            if unmanaged.remove(&key).is_some() {
                debug!(file = %name, "{}: Configuration matches", self.label());
                continue;
            }

            info!(file = %name, route = %key, "{}: Adding new route", self.label());
            let add = Invocation::new(&self.tool).args(route.add_args(self.ipv6));
            self.exec.mutate(self.label(), &add)?;
        }

        for key in unmanaged.keys() {
            info!(route = %key, "{}: Ignoring route not on disk", self.label());
        }
        Ok(())
    }
}
