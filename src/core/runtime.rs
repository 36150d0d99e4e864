//! Runtime: owns the executor and drives every backend in a fixed order
//!
//! Each backend reads `<base_dir>/<backend>`. The first error aborts the
//! pass; changes already made by earlier backends stay in place.

use crate::audit::AuditLog;
use crate::command::{Executor, SystemRunner};
use crate::config::AppConfig;
use crate::core::backend::{Backend, Reconciler};
use crate::core::error::Result;
use crate::core::ipset::IpsetReconciler;
use crate::core::iptables::IptablesReconciler;
use crate::core::neigh_proxy::NeighborProxyReconciler;
use crate::core::routes::RouteReconciler;
use crate::core::tunnels::TunnelReconciler;
use crate::core::vips::VipReconciler;
use crate::elevation::ElevationMethod;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;
use tracing::{error, info};

pub struct Runtime {
    config: AppConfig,
    exec: Executor,
}

impl Runtime {
    pub fn new(config: AppConfig, exec: Executor) -> Self {
        Self { config, exec }
    }

    /// Builds a runtime that runs the real native tools.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the configured elevation method is unavailable.
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let elevation = ElevationMethod::resolve(config.elevation)?;
        let mut exec = Executor::new(Box::new(SystemRunner::new(elevation)));
        if let Some(path) = &config.audit_log {
            exec = exec.with_audit(AuditLog::new(path));
        }
        Ok(Self::new(config, exec))
    }

    /// Fragment directory of one backend
    pub fn backend_dir(&self, backend: Backend) -> PathBuf {
        self.config.base_dir.join(backend.as_ref())
    }

    fn iptables(&self, ipv6: bool) -> IptablesReconciler<'_> {
        let tools = &self.config.tools;
        if ipv6 {
            IptablesReconciler::new(
                &self.exec,
                true,
                &tools.ip6tables_save,
                &tools.ip6tables_restore,
            )
        } else {
            IptablesReconciler::new(
                &self.exec,
                false,
                &tools.iptables_save,
                &tools.iptables_restore,
            )
        }
    }

    fn reconciler(&self, backend: Backend) -> Box<dyn Reconciler + '_> {
        let tools = &self.config.tools;
        let exec = &self.exec;
        match backend {
            Backend::Ipset => Box::new(IpsetReconciler::new(exec, &tools.ipset)),
            Backend::Iptables => Box::new(self.iptables(false)),
            Backend::Ip6tables => Box::new(self.iptables(true)),
            Backend::Ip6Neigh => Box::new(NeighborProxyReconciler::new(
                exec,
                &tools.ip,
                self.config.neigh_proxy_tolerate_existing,
            )),
            Backend::Tunnel => Box::new(TunnelReconciler::new(
                exec,
                &tools.ip,
                self.config.tunnel_update,
            )),
            Backend::Vips => Box::new(VipReconciler::new(
                exec,
                &tools.ip,
                self.config.vip_removal_max_rounds,
            )),
            Backend::Route4 => Box::new(RouteReconciler::new(exec, false, &tools.ip)),
            Backend::Route6 => Box::new(RouteReconciler::new(exec, true, &tools.ip)),
        }
    }

    /// Converges a single backend.
    pub fn apply_backend(&self, backend: Backend) -> Result<()> {
        let dir = self.backend_dir(backend);
        let mut reconciler = self.reconciler(backend);
        reconciler.apply(&dir).inspect_err(|e| {
            error!(%backend, dir = %dir.display(), "Apply failed: {e}");
        })
    }

    /// Converges every backend in order, stopping at the first error.
    pub fn apply_all(&self) -> Result<()> {
        self.apply_only(&Backend::iter().collect::<Vec<_>>())
    }

    /// Converges the selected backends, still in the fixed backend order.
    pub fn apply_only(&self, selected: &[Backend]) -> Result<()> {
        for backend in Backend::iter().filter(|b| selected.contains(b)) {
            self.apply_backend(backend)?;
        }
        info!("Apply complete");
        Ok(())
    }

    /// Dumps live ipsets and firewall rules as fragments under `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let ipset = IpsetReconciler::new(&self.exec, &self.config.tools.ipset);
        ipset.save(&dir.join(Backend::Ipset.as_ref()))?;
        self.iptables(false)
            .save(&dir.join(Backend::Iptables.as_ref()))?;
        self.iptables(true)
            .save(&dir.join(Backend::Ip6tables.as_ref()))?;
        Ok(())
    }
}
