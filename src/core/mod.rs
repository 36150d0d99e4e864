//! Core reconciliation logic
//!
//! One reconciler per kernel state domain, all behind the [`backend::Reconciler`]
//! seam:
//!
//! - [`iptables`]: atomic whole-ruleset replace via `iptables-restore`
//! - [`ipset`]: per-set atomic swap
//! - [`routes`], [`tunnels`]: add-only, unmanaged kernel entries are left alone
//! - [`vips`]: interface addresses, added on a device or removed everywhere
//! - [`neigh_proxy`]: IPv6 neighbor proxies, applied unconditionally
//! - [`runtime`]: sequences the backends in their fixed order
//! - [`error`]: error types and native tool error hints

pub mod backend;
pub mod error;
pub mod ipset;
pub mod iptables;
pub mod neigh_proxy;
pub mod routes;
pub mod runtime;
pub mod tunnels;
pub mod vips;

#[cfg(test)]
pub mod test_helpers;
