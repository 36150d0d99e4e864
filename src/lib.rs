//! applyd - converge host networking state to on-disk fragments
//!
//! Reads per-backend fragment directories (`/etc/apply.d/<backend>`) and
//! drives the kernel towards them with the native tools: iptables and
//! ip6tables, ipset, and iproute2 for routes, tunnels, addresses and IPv6
//! neighbor proxies.
//!
//! # Architecture
//!
//! - [`core`] - Reconcilers, one per backend, and the runtime that sequences them
//! - [`command`] - Native tool execution behind a mockable runner
//! - [`config`] - JSON configuration file
//! - [`audit`] - JSON-lines log of every mutating command
//! - [`elevation`] - Optional sudo/run0/pkexec wrapping of native tools
//! - [`validators`] - Kernel name limits
//! - [`utils`] - Fragment directory reading and atomic file writes
//!
//! # Convergence policies
//!
//! - iptables: whole ruleset replaced atomically when anything differs
//! - ipset: changed sets rebuilt under a temporary name and swapped in
//! - routes, tunnels: missing entries added, unmanaged kernel entries kept
//! - addresses: added on the named device, or removed from every device
//! - neighbor proxies: re-added on every pass

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod command;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use command::{CommandOutput, CommandRunner, Executor, Invocation};
pub use core::backend::{Backend, Reconciler};
pub use core::error::{Error, Result};
pub use core::runtime::Runtime;
