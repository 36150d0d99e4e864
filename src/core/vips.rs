//! Interface address ("VIP") reconciliation
//!
//! Each fragment names one address, keyed by file name. Its last non-empty
//! line is `<device> [ip[/prefix]]`; without an explicit address the file
//! name is the address. An empty fragment means the address must not exist
//! on any interface.
//!
//! Files are processed in listing order against a snapshot of
//! `ip -o address show`. Any change invalidates the snapshot, so the next
//! file sees a fresh query.

use crate::command::{Executor, Invocation};
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::{utils, validators};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info};

/// One address as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ip: IpAddr,
    pub prefix: u8,
    pub interface: String,
}

impl InterfaceAddress {
    fn cidr(&self) -> String {
        format!("{}/{}", self.ip, self.prefix)
    }
}

/// Parses `ip --oneline address show`, keeping `inet` and `inet6` entries.
pub fn parse_address_list(output: &str) -> Result<Vec<InterfaceAddress>> {
    let mut addresses = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // 2: eth0    inet 192.168.1.20/24 brd 192.168.1.255 scope global eth0\ ...
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return Err(Error::parse("address show", line, "too few fields"));
        }
        if fields[2] != "inet" && fields[2] != "inet6" {
            continue;
        }
        let Some(cidr) = fields.get(3) else {
            return Err(Error::parse("address show", line, "missing address"));
        };
        let net = parse_ip_spec(cidr).ok_or_else(|| {
            Error::parse("address show", line, format!("invalid address '{cidr}'"))
        })?;
        addresses.push(InterfaceAddress {
            ip: net.ip(),
            prefix: net.prefix(),
            interface: fields[1].to_string(),
        });
    }
    Ok(addresses)
}

/// Parses `ip` or `ip/prefix`; a bare address gets a host prefix.
fn parse_ip_spec(spec: &str) -> Option<IpNetwork> {
    if spec.contains('/') {
        spec.parse().ok()
    } else {
        spec.parse::<IpAddr>()
            .ok()
            .and_then(|ip| IpNetwork::new(ip, host_prefix(ip)).ok())
    }
}

fn host_prefix(ip: IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Desired state of one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vip {
    /// `None` means remove the address everywhere
    pub device: Option<String>,
    /// Address as passed to `ip address`. An explicit address is kept as
    /// written; one taken from the file name gets a host prefix.
    pub address: String,
    pub ip: IpAddr,
}

impl Vip {
    /// Parses the fragment named `key`.
    pub fn parse(key: &str, text: &str) -> Result<Self> {
        let mut device = None;
        let mut explicit = None;

        if let Some(line) = text.lines().map(str::trim).rfind(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [dev] => device = Some((*dev).to_string()),
                [dev, ip] => {
                    device = Some((*dev).to_string());
                    explicit = Some((*ip).to_string());
                }
                _ => return Err(Error::parse(key, line, "expected '<device> [ip[/prefix]]'")),
            }
        }

        let address = explicit.unwrap_or_else(|| {
            if key.contains(':') {
                format!("{key}/128")
            } else {
                format!("{key}/32")
            }
        });
        let ip = parse_ip_spec(&address)
            .ok_or_else(|| Error::parse(key, &address, "invalid address"))?
            .ip();

        if let Some(dev) = &device {
            if let Err(message) = validators::validate_interface_name(dev) {
                return Err(Error::Validation {
                    field: key.to_string(),
                    message,
                });
            }
        }

        Ok(Self {
            device,
            address,
            ip,
        })
    }

    fn family_args(&self) -> &'static [&'static str] {
        if self.address.contains(':') {
            &["-6"]
        } else {
            &[]
        }
    }
}

pub struct VipReconciler<'a> {
    exec: &'a Executor,
    tool: String,
    max_removal_rounds: u32,
}

impl<'a> VipReconciler<'a> {
    pub fn new(exec: &'a Executor, tool: impl Into<String>, max_removal_rounds: u32) -> Self {
        Self {
            exec,
            tool: tool.into(),
            max_removal_rounds,
        }
    }

    pub fn current_state(&self) -> Result<Vec<InterfaceAddress>> {
        let show = Invocation::new(&self.tool).args(["--oneline", "address", "show"]);
        let output = self.exec.query(&show)?;
        parse_address_list(&output)
    }

    fn address_cmd(&self, vip: &Vip, action: &str, address: &str, device: &str) -> Result<()> {
        let inv = Invocation::new(&self.tool)
            .args(vip.family_args().iter().copied())
            .args(["address", action, address, "dev", device]);
        self.exec.mutate("vips", &inv)?;
        Ok(())
    }

    /// Converges one fragment; returns whether anything was changed.
    fn apply_vip(&self, key: &str, vip: &Vip, snapshot: &[InterfaceAddress]) -> Result<bool> {
        match &vip.device {
            Some(device) => {
                let present = snapshot
                    .iter()
                    .any(|a| a.ip == vip.ip && &a.interface == device);
                if present {
                    debug!(vip = %key, "vips: Configuration matches");
                    return Ok(false);
                }
                info!(vip = %key, device = %device, address = %vip.address, "vips: Adding");
                self.address_cmd(vip, "add", &vip.address, device)?;
                Ok(true)
            }
            None => self.remove_everywhere(key, vip, snapshot),
        }
    }

    fn remove_everywhere(
        &self,
        key: &str,
        vip: &Vip,
        snapshot: &[InterfaceAddress],
    ) -> Result<bool> {
        let holders = |addresses: &[InterfaceAddress]| -> Vec<InterfaceAddress> {
            addresses
                .iter()
                .filter(|a| a.ip == vip.ip)
                .cloned()
                .collect()
        };

        let mut remaining = holders(snapshot);
        if remaining.is_empty() {
            debug!(vip = %key, "vips: Address absent as configured");
            return Ok(false);
        }

        for round in 1..=self.max_removal_rounds {
            for held in &remaining {
                info!(vip = %key, device = %held.interface, round, "vips: Deleting");
                self.address_cmd(vip, "delete", &held.cidr(), &held.interface)?;
            }
            remaining = holders(&self.current_state()?);
            if remaining.is_empty() {
                return Ok(true);
            }
        }

        Err(Error::Convergence(format!(
            "address {} still present on {} after {} removal rounds",
            vip.address,
            remaining
                .iter()
                .map(|a| a.interface.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            self.max_removal_rounds
        )))
    }
}

impl Reconciler for VipReconciler<'_> {
    fn backend(&self) -> Backend {
        Backend::Vips
    }

    fn apply(&mut self, dir: &Path) -> Result<()> {
        if !backend::fragment_dir_present(self.backend(), dir)? {
            return Ok(());
        }

        let mut snapshot: Option<Vec<InterfaceAddress>> = None;

        for name in utils::list_file_names(dir)? {
            let text = backend::read_fragment(dir, &name)?;
            let vip = Vip::parse(&name, &text).map_err(|e| match e {
                Error::Parse { line, reason, .. } => {
                    Error::parse(dir.join(&name).display().to_string(), line, reason)
                }
                other => other,
            })?;

            let current = match snapshot.take() {
                Some(current) => current,
                None => self.current_state()?,
            };
            if !self.apply_vip(&name, &vip, &current)? {
                snapshot = Some(current);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{FragmentDir, MockRunner};

    const SHOW: &str = "/sbin/ip --oneline address show";

    const KERNEL: &str = r"1: lo    inet 127.0.0.1/8 scope host lo\       valid_lft forever preferred_lft forever
1: lo    inet6 ::1/128 scope host \       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.20/24 brd 192.168.1.255 scope global eth0\       valid_lft forever preferred_lft forever
2: eth0    inet 10.0.0.5/32 scope global eth0\       valid_lft forever preferred_lft forever
3: eth1    inet 10.0.0.5/32 scope global eth1\       valid_lft forever preferred_lft forever
3: eth1    inet6 2001:db8::10/128 scope global \       valid_lft forever preferred_lft forever
";

    fn reconciler(exec: &Executor) -> VipReconciler<'_> {
        VipReconciler::new(exec, "/sbin/ip", 3)
    }

    #[test]
    fn test_parse_address_list() {
        let addrs = parse_address_list(KERNEL).unwrap();
        assert_eq!(addrs.len(), 6);
        assert_eq!(addrs[2].interface, "eth0");
        assert_eq!(addrs[2].ip, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(addrs[2].prefix, 24);
        assert_eq!(addrs[5].cidr(), "2001:db8::10/128");
    }

    #[test]
    fn test_parse_address_list_skips_link_lines() {
        let out = "2: eth0    link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff\n";
        assert!(parse_address_list(out).unwrap().is_empty());
        assert!(parse_address_list("2: eth0\n").is_err());
        assert!(parse_address_list("2: eth0 inet\n").is_err());
    }

    #[test]
    fn test_parse_fragment() {
        let vip = Vip::parse("10.0.0.7", "eth0\n").unwrap();
        assert_eq!(vip.device.as_deref(), Some("eth0"));
        assert_eq!(vip.address, "10.0.0.7/32");

        let v6 = Vip::parse("2001:db8::7", "\neth1\n\n").unwrap();
        assert_eq!(v6.address, "2001:db8::7/128");

        let explicit = Vip::parse("web", "eth0 192.0.2.10/24\n").unwrap();
        assert_eq!(explicit.address, "192.0.2.10/24");
        assert_eq!(explicit.ip, "192.0.2.10".parse::<IpAddr>().unwrap());

        // An explicit address without a prefix is passed on as written
        let bare = Vip::parse("web", "eth0 192.0.2.10\n").unwrap();
        assert_eq!(bare.address, "192.0.2.10");
        assert_eq!(bare.ip, explicit.ip);

        // Last non-empty line wins
        let last = Vip::parse("10.0.0.7", "eth0\neth1\n").unwrap();
        assert_eq!(last.device.as_deref(), Some("eth1"));

        let removal = Vip::parse("10.0.0.5", "").unwrap();
        assert_eq!(removal.device, None);
    }

    #[test]
    fn test_parse_fragment_errors() {
        assert!(matches!(
            Vip::parse("10.0.0.7", "eth0 10.0.0.7 extra\n"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Vip::parse("not-an-ip", "eth0\n"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Vip::parse("web", "eth0 192.0.2.300\n"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Vip::parse("10.0.0.7", "an-interface-name-too-long\n"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_add_missing_address() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "10.0.0.5", "eth0\n");
        dirs.file("vips", "10.0.0.9", "eth0\n");
        dirs.file("vips", "2001:db8::10", "eth1\n");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();
        assert_eq!(
            mock.mutation_lines(),
            vec!["/sbin/ip address add 10.0.0.9/32 dev eth0"]
        );
    }

    #[test]
    fn test_ipv6_add_uses_family_flag() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "2001:db8::20", "eth0\n");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();
        assert_eq!(
            mock.mutation_lines(),
            vec!["/sbin/ip -6 address add 2001:db8::20/128 dev eth0"]
        );
    }

    #[test]
    fn test_explicit_address_used_verbatim() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "web", "eth1 192.0.2.10\n");
        dirs.file("vips", "web-net", "eth1 192.0.2.11/24\n");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();
        assert_eq!(
            mock.mutation_lines(),
            vec![
                "/sbin/ip address add 192.0.2.10 dev eth1",
                "/sbin/ip address add 192.0.2.11/24 dev eth1",
            ]
        );
    }

    #[test]
    fn test_snapshot_requeried_only_after_change() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "10.0.0.5", "eth0\n");
        dirs.file("vips", "10.0.0.8", "eth0\n");
        dirs.file("vips", "10.0.0.9", "eth1\n");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();

        assert_eq!(
            mock.command_lines(),
            vec![
                SHOW,
                "/sbin/ip address add 10.0.0.8/32 dev eth0",
                SHOW,
                "/sbin/ip address add 10.0.0.9/32 dev eth1",
            ]
        );
    }

    #[test]
    fn test_remove_everywhere() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        mock.respond(SHOW, "2: eth0    inet 192.168.1.20/24 scope global eth0\n");
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "10.0.0.5", "");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();
        assert_eq!(
            mock.mutation_lines(),
            vec![
                "/sbin/ip address delete 10.0.0.5/32 dev eth0",
                "/sbin/ip address delete 10.0.0.5/32 dev eth1",
            ]
        );
    }

    #[test]
    fn test_remove_absent_address_is_noop() {
        let mock = MockRunner::new();
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "10.0.0.99", "");

        reconciler(&exec).apply(&dirs.sub("vips")).unwrap();
        assert!(mock.mutation_lines().is_empty());
    }

    #[test]
    fn test_removal_loop_is_bounded() {
        let mock = MockRunner::new();
        // Deletes "succeed" but the address never goes away
        mock.respond(SHOW, KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("vips", "2001:db8::10", "\n");

        let err = reconciler(&exec).apply(&dirs.sub("vips")).unwrap_err();
        assert!(matches!(err, Error::Convergence(_)));
        assert_eq!(
            mock.mutation_lines(),
            vec!["/sbin/ip -6 address delete 2001:db8::10/128 dev eth1"; 3]
        );
    }
}
