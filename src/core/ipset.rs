//! ipset reconciliation
//!
//! Each fragment file is the whole truth for one set, named after the file.
//! A set that already exists in the kernel may be referenced by firewall
//! rules, so it is never destroyed and recreated. Instead the replacement is
//! restored under a temporary name and swapped in with `ipset swap`, which
//! the kernel performs atomically. Kernel sets without a fragment are left
//! alone.

use crate::command::{Executor, Invocation};
use crate::core::backend::{self, Backend, Reconciler};
use crate::core::error::{Error, Result};
use crate::{utils, validators};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, warn};

/// Prefix of the throwaway set used during a swap
pub const TEMP_SET_PREFIX: &str = "_applyd_tmp_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipset {
    pub name: String,
    /// Everything after `create <name>`, e.g. `hash:ip family inet hashsize 1024`
    pub create_spec: String,
    /// Sorted; member order carries no meaning to the kernel
    pub members: Vec<String>,
}

impl Ipset {
    /// Same type and options, same members regardless of order.
    pub fn matches(&self, other: &Ipset) -> bool {
        if self.create_spec != other.create_spec {
            debug!(set = %self.name, desired = %self.create_spec, current = %other.create_spec, "Spec mismatch on ipset");
            return false;
        }
        let mut a = self.members.clone();
        let mut b = other.members.clone();
        a.sort();
        b.sort();
        if a != b {
            debug!(set = %self.name, "Members mismatch on ipset");
            return false;
        }
        true
    }

    /// Renders `ipset restore` input, optionally under another set name.
    pub fn to_restore_text(&self, rename: Option<&str>) -> String {
        let name = rename.unwrap_or(&self.name);
        let mut out = String::new();
        let create = join_words(&["create", name, self.create_spec.as_str()]);
        let _ = writeln!(out, "{create}");
        for member in &self.members {
            let _ = writeln!(out, "{}", join_words(&["add", name, member.as_str()]));
        }
        out
    }
}

fn join_words(words: &[&str]) -> String {
    words
        .iter()
        .filter(|w| !w.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses `ipset save` output into sets keyed by name.
pub fn parse_ipsets(text: &str, origin: &str) -> Result<BTreeMap<String, Ipset>> {
    let mut sets: BTreeMap<String, Ipset> = BTreeMap::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["create", name, spec @ ..] => {
                if sets.contains_key(*name) {
                    return Err(Error::DuplicateEntity {
                        kind: "ipset",
                        name: (*name).to_string(),
                        origin: origin.to_string(),
                    });
                }
                sets.insert(
                    (*name).to_string(),
                    Ipset {
                        name: (*name).to_string(),
                        create_spec: spec.join(" "),
                        members: Vec::new(),
                    },
                );
            }
            ["add", name, member @ ..] => {
                let Some(set) = sets.get_mut(*name) else {
                    return Err(Error::parse(origin, line, format!("ipset not declared: {name}")));
                };
                set.members.push(member.join(" "));
            }
            _ => return Err(Error::parse(origin, line, "expected 'create' or 'add'")),
        }
    }

    for set in sets.values_mut() {
        set.members.sort();
    }
    Ok(sets)
}

/// Source of unique tokens for temporary set names
pub trait TokenSource {
    fn next_token(&mut self) -> u64;
}

/// Default [`TokenSource`] backed by the thread-local RNG
#[derive(Debug, Default)]
pub struct RandomTokens;

impl TokenSource for RandomTokens {
    fn next_token(&mut self) -> u64 {
        // 63 bits keeps the rendered name within ipset's length limit
        rand::random::<u64>() >> 1
    }
}

pub struct IpsetReconciler<'a> {
    exec: &'a Executor,
    tool: String,
    tokens: Box<dyn TokenSource>,
}

impl<'a> IpsetReconciler<'a> {
    pub fn new(exec: &'a Executor, tool: impl Into<String>) -> Self {
        Self {
            exec,
            tool: tool.into(),
            tokens: Box::new(RandomTokens),
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens: Box<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn current_state(&self) -> Result<BTreeMap<String, Ipset>> {
        let output = self.exec.query(&Invocation::new(&self.tool).arg("save"))?;
        parse_ipsets(&output, &self.tool)
    }

    /// Reads the fragment `name`, which must define exactly the set `name`.
    fn read_fragment(dir: &Path, name: &str) -> Result<Ipset> {
        let path = dir.join(name);
        let origin = path.display().to_string();
        if let Err(message) = validators::validate_ipset_name(name) {
            return Err(Error::Validation {
                field: origin,
                message,
            });
        }

        let text = backend::read_fragment(dir, name)?;
        let mut sets = parse_ipsets(&text, &origin)?;
        if sets.len() > 1 {
            return Err(Error::parse(&origin, name, "found multiple ipsets in file"));
        }
        let Some(set) = sets.remove(name) else {
            return Err(Error::parse(&origin, name, "file must define the set it is named after"));
        };
        Ok(set)
    }

    fn run(&self, args: &[&str], stdin: Option<String>) -> Result<()> {
        let mut inv = Invocation::new(&self.tool).args(args.iter().copied());
        if let Some(input) = stdin {
            inv = inv.stdin(input);
        }
        self.exec.mutate("ipset", &inv)?;
        Ok(())
    }

    fn create(&self, set: &Ipset) -> Result<()> {
        self.run(&["restore"], Some(set.to_restore_text(None)))
    }

    /// Builds the new contents beside the live set and swaps them in.
    fn replace(&mut self, set: &Ipset) -> Result<()> {
        let temp = format!("{TEMP_SET_PREFIX}{:x}", self.tokens.next_token());
        info!(set = %set.name, temp = %temp, "Creating temp set and atomically swapping");

        // `restore` can fail part way, after the temp set was created
        if let Err(e) = self.run(&["restore"], Some(set.to_restore_text(Some(&temp)))) {
            self.discard(&temp, "restore");
            return Err(e);
        }
        if let Err(e) = self.run(&["swap", temp.as_str(), set.name.as_str()], None) {
            self.discard(&temp, "swap");
            return Err(e);
        }
        self.run(&["destroy", temp.as_str()], None)
    }

    /// Best-effort removal of a temp set after a failed step.
    fn discard(&self, temp: &str, step: &str) {
        if let Err(e) = self.run(&["destroy", temp], None) {
            warn!(temp = %temp, "Failed to remove temp set after failed {step}: {e}");
        }
    }

    /// Writes one fragment per kernel set into `dir`, skipping unchanged files.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let sets = self.current_state()?;
        utils::ensure_dir(dir)?;
        for set in sets.values() {
            let path = dir.join(&set.name);
            let conf = set.to_restore_text(None);
            if utils::try_read_text_file(&path, "")? == conf {
                continue;
            }
            utils::write_file_atomic(&path, &conf)?;
            info!(path = %path.display(), "ipset: saved {}", set.name);
        }
        Ok(())
    }
}

impl Reconciler for IpsetReconciler<'_> {
    fn backend(&self) -> Backend {
        Backend::Ipset
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
                    debug!(set = %name, "ipset: Configuration matches");
                }
                Some(_) => {
                    info!(set = %name, "ipset: Applying changed configuration from disk");
                    self.replace(&desired)?;
                }
                None => {
                    info!(set = %name, "ipset: Creating set from disk");
                    self.create(&desired)?;
                }
            }
        }

        for name in unmanaged.keys() {
            info!(set = %name, "ipset: Ignoring set not on disk");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{FragmentDir, MockRunner};

    struct FixedTokens(u64);

    impl TokenSource for FixedTokens {
        fn next_token(&mut self) -> u64 {
            self.0
        }
    }

    const KERNEL: &str = "create trusted hash:net family inet hashsize 1024 maxelem 65536
add trusted 10.0.0.0/8
add trusted 192.168.0.0/16
create blocklist hash:ip family inet hashsize 1024 maxelem 65536
add blocklist 203.0.113.7
";

    fn reconciler(exec: &Executor) -> IpsetReconciler<'_> {
        IpsetReconciler::new(exec, "/usr/sbin/ipset").with_tokens(Box::new(FixedTokens(0xbeef)))
    }

    fn set(spec: &str, members: &[&str]) -> Ipset {
        Ipset {
            name: "s".to_string(),
            create_spec: spec.to_string(),
            members: members.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn test_parse_sorts_members() {
        let sets = parse_ipsets("create s hash:ip\nadd s c\nadd s a\nadd s b\n", "t").unwrap();
        assert_eq!(sets["s"].create_spec, "hash:ip");
        assert_eq!(sets["s"].members, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_member_options_kept() {
        let text = "create s hash:ip timeout 300\nadd s 10.0.0.1 timeout 60\n";
        let sets = parse_ipsets(text, "t").unwrap();
        assert_eq!(sets["s"].members, vec!["10.0.0.1 timeout 60"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_ipsets("create s hash:ip\ncreate s hash:ip\n", "t"),
            Err(Error::DuplicateEntity { kind: "ipset", .. })
        ));
        assert!(matches!(
            parse_ipsets("add s 1.2.3.4\n", "t"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(parse_ipsets("flush s\n", "t"), Err(Error::Parse { .. })));
        assert!(matches!(parse_ipsets("create\n", "t"), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_matches_ignores_member_order() {
        assert!(set("hash:ip", &["c", "a", "b"]).matches(&set("hash:ip", &["a", "b", "c"])));
        assert!(!set("hash:ip", &["a"]).matches(&set("hash:net", &["a"])));
        assert!(!set("hash:ip", &["a"]).matches(&set("hash:ip", &["a", "b"])));
    }

    #[test]
    fn test_restore_text_rename() {
        let s = set("hash:ip", &["1.1.1.1", "2.2.2.2"]);
        assert_eq!(
            s.to_restore_text(Some("tmp")),
            "create tmp hash:ip\nadd tmp 1.1.1.1\nadd tmp 2.2.2.2\n"
        );
        assert_eq!(
            s.to_restore_text(None),
            "create s hash:ip\nadd s 1.1.1.1\nadd s 2.2.2.2\n"
        );
    }

    #[test]
    fn test_changed_set_is_swapped() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        let fragment = "create blocklist hash:ip family inet hashsize 1024 maxelem 65536
add blocklist 198.51.100.1
";
        dirs.file("ipset", "blocklist", fragment);

        reconciler(&exec).apply(&dirs.sub("ipset")).unwrap();

        let mutations = mock.mutating_calls();
        let lines: Vec<String> = mutations.iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "/usr/sbin/ipset restore",
                "/usr/sbin/ipset swap _applyd_tmp_beef blocklist",
                "/usr/sbin/ipset destroy _applyd_tmp_beef",
            ]
        );
        let restored = "create _applyd_tmp_beef hash:ip family inet hashsize 1024 maxelem 65536
add _applyd_tmp_beef 198.51.100.1
";
        assert_eq!(mutations[0].stdin.as_deref(), Some(restored));
        assert!(!lines.iter().any(|l| l.ends_with("destroy blocklist")));
    }

    #[test]
    fn test_new_set_restored_directly() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file(
            "ipset",
            "admins",
            "create admins hash:ip\nadd admins 10.1.1.1\n",
        );

        reconciler(&exec).apply(&dirs.sub("ipset")).unwrap();

        let mutations = mock.mutating_calls();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].to_string(), "/usr/sbin/ipset restore");
        assert_eq!(
            mutations[0].stdin.as_deref(),
            Some("create admins hash:ip\nadd admins 10.1.1.1\n")
        );
    }

    #[test]
    fn test_matching_set_untouched_and_unmanaged_ignored() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        let fragment = "create trusted hash:net family inet hashsize 1024 maxelem 65536
add trusted 192.168.0.0/16
add trusted 10.0.0.0/8
";
        dirs.file("ipset", "trusted", fragment);

        reconciler(&exec).apply(&dirs.sub("ipset")).unwrap();
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_file_must_name_its_set() {
        let mock = MockRunner::new();
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("ipset", "wrong", "create other hash:ip\n");
        assert!(matches!(
            reconciler(&exec).apply(&dirs.sub("ipset")),
            Err(Error::Parse { .. })
        ));

        let dirs = FragmentDir::new();
        dirs.file("ipset", "a", "create a hash:ip\ncreate b hash:ip\n");
        assert!(reconciler(&exec).apply(&dirs.sub("ipset")).is_err());

        let dirs = FragmentDir::new();
        dirs.file("ipset", "empty", "");
        assert!(reconciler(&exec).apply(&dirs.sub("ipset")).is_err());
        assert!(mock.mutating_calls().is_empty());
    }

    #[test]
    fn test_overlong_set_name_rejected() {
        let mock = MockRunner::new();
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        let name = "x".repeat(40);
        dirs.file("ipset", &name, &format!("create {name} hash:ip\n"));
        assert!(matches!(
            reconciler(&exec).apply(&dirs.sub("ipset")),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_failed_swap_cleans_up_temp() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        mock.fail("/usr/sbin/ipset swap", "Set cannot be swapped");
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file("ipset", "blocklist", "create blocklist hash:net\n");

        let err = reconciler(&exec).apply(&dirs.sub("ipset")).unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
        assert_eq!(
            mock.command_lines().last().map(String::as_str),
            Some("/usr/sbin/ipset destroy _applyd_tmp_beef")
        );
    }

    #[test]
    fn test_failed_restore_cleans_up_temp() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        mock.fail("/usr/sbin/ipset restore", "Error in line 2: Syntax error");
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        dirs.file(
            "ipset",
            "blocklist",
            "create blocklist hash:ip\nadd blocklist 10.0.0.300\n",
        );

        let err = reconciler(&exec).apply(&dirs.sub("ipset")).unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));
        assert_eq!(
            mock.command_lines(),
            vec![
                "/usr/sbin/ipset save",
                "/usr/sbin/ipset restore",
                "/usr/sbin/ipset destroy _applyd_tmp_beef",
            ]
        );
    }

    #[test]
    fn test_random_token_fits_name_limit() {
        let mut tokens = RandomTokens;
        for _ in 0..64 {
            let name = format!("{TEMP_SET_PREFIX}{:x}", tokens.next_token());
            assert!(validators::validate_ipset_name(&name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_save_writes_one_file_per_set() {
        let mock = MockRunner::new();
        mock.respond("/usr/sbin/ipset save", KERNEL);
        let exec = mock.executor();
        let dirs = FragmentDir::new();
        let target = dirs.sub("ipset");

        reconciler(&exec).save(&target).unwrap();

        assert_eq!(
            utils::list_file_names(&target).unwrap(),
            vec!["blocklist", "trusted"]
        );
        let trusted = std::fs::read_to_string(target.join("trusted")).unwrap();
        let expected = "create trusted hash:net family inet hashsize 1024 maxelem 65536
add trusted 10.0.0.0/8
add trusted 192.168.0.0/16
";
        assert_eq!(trusted, expected);
        assert!(mock.mutating_calls().is_empty());
    }
}
