// [[file:../fleet.note::9a4d03be][9a4d03be]]
//! Machine naming scheme. Names are pure functions of (prefix, role, index),
//! so any process can address any machine of a running cluster.
// 9a4d03be ends here

// [[file:../fleet.note::2e7f58c1][2e7f58c1]]
use crate::common::*;
// 2e7f58c1 ends here

// [[file:../fleet.note::b4c2f9e0][b4c2f9e0]]
const CONTROLLER_NAME: &str = "hm";
const WORKER_NAME_CORE: &str = "hw";
const MAX_PREFIX_LEN: usize = 15;

/// The two machine roles of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Worker,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Check `prefix` against the naming rules: empty, or at most 15
/// characters of lowercase letters, digits and hyphens starting with a
/// lowercase letter. The prefix may end with a hyphen.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    let invalid = |reason: &str| Err(ClusterError::validation(format!("prefix {prefix:?}"), reason));
    if prefix.len() > MAX_PREFIX_LEN {
        return invalid("must be 15 characters or less");
    }
    if !prefix.starts_with(|c: char| c.is_ascii_lowercase()) {
        return invalid("the first character must be a lower case letter");
    }
    if !prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return invalid("only lower case letters, digits and hyphen are allowed");
    }
    Ok(())
}

/// Return the machine name for `role` in cluster `prefix`. The controller
/// takes no index and a worker requires one.
pub fn machine_name(prefix: &str, role: Role, index: Option<usize>) -> Result<String> {
    Naming::new(prefix)?.machine_name(role, index)
}
// b4c2f9e0 ends here

// [[file:../fleet.note::71a8de35][71a8de35]]
/// Validated naming scheme of one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
}

impl Naming {
    /// Construct the scheme for `prefix`, failing closed on an invalid one.
    pub fn new(prefix: &str) -> Result<Self> {
        validate_prefix(prefix)?;
        Ok(Self { prefix: prefix.into() })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn qualify(&self, core: &str) -> String {
        if self.prefix.is_empty() {
            core.to_string()
        } else {
            format!("{}-{core}", self.prefix)
        }
    }

    /// Name of the controller machine.
    pub fn controller(&self) -> String {
        self.qualify(CONTROLLER_NAME)
    }

    /// Name of worker `index`.
    pub fn worker(&self, index: usize) -> String {
        self.qualify(&format!("{WORKER_NAME_CORE}-{index:03}"))
    }

    pub fn machine_name(&self, role: Role, index: Option<usize>) -> Result<String> {
        match (role, index) {
            (Role::Controller, None) => Ok(self.controller()),
            (Role::Worker, Some(i)) => Ok(self.worker(i)),
            (Role::Controller, Some(i)) => Err(ClusterError::validation(
                "machine index",
                format!("the controller has no index, got {i}"),
            )),
            (Role::Worker, None) => Err(ClusterError::validation("machine index", "a worker requires an index")),
        }
    }

    /// All names of a cluster with `num_workers` workers, controller first.
    pub fn fleet(&self, num_workers: usize) -> Vec<String> {
        std::iter::once(self.controller())
            .chain((0..num_workers).map(|i| self.worker(i)))
            .collect()
    }

    /// Inverse of `machine_name`. Only canonical names are recognized.
    pub fn parse(&self, name: &str) -> Option<(Role, Option<usize>)> {
        if name == self.controller() {
            return Some((Role::Controller, None));
        }
        let worker_stem = self.qualify(&format!("{WORKER_NAME_CORE}-"));
        let digits = name.strip_prefix(&worker_stem)?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let index: usize = digits.parse().ok()?;
        // reject aliases such as "hw-01" or "hw-0001"
        if self.worker(index) != name {
            return None;
        }
        Some((Role::Worker, Some(index)))
    }

    /// Return true if `name` belongs to this cluster.
    pub fn owns(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }

    /// Filter for the compute API list call matching this cluster's machines.
    pub fn filter_expression(&self) -> String {
        format!(
            r#"name eq "^({}|{}-\d+)$""#,
            self.controller(),
            self.qualify(WORKER_NAME_CORE)
        )
    }

    /// Name of the route sending worker traffic through the controller when
    /// workers have no external address.
    pub fn route_name(&self) -> String {
        self.qualify(&format!("{CONTROLLER_NAME}-nat"))
    }

    /// Network tag of workers without an external address.
    pub fn no_ip_tag(&self) -> String {
        self.qualify(&format!("{WORKER_NAME_CORE}-no-ip"))
    }
}
// 71a8de35 ends here

// [[file:../fleet.note::e03b6f9c][e03b6f9c]]
#[test]
fn test_naming_scheme() {
    let naming = Naming::new("ab").unwrap();
    assert_eq!(naming.controller(), "ab-hm");
    assert_eq!(naming.worker(0), "ab-hw-000");
    assert_eq!(naming.worker(1), "ab-hw-001");
    assert_eq!(naming.worker(1234), "ab-hw-1234");
    assert_eq!(naming.fleet(2), vec!["ab-hm", "ab-hw-000", "ab-hw-001"]);

    let naming = Naming::new("").unwrap();
    assert_eq!(naming.controller(), "hm");
    assert_eq!(naming.worker(7), "hw-007");
    assert_eq!(naming.filter_expression(), r#"name eq "^(hm|hw-\d+)$""#);

    let naming = Naming::new("boo").unwrap();
    assert_eq!(naming.filter_expression(), r#"name eq "^(boo-hm|boo-hw-\d+)$""#);
    assert_eq!(naming.route_name(), "boo-hm-nat");
}

#[test]
fn test_naming_roundtrip() {
    use std::collections::HashSet;

    let naming = Naming::new("a6b-c").unwrap();
    let mut seen = HashSet::new();
    let names = std::iter::once((Role::Controller, None)).chain((0..1500).map(|i| (Role::Worker, Some(i))));
    for (role, index) in names {
        let name = naming.machine_name(role, index).unwrap();
        // deterministic
        assert_eq!(name, machine_name("a6b-c", role, index).unwrap());
        // injective
        assert!(seen.insert(name.clone()), "duplicated name {name}");
        // reversible
        assert_eq!(naming.parse(&name), Some((role, index)));
    }

    assert_eq!(naming.parse("a6b-c-hw-01"), None);
    assert_eq!(naming.parse("a6b-c-hw-"), None);
    assert_eq!(naming.parse("a6b-c-hw-abc"), None);
    assert_eq!(naming.parse("other-hw-001"), None);
    assert!(naming.machine_name(Role::Controller, Some(0)).is_err());
    assert!(naming.machine_name(Role::Worker, None).is_err());

    // machines of another cluster are never claimed
    let other = Naming::new("a6b").unwrap();
    assert!(!other.owns("a6b-c-hw-000"));
    assert!(!other.owns("a6b-c-hm"));
}

#[test]
fn test_prefix_validation() {
    for ok in ["a", "a6b-c", "ends-with-dash-", "abcdefghijklmno", ""] {
        assert!(validate_prefix(ok).is_ok(), "{ok}");
    }
    for bad in ["upperCase", "0number", "abcdefghijklmnop", "invalid*char", "-dash", "insanely-long-prefix"] {
        let err = validate_prefix(bad).unwrap_err();
        assert!(matches!(err, ClusterError::Validation { .. }), "{bad}");
        assert!(Naming::new(bad).is_err());
    }
}
// e03b6f9c ends here
