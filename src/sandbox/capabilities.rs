//! Capability sets for sandboxed scripts.
//!
//! A `CapabilitySet` declares which paths, hosts, env vars, subprocesses,
//! libraries and system info a script may touch. Sets from independent
//! sources (base project roots, DNS servers, per-project config) are
//! combined with [`CapabilitySet::merge_all`] and rendered to interpreter
//! flags with [`CapabilitySet::to_flags`].
//!
//! Merge rules, per category:
//! - any input granting *all* → the result grants *all*
//! - otherwise the union of every explicit scope (unset if every input is unset)
//! - deny lists always union, even when the allow side is *all*

use std::collections::BTreeSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ToolError, ToolResult};

/// Allow-side state of one category.
///
/// In JSON this is either `true` or a list of scopes, matching the
/// `allowRead: true | ["..."]` shape of project `config.json` files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant<T: Ord> {
    AllowAll,
    Scopes(BTreeSet<T>),
}

impl<T: Ord> Grant<T> {
    pub fn scopes<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<T>,
    {
        Grant::Scopes(scopes.into_iter().map(Into::into).collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GrantRepr<T> {
    Flag(bool),
    Scopes(Vec<T>),
}

impl<'de, T> Deserialize<'de> for Grant<T>
where
    T: Deserialize<'de> + Ord,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match GrantRepr::<T>::deserialize(deserializer)? {
            GrantRepr::Flag(true) => Ok(Grant::AllowAll),
            GrantRepr::Flag(false) => Err(D::Error::custom(
                "expected `true` or a list of scopes, found `false` (omit the field instead)",
            )),
            GrantRepr::Scopes(scopes) => Ok(Grant::Scopes(scopes.into_iter().collect())),
        }
    }
}

impl<T: Serialize + Ord> Serialize for Grant<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Grant::AllowAll => serializer.serialize_bool(true),
            Grant::Scopes(scopes) => serializer.collect_seq(scopes),
        }
    }
}

/// System information categories a script may query (`--allow-sys=...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SysCategory {
    Hostname,
    OsRelease,
    OsUptime,
    Loadavg,
    NetworkInterfaces,
    SystemMemoryInfo,
    Uid,
    Gid,
}

impl SysCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SysCategory::Hostname => "hostname",
            SysCategory::OsRelease => "osRelease",
            SysCategory::OsUptime => "osUptime",
            SysCategory::Loadavg => "loadavg",
            SysCategory::NetworkInterfaces => "networkInterfaces",
            SysCategory::SystemMemoryInfo => "systemMemoryInfo",
            SysCategory::Uid => "uid",
            SysCategory::Gid => "gid",
        }
    }
}

impl AsRef<str> for SysCategory {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Declarative permission set for one script execution.
///
/// Values are never mutated after construction by the runtime: every
/// combination goes through [`merge_all`](Self::merge_all).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_read: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_read: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_write: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_net: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_net: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_env: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_env: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_sys: Option<Grant<SysCategory>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_sys: BTreeSet<SysCategory>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_run: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_run: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_ffi: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_ffi: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_scripts: Option<Grant<String>>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deny_scripts: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_import: Option<Grant<String>>,
}

fn merge_grants<'a, T, I>(grants: I) -> Option<Grant<T>>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = Option<&'a Grant<T>>>,
{
    let mut merged: Option<BTreeSet<T>> = None;
    for grant in grants.into_iter().flatten() {
        match grant {
            Grant::AllowAll => return Some(Grant::AllowAll),
            Grant::Scopes(scopes) => merged
                .get_or_insert_with(BTreeSet::new)
                .extend(scopes.iter().cloned()),
        }
    }
    merged.map(Grant::Scopes)
}

fn merge_denies<'a, T, I>(denies: I) -> BTreeSet<T>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a BTreeSet<T>>,
{
    denies.into_iter().flatten().cloned().collect()
}

fn push_flags<T: Ord + AsRef<str>>(
    flags: &mut Vec<String>,
    name: &str,
    allow: Option<&Grant<T>>,
    deny: Option<&BTreeSet<T>>,
) {
    match allow {
        Some(Grant::AllowAll) => flags.push(format!("--allow-{name}")),
        Some(Grant::Scopes(scopes)) if !scopes.is_empty() => {
            flags.push(format!("--allow-{name}={}", join_scopes(scopes)));
        }
        _ => {}
    }
    if let Some(deny) = deny.filter(|d| !d.is_empty()) {
        flags.push(format!("--deny-{name}={}", join_scopes(deny)));
    }
}

fn join_scopes<T: AsRef<str>>(scopes: &BTreeSet<T>) -> String {
    scopes
        .iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

impl CapabilitySet {
    /// Combines any number of sets into their minimal union.
    ///
    /// Associative, commutative and idempotent; an empty input yields the
    /// empty set.
    pub fn merge_all<'a, I>(sets: I) -> CapabilitySet
    where
        I: IntoIterator<Item = &'a CapabilitySet>,
    {
        let sets: Vec<&CapabilitySet> = sets.into_iter().collect();
        CapabilitySet {
            allow_read: merge_grants(sets.iter().map(|s| s.allow_read.as_ref())),
            deny_read: merge_denies(sets.iter().map(|s| &s.deny_read)),
            allow_write: merge_grants(sets.iter().map(|s| s.allow_write.as_ref())),
            deny_write: merge_denies(sets.iter().map(|s| &s.deny_write)),
            allow_net: merge_grants(sets.iter().map(|s| s.allow_net.as_ref())),
            deny_net: merge_denies(sets.iter().map(|s| &s.deny_net)),
            allow_env: merge_grants(sets.iter().map(|s| s.allow_env.as_ref())),
            deny_env: merge_denies(sets.iter().map(|s| &s.deny_env)),
            allow_sys: merge_grants(sets.iter().map(|s| s.allow_sys.as_ref())),
            deny_sys: merge_denies(sets.iter().map(|s| &s.deny_sys)),
            allow_run: merge_grants(sets.iter().map(|s| s.allow_run.as_ref())),
            deny_run: merge_denies(sets.iter().map(|s| &s.deny_run)),
            allow_ffi: merge_grants(sets.iter().map(|s| s.allow_ffi.as_ref())),
            deny_ffi: merge_denies(sets.iter().map(|s| &s.deny_ffi)),
            allow_scripts: merge_grants(sets.iter().map(|s| s.allow_scripts.as_ref())),
            deny_scripts: merge_denies(sets.iter().map(|s| &s.deny_scripts)),
            allow_import: merge_grants(sets.iter().map(|s| s.allow_import.as_ref())),
        }
    }

    pub fn merge(&self, other: &CapabilitySet) -> CapabilitySet {
        Self::merge_all([self, other])
    }

    /// Renders the set as interpreter permission flags.
    ///
    /// Category order is fixed: read, write, net, env, sys, run, ffi,
    /// scripts, import. Each category emits its allow flag (bare when
    /// all-allowed) followed by its deny flag.
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        push_flags(&mut flags, "read", self.allow_read.as_ref(), Some(&self.deny_read));
        push_flags(&mut flags, "write", self.allow_write.as_ref(), Some(&self.deny_write));
        push_flags(&mut flags, "net", self.allow_net.as_ref(), Some(&self.deny_net));
        push_flags(&mut flags, "env", self.allow_env.as_ref(), Some(&self.deny_env));
        push_flags(&mut flags, "sys", self.allow_sys.as_ref(), Some(&self.deny_sys));
        push_flags(&mut flags, "run", self.allow_run.as_ref(), Some(&self.deny_run));
        push_flags(&mut flags, "ffi", self.allow_ffi.as_ref(), Some(&self.deny_ffi));
        push_flags(
            &mut flags,
            "scripts",
            self.allow_scripts.as_ref(),
            Some(&self.deny_scripts),
        );
        push_flags::<String>(&mut flags, "import", self.allow_import.as_ref(), None);
        flags
    }

    /// Rejects scopes that cannot be rendered into a flag: empty strings
    /// and scopes containing the `,` separator.
    pub fn validate(&self) -> ToolResult<()> {
        let string_categories: [(&str, Option<&Grant<String>>, Option<&BTreeSet<String>>); 8] = [
            ("read", self.allow_read.as_ref(), Some(&self.deny_read)),
            ("write", self.allow_write.as_ref(), Some(&self.deny_write)),
            ("net", self.allow_net.as_ref(), Some(&self.deny_net)),
            ("env", self.allow_env.as_ref(), Some(&self.deny_env)),
            ("run", self.allow_run.as_ref(), Some(&self.deny_run)),
            ("ffi", self.allow_ffi.as_ref(), Some(&self.deny_ffi)),
            ("scripts", self.allow_scripts.as_ref(), Some(&self.deny_scripts)),
            ("import", self.allow_import.as_ref(), None),
        ];

        for (category, allow, deny) in string_categories {
            let allowed = match allow {
                Some(Grant::Scopes(scopes)) => Some(scopes),
                _ => None,
            };
            for scope in allowed.into_iter().chain(deny).flatten() {
                if scope.trim().is_empty() {
                    return Err(ToolError::Configuration(format!(
                        "empty scope in '{category}' permissions"
                    )));
                }
                if scope.contains(',') {
                    return Err(ToolError::Configuration(format!(
                        "invalid '{category}' scope '{scope}': scopes must not contain ','"
                    )));
                }
            }
        }
        Ok(())
    }
}
