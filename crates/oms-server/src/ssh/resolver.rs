//! Expand a `(kind, id)` target into hosts
//!
//! Selector groups carry a one-line rule in `params`:
//!
//! ```text
//! -G <glob>        addr matches the glob, `*` is a wildcard
//! -L <a1,a2,...>   addr is one of the listed addresses
//! -E <regex>       addr matches the regular expression
//! <glob>           no flag, same as -G
//! ```
//!
//! The argument may be wrapped in double quotes.

use std::str::FromStr;

use oms_core::models::{GroupMode, Host, Preload};
use oms_core::store::StoreResult;
use oms_core::{Inventory, StoreError};

/// What a target id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Host,
    Tag,
    Group,
}

impl FromStr for TargetKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "tag" => Ok(Self::Tag),
            "group" => Ok(Self::Group),
            _ => Err(()),
        }
    }
}

/// Parsed selector-group rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Glob(String),
    List(Vec<String>),
    Regex(String),
}

/// Parse a selector rule; `None` when it is malformed
pub fn parse_selector(params: &str) -> Option<Selector> {
    let params = params.trim();
    let (first, rest) = match params.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (params, ""),
    };
    if first.is_empty() {
        return None;
    }

    if !first.starts_with('-') {
        return Some(Selector::Glob(strip_quotes(first).to_string()));
    }

    let arg = strip_quotes(rest);
    if arg.is_empty() {
        return None;
    }
    match first {
        "-G" => Some(Selector::Glob(arg.to_string())),
        "-E" => Some(Selector::Regex(arg.to_string())),
        "-L" => {
            let addrs: Vec<String> = arg
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
            if addrs.is_empty() {
                None
            } else {
                Some(Selector::List(addrs))
            }
        }
        _ => None,
    }
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Hosts addressed by `(kind, id)`.
///
/// An unknown kind or a malformed selector yields no hosts. Store
/// failures, including a missing host, tag or group, are returned.
pub fn resolve(store: &dyn Inventory, kind: &str, id: i64) -> StoreResult<Vec<Host>> {
    let Ok(kind) = kind.parse::<TargetKind>() else {
        tracing::debug!("unknown target kind {:?}", kind);
        return Ok(Vec::new());
    };

    match kind {
        TargetKind::Host => Ok(vec![store.get_host(id, Preload::NONE)?]),
        TargetKind::Tag => store.hosts_by_tag(id),
        TargetKind::Group => {
            let group = store.get_group(id)?;
            match group.mode {
                GroupMode::Static => store.hosts_by_group(id),
                GroupMode::Selector => select(store, &group.params),
            }
        }
    }
}

fn select(store: &dyn Inventory, params: &str) -> StoreResult<Vec<Host>> {
    let Some(selector) = parse_selector(params) else {
        tracing::error!("malformed group params: {:?}", params);
        return Ok(Vec::new());
    };

    let found = match &selector {
        Selector::Glob(pattern) => store.hosts_by_glob(pattern),
        Selector::Regex(pattern) => store.hosts_by_regex(pattern),
        Selector::List(addrs) => {
            let mut hosts = Vec::new();
            for addr in addrs {
                hosts.extend(store.hosts_by_addr(addr)?);
            }
            Ok(hosts)
        }
    };

    match found {
        Err(StoreError::Pattern(e)) => {
            tracing::error!("bad group pattern {:?}: {}", params, e);
            Ok(Vec::new())
        }
        other => other,
    }
}
