//! Inventory records and their creation invariants
//!
//! Entities reference each other by numeric id only. A Host does not own
//! its Tunnels or Jobs in memory; relation fields are filled on demand by
//! the store's preload hints and are plain snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::ValidationError;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ValidationError::Enum {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Where a tunnel's listener lives
    TunnelMode, "tunnel.mode", {
        Local => "local",
        Remote => "remote",
    }
);

impl Default for TunnelMode {
    fn default() -> Self {
        Self::Local
    }
}

string_enum!(
    /// Job kind
    JobType, "job.type", {
        Cron => "cron",
        Task => "task",
    }
);

string_enum!(
    /// Persisted job state
    JobStatus, "job.status", {
        Ready => "ready",
        Running => "running",
        Stop => "stop",
        Done => "done",
        Fatal => "fatal",
        Backoff => "backoff",
    }
);

impl Default for JobStatus {
    fn default() -> Self {
        Self::Ready
    }
}

string_enum!(
    /// What a job executes
    CmdType, "job.cmd_type", {
        Cmd => "cmd",
        Player => "player",
    }
);

impl Default for CmdType {
    fn default() -> Self {
        Self::Cmd
    }
}

string_enum!(
    /// State of one job run
    InstanceStatus, "instance.status", {
        Running => "running",
        Done => "done",
        Failed => "failed",
    }
);

/// Group membership rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum GroupMode {
    /// Members are hosts with `group_id` set to this group
    #[default]
    Static,
    /// Members come from the selector in `params`
    Selector,
}

impl From<GroupMode> for u8 {
    fn from(mode: GroupMode) -> u8 {
        match mode {
            GroupMode::Static => 0,
            GroupMode::Selector => 1,
        }
    }
}

impl TryFrom<u8> for GroupMode {
    type Error = ValidationError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Static),
            1 => Ok(Self::Selector),
            other => Err(ValidationError::Enum {
                field: "group.mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A named credential
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    pub id: i64,
    pub name: String,
    /// PEM text
    #[serde(skip_serializing)]
    pub key_file: String,
    #[serde(skip_serializing)]
    pub passphrase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub mode: GroupMode,
    /// Selector line, only read in selector mode
    pub params: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: i64,
    pub mode: TunnelMode,
    pub source: String,
    pub destination: String,
    pub status: bool,
    pub error_msg: String,
    pub host_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub spec: String,
    pub cmd: String,
    pub cmd_type: CmdType,
    /// PlayBook id when `cmd_type` is `player`
    pub cmd_id: Option<i64>,
    /// Run task jobs through sudo; cron jobs use sudo whenever the host has a password
    #[serde(default)]
    pub sudo: bool,
    pub status: JobStatus,
    pub host_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub job_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayBook {
    pub id: i64,
    pub name: String,
    /// Serialized step array
    pub steps: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicklyCommand {
    pub id: i64,
    pub name: String,
    pub cmd: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHistory {
    pub id: i64,
    pub cmd: String,
    pub times: u32,
}

/// Host identity record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub user: String,
    pub addr: String,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: String,
    pub private_key_id: Option<i64>,
    /// Inline key material from before `PrivateKey` rows existed
    #[serde(skip_serializing)]
    pub legacy_key_file: String,
    pub group_id: Option<i64>,
    pub status: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Host {
    /// `addr:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Login user, `root` when unset
    pub fn login_user(&self) -> &str {
        if self.user.is_empty() {
            "root"
        } else {
            &self.user
        }
    }
}

/// Relations to load alongside a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preload {
    pub tags: bool,
    pub group: bool,
    pub tunnels: bool,
    pub jobs: bool,
}

impl Preload {
    pub const NONE: Preload = Preload {
        tags: false,
        group: false,
        tunnels: false,
        jobs: false,
    };

    pub const ALL: Preload = Preload {
        tags: true,
        group: true,
        tunnels: true,
        jobs: true,
    };
}

/// Input for creating or replacing a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewHost {
    pub name: String,
    pub user: String,
    pub addr: String,
    pub port: Option<i64>,
    pub password: String,
    pub private_key_id: Option<i64>,
    pub legacy_key_file: String,
    pub group_id: Option<i64>,
    pub tag_ids: Vec<i64>,
}

impl NewHost {
    /// Check creation invariants and return the effective port.
    pub fn validate(&self) -> Result<u16, ValidationError> {
        let port = self.port.unwrap_or(DEFAULT_SSH_PORT as i64);
        if !(1..=65535).contains(&port) {
            return Err(ValidationError::Port(port));
        }
        if !is_valid_addr(&self.addr) {
            return Err(ValidationError::Address(self.addr.clone()));
        }
        if self.password.is_empty() == self.private_key_id.is_none() {
            return Err(ValidationError::Credential);
        }
        Ok(port as u16)
    }
}

/// Input for creating or replacing a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTunnel {
    #[serde(default)]
    pub mode: TunnelMode,
    pub source: String,
    pub destination: String,
    pub host_id: i64,
}

impl NewTunnel {
    pub fn validate(&self) -> Result<(), ValidationError> {
        split_endpoint(&self.source)?;
        split_endpoint(&self.destination)?;
        Ok(())
    }
}

/// Input for creating or replacing a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub spec: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub cmd_type: CmdType,
    #[serde(default)]
    pub cmd_id: Option<i64>,
    #[serde(default)]
    pub sudo: bool,
    pub host_id: i64,
}

impl NewJob {
    /// Shape checks only; cron syntax is checked by the scheduler.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Empty("job.name"));
        }
        match self.cmd_type {
            CmdType::Cmd if self.cmd.trim().is_empty() => Err(ValidationError::Empty("job.cmd")),
            CmdType::Player if self.cmd_id.is_none() => Err(ValidationError::Empty("job.cmd_id")),
            _ => {
                if self.job_type == JobType::Cron && self.spec.trim().is_empty() {
                    return Err(ValidationError::Empty("job.spec"));
                }
                Ok(())
            }
        }
    }
}

/// Offset/limit pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Page {
    pub page_num: u32,
    pub page_size: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page_num: 1,
            page_size: 20,
        }
    }
}

impl Page {
    /// Zero values fall back to the defaults
    pub fn normalized(self) -> Self {
        let d = Page::default();
        Self {
            page_num: if self.page_num == 0 { d.page_num } else { self.page_num },
            page_size: if self.page_size == 0 { d.page_size } else { self.page_size },
        }
    }

    pub fn offset(&self) -> i64 {
        let p = self.normalized();
        (p.page_num as i64 - 1) * p.page_size as i64
    }

    pub fn limit(&self) -> i64 {
        self.normalized().page_size as i64
    }
}

/// One page of results plus the total row count
#[derive(Debug, Clone, Serialize)]
pub struct PageData<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page_num: u32,
}

/// Split a `host:port` endpoint.
pub fn split_endpoint(endpoint: &str) -> Result<(String, u16), ValidationError> {
    let bad = || ValidationError::Endpoint(endpoint.to_string());
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(bad)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || !is_valid_addr(host) {
        return Err(bad());
    }
    let port: u16 = port.parse().map_err(|_| bad())?;
    if port == 0 {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}

/// IP literal or RFC 1123 host name
pub fn is_valid_addr(addr: &str) -> bool {
    if addr.parse::<IpAddr>().is_ok() {
        return true;
    }
    if addr.is_empty() || addr.len() > 253 {
        return false;
    }
    addr.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_host() -> NewHost {
        NewHost {
            name: "web-1".into(),
            addr: "10.0.0.5".into(),
            password: "pw".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_host_defaults_port() {
        assert_eq!(new_host().validate().unwrap(), 22);
    }

    #[test]
    fn test_host_rejects_bad_port_and_addr() {
        let mut h = new_host();
        h.port = Some(0);
        assert_eq!(h.validate(), Err(ValidationError::Port(0)));
        h.port = Some(70000);
        assert_eq!(h.validate(), Err(ValidationError::Port(70000)));

        let mut h = new_host();
        h.addr = "bad host!".into();
        assert!(matches!(h.validate(), Err(ValidationError::Address(_))));
    }

    #[test]
    fn test_host_requires_exactly_one_credential() {
        let mut h = new_host();
        h.private_key_id = Some(3);
        assert_eq!(h.validate(), Err(ValidationError::Credential));

        h.password.clear();
        assert!(h.validate().is_ok());

        h.private_key_id = None;
        assert_eq!(h.validate(), Err(ValidationError::Credential));
    }

    #[test]
    fn test_addr_forms() {
        assert!(is_valid_addr("192.168.1.10"));
        assert!(is_valid_addr("::1"));
        assert!(is_valid_addr("db-01.internal.example.com"));
        assert!(!is_valid_addr("-lead.example.com"));
        assert!(!is_valid_addr(""));
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(
            split_endpoint("127.0.0.1:80").unwrap(),
            ("127.0.0.1".to_string(), 80)
        );
        assert_eq!(
            split_endpoint("0.0.0.0:9000").unwrap(),
            ("0.0.0.0".to_string(), 9000)
        );
        assert!(split_endpoint("localhost").is_err());
        assert!(split_endpoint("localhost:http").is_err());
        assert!(split_endpoint(":80").is_err());
    }

    #[test]
    fn test_enum_text_forms() {
        assert_eq!("backoff".parse::<JobStatus>().unwrap(), JobStatus::Backoff);
        assert!("paused".parse::<JobStatus>().is_err());
        assert_eq!(TunnelMode::default(), TunnelMode::Local);
        assert_eq!(serde_json::to_string(&GroupMode::Selector).unwrap(), "1");
        assert!(serde_json::from_str::<GroupMode>("2").is_err());
    }

    #[test]
    fn test_job_validation() {
        let mut job = NewJob {
            name: "backup".into(),
            job_type: JobType::Cron,
            spec: "*/5 * * * *".into(),
            cmd: "tar czf /tmp/b.tgz /etc".into(),
            cmd_type: CmdType::Cmd,
            cmd_id: None,
            sudo: false,
            host_id: 1,
        };
        assert!(job.validate().is_ok());
        job.spec.clear();
        assert_eq!(job.validate(), Err(ValidationError::Empty("job.spec")));
        job.job_type = JobType::Task;
        assert!(job.validate().is_ok());
        job.cmd_type = CmdType::Player;
        assert_eq!(job.validate(), Err(ValidationError::Empty("job.cmd_id")));
    }

    #[test]
    fn test_page_math() {
        let p = Page {
            page_num: 3,
            page_size: 10,
        };
        assert_eq!(p.offset(), 20);
        assert_eq!(p.limit(), 10);
        let z = Page {
            page_num: 0,
            page_size: 0,
        };
        assert_eq!(z.offset(), 0);
        assert_eq!(z.limit(), 20);
    }
}
