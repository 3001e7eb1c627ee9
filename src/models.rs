use crate::utils::{format_mac_hyphen, parse_mac};
use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Canonical textual IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ip(pub String);

impl Ip {
    pub fn from_addr(addr: Ipv4Addr) -> Self {
        Ip(addr.to_string())
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Ip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Ip {
    fn from(s: &str) -> Self {
        Ip(s.to_string())
    }
}

/// MAC address, stored uppercase hyphen-separated. Colon form is accepted
/// at every ingress point and normalized on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Mac(String);

impl Mac {
    pub fn new(raw: &str) -> anyhow::Result<Self> {
        let bytes = parse_mac(raw)?;
        Ok(Mac(format_mac_hyphen(&bytes)))
    }

    pub fn from_bytes(bytes: &[u8; 6]) -> Self {
        Mac(format_mac_hyphen(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn with_colons(&self) -> String {
        self.0.replace('-', ":").to_lowercase()
    }

    pub fn to_bytes(&self) -> anyhow::Result<[u8; 6]> {
        parse_mac(&self.0)
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Mac {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Mac::new(&raw).map_err(D::Error::custom)
    }
}

/// Short device/domain group label. The slash is reserved for synthetic
/// match-all group names, so it is stripped from user input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Group(pub String);

impl Group {
    pub fn new(raw: &str) -> Self {
        Group(raw.replace('/', ""))
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Group {
    fn from(s: &str) -> Self {
        Group(s.to_string())
    }
}

/// Lowercase host label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain(pub String);

impl Domain {
    pub fn new(raw: &str) -> Self {
        Domain(raw.to_lowercase())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Domain(s.to_string())
    }
}

pub type MapGroupDomains = HashMap<Group, Vec<Domain>>;
pub type MapIpDomain = HashMap<Ip, Domain>;
pub type MapIpGroups = HashMap<Ip, Vec<Group>>;
pub type MapIpMacs = HashMap<Ip, Mac>;
pub type MapDomainGroups = HashMap<Domain, Vec<Group>>;
pub type MapGroupTrackerConfig = HashMap<Group, TrackerConfig>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "in"),
            Direction::Egress => write!(f, "out"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    Monitor,
    Allow,
    Block,
}

impl Default for TrackerMode {
    fn default() -> Self {
        TrackerMode::Monitor
    }
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Per-group usage tracker configuration.
///
/// Durations serialize in human form ("168h", "30m"); granularity is a
/// process-wide setting and never round-trips through the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    #[serde(skip)]
    pub granularity: Duration,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,
    /// Day of week the window starts on (0 = Sunday), used for weekly retention.
    pub start_day: u32,
    /// Offset past midnight at which the window starts.
    #[serde(with = "humantime_serde", rename = "startTime")]
    pub start_duration: Duration,
    pub sample_size: usize,
    pub mode: TrackerMode,
    #[serde(default = "epoch")]
    pub mode_end_time: DateTime<Utc>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: Duration::from_secs(168 * 3600),
            threshold: Duration::from_secs(180 * 60),
            start_day: 5,
            start_duration: Duration::ZERO,
            sample_size: 0,
            mode: TrackerMode::Monitor,
            mode_end_time: epoch(),
        }
    }
}

impl TrackerConfig {
    pub fn sample_size_for(&self) -> usize {
        let g = self.granularity.as_secs().max(1);
        (self.retention.as_secs() / g) as usize
    }
}

/// A MAC with an optional friendly device name, as stored in group-macs.yaml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedMac {
    pub mac: Mac,
    #[serde(default)]
    pub name: String,
}

/// Per-group usage summary for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSummary {
    pub used: usize,
    pub total: usize,
    pub percentage: u32,
    #[serde(rename = "activity")]
    pub last_active_times: HashMap<Mac, DateTime<Utc>>,
}

// Snapshot receivers. Publishers hand every receiver an owned copy so no
// consumer ever observes torn state.

pub trait SourceIpGroupsReceiver: Send + Sync {
    fn update_source_ip_groups(&self, new_data: MapIpGroups);
}

pub trait SourceIpMacsReceiver: Send + Sync {
    fn update_source_ip_macs(&self, new_data: MapIpMacs);
}

pub trait DestIpDomainReceiver: Send + Sync {
    fn update_dest_ip_domains(&self, new_data: MapIpDomain);
}

pub trait DestIpGroupsReceiver: Send + Sync {
    fn update_dest_ip_groups(&self, new_data: MapIpGroups);
}

pub trait DestDomainGroupsReceiver: Send + Sync {
    fn update_dest_domain_groups(&self, new_data: MapDomainGroups);
}
