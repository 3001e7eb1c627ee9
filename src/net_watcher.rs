use crate::group_macs::{self, GroupMacsConfig};
use crate::models::{
    Group, Ip, Mac, MapIpGroups, MapIpMacs, SourceIpGroupsReceiver, SourceIpMacsReceiver,
};
use anyhow::Result;
use log::{debug, error, info, warn};
use regex::Regex;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_GROUP_NAME: &str = "default";
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub type ArpCommand = fn() -> Result<String>;

pub fn default_arp_command() -> Result<String> {
    // -n: numerical addresses, -a: all hosts
    let output = Command::new("arp").args(["-n", "-a"]).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Periodic ARP scanner: publishes source IP→groups and IP→MAC snapshots.
pub struct NetWatcher {
    arp_cmd: ArpCommand,
    group_macs_path: PathBuf,
    match_all: Arc<AtomicBool>,
    source_ip_groups: Mutex<MapIpGroups>,
    ip_groups_receivers: Vec<Arc<dyn SourceIpGroupsReceiver>>,
    ip_macs_receivers: Vec<Arc<dyn SourceIpMacsReceiver>>,
}

impl NetWatcher {
    pub fn new(group_macs_path: PathBuf, match_all: Arc<AtomicBool>) -> Self {
        NetWatcher {
            arp_cmd: default_arp_command,
            group_macs_path,
            match_all,
            source_ip_groups: Mutex::new(MapIpGroups::new()),
            ip_groups_receivers: Vec::new(),
            ip_macs_receivers: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_arp_command(mut self, arp_cmd: ArpCommand) -> Self {
        self.arp_cmd = arp_cmd;
        self
    }

    pub fn register_source_ip_groups_receivers(
        &mut self,
        receivers: Vec<Arc<dyn SourceIpGroupsReceiver>>,
    ) {
        self.ip_groups_receivers.extend(receivers);
    }

    pub fn register_source_ip_macs_receivers(
        &mut self,
        receivers: Vec<Arc<dyn SourceIpMacsReceiver>>,
    ) {
        self.ip_macs_receivers.extend(receivers);
    }

    /// Begin periodic ARP scanning with one immediate run at start.
    pub fn start(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.scan_and_notify();
            let mut ticker = tokio::time::interval(SCAN_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.scan_and_notify();
                    }
                    _ = shutdown.notified() => {
                        info!("Net watcher received shutdown signal, stopping...");
                        break;
                    }
                }
            }
        })
    }

    fn scan_and_notify(&self) {
        let (new_ip_groups, new_ip_macs) = match self.scan_network() {
            Some(maps) => maps,
            None => return, // ARP failed; skip the tick, no publication
        };

        debug!("ARP scan results: {:?}", new_ip_groups);

        let match_all = self.match_all.load(Ordering::Relaxed);
        let changed = {
            let mut current = self.source_ip_groups.lock().unwrap();
            let changed = *current != new_ip_groups;
            if changed {
                *current = new_ip_groups.clone();
            }
            changed
        };

        if changed || match_all {
            info!("ARP scan detected changes in source IPs: {:?}", new_ip_groups);
            for receiver in &self.ip_groups_receivers {
                receiver.update_source_ip_groups(new_ip_groups.clone());
            }
            debug!("ARP scan notified {} receivers", self.ip_groups_receivers.len());
        }

        if !new_ip_macs.is_empty() {
            for receiver in &self.ip_macs_receivers {
                receiver.update_source_ip_macs(new_ip_macs.clone());
            }
        } else {
            error!("no IP-MAC data found to send downstream (usage stats will not work)");
        }
    }

    /// Run one ARP scan, joining observed MACs against the configured
    /// group-MACs file. Returns None only when the ARP command itself fails.
    fn scan_network(&self) -> Option<(MapIpGroups, MapIpMacs)> {
        let config = match group_macs::load(&self.group_macs_path) {
            Ok(config) if !config.groups.is_empty() => {
                self.match_all.store(false, Ordering::Relaxed);
                config
            }
            Ok(_) => {
                warn!(
                    "Source IPs will be tracked individually: no group-MACs configured in {:?}",
                    self.group_macs_path
                );
                self.match_all.store(true, Ordering::Relaxed);
                GroupMacsConfig::default()
            }
            Err(e) => {
                error!("Source IPs will be tracked individually. Error loading group-MACs: {:#}", e);
                self.match_all.store(true, Ordering::Relaxed);
                GroupMacsConfig::default()
            }
        };
        let match_all = self.match_all.load(Ordering::Relaxed);

        let output = match (self.arp_cmd)() {
            Ok(output) => output,
            Err(e) => {
                error!("Error running ARP command: {:#}", e);
                return None;
            }
        };

        Some(parse_arp_output(&output, &config, match_all))
    }
}

fn parse_arp_output(
    output: &str,
    config: &GroupMacsConfig,
    match_all: bool,
) -> (MapIpGroups, MapIpMacs) {
    let mac_regex = Regex::new(r"(?i)^([0-9A-F]{2}[:-]){5}[0-9A-F]{2}$").unwrap();

    let mut ip_groups = MapIpGroups::new();
    let mut ip_macs = MapIpMacs::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        // Field zero may be '?' since hostnames aren't looked up.
        let arp_ip = fields[1].trim_matches(|c| c == '(' || c == ')');
        let raw_mac = fields[3];

        if !mac_regex.is_match(raw_mac) {
            continue;
        }
        let mac = match Mac::new(raw_mac) {
            Ok(mac) => mac,
            Err(_) => continue,
        };

        let ip = Ip::from(arp_ip);
        // Last observation wins when a MAC shows up on multiple adapters.
        ip_macs.insert(ip.clone(), mac.clone());

        if match_all {
            ip_groups.insert(ip, vec![Group::from(DEFAULT_GROUP_NAME)]);
        } else {
            for (group, named_macs) in &config.groups {
                if named_macs.iter().any(|named| named.mac == mac) {
                    let groups = ip_groups.entry(ip.clone()).or_default();
                    if !groups.contains(group) {
                        groups.push(group.clone());
                    }
                }
            }
        }
    }

    (ip_groups, ip_macs)
}
