use crate::models::{DestIpDomainReceiver, Ip, MapIpDomain, MapIpGroups, SourceIpGroupsReceiver};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;

const TABLE_NAME: &str = "tubetimeout";
const FILTER_CHAIN: &str = "filter";
const NAT_CHAIN: &str = "post-routing";
const LOCAL_SET: &str = "local_ip_set";
const REMOTE_SET: &str = "remote_ip_set";
const PROTOCOL_SET: &str = "protocol_set";
const UDP_PORT_SET: &str = "udp_ports";

/// Runs the nft binary with the given arguments, optionally feeding a
/// ruleset program on stdin. Swappable so tests never touch the kernel.
pub type NftRunner = Box<dyn Fn(&[&str], Option<&str>) -> Result<String> + Send + Sync>;

pub fn default_nft_runner(args: &[&str], stdin: Option<&str>) -> Result<String> {
    let mut command = Command::new("nft");
    command.args(args);
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = match stdin {
        Some(program) => {
            command.stdin(Stdio::piped());
            let mut child = command.spawn().context("failed to spawn nft")?;
            child
                .stdin
                .as_mut()
                .context("failed to open nft stdin")?
                .write_all(program.as_bytes())
                .context("failed to write nft program")?;
            child.wait_with_output().context("failed to wait for nft")?
        }
        None => command.output().context("failed to run nft")?,
    };

    if !output.status.success() {
        return Err(anyhow::anyhow!(
            "nft {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Owns the dedicated kernel table: a masquerading NAT chain, the forward
/// classification chain, and the dynamic IP sets feeding the queue rules.
pub struct NftRules {
    runner: NftRunner,
    local_ips: Mutex<Vec<Ip>>,
    remote_ips: Mutex<Vec<Ip>>,
}

impl NftRules {
    pub fn new(outbound_queue: u16, inbound_queue: u16) -> Result<Self> {
        Self::with_runner(Box::new(default_nft_runner), outbound_queue, inbound_queue)
    }

    pub fn with_runner(runner: NftRunner, outbound_queue: u16, inbound_queue: u16) -> Result<Self> {
        let rules = NftRules {
            runner,
            local_ips: Mutex::new(Vec::new()),
            remote_ips: Mutex::new(Vec::new()),
        };

        // Start from a clean slate; a leftover table from a crashed run
        // would otherwise double up every rule.
        if let Err(e) = (rules.runner)(&["delete", "table", "ip", TABLE_NAME], None) {
            debug!("No previous table to delete: {:#}", e);
        }

        let program = ruleset_program(outbound_queue, inbound_queue);
        (rules.runner)(&["-f", "-"], Some(&program)).context("failed to install nftables ruleset")?;
        info!("NFT table {:?} installed", TABLE_NAME);

        Ok(rules)
    }

    /// Replace the kernel contents of both IP sets in one atomic batch.
    /// Refuses while either side is still empty; the producers simply retry
    /// on their next tick. In-flight verdicts are unaffected.
    fn update_ip_sets(&self) -> Result<()> {
        let local_ips = self.local_ips.lock().unwrap().clone();
        let remote_ips = self.remote_ips.lock().unwrap().clone();

        if local_ips.is_empty() {
            return Err(anyhow::anyhow!("local IPs aren't ready"));
        }
        if remote_ips.is_empty() {
            return Err(anyhow::anyhow!("remote IPs aren't ready"));
        }

        let mut program = String::new();
        for (set_name, ips) in [(LOCAL_SET, &local_ips), (REMOTE_SET, &remote_ips)] {
            let existing = self.set_elements(set_name)?;
            if !existing.is_empty() {
                program.push_str(&format!(
                    "delete element ip {} {} {{ {} }}\n",
                    TABLE_NAME,
                    set_name,
                    join_ips(&existing)
                ));
            }
            program.push_str(&format!(
                "add element ip {} {} {{ {} }}\n",
                TABLE_NAME,
                set_name,
                join_ips(ips)
            ));
        }

        (self.runner)(&["-f", "-"], Some(&program)).context("failed to flush nftables sets")?;
        info!(
            "NFT sets updated with {} local IPs and {} remote IPs",
            local_ips.len(),
            remote_ips.len()
        );
        Ok(())
    }

    /// Current kernel contents of a set, via `nft -j`.
    pub fn set_elements(&self, set_name: &str) -> Result<Vec<Ip>> {
        let output = (self.runner)(&["-j", "list", "set", "ip", TABLE_NAME, set_name], None)?;
        parse_set_elements(&output)
    }

    /// Delete the entire table (chains, sets, rules) in one flush and verify
    /// the kernel no longer reports it. Queue handles must still be open at
    /// this point; closing them first would strand in-flight verdicts.
    pub fn clean(&self) -> Result<()> {
        (self.runner)(&["delete", "table", "ip", TABLE_NAME], None)
            .context("failed to delete nft table")?;

        let tables = (self.runner)(&["list", "tables", "ip"], None)?;
        if tables
            .lines()
            .any(|line| line.split_whitespace().last() == Some(TABLE_NAME))
        {
            return Err(anyhow::anyhow!("nft table {:?} not deleted", TABLE_NAME));
        }
        info!("NFT table {:?} deleted", TABLE_NAME);
        Ok(())
    }
}

impl SourceIpGroupsReceiver for NftRules {
    fn update_source_ip_groups(&self, new_data: MapIpGroups) {
        debug!("NFT callback with new source IPs: {:?}", new_data);

        let (ips, discarded) = valid_ipv4_keys(new_data.keys());
        if discarded > 0 {
            info!("NFT source IP callback discarded {} address(es)", discarded);
        }

        {
            let mut local_ips = self.local_ips.lock().unwrap();
            *local_ips = ips;
        }
        if let Err(e) = self.update_ip_sets() {
            warn!("NFT callback with new source IPs couldn't make the update: {:#}", e);
        }
    }
}

impl DestIpDomainReceiver for NftRules {
    fn update_dest_ip_domains(&self, new_data: MapIpDomain) {
        debug!("NFT callback with new destination IPs: {:?}", new_data);

        let (ips, discarded) = valid_ipv4_keys(new_data.keys());
        if discarded > 0 {
            info!("NFT destination IP callback discarded {} address(es)", discarded);
        }

        {
            let mut remote_ips = self.remote_ips.lock().unwrap();
            *remote_ips = ips;
        }
        if let Err(e) = self.update_ip_sets() {
            warn!("NFT callback with new destination IPs couldn't make the update: {:#}", e);
        }
    }
}

fn valid_ipv4_keys<'a>(keys: impl Iterator<Item = &'a Ip>) -> (Vec<Ip>, usize) {
    let mut ips = Vec::new();
    let mut discarded = 0;
    for ip in keys {
        if ip.as_ipv4().is_some() {
            ips.push(ip.clone());
        } else {
            discarded += 1;
        }
    }
    ips.sort();
    (ips, discarded)
}

fn join_ips(ips: &[Ip]) -> String {
    ips.iter()
        .map(|ip| ip.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The full ruleset installed at startup. Only packets with src in
/// local_ip_set, dst in remote_ip_set and a tracked protocol are queued to
/// userspace; UDP to the QUIC/NAT-T ports is queued whenever the LAN side
/// is in local_ip_set so it can be dropped there.
fn ruleset_program(outbound_queue: u16, inbound_queue: u16) -> String {
    format!(
        "add table ip {table}\n\
         add chain ip {table} {nat} {{ type nat hook postrouting priority srcnat ; }}\n\
         add rule ip {table} {nat} masquerade\n\
         add chain ip {table} {filter} {{ type filter hook forward priority filter ; }}\n\
         add set ip {table} {proto} {{ type inet_proto ; }}\n\
         add element ip {table} {proto} {{ 6, 17 }}\n\
         add set ip {table} {local} {{ type ipv4_addr ; }}\n\
         add set ip {table} {remote} {{ type ipv4_addr ; }}\n\
         add set ip {table} {ports} {{ type inet_service ; }}\n\
         add element ip {table} {ports} {{ 443, 500, 4500 }}\n\
         add rule ip {table} {filter} ip saddr @{local} udp dport @{ports} queue num {out}\n\
         add rule ip {table} {filter} ip daddr @{local} udp dport @{ports} queue num {inb}\n\
         add rule ip {table} {filter} ip saddr @{local} ip daddr @{remote} ip protocol @{proto} queue num {out}\n\
         add rule ip {table} {filter} ip saddr @{remote} ip daddr @{local} ip protocol @{proto} queue num {inb}\n",
        table = TABLE_NAME,
        nat = NAT_CHAIN,
        filter = FILTER_CHAIN,
        proto = PROTOCOL_SET,
        local = LOCAL_SET,
        remote = REMOTE_SET,
        ports = UDP_PORT_SET,
        out = outbound_queue,
        inb = inbound_queue,
    )
}

/// Pull the element list out of `nft -j list set` output.
fn parse_set_elements(json: &str) -> Result<Vec<Ip>> {
    let value: serde_json::Value = serde_json::from_str(json).context("invalid nft JSON output")?;
    let mut ips = Vec::new();

    let objects = value
        .get("nftables")
        .and_then(|v| v.as_array())
        .context("missing nftables array in nft output")?;

    for object in objects {
        let Some(set) = object.get("set") else {
            continue;
        };
        let Some(elements) = set.get("elem").and_then(|v| v.as_array()) else {
            continue;
        };
        for element in elements {
            // Plain elements are strings; interval/timeout elements nest
            // the value under elem.val.
            let raw = element.as_str().or_else(|| {
                element
                    .get("elem")
                    .and_then(|e| e.get("val"))
                    .and_then(|v| v.as_str())
            });
            if let Some(raw) = raw {
                ips.push(Ip::from(raw));
            }
        }
    }

    Ok(ips)
}
