use crate::models::{
    DestDomainGroupsReceiver, DestIpDomainReceiver, DestIpGroupsReceiver, Domain, Group, Ip,
    MapDomainGroups, MapGroupDomains, MapIpDomain, MapIpGroups,
};
use crate::storage;
use anyhow::{Context, Result};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

pub const GROUP_DOMAINS_FILE: &str = "group-domains.yaml";

const DOMAINS_URL: &str =
    "https://raw.githubusercontent.com/nickspaargaren/no-google/master/categories/youtubeparsed";
const EMBEDDED_DOMAINS: &str = include_str!("youtube-domains.txt");
const DEFAULT_DOMAIN_GROUP: &str = "youtube";

const RESOLVE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const PUBLIC_RESOLVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// On-disk shape of group-domains.yaml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GroupDomainsConfig {
    #[serde(default)]
    groups: MapGroupDomains,
}

/// Periodically resolves the configured destination domains and publishes
/// IP→Domain, IP→Groups and Domain→Groups snapshots.
pub struct DomainWatcher {
    http: reqwest::Client,
    resolver: TokioAsyncResolver,
    config_path: PathBuf,
    ip_domain_receivers: Vec<Arc<dyn DestIpDomainReceiver>>,
    ip_groups_receivers: Vec<Arc<dyn DestIpGroupsReceiver>>,
    domain_groups_receivers: Vec<Arc<dyn DestDomainGroupsReceiver>>,
}

impl DomainWatcher {
    pub fn new(config_path: PathBuf) -> Self {
        let mut resolver_config = ResolverConfig::new();
        resolver_config.add_name_server(NameServerConfig::new(
            SocketAddr::from((PUBLIC_RESOLVER, 53)),
            Protocol::Udp,
        ));
        let mut opts = ResolverOpts::default();
        opts.timeout = LOOKUP_TIMEOUT;

        DomainWatcher {
            http: reqwest::Client::new(),
            resolver: TokioAsyncResolver::tokio(resolver_config, opts),
            config_path,
            ip_domain_receivers: Vec::new(),
            ip_groups_receivers: Vec::new(),
            domain_groups_receivers: Vec::new(),
        }
    }

    pub fn register_dest_ip_domain_receivers(
        &mut self,
        receivers: Vec<Arc<dyn DestIpDomainReceiver>>,
    ) {
        self.ip_domain_receivers.extend(receivers);
    }

    pub fn register_dest_ip_groups_receivers(
        &mut self,
        receivers: Vec<Arc<dyn DestIpGroupsReceiver>>,
    ) {
        self.ip_groups_receivers.extend(receivers);
    }

    pub fn register_dest_domain_groups_receivers(
        &mut self,
        receivers: Vec<Arc<dyn DestDomainGroupsReceiver>>,
    ) {
        self.domain_groups_receivers.extend(receivers);
    }

    /// Begin periodic resolution with one immediate run at start.
    pub fn start(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.tick().await;
            let mut ticker = tokio::time::interval(RESOLVE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = shutdown.notified() => {
                        info!("Domain watcher received shutdown signal, stopping...");
                        break;
                    }
                }
            }
        })
    }

    async fn tick(&self) {
        let group_domains = self.load_group_domains().await;
        if group_domains.is_empty() {
            error!("No destination domains configured; skipping resolution tick");
            return;
        }

        let ip_domain = self.resolve_domains(&group_domains).await;
        let (domain_groups, ip_groups) = derive_groups(&group_domains, &ip_domain);

        self.publish(ip_domain, ip_groups, domain_groups);
    }

    fn publish(
        &self,
        ip_domain: MapIpDomain,
        ip_groups: MapIpGroups,
        domain_groups: MapDomainGroups,
    ) {
        info!(
            "Domain watcher notifying receivers of {} IP domains and {} IP groups",
            ip_domain.len(),
            ip_groups.len()
        );

        for receiver in &self.domain_groups_receivers {
            receiver.update_dest_domain_groups(domain_groups.clone());
        }
        for receiver in &self.ip_domain_receivers {
            receiver.update_dest_ip_domains(ip_domain.clone());
        }
        for receiver in &self.ip_groups_receivers {
            receiver.update_dest_ip_groups(ip_groups.clone());
        }
    }

    /// The destination domain configuration: the curated remote list (with
    /// the embedded copy as transport-failure fallback), overlaid with any
    /// groups from the local group-domains.yaml.
    async fn load_group_domains(&self) -> MapGroupDomains {
        let mut group_domains = match self.fetch_remote_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                warn!("Failed to fetch domains from URL: {:#}. Falling back to embedded list.", e);
                embedded_group_domains()
            }
        };

        match storage::load_yaml(&self.config_path, GroupDomainsConfig::default) {
            Ok(config) => {
                for (group, domains) in config.groups {
                    let domains = domains.iter().map(|d| Domain::new(&d.0)).collect();
                    group_domains.insert(group, domains);
                }
            }
            Err(e) => error!("Error loading group domains config: {:#}", e),
        }

        group_domains
    }

    async fn fetch_remote_domains(&self) -> Result<MapGroupDomains> {
        let body = self
            .http
            .get(DOMAINS_URL)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("bad response status")?
            .text()
            .await
            .context("failed to read body")?;

        let domains = parse_domains(&body);
        if domains.is_empty() {
            return Err(anyhow::anyhow!("remote domain list was empty"));
        }
        Ok(single_group(domains))
    }

    /// Resolve every configured domain concurrently, merging all A records
    /// into one IP→Domain map. On collisions the last writer wins.
    async fn resolve_domains(&self, group_domains: &MapGroupDomains) -> MapIpDomain {
        let unique: HashSet<Domain> = group_domains.values().flatten().cloned().collect();

        let mut lookups = JoinSet::new();
        for domain in unique {
            let resolver = self.resolver.clone();
            lookups.spawn(async move {
                let result = resolver.ipv4_lookup(domain.0.clone()).await;
                (domain, result)
            });
        }

        let mut ip_domain = MapIpDomain::new();
        let mut resolved = 0usize;
        while let Some(joined) = lookups.join_next().await {
            let (domain, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Domain lookup task failed: {:#}", e);
                    continue;
                }
            };
            match result {
                Ok(lookup) => {
                    resolved += 1;
                    for record in lookup.iter() {
                        ip_domain.insert(Ip::from_addr(record.0), domain.clone());
                    }
                }
                Err(e) => {
                    warn!("Error resolving {}: {}", domain, e);
                }
            }
        }

        debug!("Resolved {} domains into {} addresses", resolved, ip_domain.len());
        ip_domain
    }
}

/// Domain→Groups comes straight from the configuration; IP→Groups joins the
/// resolved addresses through it.
fn derive_groups(
    group_domains: &MapGroupDomains,
    ip_domain: &MapIpDomain,
) -> (MapDomainGroups, MapIpGroups) {
    let mut domain_groups = MapDomainGroups::new();
    for (group, domains) in group_domains {
        for domain in domains {
            // A domain may belong to multiple groups.
            let groups = domain_groups.entry(domain.clone()).or_default();
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
    }

    let mut ip_groups = MapIpGroups::new();
    for (ip, domain) in ip_domain {
        if let Some(groups) = domain_groups.get(domain) {
            let entry = ip_groups.entry(ip.clone()).or_default();
            for group in groups {
                if !entry.contains(group) {
                    entry.push(group.clone());
                }
            }
        }
    }

    (domain_groups, ip_groups)
}

/// Parse one domain per line, rejecting blanks, comments and lines with
/// embedded whitespace.
fn parse_domains(content: &str) -> Vec<Domain> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with('#') && !line.contains(char::is_whitespace)
        })
        .map(Domain::new)
        .collect()
}

fn single_group(domains: Vec<Domain>) -> MapGroupDomains {
    let mut map = MapGroupDomains::new();
    map.insert(Group::from(DEFAULT_DOMAIN_GROUP), domains);
    map
}

fn embedded_group_domains() -> MapGroupDomains {
    single_group(parse_domains(EMBEDDED_DOMAINS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domains_skips_comments_and_whitespace() {
        let content = "\
# comment
youtube.com

 googlevideo.com
bad line with spaces
YOUTU.BE
";
        let domains = parse_domains(content);
        assert_eq!(
            domains,
            vec![
                Domain::from("youtube.com"),
                Domain::from("googlevideo.com"),
                Domain::from("youtu.be"),
            ]
        );
    }

    #[test]
    fn test_embedded_fallback_is_not_empty() {
        let group_domains = embedded_group_domains();
        let domains = &group_domains[&Group::from(DEFAULT_DOMAIN_GROUP)];
        assert!(domains.contains(&Domain::from("youtube.com")));
        assert!(domains.contains(&Domain::from("googlevideo.com")));
    }

    #[test]
    fn test_derive_groups_joins_ips_through_domains() {
        let mut group_domains = MapGroupDomains::new();
        group_domains.insert(
            Group::from("youtube"),
            vec![Domain::from("youtube.com"), Domain::from("googlevideo.com")],
        );
        group_domains.insert(Group::from("video"), vec![Domain::from("youtube.com")]);

        let mut ip_domain = MapIpDomain::new();
        ip_domain.insert(Ip::from("142.250.1.1"), Domain::from("youtube.com"));
        ip_domain.insert(Ip::from("142.250.1.2"), Domain::from("googlevideo.com"));
        ip_domain.insert(Ip::from("8.8.4.4"), Domain::from("unrelated.example"));

        let (domain_groups, ip_groups) = derive_groups(&group_domains, &ip_domain);

        let mut yt_groups = domain_groups[&Domain::from("youtube.com")].clone();
        yt_groups.sort();
        assert_eq!(yt_groups, vec![Group::from("video"), Group::from("youtube")]);

        let mut groups = ip_groups[&Ip::from("142.250.1.1")].clone();
        groups.sort();
        assert_eq!(groups, vec![Group::from("video"), Group::from("youtube")]);
        assert_eq!(ip_groups[&Ip::from("142.250.1.2")], vec![Group::from("youtube")]);
        assert!(!ip_groups.contains_key(&Ip::from("8.8.4.4")));
    }

    #[tokio::test]
    async fn test_local_file_groups_overlay_fetched_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GROUP_DOMAINS_FILE);
        std::fs::write(
            &path,
            "groups:\n  homework:\n    - Khanacademy.org\n",
        )
        .unwrap();

        let watcher = DomainWatcher::new(path);
        // The remote fetch will fail in tests (no network); the embedded
        // list plus the local overlay must both be present.
        let group_domains = watcher.load_group_domains().await;
        assert!(group_domains.contains_key(&Group::from(DEFAULT_DOMAIN_GROUP)));
        assert_eq!(
            group_domains[&Group::from("homework")],
            vec![Domain::from("khanacademy.org")]
        );
    }
}
