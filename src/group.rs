use crate::models::{
    DestDomainGroupsReceiver, DestIpDomainReceiver, DestIpGroupsReceiver, Domain, Group, Ip,
    MapDomainGroups, MapIpDomain, MapIpGroups, SourceIpGroupsReceiver,
};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Holds the current classification snapshots and answers per-packet
/// (source, destination) lookups. Each snapshot has exactly one writer;
/// readers hold the lock only long enough to consult their copy.
pub struct GroupManager {
    source_ip_groups: RwLock<MapIpGroups>,
    dest_ip_groups: RwLock<MapIpGroups>,
    dest_ip_domains: RwLock<MapIpDomain>,
    dest_domain_groups: RwLock<MapDomainGroups>,
    match_all: Arc<AtomicBool>,
}

impl GroupManager {
    pub fn new(match_all: Arc<AtomicBool>) -> Self {
        GroupManager {
            source_ip_groups: RwLock::new(MapIpGroups::new()),
            dest_ip_groups: RwLock::new(MapIpGroups::new()),
            dest_ip_domains: RwLock::new(MapIpDomain::new()),
            dest_domain_groups: RwLock::new(MapDomainGroups::new()),
            match_all,
        }
    }

    fn src_ip_groups(&self, ip: &Ip) -> Option<Vec<Group>> {
        let data = self.source_ip_groups.read().unwrap();
        data.get(ip).cloned()
    }

    fn dst_ip_groups(&self, ip: &Ip) -> Option<Vec<Group>> {
        let data = self.dest_ip_groups.read().unwrap();
        data.get(ip).cloned()
    }

    pub fn dst_ip_domain(&self, ip: &Ip) -> Option<Domain> {
        let data = self.dest_ip_domains.read().unwrap();
        data.get(ip).cloned()
    }

    /// Classify a (source, destination) IP pair. Returns the source groups
    /// when both ends are known, or synthetic "srcIp/destGroup" labels when
    /// match-all mode is on and only the destination is known.
    pub fn is_src_dest_ip_known(&self, src_ip: &Ip, dst_ip: &Ip) -> Option<Vec<Group>> {
        if self.match_all.load(Ordering::Relaxed) {
            let dst_groups = self.dst_ip_groups(dst_ip)?;
            return Some(
                dst_groups
                    .iter()
                    .map(|dg| synthetic_src_group(src_ip, dg))
                    .collect(),
            );
        }

        let src_groups = self.src_ip_groups(src_ip)?;
        self.dst_ip_groups(dst_ip)?;
        Some(src_groups)
    }
}

/// Synthetic group name for match-all mode. Treated as an opaque key
/// downstream; never parsed on the hot path.
fn synthetic_src_group(src_ip: &Ip, dst_group: &Group) -> Group {
    Group(format!("{}/{}", src_ip, dst_group))
}

impl SourceIpGroupsReceiver for GroupManager {
    fn update_source_ip_groups(&self, new_data: MapIpGroups) {
        let mut data = self.source_ip_groups.write().unwrap();
        debug!("manager updated source IP groups: {:?}", new_data);
        *data = new_data;
    }
}

impl DestIpGroupsReceiver for GroupManager {
    fn update_dest_ip_groups(&self, new_data: MapIpGroups) {
        let mut data = self.dest_ip_groups.write().unwrap();
        debug!("manager updated destination IP groups: {:?}", new_data);
        *data = new_data;
    }
}

impl DestIpDomainReceiver for GroupManager {
    fn update_dest_ip_domains(&self, new_data: MapIpDomain) {
        let mut data = self.dest_ip_domains.write().unwrap();
        *data = new_data;
    }
}

impl DestDomainGroupsReceiver for GroupManager {
    fn update_dest_domain_groups(&self, new_data: MapDomainGroups) {
        let mut data = self.dest_domain_groups.write().unwrap();
        *data = new_data;
    }
}
