use crate::models::{Group, Mac, NamedMac};
use crate::storage;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub const GROUP_MACS_FILE: &str = "group-macs.yaml";

/// On-disk shape of group-macs.yaml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMacsConfig {
    #[serde(default)]
    pub groups: HashMap<Group, Vec<NamedMac>>,
    #[serde(default, rename = "unusedMACs")]
    pub unused_macs: Vec<NamedMac>,
}

/// Flattened group/MAC/name row exchanged with the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatGroupMac {
    pub group: String,
    pub mac: Mac,
    #[serde(default)]
    pub name: String,
}

pub fn load(path: &Path) -> Result<GroupMacsConfig> {
    storage::load_yaml(path, GroupMacsConfig::default)
}

/// Save the flattened rows back to the YAML structure. Rows without a group
/// are remembered under unusedMACs so their names survive.
pub fn save(path: &Path, flat: &[FlatGroupMac]) -> Result<()> {
    let mut groups: HashMap<Group, Vec<NamedMac>> = HashMap::new();
    let mut unused_macs = Vec::new();

    for row in flat {
        let named = NamedMac {
            mac: row.mac.clone(),
            name: row.name.clone(),
        };
        if !row.group.is_empty() {
            groups.entry(Group::new(&row.group)).or_default().push(named);
        } else {
            unused_macs.push(named);
        }
    }

    let config = GroupMacsConfig { groups, unused_macs };
    storage::save_yaml(path, &config)
}

/// All configured group-MAC assignments plus every MAC currently visible in
/// the ARP table, deduplicated. Unconfigured MACs come back with an empty
/// group and name so the admin surface can offer them for assignment.
pub fn all_with_discovered(path: &Path, arp_output: &str) -> Result<Vec<FlatGroupMac>> {
    let config = load(path)?;

    let mut rows = Vec::new();
    let mut seen: HashSet<Mac> = HashSet::new();

    for (group, named_macs) in &config.groups {
        for named in named_macs {
            rows.push(FlatGroupMac {
                group: group.0.clone(),
                mac: named.mac.clone(),
                name: named.name.clone(),
            });
            seen.insert(named.mac.clone());
        }
    }

    for named in &config.unused_macs {
        if seen.insert(named.mac.clone()) {
            rows.push(FlatGroupMac {
                group: String::new(),
                mac: named.mac.clone(),
                name: named.name.clone(),
            });
        }
    }

    let mac_regex = Regex::new(r"(?i)([0-9A-F]{2}[:-]){5}[0-9A-F]{2}").unwrap();
    for line in arp_output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let raw = fields[3];
        if !mac_regex.is_match(raw) {
            continue;
        }
        let mac = match Mac::new(raw) {
            Ok(mac) => mac,
            Err(_) => continue,
        };
        // MACs may appear on multiple network adapters.
        if seen.insert(mac.clone()) {
            rows.push(FlatGroupMac {
                group: String::new(),
                mac,
                name: String::new(),
            });
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(group: &str, mac: &str, name: &str) -> FlatGroupMac {
        FlatGroupMac {
            group: group.to_string(),
            mac: Mac::new(mac).unwrap(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GROUP_MACS_FILE);

        let rows = vec![
            flat("kids", "aa:bb:cc:dd:ee:01", "tablet"),
            flat("kids", "AA-BB-CC-DD-EE-02", "laptop"),
            flat("", "aa:bb:cc:dd:ee:03", "printer"),
        ];
        save(&path, &rows).unwrap();

        let config = load(&path).unwrap();
        let kids = &config.groups[&Group::from("kids")];
        assert_eq!(kids.len(), 2);
        // MACs are canonicalized to hyphen form regardless of input.
        assert_eq!(kids[0].mac.as_str(), "AA-BB-CC-DD-EE-01");
        assert_eq!(config.unused_macs.len(), 1);
        assert_eq!(config.unused_macs[0].name, "printer");
    }

    #[test]
    fn test_save_sanitizes_group_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GROUP_MACS_FILE);

        save(&path, &[flat("kids/teens", "aa:bb:cc:dd:ee:01", "")]).unwrap();
        let config = load(&path).unwrap();
        assert!(config.groups.contains_key(&Group::from("kidsteens")));
    }

    #[test]
    fn test_load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GROUP_MACS_FILE);
        let config = load(&path).unwrap();
        assert!(config.groups.is_empty());
        assert!(config.unused_macs.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn test_all_with_discovered_merges_arp_macs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GROUP_MACS_FILE);
        save(&path, &[flat("kids", "aa:bb:cc:dd:ee:01", "tablet")]).unwrap();

        let arp_output = "\
? (192.168.1.10) at aa:bb:cc:dd:ee:01 [ether] on eth0
? (192.168.1.11) at aa:bb:cc:dd:ee:04 [ether] on eth0
? (192.168.1.12) at <incomplete> on eth0
";
        let rows = all_with_discovered(&path, arp_output).unwrap();
        assert_eq!(rows.len(), 2);

        let discovered = rows.iter().find(|r| r.group.is_empty()).unwrap();
        assert_eq!(discovered.mac.as_str(), "AA-BB-CC-DD-EE-04");
        assert!(discovered.name.is_empty());
    }
}
