use anyhow::Result;
use std::net::Ipv4Addr;
use std::path::Path;

/// Parse a MAC address accepting both colon and hyphen separators.
pub fn parse_mac(mac_str: &str) -> Result<[u8; 6]> {
    let normalized = mac_str.replace('-', ":");
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 6 {
        return Err(anyhow::anyhow!("Invalid MAC address format: {}", mac_str));
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)?;
    }

    Ok(mac)
}

// Canonical on-disk / in-memory form: uppercase, hyphen-separated.
pub fn format_mac_hyphen(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

// dnsmasq and most tools want colons.
pub fn format_mac_colons(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Check that an external command is available on PATH.
pub fn check_cmd_availability(cmd: &str) -> Result<()> {
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            if dir.join(cmd).is_file() {
                return Ok(());
            }
        }
    }
    Err(anyhow::anyhow!("{} command not found on the system", cmd))
}

/// Get MAC address for a specific network interface from sysfs.
pub fn interface_mac_address(interface: &str) -> Result<[u8; 6]> {
    let content = std::fs::read_to_string(format!("/sys/class/net/{}/address", interface))?;
    parse_mac(content.trim())
}

// Preferred LAN interface names for the boards this runs on.
const PREFERRED_IFACES: [&str; 2] = ["eth0", "end0"];

/// Pick the primary LAN interface by preferred name.
pub fn primary_interface_name() -> Result<String> {
    for name in PREFERRED_IFACES {
        if Path::new(&format!("/sys/class/net/{}", name)).exists() {
            return Ok(name.to_string());
        }
    }
    Err(anyhow::anyhow!("no preferred interface found"))
}

/// Parse the first "inet <ip>/<prefix>" line out of `ip addr show` output.
pub fn parse_interface_ipv4(output: &str) -> Option<(Ipv4Addr, u8)> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("inet ") {
            let ip_with_cidr = rest.split_whitespace().next()?;
            let (ip_str, prefix_str) = ip_with_cidr.split_once('/')?;
            if let (Ok(ip), Ok(prefix)) = (ip_str.parse::<Ipv4Addr>(), prefix_str.parse::<u8>()) {
                return Some((ip, prefix));
            }
        }
    }
    None
}
