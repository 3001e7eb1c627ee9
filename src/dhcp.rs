use crate::models::Mac;
use crate::storage;
use crate::utils;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const DHCP_CONFIG_FILE: &str = "dhcp-config.yaml";

const WORKER_INTERVAL: Duration = Duration::from_secs(15);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DNSMASQ_CONF_PATH: &str = "/etc/dnsmasq.conf";
const DEFAULT_LEASE_DURATION: &str = "12h";
const FALLBACK_DNS_IPS: [Ipv4Addr; 2] = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

/// Observed dnsmasq/DHCP supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "router DHCP server can be stopped")]
    ActiveRouterCanBeStopped,
    #[serde(rename = "waiting to stop")]
    WaitingToStop,
    #[serde(rename = "failed to start")]
    FailedCheckConfig,
    #[serde(rename = "inactive")]
    Inactive,
}

impl Default for ServiceState {
    fn default() -> Self {
        ServiceState::Inactive
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServiceState::Active => "active",
            ServiceState::ActiveRouterCanBeStopped => "router DHCP server can be stopped",
            ServiceState::WaitingToStop => "waiting to stop",
            ServiceState::FailedCheckConfig => "failed to start",
            ServiceState::Inactive => "inactive",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub mac_addr: Mac,
    pub ip_addr: Ipv4Addr,
    #[serde(default)]
    pub name: String,
}

/// Desired DHCP state plus the observed service state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsMasqConfig {
    pub default_gateway: Option<Ipv4Addr>,
    pub this_gateway: Option<Ipv4Addr>,
    pub lower_bound: Option<Ipv4Addr>,
    pub upper_bound: Option<Ipv4Addr>,
    #[serde(rename = "dnsIPs")]
    pub dns_ips: Vec<Ipv4Addr>,
    pub address_reservations: Vec<Reservation>,
    /// Want state.
    pub service_enabled: bool,
    /// Current state.
    pub service_state: ServiceState,

    // needs_action keeps the worker reconciling until the service made it
    // all the way up or down; needs_restart arms a single dnsmasq restart.
    #[serde(skip)]
    needs_action: bool,
    #[serde(skip)]
    needs_restart: bool,
}

impl DnsMasqConfig {
    fn new() -> Self {
        DnsMasqConfig {
            needs_action: true,
            needs_restart: true,
            ..Default::default()
        }
    }
}

/// Host-side operations the supervisor drives. A trait seam so tests run
/// the full state machine against a fake.
pub trait DhcpServiceOps: Send + Sync {
    fn is_service_active(&self) -> Result<bool>;
    fn service_action(&self, action: &str) -> Result<()>;
    /// Broadcast a DISCOVER and classify each OFFER: (local, elsewhere).
    fn probe_dhcp_servers(&self, hw_addr: &[u8; 6]) -> Result<(bool, bool)>;
    fn set_static_ip(&self, iface: &str, cfg: &DnsMasqConfig) -> Result<()>;
    fn unset_static_ip(&self, iface: &str) -> Result<()>;
    fn write_dnsmasq_config(&self, content: &str) -> Result<()>;
    fn default_gateway(&self) -> Result<Ipv4Addr>;
    fn interface_network(&self, iface: &str) -> Result<(Ipv4Addr, u8)>;
}

pub struct CmdOutput {
    pub success: bool,
    pub output: String,
}

pub type CmdRunner = fn(&str, &[&str]) -> Result<CmdOutput>;

pub fn run_command(cmd: &str, args: &[&str]) -> Result<CmdOutput> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", cmd))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(CmdOutput {
        success: output.status.success(),
        output: combined,
    })
}

/// Real implementation backed by systemctl, nmcli, netstat and a raw DHCP
/// client socket.
pub struct SystemDhcpService {
    runner: CmdRunner,
}

impl SystemDhcpService {
    pub fn new() -> Self {
        SystemDhcpService { runner: run_command }
    }

    fn local_ipv4_addresses(&self) -> Vec<Ipv4Addr> {
        let output = match (self.runner)("ip", &["-4", "addr", "show"]) {
            Ok(out) => out.output,
            Err(_) => return Vec::new(),
        };
        let mut addrs = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("inet ") {
                if let Some(ip_with_cidr) = rest.split_whitespace().next() {
                    if let Some((ip_str, _)) = ip_with_cidr.split_once('/') {
                        if let Ok(ip) = ip_str.parse::<Ipv4Addr>() {
                            if !ip.is_loopback() {
                                addrs.push(ip);
                            }
                        }
                    }
                }
            }
        }
        addrs
    }
}

impl DhcpServiceOps for SystemDhcpService {
    fn is_service_active(&self) -> Result<bool> {
        // is-active exits non-zero for "inactive", so check the output first.
        let out = (self.runner)("systemctl", &["is-active", "dnsmasq"])?;
        match out.output.trim() {
            "active" => Ok(true),
            "inactive" => Ok(false),
            other if !out.success => Err(anyhow::anyhow!(
                "error checking dnsmasq service state: {}",
                other
            )),
            _ => Ok(false),
        }
    }

    fn service_action(&self, action: &str) -> Result<()> {
        let out = (self.runner)("systemctl", &[action, "dnsmasq"])?;
        if !out.success {
            return Err(anyhow::anyhow!("systemctl {} dnsmasq failed: {}", action, out.output.trim()));
        }
        Ok(())
    }

    fn probe_dhcp_servers(&self, hw_addr: &[u8; 6]) -> Result<(bool, bool)> {
        use dhcproto::v4;
        use dhcproto::{Decodable, Decoder, Encodable};

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create DHCP probe socket")?;
        // dnsmasq itself may hold port 68 open on this host.
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(PROBE_TIMEOUT))?;
        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, 68).into();
        socket
            .bind(&bind_addr.into())
            .context("failed to bind to UDP port 68")?;
        let socket: std::net::UdpSocket = socket.into();

        let mut msg = v4::Message::default();
        msg.set_opcode(v4::Opcode::BootRequest);
        msg.set_xid(rand::random());
        msg.set_flags(v4::Flags::default().set_broadcast());
        msg.set_chaddr(hw_addr);
        msg.opts_mut()
            .insert(v4::DhcpOption::MessageType(v4::MessageType::Discover));
        let request = msg
            .to_vec()
            .map_err(|e| anyhow::anyhow!("failed to encode DHCPDISCOVER: {}", e))?;

        socket
            .send_to(&request, (Ipv4Addr::BROADCAST, 67))
            .context("failed to send DHCPDISCOVER")?;

        let local_ips = self.local_ipv4_addresses();
        let mut local_detected = false;
        let mut router_detected = false;
        let mut buf = [0u8; 1500];

        loop {
            match socket.recv_from(&mut buf) {
                Ok((n, addr)) => {
                    let resp = match v4::Message::decode(&mut Decoder::new(&buf[..n])) {
                        Ok(resp) => resp,
                        Err(e) => {
                            warn!("Failed to parse DHCP response: {}", e);
                            continue;
                        }
                    };
                    let is_offer = matches!(
                        resp.opts().get(v4::OptionCode::MessageType),
                        Some(v4::DhcpOption::MessageType(v4::MessageType::Offer))
                    );
                    if !is_offer {
                        debug!("Ignoring non-OFFER DHCP message from {}", addr);
                        continue;
                    }
                    info!("Received DHCPOFFER from DHCP server at {}", addr);
                    match addr.ip() {
                        IpAddr::V4(ip) if local_ips.contains(&ip) => local_detected = true,
                        _ => router_detected = true,
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => return Err(e).context("error reading from DHCP probe socket"),
            }
        }

        Ok((local_detected, router_detected))
    }

    fn set_static_ip(&self, iface: &str, cfg: &DnsMasqConfig) -> Result<()> {
        let (lower, upper) = (
            cfg.lower_bound.context("missing lower bound")?,
            cfg.upper_bound.context("missing upper bound")?,
        );
        let gateway = cfg.default_gateway.context("missing default gateway")?;
        let this_gateway = cfg.this_gateway.context("missing this gateway")?;
        let (_, cidr) = find_smallest_cidr(lower, upper);

        let dns: Vec<String> = cfg.dns_ips.iter().map(|ip| ip.to_string()).collect();
        let addr = format!("{}/{}", this_gateway, cidr);
        let gateway = gateway.to_string();
        let dns = dns.join(" ");
        let args = [
            "dev",
            "mod",
            iface,
            "ipv4.method",
            "manual",
            "ipv4.gateway",
            &gateway,
            "ipv4.addr",
            &addr,
            "ipv4.dns",
            &dns,
            "ipv6.method",
            "disabled",
        ];
        info!("Configuring device: nmcli {}", args.join(" "));
        let out = (self.runner)("nmcli", &args)?;
        if !out.success {
            return Err(anyhow::anyhow!("error setting static IP: {}", out.output.trim()));
        }
        Ok(())
    }

    fn unset_static_ip(&self, iface: &str) -> Result<()> {
        let args = [
            "dev", "mod", iface, "ipv4.method", "auto", "ipv4.gateway", "", "ipv4.addr", "",
            "ipv4.dns", "",
        ];
        info!("Configuring device: nmcli {}", args.join(" "));
        let out = (self.runner)("nmcli", &args)?;
        if !out.success {
            return Err(anyhow::anyhow!("error unsetting static IP: {}", out.output.trim()));
        }

        let out = (self.runner)("nmcli", &["dev", "up", iface])?;
        if !out.success {
            return Err(anyhow::anyhow!("error upping device: {}", out.output.trim()));
        }
        Ok(())
    }

    fn write_dnsmasq_config(&self, content: &str) -> Result<()> {
        storage::safe_write_via_temp(Path::new(DNSMASQ_CONF_PATH), content)
    }

    fn default_gateway(&self) -> Result<Ipv4Addr> {
        let out = (self.runner)("netstat", &["-rn"])?;
        parse_default_gateway(&out.output)
    }

    fn interface_network(&self, iface: &str) -> Result<(Ipv4Addr, u8)> {
        let out = (self.runner)("ip", &["addr", "show", iface])?;
        utils::parse_interface_ipv4(&out.output)
            .with_context(|| format!("no IPv4 address found on interface {}", iface))
    }
}

/// Supervises the local dnsmasq service: reconciles the desired state from
/// dhcp-config.yaml against what the LAN actually has on a 15s tick and on
/// explicit restart signals.
pub struct DhcpServer {
    ops: Arc<dyn DhcpServiceOps>,
    cfg: Mutex<DnsMasqConfig>,
    config_path: PathBuf,
    iface_name: String,
    hw_addr: [u8; 6],
    disabled_for_debug: bool,
    restart_tx: mpsc::Sender<()>,
    restart_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DhcpServer {
    pub fn new(
        config_path: PathBuf,
        disabled_for_debug: bool,
        ops: Arc<dyn DhcpServiceOps>,
        iface_name: String,
        hw_addr: [u8; 6],
    ) -> Result<Self> {
        let mut cfg: DnsMasqConfig = storage::load_yaml(&config_path, DnsMasqConfig::new)?;
        cfg.needs_action = true;
        cfg.needs_restart = true;

        // Backfill anything the file leaves unset from the live network.
        if cfg.default_gateway.is_none() {
            cfg.default_gateway = Some(
                ops.default_gateway()
                    .context("failed to get default gateway")?,
            );
        }
        if cfg.lower_bound.is_none() || cfg.upper_bound.is_none() || cfg.this_gateway.is_none() {
            let (ip, prefix) = ops
                .interface_network(&iface_name)
                .with_context(|| format!("failed to get subnet range for interface {}", iface_name))?;
            let (lower, upper) = subnet_bounds(ip, prefix)?;
            let gateway = cfg.default_gateway.context("missing default gateway")?;
            let (lower, upper, this_gateway) = adjust_subnet_range(lower, upper, gateway)?;
            cfg.lower_bound = Some(lower);
            cfg.upper_bound = Some(upper);
            cfg.this_gateway = Some(this_gateway);
        }
        if cfg.dns_ips.is_empty() {
            cfg.dns_ips = FALLBACK_DNS_IPS.to_vec();
        }

        let (restart_tx, restart_rx) = mpsc::channel(2);
        Ok(DhcpServer {
            ops,
            cfg: Mutex::new(cfg),
            config_path,
            iface_name,
            hw_addr,
            disabled_for_debug,
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
        })
    }

    /// Start the reconcile worker, with one immediate pass.
    pub fn start(self: Arc<Self>, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let mut restart_rx = match self.restart_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                error!("DHCP supervisor worker already started");
                return tokio::spawn(async {});
            }
        };

        tokio::spawn(async move {
            let server = self.clone();
            let _ = tokio::task::spawn_blocking(move || server.reconcile()).await;

            let mut ticker = tokio::time::interval(WORKER_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = restart_rx.recv() => {}
                    _ = shutdown.notified() => {
                        info!("DHCP supervisor received shutdown signal, stopping...");
                        break;
                    }
                }
                let server = self.clone();
                let _ = tokio::task::spawn_blocking(move || server.reconcile()).await;
            }
        })
    }

    pub fn state(&self) -> ServiceState {
        self.cfg.lock().unwrap().service_state
    }

    pub fn config(&self) -> DnsMasqConfig {
        self.cfg.lock().unwrap().clone()
    }

    /// Validate and persist a new configuration, then poke the worker.
    pub fn set_config(&self, mut new_cfg: DnsMasqConfig) -> Result<()> {
        validate_config(&mut new_cfg)?;
        storage::save_yaml(&self.config_path, &new_cfg)?;

        new_cfg.needs_action = true;
        new_cfg.needs_restart = true;
        {
            let mut cfg = self.cfg.lock().unwrap();
            new_cfg.service_state = cfg.service_state;
            *cfg = new_cfg;
        }
        self.restart();
        Ok(())
    }

    pub fn restart(&self) {
        let _ = self.restart_tx.try_send(());
    }

    /// Stop dnsmasq and put the interface back into DHCP-client mode so this
    /// host can still get an address from the peer server.
    pub fn stop(&self) -> Result<()> {
        self.ops
            .unset_static_ip(&self.iface_name)
            .context("failed to unset static IP during dnsmasq stop")?;
        self.ops
            .service_action("stop")
            .context("failed to stop dnsmasq")?;
        info!("Stopped dnsmasq service");
        Ok(())
    }

    fn reconcile(&self) {
        let mut cfg = self.cfg.lock().unwrap();
        let state = self.evaluate(&mut cfg);
        if state == ServiceState::Active || state == ServiceState::Inactive {
            cfg.needs_action = false;
        }
        cfg.service_state = state;
    }

    fn evaluate(&self, cfg: &mut DnsMasqConfig) -> ServiceState {
        if !cfg.needs_action {
            return cfg.service_state;
        }

        if self.disabled_for_debug {
            info!("DHCP service is disabled for debug; supervisor idle");
            return ServiceState::Inactive;
        }

        let want_enabled = cfg.service_enabled;
        let (running_local, running_router) = match self.ops.probe_dhcp_servers(&self.hw_addr) {
            Ok(result) => result,
            Err(e) => {
                error!("Error checking if DHCP server is running: {:#}", e);
                return self.force_start_or_fail(cfg, want_enabled);
            }
        };

        if !want_enabled {
            if running_local && running_router {
                // The peer covers the LAN, safe to step aside.
                match self.stop() {
                    Ok(()) => ServiceState::Inactive,
                    Err(e) => {
                        error!("Failed to stop dnsmasq: {:#}", e);
                        ServiceState::FailedCheckConfig
                    }
                }
            } else if running_local {
                info!("Waiting to stop dnsmasq (router DHCP server is not running)");
                ServiceState::WaitingToStop
            } else {
                ServiceState::Inactive
            }
        } else {
            // Prefer two DHCP servers on the LAN over none at all; the user
            // is advised via state when the router one is still up.
            if cfg.needs_restart {
                info!("Attempting to (re)start dnsmasq");
                if let Err(e) = self.start_dnsmasq(cfg) {
                    error!("Failed to start dnsmasq: {:#}", e);
                    return self.force_start_or_fail(cfg, want_enabled);
                }
                cfg.needs_restart = false;
            }

            if running_router {
                info!("Started dnsmasq (router DHCP server is still running)");
                ServiceState::ActiveRouterCanBeStopped
            } else {
                info!("Started dnsmasq (router DHCP server is disabled OK)");
                ServiceState::Active
            }
        }
    }

    /// Last resort after a failed check or start: try to start dnsmasq
    /// anyway when it is wanted, otherwise surface the failure state.
    fn force_start_or_fail(&self, cfg: &mut DnsMasqConfig, want_enabled: bool) -> ServiceState {
        if want_enabled {
            match self.ops.is_service_active() {
                Ok(true) => info!("Restarting dnsmasq"),
                _ => error!("Attempting to force start dnsmasq"),
            }
            if self.start_dnsmasq(cfg).is_ok() {
                cfg.needs_restart = false;
                return ServiceState::Active;
            }
        }
        ServiceState::FailedCheckConfig
    }

    fn start_dnsmasq(&self, cfg: &DnsMasqConfig) -> Result<()> {
        let result = self.try_start_dnsmasq(cfg);
        if result.is_err() {
            // Leave the interface usable even when the start failed.
            if let Err(unset_err) = self.ops.unset_static_ip(&self.iface_name) {
                warn!(
                    "Also failed to unset static IP on interface {}: {:#}",
                    self.iface_name, unset_err
                );
            }
        }
        result
    }

    fn try_start_dnsmasq(&self, cfg: &DnsMasqConfig) -> Result<()> {
        self.ops.set_static_ip(&self.iface_name, cfg)?;

        let content =
            generate_dnsmasq_config(&self.iface_name, cfg, &Mac::from_bytes(&self.hw_addr))?;
        self.ops
            .write_dnsmasq_config(&content)
            .context("error writing dnsmasq config")?;
        self.ops
            .service_action("restart")
            .context("error restarting dnsmasq")?;

        if !self.ops.is_service_active()? {
            return Err(anyhow::anyhow!("dnsmasq should have started"));
        }
        info!("Dnsmasq service started successfully");
        Ok(())
    }
}

fn validate_config(cfg: &mut DnsMasqConfig) -> Result<()> {
    let lower = cfg.lower_bound.context("invalid or missing lowerBound")?;
    let upper = cfg.upper_bound.context("invalid or missing upperBound")?;
    cfg.default_gateway.context("invalid or missing defaultGateway")?;
    cfg.this_gateway.context("invalid or missing thisGateway")?;

    if cfg.dns_ips.is_empty() {
        cfg.dns_ips = FALLBACK_DNS_IPS.to_vec();
    }
    if u32::from(lower) >= u32::from(upper) {
        return Err(anyhow::anyhow!("lowerBound must be less than upperBound"));
    }
    Ok(())
}

/// Default gateway from `netstat -rn` output: the 0.0.0.0 route on Linux,
/// the "default" route elsewhere.
fn parse_default_gateway(output: &str) -> Result<Ipv4Addr> {
    for line in output.lines() {
        if line.starts_with("Destination") || line.starts_with("Kernel") || line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        if fields[0] == "0.0.0.0" || fields[0] == "default" {
            return fields[1]
                .parse()
                .with_context(|| format!("failed to parse gateway IP: {}", fields[1]));
        }
    }
    Err(anyhow::anyhow!("default gateway not found"))
}

/// First and last usable host addresses of the interface's subnet.
fn subnet_bounds(ip: Ipv4Addr, prefix: u8) -> Result<(Ipv4Addr, Ipv4Addr)> {
    if prefix > 30 {
        return Err(anyhow::anyhow!("invalid subnet range, no usable addresses"));
    }
    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(ip) & mask;
    let broadcast = network | !mask;
    Ok(((network + 1).into(), (broadcast - 1).into()))
}

/// Shrink [lower, upper] so it excludes the default gateway, and pick this
/// device's gateway IP from the top of the surviving segment.
fn adjust_subnet_range(
    lower: Ipv4Addr,
    upper: Ipv4Addr,
    gateway: Ipv4Addr,
) -> Result<(Ipv4Addr, Ipv4Addr, Ipv4Addr)> {
    let lw = u32::from(lower);
    let up = u32::from(upper);
    let gw = u32::from(gateway);

    if lw >= up {
        return Err(anyhow::anyhow!("invalid range: lower IP must be less than upper IP"));
    }

    if gw < lw || gw > up {
        return Ok((lower, upper, upper));
    }

    let (new_lower, new_upper) = if gw == lw {
        (lw + 1, up)
    } else if gw == up {
        (lw, up - 1)
    } else {
        // Keep the larger segment around the gateway.
        let lower_size = gw - lw;
        let upper_size = up - gw;
        if upper_size >= lower_size {
            (gw + 1, up)
        } else {
            (lw, gw - 1)
        }
    };

    if new_lower > new_upper {
        return Err(anyhow::anyhow!(
            "no usable addresses available after excluding the gateway"
        ));
    }
    Ok((new_lower.into(), new_upper.into(), new_upper.into()))
}

/// Smallest CIDR block that fully covers [start, end]. Returns the masked
/// "<ip>/<len>" form and the prefix length alone.
fn find_smallest_cidr(start: Ipv4Addr, end: Ipv4Addr) -> (String, String) {
    let start_u = u32::from(start);
    let end_u = u32::from(end);

    for prefix in (0..=32u32).rev() {
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let masked = start_u & mask;
        let block_end = masked | !mask;
        if masked <= start_u && block_end >= end_u {
            let masked_ip = Ipv4Addr::from(masked);
            return (format!("{}/{}", masked_ip, prefix), prefix.to_string());
        }
    }

    (String::new(), String::new())
}

/// Render the full dnsmasq configuration.
fn generate_dnsmasq_config(
    iface_name: &str,
    cfg: &DnsMasqConfig,
    this_gateway_mac: &Mac,
) -> Result<String> {
    if cfg.dns_ips.len() != 2 {
        return Err(anyhow::anyhow!("expected two DNS IPs: {:?}", cfg.dns_ips));
    }
    let this_gateway = cfg.this_gateway.context("missing thisGateway")?;
    let lower = cfg.lower_bound.context("missing lowerBound")?;
    let upper = cfg.upper_bound.context("missing upperBound")?;

    let dns: Vec<String> = cfg.dns_ips.iter().map(|ip| ip.to_string()).collect();

    let mut lines = vec![
        "# dnsmasq configuration generated programmatically".to_string(),
        format!("interface={}", iface_name),
        format!("dhcp-range={},{},{}", lower, upper, DEFAULT_LEASE_DURATION),
        format!("dhcp-option=option:router,{}", this_gateway),
        format!("dhcp-option=option:dns-server,{}", dns.join(",")),
        // no-resolv makes the server entries below the only upstreams.
        "no-resolv".to_string(),
        format!("server={}", dns[0]),
        format!("server={}", dns[1]),
        String::new(),
        "# static IP reservations".to_string(),
        format!(
            "dhcp-host={},{} # {}",
            this_gateway_mac.with_colons(),
            this_gateway,
            "this gateway"
        ),
    ];
    for reservation in &cfg.address_reservations {
        lines.push(format!(
            "dhcp-host={},{} # {}",
            reservation.mac_addr.with_colons(),
            reservation.ip_addr,
            reservation.name
        ));
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeOps {
        calls: StdMutex<Vec<String>>,
        local_dhcp: AtomicBool,
        router_dhcp: AtomicBool,
        fail_start: AtomicBool,
        service_active: AtomicBool,
    }

    impl FakeOps {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn reset_calls(&self) {
            self.calls.lock().unwrap().clear();
        }
    }

    impl DhcpServiceOps for FakeOps {
        fn is_service_active(&self) -> Result<bool> {
            self.record("is_service_active");
            Ok(self.service_active.load(Ordering::Relaxed))
        }

        fn service_action(&self, action: &str) -> Result<()> {
            self.record(&format!("service_action:{}", action));
            Ok(())
        }

        fn probe_dhcp_servers(&self, _hw_addr: &[u8; 6]) -> Result<(bool, bool)> {
            self.record("probe");
            Ok((
                self.local_dhcp.load(Ordering::Relaxed),
                self.router_dhcp.load(Ordering::Relaxed),
            ))
        }

        fn set_static_ip(&self, _iface: &str, _cfg: &DnsMasqConfig) -> Result<()> {
            self.record("set_static_ip");
            Ok(())
        }

        fn unset_static_ip(&self, _iface: &str) -> Result<()> {
            self.record("unset_static_ip");
            Ok(())
        }

        fn write_dnsmasq_config(&self, _content: &str) -> Result<()> {
            self.record("write_dnsmasq_config");
            if self.fail_start.load(Ordering::Relaxed) {
                return Err(anyhow::anyhow!("disk full"));
            }
            // A successful write+restart leaves the service active.
            self.service_active.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn default_gateway(&self) -> Result<Ipv4Addr> {
            Ok(Ipv4Addr::new(192, 168, 1, 254))
        }

        fn interface_network(&self, _iface: &str) -> Result<(Ipv4Addr, u8)> {
            Ok((Ipv4Addr::new(192, 168, 1, 230), 24))
        }
    }

    fn server(ops: Arc<FakeOps>, enabled: bool, dir: &tempfile::TempDir) -> DhcpServer {
        let server = DhcpServer::new(
            dir.path().join(DHCP_CONFIG_FILE),
            false,
            ops,
            "eth0".to_string(),
            [0xdc, 0xa6, 0x32, 0x68, 0x47, 0xea],
        )
        .unwrap();
        server.cfg.lock().unwrap().service_enabled = enabled;
        server
    }

    #[test]
    fn test_config_backfilled_from_network() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(Arc::new(FakeOps::default()), true, &dir);
        let cfg = server.config();
        assert_eq!(cfg.default_gateway, Some(Ipv4Addr::new(192, 168, 1, 254)));
        // Gateway at the top of the subnet: pool keeps the larger lower
        // segment and this device takes its top address.
        assert_eq!(cfg.lower_bound, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(cfg.upper_bound, Some(Ipv4Addr::new(192, 168, 1, 253)));
        assert_eq!(cfg.this_gateway, Some(Ipv4Addr::new(192, 168, 1, 253)));
        assert_eq!(cfg.dns_ips, FALLBACK_DNS_IPS.to_vec());
    }

    #[test]
    fn test_enabled_with_peer_reaches_router_can_be_stopped_then_active() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(FakeOps::default());
        ops.router_dhcp.store(true, Ordering::Relaxed);
        let server = server(ops.clone(), true, &dir);

        server.reconcile();
        assert_eq!(server.state(), ServiceState::ActiveRouterCanBeStopped);
        assert!(ops.calls().contains(&"set_static_ip".to_string()));

        // Peer disappears: next tick reaches Active without another restart.
        ops.reset_calls();
        ops.router_dhcp.store(false, Ordering::Relaxed);
        server.reconcile();
        assert_eq!(server.state(), ServiceState::Active);
        assert!(!ops.calls().contains(&"set_static_ip".to_string()));
        assert!(!ops.calls().contains(&"service_action:restart".to_string()));
    }

    #[test]
    fn test_disabled_with_local_and_peer_stops_locally() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(FakeOps::default());
        ops.local_dhcp.store(true, Ordering::Relaxed);
        ops.router_dhcp.store(true, Ordering::Relaxed);
        let server = server(ops.clone(), false, &dir);

        server.reconcile();
        assert_eq!(server.state(), ServiceState::Inactive);
        let calls = ops.calls();
        assert!(calls.contains(&"unset_static_ip".to_string()));
        assert!(calls.contains(&"service_action:stop".to_string()));
    }

    #[test]
    fn test_disabled_without_peer_waits_to_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(FakeOps::default());
        ops.local_dhcp.store(true, Ordering::Relaxed);
        let server = server(ops.clone(), false, &dir);

        server.reconcile();
        assert_eq!(server.state(), ServiceState::WaitingToStop);
        // Local dnsmasq is kept up while the LAN has no other server.
        assert!(!ops.calls().contains(&"service_action:stop".to_string()));

        // Still needs action: the worker keeps re-evaluating.
        server.reconcile();
        assert_eq!(server.state(), ServiceState::WaitingToStop);
    }

    #[test]
    fn test_disabled_and_not_running_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(FakeOps::default());
        let server = server(ops.clone(), false, &dir);

        server.reconcile();
        assert_eq!(server.state(), ServiceState::Inactive);

        // Reached a terminal state: subsequent ticks do not probe again.
        ops.reset_calls();
        server.reconcile();
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn test_start_failure_rolls_back_static_ip() {
        let dir = tempfile::tempdir().unwrap();
        let ops = Arc::new(FakeOps::default());
        ops.fail_start.store(true, Ordering::Relaxed);
        let server = server(ops.clone(), true, &dir);

        server.reconcile();
        assert_eq!(server.state(), ServiceState::FailedCheckConfig);
        let calls = ops.calls();
        assert!(calls.contains(&"unset_static_ip".to_string()));

        // Failure keeps needs_action set, so the next tick retries.
        ops.reset_calls();
        server.reconcile();
        assert!(ops.calls().contains(&"probe".to_string()));
    }

    #[test]
    fn test_set_config_validates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(Arc::new(FakeOps::default()), true, &dir);

        let mut bad = server.config();
        bad.lower_bound = Some(Ipv4Addr::new(192, 168, 1, 200));
        bad.upper_bound = Some(Ipv4Addr::new(192, 168, 1, 100));
        assert!(server.set_config(bad).is_err());

        let mut good = server.config();
        good.dns_ips = Vec::new();
        good.address_reservations = vec![Reservation {
            mac_addr: Mac::new("aa:bb:cc:dd:ee:01").unwrap(),
            ip_addr: Ipv4Addr::new(192, 168, 1, 52),
            name: "printer".to_string(),
        }];
        server.set_config(good).unwrap();

        let reloaded: DnsMasqConfig =
            storage::load_yaml(&dir.path().join(DHCP_CONFIG_FILE), DnsMasqConfig::new).unwrap();
        assert_eq!(reloaded.dns_ips, FALLBACK_DNS_IPS.to_vec());
        assert_eq!(reloaded.address_reservations.len(), 1);
        assert_eq!(
            reloaded.address_reservations[0].mac_addr.as_str(),
            "AA-BB-CC-DD-EE-01"
        );
    }

    #[test]
    fn test_parse_default_gateway_linux() {
        let output = "\
Kernel IP routing table
Destination     Gateway         Genmask         Flags   MSS Window  irtt Iface
0.0.0.0         192.168.1.254   0.0.0.0         UG        0 0          0 eth0
192.168.1.0     0.0.0.0         255.255.255.0   U         0 0          0 eth0
";
        assert_eq!(
            parse_default_gateway(output).unwrap(),
            Ipv4Addr::new(192, 168, 1, 254)
        );
    }

    #[test]
    fn test_parse_default_gateway_missing() {
        assert!(parse_default_gateway("Kernel IP routing table\n").is_err());
    }

    #[test]
    fn test_subnet_bounds() {
        let (lower, upper) = subnet_bounds(Ipv4Addr::new(192, 168, 1, 230), 24).unwrap();
        assert_eq!(lower, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(upper, Ipv4Addr::new(192, 168, 1, 254));
        assert!(subnet_bounds(Ipv4Addr::new(10, 0, 0, 1), 31).is_err());
    }

    #[test]
    fn test_adjust_subnet_range_gateway_outside() {
        let (lower, upper, this) = adjust_subnet_range(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 254),
            Ipv4Addr::new(10, 0, 0, 1),
        )
        .unwrap();
        assert_eq!(lower, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(upper, Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(this, Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_adjust_subnet_range_gateway_in_middle_keeps_larger_segment() {
        let (lower, upper, this) = adjust_subnet_range(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 254),
            Ipv4Addr::new(192, 168, 1, 10),
        )
        .unwrap();
        assert_eq!(lower, Ipv4Addr::new(192, 168, 1, 11));
        assert_eq!(upper, Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(this, Ipv4Addr::new(192, 168, 1, 254));
    }

    #[test]
    fn test_find_smallest_cidr() {
        let (block, prefix) = find_smallest_cidr(
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 254),
        );
        assert_eq!(block, "192.168.1.0/24");
        assert_eq!(prefix, "24");

        let (block, prefix) =
            find_smallest_cidr(Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(block, "10.0.0.4/30");
        assert_eq!(prefix, "30");
    }

    #[test]
    fn test_generate_dnsmasq_config() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(Arc::new(FakeOps::default()), true, &dir);
        let mut cfg = server.config();
        cfg.address_reservations = vec![Reservation {
            mac_addr: Mac::new("2c:cf:67:b6:37:7e").unwrap(),
            ip_addr: Ipv4Addr::new(192, 168, 1, 54),
            name: "console".to_string(),
        }];

        let content =
            generate_dnsmasq_config("eth0", &cfg, &Mac::new("dc:a6:32:68:47:ea").unwrap()).unwrap();
        assert!(content.contains("interface=eth0"));
        assert!(content.contains("dhcp-range=192.168.1.1,192.168.1.253,12h"));
        assert!(content.contains("dhcp-option=option:router,192.168.1.253"));
        assert!(content.contains("dhcp-option=option:dns-server,1.1.1.1,8.8.8.8"));
        assert!(content.contains("no-resolv"));
        assert!(content.contains("server=1.1.1.1"));
        assert!(content.contains("dhcp-host=dc:a6:32:68:47:ea,192.168.1.253 # this gateway"));
        assert!(content.contains("dhcp-host=2c:cf:67:b6:37:7e,192.168.1.54 # console"));
    }

    #[test]
    fn test_generate_dnsmasq_config_requires_two_dns_ips() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(Arc::new(FakeOps::default()), true, &dir);
        let mut cfg = server.config();
        cfg.dns_ips = vec![Ipv4Addr::new(1, 1, 1, 1)];
        assert!(
            generate_dnsmasq_config("eth0", &cfg, &Mac::new("dc:a6:32:68:47:ea").unwrap()).is_err()
        );
    }

    #[test]
    fn test_service_state_yaml_round_trip() {
        let yaml = serde_yaml::to_string(&ServiceState::ActiveRouterCanBeStopped).unwrap();
        assert!(yaml.contains("router DHCP server can be stopped"));
        let back: ServiceState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, ServiceState::ActiveRouterCanBeStopped);
    }
}
