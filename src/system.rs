use crate::command::Opt;
use log::{info, warn};
use std::env;
use std::fs;

// ---- startup diagnostics ----
fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn kernel_version() -> Option<String> {
    if let Ok(out) = std::process::Command::new("uname").args(["-sr"]).output() {
        if let Ok(s) = String::from_utf8(out.stdout) {
            return Some(s.trim().to_string());
        }
    }
    // Fallback to /proc/version (verbose)
    read_first_line("/proc/version")
}

fn hostname() -> Option<String> {
    if let Some(h) = read_first_line("/proc/sys/kernel/hostname") {
        return Some(h);
    }
    read_first_line("/etc/hostname")
}

fn current_user_ids() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

pub fn log_startup_info(opt: &Opt) {
    let app_version = env!("CARGO_PKG_VERSION");
    let (uid, gid) = current_user_ids();
    let cwd = env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()))
        .unwrap_or_default();

    info!("tubetimeout v{} started", app_version);
    info!(
        "Host: {} (uid={}, gid={})",
        hostname().unwrap_or_else(|| "unknown".to_string()),
        uid,
        gid
    );
    info!(
        "Kernel: {}",
        kernel_version().unwrap_or_else(|| "unknown".to_string())
    );
    info!("Arch: {}", std::env::consts::ARCH);
    info!("Working directory: {}", cwd);
    if uid != 0 {
        warn!("Root is required to manage nftables and the netfilter queues");
    }

    info!("Log level: {}", opt.log_level);
    info!("Delay start: {}", opt.delay_start);
    info!("DHCP server disabled: {}", opt.dhcp_server_disabled);
    info!(
        "Filter: drop={:.2} delay={:.2} ({:?} +/- {:?}) drop-udp={} queues={}/{}",
        opt.packet_drop_pct,
        opt.packet_delay_pct,
        opt.packet_delay_ms,
        opt.packet_jitter_ms,
        opt.packet_drop_udp,
        opt.outbound_queue_number,
        opt.inbound_queue_number
    );
    info!(
        "Tracker: granularity={:?} retention={:?} threshold={:?} startDay={} startTime={:?}",
        opt.tracker_granularity,
        opt.tracker_retention,
        opt.tracker_threshold,
        opt.tracker_start_day,
        opt.tracker_start_time
    );
    info!("Monitor purge horizon: {:?}", opt.monitor_purge_duration);
}
