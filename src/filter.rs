use crate::group::GroupManager;
use crate::models::{Direction, Ip};
use crate::monitor::TrafficMap;
use crate::usage::UsageTracker;
use anyhow::{Context, Result};
use log::{debug, error, info};
use nfq::{Queue, Verdict};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_QUEUE_LEN: u32 = 4096;
const COPY_RANGE: u16 = 4096;
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub packet_drop_percentage: f32,
    pub packet_delay_percentage: f32,
    pub packet_delay: Duration,
    pub packet_jitter: Duration,
    pub packet_drop_udp: bool,
    pub outbound_queue_number: u16,
    pub inbound_queue_number: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Unknown(u8),
}

impl Protocol {
    fn from_byte(byte: u8) -> Self {
        match byte {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Unknown(other),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Unknown(_) => "proto-unknown",
        }
    }
}

/// Per-packet outcome. Ordered so that when several groups match, the most
/// restrictive decision wins (drop > delay > accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Decision {
    Accept,
    Delay,
    Drop,
}

#[derive(Debug, PartialEq)]
struct PacketInfo {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: Protocol,
    len: usize,
}

/// Source IP sits at bytes 12-15 of the IPv4 header, destination at 16-19,
/// protocol at offset 9.
fn parse_ipv4(payload: &[u8]) -> Result<PacketInfo> {
    if payload.len() < 20 {
        return Err(anyhow::anyhow!("payload too short for IPv4 header"));
    }
    Ok(PacketInfo {
        src: Ipv4Addr::new(payload[12], payload[13], payload[14], payload[15]),
        dst: Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19]),
        proto: Protocol::from_byte(payload[9]),
        len: payload.len(),
    })
}

fn degrade<R: Rng>(settings: &FilterSettings, proto: Protocol, rng: &mut R) -> Decision {
    if proto == Protocol::Udp && settings.packet_drop_udp {
        return Decision::Drop;
    }
    if rng.gen::<f32>() < settings.packet_drop_percentage {
        return Decision::Drop;
    }
    let delay_draw = rng.gen::<f32>();
    if !settings.packet_delay.is_zero() && delay_draw < settings.packet_delay_percentage {
        return Decision::Delay;
    }
    Decision::Accept
}

/// Base delay plus a uniform jitter in [-jitter, +jitter], clamped at zero.
fn delay_with_jitter<R: Rng>(delay: Duration, jitter: Duration, rng: &mut R) -> Duration {
    let offset = (rng.gen::<f64>() * 2.0 - 1.0) * jitter.as_millis() as f64;
    let total = delay.as_millis() as f64 + offset;
    if total <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_millis(total as u64)
    }
}

struct FilterInner {
    settings: FilterSettings,
    tracker: Arc<UsageTracker>,
    manager: Arc<GroupManager>,
    traffic: Arc<TrafficMap>,
    stop: AtomicBool,
    failed_verdicts: AtomicU64,
}

impl FilterInner {
    /// Decide the fate of one queued packet. The classifier contract is that
    /// "src" is always the LAN endpoint, so ingress packets swap ends first.
    fn handle_packet(&self, payload: &[u8], direction: Direction, rng: &mut SmallRng) -> Verdict {
        let info = match parse_ipv4(payload) {
            Ok(info) => info,
            Err(e) => {
                debug!("accepting unparsable packet: {:#}", e);
                return Verdict::Accept;
            }
        };

        let (src, dst) = match direction {
            Direction::Egress => (info.src, info.dst),
            Direction::Ingress => (info.dst, info.src),
        };
        let src_ip = Ip::from_addr(src);
        let dst_ip = Ip::from_addr(dst);

        let groups = match self.manager.is_src_dest_ip_known(&src_ip, &dst_ip) {
            Some(groups) => groups,
            None => {
                debug!(
                    "accept unregistered direction={} proto={} src={} dest={}",
                    direction,
                    info.proto.label(),
                    info.src,
                    info.dst
                );
                return Verdict::Accept;
            }
        };

        let mut decision = Decision::Accept;
        for group in &groups {
            let active = self
                .traffic
                .count_traffic(group, &src_ip, direction, 1, info.len);
            self.tracker.add_sample(group, active);

            let mut group_decision = Decision::Accept;
            if self.tracker.has_exceeded_threshold(group) {
                group_decision = degrade(&self.settings, info.proto, rng);
            }
            debug!(
                "handled packet decision={:?} direction={} proto={} src={} dest={} group={} active={}",
                group_decision,
                direction,
                info.proto.label(),
                info.src,
                info.dst,
                group,
                active
            );
            decision = decision.max(group_decision);
        }

        match decision {
            Decision::Drop => Verdict::Drop,
            Decision::Delay => {
                std::thread::sleep(delay_with_jitter(
                    self.settings.packet_delay,
                    self.settings.packet_jitter,
                    rng,
                ));
                Verdict::Accept
            }
            Decision::Accept => Verdict::Accept,
        }
    }
}

/// Userspace verdict engine: one queue handle and read loop per direction.
pub struct PacketFilter {
    inner: Arc<FilterInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketFilter {
    pub fn new(
        settings: FilterSettings,
        tracker: Arc<UsageTracker>,
        manager: Arc<GroupManager>,
        traffic: Arc<TrafficMap>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&settings.packet_drop_percentage) {
            return Err(anyhow::anyhow!("packet drop percentage must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&settings.packet_delay_percentage) {
            return Err(anyhow::anyhow!("packet delay percentage must be between 0 and 1"));
        }

        Ok(PacketFilter {
            inner: Arc::new(FilterInner {
                settings,
                tracker,
                manager,
                traffic,
                stop: AtomicBool::new(false),
                failed_verdicts: AtomicU64::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Open and bind both queue handles, then start their read loops.
    /// Failure here is fatal: without the queues the kernel rules would
    /// blackhole matching traffic.
    pub fn start(&self) -> Result<()> {
        let queues = [
            (self.inner.settings.outbound_queue_number, Direction::Egress),
            (self.inner.settings.inbound_queue_number, Direction::Ingress),
        ];

        let mut threads = self.threads.lock().unwrap();
        for (queue_number, direction) in queues {
            let mut queue = Queue::open().context("could not open nfqueue socket")?;
            queue
                .bind(queue_number)
                .with_context(|| format!("could not bind nfqueue {}", queue_number))?;
            queue
                .set_fail_open(queue_number, false)
                .context("failed to set fail-open mode")?;
            queue
                .set_queue_max_len(queue_number, MAX_QUEUE_LEN)
                .context("failed to set queue length")?;
            // Only the IPv4 header matters; an MTU of copy keeps headroom.
            queue
                .set_copy_range(queue_number, COPY_RANGE)
                .context("failed to set copy range")?;
            queue.set_nonblocking(true);

            let inner = self.inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("nfq-{}", queue_number))
                .spawn(move || run_queue(inner, queue, queue_number, direction))
                .context("failed to spawn queue thread")?;
            threads.push(handle);
        }

        info!("NFQueue listeners started");
        Ok(())
    }

    /// Verdict writes that failed; surfaced to the admin view.
    pub fn failed_verdicts(&self) -> u64 {
        self.inner.failed_verdicts.load(Ordering::Relaxed)
    }

    /// Stop the read loops and drop the queue handles. Callers must remove
    /// the kernel rules first: closing a queue that still has a live rule
    /// strands its in-flight verdicts.
    pub fn close(&self) {
        self.inner.stop.store(true, Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn run_queue(inner: Arc<FilterInner>, mut queue: Queue, queue_number: u16, direction: Direction) {
    let mut rng = SmallRng::from_entropy();
    info!("NFQueue {} listening ({})", queue_number, direction);

    loop {
        if inner.stop.load(Ordering::Relaxed) {
            break;
        }
        match queue.recv() {
            Ok(mut msg) => {
                // One bad packet must never take the queue down.
                let verdict = catch_unwind(AssertUnwindSafe(|| {
                    inner.handle_packet(msg.get_payload(), direction, &mut rng)
                }))
                .unwrap_or_else(|panic| {
                    error!(
                        "Recovered from panic in packet handler: {}",
                        panic_message(panic.as_ref())
                    );
                    Verdict::Accept
                });

                msg.set_verdict(verdict);
                if let Err(e) = queue.verdict(msg) {
                    inner.failed_verdicts.fetch_add(1, Ordering::Relaxed);
                    error!("Error setting verdict: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(IDLE_POLL);
            }
            Err(e) => {
                if !inner.stop.load(Ordering::Relaxed) {
                    error!("NFQ read error on queue {}: {}", queue_number, e);
                }
                std::thread::sleep(IDLE_POLL);
            }
        }
    }

    debug!("NFQueue {} loop stopped", queue_number);
}
