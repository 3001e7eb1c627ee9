use crate::models::{Direction, Group, Ip, Mac, MapIpMacs, SourceIpMacsReceiver};
use chrono::{DateTime, Timelike, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

const KEY_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy)]
pub struct ActivityConfig {
    /// Minimum ingress bytes per minute for the threshold comparison, in KB.
    pub threshold_ingress_egress_kb: u64,
    /// When set, a minute is active only if ingress clears the threshold AND
    /// exceeds egress. Otherwise any traffic at all counts as active.
    pub enable_threshold_logic: bool,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        ActivityConfig {
            threshold_ingress_egress_kb: 0,
            enable_threshold_logic: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MinuteSlot {
    count: u64,
    byte_total: u64,
    min_len: usize,
    max_len: usize,
    avg_len: f64,
}

/// Rolling per-minute stats for one (group, MAC) pair, one ring per direction.
#[derive(Debug)]
struct TrafficStats {
    window_size: usize,
    slots: HashMap<Direction, Vec<MinuteSlot>>,
    last_minute_idx: HashMap<Direction, usize>,
    is_last_minute_active: bool,
    last_active_time_utc: DateTime<Utc>,
}

impl TrafficStats {
    fn new(window_size: usize, now: DateTime<Utc>) -> Self {
        let mut slots = HashMap::new();
        let mut last_minute_idx = HashMap::new();
        for direction in [Direction::Ingress, Direction::Egress] {
            slots.insert(direction, vec![MinuteSlot::default(); window_size]);
            last_minute_idx.insert(direction, (now.minute() as usize) % window_size);
        }
        TrafficStats {
            window_size,
            slots,
            last_minute_idx,
            // Assume active until the first full minute has been observed.
            is_last_minute_active: true,
            last_active_time_utc: now,
        }
    }

    fn count_traffic(
        &mut self,
        activity: &ActivityConfig,
        count: u64,
        packet_len: usize,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> bool {
        let current_idx = (now.minute() as usize) % self.window_size;
        let last_idx = self.last_minute_idx[&direction];

        if current_idx != last_idx {
            // The previous minute is complete: finalize its average and
            // activity verdict before the new slot accumulates anything.
            let last_slot = self.slots.get_mut(&direction).unwrap()[last_idx];
            if last_slot.count > 0 {
                self.slots.get_mut(&direction).unwrap()[last_idx].avg_len =
                    last_slot.byte_total as f64 / last_slot.count as f64;
            }

            self.is_last_minute_active = self.is_active(activity, last_idx);
            if self.is_last_minute_active {
                let ts = now.timestamp();
                self.last_active_time_utc =
                    DateTime::from_timestamp(ts - ts.rem_euclid(60), 0).unwrap_or(now);
            }

            let slot = &mut self.slots.get_mut(&direction).unwrap()[current_idx];
            *slot = MinuteSlot {
                min_len: packet_len,
                max_len: packet_len,
                ..Default::default()
            };
            self.last_minute_idx.insert(direction, current_idx);
        }

        let slot = &mut self.slots.get_mut(&direction).unwrap()[current_idx];
        slot.count += count;
        slot.byte_total += packet_len as u64;
        if packet_len > slot.max_len {
            slot.max_len = packet_len;
        }
        if packet_len < slot.min_len || slot.min_len == 0 {
            slot.min_len = packet_len;
        }

        self.is_last_minute_active
    }

    fn is_active(&self, activity: &ActivityConfig, idx: usize) -> bool {
        let ingress = self.slots[&Direction::Ingress][idx].byte_total;
        let egress = self.slots[&Direction::Egress][idx].byte_total;

        if activity.enable_threshold_logic {
            ingress >= activity.threshold_ingress_egress_kb * 1024 && ingress > egress
        } else {
            ingress > 0 || egress > 0
        }
    }
}

/// Traffic activity monitor keyed by "group/MAC".
pub struct TrafficMap {
    window_size: usize,
    purge_after: Duration,
    activity: ActivityConfig,
    stats: Mutex<HashMap<String, TrafficStats>>,
    ip_macs: RwLock<MapIpMacs>,
    now_fn: fn() -> DateTime<Utc>,
}

impl TrafficMap {
    pub fn new(window_size: usize, purge_after: Duration, activity: ActivityConfig) -> Self {
        TrafficMap {
            window_size,
            purge_after,
            activity,
            stats: Mutex::new(HashMap::new()),
            ip_macs: RwLock::new(HashMap::new()),
            now_fn: Utc::now,
        }
    }

    #[cfg(test)]
    fn with_now_fn(mut self, now_fn: fn() -> DateTime<Utc>) -> Self {
        self.now_fn = now_fn;
        self
    }

    /// Count one observation and return whether the last completed minute
    /// for this (group, MAC) was active. The signal lags by one minute but
    /// is stable within it.
    pub fn count_traffic(
        &self,
        group: &Group,
        ip: &Ip,
        direction: Direction,
        count: u64,
        packet_len: usize,
    ) -> bool {
        let mac = {
            let ip_macs = self.ip_macs.read().unwrap();
            match ip_macs.get(ip) {
                Some(mac) => mac.clone(),
                None => {
                    warn!(
                        "count_traffic: no MAC found for {} in group {}, returning active for now",
                        ip, group
                    );
                    return true;
                }
            }
        };

        let now = (self.now_fn)();
        let key = traffic_map_key(group, &mac);
        let mut stats = self.stats.lock().unwrap();
        let entry = stats
            .entry(key)
            .or_insert_with(|| TrafficStats::new(self.window_size, now));
        entry.count_traffic(&self.activity, count, packet_len, direction, now)
    }

    /// Last active time per group and MAC, for the admin summary.
    pub fn last_active_times(&self) -> HashMap<Group, HashMap<Mac, DateTime<Utc>>> {
        let stats = self.stats.lock().unwrap();
        let mut result: HashMap<Group, HashMap<Mac, DateTime<Utc>>> = HashMap::new();
        for (key, value) in stats.iter() {
            if let Some((group, mac)) = split_traffic_map_key(key) {
                result
                    .entry(group)
                    .or_default()
                    .insert(mac, value.last_active_time_utc);
            }
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.stats.lock().unwrap().len()
    }
}

impl SourceIpMacsReceiver for TrafficMap {
    /// Store the fresh IP→MAC snapshot and drop stats whose MAC is gone
    /// from the network and idle past the purge horizon.
    fn update_source_ip_macs(&self, new_data: MapIpMacs) {
        debug!("traffic map received new IP-MAC data: {:?}", new_data);

        let min_allowed = (self.now_fn)()
            - chrono::Duration::from_std(self.purge_after).unwrap_or(chrono::Duration::zero());

        {
            let mut ip_macs = self.ip_macs.write().unwrap();
            *ip_macs = new_data;
        }

        let ip_macs = self.ip_macs.read().unwrap();
        let mut stats = self.stats.lock().unwrap();
        stats.retain(|key, value| {
            let mac_exists = match split_traffic_map_key(key) {
                Some((_, mac)) => ip_macs.values().any(|m| *m == mac),
                None => false,
            };
            mac_exists || value.last_active_time_utc >= min_allowed
        });
    }
}

fn traffic_map_key(group: &Group, mac: &Mac) -> String {
    format!("{}{}{}", group, KEY_SEPARATOR, mac)
}

fn split_traffic_map_key(key: &str) -> Option<(Group, Mac)> {
    let (group, mac) = key.split_once(KEY_SEPARATOR)?;
    Some((Group::from(group), Mac::new(mac).ok()?))
}
