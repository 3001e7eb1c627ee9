use crate::models::{
    epoch, Group, MapGroupTrackerConfig, TrackerConfig, TrackerMode, TrackerSummary,
};
use crate::storage;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const TRACKER_CONFIG_FILE: &str = "usage-tracker-config.yaml";

const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Per-group sample ring plus its effective configuration.
#[derive(Debug, Clone)]
struct DeviceData {
    config: TrackerConfig,
    samples: Vec<bool>,
    window_start_time: DateTime<Utc>,
}

/// Serialized form of DeviceData for samples.json.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceDataDto {
    config: Option<TrackerConfig>,
    samples: Vec<bool>,
    #[serde(rename = "windowStartTime")]
    window_start_time: DateTime<Utc>,
}

impl DeviceData {
    /// Build fresh device data, applying defaults where the config carries
    /// zero values and clamping retention to the supported week maximum.
    fn new(now: DateTime<Utc>, cfg: &TrackerConfig) -> Self {
        let mut cfg = cfg.clone();

        if cfg.retention > WEEK {
            cfg.retention = WEEK;
        }
        if cfg.retention < DAY {
            cfg.start_day = 0;
        }
        if cfg.threshold.is_zero() {
            cfg.threshold = Duration::from_secs(60);
        }
        if cfg.granularity.is_zero() {
            cfg.granularity = Duration::from_secs(60);
        }
        cfg.sample_size = cfg.sample_size_for();

        let window_start_time = calculate_window_start(&cfg, now);
        let sample_size = cfg.sample_size;
        DeviceData {
            config: cfg,
            samples: vec![false; sample_size],
            window_start_time,
        }
    }

    fn index(&self, now: DateTime<Utc>) -> usize {
        let g = self.config.granularity.as_secs().max(1) as i64;
        let elapsed = (now.timestamp() - self.window_start_time.timestamp()).div_euclid(g);
        let size = self.config.sample_size.max(1) as i64;
        elapsed.rem_euclid(size) as usize
    }

    /// Keep the ring aligned with the current retention window. Inside the
    /// window the circular buffer overwrites naturally; once the window has
    /// rolled over (or the clock went backwards past the start) everything
    /// is zeroed and the start is recomputed.
    fn sync_window(&mut self, now: DateTime<Utc>) {
        let g = self.config.granularity.as_secs().max(1) as i64;
        let elapsed = (now.timestamp() - self.window_start_time.timestamp()).div_euclid(g);
        if elapsed >= self.config.sample_size as i64 || elapsed < 0 {
            for sample in self.samples.iter_mut() {
                *sample = false;
            }
            self.window_start_time = calculate_window_start(&self.config, now);
            info!(
                "Renewed retention window ({:?}) starting {}",
                self.config.retention, self.window_start_time
            );
        }
    }

    fn used_count(&self) -> usize {
        self.samples.iter().filter(|s| **s).count()
    }
}

/// Sample count the ring will have once DeviceData::new applies its clamps.
fn effective_sample_size(cfg: &TrackerConfig) -> usize {
    let retention = cfg.retention.min(WEEK);
    let granularity = if cfg.granularity.is_zero() {
        Duration::from_secs(60)
    } else {
        cfg.granularity
    };
    (retention.as_secs() / granularity.as_secs().max(1)) as usize
}

/// Determine the wall-clock start of the current retention window.
///
/// Weekly windows anchor on the most recent start_day weekday at the start
/// offset past midnight UTC; daily windows on the most recent start offset
/// past midnight; shorter windows on the retention-aligned epoch boundary
/// plus the start offset, rewound one window if that lands in the future.
fn calculate_window_start(cfg: &TrackerConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    let now_ts = now.timestamp();
    let start_offset = cfg.start_duration.as_secs() as i64;
    let midnight_ts = now_ts - now_ts.rem_euclid(86_400);

    let start_ts = if cfg.retention >= WEEK {
        let days_back =
            (now.weekday().num_days_from_sunday() as i64 - cfg.start_day as i64).rem_euclid(7);
        let mut start = midnight_ts - days_back * 86_400 + start_offset;
        if start > now_ts {
            start -= 7 * 86_400;
        }
        start
    } else if cfg.retention >= DAY {
        let mut start = midnight_ts + start_offset;
        if start > now_ts {
            start -= 86_400;
        }
        start
    } else {
        let r = cfg.retention.as_secs().max(1) as i64;
        let mut start = now_ts - now_ts.rem_euclid(r) + start_offset;
        if start > now_ts {
            start -= r;
        }
        start
    };

    DateTime::from_timestamp(start_ts, 0).unwrap_or_else(epoch)
}

/// Usage tracker: one boolean sample ring per group, with a Monitor /
/// Allow / Block mode machine and crash-safe persistence.
pub struct UsageTracker {
    defaults: TrackerConfig,
    cfg_groups: Mutex<MapGroupTrackerConfig>,
    devices: Mutex<HashMap<Group, DeviceData>>,
    config_path: PathBuf,
    samples_path: Option<PathBuf>,
    now_fn: fn() -> DateTime<Utc>,
}

impl UsageTracker {
    pub fn new(
        defaults: TrackerConfig,
        config_path: PathBuf,
        samples_path: Option<PathBuf>,
    ) -> Result<Self> {
        let tracker = UsageTracker {
            defaults,
            cfg_groups: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            config_path,
            samples_path,
            now_fn: Utc::now,
        };

        {
            let mut loaded: MapGroupTrackerConfig =
                storage::load_yaml(&tracker.config_path, HashMap::new)?;
            // Granularity never round-trips through the file.
            for cfg in loaded.values_mut() {
                cfg.granularity = tracker.defaults.granularity;
            }
            let mut cfg_groups = tracker.cfg_groups.lock().unwrap();
            *cfg_groups = loaded;
        }

        if let Some(path) = &tracker.samples_path {
            if path.exists() {
                match tracker.load_samples(path) {
                    Ok(count) => info!("Loaded {} group sample buffers from {:?}", count, path),
                    Err(e) => error!("Failed to load samples from file: {:#}", e),
                }
            }
        }

        Ok(tracker)
    }

    #[cfg(test)]
    fn with_now_fn(mut self, now_fn: fn() -> DateTime<Utc>) -> Self {
        self.now_fn = now_fn;
        self
    }

    fn default_group_config(&self) -> TrackerConfig {
        let mut cfg = self.defaults.clone();
        cfg.sample_size = cfg.sample_size_for();
        cfg.mode = TrackerMode::Monitor;
        cfg.mode_end_time = epoch();
        cfg
    }

    /// Record an activity sample for a group at the current time.
    pub fn add_sample(&self, group: &Group, active: bool) {
        let now = (self.now_fn)();

        let cfg = {
            let mut cfg_groups = self.cfg_groups.lock().unwrap();
            cfg_groups
                .entry(group.clone())
                .or_insert_with(|| self.default_group_config())
                .clone()
        };

        let mut devices = self.devices.lock().unwrap();
        let dd = devices
            .entry(group.clone())
            .or_insert_with(|| DeviceData::new(now, &cfg));

        debug!(
            "usage tracker {}: retention={:?} threshold={:?} mode={:?} modeEndTime={}",
            group, cfg.retention, cfg.threshold, dd.config.mode, dd.config.mode_end_time
        );

        // Retention or threshold changes invalidate the ring; rebuild it,
        // carrying only the mode state across.
        let effective_size = effective_sample_size(&cfg);
        if dd.config.sample_size != effective_size || dd.config.threshold != cfg.threshold {
            info!("Tracker sample size changed for group {}, resetting now", group);
            let mode = dd.config.mode;
            let mode_end_time = dd.config.mode_end_time;
            *dd = DeviceData::new(now, &cfg);
            dd.config.mode = mode;
            dd.config.mode_end_time = mode_end_time;
        }
        if cfg.start_duration != dd.config.start_duration || cfg.start_day != dd.config.start_day {
            dd.config.start_duration = cfg.start_duration;
            dd.config.start_day = cfg.start_day;
        }

        if active && dd.config.mode == TrackerMode::Monitor {
            dd.sync_window(now);
            let index = dd.index(now);
            dd.samples[index] = true;
            debug!("usage tracker {} counted an active sample", group);
        }

        // Expired Allow/Block modes revert to monitoring.
        if (dd.config.mode == TrackerMode::Allow || dd.config.mode == TrackerMode::Block)
            && dd.config.mode_end_time < now
        {
            info!("Usage tracker {} is active again (monitor mode set)", group);
            dd.config.mode = TrackerMode::Monitor;
        }
    }

    /// Whether a group has used up its budget within the current window.
    pub fn has_exceeded_threshold(&self, group: &Group) -> bool {
        let now = (self.now_fn)();
        let mut devices = self.devices.lock().unwrap();
        let dd = match devices.get_mut(group) {
            Some(dd) => dd,
            None => {
                debug!("usage tracker has no data for group {}", group);
                return false;
            }
        };

        if dd.config.mode == TrackerMode::Allow && now < dd.config.mode_end_time {
            debug!("usage tracker {} is allowed until {}", group, dd.config.mode_end_time);
            return false;
        }
        if dd.config.mode == TrackerMode::Block && now < dd.config.mode_end_time {
            debug!("usage tracker {} is blocked until {}", group, dd.config.mode_end_time);
            return true;
        }

        dd.sync_window(now);
        let count = dd.used_count();
        debug!("usage tracker has seen {} active samples for {}", count, group);
        count as u64 * dd.config.granularity.as_secs() >= dd.config.threshold.as_secs()
    }

    /// Force a group into Allow or Block (or back to Monitor) for a duration.
    /// Persisted to the group tracker config so the choice survives restart.
    pub fn set_mode(&self, group: &Group, duration: Duration, mode: TrackerMode) -> Result<()> {
        let now = (self.now_fn)();
        let end_time = now
            + chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        {
            let mut devices = self.devices.lock().unwrap();
            let dd = devices
                .get_mut(group)
                .with_context(|| format!("usage tracker group {} not found", group))?;
            dd.config.mode = mode;
            dd.config.mode_end_time = end_time;
        }

        let updated = {
            let mut cfg_groups = self.cfg_groups.lock().unwrap();
            let cfg = cfg_groups
                .get_mut(group)
                .with_context(|| format!("group {} not found while setting a mode", group))?;
            cfg.mode = mode;
            cfg.mode_end_time = end_time;
            cfg_groups.clone()
        };
        self.set_config(updated)
    }

    pub fn mode(&self, group: &Group) -> Result<(TrackerMode, DateTime<Utc>)> {
        let devices = self.devices.lock().unwrap();
        let dd = devices
            .get(group)
            .with_context(|| format!("usage tracker group {} not found", group))?;
        Ok((dd.config.mode, dd.config.mode_end_time))
    }

    /// Drop a group's sample data entirely.
    pub fn reset(&self, group: &Group) {
        let mut devices = self.devices.lock().unwrap();
        devices.remove(group);
    }

    /// Per-group usage summary for the admin surface. Activity times are
    /// merged in by the caller from the traffic monitor.
    pub fn summary(&self) -> HashMap<Group, TrackerSummary> {
        let devices = self.devices.lock().unwrap();
        let mut result = HashMap::new();
        for (group, dd) in devices.iter() {
            let used = dd.used_count();
            let total = dd.samples.len();
            let threshold_minutes = (dd.config.threshold.as_secs() / 60).max(1);
            let percentage = ((used as f64 / threshold_minutes as f64) * 100.0) as u32;
            result.insert(
                group.clone(),
                TrackerSummary {
                    used,
                    total,
                    percentage: percentage.min(100),
                    last_active_times: HashMap::new(),
                },
            );
        }
        result
    }

    pub fn config(&self) -> Result<MapGroupTrackerConfig> {
        storage::load_yaml(&self.config_path, HashMap::new)
    }

    /// Validate, sanitize, persist and adopt a new group tracker config map.
    pub fn set_config(&self, new_config: MapGroupTrackerConfig) -> Result<()> {
        let now = (self.now_fn)();
        let mut sanitized: MapGroupTrackerConfig = HashMap::new();

        for (group, mut cfg) in new_config {
            if group.0.is_empty() {
                continue;
            }
            // Granularity is a process-wide setting.
            cfg.granularity = self.defaults.granularity;
            if cfg.retention.is_zero() {
                cfg.retention = self.defaults.retention;
            }
            if cfg.start_day == 0 {
                cfg.start_day = self.defaults.start_day;
            }
            if cfg.start_duration.is_zero() {
                cfg.start_duration = self.defaults.start_duration;
            }
            if cfg.mode_end_time < now {
                // Expired modes are reset; the tracker would ignore them anyway.
                cfg.mode = TrackerMode::Monitor;
                cfg.mode_end_time = epoch();
            }
            cfg.sample_size = cfg.sample_size_for();
            sanitized.insert(Group::new(&group.0), cfg);
        }

        if sanitized.is_empty() {
            return Err(anyhow::anyhow!("group tracker config is empty"));
        }

        storage::save_yaml(&self.config_path, &sanitized)?;

        let mut cfg_groups = self.cfg_groups.lock().unwrap();
        *cfg_groups = sanitized;
        Ok(())
    }

    /// Periodic samples persister; also invoked once at shutdown.
    pub fn start_persistence(
        self: Arc<Self>,
        interval: Duration,
        shutdown: Arc<Notify>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.samples_path.clone()?;
        if interval.is_zero() {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.save_samples(&path) {
                            error!("Failed to save samples to file: {:#}", e);
                        } else {
                            debug!("Saved samples to file {:?}", path);
                        }
                    }
                    _ = shutdown.notified() => {
                        info!("Sample persister received shutdown signal, stopping...");
                        break;
                    }
                }
            }
        }))
    }

    /// Write the samples file now. Used by the persister and at shutdown.
    pub fn flush_samples(&self) -> Result<()> {
        match &self.samples_path {
            Some(path) => self.save_samples(path),
            None => Ok(()),
        }
    }

    fn save_samples(&self, path: &PathBuf) -> Result<()> {
        let dto: HashMap<String, DeviceDataDto> = {
            let devices = self.devices.lock().unwrap();
            devices
                .iter()
                .map(|(group, dd)| {
                    (
                        group.0.clone(),
                        DeviceDataDto {
                            config: Some(dd.config.clone()),
                            samples: dd.samples.clone(),
                            window_start_time: dd.window_start_time,
                        },
                    )
                })
                .collect()
        };

        let data = serde_json::to_string(&dto).context("failed to marshal samples")?;
        storage::safe_write_via_temp(path, &data)
    }

    fn load_samples(&self, path: &PathBuf) -> Result<usize> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read samples from {:?}", path))?;
        let dto: HashMap<String, DeviceDataDto> =
            serde_json::from_str(&data).context("failed to unmarshal samples")?;

        let mut devices = self.devices.lock().unwrap();
        let count = dto.len();
        for (group, entry) in dto {
            // Entries persisted without a config get the global defaults;
            // the window cannot be synchronized without one.
            let mut config = entry.config.unwrap_or_else(|| self.default_group_config());
            if config.granularity.is_zero() {
                config.granularity = self.defaults.granularity;
            }
            devices.insert(
                Group(group),
                DeviceData {
                    config,
                    samples: entry.samples,
                    window_start_time: entry.window_start_time,
                },
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        // 2023-11-15 (a Wednesday) 06:13:20 UTC.
        DateTime::from_timestamp(1_700_028_800, 0).unwrap()
    }

    fn minute_tracker(dir: &tempfile::TempDir, retention_secs: u64, threshold_secs: u64) -> UsageTracker {
        let defaults = TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: Duration::from_secs(retention_secs),
            threshold: Duration::from_secs(threshold_secs),
            start_day: 5,
            start_duration: Duration::ZERO,
            ..Default::default()
        };
        UsageTracker::new(
            defaults,
            dir.path().join(TRACKER_CONFIG_FILE),
            Some(dir.path().join("samples.json")),
        )
        .unwrap()
        .with_now_fn(fixed_now)
    }

    #[test]
    fn test_threshold_not_exceeded_for_unknown_group() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        assert!(!tracker.has_exceeded_threshold(&Group::from("nobody")));
    }

    #[test]
    fn test_threshold_exceeded_after_enough_active_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        // One active sample marks one granularity slot; ten slots at 1m
        // granularity meet a 10m threshold. Each add lands in the same slot
        // at a fixed clock, so force distinct slots directly.
        tracker.add_sample(&group, true);
        {
            let mut devices = tracker.devices.lock().unwrap();
            let dd = devices.get_mut(&group).unwrap();
            for i in 0..10 {
                dd.samples[i] = true;
            }
        }
        assert!(tracker.has_exceeded_threshold(&group));
    }

    #[test]
    fn test_inactive_samples_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 60);
        let group = Group::from("kids");

        tracker.add_sample(&group, false);
        assert!(!tracker.has_exceeded_threshold(&group));
    }

    #[test]
    fn test_window_rollover_clears_samples() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        tracker.add_sample(&group, true);
        {
            let mut devices = tracker.devices.lock().unwrap();
            let dd = devices.get_mut(&group).unwrap();
            for i in 0..20 {
                dd.samples[i] = true;
            }
            // Simulate a window that started more than one retention ago.
            dd.window_start_time = fixed_now() - chrono::Duration::seconds(3601);
            dd.sync_window(fixed_now());
            assert_eq!(dd.used_count(), 0);
            assert!(dd.window_start_time <= fixed_now());
            assert!(
                fixed_now().timestamp() - dd.window_start_time.timestamp() < 3600,
                "window start advanced into the current window"
            );
        }
        assert!(!tracker.has_exceeded_threshold(&group));
    }

    #[test]
    fn test_block_mode_overrides_samples_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        tracker.add_sample(&group, false);
        tracker
            .set_mode(&group, Duration::from_secs(300), TrackerMode::Block)
            .unwrap();
        assert!(tracker.has_exceeded_threshold(&group));

        // Allow wins the other way even with a full buffer.
        {
            let mut devices = tracker.devices.lock().unwrap();
            let dd = devices.get_mut(&group).unwrap();
            for sample in dd.samples.iter_mut() {
                *sample = true;
            }
        }
        tracker
            .set_mode(&group, Duration::from_secs(300), TrackerMode::Allow)
            .unwrap();
        assert!(!tracker.has_exceeded_threshold(&group));
    }

    #[test]
    fn test_expired_mode_reverts_to_monitor_on_add_sample() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        tracker.add_sample(&group, false);
        {
            let mut devices = tracker.devices.lock().unwrap();
            let dd = devices.get_mut(&group).unwrap();
            dd.config.mode = TrackerMode::Block;
            dd.config.mode_end_time = fixed_now() - chrono::Duration::seconds(1);
        }

        tracker.add_sample(&group, true);
        let (mode, _) = tracker.mode(&group).unwrap();
        assert_eq!(mode, TrackerMode::Monitor);
        assert!(!tracker.has_exceeded_threshold(&group));
    }

    #[test]
    fn test_mode_set_survives_in_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        tracker.add_sample(&group, false);
        tracker
            .set_mode(&group, Duration::from_secs(3600), TrackerMode::Allow)
            .unwrap();

        let persisted = tracker.config().unwrap();
        assert_eq!(persisted[&group].mode, TrackerMode::Allow);
        assert!(persisted[&group].mode_end_time > fixed_now());
    }

    #[test]
    fn test_samples_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let group = Group::from("kids");
        let (samples_before, window_before) = {
            let tracker = minute_tracker(&dir, 3600, 600);
            tracker.add_sample(&group, true);
            tracker.flush_samples().unwrap();
            let devices = tracker.devices.lock().unwrap();
            let dd = &devices[&group];
            (dd.samples.clone(), dd.window_start_time)
        };

        let tracker = minute_tracker(&dir, 3600, 600);
        let devices = tracker.devices.lock().unwrap();
        let dd = &devices[&group];
        assert_eq!(dd.samples, samples_before);
        assert_eq!(dd.window_start_time, window_before);
        assert_eq!(dd.config.threshold, Duration::from_secs(600));
    }

    #[test]
    fn test_threshold_change_rebuilds_ring_but_keeps_mode() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);
        let group = Group::from("kids");

        tracker.add_sample(&group, true);
        tracker
            .set_mode(&group, Duration::from_secs(3600), TrackerMode::Block)
            .unwrap();
        {
            let mut devices = tracker.devices.lock().unwrap();
            let dd = devices.get_mut(&group).unwrap();
            for i in 0..10 {
                dd.samples[i] = true;
            }
        }

        // Change the threshold in the group config; the next sample rebuilds
        // the ring, dropping history and preserving the forced mode.
        {
            let mut cfg_groups = tracker.cfg_groups.lock().unwrap();
            cfg_groups.get_mut(&group).unwrap().threshold = Duration::from_secs(1200);
        }
        tracker.add_sample(&group, false);

        let devices = tracker.devices.lock().unwrap();
        let dd = &devices[&group];
        assert_eq!(dd.used_count(), 0);
        assert_eq!(dd.config.mode, TrackerMode::Block);
        assert_eq!(dd.config.threshold, Duration::from_secs(1200));
    }

    #[test]
    fn test_set_config_rejects_empty_and_sanitizes() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = minute_tracker(&dir, 3600, 600);

        assert!(tracker.set_config(HashMap::new()).is_err());

        let mut cfg = TrackerConfig::default();
        cfg.retention = Duration::ZERO; // backfilled from defaults
        cfg.mode = TrackerMode::Block;
        cfg.mode_end_time = fixed_now() - chrono::Duration::seconds(10); // expired

        let mut map = HashMap::new();
        map.insert(Group("kids/teens".to_string()), cfg);
        tracker.set_config(map).unwrap();

        let stored = tracker.config().unwrap();
        let entry = &stored[&Group::from("kidsteens")];
        assert_eq!(entry.retention, Duration::from_secs(3600));
        assert_eq!(entry.mode, TrackerMode::Monitor);
        assert_eq!(entry.sample_size, 60);
    }

    #[test]
    fn test_weekly_window_starts_on_configured_weekday() {
        let cfg = TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: WEEK,
            threshold: Duration::from_secs(600),
            start_day: 5, // Friday
            start_duration: Duration::ZERO,
            ..Default::default()
        };
        // fixed_now() is a Wednesday, so the window began the previous Friday.
        let start = calculate_window_start(&cfg, fixed_now());
        assert_eq!(start.weekday().num_days_from_sunday(), 5);
        assert!(start <= fixed_now());
        assert!(fixed_now() - start <= chrono::Duration::days(7));
        assert_eq!(start.timestamp().rem_euclid(86_400), 0);
    }

    #[test]
    fn test_daily_window_starts_at_offset_past_midnight() {
        let cfg = TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: DAY,
            threshold: Duration::from_secs(600),
            start_day: 0,
            start_duration: Duration::from_secs(6 * 3600),
            ..Default::default()
        };
        // fixed_now() is 06:13:20, so today's 06:00 start has already passed.
        let start = calculate_window_start(&cfg, fixed_now());
        assert_eq!(start.timestamp().rem_euclid(86_400), 6 * 3600);
        assert!(start <= fixed_now());
        assert!(fixed_now() - start < chrono::Duration::days(1));
    }

    #[test]
    fn test_subdaily_window_rewinds_when_offset_in_future() {
        let cfg = TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
            threshold: Duration::from_secs(600),
            start_day: 0,
            start_duration: Duration::from_secs(1800),
            ..Default::default()
        };
        // 06:13:20 is before the 06:30 offset, so the window starts 05:30.
        let start = calculate_window_start(&cfg, fixed_now());
        assert!(start <= fixed_now());
        assert_eq!(start.timestamp().rem_euclid(3600), 1800);
        assert!(fixed_now() - start < chrono::Duration::seconds(3600));
    }

    #[test]
    fn test_index_is_stable_under_clock_regression() {
        let cfg = TrackerConfig {
            granularity: Duration::from_secs(60),
            retention: Duration::from_secs(3600),
            threshold: Duration::from_secs(600),
            ..Default::default()
        };
        let dd = DeviceData::new(fixed_now(), &cfg);
        // A time before the window start still yields an in-range index.
        let before = dd.window_start_time - chrono::Duration::seconds(90);
        let idx = dd.index(before);
        assert!(idx < dd.config.sample_size);
    }
}
