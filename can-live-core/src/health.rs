//! Bus statistics and health
//!
//! Per-ID frame counters, inter-arrival statistics, the rolling frame rate
//! and bus-loss classification. Everything is measured on the monotonic
//! clock carried by [`RawFrame::timestamp`], the same time base the state
//! table uses for staleness.

use crate::types::{format_key, RawFrame};
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Width of the window the frame rate is averaged over
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Counters for one message key
#[derive(Debug, Clone, PartialEq)]
pub struct IdStats {
    pub count: u64,
    pub last_seen: Instant,
    /// Payload length of the last frame
    pub dlc: usize,
    /// Payload of the last frame
    pub last_data: Vec<u8>,
    /// Time between the last two frames
    pub last_cycle: Option<Duration>,
    pub min_cycle: Option<Duration>,
    pub max_cycle: Option<Duration>,
    cycle_total: Duration,
    cycle_samples: u32,
}

impl IdStats {
    fn new(now: Instant, data: &[u8]) -> Self {
        Self {
            count: 1,
            last_seen: now,
            dlc: data.len(),
            last_data: data.to_vec(),
            last_cycle: None,
            min_cycle: None,
            max_cycle: None,
            cycle_total: Duration::ZERO,
            cycle_samples: 0,
        }
    }

    fn record(&mut self, now: Instant, data: &[u8]) {
        let cycle = now.saturating_duration_since(self.last_seen);
        self.last_cycle = Some(cycle);
        self.min_cycle = Some(self.min_cycle.map_or(cycle, |m| m.min(cycle)));
        self.max_cycle = Some(self.max_cycle.map_or(cycle, |m| m.max(cycle)));
        self.cycle_total += cycle;
        self.cycle_samples += 1;
        self.count += 1;
        self.last_seen = now;
        self.dlc = data.len();
        self.last_data.clear();
        self.last_data.extend_from_slice(data);
    }

    /// Running mean of the inter-arrival time
    pub fn mean_cycle(&self) -> Option<Duration> {
        (self.cycle_samples > 0).then(|| self.cycle_total / self.cycle_samples)
    }
}

/// State of the link to the frame source
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Connected,
    /// Backend could not be opened at start-up; running on the null source
    NoHardware,
    /// Backend reported a fatal disconnect; reconnection is being retried
    Disconnected { reason: String, since: Instant },
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connected => write!(f, "connected"),
            LinkState::NoHardware => write!(f, "no hardware"),
            LinkState::Disconnected { reason, .. } => write!(f, "disconnected ({})", reason),
        }
    }
}

/// Published bus health
#[derive(Debug, Clone, PartialEq)]
pub struct BusHealth {
    pub total_frames: u64,
    /// Per message key (see [`crate::lookup_key`])
    pub frames_per_id: BTreeMap<u32, IdStats>,
    pub last_frame_time: Option<Instant>,
    /// No frame of any ID within the bus-loss window
    pub loss_flag: bool,
    pub unknown_frames: u64,
    pub malformed_frames: u64,
    /// Frames received but excluded by the channel/message filter
    pub filtered_frames: u64,
    /// Frames the source reported as lost to buffer overruns
    pub overruns: u64,
    pub link: LinkState,
    /// Frames per second over the last complete rate window
    pub frames_per_second: f64,
    /// Start of counting (monitor creation or last reset)
    pub since: Instant,
}

impl BusHealth {
    fn new(now: Instant) -> Self {
        Self {
            total_frames: 0,
            frames_per_id: BTreeMap::new(),
            last_frame_time: None,
            loss_flag: false,
            unknown_frames: 0,
            malformed_frames: 0,
            filtered_frames: 0,
            overruns: 0,
            link: LinkState::Connected,
            frames_per_second: 0.0,
            since: now,
        }
    }

    /// True when frames are flowing and the link is up
    pub fn is_healthy(&self) -> bool {
        !self.loss_flag && self.link == LinkState::Connected
    }
}

/// Writer side of the health statistics (owned by the ingest thread)
pub struct HealthMonitor {
    bus_loss_window: Duration,
    health: BusHealth,
    /// Reference point for bus-loss before the first frame
    started: Instant,
    rate_window_start: Instant,
    rate_window_frames: u64,
    /// Something changed since the last publish
    dirty: bool,
    /// A change readers must see without waiting for the publish interval
    urgent: bool,
    last_publish: Instant,
    published: Arc<ArcSwap<BusHealth>>,
}

impl HealthMonitor {
    pub fn new(bus_loss_window: Duration, now: Instant) -> Self {
        let health = BusHealth::new(now);
        Self {
            bus_loss_window,
            published: Arc::new(ArcSwap::from_pointee(health.clone())),
            health,
            started: now,
            rate_window_start: now,
            rate_window_frames: 0,
            dirty: false,
            urgent: false,
            last_publish: now,
        }
    }

    /// Count a received frame; clears bus-loss
    pub fn record_frame(&mut self, frame: &RawFrame) {
        let now = frame.timestamp;
        let key = frame.key();
        self.health.total_frames += 1;
        self.rate_window_frames += 1;
        self.health
            .frames_per_id
            .entry(key)
            .and_modify(|stats| stats.record(now, &frame.data))
            .or_insert_with(|| IdStats::new(now, &frame.data));
        self.health.last_frame_time = Some(now);

        if self.health.loss_flag {
            self.health.loss_flag = false;
            log::info!("Bus traffic resumed ({})", format_key(key));
            self.urgent = true;
        }
        self.dirty = true;
    }

    pub fn record_unknown(&mut self) {
        self.health.unknown_frames += 1;
        self.dirty = true;
    }

    pub fn record_malformed(&mut self) {
        self.health.malformed_frames += 1;
        self.dirty = true;
    }

    pub fn record_filtered(&mut self) {
        self.health.filtered_frames += 1;
        self.dirty = true;
    }

    pub fn record_overrun(&mut self, lost: u64) {
        self.health.overruns += lost;
        self.dirty = true;
    }

    /// Update the link state, logging transitions
    pub fn set_link(&mut self, link: LinkState) {
        if self.health.link == link {
            return;
        }
        match &link {
            LinkState::Connected => log::info!("Frame source connected"),
            LinkState::NoHardware => log::warn!("No hardware available, running on dummy bus"),
            LinkState::Disconnected { reason, .. } => {
                log::warn!("Frame source disconnected: {}", reason)
            }
        }
        self.health.link = link;
        self.dirty = true;
        self.urgent = true;
    }

    /// Re-evaluate time-based state (bus-loss, frame rate)
    ///
    /// Returns true if anything a reader would see has changed since the
    /// last publish.
    pub fn evaluate(&mut self, now: Instant) -> bool {
        let last_activity = self.health.last_frame_time.unwrap_or(self.started);
        let silent = now.saturating_duration_since(last_activity);
        if !self.health.loss_flag && silent > self.bus_loss_window {
            self.health.loss_flag = true;
            log::warn!(
                "Bus loss: no frames for more than {} ms",
                self.bus_loss_window.as_millis()
            );
            self.dirty = true;
            self.urgent = true;
        }

        let elapsed = now.saturating_duration_since(self.rate_window_start);
        if elapsed >= RATE_WINDOW {
            self.health.frames_per_second = self.rate_window_frames as f64 / elapsed.as_secs_f64();
            self.rate_window_start = now;
            self.rate_window_frames = 0;
            self.dirty = true;
        }

        self.dirty
    }

    /// Zero all counters
    ///
    /// The last frame time, the loss flag and the link state describe the
    /// bus rather than the statistics, so they survive a reset.
    pub fn reset(&mut self, now: Instant) {
        let mut health = BusHealth::new(now);
        health.last_frame_time = self.health.last_frame_time;
        health.loss_flag = self.health.loss_flag;
        health.link = self.health.link.clone();
        self.health = health;
        self.rate_window_start = now;
        self.rate_window_frames = 0;
        self.dirty = true;
        self.urgent = true;
        log::info!("Bus statistics reset");
    }

    /// Current (unpublished) statistics
    pub fn snapshot(&self) -> BusHealth {
        self.health.clone()
    }

    pub fn loss_flag(&self) -> bool {
        self.health.loss_flag
    }

    pub fn link(&self) -> &LinkState {
        &self.health.link
    }

    /// True if readers should get a new snapshot now
    ///
    /// Link and bus-loss transitions publish immediately, counter changes
    /// at most once per `interval`.
    pub fn publish_due(&self, now: Instant, interval: Duration) -> bool {
        self.dirty && (self.urgent || now.saturating_duration_since(self.last_publish) >= interval)
    }

    /// Make the current statistics visible to readers
    pub fn publish(&mut self) {
        self.published.store(Arc::new(self.health.clone()));
        self.dirty = false;
        self.urgent = false;
        self.last_publish = Instant::now();
    }

    pub fn reader(&self) -> HealthReader {
        HealthReader {
            published: self.published.clone(),
        }
    }
}

/// Read-only access to the published bus health
#[derive(Clone)]
pub struct HealthReader {
    published: Arc<ArcSwap<BusHealth>>,
}

impl HealthReader {
    pub fn snapshot(&self) -> Arc<BusHealth> {
        self.published.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_per_id_cycle_statistics() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(1000), t0);
        for offset in [0, 10, 30, 40] {
            monitor.record_frame(&RawFrame::at(0x100, vec![0; 8], t0 + ms(offset)));
        }
        monitor.record_frame(&RawFrame::at(0x200, vec![0; 4], t0 + ms(41)));

        let health = monitor.snapshot();
        assert_eq!(health.total_frames, 5);
        let stats = &health.frames_per_id[&0x100];
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min_cycle, Some(ms(10)));
        assert_eq!(stats.max_cycle, Some(ms(20)));
        assert_eq!(stats.mean_cycle(), Some(Duration::from_nanos(13_333_333)));
        assert_eq!(stats.last_cycle, Some(ms(10)));
        assert_eq!(health.frames_per_id[&0x200].dlc, 4);
    }

    #[test]
    fn test_last_payload_is_kept_per_id() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(1000), t0);
        monitor.record_frame(&RawFrame::at(0x100, vec![1, 2, 3], t0));
        monitor.record_frame(&RawFrame::at(0x100, vec![9, 8], t0 + ms(5)));

        let stats = &monitor.snapshot().frames_per_id[&0x100];
        assert_eq!(stats.last_data, vec![9, 8]);
        assert_eq!(stats.dlc, 2);
        assert_eq!(stats.count, 2);

        monitor.reset(t0 + ms(6));
        assert!(monitor.snapshot().frames_per_id.is_empty());
    }

    #[test]
    fn test_bus_loss_set_and_cleared() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(1000), t0);
        monitor.record_frame(&RawFrame::at(0x100, vec![0; 8], t0));

        monitor.evaluate(t0 + ms(999));
        assert!(!monitor.snapshot().loss_flag);
        monitor.evaluate(t0 + ms(1001));
        assert!(monitor.snapshot().loss_flag);

        monitor.record_frame(&RawFrame::at(0x7FF, vec![], t0 + ms(1500)));
        assert!(!monitor.snapshot().loss_flag);
    }

    #[test]
    fn test_bus_loss_without_any_frame() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(100), t0);
        assert!(monitor.evaluate(t0 + ms(150)));
        assert!(monitor.snapshot().loss_flag);
    }

    #[test]
    fn test_reset_keeps_bus_state() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(100), t0);
        monitor.record_frame(&RawFrame::at(0x100, vec![0; 8], t0));
        monitor.record_unknown();
        monitor.record_overrun(3);
        monitor.evaluate(t0 + ms(200));

        monitor.reset(t0 + ms(250));
        let health = monitor.snapshot();
        assert_eq!(health.total_frames, 0);
        assert!(health.frames_per_id.is_empty());
        assert_eq!(health.unknown_frames, 0);
        assert_eq!(health.overruns, 0);
        assert_eq!(health.last_frame_time, Some(t0));
        assert!(health.loss_flag);
    }

    #[test]
    fn test_frame_rate_over_window() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(5000), t0);
        for i in 0..50 {
            monitor.record_frame(&RawFrame::at(0x100, vec![0; 8], t0 + ms(i * 20)));
        }
        monitor.evaluate(t0 + ms(1000));
        assert!((monitor.snapshot().frames_per_second - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_readers_see_published_state_only() {
        let t0 = Instant::now();
        let mut monitor = HealthMonitor::new(ms(1000), t0);
        let reader = monitor.reader();
        monitor.record_frame(&RawFrame::at(0x100, vec![0; 8], t0));
        assert_eq!(reader.snapshot().total_frames, 0);
        monitor.publish();
        assert_eq!(reader.snapshot().total_frames, 1);
        monitor.set_link(LinkState::NoHardware);
        assert!(monitor.publish_due(t0, Duration::from_secs(60)));
        monitor.publish();
        assert!(!monitor.publish_due(t0, Duration::ZERO));
        assert!(!reader.snapshot().is_healthy());
    }
}
