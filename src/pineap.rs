//! Detection of access points that answer for many SSIDs from one BSSID,
//! the signature of PineAP-style karma devices.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::frame::{MacAddress, MAX_SSID_LEN};

pub const MAX_SSIDS_PER_BSSID: usize = 10;
pub const MAX_PINEAP_NETWORKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PineApSettings {
    /// SSIDs older than this no longer count toward a detection.
    pub window: Duration,
    /// How long a flagged BSSID stays blacklisted.
    pub cooldown: Duration,
    pub min_ssids: usize,
    pub max_networks: usize,
}

impl Default for PineApSettings {
    fn default() -> Self {
        PineApSettings {
            window: Duration::from_secs(120),
            cooldown: Duration::from_secs(30),
            min_ssids: 2,
            max_networks: MAX_PINEAP_NETWORKS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PineApDetection {
    pub bssid: MacAddress,
    pub ssids: Vec<String>,
    pub channel: u8,
    pub rssi: i32,
}

pub fn is_valid_ssid(ssid: &str) -> bool {
    let ssid = ssid.trim_matches('\0');
    !ssid.is_empty() && ssid.len() <= MAX_SSID_LEN && !ssid.chars().all(char::is_whitespace)
}

#[derive(Debug)]
struct SsidEntry {
    hash: u32,
    ssid: String,
    seen: Instant,
}

#[derive(Debug)]
struct Tracker {
    ring: VecDeque<SsidEntry>,
    hashes: HashSet<u32>,
    last_seen: Instant,
    channel: u8,
    rssi: i32,
    blacklisted_at: Option<Instant>,
    detections: u32,
}

impl Tracker {
    fn new(now: Instant) -> Tracker {
        Tracker {
            ring: VecDeque::with_capacity(MAX_SSIDS_PER_BSSID),
            hashes: HashSet::with_capacity(MAX_SSIDS_PER_BSSID),
            last_seen: now,
            channel: 0,
            rssi: 0,
            blacklisted_at: None,
            detections: 0,
        }
    }

    fn reset(&mut self) {
        self.ring.clear();
        self.hashes.clear();
        self.blacklisted_at = None;
    }

    fn record(&mut self, ssid: &str, now: Instant) {
        let hash = crc32fast::hash(ssid.as_bytes());
        if self.hashes.contains(&hash) {
            if let Some(entry) = self.ring.iter_mut().find(|e| e.hash == hash) {
                entry.seen = now;
            }
            return;
        }
        if self.ring.len() >= MAX_SSIDS_PER_BSSID {
            if let Some(oldest) = self.ring.pop_front() {
                self.hashes.remove(&oldest.hash);
            }
        }
        self.hashes.insert(hash);
        self.ring.push_back(SsidEntry {
            hash,
            ssid: ssid.to_string(),
            seen: now,
        });
    }

    fn recent(&self, now: Instant, window: Duration) -> Vec<String> {
        self.ring
            .iter()
            .filter(|e| now.duration_since(e.seen) <= window)
            .map(|e| e.ssid.clone())
            .collect()
    }
}

pub struct PineApDetector {
    settings: PineApSettings,
    trackers: HashMap<MacAddress, Tracker>,
    history: Vec<PineApDetection>,
}

impl PineApDetector {
    pub fn new(settings: PineApSettings) -> PineApDetector {
        PineApDetector {
            settings,
            trackers: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// Feeds one beacon or probe response. Returns a detection the first time
    /// a BSSID crosses the threshold, and again only after its cooldown.
    pub fn observe(
        &mut self,
        bssid: MacAddress,
        ssid: &str,
        channel: u8,
        rssi: i32,
        now: Instant,
    ) -> Option<PineApDetection> {
        if !bssid.is_real_device() || !is_valid_ssid(ssid) {
            return None;
        }
        let ssid = ssid.trim_matches('\0');

        if !self.trackers.contains_key(&bssid) && self.trackers.len() >= self.settings.max_networks
        {
            self.evict_oldest();
        }
        let settings = self.settings;
        let tracker = self
            .trackers
            .entry(bssid)
            .or_insert_with(|| Tracker::new(now));

        tracker.last_seen = now;
        tracker.channel = channel;
        tracker.rssi = rssi;

        if let Some(at) = tracker.blacklisted_at {
            if now.duration_since(at) < settings.cooldown {
                return None;
            }
            tracker.reset();
        }

        tracker.record(ssid, now);
        let ssids = tracker.recent(now, settings.window);
        if ssids.len() < settings.min_ssids {
            return None;
        }

        tracker.blacklisted_at = Some(now);
        tracker.detections += 1;
        let detection = PineApDetection {
            bssid,
            ssids,
            channel,
            rssi,
        };
        self.history.push(detection.clone());
        Some(detection)
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self
            .trackers
            .iter()
            .min_by_key(|(_, t)| t.last_seen)
            .map(|(mac, _)| *mac)
        {
            self.trackers.remove(&oldest);
        }
    }

    pub fn is_blacklisted(&self, bssid: &MacAddress, now: Instant) -> bool {
        self.trackers
            .get(bssid)
            .and_then(|t| t.blacklisted_at)
            .map_or(false, |at| now.duration_since(at) < self.settings.cooldown)
    }

    pub fn tracked(&self) -> usize {
        self.trackers.len()
    }

    pub fn detections(&self) -> &[PineApDetection] {
        &self.history
    }

    pub fn detection_count(&self, bssid: &MacAddress) -> u32 {
        self.trackers.get(bssid).map_or(0, |t| t.detections)
    }
}
