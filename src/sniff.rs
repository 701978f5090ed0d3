//! Per-frame classification and the capture modes built on top of it.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use itertools::Itertools;
use serde::Deserialize;
use strum_macros::{Display, EnumIter, EnumString};

use crate::attack::DeauthTarget;
use crate::auth::{HandshakeStorage, MAX_HANDSHAKES};
use crate::buffer::{CaptureError, Delivery, WriterEvent};
use crate::devices::{
    oui_vendor, AccessPoint, Station, WiFiDeviceList, MAX_ACCESS_POINTS, MAX_STATIONS,
};
use crate::frame::{
    eapol_offset, EapolKey, Encryption, Frame, FrameKind, MacAddress, StationInfo,
};
use crate::gps::SharedFix;
use crate::pcap::PcapLogger;
use crate::pineap::{PineApDetector, PineApSettings};
use crate::radio::RxFrame;
use crate::status::{MessageLog, MessageType, StatusMessage};
use crate::tx::build_broadcast_deauth;
use crate::wardrive::{Sighting, WardriveLogger};
use crate::wps::{parse_wps, WpsInsert, WpsNetwork, WpsStore, MAX_WPS_NETWORKS};

pub const PWNAGOTCHI_MAC: MacAddress = MacAddress([0xde, 0xad, 0xbe, 0xef, 0xde, 0xad]);

/// With EAPOL deauth assist on, every Nth beacon of an AP triggers one.
pub const EAPOL_DEAUTH_EVERY: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum SniffMode {
    Raw,
    Probe,
    Beacon,
    Deauth,
    Eapol,
    Pwn,
    Wps,
    Pineap,
    Stations,
    Aps,
    Wardrive,
}

impl SniffMode {
    /// Hop list used when no channels are given.
    pub fn default_channels(&self) -> Vec<u8> {
        match self {
            SniffMode::Pineap | SniffMode::Wps | SniffMode::Wardrive => (1..=11).collect(),
            _ => vec![1, 6, 11],
        }
    }

    pub fn capture_name(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SnifferSettings {
    pub deauth_threshold: u32,
    pub deauth_window: Duration,
    pub eapol_deauth: bool,
    pub pineap: PineApSettings,
    pub wps_capacity: usize,
    pub max_stations: usize,
    pub max_access_points: usize,
    pub max_handshakes: usize,
}

impl Default for SnifferSettings {
    fn default() -> Self {
        SnifferSettings {
            deauth_threshold: 20,
            deauth_window: Duration::from_secs(1),
            eapol_deauth: false,
            pineap: PineApSettings::default(),
            wps_capacity: MAX_WPS_NETWORKS,
            max_stations: MAX_STATIONS,
            max_access_points: MAX_ACCESS_POINTS,
            max_handshakes: MAX_HANDSHAKES,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Counters {
    pub frame_count: u64,
    pub error_count: u64,
    pub management: u64,
    pub control: u64,
    pub data: u64,
    pub beacons: u64,
    pub probe_requests: u64,
    pub probe_responses: u64,
    pub deauths: u64,
    pub eapol_count: u64,
    pub logged: u64,
    pub tx_requested: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames: u64,
    pub beacons: u64,
    pub deauths: u64,
    pub data: u64,
    pub eapol: u64,
    rssi_total: i64,
}

impl ChannelStats {
    pub fn average_rssi(&self) -> Option<i32> {
        if self.frames == 0 {
            return None;
        }
        Some((self.rssi_total / self.frames as i64) as i32)
    }
}

#[derive(Debug, Deserialize)]
struct PwnAdvertisement {
    name: Option<String>,
    pwnd_tot: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pwnagotchi {
    pub name: String,
    pub pwned: Option<u64>,
    pub channel: u8,
    pub rssi: i32,
}

/// What the caller should do after a frame: send these frames on the current
/// channel, and stop capturing if `stop` is set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub tx: Vec<Vec<u8>>,
    pub stop: bool,
}

impl Outcome {
    fn transmit(frame: Vec<u8>) -> Outcome {
        Outcome {
            tx: vec![frame],
            stop: false,
        }
    }

    fn stop() -> Outcome {
        Outcome {
            tx: Vec::new(),
            stop: true,
        }
    }
}

struct DeauthWindow {
    started: Instant,
    count: u32,
    warned: bool,
}

pub struct Sniffer {
    mode: SniffMode,
    settings: SnifferSettings,
    pub status_log: MessageLog,
    pub counters: Counters,
    pub channels: BTreeMap<u8, ChannelStats>,
    pub access_points: WiFiDeviceList<AccessPoint>,
    pub stations: WiFiDeviceList<Station>,
    pub handshakes: HandshakeStorage,
    pub wps: WpsStore,
    pub pineap: PineApDetector,
    pub pwnagotchis: Vec<Pwnagotchi>,
    pub pcap: Option<PcapLogger>,
    pub wardrive: Option<WardriveLogger>,
    gps: SharedFix,
    deauth_window: Option<DeauthWindow>,
    full_warned: HashSet<&'static str>,
    // Only listed APs are inserted, so this is bounded by the AP list.
    essid_logged: HashSet<MacAddress>,
}

impl Sniffer {
    pub fn new(
        mode: SniffMode,
        settings: SnifferSettings,
        status_log: MessageLog,
        gps: SharedFix,
    ) -> Sniffer {
        Sniffer {
            mode,
            access_points: WiFiDeviceList::with_capacity(settings.max_access_points),
            stations: WiFiDeviceList::with_capacity(settings.max_stations),
            handshakes: HandshakeStorage::with_capacity(settings.max_handshakes),
            wps: WpsStore::new(settings.wps_capacity),
            pineap: PineApDetector::new(settings.pineap),
            settings,
            status_log,
            counters: Counters::default(),
            channels: BTreeMap::new(),
            pwnagotchis: Vec::new(),
            pcap: None,
            wardrive: None,
            gps,
            deauth_window: None,
            full_warned: HashSet::new(),
            essid_logged: HashSet::new(),
        }
    }

    pub fn with_pcap(mut self, pcap: PcapLogger) -> Sniffer {
        self.pcap = Some(pcap);
        self
    }

    pub fn with_wardrive(mut self, wardrive: WardriveLogger) -> Sniffer {
        self.wardrive = Some(wardrive);
        self
    }

    pub fn mode(&self) -> SniffMode {
        self.mode
    }

    pub fn log(&mut self, message_type: MessageType, content: String) {
        self.status_log
            .add_message(StatusMessage::new(message_type, content));
    }

    pub fn process(&mut self, rx: &RxFrame) -> Outcome {
        self.process_at(rx, Instant::now())
    }

    pub fn process_at(&mut self, rx: &RxFrame, now: Instant) -> Outcome {
        self.counters.frame_count += 1;
        let stats = self.channels.entry(rx.channel).or_default();
        stats.frames += 1;
        stats.rssi_total += rx.rssi as i64;

        let Some(&byte0) = rx.payload.first() else {
            self.counters.error_count += 1;
            return Outcome::default();
        };
        let kind = FrameKind::of(byte0);

        // Raw capture keeps control frames shorter than a management header.
        if self.mode == SniffMode::Raw {
            self.count_kind(kind, rx.channel);
            let result = self.log_frame(rx).map(|_| Outcome::default());
            return self.settle(result);
        }

        let frame = match Frame::parse(&rx.payload) {
            Ok(frame) => frame,
            Err(_) => {
                self.counters.error_count += 1;
                return Outcome::default();
            }
        };
        self.count_kind(kind, rx.channel);

        let result = match self.mode {
            SniffMode::Raw => self.log_frame(rx).map(|_| Outcome::default()),
            SniffMode::Probe => self.handle_probe(&frame, rx),
            SniffMode::Beacon => self.handle_beacon(&frame, rx),
            SniffMode::Deauth => self.handle_deauth(&frame, rx, now),
            SniffMode::Eapol => self.handle_eapol(&frame, rx),
            SniffMode::Pwn => self.handle_pwn(&frame, rx),
            SniffMode::Wps => self.handle_wps(&frame, rx),
            SniffMode::Pineap => self.handle_pineap(&frame, rx, now),
            SniffMode::Stations => self.handle_stations(&frame, rx),
            SniffMode::Aps => self.handle_aps(&frame, rx),
            SniffMode::Wardrive => self.handle_wardrive(&frame, rx),
        };
        self.settle(result)
    }

    fn settle(&mut self, result: Result<Outcome, String>) -> Outcome {
        match result {
            Ok(outcome) => {
                self.counters.tx_requested += outcome.tx.len() as u64;
                outcome
            }
            Err(error) => {
                self.counters.error_count += 1;
                self.log(MessageType::Error, error);
                Outcome::default()
            }
        }
    }

    fn count_kind(&mut self, kind: FrameKind, channel: u8) {
        let stats = self.channels.entry(channel).or_default();
        match kind {
            FrameKind::Control(_) => self.counters.control += 1,
            FrameKind::Data(_) => {
                self.counters.data += 1;
                stats.data += 1;
            }
            FrameKind::Extension(_) => {}
            _ => self.counters.management += 1,
        }
        match kind {
            FrameKind::Beacon => {
                self.counters.beacons += 1;
                stats.beacons += 1;
            }
            FrameKind::ProbeRequest => self.counters.probe_requests += 1,
            FrameKind::ProbeResponse => self.counters.probe_responses += 1,
            FrameKind::Deauthentication | FrameKind::Disassociation => {
                self.counters.deauths += 1;
                stats.deauths += 1;
            }
            _ => {}
        }
    }

    /// Element list of a frame; a malformed one counts as an error.
    fn station_info(&mut self, frame: &Frame) -> Option<StationInfo> {
        match frame.station_info() {
            Ok(info) => Some(info),
            Err(_) => {
                self.counters.error_count += 1;
                None
            }
        }
    }

    fn log_frame(&mut self, rx: &RxFrame) -> Result<(), String> {
        if let Some(pcap) = self.pcap.as_mut() {
            pcap.write_packet(&rx.payload, rx.timestamp)
                .map_err(|e| format!("PCAP write failed: {e}"))?;
            self.counters.logged += 1;
        }
        Ok(())
    }

    /// Adds or refreshes the AP behind a beacon or probe response. Returns
    /// whether it is new and a copy of the merged entry.
    fn update_ap(
        &mut self,
        frame: &Frame,
        info: &StationInfo,
        rx: &RxFrame,
    ) -> Option<(bool, AccessPoint)> {
        let bssid = frame.header.bssid();
        if !bssid.is_real_device() {
            return None;
        }
        let encryption = Encryption::detect(info, frame.capability().unwrap_or(0));
        let mut seen = AccessPoint::new(
            bssid,
            info.ssid.clone(),
            info.channel.or(Some(rx.channel)),
            rx.rssi,
            encryption,
        );
        seen.wps = info.wps.is_some();

        let is_new = self.access_points.get(&bssid).is_none();
        if is_new && self.access_points.is_full() {
            self.warn_full("access points", self.settings.max_access_points);
            return None;
        }
        let ap = self.access_points.add_or_update_device(bssid, &seen)?;
        if frame.kind == FrameKind::Beacon {
            ap.beacon_count += 1;
        }
        let ap = ap.clone();
        if let Some(ssid) = ap.ssid.as_deref() {
            self.handshakes.set_essid(bssid, ssid);
        }
        Some((is_new, ap))
    }

    fn add_station(&mut self, station: Station) -> Option<bool> {
        let mac = station.mac_address;
        let is_new = self.stations.get(&mac).is_none();
        if self.stations.add_or_update_device(mac, &station).is_none() {
            self.warn_full("stations", self.settings.max_stations);
            return None;
        }
        Some(is_new)
    }

    /// One warning per table per session; later overflow is silent.
    fn warn_full(&mut self, table: &'static str, capacity: usize) {
        if self.full_warned.insert(table) {
            self.log(
                MessageType::Warning,
                format!("List of {table} full ({capacity}); ignoring new {table}"),
            );
        }
    }

    fn handle_probe(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if frame.kind != FrameKind::ProbeRequest {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        let client = frame.header.transmitter();
        let ssid = info.ssid.unwrap_or_default();
        if client.is_real_device() {
            let known = self
                .stations
                .get(&client)
                .map_or(false, |sta| sta.probes.contains(&ssid));
            let probe = Station::new(client, rx.rssi, None).with_probe(&ssid);
            if self.add_station(probe).is_some() && !known {
                let target: &str = if ssid.is_empty() { "<broadcast>" } else { &ssid };
                self.log(
                    MessageType::Info,
                    format!(
                        "Probe {client} -> {target} (ch {}, {} dBm)",
                        rx.channel, rx.rssi
                    ),
                );
            }
        }
        self.log_frame(rx)?;
        Ok(Outcome::default())
    }

    fn handle_beacon(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if frame.kind != FrameKind::Beacon {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        if let Some((true, ap)) = self.update_ap(frame, &info, rx) {
            self.log(
                MessageType::Info,
                format!(
                    "Beacon {} {} ch {} {} dBm",
                    ap.mac_address,
                    ap.ssid_or_hidden(),
                    ap.channel.unwrap_or(rx.channel),
                    rx.rssi
                ),
            );
        }
        self.log_frame(rx)?;
        Ok(Outcome::default())
    }

    fn handle_deauth(
        &mut self,
        frame: &Frame,
        rx: &RxFrame,
        now: Instant,
    ) -> Result<Outcome, String> {
        if !matches!(
            frame.kind,
            FrameKind::Deauthentication | FrameKind::Disassociation
        ) {
            return Ok(Outcome::default());
        }

        let window = self.settings.deauth_window;
        let threshold = self.settings.deauth_threshold;
        let state = self.deauth_window.get_or_insert(DeauthWindow {
            started: now,
            count: 0,
            warned: false,
        });
        if now.duration_since(state.started) >= window {
            *state = DeauthWindow {
                started: now,
                count: 0,
                warned: false,
            };
        }
        state.count += 1;
        let flood = state.count > threshold && !state.warned;
        if flood {
            state.warned = true;
        }
        let count = state.count;

        self.log(
            MessageType::Info,
            format!(
                "{} {} -> {} reason {} (ch {}, {} dBm)",
                frame.kind.name(),
                frame.header.transmitter(),
                frame.header.receiver(),
                frame.reason_code().unwrap_or(0),
                rx.channel,
                rx.rssi
            ),
        );
        if flood {
            self.log(
                MessageType::Priority,
                format!(
                    "Deauth flood on channel {}: {count} frames within {}ms",
                    rx.channel,
                    window.as_millis()
                ),
            );
        }
        self.log_frame(rx)?;
        Ok(Outcome::default())
    }

    fn handle_eapol(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if frame.kind == FrameKind::Beacon {
            let Some(info) = self.station_info(frame) else {
                return Ok(Outcome::default());
            };
            let Some((_, ap)) = self.update_ap(frame, &info, rx) else {
                return Ok(Outcome::default());
            };
            // One beacon per AP gives the capture its ESSID.
            if self.essid_logged.insert(ap.mac_address) {
                self.log_frame(rx)?;
            }
            if self.settings.eapol_deauth && ap.beacon_count % EAPOL_DEAUTH_EVERY == 0 {
                return Ok(Outcome::transmit(build_broadcast_deauth(&ap.mac_address)));
            }
            return Ok(Outcome::default());
        }

        if !frame.kind.is_data() {
            return Ok(Outcome::default());
        }
        let Some(offset) = eapol_offset(frame.raw) else {
            return Ok(Outcome::default());
        };
        let key = match EapolKey::parse(&frame.raw[offset..]) {
            Ok(key) => key,
            Err(_) => {
                self.counters.error_count += 1;
                return Ok(Outcome::default());
            }
        };
        let Some((ap, client)) = frame.station_pair() else {
            return Ok(Outcome::default());
        };

        self.counters.eapol_count += 1;
        self.channels.entry(rx.channel).or_default().eapol += 1;
        self.log_frame(rx)?;

        // Group key rekeys are not part of the pairwise handshake.
        if key.message().is_none() {
            return Ok(Outcome::default());
        }
        if self.handshakes.rejects(&ap, &client) {
            self.warn_full("handshakes", self.settings.max_handshakes);
            return Ok(Outcome::default());
        }
        let handshake = self.handshakes.add_key(ap, client, &key)?;
        let complete = handshake.complete();
        let essid = handshake.essid_to_string();
        let pmkid = handshake.has_pmkid();
        let message = key
            .message()
            .map_or("?".to_string(), |m| format!("{m:?}"));
        self.log(
            MessageType::Priority,
            format!(
                "EAPOL {message} {ap} <-> {client} ({essid}){}{}",
                if pmkid { " [PMKID]" } else { "" },
                if complete { " [M1+M2]" } else { "" }
            ),
        );
        Ok(Outcome::default())
    }

    fn handle_pwn(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if frame.kind != FrameKind::Beacon || frame.header.transmitter() != PWNAGOTCHI_MAC {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        let advert = if info.pwnagotchi.is_empty() {
            info.ssid.unwrap_or_default().into_bytes()
        } else {
            info.pwnagotchi
        };

        match serde_json::from_slice::<PwnAdvertisement>(&advert) {
            Ok(parsed) => {
                let name = parsed.name.unwrap_or_else(|| "<unnamed>".to_string());
                let seen = Pwnagotchi {
                    name: name.clone(),
                    pwned: parsed.pwnd_tot,
                    channel: rx.channel,
                    rssi: rx.rssi,
                };
                match self.pwnagotchis.iter_mut().find(|p| p.name == name) {
                    Some(known) => *known = seen,
                    None => {
                        self.pwnagotchis.push(seen);
                        let pwned = parsed
                            .pwnd_tot
                            .map_or("?".to_string(), |n| n.to_string());
                        self.log(
                            MessageType::Priority,
                            format!(
                                "Pwnagotchi {name} pwnd: {pwned} (ch {}, {} dBm)",
                                rx.channel, rx.rssi
                            ),
                        );
                    }
                }
            }
            Err(e) => self.log(
                MessageType::Warning,
                format!("Could not parse Pwnagotchi advertisement: {e}"),
            ),
        }
        self.log_frame(rx)?;
        Ok(Outcome::default())
    }

    fn handle_wps(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if !matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        let Some(payload) = info.wps.as_deref() else {
            return Ok(Outcome::default());
        };
        let wps = match parse_wps(payload) {
            Ok(wps) => wps,
            Err(_) => {
                self.counters.error_count += 1;
                return Ok(Outcome::default());
            }
        };
        self.update_ap(frame, &info, rx);

        let network = WpsNetwork {
            bssid: frame.header.bssid(),
            ssid: info.ssid_or_hidden(),
            channel: info.channel.unwrap_or(rx.channel),
            rssi: rx.rssi,
            info: wps,
        };
        let summary = format!(
            "WPS {} {} ch {} v{} [{}]{}",
            network.bssid,
            network.ssid,
            network.channel,
            network.info.version_string(),
            network.info.methods().iter().join(", "),
            if network.info.locked { " LOCKED" } else { "" }
        );

        match self.wps.insert(network) {
            WpsInsert::Added => {
                self.log(MessageType::Priority, summary);
                self.log_frame(rx)?;
                Ok(Outcome::default())
            }
            WpsInsert::Filled => {
                self.log(MessageType::Priority, summary);
                self.log_frame(rx)?;
                let count = self.wps.len();
                self.log(
                    MessageType::Warning,
                    format!("WPS store full ({count} networks); stopping capture"),
                );
                Ok(Outcome::stop())
            }
            WpsInsert::Updated => Ok(Outcome::default()),
            WpsInsert::Full => Ok(Outcome::stop()),
        }
    }

    fn handle_pineap(
        &mut self,
        frame: &Frame,
        rx: &RxFrame,
        now: Instant,
    ) -> Result<Outcome, String> {
        if !matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        let Some(ssid) = info.ssid.as_deref() else {
            return Ok(Outcome::default());
        };
        let channel = info.channel.unwrap_or(rx.channel);
        let detection =
            self.pineap
                .observe(frame.header.bssid(), ssid, channel, rx.rssi, now);
        if let Some(detection) = detection {
            self.log(
                MessageType::Priority,
                format!(
                    "PineAP suspect {} ch {} {} dBm advertising {} SSIDs: {}",
                    detection.bssid,
                    detection.channel,
                    detection.rssi,
                    detection.ssids.len(),
                    detection.ssids.join(", ")
                ),
            );
            self.log_frame(rx)?;
        }
        Ok(Outcome::default())
    }

    fn handle_stations(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
            if let Some(info) = self.station_info(frame) {
                self.update_ap(frame, &info, rx);
            }
            return Ok(Outcome::default());
        }
        let Some((ap, client)) = frame.station_pair() else {
            return Ok(Outcome::default());
        };
        let paired_before = self
            .stations
            .get(&client)
            .map_or(false, |sta| sta.access_point == Some(ap));
        if self
            .add_station(Station::new(client, rx.rssi, Some(ap)))
            .is_none()
        {
            return Ok(Outcome::default());
        }
        if let Some(access_point) = self.access_points.get_device(&ap) {
            access_point.clients.insert(client);
        }
        if !paired_before {
            let ssid = self
                .access_points
                .get(&ap)
                .map_or("<unknown>".to_string(), |a| a.ssid_or_hidden().to_string());
            self.log(
                MessageType::Info,
                format!(
                    "Station {client} -> {ap} ({ssid}) ch {} {} dBm",
                    rx.channel, rx.rssi
                ),
            );
            self.log_frame(rx)?;
        }
        Ok(Outcome::default())
    }

    fn handle_aps(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if !matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        if let Some((true, ap)) = self.update_ap(frame, &info, rx) {
            self.log(
                MessageType::Info,
                format!(
                    "AP {} {} ch {} {} {} dBm",
                    ap.mac_address,
                    ap.ssid_or_hidden(),
                    ap.channel.unwrap_or(rx.channel),
                    ap.encryption,
                    rx.rssi
                ),
            );
            self.log_frame(rx)?;
        }
        Ok(Outcome::default())
    }

    fn handle_wardrive(&mut self, frame: &Frame, rx: &RxFrame) -> Result<Outcome, String> {
        if !matches!(frame.kind, FrameKind::Beacon | FrameKind::ProbeResponse) {
            return Ok(Outcome::default());
        }
        let Some(info) = self.station_info(frame) else {
            return Ok(Outcome::default());
        };
        let Some((_, ap)) = self.update_ap(frame, &info, rx) else {
            return Ok(Outcome::default());
        };
        let Some(wardrive) = self.wardrive.as_mut() else {
            return Ok(Outcome::default());
        };
        let sighting = Sighting::Wifi {
            bssid: ap.mac_address,
            ssid: ap.ssid.clone().unwrap_or_default(),
            encryption: ap.encryption,
            channel: ap.channel.unwrap_or(rx.channel),
            rssi: rx.rssi,
        };
        let written = wardrive
            .log(&sighting, self.gps.get())
            .map_err(|e| format!("Wardrive write failed: {e}"))?;
        if written {
            self.log(
                MessageType::Info,
                format!(
                    "Logged {} {} {}",
                    ap.mac_address,
                    ap.ssid_or_hidden(),
                    ap.encryption
                ),
            );
        }
        Ok(Outcome::default())
    }

    //////////////////////////////////////////////////////////////////////////
    // Main loop helpers

    /// Reports what the writer threads did since the last call.
    pub fn drain_writer_events(&mut self) {
        let mut events = Vec::new();
        if let Some(pcap) = &self.pcap {
            events.extend(pcap.poll_events().into_iter().map(|e| ("pcap", e)));
        }
        if let Some(wardrive) = &self.wardrive {
            events.extend(wardrive.poll_events().into_iter().map(|e| ("csv", e)));
        }
        for (name, event) in events {
            self.report_writer_event(name, event);
        }
    }

    fn report_writer_event(&mut self, name: &str, event: WriterEvent) {
        match event {
            WriterEvent::Flushed {
                delivery: Delivery::Fallback(reason),
                bytes,
            } => self.log(
                MessageType::Warning,
                format!("{name}: file write failed ({reason}); {bytes} bytes sent to serial"),
            ),
            WriterEvent::Flushed { .. } => {}
            WriterEvent::Failed(reason) => {
                self.log(MessageType::Error, format!("{name}: {reason}"))
            }
        }
    }

    /// Flushes and closes the capture logs. Returns the files written.
    pub fn close_logs(&mut self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut results: Vec<(&str, Result<Vec<WriterEvent>, CaptureError>)> = Vec::new();
        if let Some(pcap) = self.pcap.take() {
            files.extend(pcap.path().map(|p| p.to_path_buf()));
            results.push(("pcap", pcap.close()));
        }
        if let Some(wardrive) = self.wardrive.take() {
            files.extend(wardrive.path().map(|p| p.to_path_buf()));
            results.push(("csv", wardrive.close()));
        }
        for (name, result) in results {
            match result {
                Ok(events) => {
                    for event in events {
                        self.report_writer_event(name, event);
                    }
                }
                Err(e) => self.log(MessageType::Error, format!("{name}: close failed: {e}")),
            }
        }
        files
    }

    /// All scanned APs, or only the `select`ed entry of the scan listing.
    pub fn deauth_targets(&self, select: Option<usize>) -> Vec<DeauthTarget> {
        let to_target = |ap: &AccessPoint| DeauthTarget {
            bssid: ap.mac_address,
            channel: ap.channel,
        };
        match select {
            Some(index) => self
                .access_points
                .select(index)
                .map(to_target)
                .into_iter()
                .collect(),
            None => self
                .access_points
                .sorted_by_signal()
                .into_iter()
                .map(|(_, ap)| to_target(ap))
                .collect(),
        }
    }

    /// SSIDs of scanned APs, for cloning with beacon spam.
    pub fn ap_ssids(&self) -> Vec<String> {
        self.access_points
            .sorted_by_signal()
            .into_iter()
            .filter_map(|(_, ap)| ap.ssid.clone())
            .filter(|ssid| !ssid.is_empty())
            .unique()
            .collect()
    }

    //////////////////////////////////////////////////////////////////////////
    // Summaries

    pub fn ap_listing(&self) -> Vec<String> {
        self.access_points
            .sorted_by_signal()
            .into_iter()
            .enumerate()
            .map(|(index, (mac, ap))| {
                format!(
                    "[{index:>2}] {mac} {:<32} ch {:>2} {:>4} dBm {:<5} {}{}",
                    ap.ssid_or_hidden(),
                    ap.channel.map_or("?".to_string(), |c| c.to_string()),
                    ap.last_signal_strength,
                    ap.encryption,
                    oui_vendor(mac).unwrap_or_else(|| "Unknown".to_string()),
                    if ap.wps { " WPS" } else { "" }
                )
            })
            .collect()
    }

    pub fn station_listing(&self) -> Vec<String> {
        self.stations
            .sorted_by_signal()
            .into_iter()
            .map(|(mac, sta)| {
                let ap = sta
                    .access_point
                    .map_or("(unassociated)".to_string(), |ap| ap.to_string());
                let probes = if sta.probes.is_empty() {
                    String::new()
                } else {
                    format!(" probes: {}", sta.probes.join(", "))
                };
                format!("{mac} -> {ap} {} dBm{probes}", sta.last_signal_strength)
            })
            .collect()
    }

    pub fn wps_listing(&self) -> Vec<String> {
        self.wps
            .networks()
            .iter()
            .map(|n| {
                format!(
                    "{} {:<32} ch {:>2} v{} {}{}{}",
                    n.bssid,
                    n.ssid,
                    n.channel,
                    n.info.version_string(),
                    n.info.device_name.as_deref().unwrap_or("-"),
                    if n.info.supports_pin() { " PIN" } else { "" },
                    if n.info.supports_push_button() { " PBC" } else { "" },
                )
            })
            .collect()
    }

    pub fn pineap_listing(&self) -> Vec<String> {
        self.pineap
            .detections()
            .iter()
            .map(|d| format!("{} ch {} SSIDs: {}", d.bssid, d.channel, d.ssids.join(", ")))
            .collect()
    }

    pub fn channel_report(&self) -> Vec<String> {
        self.channels
            .iter()
            .map(|(channel, stats)| {
                format!(
                    "ch {channel:>2}: {} frames, {} beacons, {} deauths, {} data, {} eapol, avg {} dBm",
                    stats.frames,
                    stats.beacons,
                    stats.deauths,
                    stats.data,
                    stats.eapol,
                    stats
                        .average_rssi()
                        .map_or("?".to_string(), |r| r.to_string())
                )
            })
            .collect()
    }
}
