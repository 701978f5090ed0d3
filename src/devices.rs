use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use mac_oui::Oui;

use crate::frame::{Encryption, MacAddress};

pub const MAX_STATIONS: usize = 50;
pub const MAX_ACCESS_POINTS: usize = 256;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub trait WiFiDeviceType {
    fn update(&mut self, newer: &Self);
    fn last_signal(&self) -> i32;
}

#[derive(Debug, Clone)]
pub struct AccessPoint {
    pub mac_address: MacAddress,
    pub ssid: Option<String>,
    pub channel: Option<u8>,
    pub last_signal_strength: i32,
    pub encryption: Encryption,
    pub beacon_count: u64,
    pub wps: bool,
    pub clients: BTreeSet<MacAddress>,
    pub first_seen: u64,
    pub last_recv: u64,
}

impl AccessPoint {
    pub fn new(
        mac_address: MacAddress,
        ssid: Option<String>,
        channel: Option<u8>,
        signal: i32,
        encryption: Encryption,
    ) -> AccessPoint {
        let now = now_secs();
        AccessPoint {
            mac_address,
            ssid,
            channel,
            last_signal_strength: signal,
            encryption,
            beacon_count: 0,
            wps: false,
            clients: BTreeSet::new(),
            first_seen: now,
            last_recv: now,
        }
    }

    pub fn ssid_or_hidden(&self) -> &str {
        match self.ssid.as_deref() {
            Some(ssid) if !ssid.is_empty() => ssid,
            _ => "<hidden>",
        }
    }
}

impl WiFiDeviceType for AccessPoint {
    fn update(&mut self, newer: &Self) {
        // A hidden beacon must not erase an SSID learned from a probe response.
        if let Some(ssid) = newer.ssid.as_ref().filter(|s| !s.is_empty()) {
            self.ssid = Some(ssid.clone());
        }
        if newer.channel.is_some() {
            self.channel = newer.channel;
        }
        if newer.last_signal_strength != 0 {
            self.last_signal_strength = newer.last_signal_strength;
        }
        self.encryption = newer.encryption;
        self.wps |= newer.wps;
        self.clients.extend(newer.clients.iter().copied());
        self.last_recv = newer.last_recv;
    }

    fn last_signal(&self) -> i32 {
        self.last_signal_strength
    }
}

#[derive(Debug, Clone)]
pub struct Station {
    pub mac_address: MacAddress,
    pub last_signal_strength: i32,
    pub access_point: Option<MacAddress>,
    pub probes: Vec<String>,
    pub last_recv: u64,
}

impl Station {
    pub fn new(mac_address: MacAddress, signal: i32, access_point: Option<MacAddress>) -> Station {
        Station {
            mac_address,
            last_signal_strength: signal,
            access_point,
            probes: Vec::new(),
            last_recv: now_secs(),
        }
    }

    pub fn with_probe(mut self, ssid: &str) -> Station {
        if !ssid.is_empty() {
            self.probes.push(ssid.to_string());
        }
        self
    }
}

impl WiFiDeviceType for Station {
    fn update(&mut self, newer: &Self) {
        if newer.access_point.is_some() {
            self.access_point = newer.access_point;
        }
        if newer.last_signal_strength != 0 {
            self.last_signal_strength = newer.last_signal_strength;
        }
        for probe in &newer.probes {
            if !self.probes.contains(probe) {
                self.probes.push(probe.clone());
            }
        }
        self.last_recv = newer.last_recv;
    }

    fn last_signal(&self) -> i32 {
        self.last_signal_strength
    }
}

/// Devices keyed by MAC, optionally capped.
#[derive(Debug, Clone)]
pub struct WiFiDeviceList<T: WiFiDeviceType> {
    devices: HashMap<MacAddress, T>,
    capacity: Option<usize>,
}

impl<T: WiFiDeviceType + Clone> WiFiDeviceList<T> {
    pub fn new() -> Self {
        WiFiDeviceList {
            devices: HashMap::new(),
            capacity: None,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WiFiDeviceList {
            devices: HashMap::new(),
            capacity: Some(capacity),
        }
    }

    /// Inserts or merges. `None` when the list is full and `mac` is new.
    pub fn add_or_update_device(&mut self, mac: MacAddress, new_device: &T) -> Option<&mut T> {
        if !self.devices.contains_key(&mac) && self.is_full() {
            return None;
        }
        let device = self
            .devices
            .entry(mac)
            .and_modify(|existing| existing.update(new_device))
            .or_insert_with(|| new_device.clone());
        Some(device)
    }

    pub fn is_full(&self) -> bool {
        self.capacity.map_or(false, |cap| self.devices.len() >= cap)
    }

    pub fn get_device(&mut self, mac: &MacAddress) -> Option<&mut T> {
        self.devices.get_mut(mac)
    }

    pub fn get(&self, mac: &MacAddress) -> Option<&T> {
        self.devices.get(mac)
    }

    pub fn remove_device(&mut self, mac: &MacAddress) -> Option<T> {
        self.devices.remove(mac)
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn get_devices(&self) -> &HashMap<MacAddress, T> {
        &self.devices
    }

    /// Strongest first, MAC as tiebreak so the order is stable.
    pub fn sorted_by_signal(&self) -> Vec<(&MacAddress, &T)> {
        self.devices
            .iter()
            .sorted_by(|(ma, a), (mb, b)| {
                b.last_signal()
                    .cmp(&a.last_signal())
                    .then_with(|| ma.cmp(mb))
            })
            .collect()
    }
}

impl<T: WiFiDeviceType + Clone> Default for WiFiDeviceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl WiFiDeviceList<AccessPoint> {
    pub fn get_device_by_ssid(&self, ssid: &str) -> Option<&AccessPoint> {
        self.devices
            .values()
            .find(|ap| ap.ssid.as_deref() == Some(ssid))
    }

    /// Entry `index` of the listing order used by [`Self::sorted_by_signal`].
    pub fn select(&self, index: usize) -> Option<&AccessPoint> {
        self.sorted_by_signal().get(index).map(|(_, ap)| *ap)
    }
}

static OUI_DB: OnceLock<Option<Oui>> = OnceLock::new();

/// Manufacturer for the OUI of `mac`, from the bundled IEEE database.
pub fn oui_vendor(mac: &MacAddress) -> Option<String> {
    if mac.is_locally_administered() {
        return None;
    }
    let db = OUI_DB.get_or_init(|| Oui::default().ok()).as_ref()?;
    match db.lookup_by_mac(&mac.to_string()) {
        Ok(Some(entry)) => Some(entry.company_name.clone()),
        _ => None,
    }
}
