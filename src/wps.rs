use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::frame::{FrameError, MacAddress};

pub const MAX_WPS_NETWORKS: usize = 32;

const ATTR_SELECTED_REGISTRAR: u16 = 0x1041;
const ATTR_CONFIG_METHODS: u16 = 0x1008;
const ATTR_DEVICE_NAME: u16 = 0x1011;
const ATTR_MANUFACTURER: u16 = 0x1021;
const ATTR_MODEL_NAME: u16 = 0x1023;
const ATTR_STATE: u16 = 0x1044;
const ATTR_VENDOR_EXTENSION: u16 = 0x1049;
const ATTR_VERSION: u16 = 0x104A;
const ATTR_AP_SETUP_LOCKED: u16 = 0x1057;

const WFA_VENDOR_ID: [u8; 3] = [0x00, 0x37, 0x2A];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
pub enum ConfigMethod {
    Usba,
    Ethernet,
    Label,
    Display,
    ExternalNfc,
    InternalNfc,
    NfcInterface,
    PushButton,
    Keypad,
    VirtualPushButton,
    PhysicalPushButton,
    VirtualDisplay,
    PhysicalDisplay,
}

impl ConfigMethod {
    pub fn bit(&self) -> u16 {
        match self {
            ConfigMethod::Usba => 0x0001,
            ConfigMethod::Ethernet => 0x0002,
            ConfigMethod::Label => 0x0004,
            ConfigMethod::Display => 0x0008,
            ConfigMethod::ExternalNfc => 0x0010,
            ConfigMethod::InternalNfc => 0x0020,
            ConfigMethod::NfcInterface => 0x0040,
            ConfigMethod::PushButton => 0x0080,
            ConfigMethod::Keypad => 0x0100,
            ConfigMethod::VirtualPushButton => 0x0200,
            ConfigMethod::PhysicalPushButton => 0x0400,
            ConfigMethod::VirtualDisplay => 0x2000,
            ConfigMethod::PhysicalDisplay => 0x4000,
        }
    }

    pub fn decode(bits: u16) -> Vec<ConfigMethod> {
        ConfigMethod::iter().filter(|m| bits & m.bit() != 0).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpsState {
    NotConfigured,
    Configured,
    Unknown(u8),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WpsInfo {
    pub version: Option<u8>,
    pub version2: Option<u8>,
    pub state: Option<WpsState>,
    pub config_methods: Option<u16>,
    pub locked: bool,
    pub selected_registrar: bool,
    pub device_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
}

impl WpsInfo {
    pub fn methods(&self) -> Vec<ConfigMethod> {
        self.config_methods.map(ConfigMethod::decode).unwrap_or_default()
    }

    pub fn supports_pin(&self) -> bool {
        self.methods().iter().any(|m| {
            matches!(
                m,
                ConfigMethod::Label
                    | ConfigMethod::Display
                    | ConfigMethod::Keypad
                    | ConfigMethod::VirtualDisplay
                    | ConfigMethod::PhysicalDisplay
            )
        })
    }

    pub fn supports_push_button(&self) -> bool {
        self.methods().iter().any(|m| {
            matches!(
                m,
                ConfigMethod::PushButton
                    | ConfigMethod::VirtualPushButton
                    | ConfigMethod::PhysicalPushButton
            )
        })
    }

    pub fn is_configured(&self) -> bool {
        self.state == Some(WpsState::Configured)
    }

    /// WPS 2.0 when the WFA extension says so, otherwise the version field.
    pub fn version_string(&self) -> String {
        match (self.version2, self.version) {
            (Some(v), _) | (None, Some(v)) => format!("{}.{}", v >> 4, v & 0x0F),
            (None, None) => "?".to_string(),
        }
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Walks the big-endian TLV attributes of a WPS element payload.
pub fn parse_wps(payload: &[u8]) -> Result<WpsInfo, FrameError> {
    let mut info = WpsInfo::default();
    let mut pos = 0;
    while pos < payload.len() {
        let Some(head) = payload.get(pos..pos + 4) else {
            return Err(FrameError::Truncated {
                needed: 4,
                have: payload.len() - pos,
            });
        };
        let attr = BigEndian::read_u16(&head[0..2]);
        let len = BigEndian::read_u16(&head[2..4]) as usize;
        let value = payload
            .get(pos + 4..pos + 4 + len)
            .ok_or(FrameError::MalformedWps(attr))?;
        pos += 4 + len;

        match attr {
            ATTR_VERSION => info.version = value.first().copied(),
            ATTR_STATE => {
                info.state = value.first().map(|s| match s {
                    1 => WpsState::NotConfigured,
                    2 => WpsState::Configured,
                    other => WpsState::Unknown(*other),
                })
            }
            ATTR_CONFIG_METHODS if len == 2 => {
                info.config_methods = Some(BigEndian::read_u16(value))
            }
            ATTR_AP_SETUP_LOCKED => info.locked = value.first().map_or(false, |&b| b != 0),
            ATTR_SELECTED_REGISTRAR => {
                info.selected_registrar = value.first().map_or(false, |&b| b != 0)
            }
            ATTR_DEVICE_NAME => info.device_name = Some(text(value)),
            ATTR_MANUFACTURER => info.manufacturer = Some(text(value)),
            ATTR_MODEL_NAME => info.model_name = Some(text(value)),
            ATTR_VENDOR_EXTENSION if len >= 3 && value[..3] == WFA_VENDOR_ID => {
                let mut sub = 3;
                while sub + 2 <= value.len() {
                    let id = value[sub];
                    let sub_len = value[sub + 1] as usize;
                    let data = value
                        .get(sub + 2..sub + 2 + sub_len)
                        .ok_or(FrameError::MalformedWps(attr))?;
                    if id == 0x00 {
                        info.version2 = data.first().copied();
                    }
                    sub += 2 + sub_len;
                }
            }
            _ => {}
        }
    }
    Ok(info)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WpsNetwork {
    pub bssid: MacAddress,
    pub ssid: String,
    pub channel: u8,
    pub rssi: i32,
    pub info: WpsInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WpsInsert {
    Added,
    /// Added, and the store is now at capacity.
    Filled,
    Updated,
    /// Store already full; the network was dropped.
    Full,
}

/// Discovered WPS networks, unique by BSSID and bounded.
pub struct WpsStore {
    networks: Vec<WpsNetwork>,
    index: HashMap<MacAddress, usize>,
    capacity: usize,
}

impl WpsStore {
    pub fn new(capacity: usize) -> WpsStore {
        WpsStore {
            networks: Vec::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    pub fn insert(&mut self, network: WpsNetwork) -> WpsInsert {
        if let Some(&at) = self.index.get(&network.bssid) {
            self.networks[at] = network;
            return WpsInsert::Updated;
        }
        if self.is_full() {
            return WpsInsert::Full;
        }
        self.index.insert(network.bssid, self.networks.len());
        self.networks.push(network);
        if self.is_full() {
            WpsInsert::Filled
        } else {
            WpsInsert::Added
        }
    }

    pub fn is_full(&self) -> bool {
        self.networks.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn networks(&self) -> &[WpsNetwork] {
        &self.networks
    }
}

/// Checksum digit for the first seven digits of a WPS PIN.
pub fn wps_pin_checksum(pin: u32) -> u8 {
    let mut pin = pin;
    let mut acc = 0u32;
    while pin != 0 {
        acc += 3 * (pin % 10);
        pin /= 10;
        acc += pin % 10;
        pin /= 10;
    }
    ((10 - acc % 10) % 10) as u8
}

pub fn wps_pin_valid(pin: u32) -> bool {
    wps_pin_checksum(pin / 10) as u32 == pin % 10
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn attr(kind: u16, value: &[u8]) -> Vec<u8> {
        let mut out = kind.to_be_bytes().to_vec();
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value);
        out
    }

    pub(crate) fn sample_payload() -> Vec<u8> {
        let mut payload = attr(ATTR_VERSION, &[0x10]);
        payload.extend(attr(ATTR_STATE, &[0x02]));
        payload.extend(attr(ATTR_AP_SETUP_LOCKED, &[0x01]));
        payload.extend(attr(ATTR_CONFIG_METHODS, &[0x00, 0x8C]));
        payload.extend(attr(ATTR_DEVICE_NAME, b"RT-AC68U\0"));
        payload.extend(attr(ATTR_MANUFACTURER, b"ASUSTeK"));
        payload.extend(attr(ATTR_VENDOR_EXTENSION, &[0x00, 0x37, 0x2A, 0x00, 0x01, 0x20]));
        payload
    }

    #[test]
    fn parses_attributes() {
        let info = parse_wps(&sample_payload()).unwrap();
        assert_eq!(info.version, Some(0x10));
        assert_eq!(info.version2, Some(0x20));
        assert_eq!(info.version_string(), "2.0");
        assert!(info.is_configured());
        assert!(info.locked);
        assert_eq!(info.device_name.as_deref(), Some("RT-AC68U"));
        assert_eq!(info.manufacturer.as_deref(), Some("ASUSTeK"));
        assert_eq!(
            info.methods(),
            vec![ConfigMethod::Label, ConfigMethod::Display, ConfigMethod::PushButton]
        );
        assert!(info.supports_pin());
        assert!(info.supports_push_button());
    }

    #[test]
    fn overlong_attribute_is_malformed() {
        let mut payload = attr(ATTR_VERSION, &[0x10]);
        payload.extend_from_slice(&[0x10, 0x11, 0x00, 0x20, b'x']);
        assert_eq!(parse_wps(&payload), Err(FrameError::MalformedWps(0x1011)));
        assert!(matches!(
            parse_wps(&[0x10, 0x4A, 0x00]),
            Err(FrameError::Truncated { .. })
        ));
        assert_eq!(parse_wps(&[]), Ok(WpsInfo::default()));
    }

    #[test]
    fn store_dedupes_and_fills() {
        let mut store = WpsStore::new(2);
        let network = |last: u8, ssid: &str| WpsNetwork {
            bssid: MacAddress([0x02, 0, 0, 0, 0, last]),
            ssid: ssid.to_string(),
            channel: 1,
            rssi: -50,
            info: WpsInfo::default(),
        };
        assert_eq!(store.insert(network(1, "a")), WpsInsert::Added);
        assert_eq!(store.insert(network(1, "a2")), WpsInsert::Updated);
        assert_eq!(store.networks()[0].ssid, "a2");
        assert_eq!(store.insert(network(2, "b")), WpsInsert::Filled);
        assert_eq!(store.insert(network(3, "c")), WpsInsert::Full);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn pin_checksum() {
        assert_eq!(wps_pin_checksum(1234567), 0);
        assert!(wps_pin_valid(12345670));
        assert!(!wps_pin_valid(12345671));
        for pin7 in [0u32, 1, 9_999_999, 4_785_123] {
            assert!(wps_pin_valid(pin7 * 10 + wps_pin_checksum(pin7) as u32));
        }
    }
}
