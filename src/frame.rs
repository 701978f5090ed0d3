//! Zero-copy views over raw 802.11 frames.
//!
//! Everything in here reads from the byte slice handed over by the radio and
//! checks bounds before every access. A frame that lies about its own layout
//! produces a [`FrameError`]; nothing else is affected.

use std::fmt;
use std::str::FromStr;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use libwifi::parsers::parse_eapol_key;
use rand::{thread_rng, Rng};
use thiserror::Error;

pub const MGMT_HEADER_LEN: usize = 24;
pub const MAX_SSID_LEN: usize = 32;

pub const IE_SSID: u8 = 0;
pub const IE_DS_PARAMS: u8 = 3;
pub const IE_RSN: u8 = 48;
pub const IE_VENDOR: u8 = 221;
pub const IE_PWNAGOTCHI: u8 = 222;

const OUI_MICROSOFT: [u8; 3] = [0x00, 0x50, 0xF2];
const OUI_IEEE: [u8; 3] = [0x00, 0x0F, 0xAC];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("element {id} declares {declared} bytes but only {remaining} remain")]
    MalformedElement {
        id: u8,
        declared: usize,
        remaining: usize,
    },

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("not an EAPOL-Key frame")]
    NotEapolKey,

    #[error("bad EAPOL-Key: {0}")]
    Eapol(String),

    #[error("malformed WPS attribute {0:#06x}")]
    MalformedWps(u16),
}

fn need(raw: &[u8], needed: usize) -> Result<(), FrameError> {
    if raw.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            have: raw.len(),
        });
    }
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// MAC addresses

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn from_slice(bytes: &[u8]) -> Option<MacAddress> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddress(octets))
    }

    /// Random locally administered unicast address.
    pub fn random() -> MacAddress {
        let mut octets: [u8; 6] = thread_rng().gen();
        octets[0] &= 0xFE;
        octets[0] |= 0x02;
        MacAddress(octets)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == MacAddress::BROADCAST
    }

    pub fn is_groupcast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }

    pub fn is_zero(&self) -> bool {
        *self == MacAddress::ZERO
    }

    pub fn is_real_device(&self) -> bool {
        !self.is_broadcast() && !self.is_groupcast() && !self.is_zero()
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 == 0x02
    }

    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddress {
    type Err = FrameError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-..`, space separated, or bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | ' '))
            .collect();
        if digits.len() != 12 {
            return Err(FrameError::InvalidMac(s.to_string()));
        }
        let bytes = hex::decode(&digits).map_err(|_| FrameError::InvalidMac(s.to_string()))?;
        MacAddress::from_slice(&bytes).ok_or_else(|| FrameError::InvalidMac(s.to_string()))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Frame control and classification

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub byte0: u8,
    pub flags: u8,
}

impl FrameControl {
    pub fn frame_type(&self) -> u8 {
        (self.byte0 >> 2) & 0x03
    }

    pub fn subtype(&self) -> u8 {
        self.byte0 >> 4
    }

    pub fn to_ds(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn from_ds(&self) -> bool {
        self.flags & 0x02 != 0
    }

    pub fn retry(&self) -> bool {
        self.flags & 0x08 != 0
    }

    pub fn pwr_mgmt(&self) -> bool {
        self.flags & 0x10 != 0
    }

    pub fn protected(&self) -> bool {
        self.flags & 0x40 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    AssociationRequest,
    AssociationResponse,
    ReassociationRequest,
    ReassociationResponse,
    ProbeRequest,
    ProbeResponse,
    Beacon,
    Disassociation,
    Authentication,
    Deauthentication,
    Action,
    OtherManagement(u8),
    Control(u8),
    Data(u8),
    Extension(u8),
}

impl FrameKind {
    /// Classify from the first frame-control byte alone.
    pub const fn of(byte0: u8) -> FrameKind {
        let masked = byte0 & 0xFC;
        match masked {
            0x00 => FrameKind::AssociationRequest,
            0x10 => FrameKind::AssociationResponse,
            0x20 => FrameKind::ReassociationRequest,
            0x30 => FrameKind::ReassociationResponse,
            0x40 => FrameKind::ProbeRequest,
            0x50 => FrameKind::ProbeResponse,
            0x80 => FrameKind::Beacon,
            0xA0 => FrameKind::Disassociation,
            0xB0 => FrameKind::Authentication,
            0xC0 => FrameKind::Deauthentication,
            0xD0 => FrameKind::Action,
            _ => match (masked >> 2) & 0x03 {
                0 => FrameKind::OtherManagement(masked),
                1 => FrameKind::Control(masked),
                2 => FrameKind::Data(masked),
                _ => FrameKind::Extension(masked),
            },
        }
    }

    pub fn is_management(&self) -> bool {
        !matches!(
            self,
            FrameKind::Control(_) | FrameKind::Data(_) | FrameKind::Extension(_)
        )
    }

    pub fn is_data(&self) -> bool {
        matches!(self, FrameKind::Data(_))
    }

    /// QoS data subtypes carry a two byte QoS control field after the header.
    pub fn is_qos_data(&self) -> bool {
        matches!(self, FrameKind::Data(b) if b & 0x80 != 0)
    }

    /// Offset of the first information element, for frames that carry them.
    pub fn ie_offset(&self) -> Option<usize> {
        match self {
            FrameKind::Beacon | FrameKind::ProbeResponse => Some(36),
            FrameKind::ProbeRequest => Some(24),
            FrameKind::AssociationRequest => Some(28),
            FrameKind::ReassociationRequest => Some(34),
            FrameKind::AssociationResponse | FrameKind::ReassociationResponse => Some(30),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::AssociationRequest => "assoc-req",
            FrameKind::AssociationResponse => "assoc-resp",
            FrameKind::ReassociationRequest => "reassoc-req",
            FrameKind::ReassociationResponse => "reassoc-resp",
            FrameKind::ProbeRequest => "probe-req",
            FrameKind::ProbeResponse => "probe-resp",
            FrameKind::Beacon => "beacon",
            FrameKind::Disassociation => "disassoc",
            FrameKind::Authentication => "auth",
            FrameKind::Deauthentication => "deauth",
            FrameKind::Action => "action",
            FrameKind::OtherManagement(_) => "mgmt",
            FrameKind::Control(_) => "control",
            FrameKind::Data(_) => "data",
            FrameKind::Extension(_) => "extension",
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Header overlay

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtHeader {
    pub frame_control: FrameControl,
    pub duration: u16,
    pub addr1: MacAddress,
    pub addr2: MacAddress,
    pub addr3: MacAddress,
    pub sequence_control: u16,
}

impl MgmtHeader {
    pub fn parse(raw: &[u8]) -> Result<MgmtHeader, FrameError> {
        need(raw, MGMT_HEADER_LEN)?;
        Ok(MgmtHeader {
            frame_control: FrameControl {
                byte0: raw[0],
                flags: raw[1],
            },
            duration: LittleEndian::read_u16(&raw[2..4]),
            addr1: MacAddress(raw[4..10].try_into().unwrap_or_default()),
            addr2: MacAddress(raw[10..16].try_into().unwrap_or_default()),
            addr3: MacAddress(raw[16..22].try_into().unwrap_or_default()),
            sequence_control: LittleEndian::read_u16(&raw[22..24]),
        })
    }

    pub fn receiver(&self) -> MacAddress {
        self.addr1
    }

    pub fn transmitter(&self) -> MacAddress {
        self.addr2
    }

    pub fn bssid(&self) -> MacAddress {
        self.addr3
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_control >> 4
    }
}

/// A classified frame borrowing the radio buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: MgmtHeader,
    pub kind: FrameKind,
    pub raw: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Frame<'a>, FrameError> {
        let header = MgmtHeader::parse(raw)?;
        Ok(Frame {
            header,
            kind: FrameKind::of(raw[0]),
            raw,
        })
    }

    pub fn body(&self) -> &'a [u8] {
        &self.raw[MGMT_HEADER_LEN..]
    }

    /// Raw information element area, or `None` if this kind carries none.
    pub fn element_data(&self) -> Result<Option<&'a [u8]>, FrameError> {
        match self.kind.ie_offset() {
            Some(offset) => {
                need(self.raw, offset)?;
                Ok(Some(&self.raw[offset..]))
            }
            None => Ok(None),
        }
    }

    pub fn station_info(&self) -> Result<StationInfo, FrameError> {
        match self.element_data()? {
            Some(data) => StationInfo::parse(data),
            None => Ok(StationInfo::default()),
        }
    }

    /// Capability field of beacons and probe responses.
    pub fn capability(&self) -> Option<u16> {
        match self.kind {
            FrameKind::Beacon | FrameKind::ProbeResponse => {
                self.raw.get(34..36).map(LittleEndian::read_u16)
            }
            FrameKind::AssociationRequest | FrameKind::ReassociationRequest => {
                self.raw.get(24..26).map(LittleEndian::read_u16)
            }
            _ => None,
        }
    }

    pub fn beacon_interval(&self) -> Option<u16> {
        match self.kind {
            FrameKind::Beacon | FrameKind::ProbeResponse => {
                self.raw.get(32..34).map(LittleEndian::read_u16)
            }
            _ => None,
        }
    }

    /// Reason code of deauthentication and disassociation frames.
    pub fn reason_code(&self) -> Option<u16> {
        match self.kind {
            FrameKind::Deauthentication | FrameKind::Disassociation => {
                self.raw.get(24..26).map(LittleEndian::read_u16)
            }
            _ => None,
        }
    }

    /// `(access point, station)` for data frames, resolved from the DS bits.
    pub fn station_pair(&self) -> Option<(MacAddress, MacAddress)> {
        if !self.kind.is_data() {
            return None;
        }
        let fc = self.header.frame_control;
        let (ap, sta) = match (fc.to_ds(), fc.from_ds()) {
            (true, false) => (self.header.addr1, self.header.addr2),
            (false, true) => (self.header.addr2, self.header.addr1),
            (false, false) => (self.header.addr3, self.header.addr2),
            // WDS links have no station side.
            (true, true) => return None,
        };
        if ap.is_real_device() && sta.is_real_device() && ap != sta {
            Some((ap, sta))
        } else {
            None
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Information elements

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// Walks a TLV element list. Yields one error and stops at the first element
/// whose declared length runs past the end of the buffer.
pub struct Elements<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

pub fn elements(data: &[u8]) -> Elements<'_> {
    Elements {
        data,
        pos: 0,
        done: false,
    }
}

impl<'a> Iterator for Elements<'a> {
    type Item = Result<Element<'a>, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        let remaining = self.data.len() - self.pos;
        if remaining < 2 {
            self.done = true;
            return Some(Err(FrameError::Truncated {
                needed: 2,
                have: remaining,
            }));
        }
        let id = self.data[self.pos];
        let declared = self.data[self.pos + 1] as usize;
        let start = self.pos + 2;
        if declared > self.data.len() - start {
            self.done = true;
            return Some(Err(FrameError::MalformedElement {
                id,
                declared,
                remaining: self.data.len() - start,
            }));
        }
        self.pos = start + declared;
        Some(Ok(Element {
            id,
            data: &self.data[start..start + declared],
        }))
    }
}

/// Strip NULs and decode lossily, capped at 32 bytes.
pub fn sanitize_ssid(raw: &[u8]) -> String {
    let capped = &raw[..raw.len().min(MAX_SSID_LEN)];
    String::from_utf8_lossy(capped).replace('\0', "")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationInfo {
    pub ssid: Option<String>,
    pub channel: Option<u8>,
    pub rsn: Option<Vec<u8>>,
    pub wpa: bool,
    /// Concatenated WPS attribute payload from every WPS vendor element.
    pub wps: Option<Vec<u8>>,
    /// Concatenated payload of element 222 fragments.
    pub pwnagotchi: Vec<u8>,
}

impl StationInfo {
    pub fn parse(data: &[u8]) -> Result<StationInfo, FrameError> {
        let mut info = StationInfo::default();
        for element in elements(data) {
            let element = element?;
            match element.id {
                IE_SSID => {
                    if info.ssid.is_none() {
                        info.ssid = Some(sanitize_ssid(element.data));
                    }
                }
                IE_DS_PARAMS => info.channel = element.data.first().copied(),
                IE_RSN => info.rsn = Some(element.data.to_vec()),
                IE_VENDOR if element.data.len() >= 4 => {
                    if element.data[..3] == OUI_MICROSOFT {
                        match element.data[3] {
                            0x01 => info.wpa = true,
                            0x04 => info
                                .wps
                                .get_or_insert_with(Vec::new)
                                .extend_from_slice(&element.data[4..]),
                            _ => {}
                        }
                    }
                }
                IE_PWNAGOTCHI => info.pwnagotchi.extend_from_slice(element.data),
                _ => {}
            }
        }
        Ok(info)
    }

    pub fn ssid_or_hidden(&self) -> String {
        match &self.ssid {
            Some(ssid) if !ssid.is_empty() => ssid.clone(),
            _ => "<hidden>".to_string(),
        }
    }
}

/// AKM suite types listed in an RSN element body. Empty on a short element.
pub fn rsn_akms(rsn: &[u8]) -> Vec<u8> {
    let mut akms = Vec::new();
    // version(2) + group cipher(4)
    let Some(count) = rsn.get(6..8).map(LittleEndian::read_u16) else {
        return akms;
    };
    let akm_count_at = 8 + count as usize * 4;
    let Some(akm_count) = rsn.get(akm_count_at..akm_count_at + 2).map(LittleEndian::read_u16)
    else {
        return akms;
    };
    let mut at = akm_count_at + 2;
    for _ in 0..akm_count {
        match rsn.get(at..at + 4) {
            Some(suite) if suite[..3] == OUI_IEEE => akms.push(suite[3]),
            Some(_) => {}
            None => break,
        }
        at += 4;
    }
    akms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::Display)]
pub enum Encryption {
    #[strum(serialize = "OPEN")]
    Open,
    #[strum(serialize = "WEP")]
    Wep,
    #[strum(serialize = "WPA")]
    Wpa,
    #[strum(serialize = "WPA2")]
    Wpa2,
    #[strum(serialize = "WPA3")]
    Wpa3,
}

impl Encryption {
    pub fn detect(info: &StationInfo, capability: u16) -> Encryption {
        if let Some(rsn) = &info.rsn {
            // SAE, FT-SAE, SAE-EXT, FT-SAE-EXT
            if rsn_akms(rsn).iter().any(|a| matches!(a, 8 | 9 | 24 | 25)) {
                return Encryption::Wpa3;
            }
            return Encryption::Wpa2;
        }
        if info.wpa {
            return Encryption::Wpa;
        }
        if capability & 0x0010 != 0 {
            return Encryption::Wep;
        }
        Encryption::Open
    }

    /// Capability string used by WiGLE's AuthMode column.
    pub fn wigle_auth_mode(&self) -> &'static str {
        match self {
            Encryption::Open => "[ESS]",
            Encryption::Wep => "[WEP][ESS]",
            Encryption::Wpa => "[WPA-PSK-TKIP][ESS]",
            Encryption::Wpa2 => "[WPA2-PSK-CCMP][ESS]",
            Encryption::Wpa3 => "[WPA3-SAE-CCMP][ESS]",
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// EAPOL

pub const ETHERTYPE_EAPOL: [u8; 2] = [0x88, 0x8E];

/// Start of the EAPOL PDU inside a data frame, if the LLC/SNAP ethertype at
/// offset 30 (plain data) or 32 (QoS data) is 88:8E.
pub fn eapol_offset(raw: &[u8]) -> Option<usize> {
    [30usize, 32]
        .into_iter()
        .find(|&at| raw.get(at..at + 2) == Some(&ETHERTYPE_EAPOL[..]))
        .map(|at| at + 2)
}

pub const KEY_INFO_PAIRWISE: u16 = 0x0008;
pub const KEY_INFO_INSTALL: u16 = 0x0040;
pub const KEY_INFO_ACK: u16 = 0x0080;
pub const KEY_INFO_MIC: u16 = 0x0100;
pub const KEY_INFO_SECURE: u16 = 0x0200;

const EAPOL_KEY_MIC: std::ops::Range<usize> = 81..97;
const EAPOL_KEY_DATA: usize = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyMessage {
    M1,
    M2,
    M3,
    M4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapolKey {
    pub version: u8,
    pub descriptor: u8,
    pub key_info: u16,
    pub replay_counter: u64,
    pub nonce: [u8; 32],
    pub mic: [u8; 16],
    pub key_data: Vec<u8>,
    /// The EAPOL PDU as declared by its length field.
    pub raw: Vec<u8>,
}

impl EapolKey {
    /// Field decoding is libwifi's; the PDU is first cut to its declared
    /// length so `raw` is exactly what the MIC covers.
    pub fn parse(pdu: &[u8]) -> Result<EapolKey, FrameError> {
        need(pdu, 4)?;
        if pdu[1] != 3 {
            return Err(FrameError::NotEapolKey);
        }
        let total = 4 + BigEndian::read_u16(&pdu[2..4]) as usize;
        need(pdu, total)?;
        let pdu = &pdu[..total];
        need(pdu, EAPOL_KEY_DATA)?;

        let key = parse_eapol_key(pdu).map_err(|e| FrameError::Eapol(e.to_string()))?;
        Ok(EapolKey {
            version: key.protocol_version,
            descriptor: key.descriptor_type,
            key_info: key.key_information,
            replay_counter: key.replay_counter,
            nonce: key.key_nonce,
            mic: key.key_mic,
            key_data: key.key_data,
            raw: pdu.to_vec(),
        })
    }

    /// Position in the four-way handshake. Group key messages yield `None`.
    pub fn message(&self) -> Option<KeyMessage> {
        let ki = self.key_info;
        if ki & KEY_INFO_PAIRWISE == 0 {
            return None;
        }
        let ack = ki & KEY_INFO_ACK != 0;
        let mic = ki & KEY_INFO_MIC != 0;
        let install = ki & KEY_INFO_INSTALL != 0;
        let secure = ki & KEY_INFO_SECURE != 0;
        match (ack, mic, install) {
            (true, false, _) => Some(KeyMessage::M1),
            (true, true, true) => Some(KeyMessage::M3),
            (false, true, false) if !secure => Some(KeyMessage::M2),
            (false, true, false) => Some(KeyMessage::M4),
            _ => None,
        }
    }

    /// PMKID KDE carried in an M1, if present and non-zero.
    pub fn pmkid(&self) -> Option<[u8; 16]> {
        for element in elements(&self.key_data) {
            let Ok(element) = element else {
                break;
            };
            if element.id == IE_VENDOR
                && element.data.len() >= 20
                && element.data[..3] == OUI_IEEE
                && element.data[3] == 0x04
            {
                let mut pmkid = [0u8; 16];
                pmkid.copy_from_slice(&element.data[4..20]);
                if pmkid.iter().any(|&b| b != 0) {
                    return Some(pmkid);
                }
            }
        }
        None
    }

    /// The PDU with its MIC field zeroed, as hashcat expects it.
    pub fn zeroed_mic_raw(&self) -> Vec<u8> {
        let mut raw = self.raw.clone();
        raw[EAPOL_KEY_MIC].fill(0);
        raw
    }
}
