use std::collections::HashMap;

use crate::frame::{EapolKey, KeyMessage, MacAddress};

/// EAPOL material collected for one (AP, station) pair.
#[derive(Debug, Clone)]
pub struct FourWayHandshake {
    pub mac_ap: MacAddress,
    pub mac_client: MacAddress,
    pub essid: Option<String>,
    pub msg1: Option<EapolKey>,
    pub msg2: Option<EapolKey>,
    pub msg3: Option<EapolKey>,
    pub msg4: Option<EapolKey>,
    pub pmkid: Option<[u8; 16]>,
}

impl FourWayHandshake {
    fn new(mac_ap: MacAddress, mac_client: MacAddress) -> Self {
        FourWayHandshake {
            mac_ap,
            mac_client,
            essid: None,
            msg1: None,
            msg2: None,
            msg3: None,
            msg4: None,
            pmkid: None,
        }
    }

    pub fn add_key(&mut self, key: &EapolKey) -> Result<KeyMessage, String> {
        let message = key
            .message()
            .ok_or_else(|| format!("Unclassifiable EAPOL-Key (info {:#06x})", key.key_info))?;
        match message {
            KeyMessage::M1 => {
                let fresh = self
                    .msg1
                    .as_ref()
                    .map_or(true, |m1| m1.replay_counter != key.replay_counter);
                if fresh {
                    self.msg2 = None;
                    self.msg3 = None;
                    self.msg4 = None;
                }
                if let Some(pmkid) = key.pmkid() {
                    self.pmkid = Some(pmkid);
                }
                self.msg1 = Some(key.clone());
            }
            KeyMessage::M2 => self.msg2 = Some(key.clone()),
            KeyMessage::M3 => self.msg3 = Some(key.clone()),
            KeyMessage::M4 => self.msg4 = Some(key.clone()),
        }
        Ok(message)
    }

    /// M1 and M2 from the same exchange.
    pub fn complete(&self) -> bool {
        match (&self.msg1, &self.msg2) {
            (Some(m1), Some(m2)) => m1.replay_counter == m2.replay_counter,
            _ => false,
        }
    }

    pub fn has_pmkid(&self) -> bool {
        self.pmkid.is_some()
    }

    pub fn essid_to_string(&self) -> String {
        self.essid.clone().unwrap_or_else(|| "<unknown>".to_string())
    }

    /// hashcat mode 22000 lines: `WPA*01` for a PMKID, `WPA*02` for M1+M2.
    /// Nothing without an ESSID.
    pub fn to_hashcat_22000_format(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let Some(essid) = self.essid.as_ref() else {
            return lines;
        };
        let ap = hex::encode(self.mac_ap.0);
        let client = hex::encode(self.mac_client.0);
        let essid = hex::encode(essid.as_bytes());

        if let Some(pmkid) = self.pmkid {
            lines.push(format!(
                "WPA*01*{}*{}*{}*{}***",
                hex::encode(pmkid),
                ap,
                client,
                essid
            ));
        }
        if let (true, Some(m1), Some(m2)) = (self.complete(), &self.msg1, &self.msg2) {
            lines.push(format!(
                "WPA*02*{}*{}*{}*{}*{}*{}*00",
                hex::encode(m2.mic),
                ap,
                client,
                essid,
                hex::encode(m1.nonce),
                hex::encode(m2.zeroed_mic_raw()),
            ));
        }
        lines
    }
}

pub const MAX_HANDSHAKES: usize = 128;

#[derive(Debug, Default)]
pub struct HandshakeStorage {
    handshakes: HashMap<(MacAddress, MacAddress), FourWayHandshake>,
    essids: HashMap<MacAddress, String>,
    capacity: Option<usize>,
}

impl HandshakeStorage {
    pub fn new() -> Self {
        HandshakeStorage::default()
    }

    /// At most `capacity` (AP, client) pairs; known pairs keep updating.
    pub fn with_capacity(capacity: usize) -> Self {
        HandshakeStorage {
            capacity: Some(capacity),
            ..HandshakeStorage::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.capacity.map_or(false, |cap| self.handshakes.len() >= cap)
    }

    /// `true` when a key for this pair would be refused.
    pub fn rejects(&self, ap: &MacAddress, client: &MacAddress) -> bool {
        self.is_full() && !self.handshakes.contains_key(&(*ap, *client))
    }

    /// Records the network name for an AP; applies to past and future
    /// handshakes with it.
    pub fn set_essid(&mut self, ap: MacAddress, essid: &str) {
        if essid.is_empty() {
            return;
        }
        self.essids.insert(ap, essid.to_string());
        for hs in self.handshakes.values_mut().filter(|hs| hs.mac_ap == ap) {
            hs.essid = Some(essid.to_string());
        }
    }

    pub fn knows_essid(&self, ap: &MacAddress) -> bool {
        self.essids.contains_key(ap)
    }

    pub fn add_key(
        &mut self,
        ap: MacAddress,
        client: MacAddress,
        key: &EapolKey,
    ) -> Result<&FourWayHandshake, String> {
        if self.rejects(&ap, &client) {
            return Err(format!("Handshake storage full, dropping {ap} <-> {client}"));
        }
        let essid = self.essids.get(&ap).cloned();
        let hs = self
            .handshakes
            .entry((ap, client))
            .or_insert_with(|| FourWayHandshake::new(ap, client));
        if hs.essid.is_none() {
            hs.essid = essid;
        }
        hs.add_key(key)?;
        Ok(hs)
    }

    pub fn get(&self, ap: &MacAddress, client: &MacAddress) -> Option<&FourWayHandshake> {
        self.handshakes.get(&(*ap, *client))
    }

    pub fn get_handshakes(&self) -> impl Iterator<Item = &FourWayHandshake> {
        self.handshakes.values()
    }

    pub fn count(&self) -> usize {
        self.handshakes.len()
    }

    /// Hashcat lines grouped by ESSID.
    pub fn hashlines_by_essid(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for hs in self.handshakes.values() {
            let lines = hs.to_hashcat_22000_format();
            if !lines.is_empty() {
                map.entry(hs.essid_to_string()).or_default().extend(lines);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::eapol_offset;
    use crate::frame::tests::eapol_frame;

    fn key(raw: &[u8]) -> EapolKey {
        EapolKey::parse(&raw[eapol_offset(raw).unwrap()..]).unwrap()
    }

    fn macs() -> (MacAddress, MacAddress) {
        (
            MacAddress([0x02, 0, 0, 0, 0, 1]),
            MacAddress([0x04, 0, 0, 0, 0, 2]),
        )
    }

    #[test]
    fn m1_m2_pair_completes() {
        let (ap, sta) = macs();
        let mut storage = HandshakeStorage::new();
        storage.set_essid(ap, "lab");
        let m1 = key(&eapol_frame(ap, sta, true, 0x008A, 5, 0x11, &[]));
        let m2 = key(&eapol_frame(ap, sta, false, 0x010A, 5, 0x22, &[]));
        assert!(!storage.add_key(ap, sta, &m1).unwrap().complete());
        let hs = storage.add_key(ap, sta, &m2).unwrap();
        assert!(hs.complete());

        let lines = hs.to_hashcat_22000_format();
        assert_eq!(lines.len(), 1);
        let fields: Vec<&str> = lines[0].split('*').collect();
        assert_eq!(fields[0], "WPA");
        assert_eq!(fields[1], "02");
        assert_eq!(fields[2], "5a".repeat(16));
        assert_eq!(fields[3], "020000000001");
        assert_eq!(fields[4], "040000000002");
        assert_eq!(fields[5], hex::encode("lab"));
        assert_eq!(fields[6], "11".repeat(32));
        assert!(!fields[7].contains(&"5a".repeat(16)));
        assert_eq!(fields[8], "00");
    }

    #[test]
    fn mismatched_replay_counter_is_incomplete() {
        let (ap, sta) = macs();
        let mut storage = HandshakeStorage::new();
        let m1 = key(&eapol_frame(ap, sta, true, 0x008A, 5, 0x11, &[]));
        let m2 = key(&eapol_frame(ap, sta, false, 0x010A, 6, 0x22, &[]));
        storage.add_key(ap, sta, &m1).unwrap();
        assert!(!storage.add_key(ap, sta, &m2).unwrap().complete());
    }

    #[test]
    fn pmkid_line_needs_essid() {
        let (ap, sta) = macs();
        let mut kde = vec![0xDD, 0x14, 0x00, 0x0F, 0xAC, 0x04];
        kde.extend_from_slice(&[0xCD; 16]);
        let m1 = key(&eapol_frame(ap, sta, true, 0x008A, 1, 0x11, &kde));

        let mut storage = HandshakeStorage::new();
        let hs = storage.add_key(ap, sta, &m1).unwrap();
        assert!(hs.has_pmkid());
        assert!(hs.to_hashcat_22000_format().is_empty());

        storage.set_essid(ap, "corp");
        let lines = storage.hashlines_by_essid();
        let corp = &lines["corp"];
        assert_eq!(corp.len(), 1);
        assert!(corp[0].starts_with(&format!("WPA*01*{}*", "cd".repeat(16))));
        assert!(corp[0].ends_with("***"));
    }

    #[test]
    fn group_key_messages_are_rejected() {
        let (ap, sta) = macs();
        let group = key(&eapol_frame(ap, sta, true, 0x0382, 1, 0, &[]));
        let mut storage = HandshakeStorage::new();
        assert!(storage.add_key(ap, sta, &group).is_err());
    }

    #[test]
    fn full_storage_keeps_updating_known_pairs() {
        let (ap, sta) = macs();
        let other = MacAddress([0x04, 0, 0, 0, 0, 3]);
        let mut storage = HandshakeStorage::with_capacity(1);
        let m1 = key(&eapol_frame(ap, sta, true, 0x008A, 5, 0x11, &[]));
        let m2 = key(&eapol_frame(ap, sta, false, 0x010A, 5, 0x22, &[]));
        storage.add_key(ap, sta, &m1).unwrap();
        assert!(storage.is_full());
        assert!(storage.rejects(&ap, &other));
        assert!(storage.add_key(ap, other, &m1).is_err());
        assert!(storage.add_key(ap, sta, &m2).unwrap().complete());
        assert_eq!(storage.count(), 1);
    }
}
