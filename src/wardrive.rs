use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::buffer::{BufferedLog, CaptureError, LogTarget, WriterEvent, BUFFER_SIZE};
use crate::frame::{Encryption, MacAddress};
use crate::gps::GpsFix;

pub const WIGLE_COLUMNS: [&str; 11] = [
    "MAC",
    "SSID",
    "AuthMode",
    "FirstSeen",
    "Channel",
    "RSSI",
    "CurrentLatitude",
    "CurrentLongitude",
    "AltitudeMeters",
    "AccuracyMeters",
    "Type",
];

/// MACs remembered for deduplication; the oldest is forgotten first.
pub const MAX_SEEN: usize = 4096;

pub fn wigle_preamble() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(
        "WigleWifi-1.4,appRelease={version},model=ghostwire,release={version},device=ghostwire,display=,board=,brand=\n{}\n",
        WIGLE_COLUMNS.join(",")
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sighting {
    Wifi {
        bssid: MacAddress,
        ssid: String,
        encryption: Encryption,
        channel: u8,
        rssi: i32,
    },
    /// A Bluetooth LE advertiser. Rows follow WiGLE's `BLE` type: auth
    /// mode `Misc [LE]` and channel 0. Nothing in this crate scans BLE;
    /// callers with their own scanner share the log through [`WardriveLogger::log`].
    Ble {
        mac: MacAddress,
        name: String,
        rssi: i32,
    },
}

impl Sighting {
    pub fn mac(&self) -> MacAddress {
        match self {
            Sighting::Wifi { bssid, .. } => *bssid,
            Sighting::Ble { mac, .. } => *mac,
        }
    }
}

pub fn encode_row(
    sighting: &Sighting,
    fix: Option<&GpsFix>,
    seen: DateTime<Local>,
) -> Result<Vec<u8>, CaptureError> {
    let fix = fix.copied().unwrap_or_default();
    let (mac, name, auth, channel, rssi, kind) = match sighting {
        Sighting::Wifi {
            bssid,
            ssid,
            encryption,
            channel,
            rssi,
        } => (
            bssid,
            ssid.as_str(),
            encryption.wigle_auth_mode(),
            *channel,
            *rssi,
            "WIFI",
        ),
        Sighting::Ble { mac, name, rssi } => (mac, name.as_str(), "Misc [LE]", 0, *rssi, "BLE"),
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record([
        mac.to_string(),
        name.to_string(),
        auth.to_string(),
        seen.format("%Y-%m-%d %H:%M:%S").to_string(),
        channel.to_string(),
        rssi.to_string(),
        format!("{:.6}", fix.latitude),
        format!("{:.6}", fix.longitude),
        format!("{:.1}", fix.altitude_m),
        format!("{:.1}", fix.accuracy_m),
        kind.to_string(),
    ])?;
    writer
        .into_inner()
        .map_err(|e| CaptureError::Io(e.into_error()))
}

/// Buffered WiGLE CSV log. Each MAC is written once while it is among the
/// last `MAX_SEEN` distinct MACs logged.
pub struct WardriveLogger {
    log: BufferedLog,
    seen: HashSet<MacAddress>,
    seen_order: VecDeque<MacAddress>,
    seen_capacity: usize,
    require_fix: bool,
    pub skipped_without_fix: u64,
}

impl WardriveLogger {
    pub fn open(
        dir: Option<&Path>,
        base: &str,
        serial: Box<dyn Write + Send>,
        require_fix: bool,
    ) -> Result<WardriveLogger, CaptureError> {
        WardriveLogger::open_with_capacity(dir, base, serial, require_fix, BUFFER_SIZE)
    }

    pub fn open_with_capacity(
        dir: Option<&Path>,
        base: &str,
        serial: Box<dyn Write + Send>,
        require_fix: bool,
        capacity: usize,
    ) -> Result<WardriveLogger, CaptureError> {
        let target = LogTarget {
            dir,
            base,
            ext: "csv",
        };
        let log = BufferedLog::open(target, serial, capacity, wigle_preamble().into_bytes())?;
        Ok(WardriveLogger {
            log,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            seen_capacity: MAX_SEEN,
            require_fix,
            skipped_without_fix: 0,
        })
    }

    /// Returns `true` when a row was buffered.
    pub fn log(&mut self, sighting: &Sighting, fix: Option<GpsFix>) -> Result<bool, CaptureError> {
        let mac = sighting.mac();
        if self.seen.contains(&mac) {
            return Ok(false);
        }
        if self.require_fix && fix.is_none() {
            self.skipped_without_fix += 1;
            return Ok(false);
        }
        let row = encode_row(sighting, fix.as_ref(), Local::now())?;
        self.log.append(&row)?;
        self.remember(mac);
        Ok(true)
    }

    pub fn with_seen_capacity(mut self, capacity: usize) -> WardriveLogger {
        self.seen_capacity = capacity.max(1);
        self
    }

    fn remember(&mut self, mac: MacAddress) {
        if !self.seen.insert(mac) {
            return;
        }
        self.seen_order.push_back(mac);
        while self.seen_order.len() > self.seen_capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn rows(&self) -> u64 {
        self.log.records()
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.log.flush()
    }

    pub fn poll_events(&self) -> Vec<WriterEvent> {
        self.log.poll_events()
    }

    pub fn close(self) -> Result<Vec<WriterEvent>, CaptureError> {
        self.log.close()
    }

    pub fn path(&self) -> Option<&Path> {
        self.log.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::SharedBuf;
    use std::fs;

    fn wifi(last: u8, ssid: &str) -> Sighting {
        Sighting::Wifi {
            bssid: MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, last]),
            ssid: ssid.to_string(),
            encryption: Encryption::Wpa2,
            channel: 6,
            rssi: -61,
        }
    }

    fn fix() -> GpsFix {
        GpsFix {
            latitude: 48.1173,
            longitude: 11.516667,
            altitude_m: 545.4,
            accuracy_m: 4.5,
            satellites: 8,
        }
    }

    #[test]
    fn rows_read_back_with_quoting() {
        let dir = std::env::temp_dir().join(format!("ghostwire-csv-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let mut logger = WardriveLogger::open_with_capacity(
            Some(dir.as_path()),
            "wardrive",
            Box::new(SharedBuf::default()),
            false,
            256,
        )
        .unwrap();
        let path = logger.path().unwrap().to_path_buf();
        assert!(logger.log(&wifi(1, "cafe, upstairs"), Some(fix())).unwrap());
        assert!(!logger.log(&wifi(1, "cafe, upstairs"), Some(fix())).unwrap());
        let ble = Sighting::Ble {
            mac: MacAddress([0x04, 0, 0, 0, 0, 9]),
            name: "tag".to_string(),
            rssi: -80,
        };
        assert!(logger.log(&ble, None).unwrap());
        for i in 10..20 {
            logger.log(&wifi(i, "filler"), Some(fix())).unwrap();
        }
        assert_eq!(logger.rows(), 12);
        logger.close().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("WigleWifi-1.4,appRelease="));
        let rest: String = lines.collect::<Vec<_>>().join("\n");

        let mut reader = csv::Reader::from_reader(rest.as_bytes());
        assert_eq!(reader.headers().unwrap(), WIGLE_COLUMNS.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 12);
        assert_eq!(&rows[0][0], "02:11:22:33:44:01");
        assert_eq!(&rows[0][1], "cafe, upstairs");
        assert_eq!(&rows[0][2], "[WPA2-PSK-CCMP][ESS]");
        assert_eq!(&rows[0][6], "48.117300");
        assert_eq!(&rows[0][10], "WIFI");
        assert_eq!(&rows[1][10], "BLE");
        assert_eq!(&rows[1][6], "0.000000");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn require_fix_skips_without_marking_seen() {
        let serial = SharedBuf::default();
        let mut logger =
            WardriveLogger::open(None, "wardrive", Box::new(serial.clone()), true).unwrap();
        assert!(!logger.log(&wifi(1, "net"), None).unwrap());
        assert_eq!(logger.skipped_without_fix, 1);
        assert!(logger.log(&wifi(1, "net"), Some(fix())).unwrap());
        logger.close().unwrap();

        let out = String::from_utf8(serial.contents()).unwrap();
        assert!(out.starts_with("[BUF/BEGIN]WigleWifi-1.4"));
        assert_eq!(out.matches("[BUF/CLOSE]").count(), 2);
        assert!(out.contains("02:11:22:33:44:01,net,"));
    }

    #[test]
    fn dedup_set_forgets_oldest_mac() {
        let mut logger =
            WardriveLogger::open(None, "wardrive", Box::new(SharedBuf::default()), false)
                .unwrap()
                .with_seen_capacity(2);
        assert!(logger.log(&wifi(1, "a"), None).unwrap());
        assert!(logger.log(&wifi(2, "b"), None).unwrap());
        assert!(logger.log(&wifi(3, "c"), None).unwrap());
        assert!(!logger.log(&wifi(3, "c"), None).unwrap());
        assert!(!logger.log(&wifi(2, "b"), None).unwrap());
        assert!(logger.log(&wifi(1, "a"), None).unwrap());
        assert_eq!(logger.seen.len(), 2);
        assert_eq!(logger.seen_order.len(), 2);
        assert_eq!(logger.rows(), 4);
    }

    #[test]
    fn ble_rows_use_wigle_le_fields() {
        let ble = Sighting::Ble {
            mac: MacAddress([0x04, 0, 0, 0, 0, 9]),
            name: "tag, left".to_string(),
            rssi: -80,
        };
        let seen = Local::now();
        let row = encode_row(&ble, Some(&fix()), seen).unwrap();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(row.as_slice());
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(record.len(), WIGLE_COLUMNS.len());
        assert_eq!(&record[0], "04:00:00:00:00:09");
        assert_eq!(&record[1], "tag, left");
        assert_eq!(&record[2], "Misc [LE]");
        assert_eq!(&record[4], "0");
        assert_eq!(&record[5], "-80");
        assert_eq!(&record[6], "48.117300");
        assert_eq!(&record[10], "BLE");
    }
}
