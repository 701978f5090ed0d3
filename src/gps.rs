use std::io::{BufRead, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NmeaError {
    #[error("not an NMEA sentence")]
    NotNmea,

    #[error("sentence has no checksum")]
    MissingChecksum,

    #[error("checksum mismatch: sentence says {expected:02X}, computed {actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    #[error("bad {field} field in {sentence}")]
    BadField {
        sentence: &'static str,
        field: &'static str,
    },
}

/// Metres of horizontal error per unit of HDOP.
pub const HDOP_TO_METERS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
    pub accuracy_m: f64,
    pub satellites: u8,
}

/// Latest fix, shared between the reader thread and the capture loop.
#[derive(Debug, Clone, Default)]
pub struct SharedFix(Arc<RwLock<Option<GpsFix>>>);

impl SharedFix {
    pub fn get(&self) -> Option<GpsFix> {
        self.0.read().map(|fix| *fix).unwrap_or(None)
    }

    pub fn set(&self, fix: Option<GpsFix>) {
        if let Ok(mut slot) = self.0.write() {
            *slot = fix;
        }
    }
}

/// XOR of every byte between `$` and `*`.
pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// `ddmm.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = value.parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct NmeaParser {
    fix: Option<GpsFix>,
    pub sentences: u64,
}

impl NmeaParser {
    pub fn new() -> NmeaParser {
        NmeaParser::default()
    }

    pub fn fix(&self) -> Option<GpsFix> {
        self.fix
    }

    /// Feeds one sentence and returns the fix as it stands afterwards.
    /// Valid sentences other than GGA and RMC leave the fix unchanged.
    pub fn feed(&mut self, line: &str) -> Result<Option<GpsFix>, NmeaError> {
        let line = line.trim();
        let body = line.strip_prefix('$').ok_or(NmeaError::NotNmea)?;
        let (body, checksum) = body.split_once('*').ok_or(NmeaError::MissingChecksum)?;
        let expected = u8::from_str_radix(checksum.get(..2).unwrap_or(checksum), 16)
            .map_err(|_| NmeaError::MissingChecksum)?;
        let actual = nmea_checksum(body);
        if expected != actual {
            return Err(NmeaError::Checksum { expected, actual });
        }

        let fields: Vec<&str> = body.split(',').collect();
        let sentence = fields[0];
        if sentence.len() < 5 {
            return Err(NmeaError::NotNmea);
        }
        self.sentences += 1;

        // Any talker: GP, GN, GL, GA...
        match sentence.get(sentence.len() - 3..) {
            Some("GGA") => self.process_gga(&fields)?,
            Some("RMC") => self.process_rmc(&fields)?,
            _ => {}
        }
        Ok(self.fix)
    }

    fn process_gga(&mut self, fields: &[&str]) -> Result<(), NmeaError> {
        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        let quality: u8 = field(6).parse().unwrap_or(0);
        if quality == 0 {
            self.fix = None;
            return Ok(());
        }
        let latitude = parse_coordinate(field(2), field(3)).ok_or(NmeaError::BadField {
            sentence: "GGA",
            field: "latitude",
        })?;
        let longitude = parse_coordinate(field(4), field(5)).ok_or(NmeaError::BadField {
            sentence: "GGA",
            field: "longitude",
        })?;
        let hdop: f64 = field(8).parse().unwrap_or(99.9);

        self.fix = Some(GpsFix {
            latitude,
            longitude,
            altitude_m: field(9).parse().unwrap_or(0.0),
            accuracy_m: hdop * HDOP_TO_METERS,
            satellites: field(7).parse().unwrap_or(0),
        });
        Ok(())
    }

    fn process_rmc(&mut self, fields: &[&str]) -> Result<(), NmeaError> {
        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        if field(2) != "A" {
            self.fix = None;
            return Ok(());
        }
        let latitude = parse_coordinate(field(3), field(4)).ok_or(NmeaError::BadField {
            sentence: "RMC",
            field: "latitude",
        })?;
        let longitude = parse_coordinate(field(5), field(6)).ok_or(NmeaError::BadField {
            sentence: "RMC",
            field: "longitude",
        })?;
        let previous = self.fix.unwrap_or_default();
        self.fix = Some(GpsFix {
            latitude,
            longitude,
            ..previous
        });
        Ok(())
    }
}

/// Reads NMEA lines on a background thread and publishes every fix change.
/// Returns the number of sentences that passed the checksum.
pub fn spawn_reader<R>(
    reader: R,
    shared: SharedFix,
    running: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<u64>>
where
    R: BufRead + Send + 'static,
{
    thread::Builder::new()
        .name("gps-reader".to_string())
        .spawn(move || {
            let mut reader = reader;
            let mut parser = NmeaParser::new();
            let mut raw = Vec::new();
            while running.load(Ordering::SeqCst) {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
                // Line noise while the receiver syncs is not fatal.
                let line = String::from_utf8_lossy(&raw);
                if let Ok(fix) = parser.feed(&line) {
                    shared.set(fix);
                }
            }
            parser.sentences
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn parses_gga_fix() {
        let mut parser = NmeaParser::new();
        let fix = parser.feed(GGA).unwrap().unwrap();
        assert!(close(fix.latitude, 48.1173));
        assert!(close(fix.longitude, 11.516666666));
        assert!(close(fix.altitude_m, 545.4));
        assert!(close(fix.accuracy_m, 4.5));
        assert_eq!(fix.satellites, 8);
    }

    #[test]
    fn rmc_updates_position_and_keeps_altitude() {
        let mut parser = NmeaParser::new();
        parser.feed(GGA).unwrap();
        let fix = parser.feed(RMC).unwrap().unwrap();
        assert!(close(fix.latitude, 48.1173));
        assert!(close(fix.altitude_m, 545.4));
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut parser = NmeaParser::new();
        let broken = GGA.replace("*47", "*48");
        assert_eq!(
            parser.feed(&broken),
            Err(NmeaError::Checksum {
                expected: 0x48,
                actual: 0x47
            })
        );
        assert_eq!(parser.feed("GPGGA,1,2"), Err(NmeaError::NotNmea));
        assert_eq!(parser.feed("$GPGGA,1,2"), Err(NmeaError::MissingChecksum));
        assert_eq!(parser.fix(), None);
    }

    #[test]
    fn lost_fix_clears_position() {
        let mut parser = NmeaParser::new();
        parser.feed(GGA).unwrap();
        let body = "GPRMC,123520,V,,,,,,,230394,,";
        let sentence = format!("${}*{:02X}", body, nmea_checksum(body));
        assert_eq!(parser.feed(&sentence).unwrap(), None);
    }

    #[test]
    fn southern_and_western_hemispheres_are_negative() {
        assert!(close(parse_coordinate("3351.000", "S").unwrap(), -33.85));
        assert!(close(parse_coordinate("15112.600", "W").unwrap(), -151.21));
        assert_eq!(parse_coordinate("3351.000", "X"), None);
    }

    #[test]
    fn reader_thread_publishes_fix() {
        let shared = SharedFix::default();
        let input = format!("garbage\n{GGA}\n$GPGSV,1*00\n");
        let handle = spawn_reader(
            Cursor::new(input.into_bytes()),
            shared.clone(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(shared.get().unwrap().satellites, 8);
    }

    #[test]
    fn multibyte_sentence_names_are_ignored() {
        let mut parser = NmeaParser::new();
        let body = "ab\u{e9}12,1";
        let sentence = format!("${}*{:02X}", body, nmea_checksum(body));
        assert_eq!(parser.feed(&sentence), Ok(None));
        assert_eq!(parser.sentences, 1);
    }

    #[test]
    fn reader_survives_invalid_utf8() {
        let shared = SharedFix::default();
        let mut input = b"\xff\xfe noise\n".to_vec();
        input.extend_from_slice(GGA.as_bytes());
        input.push(b'\n');
        let handle = spawn_reader(
            Cursor::new(input),
            shared.clone(),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(shared.get().unwrap().satellites, 8);
    }
}
