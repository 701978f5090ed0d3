//! Buffered PCAP logging.
//!
//! Records are assembled in a [`RecordBuffer`] and handed to a background
//! [`LogWriter`] whenever the buffer would overflow. Without a capture
//! directory the same bytes are emitted as framed serial chunks.

use std::io::Write;
use std::path::Path;
use std::time::SystemTime;

use byteorder::{LittleEndian, WriteBytesExt};
use pcap_file::pcap::PcapHeader;
use pcap_file::{DataLink, Endianness};

use crate::buffer::{BufferedLog, CaptureError, LogTarget, WriterEvent, BUFFER_SIZE};
use crate::util::since_epoch;

pub const SNAPLEN: u32 = 65535;
pub const RECORD_HEADER_LEN: usize = 16;

/// Minimal radiotap header: version 0, length 8, no present fields.
pub const MINIMAL_RADIOTAP: [u8; 8] = [0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureType {
    Wifi,
    Bluetooth,
}

impl CaptureType {
    pub fn link_type(&self) -> u32 {
        match self {
            CaptureType::Wifi => 127,
            CaptureType::Bluetooth => 201,
        }
    }
}

pub fn global_header(kind: CaptureType) -> Result<Vec<u8>, CaptureError> {
    let header = PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: SNAPLEN,
        datalink: DataLink::from(kind.link_type()),
        endianness: Endianness::Little,
        ..Default::default()
    };
    let mut out = Vec::with_capacity(24);
    header
        .write_to(&mut out)
        .map_err(|e| CaptureError::Pcap(e.to_string()))?;
    Ok(out)
}

/// One packet record: header, radiotap prefix for WiFi, then the payload.
pub fn encode_record(
    kind: CaptureType,
    payload: &[u8],
    ts: SystemTime,
) -> Result<Vec<u8>, CaptureError> {
    let prefix: &[u8] = match kind {
        CaptureType::Wifi => &MINIMAL_RADIOTAP,
        CaptureType::Bluetooth => &[],
    };
    let len = prefix.len() + payload.len();
    let total = u32::try_from(len)
        .map_err(|_| CaptureError::Pcap(format!("packet of {len} bytes is too long")))?;
    let elapsed = since_epoch(ts);
    // Classic pcap seconds are 32 bits wide.
    let secs = u32::try_from(elapsed.as_secs()).map_err(|_| {
        CaptureError::Pcap(format!("timestamp {}s is beyond pcap range", elapsed.as_secs()))
    })?;

    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + len);
    record.write_u32::<LittleEndian>(secs)?;
    record.write_u32::<LittleEndian>(elapsed.subsec_micros())?;
    record.write_u32::<LittleEndian>(total)?;
    record.write_u32::<LittleEndian>(total)?;
    record.extend_from_slice(prefix);
    record.extend_from_slice(payload);
    Ok(record)
}

pub struct PcapLogger {
    kind: CaptureType,
    log: BufferedLog,
}

impl PcapLogger {
    /// Opens `<dir>/<base>_<n>.pcap` when `dir` exists, serial output
    /// otherwise. The global header goes out immediately.
    pub fn open(
        dir: Option<&Path>,
        base: &str,
        kind: CaptureType,
        serial: Box<dyn Write + Send>,
    ) -> Result<PcapLogger, CaptureError> {
        PcapLogger::open_with_capacity(dir, base, kind, serial, BUFFER_SIZE)
    }

    pub fn open_with_capacity(
        dir: Option<&Path>,
        base: &str,
        kind: CaptureType,
        serial: Box<dyn Write + Send>,
        capacity: usize,
    ) -> Result<PcapLogger, CaptureError> {
        let target = LogTarget {
            dir,
            base,
            ext: "pcap",
        };
        let log = BufferedLog::open(target, serial, capacity, global_header(kind)?)?;
        Ok(PcapLogger { kind, log })
    }

    pub fn write_packet(&mut self, payload: &[u8], ts: SystemTime) -> Result<(), CaptureError> {
        if payload.is_empty() {
            return Err(CaptureError::EmptyRecord);
        }
        let record = encode_record(self.kind, payload, ts)?;
        self.log.append(&record)
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

    pub fn packets(&self) -> u64 {
        self.log.records()
    }

    pub fn buffered(&self) -> usize {
        self.log.buffered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::tests::SharedBuf;
    use crate::buffer::{Delivery, SERIAL_BEGIN, SERIAL_CLOSE};
    use pcap_file::pcap::PcapReader;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use std::time::{Duration, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ghostwire-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn header_layout() {
        let header = global_header(CaptureType::Wifi).unwrap();
        assert_eq!(header.len(), 24);
        assert_eq!(&header[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&header[4..8], &[2, 0, 4, 0]);
        assert_eq!(&header[16..20], &SNAPLEN.to_le_bytes());
        assert_eq!(&header[20..24], &127u32.to_le_bytes());
        let bt = global_header(CaptureType::Bluetooth).unwrap();
        assert_eq!(&bt[20..24], &201u32.to_le_bytes());
    }

    #[test]
    fn record_includes_radiotap_in_lengths() {
        let ts = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        let record = encode_record(CaptureType::Wifi, &[0x80, 0x00, 0x01], ts).unwrap();
        assert_eq!(record.len(), 16 + 8 + 3);
        assert_eq!(&record[0..4], &1_700_000_000u32.to_le_bytes());
        assert_eq!(&record[4..8], &250_000u32.to_le_bytes());
        assert_eq!(&record[8..12], &11u32.to_le_bytes());
        assert_eq!(&record[12..16], &11u32.to_le_bytes());
        assert_eq!(&record[16..24], &MINIMAL_RADIOTAP);

        let bt = encode_record(CaptureType::Bluetooth, &[1, 2], ts).unwrap();
        assert_eq!(bt.len(), 18);
        assert_eq!(&bt[8..12], &2u32.to_le_bytes());
    }

    #[test]
    fn timestamp_past_u32_seconds_is_an_error() {
        let last = UNIX_EPOCH + Duration::new(u64::from(u32::MAX), 0);
        assert!(encode_record(CaptureType::Wifi, &[0x80], last).is_ok());
        let late = UNIX_EPOCH + Duration::new(u64::from(u32::MAX) + 1, 0);
        assert!(matches!(
            encode_record(CaptureType::Wifi, &[0x80], late),
            Err(CaptureError::Pcap(_))
        ));
    }

    #[test]
    fn file_capture_reads_back() {
        let dir = temp_dir("pcap");
        let serial = SharedBuf::default();
        let mut logger = PcapLogger::open_with_capacity(
            Some(dir.as_path()),
            "beacon",
            CaptureType::Wifi,
            Box::new(serial.clone()),
            64,
        )
        .unwrap();
        let path = logger.path().unwrap().to_path_buf();
        assert!(path.ends_with("beacon_0.pcap"));

        let frames: Vec<Vec<u8>> = (0..5u8).map(|i| vec![0x80, i, 0xAA, 0xBB]).collect();
        for frame in &frames {
            logger.write_packet(frame, SystemTime::now()).unwrap();
        }
        assert_eq!(logger.packets(), 5);
        let events = logger.close().unwrap();
        assert!(events.iter().all(|e| matches!(
            e,
            WriterEvent::Flushed {
                delivery: Delivery::File,
                ..
            }
        )));
        assert!(serial.contents().is_empty());

        let mut reader = PcapReader::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(reader.header().datalink, DataLink::from(127u32));
        let mut read = Vec::new();
        while let Some(packet) = reader.next_packet() {
            let packet = packet.unwrap();
            assert_eq!(packet.orig_len as usize, packet.data.len());
            assert_eq!(&packet.data[..8], &MINIMAL_RADIOTAP);
            read.push(packet.data[8..].to_vec());
        }
        assert_eq!(read, frames);

        let next = PcapLogger::open(
            Some(dir.as_path()),
            "beacon",
            CaptureType::Wifi,
            Box::new(serial),
        )
        .unwrap();
        assert!(next.path().unwrap().ends_with("beacon_1.pcap"));
        next.close().unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_directory_goes_to_serial() {
        let serial = SharedBuf::default();
        let missing = std::env::temp_dir().join("ghostwire-no-such-dir/pcaps");
        let mut logger = PcapLogger::open(
            Some(missing.as_path()),
            "raw",
            CaptureType::Wifi,
            Box::new(serial.clone()),
        )
        .unwrap();
        assert!(logger.path().is_none());
        logger.write_packet(&[0xC0, 0x00], SystemTime::now()).unwrap();
        logger.close().unwrap();

        let out = serial.contents();
        let header_frame = SERIAL_BEGIN.len() + 24 + SERIAL_CLOSE.len() + 1;
        assert!(out.starts_with(SERIAL_BEGIN));
        assert_eq!(&out[SERIAL_BEGIN.len()..SERIAL_BEGIN.len() + 4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        let second = &out[header_frame..];
        assert!(second.starts_with(SERIAL_BEGIN));
        assert!(second.ends_with(b"[BUF/CLOSE]\n"));
        assert_eq!(second.len(), SERIAL_BEGIN.len() + 16 + 8 + 2 + SERIAL_CLOSE.len() + 1);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let serial = SharedBuf::default();
        let mut logger =
            PcapLogger::open_with_capacity(None, "raw", CaptureType::Wifi, Box::new(serial), 32)
                .unwrap();
        assert!(matches!(
            logger.write_packet(&[0u8; 16], SystemTime::now()),
            Err(CaptureError::TooLarge { size: 40, capacity: 32 })
        ));
        assert!(logger.write_packet(&[0u8; 8], SystemTime::now()).is_ok());
        assert_eq!(logger.buffered(), 32);
        logger.close().unwrap();
    }
}
