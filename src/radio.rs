//! The radio boundary. The pipeline only sees [`Radio`]; a monitor-mode
//! interface and a pcap replay source sit behind it.

use std::fs::File;
use std::io::BufReader;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nl80211_ng::attr::Nl80211Iftype;
use nl80211_ng::{Interface, Nl80211};
use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use radiotap::Radiotap;
use thiserror::Error;

use crate::rawsocks::{open_socket_rx, open_socket_tx, read_frame, write_packet};
use crate::status::{MessageLog, MessageType, StatusMessage};
use crate::util::freq_to_channel;

/// Radiotap header asking the driver not to wait for an ACK.
pub const RTH_NO_ACK: [u8; 10] = [0x00, 0x00, 0x0a, 0x00, 0x00, 0x80, 0x00, 0x00, 0x28, 0x00];

const FCS_LEN: usize = 4;
const BAND_2GHZ: u8 = 2;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netlink: {0}")]
    Netlink(String),

    /// A single unreadable radiotap header; the radio itself is fine.
    #[error("bad radiotap header: {0}")]
    Radiotap(String),

    #[error("replay: {0}")]
    Replay(String),
}

/// One received frame, FCS removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub payload: Vec<u8>,
    pub rssi: i32,
    pub channel: u8,
    pub timestamp: SystemTime,
}

impl RxFrame {
    pub fn new(payload: Vec<u8>, rssi: i32, channel: u8) -> RxFrame {
        RxFrame {
            payload,
            rssi,
            channel,
            timestamp: SystemTime::now(),
        }
    }
}

pub trait Radio {
    /// Next frame if one is waiting. Never blocks.
    fn recv(&mut self) -> Result<Option<RxFrame>, RadioError>;

    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError>;

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError>;

    fn channel(&self) -> u8;

    /// A finite source has nothing left to give.
    fn exhausted(&self) -> bool {
        false
    }

    fn shutdown(&mut self) -> Result<(), RadioError>;
}

/// Strips the radiotap header and FCS. Signal and channel come from the
/// header when present.
pub fn decode_radiotap(
    packet: &[u8],
    fallback_channel: u8,
    timestamp: SystemTime,
) -> Result<RxFrame, RadioError> {
    let radiotap =
        Radiotap::from_bytes(packet).map_err(|e| RadioError::Radiotap(format!("{e:?}")))?;
    let mut payload = packet
        .get(radiotap.header.length..)
        .ok_or_else(|| RadioError::Radiotap("header longer than packet".to_string()))?
        .to_vec();

    let fcs = radiotap.flags.map_or(false, |flags| flags.fcs);
    if fcs && payload.len() >= FCS_LEN {
        payload.truncate(payload.len() - FCS_LEN);
    }

    Ok(RxFrame {
        payload,
        rssi: radiotap.antenna_signal.map_or(0, |s| s.value as i32),
        channel: radiotap
            .channel
            .and_then(|c| freq_to_channel(c.freq as u32))
            .unwrap_or(fallback_channel),
        timestamp,
    })
}

//////////////////////////////////////////////////////////////////////////////
// Monitor-mode interface

pub struct MonitorRadio {
    netlink: Nl80211,
    interface: Interface,
    name: String,
    index: i32,
    rx_socket: OwnedFd,
    tx_socket: OwnedFd,
    channel: u8,
    active: bool,
}

impl MonitorRadio {
    /// Puts `name` into monitor mode and opens the raw sockets. Needs root.
    pub fn open(name: &str, log: &mut MessageLog) -> Result<MonitorRadio, RadioError> {
        let mut netlink =
            Nl80211::new().map_err(|e| RadioError::Netlink(format!("Cannot open nl80211: {e:?}")))?;

        let interface = netlink
            .get_interfaces()
            .iter()
            .find(|&(_, iface)| iface.name_as_string() == name)
            .map(|(_, iface)| iface.clone())
            .ok_or_else(|| RadioError::Netlink(format!("Interface {name} not found")))?;
        let index = interface
            .index
            .ok_or_else(|| RadioError::Netlink(format!("Interface {name} has no index")))?;

        let phy = interface.phy.clone();
        if let Some(phy) = &phy {
            if !phy
                .iftypes
                .clone()
                .is_some_and(|types| types.contains(&Nl80211Iftype::IftypeMonitor))
            {
                return Err(RadioError::Netlink(format!(
                    "Monitor mode not available for {name}"
                )));
            }
        }
        let active_monitor = phy
            .and_then(|phy| phy.active_monitor)
            .is_some_and(|active| active);

        log.add_message(StatusMessage::new(
            MessageType::Info,
            format!("Setting {name} down."),
        ));
        netlink
            .set_interface_down(index)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;

        log.add_message(StatusMessage::new(
            MessageType::Info,
            format!("Setting {name} to monitor mode. (\"active\" flag: {active_monitor})"),
        ));
        netlink
            .set_interface_monitor(active_monitor, index)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;

        log.add_message(StatusMessage::new(
            MessageType::Info,
            format!("Setting {name} up."),
        ));
        netlink
            .set_interface_up(index)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;

        let rx_socket = open_socket_rx(index)?;
        let tx_socket = open_socket_tx(index)?;
        log.add_message(StatusMessage::new(
            MessageType::Info,
            format!(
                "Sockets Opened Rx: {} Tx: {}",
                rx_socket.as_raw_fd(),
                tx_socket.as_raw_fd()
            ),
        ));

        Ok(MonitorRadio {
            netlink,
            interface,
            name: name.to_string(),
            index,
            rx_socket,
            tx_socket,
            channel: 1,
            active: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &Interface {
        &self.interface
    }
}

impl Radio for MonitorRadio {
    fn recv(&mut self) -> Result<Option<RxFrame>, RadioError> {
        let packet = read_frame(&self.rx_socket)?;
        if packet.is_empty() {
            return Ok(None);
        }
        decode_radiotap(&packet, self.channel, SystemTime::now()).map(Some)
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        let mut packet = Vec::with_capacity(RTH_NO_ACK.len() + frame.len());
        packet.extend_from_slice(&RTH_NO_ACK);
        packet.extend_from_slice(frame);
        write_packet(&self.tx_socket, &packet)?;
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
        self.netlink
            .set_interface_chan(self.index, channel, BAND_2GHZ)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;
        self.channel = channel;
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    /// Back to managed mode. Safe to call twice.
    fn shutdown(&mut self) -> Result<(), RadioError> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        self.netlink
            .set_interface_down(self.index)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;
        self.netlink
            .set_interface_station(self.index)
            .map_err(|e| RadioError::Netlink(format!("{e:?}")))?;
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Pcap replay

/// Frames from a capture file. Transmissions are dropped.
pub struct ReplayRadio {
    reader: PcapReader<BufReader<File>>,
    radiotap: bool,
    channel: u8,
    done: bool,
    pub frames: u64,
    pub discarded_tx: u64,
}

impl ReplayRadio {
    pub fn open(path: &Path) -> Result<ReplayRadio, RadioError> {
        let file = File::open(path)?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| RadioError::Replay(e.to_string()))?;
        let radiotap = match reader.header().datalink {
            DataLink::IEEE802_11_RADIOTAP => true,
            DataLink::IEEE802_11 => false,
            other => {
                return Err(RadioError::Replay(format!(
                    "unsupported link type {other:?} in {}",
                    path.display()
                )))
            }
        };
        Ok(ReplayRadio {
            reader,
            radiotap,
            channel: 1,
            done: false,
            frames: 0,
            discarded_tx: 0,
        })
    }
}

impl Radio for ReplayRadio {
    fn recv(&mut self) -> Result<Option<RxFrame>, RadioError> {
        if self.done {
            return Ok(None);
        }
        let packet = match self.reader.next_packet() {
            Some(packet) => packet.map_err(|e| RadioError::Replay(e.to_string()))?,
            None => {
                self.done = true;
                return Ok(None);
            }
        };
        self.frames += 1;
        let timestamp = UNIX_EPOCH + Duration::from(packet.timestamp);
        if self.radiotap {
            decode_radiotap(&packet.data, self.channel, timestamp).map(Some)
        } else {
            Ok(Some(RxFrame {
                payload: packet.data.to_vec(),
                rssi: 0,
                channel: self.channel,
                timestamp,
            }))
        }
    }

    fn transmit(&mut self, _frame: &[u8]) -> Result<(), RadioError> {
        self.discarded_tx += 1;
        Ok(())
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
        self.channel = channel;
        Ok(())
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    fn exhausted(&self) -> bool {
        self.done
    }

    fn shutdown(&mut self) -> Result<(), RadioError> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::tests::SharedBuf;
    use crate::pcap::{CaptureType, PcapLogger, MINIMAL_RADIOTAP};
    use std::collections::VecDeque;
    use std::fs;

    /// Scripted radio: hands out queued frames and records transmissions.
    #[derive(Default)]
    pub(crate) struct MemoryRadio {
        pub queue: VecDeque<RxFrame>,
        pub sent: Vec<(u8, Vec<u8>)>,
        pub channel: u8,
        pub hops: Vec<u8>,
        pub shut_down: bool,
    }

    impl Radio for MemoryRadio {
        fn recv(&mut self) -> Result<Option<RxFrame>, RadioError> {
            Ok(self.queue.pop_front())
        }

        fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
            self.sent.push((self.channel, frame.to_vec()));
            Ok(())
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
            self.channel = channel;
            self.hops.push(channel);
            Ok(())
        }

        fn channel(&self) -> u8 {
            self.channel
        }

        fn exhausted(&self) -> bool {
            self.queue.is_empty()
        }

        fn shutdown(&mut self) -> Result<(), RadioError> {
            self.shut_down = true;
            Ok(())
        }
    }

    #[test]
    fn minimal_header_is_stripped() {
        let mut packet = MINIMAL_RADIOTAP.to_vec();
        packet.extend_from_slice(&[0x80, 0x00, 0x11]);
        let rx = decode_radiotap(&packet, 6, SystemTime::now()).unwrap();
        assert_eq!(rx.payload, vec![0x80, 0x00, 0x11]);
        assert_eq!(rx.channel, 6);
        assert_eq!(rx.rssi, 0);
    }

    #[test]
    fn fcs_is_removed_and_signal_read() {
        // present: flags (bit 1) + antenna signal (bit 5)
        let mut packet = vec![0x00, 0x00, 0x0a, 0x00, 0x22, 0x00, 0x00, 0x00, 0x10, 0xc4];
        packet.extend_from_slice(&[0xC0, 0x00, 0x3a, 0x01]);
        packet.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let rx = decode_radiotap(&packet, 1, SystemTime::now()).unwrap();
        assert_eq!(rx.payload, vec![0xC0, 0x00, 0x3a, 0x01]);
        assert_eq!(rx.rssi, -60);
    }

    #[test]
    fn garbage_header_is_an_error() {
        assert!(matches!(
            decode_radiotap(&[0x00, 0x00, 0x40], 1, SystemTime::now()),
            Err(RadioError::Radiotap(_))
        ));
    }

    #[test]
    fn replay_reads_our_own_captures() {
        let dir = std::env::temp_dir().join(format!("ghostwire-replay-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let mut logger = PcapLogger::open(
            Some(dir.as_path()),
            "raw",
            CaptureType::Wifi,
            Box::new(SharedBuf::default()),
        )
        .unwrap();
        let path = logger.path().unwrap().to_path_buf();
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        logger.write_packet(&[0x80, 0x00, 0x01], ts).unwrap();
        logger.write_packet(&[0x40, 0x00, 0x02], ts).unwrap();
        logger.close().unwrap();

        let mut radio = ReplayRadio::open(&path).unwrap();
        radio.set_channel(11).unwrap();
        let first = radio.recv().unwrap().unwrap();
        assert_eq!(first.payload, vec![0x80, 0x00, 0x01]);
        assert_eq!(first.channel, 11);
        assert_eq!(first.timestamp, ts);
        assert!(radio.recv().unwrap().is_some());
        assert!(!radio.exhausted());
        assert!(radio.recv().unwrap().is_none());
        assert!(radio.exhausted());
        radio.transmit(&[0u8; 4]).unwrap();
        assert_eq!(radio.discarded_tx, 1);
        fs::remove_dir_all(&dir).unwrap();
    }
}
