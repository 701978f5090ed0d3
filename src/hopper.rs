use std::time::{Duration, Instant};

/// Cooperative channel-hop timer, polled from the main loop.
#[derive(Debug, Clone)]
pub struct ChannelHopper {
    channels: Vec<u8>,
    position: usize,
    interval: Duration,
    last_hop: Instant,
    pub cycles: u32,
}

impl ChannelHopper {
    pub fn new(channels: Vec<u8>, interval: Duration, now: Instant) -> ChannelHopper {
        ChannelHopper {
            channels,
            position: 0,
            interval,
            last_hop: now,
            cycles: 0,
        }
    }

    /// Channel to start on.
    pub fn first(&self) -> Option<u8> {
        self.channels.first().copied()
    }

    pub fn current(&self) -> Option<u8> {
        self.channels.get(self.position).copied()
    }

    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// A single channel never hops.
    pub fn is_hopping(&self) -> bool {
        self.channels.len() > 1
    }

    /// Next channel once the interval has elapsed since the last hop.
    pub fn poll(&mut self, now: Instant) -> Option<u8> {
        if !self.is_hopping() || now.duration_since(self.last_hop) < self.interval {
            return None;
        }
        self.last_hop = now;
        self.position += 1;
        if self.position >= self.channels.len() {
            self.position = 0;
            self.cycles += 1;
        }
        self.current()
    }
}

/// Parses `"1,6,11"`, `"1-11"` or a mix of both. Channels must be 1..=14.
pub fn parse_channels(list: &str) -> Result<Vec<u8>, String> {
    let mut channels = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let range = match part.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_channel(lo)?;
                let hi = parse_channel(hi)?;
                if lo > hi {
                    return Err(format!("Channel range {part} is reversed"));
                }
                lo..=hi
            }
            None => {
                let ch = parse_channel(part)?;
                ch..=ch
            }
        };
        for ch in range {
            if !channels.contains(&ch) {
                channels.push(ch);
            }
        }
    }
    if channels.is_empty() {
        return Err("No channels given".to_string());
    }
    Ok(channels)
}

fn parse_channel(text: &str) -> Result<u8, String> {
    match text.trim().parse::<u8>() {
        Ok(ch) if (1..=14).contains(&ch) => Ok(ch),
        _ => Err(format!("Invalid 2.4GHz channel: {}", text.trim())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hops_only_after_interval() {
        let t0 = Instant::now();
        let mut hopper = ChannelHopper::new(vec![1, 6, 11], Duration::from_millis(500), t0);
        assert_eq!(hopper.first(), Some(1));
        assert_eq!(hopper.poll(t0 + Duration::from_millis(100)), None);
        assert_eq!(hopper.poll(t0 + Duration::from_millis(500)), Some(6));
        assert_eq!(hopper.poll(t0 + Duration::from_millis(700)), None);
        assert_eq!(hopper.poll(t0 + Duration::from_millis(1000)), Some(11));
        assert_eq!(hopper.cycles, 0);
        assert_eq!(hopper.poll(t0 + Duration::from_millis(1500)), Some(1));
        assert_eq!(hopper.cycles, 1);
    }

    #[test]
    fn single_channel_never_hops() {
        let t0 = Instant::now();
        let mut hopper = ChannelHopper::new(vec![6], Duration::from_millis(1), t0);
        assert!(!hopper.is_hopping());
        assert_eq!(hopper.poll(t0 + Duration::from_secs(10)), None);
        assert_eq!(hopper.current(), Some(6));
    }

    #[test]
    fn channel_lists() {
        assert_eq!(parse_channels("1,6,11").unwrap(), vec![1, 6, 11]);
        assert_eq!(parse_channels("1-4, 3, 11").unwrap(), vec![1, 2, 3, 4, 11]);
        assert!(parse_channels("0").is_err());
        assert!(parse_channels("15").is_err());
        assert!(parse_channels("11-1").is_err());
        assert!(parse_channels(" , ").is_err());
    }
}
