use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};

use crate::buffer::BUFFER_SIZE;
use crate::auth::MAX_HANDSHAKES;
use crate::devices::{MAX_ACCESS_POINTS, MAX_STATIONS};
use crate::pineap::{PineApSettings, MAX_PINEAP_NETWORKS};
use crate::sniff::SnifferSettings;
use crate::wps::MAX_WPS_NETWORKS;

/// Persisted runtime settings. Missing keys take their defaults; command
/// line flags are applied on top through the generated setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Setters)]
#[serde(default)]
pub struct Settings {
    /// Milliseconds between beacon spam bursts.
    pub broadcast_speed: u64,
    /// Seconds on each channel while hopping.
    pub channel_switch_delay: f64,
    pub enable_channel_hopping: bool,
    /// Milliseconds between deauth steps.
    pub deauth_interval: u64,
    pub deauth_flood_threshold: u32,
    pub eapol_deauth: bool,
    pub pineap_window_secs: u64,
    pub pineap_cooldown_secs: u64,
    pub pineap_min_ssids: usize,
    pub wps_capacity: usize,
    pub max_stations: usize,
    pub max_access_points: usize,
    pub max_handshakes: usize,
    pub buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            broadcast_speed: 500,
            channel_switch_delay: 1.0,
            enable_channel_hopping: true,
            deauth_interval: 100,
            deauth_flood_threshold: 20,
            eapol_deauth: false,
            pineap_window_secs: 120,
            pineap_cooldown_secs: 30,
            pineap_min_ssids: 2,
            wps_capacity: MAX_WPS_NETWORKS,
            max_stations: MAX_STATIONS,
            max_access_points: MAX_ACCESS_POINTS,
            max_handshakes: MAX_HANDSHAKES,
            buffer_size: BUFFER_SIZE,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing settings in {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).with_context(|| format!("writing settings to {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.broadcast_speed > 0, "broadcast_speed must be positive");
        ensure!(
            self.channel_switch_delay.is_finite() && self.channel_switch_delay > 0.0,
            "channel_switch_delay must be a positive number of seconds"
        );
        ensure!(self.pineap_min_ssids >= 2, "pineap_min_ssids must be at least 2");
        ensure!(self.wps_capacity > 0, "wps_capacity must be positive");
        ensure!(
            self.max_stations > 0 && self.max_access_points > 0 && self.max_handshakes > 0,
            "device and handshake capacities must be positive"
        );
        ensure!(
            self.buffer_size >= 64,
            "buffer_size must hold at least one small record"
        );
        Ok(())
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_speed)
    }

    pub fn hop_interval(&self) -> Duration {
        Duration::from_secs_f64(self.channel_switch_delay)
    }

    pub fn deauth_step(&self) -> Duration {
        Duration::from_millis(self.deauth_interval)
    }

    pub fn pineap(&self) -> PineApSettings {
        PineApSettings {
            window: Duration::from_secs(self.pineap_window_secs),
            cooldown: Duration::from_secs(self.pineap_cooldown_secs),
            min_ssids: self.pineap_min_ssids,
            max_networks: MAX_PINEAP_NETWORKS,
        }
    }

    pub fn sniffer(&self) -> SnifferSettings {
        SnifferSettings {
            deauth_threshold: self.deauth_flood_threshold,
            eapol_deauth: self.eapol_deauth,
            pineap: self.pineap(),
            wps_capacity: self.wps_capacity,
            max_stations: self.max_stations,
            max_access_points: self.max_access_points,
            max_handshakes: self.max_handshakes,
            ..SnifferSettings::default()
        }
    }
}
