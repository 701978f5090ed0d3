mod attack;
mod auth;
mod buffer;
mod config;
mod devices;
mod frame;
mod gps;
mod hopper;
mod pcap;
mod pineap;
mod radio;
mod rawsocks;
mod sniff;
mod status;
mod tx;
mod util;
mod wardrive;
mod wps;

extern crate libc;
extern crate nix;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{ArgGroup, Parser};
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::unistd::geteuid;
use tar::Builder;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::attack::{BeaconMode, BeaconSpammer, DeauthAttacker, TxBurst};
use crate::config::Settings;
use crate::gps::{spawn_reader, SharedFix};
use crate::hopper::{parse_channels, ChannelHopper};
use crate::pcap::{CaptureType, PcapLogger};
use crate::radio::{MonitorRadio, Radio, RadioError, ReplayRadio};
use crate::sniff::{SniffMode, Sniffer};
use crate::status::*;
use crate::util::sanitize_file_stem;
use crate::wardrive::WardriveLogger;

#[derive(Parser)]
#[command(name = "ghostwire")]
#[command(author = "Ryan Butler (Ragnt)")]
#[command(about = "Sniffs, logs and forges 802.11 management frames.", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("source").required(true).args(["interface", "replay"])))]
struct Arguments {
    #[arg(short, long)]
    /// Interface to put into monitor mode.
    interface: Option<String>,

    #[arg(long)]
    /// Process a pcap file instead of a live interface.
    replay: Option<PathBuf>,

    #[arg(short, long)]
    /// Channels to hop, e.g. "1,6,11" or "1-11".
    channel: Option<String>,

    #[arg(long)]
    /// Seconds per channel while hopping.
    hop_interval: Option<f64>,

    #[arg(short, long)]
    /// Optional - Capture directory. Without one, captures go to stdout framed as serial chunks.
    output: Option<PathBuf>,

    #[arg(long)]
    /// Optional - JSON settings file.
    config: Option<PathBuf>,

    #[arg(long)]
    /// Optional - Write the effective settings to this file.
    save_config: Option<PathBuf>,

    #[arg(long, default_value = "raw")]
    /// Capture mode: raw, probe, beacon, deauth, eapol, pwn, wps, pineap, stations, aps, wardrive.
    capture: SniffMode,

    #[arg(long)]
    /// Attack - Beacon spam: random, rickroll, aplist, or an SSID to advertise.
    beacon_spam: Option<String>,

    #[arg(long)]
    /// Attack - Broadcast deauth against scanned access points.
    deauth: bool,

    #[arg(long, requires = "deauth")]
    /// Only deauth this entry of the scan listing.
    select: Option<usize>,

    #[arg(long, default_value_t = 10)]
    /// Seconds to scan before deauth or aplist beacon spam start.
    scan_time: u64,

    #[arg(long)]
    /// Send a broadcast deauth every 8th beacon while capturing EAPOL.
    eapol_deauth: bool,

    #[arg(long)]
    /// Milliseconds between beacon spam bursts.
    broadcast_speed: Option<u64>,

    #[arg(long)]
    /// NMEA source (file or serial device) for wardriving.
    gps: Option<PathBuf>,

    #[arg(long, requires = "gps")]
    /// Skip wardrive rows while there is no GPS fix.
    require_fix: bool,

    #[arg(long)]
    /// Never transmit.
    notx: bool,

    #[arg(long)]
    /// Stop after this many seconds.
    duration: Option<u64>,

    #[arg(long)]
    /// Bundle the capture files into a tar.gz on exit.
    archive: bool,
}

/// Applies command line flags on top of the file settings.
fn apply_overrides(mut settings: Settings, cli: &Arguments) -> Settings {
    if let Some(speed) = cli.broadcast_speed {
        settings = settings.broadcast_speed(speed);
    }
    if let Some(interval) = cli.hop_interval {
        settings = settings.channel_switch_delay(interval);
    }
    if cli.eapol_deauth {
        settings = settings.eapol_deauth(true);
    }
    settings
}

#[derive(Default)]
pub struct TxCounters {
    pub transmitted: u64,
    pub tx_errors: u64,
    pub channel_errors: u64,
    pub empty_reads: u64,
}

/// The cooperative loop: one frame in, its outcome out, then timers.
pub struct Runtime<R: Radio> {
    radio: R,
    sniffer: Sniffer,
    hopper: ChannelHopper,
    beacon: Option<BeaconSpammer>,
    deauth: Option<DeauthAttacker>,
    select: Option<usize>,
    scan_until: Instant,
    attacks_started: bool,
    notx: bool,
    last_read_empty: bool,
    counters: TxCounters,
}

impl<R: Radio> Runtime<R> {
    fn new(radio: R, sniffer: Sniffer, hopper: ChannelHopper, now: Instant) -> Self {
        Runtime {
            radio,
            sniffer,
            hopper,
            beacon: None,
            deauth: None,
            select: None,
            scan_until: now,
            attacks_started: false,
            notx: false,
            last_read_empty: false,
            counters: TxCounters::default(),
        }
    }

    fn start(&mut self) {
        if let Some(channel) = self.hopper.first() {
            self.switch_channel(channel);
        }
        let channels = self.hopper.channels().to_vec();
        self.sniffer.log(
            MessageType::Info,
            format!("Setting channel hopper: {channels:?}"),
        );
        if self.notx && (self.beacon.is_some() || self.deauth.is_some()) {
            self.sniffer.log(
                MessageType::Warning,
                "Transmission disabled; attacks will not run.".to_string(),
            );
        }
    }

    /// Processes at most one frame. `Ok(false)` ends the session.
    fn step(&mut self, now: Instant) -> Result<bool, RadioError> {
        self.last_read_empty = false;
        match self.radio.recv() {
            Ok(Some(rx)) => {
                let outcome = self.sniffer.process(&rx);
                for frame in &outcome.tx {
                    self.send(frame);
                }
                if outcome.stop {
                    return Ok(false);
                }
            }
            Ok(None) => {
                self.last_read_empty = true;
                self.counters.empty_reads += 1;
                if self.radio.exhausted() {
                    self.sniffer
                        .log(MessageType::Info, "Frame source exhausted.".to_string());
                    return Ok(false);
                }
            }
            Err(RadioError::Radiotap(error)) => {
                self.sniffer.counters.error_count += 1;
                self.sniffer.log(
                    MessageType::Error,
                    format!("Couldn't read packet data with Radiotap: {error}"),
                );
            }
            Err(error) => return Err(error),
        }

        self.tick_attacks(now);
        if !self.owns_channel() {
            if let Some(channel) = self.hopper.poll(now) {
                self.switch_channel(channel);
            }
        }
        self.sniffer.drain_writer_events();
        Ok(true)
    }

    /// Running attacks pick their own channels.
    fn owns_channel(&self) -> bool {
        self.attacks_started
            && !self.notx
            && (self.beacon.is_some()
                || self
                    .deauth
                    .as_ref()
                    .map_or(false, |d| !d.targets().is_empty()))
    }

    fn tick_attacks(&mut self, now: Instant) {
        if self.notx || (self.beacon.is_none() && self.deauth.is_none()) {
            return;
        }
        if !self.attacks_started {
            if now < self.scan_until {
                return;
            }
            self.start_attacks();
        }

        let mut bursts: Vec<TxBurst> = Vec::new();
        if let Some(beacon) = self.beacon.as_mut() {
            bursts.extend(beacon.tick(now));
        }
        if let Some(deauth) = self.deauth.as_mut() {
            bursts.extend(deauth.tick(now));
        }
        for burst in bursts {
            self.send_burst(&burst);
        }
    }

    fn start_attacks(&mut self) {
        self.attacks_started = true;
        if let Some(deauth) = self.deauth.as_mut() {
            let targets = self.sniffer.deauth_targets(self.select);
            if targets.is_empty() {
                self.sniffer.log(
                    MessageType::Warning,
                    "No access points to deauth after scanning.".to_string(),
                );
            } else {
                self.sniffer.log(
                    MessageType::Priority,
                    format!("Deauthing {} access point(s)", targets.len()),
                );
            }
            deauth.set_targets(targets);
        }
        if let Some(beacon) = self.beacon.as_mut() {
            if matches!(beacon.mode(), BeaconMode::ApList(_)) {
                let ssids = self.sniffer.ap_ssids();
                self.sniffer.log(
                    MessageType::Priority,
                    format!("Beaconing {} scanned SSIDs", ssids.len()),
                );
                beacon.set_ap_list(ssids);
            }
        }
    }

    fn send_burst(&mut self, burst: &TxBurst) {
        if let Some(channel) = burst.channel {
            self.switch_channel(channel);
        }
        for _ in 0..burst.repeat {
            for frame in &burst.frames {
                self.send(frame);
            }
        }
    }

    fn send(&mut self, frame: &[u8]) {
        if self.notx {
            return;
        }
        match self.radio.transmit(frame) {
            Ok(()) => self.counters.transmitted += 1,
            Err(e) => {
                self.counters.tx_errors += 1;
                self.sniffer
                    .log(MessageType::Error, format!("Transmit failed: {e}"));
            }
        }
    }

    fn switch_channel(&mut self, channel: u8) {
        if self.radio.channel() == channel {
            return;
        }
        if let Err(e) = self.radio.set_channel(channel) {
            self.counters.channel_errors += 1;
            self.sniffer
                .log(MessageType::Error, format!("Error: {e}"));
        }
    }

    fn status_line(&mut self, frame_rate: u64) {
        let line = format!(
            "Frames: {} | Rate: {} | ERs: {} | Channel: {} | Errors: {} | EAPOL: {} | TX: {}",
            self.sniffer.counters.frame_count,
            frame_rate,
            self.counters.empty_reads,
            self.radio.channel(),
            self.sniffer.counters.error_count,
            self.sniffer.counters.eapol_count,
            self.counters.transmitted,
        );
        self.counters.empty_reads = 0;
        self.sniffer.log(MessageType::Status, line);
    }

    /// Runs until Ctrl-C, the time limit, the source running dry or a stop
    /// outcome. Returns the fatal radio error, if that is what ended it.
    fn run(&mut self, running: &AtomicBool, limit: Option<Duration>) -> Option<String> {
        let start = Instant::now();
        let mut seconds_timer = start;
        let mut frame_count_old = 0u64;

        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if limit.is_some_and(|limit| now.duration_since(start) >= limit) {
                self.sniffer
                    .log(MessageType::Info, "Time limit reached.".to_string());
                break;
            }

            if now.duration_since(seconds_timer) >= Duration::from_secs(1) {
                seconds_timer = now;
                let frame_rate = self.sniffer.counters.frame_count - frame_count_old;
                frame_count_old = self.sniffer.counters.frame_count;
                self.status_line(frame_rate);
            }

            match self.step(now) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return Some(e.to_string()),
            }
            if self.last_read_empty {
                thread::sleep(Duration::from_micros(1));
            }
        }
        None
    }

    /// Radio down, logs closed, handshakes written, summaries printed.
    fn finish(mut self, output_dir: Option<&Path>, archive: bool) -> Result<()> {
        println!("Cleaning up...");
        if let Err(e) = self.radio.shutdown() {
            println!("Error: {e}");
        }

        let mut files = self.sniffer.close_logs();
        let handshakes = self.sniffer.handshakes.hashlines_by_essid();
        let hash_dir = output_dir.unwrap_or_else(|| Path::new("."));
        files.extend(write_handshakes(&handshakes, hash_dir)?);

        println!();
        print_summary(&self.sniffer, &self.counters);
        print_handshake_summary(&handshakes);

        if archive && !files.is_empty() {
            let date_time = Local::now().format("-%Y-%m-%d_%H-%M-%S").to_string();
            let name = hash_dir.join(format!("ghostwire{date_time}.tar.gz"));
            tar_and_compress_files(&files, &name)
                .with_context(|| format!("archiving to {}", name.display()))?;
            println!("Archived {} file(s) to {}", files.len(), name.display());
        }
        Ok(())
    }
}

fn print_section(title: &str, lines: &[String]) {
    if lines.is_empty() {
        return;
    }
    println!("======== {title} ========");
    for line in lines {
        println!(" {line}");
    }
    println!();
}

fn print_summary(sniffer: &Sniffer, tx: &TxCounters) {
    let counters = &sniffer.counters;
    println!(
        "Frames: {} | Mgmt: {} | Ctrl: {} | Data: {} | Errors: {} | Logged: {} | TX: {} ({} failed)",
        counters.frame_count,
        counters.management,
        counters.control,
        counters.data,
        counters.error_count,
        counters.logged,
        tx.transmitted,
        tx.tx_errors
    );
    println!();
    print_section("Channels", &sniffer.channel_report());
    print_section("Access Points", &sniffer.ap_listing());
    print_section("Stations", &sniffer.station_listing());
    print_section("WPS", &sniffer.wps_listing());
    print_section("PineAP", &sniffer.pineap_listing());
    let pwn: Vec<String> = sniffer
        .pwnagotchis
        .iter()
        .map(|p| {
            format!(
                "{} pwnd: {} (ch {}, {} dBm)",
                p.name,
                p.pwned.map_or("?".to_string(), |n| n.to_string()),
                p.channel,
                p.rssi
            )
        })
        .collect();
    print_section("Pwnagotchi", &pwn);
    if let Some(wardrive) = &sniffer.wardrive {
        println!("Wardrive rows: {}", wardrive.rows());
    }
}

fn write_handshakes(
    handshakes_map: &HashMap<String, Vec<String>>,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut hashfiles = Vec::new();
    for (essid, lines) in handshakes_map {
        let path = dir.join(format!("{}.hc22000", sanitize_file_stem(essid)));
        let mut file = File::create(&path)
            .with_context(|| format!("Could not open {} for writing", path.display()))?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        hashfiles.push(path);
    }
    Ok(hashfiles)
}

fn print_handshake_summary(handshakes_map: &HashMap<String, Vec<String>>) {
    if handshakes_map.is_empty() {
        return;
    }
    println!("Results:");
    for (essid, lines) in handshakes_map {
        let handshakes = lines.iter().filter(|l| l.starts_with("WPA*02*")).count();
        let pmkids = lines.iter().filter(|l| l.starts_with("WPA*01*")).count();
        println!("[{essid}] : 4wHS: {handshakes} | PMKID: {pmkids}");
    }
    println!();
}

fn tar_and_compress_files(output_files: &[PathBuf], archive: &Path) -> io::Result<()> {
    let tgz = File::create(archive)?;
    let enc = GzEncoder::new(tgz, Compression::default());
    let mut tar = Builder::new(enc);

    for path in output_files {
        let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| path.clone());
        let mut file = File::open(path)?;
        tar.append_file(name, &mut file)?;
    }
    tar.into_inner()?.finish()?;

    for path in output_files {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete file {}: {}", path.display(), e);
        }
    }
    Ok(())
}

/// Creates the capture directory. `None` means captures go to serial.
fn prepare_output(cli: &Arguments, log: &mut MessageLog) -> Option<PathBuf> {
    let dir = cli.output.clone()?;
    match fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            log.add_message(StatusMessage::new(
                MessageType::Warning,
                format!("Cannot use {} ({e}); captures go to serial", dir.display()),
            ));
            None
        }
    }
}

fn build_sniffer(
    cli: &Arguments,
    settings: &Settings,
    output_dir: Option<&Path>,
    log: MessageLog,
    gps: SharedFix,
) -> Result<Sniffer> {
    let mode = cli.capture;
    let sniffer = Sniffer::new(mode, settings.sniffer(), log, gps);
    let base = mode.capture_name();
    let sniffer = if mode == SniffMode::Wardrive {
        let logger = WardriveLogger::open_with_capacity(
            output_dir,
            &base,
            Box::new(io::stdout()),
            cli.require_fix,
            settings.buffer_size,
        )
        .context("opening wardrive log")?;
        sniffer.with_wardrive(logger)
    } else {
        let logger = PcapLogger::open_with_capacity(
            output_dir,
            &base,
            CaptureType::Wifi,
            Box::new(io::stdout()),
            settings.buffer_size,
        )
        .context("opening pcap log")?;
        sniffer.with_pcap(logger)
    };
    Ok(sniffer)
}

fn start_gps(path: &Path, shared: SharedFix, running: Arc<AtomicBool>, log: &mut MessageLog) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening GPS source {}", path.display()))?;
    spawn_reader(BufReader::new(file), shared, running).context("starting GPS reader")?;
    log.add_message(StatusMessage::new(
        MessageType::Info,
        format!("Reading NMEA from {}", path.display()),
    ));
    Ok(())
}

fn run_session<R: Radio>(
    radio: R,
    sniffer: Sniffer,
    cli: &Arguments,
    settings: &Settings,
    running: &AtomicBool,
    output_dir: Option<&Path>,
) -> Result<()> {
    let channels = match &cli.channel {
        Some(list) => parse_channels(list).map_err(anyhow::Error::msg)?,
        None => sniffer.mode().default_channels(),
    };
    if channels.is_empty() {
        bail!("No channels to listen on");
    }
    let channels = if settings.enable_channel_hopping {
        channels
    } else {
        channels[..1].to_vec()
    };

    let now = Instant::now();
    let hopper = ChannelHopper::new(channels, settings.hop_interval(), now);
    let mut runtime = Runtime::new(radio, sniffer, hopper, now);
    runtime.notx = cli.notx;

    let mut needs_scan = false;
    if let Some(arg) = &cli.beacon_spam {
        let mode = BeaconMode::from_arg(arg);
        needs_scan |= matches!(mode, BeaconMode::ApList(_));
        runtime.beacon = Some(BeaconSpammer::new(mode, settings.broadcast_interval()));
    }
    if cli.deauth {
        needs_scan = true;
        runtime.deauth = Some(DeauthAttacker::new(Vec::new(), settings.deauth_step()));
        runtime.select = cli.select;
    }
    if needs_scan {
        runtime.scan_until = now + Duration::from_secs(cli.scan_time);
        runtime.sniffer.log(
            MessageType::Info,
            format!("Scanning for {}s before attacking", cli.scan_time),
        );
    }

    runtime.start();
    let error = runtime.run(running, cli.duration.map(Duration::from_secs));
    if let Some(error) = &error {
        println!("Error: {error}");
    }
    runtime.finish(output_dir, cli.archive)?;
    if let Some(error) = error {
        bail!("session ended on a radio error: {error}");
    }
    println!("Complete!");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Arguments::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let settings = apply_overrides(settings, &cli);
    settings.validate()?;
    if let Some(path) = &cli.save_config {
        settings.save(path)?;
    }

    if cli.interface.is_some() && !geteuid().is_root() {
        bail!("You need to run as root!");
    }

    let mut log = MessageLog::new(true, None);
    log.add_message(StatusMessage::new(
        MessageType::Info,
        format!("Starting ghostwire ({} capture)...", cli.capture),
    ));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let output_dir = prepare_output(&cli, &mut log);
    let gps = SharedFix::default();
    if let Some(path) = &cli.gps {
        start_gps(path, gps.clone(), running.clone(), &mut log)?;
    }
    let mut sniffer = build_sniffer(&cli, &settings, output_dir.as_deref(), log, gps)?;

    match (&cli.interface, &cli.replay) {
        (Some(name), _) => {
            let radio = MonitorRadio::open(name, &mut sniffer.status_log)?;
            run_session(radio, sniffer, &cli, &settings, &running, output_dir.as_deref())
        }
        (None, Some(path)) => {
            let radio = ReplayRadio::open(path)?;
            run_session(radio, sniffer, &cli, &settings, &running, output_dir.as_deref())
        }
        (None, None) => bail!("Either --interface or --replay is required"),
    }
}
