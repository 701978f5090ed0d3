use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use globset::Glob;

/// Next free index for files named `<base>_<n>.<ext>` in `dir`.
pub fn next_file_index(dir: &Path, base: &str, ext: &str) -> io::Result<u32> {
    let matcher = Glob::new(&format!("{base}_*.{ext}"))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .compile_matcher();

    let prefix = format!("{base}_");
    let suffix = format!(".{ext}");
    let mut next = 0u32;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !matcher.is_match(name) {
            continue;
        }
        if let Some(n) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix))
            .and_then(|n| n.parse::<u32>().ok())
        {
            next = next.max(n.saturating_add(1));
        }
    }
    Ok(next)
}

/// Replaces anything outside `[A-Za-z0-9_-]` so a name is safe in paths.
pub fn sanitize_file_stem(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "capture".to_string()
    } else {
        cleaned
    }
}

pub fn since_epoch(ts: SystemTime) -> Duration {
    ts.duration_since(UNIX_EPOCH).unwrap_or_default()
}

pub fn freq_to_channel(freq: u32) -> Option<u8> {
    match freq {
        2484 => Some(14),
        2412..=2472 => Some(((freq - 2407) / 5) as u8),
        5160..=5885 => Some(((freq - 5000) / 5) as u8),
        5955..=7115 => Some(((freq - 5950) / 5) as u8),
        _ => None,
    }
}
