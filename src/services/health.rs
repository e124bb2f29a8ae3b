//! Health file
//!
//! A single line `OK|<timestamp>` or `FAIL|<timestamp>` written after every run, for
//! container health checks.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub ok: bool,
    pub at: DateTime<Local>,
}

pub fn write_health(path: &Path, ok: bool, at: DateTime<Local>) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let status = if ok { "OK" } else { "FAIL" };
    fs::write(path, format!("{}|{}", status, at.format(TIMESTAMP_FORMAT)))
}

/// Read the last health record, `None` if missing or unreadable
pub fn read_health(path: &Path) -> Option<HealthRecord> {
    let content = fs::read_to_string(path).ok()?;
    let (status, at) = content.trim().split_once('|')?;
    let ok = match status {
        "OK" => true,
        "FAIL" => false,
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(at, TIMESTAMP_FORMAT).ok()?;
    let at = Local.from_local_datetime(&naive).earliest()?;
    Some(HealthRecord { ok, at })
}
