use chrono::{DateTime, Local, TimeZone};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// How deep the dated folder tree goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// `YYYY/YYMM/YYMMDD/<file>`
    #[default]
    Daily,
    /// `YYYY/YYMM/<file>`
    Monthly,
}

/// Build the destination of a file from its own modification time.
///
/// Pure: no filesystem access, same inputs give the same path.
pub fn destination_path<Tz>(
    base: &Path,
    modified: &DateTime<Tz>,
    file_name: &OsStr,
    layout: Layout,
) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let year = modified.format("%Y").to_string();
    let year_month = modified.format("%y%m").to_string();

    let mut path = base.join(year).join(year_month);
    if layout == Layout::Daily {
        path.push(modified.format("%y%m%d").to_string());
    }
    path.push(file_name);
    path
}

/// Modification time in the local timezone, which is what the folder names use.
pub fn local_time(modified: SystemTime) -> DateTime<Local> {
    DateTime::<Local>::from(modified)
}
