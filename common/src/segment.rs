//! Segment file-name parsing and calendar math.
//!
//! The capture process names every segment after the wall-clock time it
//! started, with spaces standing in for colons:
//!   `2024-03-10T14 30 00+0000.mkv`
//!
//! Some platforms expand the offset as a zone name instead
//! (`2024-03-10T14 30 00GMT Summer Time.mkv`); those fall back to the
//! `YYYY-MM-DDTHH:MM:SS` prefix read in the capture clock's zone.
//!
//! Archived segments drop the offset and any fraction:
//!   `<storage>/2024/03/10/2024-03-10T14 30 00.mkv`

use std::path::{Path, PathBuf};

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use thiserror::Error;

const RAW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";
const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const ARCHIVE_FORMAT: &str = "%Y-%m-%dT%H %M %S";
/// Length of `YYYY-MM-DDTHH:MM:SS`.
const NAIVE_PREFIX_LEN: usize = 19;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("file name {0:?} has no usable stem")]
    NoStem(String),
    #[error("unparseable segment timestamp {0:?}")]
    Unparseable(String),
    #[error("local time {0} does not exist in the selected zone")]
    NonexistentLocalTime(NaiveDateTime),
}

/// Which calendar dates and file names are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    Utc,
    /// The host's local zone, DST rules included.
    Local,
    /// A constant offset.  Used where behaviour must not depend on the host.
    Fixed(FixedOffset),
}

impl TimeMode {
    pub fn from_local_flag(local: bool) -> Self {
        if local {
            Self::Local
        } else {
            Self::Utc
        }
    }

    /// Express an instant in this calendar.
    pub fn to_calendar<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> DateTime<FixedOffset> {
        match self {
            Self::Utc => instant.with_timezone(&Utc).fixed_offset(),
            Self::Local => instant.with_timezone(&Local).fixed_offset(),
            Self::Fixed(offset) => instant.with_timezone(offset),
        }
    }

    /// Interpret wall-clock fields in this calendar.  Ambiguous local times
    /// (DST fall-back) resolve to the earlier instant.
    pub fn from_wall_clock(
        &self,
        naive: NaiveDateTime,
    ) -> Result<DateTime<FixedOffset>, TimestampError> {
        let resolved = match self {
            Self::Utc => Some(Utc.from_utc_datetime(&naive).fixed_offset()),
            Self::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.fixed_offset()),
            Self::Fixed(offset) => offset.from_local_datetime(&naive).earliest(),
        };
        resolved.ok_or(TimestampError::NonexistentLocalTime(naive))
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        self.to_calendar(&Utc::now())
    }
}

/// Timestamp recovered from a raw segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTimestamp {
    pub instant: DateTime<FixedOffset>,
    /// The embedded offset was unusable and the 19-character prefix was used.
    pub truncated: bool,
}

/// Parse the timestamp embedded in a raw segment file name.
///
/// `capture_zone` is the zone the capture process expanded its strftime
/// pattern in; it is only consulted when the offset suffix is malformed.
pub fn parse_segment_name(
    file_name: &str,
    capture_zone: TimeMode,
) -> Result<SegmentTimestamp, TimestampError> {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| TimestampError::NoStem(file_name.to_string()))?;

    let date_string = stem.replace(' ', ":");

    if let Some(instant) = parse_with_offset(&date_string) {
        return Ok(SegmentTimestamp {
            instant,
            truncated: false,
        });
    }

    let prefix = date_string
        .get(..NAIVE_PREFIX_LEN)
        .ok_or_else(|| TimestampError::Unparseable(date_string.clone()))?;
    let naive = NaiveDateTime::parse_from_str(prefix, NAIVE_FORMAT)
        .map_err(|_| TimestampError::Unparseable(date_string.clone()))?;

    Ok(SegmentTimestamp {
        instant: capture_zone.from_wall_clock(naive)?,
        truncated: true,
    })
}

fn parse_with_offset(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s, RAW_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
}

/// `<base>/<YYYY>/<MM>/<DD>` for the calendar fields of `date`.
pub fn day_directory(base: &Path, date: &DateTime<FixedOffset>) -> PathBuf {
    base.join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()))
}

/// Canonical archived name: `YYYY-MM-DDTHH MM SS.<ext>`, fraction dropped.
pub fn archive_file_name(date: &DateTime<FixedOffset>, extension: &str) -> String {
    format!("{}.{}", date.format(ARCHIVE_FORMAT), extension)
}

/// Destination of a segment recorded at `instant`, filed by `mode`.
pub fn archive_path(
    storage: &Path,
    instant: &DateTime<FixedOffset>,
    mode: TimeMode,
    extension: &str,
) -> PathBuf {
    let filed = mode.to_calendar(instant);
    day_directory(storage, &filed).join(archive_file_name(&filed, extension))
}

/// Midnight at the start of the calendar day before `now`.
pub fn yesterday_midnight<Tz: TimeZone>(
    mode: TimeMode,
    now: &DateTime<Tz>,
) -> Result<DateTime<FixedOffset>, TimestampError> {
    let today = mode.to_calendar(now).date_naive();
    let yesterday = today - Duration::days(1);
    start_of_day(mode, yesterday)
}

fn start_of_day(mode: TimeMode, date: NaiveDate) -> Result<DateTime<FixedOffset>, TimestampError> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| TimestampError::Unparseable(date.to_string()))?;
    mode.from_wall_clock(midnight)
}

/// Next instant strictly after `now` whose wall-clock time is `hour:00:00`.
pub fn next_daily_run<Tz: TimeZone>(
    mode: TimeMode,
    now: &DateTime<Tz>,
    hour: u32,
) -> Result<DateTime<FixedOffset>, TimestampError> {
    let now = mode.to_calendar(now);
    let today = now.date_naive();
    for day in [today, today + Duration::days(1), today + Duration::days(2)] {
        let Some(naive) = day.and_hms_opt(hour, 0, 0) else {
            return Err(TimestampError::Unparseable(format!("hour {hour}")));
        };
        // A run hour swallowed by a DST gap moves to the following day.
        if let Ok(candidate) = mode.from_wall_clock(naive) {
            if candidate > now {
                return Ok(candidate);
            }
        }
    }
    Err(TimestampError::Unparseable(format!("hour {hour}")))
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn utc0() -> TimeMode {
        TimeMode::Fixed(FixedOffset::east_opt(0).unwrap())
    }

    fn plus_one() -> TimeMode {
        TimeMode::Fixed(FixedOffset::east_opt(3600).unwrap())
    }

    fn minus_five() -> TimeMode {
        TimeMode::Fixed(FixedOffset::west_opt(5 * 3600).unwrap())
    }

    #[test]
    fn test_parse_numeric_offset() {
        let ts = parse_segment_name("2024-03-10T14 30 00+0100.mkv", utc0()).unwrap();
        assert!(!ts.truncated);
        assert_eq!(ts.instant.to_rfc3339(), "2024-03-10T14:30:00+01:00");
    }

    #[test]
    fn test_parse_falls_back_to_prefix() {
        let ts =
            parse_segment_name("2024-03-10T14 30 00GMT Summer Time.mkv", plus_one()).unwrap();
        assert!(ts.truncated);
        assert_eq!(
            ts.instant.naive_local().format(NAIVE_FORMAT).to_string(),
            "2024-03-10T14:30:00"
        );
        assert_eq!(ts.instant.offset().local_minus_utc(), 3600);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(
            parse_segment_name("notes.mkv", utc0()),
            Err(TimestampError::Unparseable("notes".to_string()))
        );
        assert!(matches!(
            parse_segment_name("2024-13-45T99 99 99+0000.mkv", utc0()),
            Err(TimestampError::Unparseable(_))
        ));
    }

    #[test]
    fn test_parse_short_multibyte_name_does_not_panic() {
        assert!(parse_segment_name("2024-03-10T14 3é.mkv", utc0()).is_err());
    }

    #[test]
    fn test_archive_path_utc() {
        let ts = parse_segment_name("2024-03-10T14 30 00+0000.mkv", utc0()).unwrap();
        let path = archive_path(Path::new("root/cam1"), &ts.instant, TimeMode::Utc, "mkv");
        assert_eq!(path, PathBuf::from("root/cam1/2024/03/10/2024-03-10T14 30 00.mkv"));
    }

    #[test]
    fn test_archive_path_local_fixture() {
        let ts = parse_segment_name("2024-03-10T14 30 00+0000.mkv", utc0()).unwrap();
        let path = archive_path(Path::new("root/cam1"), &ts.instant, plus_one(), "mkv");
        assert_eq!(path, PathBuf::from("root/cam1/2024/03/10/2024-03-10T15 30 00.mkv"));
    }

    #[test]
    fn test_archive_path_crosses_midnight() {
        let ts = parse_segment_name("2024-03-10T02 00 00+0000.mkv", utc0()).unwrap();
        let path = archive_path(Path::new("root/cam1"), &ts.instant, minus_five(), "mkv");
        assert_eq!(path, PathBuf::from("root/cam1/2024/03/09/2024-03-09T21 00 00.mkv"));
    }

    #[test]
    fn test_archive_name_drops_fraction() {
        let dt = DateTime::parse_from_rfc3339("2024-03-10T14:30:00.750+00:00").unwrap();
        assert_eq!(archive_file_name(&dt, "mkv"), "2024-03-10T14 30 00.mkv");
    }

    #[test]
    fn test_yesterday_utc() {
        let now = DateTime::parse_from_rfc3339("2024-03-10T02:00:00Z").unwrap();
        let y = yesterday_midnight(TimeMode::Utc, &now).unwrap();
        assert_eq!(y.to_rfc3339(), "2024-03-09T00:00:00+00:00");
        assert_eq!(
            day_directory(Path::new("/rec/cam1"), &y),
            PathBuf::from("/rec/cam1/2024/03/09")
        );
    }

    #[test]
    fn test_yesterday_follows_calendar() {
        // 02:00Z on the 10th is still the 9th at -05:00, so yesterday is the 8th.
        let now = DateTime::parse_from_rfc3339("2024-03-10T02:00:00Z").unwrap();
        let y = yesterday_midnight(minus_five(), &now).unwrap();
        assert_eq!(y.to_rfc3339(), "2024-03-08T00:00:00-05:00");

        let now = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap();
        let y = yesterday_midnight(TimeMode::Utc, &now).unwrap();
        assert_eq!(y.date_naive(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_next_daily_run() {
        let before = DateTime::parse_from_rfc3339("2024-03-10T02:00:00Z").unwrap();
        let next = next_daily_run(TimeMode::Utc, &before, 3).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-10T03:00:00+00:00");

        let at = DateTime::parse_from_rfc3339("2024-03-10T03:00:00Z").unwrap();
        let next = next_daily_run(TimeMode::Utc, &at, 3).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-11T03:00:00+00:00");

        let next = next_daily_run(plus_one(), &before, 3).unwrap();
        assert_eq!(next.to_rfc3339(), "2024-03-11T03:00:00+01:00");
    }
}
