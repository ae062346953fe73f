//! Location providers: generate unique storage locations for new data sets.

use crate::data::io::LocationIo;
use crate::error::{DatasetError, DatasetResult};
use chrono::{DateTime, Local};
use std::fmt::Write;

/// Location provider driven by a format string.
///
/// Placeholders:
/// - `{date}`: the current date (`%Y-%m-%d` by default)
/// - `{time}`: the current time (`%H-%M-%S` by default)
/// - `{name}`: the data set name, `data` when none is given
/// - `{counter}`: a zero-padded run counter, one more than the largest counter
///   already present among locations sharing the text before `{counter}`
///
/// Without `{counter}`, a location that already exists gets `_2`, `_3`, ... appended.
///
/// ```
/// use daq_dataset::data::location::FormatLocation;
/// use daq_dataset::data::io::DiskIo;
///
/// let dir = tempfile::tempdir()?;
/// let provider = FormatLocation::new("{date}/#{counter}_{name}");
/// let location = provider.location(&DiskIo::new(dir.path()), Some("sweep"))?;
/// assert!(location.ends_with("#001_sweep"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct FormatLocation {
    fmt: String,
    date_format: String,
    time_format: String,
}

impl Default for FormatLocation {
    fn default() -> Self {
        Self::new("{date}/{time}")
    }
}

impl FormatLocation {
    /// Provider for a format string
    pub fn new(fmt: impl Into<String>) -> Self {
        Self {
            fmt: fmt.into(),
            date_format: "%Y-%m-%d".to_string(),
            time_format: "%H-%M-%S".to_string(),
        }
    }

    /// Override the chrono formats used for `{date}` and `{time}`
    pub fn with_formats(mut self, date_format: impl Into<String>, time_format: impl Into<String>) -> Self {
        self.date_format = date_format.into();
        self.time_format = time_format.into();
        self
    }

    /// The format string
    pub fn fmt(&self) -> &str {
        &self.fmt
    }

    /// New unique location, stamped with the current local time
    pub fn location(&self, io: &dyn LocationIo, name: Option<&str>) -> DatasetResult<String> {
        self.location_at(io, name, Local::now())
    }

    /// New unique location, stamped with `now`
    pub fn location_at(
        &self,
        io: &dyn LocationIo,
        name: Option<&str>,
        now: DateTime<Local>,
    ) -> DatasetResult<String> {
        let filled = self
            .fmt
            .replace("{date}", &render_time(now, &self.date_format)?)
            .replace("{time}", &render_time(now, &self.time_format)?)
            .replace("{name}", name.unwrap_or("data"));

        if let Some(pos) = filled.find("{counter}") {
            let prefix = &filled[..pos];
            let mut highest = 0u64;
            for existing in io.list(prefix)? {
                let Some(rest) = existing.strip_prefix(prefix) else {
                    continue;
                };
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(counter) = digits.parse::<u64>() {
                    highest = highest.max(counter);
                }
            }
            return Ok(filled.replacen("{counter}", &format!("{:03}", highest + 1), 1));
        }

        if !io.exists(&filled) {
            return Ok(filled);
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{filled}_{suffix}");
            if !io.exists(&candidate) {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }
}

fn render_time(now: DateTime<Local>, format: &str) -> DatasetResult<String> {
    let mut out = String::new();
    write!(out, "{}", now.format(format))
        .map_err(|_| DatasetError::Configuration(format!("invalid date/time format '{format}'")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::io::DiskIo;
    use crate::testing::MatchIo;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2016, 7, 29, 13, 45, 9).unwrap()
    }

    #[test]
    fn counter_starts_at_one() {
        let provider = FormatLocation::new("{date}/#{counter}_{name}_{time}");
        let loc = provider
            .location_at(&MatchIo::new(vec![]), Some("sweep"), fixed_time())
            .unwrap();
        assert_eq!(loc, "2016-07-29/#001_sweep_13-45-09");
    }

    #[test]
    fn counter_follows_existing_matches() {
        let provider = FormatLocation::new("{date}/#{counter}_{name}_{time}");
        let loc = provider
            .location_at(&MatchIo::new(vec![1, 4, 2]), None, fixed_time())
            .unwrap();
        assert_eq!(loc, "2016-07-29/#005_data_13-45-09");
    }

    #[test]
    fn existing_location_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let io = DiskIo::new(dir.path());
        let provider = FormatLocation::new("{date}_{name}");

        let first = provider.location_at(&io, Some("run"), fixed_time()).unwrap();
        assert_eq!(first, "2016-07-29_run");
        std::fs::create_dir_all(io.to_path(&first)).unwrap();

        let second = provider.location_at(&io, Some("run"), fixed_time()).unwrap();
        assert_eq!(second, "2016-07-29_run_2");
        std::fs::create_dir_all(io.to_path(&second)).unwrap();

        let third = provider.location_at(&io, Some("run"), fixed_time()).unwrap();
        assert_eq!(third, "2016-07-29_run_3");
    }

    #[test]
    fn counter_on_disk() {
        let dir = TempDir::new().unwrap();
        let io = DiskIo::new(dir.path());
        let provider = FormatLocation::new("runs/#{counter}_{name}");
        let first = provider.location(&io, Some("a")).unwrap();
        assert_eq!(first, "runs/#001_a");
        std::fs::create_dir_all(io.to_path(&first)).unwrap();
        assert_eq!(provider.location(&io, Some("b")).unwrap(), "runs/#002_b");
    }

    #[test]
    fn custom_formats() {
        let provider = FormatLocation::new("{date}{time}").with_formats("%Y%m%d", "_%H%M");
        let loc = provider
            .location_at(&MatchIo::new(vec![]), None, fixed_time())
            .unwrap();
        assert_eq!(loc, "20160729_1345");
        assert_eq!(provider.fmt(), "{date}{time}");
    }

    #[test]
    fn invalid_time_format_is_an_error() {
        let provider = FormatLocation::new("{date}_{name}").with_formats("%Q", "%H");
        let err = provider
            .location_at(&MatchIo::new(vec![]), Some("run"), fixed_time())
            .unwrap_err();
        assert!(matches!(err, DatasetError::Configuration(ref msg) if msg.contains("%Q")), "{err}");
    }
}
