//! Location IO: resolving storage locations to paths and listing existing ones.
//!
//! A *location* is a `/` separated string relative to the IO's base location. Location
//! providers use [`LocationIo::list`] to pick names that do not collide with existing
//! data; formatters use [`LocationIo::to_path`] to find their files.

use crate::error::DatasetResult;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Storage namespace that data set locations live in.
pub trait LocationIo: Send + Sync + Debug {
    /// Root that relative locations are resolved against
    fn base_location(&self) -> &Path;

    /// Filesystem path of a location
    fn to_path(&self, location: &str) -> PathBuf {
        let location = Path::new(location);
        if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.base_location().join(location)
        }
    }

    /// Existing locations whose last component starts with the last component of
    /// `location`, in sorted order.
    fn list(&self, location: &str) -> DatasetResult<Vec<String>>;

    /// Whether anything exists at `location`
    fn exists(&self, location: &str) -> bool {
        self.to_path(location).exists()
    }

    /// Join location parts with `/`, skipping empty parts
    fn join(&self, parts: &[&str]) -> String {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.trim_end_matches('/'))
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Filesystem-backed [`LocationIo`].
#[derive(Debug, Clone)]
pub struct DiskIo {
    base_location: PathBuf,
}

impl DiskIo {
    /// IO rooted at `base_location`
    pub fn new(base_location: impl AsRef<Path>) -> Self {
        Self {
            base_location: base_location.as_ref().to_path_buf(),
        }
    }
}

impl Default for DiskIo {
    fn default() -> Self {
        Self::new(".")
    }
}

fn split_location(location: &str) -> (&str, &str) {
    match location.rfind('/') {
        Some(pos) => (&location[..pos], &location[pos + 1..]),
        None => ("", location),
    }
}

impl LocationIo for DiskIo {
    fn base_location(&self) -> &Path {
        &self.base_location
    }

    fn list(&self, location: &str) -> DatasetResult<Vec<String>> {
        let (parent, prefix) = split_location(location);
        let dir = self.to_path(parent);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                matches.push(self.join(&[parent, &name]));
            }
        }
        matches.sort();
        Ok(matches)
    }
}
