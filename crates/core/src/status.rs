//! Download status of files and packages, and how statuses roll up.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a file, a package or a collection of either.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Nothing downloadable.
    NotDownloadable,
    NotDownloaded,
    Downloading,
    Downloaded,
    /// A local copy exists but the remote has changed, or may have.
    Outdated,
}

impl DownloadStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotDownloadable => "not_downloadable",
            Self::NotDownloaded => "not_downloaded",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Outdated => "outdated",
        }
    }

    /// Parse a stored status string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "not_downloadable" => Ok(Self::NotDownloadable),
            "not_downloaded" => Ok(Self::NotDownloaded),
            "downloading" => Ok(Self::Downloading),
            "downloaded" => Ok(Self::Downloaded),
            "outdated" => Ok(Self::Outdated),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }

    /// Fold `next` into an accumulated status.
    ///
    /// A single missing item makes the whole set not downloaded; otherwise
    /// outdated beats downloading, which beats downloaded.
    pub fn combine(self, next: DownloadStatus) -> DownloadStatus {
        use DownloadStatus::*;
        match (self, next) {
            (_, NotDownloaded) => NotDownloaded,
            (NotDownloadable, Downloaded) => Downloaded,
            (NotDownloadable | Downloaded, Downloading) => Downloading,
            (current, Outdated) if current != NotDownloaded => Outdated,
            (current, _) => current,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Reduce a sequence of statuses into one, starting from `NotDownloadable`.
pub fn aggregate<I>(statuses: I) -> DownloadStatus
where
    I: IntoIterator<Item = DownloadStatus>,
{
    statuses
        .into_iter()
        .fold(DownloadStatus::NotDownloadable, DownloadStatus::combine)
}
