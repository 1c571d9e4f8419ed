//! Package identity and the package status state machine.

use crate::hash::ContentHash;
use crate::status::DownloadStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Identifier of a package: a hash of its owning component and component id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    pub fn new(component: &str, component_id: &str) -> Self {
        let hash = ContentHash::compute(format!("{component}#{component_id}").as_bytes());
        Self(hash.identity_hex())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted lifecycle state of one package.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageState {
    pub status: DownloadStatus,
    pub previous_status: Option<DownloadStatus>,
    pub download_time: Option<OffsetDateTime>,
    pub previous_download_time: Option<OffsetDateTime>,
    /// Opaque caller payload, kept across transitions unless replaced.
    pub extra: Option<String>,
}

impl PackageState {
    /// Compute the state after moving to `status`.
    ///
    /// Returns `None` when the package already has that status.
    pub fn transition(
        current: Option<&PackageState>,
        status: DownloadStatus,
        extra: Option<String>,
        now: OffsetDateTime,
    ) -> Option<PackageState> {
        if current.is_some_and(|c| c.status == status) {
            return None;
        }

        let previous_status = current.map(|c| c.status);
        let download_time = current.and_then(|c| c.download_time);
        let previous_download_time = current.and_then(|c| c.previous_download_time);
        let extra = extra.or_else(|| current.and_then(|c| c.extra.clone()));

        let next = match status {
            DownloadStatus::Downloading => PackageState {
                status,
                previous_status,
                download_time,
                previous_download_time: download_time.or(previous_download_time),
                extra,
            },
            DownloadStatus::Downloaded => PackageState {
                status,
                previous_status,
                download_time: Some(now),
                previous_download_time,
                extra,
            },
            _ => PackageState {
                status,
                previous_status,
                download_time,
                previous_download_time,
                extra,
            },
        };
        Some(next)
    }

    /// Return to the status that preceded the current one.
    ///
    /// Leaving `Downloading` also restores the download time recorded when
    /// the attempt started.
    pub fn rolled_back(&self) -> PackageState {
        let status = self.previous_status.unwrap_or(DownloadStatus::NotDownloaded);
        let download_time = if self.status == DownloadStatus::Downloading {
            self.previous_download_time
        } else {
            self.download_time
        };
        PackageState {
            status,
            previous_status: self.previous_status,
            download_time,
            previous_download_time: self.previous_download_time,
            extra: self.extra.clone(),
        }
    }
}
