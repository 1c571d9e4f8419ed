//! Freshness rules shared by the registry and the download queue.

/// Revision markers known for one copy of a remote file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Version {
    pub revision: Option<i64>,
    pub time_modified: Option<i64>,
}

impl Version {
    pub fn new(revision: Option<i64>, time_modified: Option<i64>) -> Self {
        Self {
            revision,
            time_modified,
        }
    }

    /// True when neither marker carries a usable value.
    pub fn is_unversioned(&self) -> bool {
        self.revision.unwrap_or(0) == 0 && self.time_modified.unwrap_or(0) == 0
    }

    /// True when `requested` describes a later remote copy than `self`.
    pub fn is_older_than(&self, requested: &Version) -> bool {
        requested.revision.unwrap_or(0) > self.revision.unwrap_or(0)
            || requested.time_modified.unwrap_or(0) > self.time_modified.unwrap_or(0)
    }
}

/// A stored copy whose freshness cannot be checked against the remote.
pub fn is_freshness_unknown(stale: bool, is_external_file: bool, stored: &Version) -> bool {
    stale || is_external_file || stored.is_unversioned()
}

/// A stored copy that must not be served while online.
pub fn is_outdated(stale: bool, stored: &Version, requested: &Version) -> bool {
    stale || stored.is_older_than(requested)
}
