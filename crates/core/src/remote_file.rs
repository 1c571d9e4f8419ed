//! Remote file descriptions accepted at the engine boundary.

use crate::file_id::revision_from_url;
use crate::freshness::Version;
use serde::{Deserialize, Serialize};

/// Association between a stored file and the component that uses it.
///
/// An absent component id is stored as the empty string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileLink {
    pub component: String,
    #[serde(default)]
    pub component_id: String,
}

impl FileLink {
    pub fn new(component: impl Into<String>, component_id: Option<&str>) -> Self {
        Self {
            component: component.into(),
            component_id: component_id.unwrap_or_default().to_string(),
        }
    }

    /// Component id, or `None` when the link covers the whole component.
    pub fn component_id(&self) -> Option<&str> {
        (!self.component_id.is_empty()).then_some(self.component_id.as_str())
    }
}

/// Metadata accompanying a remote file URL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    #[serde(default)]
    pub revision: Option<i64>,
    #[serde(default)]
    pub time_modified: Option<i64>,
    /// Hosted by a third party; its freshness cannot be verified.
    #[serde(default)]
    pub is_external_file: bool,
    #[serde(default)]
    pub repository_type: Option<String>,
    /// Explicit destination key inside local storage.
    #[serde(default)]
    pub path: Option<String>,
}

impl FileMeta {
    /// Revision markers, taking the revision from the URL when none is given.
    pub fn version_for(&self, url: &str) -> Version {
        Version::new(
            self.revision.or_else(|| revision_from_url(url)),
            self.time_modified,
        )
    }
}

/// File descriptor as returned by remote listing APIs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(alias = "fileurl")]
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default, alias = "timemodified")]
    pub time_modified: Option<i64>,
    #[serde(default, alias = "isexternalfile")]
    pub is_external_file: bool,
    #[serde(default, alias = "repositorytype")]
    pub repository_type: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
}

/// A remote file given either as a bare URL or as a descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteFile {
    ByUrl { url: String, meta: FileMeta },
    ByDescriptor { descriptor: FileDescriptor, meta: FileMeta },
}

impl RemoteFile {
    pub fn url(url: impl Into<String>) -> Self {
        Self::ByUrl {
            url: url.into(),
            meta: FileMeta::default(),
        }
    }

    pub fn with_meta(url: impl Into<String>, meta: FileMeta) -> Self {
        Self::ByUrl {
            url: url.into(),
            meta,
        }
    }

    pub fn descriptor(descriptor: FileDescriptor) -> Self {
        Self::ByDescriptor {
            descriptor,
            meta: FileMeta::default(),
        }
    }

    /// Canonical `(url, meta)` pair. Explicit metadata wins over descriptor fields.
    pub fn into_parts(self) -> (String, FileMeta) {
        match self {
            Self::ByUrl { url, meta } => (url, meta),
            Self::ByDescriptor { descriptor, meta } => {
                let merged = FileMeta {
                    revision: meta.revision,
                    time_modified: meta.time_modified.or(descriptor.time_modified),
                    is_external_file: meta.is_external_file || descriptor.is_external_file,
                    repository_type: meta.repository_type.or(descriptor.repository_type),
                    path: meta.path,
                };
                (descriptor.url, merged)
            }
        }
    }
}
