//! Change notifications for files and packages.

use larder_core::{DownloadStatus, FileLink};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// What happened to a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    /// Queued for download.
    Downloading,
    /// A download finished, successfully or not.
    Download,
    Deleted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    pub site_id: String,
    pub file_id: String,
    pub action: FileAction,
    /// Outcome for `Download`, absent otherwise.
    pub success: Option<bool>,
    /// Set when the event is also addressed to one linked component.
    pub component: Option<FileLink>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PackageStatusEvent {
    pub site_id: String,
    pub component: String,
    pub component_id: String,
    pub status: DownloadStatus,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    File(FileEvent),
    PackageStatus(PackageStatusEvent),
}

/// Which events a subscriber receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    All,
    File {
        site_id: String,
        file_id: String,
    },
    /// File and package events for one component. `component_id: None`
    /// matches every id of the component.
    Component {
        site_id: String,
        component: String,
        component_id: Option<String>,
    },
}

impl EventFilter {
    pub fn matches(&self, event: &EngineEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::File { site_id, file_id }, EngineEvent::File(e)) => {
                e.component.is_none() && &e.site_id == site_id && &e.file_id == file_id
            }
            (EventFilter::File { .. }, EngineEvent::PackageStatus(_)) => false,
            (
                EventFilter::Component {
                    site_id,
                    component,
                    component_id,
                },
                event,
            ) => {
                let (event_site, event_component, event_id) = match event {
                    EngineEvent::File(FileEvent {
                        site_id,
                        component: Some(link),
                        ..
                    }) => (site_id, &link.component, &link.component_id),
                    EngineEvent::File(_) => return false,
                    EngineEvent::PackageStatus(e) => (&e.site_id, &e.component, &e.component_id),
                };
                event_site == site_id
                    && event_component == component
                    && component_id.as_ref().is_none_or(|id| id == event_id)
            }
        }
    }
}

/// Broadcast hub for engine events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a file event once for the file itself and once per linked component.
    pub fn emit_file(
        &self,
        site_id: &str,
        file_id: &str,
        action: FileAction,
        success: Option<bool>,
        links: &[FileLink],
    ) {
        let event = |component: Option<FileLink>| {
            EngineEvent::File(FileEvent {
                site_id: site_id.to_string(),
                file_id: file_id.to_string(),
                action,
                success,
                component,
            })
        };
        self.emit(event(None));
        for link in links {
            self.emit(event(Some(link.clone())));
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter,
        }
    }
}

/// Receiver of the events matching one filter.
pub struct EventStream {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
}

impl EventStream {
    /// Next matching event, or `None` once the engine is gone.
    ///
    /// Events dropped because this subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
