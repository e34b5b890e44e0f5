//! Change notifications for the `latest-dump` marker.
//!
//! The watch is held on the working directory rather than on the marker
//! itself, so it survives the marker being deleted or replaced. Only write
//! events are acted on. Editors that save by writing a new file and renaming
//! it over the marker produce no write event for it; such updates are not
//! picked up until the next real write.

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// What happened to the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// Content was written. The only actionable kind.
    Written,
    /// The file was created, renamed or removed.
    Replaced,
}

/// Map a raw notification onto the events we care about.
///
/// Only a content modification counts as a write. Opening and closing the
/// file for writing (as `touch` does) or changing its metadata does not.
pub fn classify(kind: &EventKind) -> Option<WatchEvent> {
    match kind {
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            Some(WatchEvent::Written)
        }
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            Some(WatchEvent::Replaced)
        }
        _ => None,
    }
}

/// Keeps the OS watch alive. Dropping it closes the event channel.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl FileWatcher {
    /// Watch `dir` and forward actionable events for `file_name`.
    pub fn spawn(
        dir: &Path,
        file_name: &str,
    ) -> notify::Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = OsString::from(file_name);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("File watcher error: {}", e);
                    return;
                }
            };
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(target.as_os_str()))
            {
                return;
            }
            match classify(&event.kind) {
                Some(WatchEvent::Written) => {
                    let _ = tx.send(WatchEvent::Written);
                }
                Some(WatchEvent::Replaced) => {
                    tracing::debug!("Marker replaced ({:?}), ignoring", event.kind);
                }
                None => {}
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let path = dir.join(file_name);
        tracing::debug!("Watching {}", path.display());
        Ok((
            Self {
                _watcher: watcher,
                path,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
