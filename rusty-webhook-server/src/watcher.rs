//! Watches the configuration file for changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Events arriving this long after a change are considered part of the same save.
const SETTLE_TIME: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum ConfigSignal {
    /// The file was written, replaced or removed.
    Changed(Event),
    /// The platform watcher reported a problem, the file may no longer be watched.
    Error(notify::Error),
}

/// Turns the callbacks of a [`RecommendedWatcher`] into awaitable [`ConfigSignal`]s.
pub struct ConfigWatcher {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    watched: Option<PathBuf>,
    /// Feeds the same queue as the platform watcher.
    #[cfg(test)]
    sender: mpsc::UnboundedSender<notify::Result<Event>>,
}

impl ConfigWatcher {
    pub fn new() -> notify::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        #[cfg(test)]
        let sender = tx.clone();
        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        Ok(Self {
            watcher,
            events,
            watched: None,
            #[cfg(test)]
            sender,
        })
    }

    /// Registers `path`, replacing the previous registration.
    ///
    /// Editors often replace the file instead of writing it, which silently ends a
    /// watch on the old file, so this is called again for every generation.
    pub fn watch(&mut self, path: &Path) -> notify::Result<()> {
        if let Some(previous) = self.watched.take() {
            // Fails if the old file is gone, which is fine.
            let _ = self.watcher.unwatch(&previous);
        }
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        log::debug!(path:debug; "watching config");
        self.watched = Some(path.to_path_buf());
        Ok(())
    }

    /// Queues `res` as if the platform watcher had reported it.
    #[cfg(test)]
    pub fn inject(&self, res: notify::Result<Event>) {
        let _ = self.sender.send(res);
    }

    /// Drops every signal received so far.
    pub fn clear(&mut self) {
        while let Ok(res) = self.events.try_recv() {
            if let Err(e) = res {
                log::warn!(error:display = e; "config watcher error");
            }
        }
    }

    /// Waits for the next change or error.
    ///
    /// Reads of the file are ignored. After a change, further events within
    /// [`SETTLE_TIME`] are swallowed so that one save yields one signal.
    pub async fn next(&mut self) -> ConfigSignal {
        loop {
            let Some(res) = self.events.recv().await else {
                // The sender lives in the callback of `self.watcher`.
                return std::future::pending().await;
            };
            match res {
                Ok(event) if is_change(&event.kind) => {
                    tokio::time::sleep(SETTLE_TIME).await;
                    self.clear();
                    return ConfigSignal::Changed(event);
                }
                Ok(event) => log::trace!("ignoring {event:?}"),
                Err(e) => return ConfigSignal::Error(e),
            }
        }
    }
}

fn is_change(kind: &EventKind) -> bool {
    !matches!(kind, EventKind::Access(_))
}
