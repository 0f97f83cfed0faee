//! Module folder watcher
//!
//! Keeps the set of module files known to be loaded and emits one
//! [`LifecycleEvent`] per module it loads. The folder is listed once at
//! startup, then followed through file notifications. Loaded modules are
//! handed to the route publisher over a bounded channel, so the watcher is
//! paced by how fast routes get published.
//!
//! A module is only loaded once its writer is done with it: on close after
//! write, on a rename into the folder, or when found by the startup scan. A
//! bare create is ignored since the file is usually still being written.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex_lite::Regex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::handler::{LoadedHandler, ModuleLoader};

/// File names treated as modules
pub const MODULE_PATTERN: &str = r"^[a-z0-9]+\.so$";

static MODULE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MODULE_PATTERN).expect("module pattern is a valid regex"));

/// What to do when a module file that is already loaded changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPolicy {
    /// Known module names are never loaded again
    #[default]
    CreateOnly,
    /// A rewritten module file is loaded again and replaces its route
    ReloadOnWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleAction {
    Added,
    Updated,
}

/// A module was loaded and is ready to be published
#[derive(Debug)]
pub struct LifecycleEvent {
    pub module: String,
    pub action: ModuleAction,
    pub handler: LoadedHandler,
}

/// What the watcher knows about one module file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    pub loaded: bool,
    fingerprint: Option<Fingerprint>,
}

impl ModuleDescriptor {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            loaded: false,
            fingerprint: None,
        }
    }
}

/// Cheap identity of a file's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl From<&Metadata> for Fingerprint {
    fn from(metadata: &Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Failures that stop the watcher. Fatal to the host.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("failed to read module folder {path:?}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("module folder notification failed: {0}")]
    Notify(#[from] notify::Error),

    #[error("lifecycle event channel closed")]
    ChannelClosed,

    #[error("watch task failed: {0}")]
    Task(String),
}

/// Notification kinds the watcher reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    /// The file may now hold a complete module
    Present,
    Removed,
}

fn classify(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(Change::Present),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Change::Present),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Change::Removed),
        EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Remove(_) => Some(Change::Removed),
        _ => None,
    }
}

fn module_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    MODULE_NAME.is_match(name).then(|| name.to_string())
}

/// Resolves once a stop is requested or the handle is dropped
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

pub struct ModuleWatcher {
    folder: PathBuf,
    loader: Arc<dyn ModuleLoader>,
    events: mpsc::Sender<LifecycleEvent>,
    policy: ReloadPolicy,
    /// Only touched by the watcher task
    modules: HashMap<String, ModuleDescriptor>,
    /// Moved into the [`WatcherHandle`] on start
    stop_signal: Option<watch::Sender<bool>>,
    stop: watch::Receiver<bool>,
}

impl ModuleWatcher {
    pub fn new(
        folder: impl Into<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
        events: mpsc::Sender<LifecycleEvent>,
        policy: ReloadPolicy,
    ) -> Self {
        let (stop_signal, stop) = watch::channel(false);
        Self {
            folder: folder.into(),
            loader,
            events,
            policy,
            modules: HashMap::new(),
            stop_signal: Some(stop_signal),
            stop,
        }
    }

    /// Subscribe to the folder and spawn the watch task.
    pub fn start(mut self) -> Result<WatcherHandle, WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        // Subscribe before the initial scan so nothing created in between is missed.
        watcher.watch(&self.folder, RecursiveMode::NonRecursive)?;

        let stop = self.stop_signal.take();
        let task = tokio::spawn(self.run(watcher, raw_rx));

        Ok(WatcherHandle { stop, task })
    }

    async fn run(
        mut self,
        watcher: RecommendedWatcher,
        mut notifications: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    ) -> Result<(), WatchError> {
        tracing::info!(folder = ?self.folder, policy = ?self.policy, "Watching module folder");
        let mut stop = self.stop.clone();

        self.scan().await?;

        let result = loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => break Ok(()),
                notification = notifications.recv() => match notification {
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle_notification(event).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(WatchError::Notify(e)),
                    None => break Ok(()),
                },
            }
        };

        drop(watcher);
        tracing::info!(folder = ?self.folder, "Stopped watching module folder");
        result
    }

    /// Load every module already present in the folder
    pub async fn scan(&mut self) -> Result<(), WatchError> {
        let scan_error = |source: std::io::Error| WatchError::Scan {
            path: self.folder.clone(),
            source,
        };

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.folder).await.map_err(scan_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(scan_error)? {
            if let Some(name) = module_name(&entry.path()) {
                names.push(name);
            }
        }
        names.sort();

        tracing::debug!(folder = ?self.folder, candidates = names.len(), "Initial module scan");
        for name in names {
            if self.stopping() {
                tracing::debug!(folder = ?self.folder, "Stop requested, initial scan cut short");
                break;
            }
            self.discover(&name).await?;
        }
        Ok(())
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    pub async fn handle_notification(&mut self, event: notify::Event) -> Result<(), WatchError> {
        let Some(change) = classify(&event.kind) else {
            return Ok(());
        };

        for path in &event.paths {
            let Some(name) = module_name(path) else {
                continue;
            };
            match change {
                Change::Present => self.discover(&name).await?,
                Change::Removed => self.forget(&name),
            }
        }
        Ok(())
    }

    async fn discover(&mut self, name: &str) -> Result<(), WatchError> {
        let path = self.folder.join(name);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(module = name, error = %e, "Module file vanished before loading");
                return Ok(());
            }
        };
        if !metadata.is_file() {
            return Ok(());
        }
        if metadata.len() == 0 {
            tracing::debug!(module = name, "Module file still empty, waiting for writer");
            return Ok(());
        }
        let fingerprint = Fingerprint::from(&metadata);

        let policy = self.policy;
        let descriptor = self
            .modules
            .entry(name.to_string())
            .or_insert_with(|| ModuleDescriptor::new(name));
        let action = match (descriptor.loaded, policy) {
            (false, _) => ModuleAction::Added,
            (true, ReloadPolicy::CreateOnly) => {
                tracing::trace!(module = name, "Module already loaded, skipping");
                return Ok(());
            }
            (true, ReloadPolicy::ReloadOnWrite) if descriptor.fingerprint == Some(fingerprint) => {
                tracing::trace!(module = name, "Module unchanged, skipping");
                return Ok(());
            }
            (true, ReloadPolicy::ReloadOnWrite) => ModuleAction::Updated,
        };

        let loader = Arc::clone(&self.loader);
        let folder = self.folder.clone();
        let file_name = name.to_string();
        let handler = match tokio::task::spawn_blocking(move || loader.load(&folder, &file_name)).await {
            Ok(Ok(handler)) => handler,
            Ok(Err(e)) => {
                tracing::warn!(module = name, error = %e, "Failed to load module, skipping");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(module = name, error = %e, "Module loader task failed");
                return Ok(());
            }
        };

        if let Some(descriptor) = self.modules.get_mut(name) {
            descriptor.loaded = true;
            descriptor.fingerprint = Some(fingerprint);
            tracing::debug!(module = %descriptor.name, ?action, "Module ready to publish");
        }

        let event = LifecycleEvent {
            module: name.to_string(),
            action,
            handler,
        };
        // The publisher may be gone or stalled by the time shutdown starts.
        let mut stop = self.stop.clone();
        tokio::select! {
            sent = self.events.send(event) => sent.map_err(|_| WatchError::ChannelClosed),
            _ = stop_requested(&mut stop) => {
                tracing::debug!(module = name, "Stop requested, module not handed off");
                Ok(())
            }
        }
    }

    fn forget(&mut self, name: &str) {
        match self.policy {
            ReloadPolicy::CreateOnly => {
                tracing::debug!(module = name, "Module file removed, registration kept");
            }
            ReloadPolicy::ReloadOnWrite => {
                if self.modules.remove(name).is_some() {
                    tracing::info!(module = name, "Module file removed, route stays bound until replaced");
                }
            }
        }
    }

    #[cfg(test)]
    pub fn descriptor(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    /// Names of successfully loaded modules, sorted
    #[cfg(test)]
    pub fn loaded_modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .modules
            .values()
            .filter(|d| d.loaded)
            .map(|d| d.name.as_str())
            .collect();
        names.sort();
        names
    }
}

/// Running watch task
pub struct WatcherHandle {
    stop: Option<watch::Sender<bool>>,
    task: JoinHandle<Result<(), WatchError>>,
}

impl WatcherHandle {
    /// Ask the watch task to finish
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.send_replace(true);
        }
    }

    /// Wait for the watch task to end. Call at most once to completion.
    pub async fn join(&mut self) -> Result<(), WatchError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(WatchError::Task(e.to_string())),
        }
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
