use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::dispatcher::{Dispatcher, FireContext};
use crate::core::profile::{Catalog, TriggerConfig, TriggerKind};
use crate::core::state::FireSource;

/// Leading-edge debounce keyed by `(trigger_id, path)`.
///
/// Entries are dropped once their window has passed, so the map only holds
/// paths that fired recently.
#[derive(Debug, Default)]
pub struct Debouncer {
    last_fired: HashMap<(String, PathBuf), (Instant, Duration)>,
}

impl Debouncer {
    pub fn should_fire(&mut self, trigger_id: &str, path: &Path, window: Duration, now: Instant) -> bool {
        let key = (trigger_id.to_string(), path.to_path_buf());
        if let Some((last, _)) = self.last_fired.get(&key)
            && now.saturating_duration_since(*last) < window
        {
            return false;
        }
        self.last_fired
            .retain(|_, (last, window)| now.saturating_duration_since(*last) < *window);
        self.last_fired.insert(key, (now, window));
        true
    }
}

/// Watch configuration the current watcher was built from.
type WatchSet = BTreeSet<(String, PathBuf, bool, u64)>;

fn desired_watches(catalog: &Catalog) -> (WatchSet, Vec<TriggerConfig>) {
    let triggers: Vec<TriggerConfig> = catalog
        .triggers()
        .filter(|t| t.enabled && t.kind == TriggerKind::FileEvent)
        .filter(|t| {
            if t.watch_path.is_none() {
                warn!(trigger_id = %t.trigger_id, "file_event trigger has no watch_path, skipping");
            }
            t.watch_path.is_some()
        })
        .cloned()
        .collect();
    let set = triggers
        .iter()
        .filter_map(|t| {
            t.watch_path
                .clone()
                .map(|p| (t.trigger_id.clone(), p, t.recursive, t.debounce_seconds))
        })
        .collect();
    (set, triggers)
}

struct ActiveWatch {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

/// Owns the notify watcher for every enabled `file_event` trigger and
/// rebuilds it when the declarations change.
pub struct FileWatches {
    dispatcher: Arc<Dispatcher>,
    current: WatchSet,
    active: Option<ActiveWatch>,
}

impl FileWatches {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            current: WatchSet::new(),
            active: None,
        }
    }

    pub fn sync(&mut self, catalog: &Catalog) {
        let (desired, triggers) = desired_watches(catalog);
        if desired == self.current && (self.active.is_some() || desired.is_empty()) {
            return;
        }
        self.stop();
        self.current = desired;
        if triggers.is_empty() {
            return;
        }
        match start_watching(triggers, self.dispatcher.clone()) {
            Ok(active) => self.active = Some(active),
            Err(e) => warn!("Failed to start file watcher: {}", e),
        }
    }

    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

impl Drop for FileWatches {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_watching(
    triggers: Vec<TriggerConfig>,
    dispatcher: Arc<Dispatcher>,
) -> notify::Result<ActiveWatch> {
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;

    for trigger in &triggers {
        let Some(path) = &trigger.watch_path else {
            continue;
        };
        let mode = if trigger.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        match watcher.watch(path, mode) {
            Ok(()) => info!(trigger_id = %trigger.trigger_id, path = %path.display(), "Watching path"),
            Err(e) => warn!(
                trigger_id = %trigger.trigger_id,
                path = %path.display(),
                "Cannot watch path: {}",
                e
            ),
        }
    }

    let task = tokio::spawn(async move {
        let mut debouncer = Debouncer::default();
        while let Some(res) = rx.recv().await {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("File watch error: {}", e);
                    continue;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            for changed in &event.paths {
                for trigger in matching_triggers(&triggers, changed) {
                    let window = Duration::from_secs(trigger.debounce_seconds);
                    if !debouncer.should_fire(&trigger.trigger_id, changed, window, Instant::now()) {
                        debug!(trigger_id = %trigger.trigger_id, "Debounced file event");
                        continue;
                    }
                    let dispatcher = dispatcher.clone();
                    let trigger = trigger.clone();
                    let detail = changed.display().to_string();
                    tokio::spawn(async move {
                        let ctx = FireContext::new(FireSource::FileEvent).with_detail(detail);
                        if let Err(e) = dispatcher.fire(&trigger, ctx).await {
                            warn!(trigger_id = %trigger.trigger_id, "File trigger dispatch failed: {}", e);
                        }
                    });
                }
            }
        }
    });

    Ok(ActiveWatch {
        _watcher: watcher,
        task,
    })
}

fn matching_triggers<'a>(
    triggers: &'a [TriggerConfig],
    changed: &'a Path,
) -> impl Iterator<Item = &'a TriggerConfig> + 'a {
    triggers.iter().filter(move |trigger| {
        let Some(root) = &trigger.watch_path else {
            return false;
        };
        if changed == root.as_path() {
            return true;
        }
        if trigger.recursive {
            changed.starts_with(root)
        } else {
            changed.parent() == Some(root.as_path())
        }
    })
}
