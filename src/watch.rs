//! Continuous-watch coordinator.
//!
//! One tokio event loop hosts every file-system watcher, the split-file
//! polling timer and the periodic rediscovery pass. Ingestion itself is
//! blocking (SQLite, git subprocesses) and runs on the blocking pool behind
//! a single store lock; watcher callbacks only enqueue source ids.
//!
//! Watch strategy by kind: tailable transcript files get a notify
//! subscription with a short stable-write debounce; split-file sources are
//! polled (their storage trees hold tens of thousands of leaf files, which
//! makes per-file subscriptions pathological); git repositories watch the
//! reflog at `.git/logs/HEAD`.

use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::adapter::SourceKind;
use crate::config::WatchConfig;
use crate::ingest::Orchestrator;

pub struct WatchCoordinator {
    orchestrator: Arc<Mutex<Orchestrator>>,
    config: WatchConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl WatchCoordinator {
    pub fn new(orchestrator: Arc<Mutex<Orchestrator>>, config: WatchConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            orchestrator,
            config,
            shutdown_tx,
            handle: None,
        }
    }

    /// Spawn the coordinator loop. Calling start on a running coordinator
    /// is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let orchestrator = Arc::clone(&self.orchestrator);
        let config = self.config.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(async move {
            run_loop(orchestrator, config, shutdown_rx).await;
        }));
    }

    /// Tear down watchers and timers, letting any in-flight tick finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Start and block until SIGINT/SIGTERM, then stop gracefully.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        self.start();
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Source descriptor snapshot used to decide watch strategy.
#[derive(Debug, Clone)]
struct WatchedSource {
    source_id: String,
    kind: SourceKind,
    locator: String,
}

async fn run_loop(
    orchestrator: Arc<Mutex<Orchestrator>>,
    config: WatchConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (tick_tx, mut tick_rx) = mpsc::channel::<String>(256);
    let mut watchers: HashMap<String, RecommendedWatcher> = HashMap::new();

    // Initial pass picks up everything that changed while we were down.
    run_ingest_all(&orchestrator).await;
    let mut sources = refresh_watchers(&orchestrator, &mut watchers, &tick_tx);

    let mut poll = tokio::time::interval(Duration::from_secs(config.poll_secs.max(1)));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut rediscover =
        tokio::time::interval(Duration::from_secs(config.rediscover_secs.max(1)));
    rediscover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; consume it.
    poll.tick().await;
    rediscover.tick().await;

    loop {
        tokio::select! {
            maybe_id = tick_rx.recv() => {
                let Some(first) = maybe_id else { break };
                // Stable-write debounce: let the burst of change events for
                // one save settle, then ingest each touched source once.
                tokio::time::sleep(Duration::from_millis(config.debounce_ms)).await;
                let mut pending: HashSet<String> = HashSet::new();
                pending.insert(first);
                while let Ok(more) = tick_rx.try_recv() {
                    pending.insert(more);
                }
                for source_id in pending {
                    run_ingest_one(&orchestrator, source_id).await;
                }
            }
            _ = poll.tick() => {
                for source in sources.iter().filter(|s| s.kind == SourceKind::SplitTranscript) {
                    run_ingest_one(&orchestrator, source.source_id.clone()).await;
                }
            }
            _ = rediscover.tick() => {
                run_ingest_all(&orchestrator).await;
                sources = refresh_watchers(&orchestrator, &mut watchers, &tick_tx);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Dropping the watchers closes their notify threads.
    watchers.clear();
    tracing::info!("watch coordinator stopped");
}

/// Full ingest pass on the blocking pool. Errors are logged, never fatal.
async fn run_ingest_all(orchestrator: &Arc<Mutex<Orchestrator>>) {
    let orchestrator = Arc::clone(orchestrator);
    let result = tokio::task::spawn_blocking(move || {
        let mut orch = match orchestrator.lock() {
            Ok(orch) => orch,
            Err(poisoned) => poisoned.into_inner(),
        };
        orch.ingest_all().map(|summary| {
            summary
                .outcomes
                .iter()
                .map(|o| o.inserted)
                .sum::<usize>()
        })
    })
    .await;

    match result {
        Ok(Ok(inserted)) if inserted > 0 => {
            tracing::info!(inserted, "ingest pass complete");
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "ingest pass failed"),
        Err(e) => tracing::warn!(error = %e, "ingest task panicked"),
    }
}

async fn run_ingest_one(orchestrator: &Arc<Mutex<Orchestrator>>, source_id: String) {
    let orchestrator = Arc::clone(orchestrator);
    let result = tokio::task::spawn_blocking(move || {
        let mut orch = match orchestrator.lock() {
            Ok(orch) => orch,
            Err(poisoned) => poisoned.into_inner(),
        };
        orch.ingest_source_id(&source_id)
    })
    .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "source tick failed"),
        Err(e) => tracing::warn!(error = %e, "source tick panicked"),
    }
}

/// Reconcile notify subscriptions with the current source list.
fn refresh_watchers(
    orchestrator: &Arc<Mutex<Orchestrator>>,
    watchers: &mut HashMap<String, RecommendedWatcher>,
    tick_tx: &mpsc::Sender<String>,
) -> Vec<WatchedSource> {
    let sources: Vec<WatchedSource> = {
        let orch = match orchestrator.lock() {
            Ok(orch) => orch,
            Err(poisoned) => poisoned.into_inner(),
        };
        match orch.store().list_sources(None) {
            Ok(rows) => rows
                .iter()
                .filter(|row| row.status != "paused")
                .filter_map(|row| {
                    SourceKind::parse(&row.kind).map(|kind| WatchedSource {
                        source_id: row.source_id.clone(),
                        kind,
                        locator: row.locator.clone(),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "listing sources for watch refresh failed");
                return Vec::new();
            }
        }
    };

    let live: HashSet<&str> = sources.iter().map(|s| s.source_id.as_str()).collect();
    watchers.retain(|source_id, _| live.contains(source_id.as_str()));

    for source in &sources {
        if watchers.contains_key(&source.source_id) {
            continue;
        }
        let target = match source.kind {
            SourceKind::JsonlTranscript | SourceKind::PlainTranscript => {
                WatchTarget::file(Path::new(&source.locator))
            }
            // Poll-only: per-file subscriptions over the storage tree are
            // pathological at that leaf-file count.
            SourceKind::SplitTranscript => None,
            SourceKind::Git => {
                WatchTarget::file(&Path::new(&source.locator).join(".git/logs/HEAD"))
            }
        };
        let Some(target) = target else { continue };

        match make_watcher(&target, source.source_id.clone(), tick_tx.clone()) {
            Ok(watcher) => {
                watchers.insert(source.source_id.clone(), watcher);
            }
            Err(e) => {
                tracing::debug!(locator = %source.locator, error = %e, "watcher setup failed");
            }
        }
    }

    sources
}

struct WatchTarget {
    /// Directory handed to notify (watching the parent survives rotation).
    dir: PathBuf,
    /// File the events must concern.
    file: PathBuf,
}

impl WatchTarget {
    fn file(path: &Path) -> Option<Self> {
        Some(Self {
            dir: path.parent()?.to_path_buf(),
            file: path.to_path_buf(),
        })
    }
}

fn make_watcher(
    target: &WatchTarget,
    source_id: String,
    tick_tx: mpsc::Sender<String>,
) -> notify::Result<RecommendedWatcher> {
    let file = target.file.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        let relevant = matches!(
            event.kind,
            notify::EventKind::Create(_)
                | notify::EventKind::Modify(_)
                | notify::EventKind::Any
        ) && event.paths.iter().any(|p| p == &file);
        if relevant {
            // The notify callback runs on its own thread; a full queue just
            // drops the tick and a later event or poll catches up.
            let _ = tick_tx.try_send(source_id.clone());
        }
    })?;
    watcher.watch(&target.dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, JsonlAdapter};
    use crate::identity::Device;
    use crate::store::Store;
    use tempfile::TempDir;

    fn orchestrator_for(base: &Path) -> Arc<Mutex<Orchestrator>> {
        let mut registry = AdapterRegistry::new(&crate::config::Config {
            adapters: [
                ("jsonl".to_string(), off()),
                ("splitfile".to_string(), off()),
                ("plaintext".to_string(), off()),
                ("git".to_string(), off()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        registry.register(Box::new(JsonlAdapter::new(Some(base.to_path_buf()))));
        let orch = Orchestrator::new(
            Store::open_in_memory().unwrap(),
            registry,
            Device {
                device_id: "dev_watch".into(),
                nickname: "watch-host".into(),
                created_at: "2025-01-01T00:00:00.000Z".into(),
                last_seen_at: None,
            },
            true,
        )
        .unwrap();
        Arc::new(Mutex::new(orch))
    }

    fn off() -> crate::config::AdapterConfig {
        crate::config::AdapterConfig {
            enabled: false,
            base_path: None,
            author: None,
        }
    }

    fn line(text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "timestamp": "2025-03-01T10:00:00Z",
            "message": {"role": "user", "content": text},
        })
        .to_string()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_is_idempotent_and_stop_terminates() {
        let base = TempDir::new().unwrap();
        let orch = orchestrator_for(base.path());
        let mut coordinator = WatchCoordinator::new(orch, WatchConfig::default());

        coordinator.start();
        coordinator.start();
        coordinator.stop().await;
        assert!(coordinator.handle.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn appended_lines_are_ingested_by_the_watcher() {
        let base = TempDir::new().unwrap();
        let project = base.path().join("proj");
        std::fs::create_dir_all(&project).unwrap();
        let transcript = project.join("ses_w.jsonl");
        std::fs::write(&transcript, format!("{}\n", line("first"))).unwrap();

        let orch = orchestrator_for(base.path());
        let mut coordinator = WatchCoordinator::new(
            Arc::clone(&orch),
            WatchConfig {
                debounce_ms: 20,
                poll_secs: 1,
                rediscover_secs: 1,
                ..Default::default()
            },
        );
        coordinator.start();

        // The startup pass ingests the first line.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(orch.lock().unwrap().store().count_events().unwrap(), 1);

        let mut content = std::fs::read_to_string(&transcript).unwrap();
        content.push_str(&format!("{}\n", line("second")));
        std::fs::write(&transcript, content).unwrap();

        // Either the notify tick or the rediscovery pass picks it up.
        let mut count = 0;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            count = orch.lock().unwrap().store().count_events().unwrap();
            if count == 2 {
                break;
            }
        }
        coordinator.stop().await;
        assert_eq!(count, 2);
    }
}
