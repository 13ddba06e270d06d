// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Bounded pool of language server clients shared across callers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use lsp_types::Position;

use super::client::{DefinitionResult, DiagnosticsResult, LspClient, ReferencesResult};
use super::hover::HoverResult;
use super::registry::{ServerDescriptor, ServerRegistry};
use super::state::{ConnectionState, ServerStatus};
use super::workspace::{absolutize, find_root};
use crate::config::{Config, PoolSettings, install_hint};
use crate::error::{LspError, Result};

/// Identifies one pooled server: which server, for which workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Descriptor id.
    pub server_id: String,
    /// Workspace root.
    pub root: PathBuf,
}

type Slot = Arc<OnceCell<Result<Arc<LspClient>>>>;

struct PoolEntry {
    slot: Slot,
    last_used: Instant,
    in_flight: Arc<AtomicUsize>,
}

impl PoolEntry {
    fn client(&self) -> Option<&Arc<LspClient>> {
        self.slot.get().and_then(|result| result.as_ref().ok())
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ConnectionKey, PoolEntry>,
    broken: HashSet<ConnectionKey>,
}

impl PoolState {
    /// Removes the entry for `key` only if it still holds `slot`.
    fn remove_if_current(&mut self, key: &ConnectionKey, slot: &Slot) -> bool {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
        {
            self.entries.remove(key);
            return true;
        }
        false
    }

    /// Picks an entry to make room for a new one.
    ///
    /// Only idle entries whose startup has finished are candidates, least
    /// recently used first. An entry with requests in flight is never shut
    /// down to admit another key.
    fn evict(&mut self, capacity: usize) -> Result<Option<Arc<LspClient>>> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.slot.initialized() && entry.in_flight.load(Ordering::SeqCst) == 0
            })
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
            .ok_or(LspError::PoolExhausted(capacity))?;

        info!(
            "Evicting {} for {} to make room",
            victim.server_id,
            victim.root.display()
        );
        Ok(self
            .entries
            .remove(&victim)
            .and_then(|entry| entry.client().cloned()))
    }
}

/// Keeps a pooled entry marked busy while a request runs.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A client handed out for one call.
struct Checkout {
    client: Arc<LspClient>,
    slot: Slot,
    _in_flight: InFlightGuard,
}

/// A file resolved to its server and contents.
struct Document {
    path: PathBuf,
    content: String,
    language_id: String,
}

/// Pool of language server clients keyed by (server, workspace root).
///
/// Servers are spawned lazily on first use, shared by every caller for the
/// same key, and evicted least-recently-used when the pool is full. Keys
/// whose server failed to start or broke the protocol are remembered and
/// refused until reset.
pub struct ClientManager {
    settings: PoolSettings,
    registry: ServerRegistry,
    state: Mutex<PoolState>,
    spawn_count: AtomicU64,
}

impl ClientManager {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(settings: PoolSettings, registry: ServerRegistry) -> Self {
        Self {
            settings,
            registry,
            state: Mutex::new(PoolState::default()),
            spawn_count: AtomicU64::new(0),
        }
    }

    /// Creates an empty pool from loaded configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pool_settings(), config.registry())
    }

    /// Hover information at a zero-indexed position of `path`.
    ///
    /// Never fails: errors are reported through [`HoverResult::error`].
    pub async fn hover(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        timeout: Option<Duration>,
    ) -> HoverResult {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let outcome = self
            .run(path, |client, doc| async move {
                client
                    .hover(
                        &doc.path,
                        &doc.content,
                        &doc.language_id,
                        line,
                        character,
                        timeout,
                    )
                    .await
            })
            .await;

        outcome.unwrap_or_else(HoverResult::failure)
    }

    /// Definition targets of the symbol at a zero-indexed position of `path`.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        timeout: Option<Duration>,
    ) -> DefinitionResult {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let outcome = self
            .run(path, |client, doc| async move {
                client
                    .definition(
                        &doc.path,
                        &doc.content,
                        &doc.language_id,
                        line,
                        character,
                        timeout,
                    )
                    .await
            })
            .await;

        outcome.unwrap_or_else(DefinitionResult::failure)
    }

    /// References to the symbol at a zero-indexed position of `path`.
    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        include_declaration: bool,
        timeout: Option<Duration>,
    ) -> ReferencesResult {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let position = Position { line, character };
        let outcome = self
            .run(path, |client, doc| async move {
                client
                    .references(
                        &doc.path,
                        &doc.content,
                        &doc.language_id,
                        position,
                        include_declaration,
                        timeout,
                    )
                    .await
            })
            .await;

        outcome.unwrap_or_else(ReferencesResult::failure)
    }

    /// Diagnostics published for `path`, waiting up to `timeout` for them.
    pub async fn diagnostics(&self, path: &Path, timeout: Option<Duration>) -> DiagnosticsResult {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let outcome = self
            .run(path, |client, doc| async move {
                client
                    .diagnostics(&doc.path, &doc.content, &doc.language_id, timeout)
                    .await
            })
            .await;

        outcome.unwrap_or_else(DiagnosticsResult::failure)
    }

    /// Resolves `path`, checks out its client, runs `query`, then settles the
    /// pool according to how the call went.
    async fn run<T, F, Fut>(&self, path: &Path, query: F) -> Result<T>
    where
        F: FnOnce(Arc<LspClient>, Document) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let content = match tokio::fs::read(path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                return Err(LspError::FileNotFound(path.to_path_buf()));
            }
        };

        let descriptor = self.registry.resolve(path)?;
        let path = absolutize(path);
        let key = ConnectionKey {
            server_id: descriptor.id.clone(),
            root: find_root(&path, &descriptor.root_markers),
        };

        let checkout = self.checkout(&descriptor, &key).await?;
        let doc = Document {
            language_id: descriptor.language_id_for(&path).to_string(),
            path,
            content,
        };

        let result = query(checkout.client.clone(), doc).await;
        self.settle(&key, &checkout, result.as_ref().err()).await;
        result
    }

    /// Returns the client for `key`, starting it if needed.
    async fn checkout(
        &self,
        descriptor: &ServerDescriptor,
        key: &ConnectionKey,
    ) -> Result<Checkout> {
        let (slot, guard, victim) = {
            let mut state = self.state.lock().await;

            if state.broken.contains(key) {
                return Err(LspError::BrokenServer);
            }

            // A crashed server is dropped here and respawned below.
            let stale = state.entries.get(key).and_then(|entry| {
                entry
                    .client()
                    .map(|client| client.state())
                    .filter(|s| s.is_terminal())
            });
            match stale {
                Some(ConnectionState::Broken) => {
                    warn!("{} for {} is broken", key.server_id, key.root.display());
                    state.entries.remove(key);
                    state.broken.insert(key.clone());
                    return Err(LspError::BrokenServer);
                }
                Some(_) => {
                    info!(
                        "{} for {} exited, restarting",
                        key.server_id,
                        key.root.display()
                    );
                    state.entries.remove(key);
                }
                None => {}
            }

            let mut victim = None;
            if !state.entries.contains_key(key) {
                if state.entries.len() >= self.settings.max_clients {
                    victim = state.evict(self.settings.max_clients)?;
                }
                state.entries.insert(
                    key.clone(),
                    PoolEntry {
                        slot: Arc::new(OnceCell::new()),
                        last_used: Instant::now(),
                        in_flight: Arc::new(AtomicUsize::new(0)),
                    },
                );
            }

            let Some(entry) = state.entries.get_mut(key) else {
                return Err(LspError::ConnectionClosed);
            };
            entry.last_used = Instant::now();
            let checkout = (
                entry.slot.clone(),
                InFlightGuard::new(entry.in_flight.clone()),
                victim,
            );
            drop(state);
            checkout
        };

        if let Some(victim) = victim {
            victim.shutdown().await;
        }

        let started = slot
            .get_or_init(|| self.start_client(descriptor, &key.root))
            .await
            .clone();

        match started {
            Ok(client) => Ok(Checkout {
                client,
                slot,
                _in_flight: guard,
            }),
            Err(e) => {
                let mut state = self.state.lock().await;
                state.remove_if_current(key, &slot);
                if state.broken.insert(key.clone()) {
                    warn!(
                        "Marking {} for {} broken: {}",
                        key.server_id,
                        key.root.display(),
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn start_client(
        &self,
        descriptor: &ServerDescriptor,
        root: &Path,
    ) -> Result<Arc<LspClient>> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        info!(
            "Spawning {} for {}: {} {}",
            descriptor.id,
            root.display(),
            descriptor.command,
            descriptor.args.join(" ")
        );

        LspClient::start(descriptor, root, self.settings.init_timeout)
            .await
            .map(Arc::new)
            .map_err(|e| match e {
                LspError::ServerSpawnFailure { command, reason } => {
                    let reason = match install_hint(&descriptor.id) {
                        Some(hint) => format!("{reason}. Install it with: {hint}"),
                        None => reason,
                    };
                    LspError::ServerSpawnFailure { command, reason }
                }
                other => other,
            })
    }

    /// Updates the pool after a call on `checkout` finished.
    async fn settle(&self, key: &ConnectionKey, checkout: &Checkout, error: Option<&LspError>) {
        let connection_state = checkout.client.state();
        let poisoned = error.is_some_and(LspError::poisons_connection)
            || connection_state == ConnectionState::Broken;

        let mut state = self.state.lock().await;
        if poisoned {
            state.remove_if_current(key, &checkout.slot);
            state.broken.insert(key.clone());
            drop(state);
            warn!(
                "{} for {} violated the protocol and will not be retried",
                key.server_id,
                key.root.display()
            );
            checkout.client.abandon().await;
            return;
        }

        if connection_state == ConnectionState::Closed {
            if state.remove_if_current(key, &checkout.slot) {
                info!(
                    "{} for {} exited; it will be restarted on next use",
                    key.server_id,
                    key.root.display()
                );
            }
            return;
        }

        if let Some(entry) = state.entries.get_mut(key)
            && Arc::ptr_eq(&entry.slot, &checkout.slot)
        {
            entry.last_used = Instant::now();
        }
    }

    /// Allows `server_id` to be started again for `root`.
    ///
    /// Returns true if the key was marked broken.
    pub async fn reset_broken(&self, server_id: &str, root: &Path) -> bool {
        let key = ConnectionKey {
            server_id: server_id.to_string(),
            root: root.to_path_buf(),
        };
        self.state.lock().await.broken.remove(&key)
    }

    /// Clears every broken mark. Returns how many were cleared.
    pub async fn reset_all_broken(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.broken.len();
        state.broken.clear();
        cleared
    }

    /// Keys currently refused because their server failed.
    pub async fn broken_keys(&self) -> Vec<ConnectionKey> {
        self.state.lock().await.broken.iter().cloned().collect()
    }

    /// Returns status of all pooled servers.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let snapshot: Vec<_> = {
            let state = self.state.lock().await;
            state
                .entries
                .iter()
                .map(|(key, entry)| {
                    (
                        key.clone(),
                        entry.client().cloned(),
                        entry.in_flight.load(Ordering::SeqCst),
                        entry.last_used.elapsed().as_secs(),
                    )
                })
                .collect()
        };

        let mut statuses = Vec::with_capacity(snapshot.len());
        for (key, client, in_flight, idle_secs) in snapshot {
            let open_documents = match &client {
                Some(client) => client.open_document_count().await,
                None => 0,
            };
            statuses.push(ServerStatus {
                server_id: key.server_id,
                root: key.root,
                state: client.map(|c| c.state()),
                open_documents,
                in_flight,
                idle_secs,
            });
        }
        statuses.sort_by(|a, b| (&a.server_id, &a.root).cmp(&(&b.server_id, &b.root)));
        statuses
    }

    /// Number of pooled entries, including ones still starting.
    pub async fn pool_size(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Number of server processes this manager has tried to start.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// The registry used to resolve files.
    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Shuts down all pooled servers.
    pub async fn shutdown_all(&self) {
        let clients: Vec<_> = {
            let mut state = self.state.lock().await;
            state
                .entries
                .drain()
                .filter_map(|(key, entry)| entry.client().cloned().map(|client| (key, client)))
                .collect()
        };

        for (key, client) in clients {
            info!(
                "Shutting down {} for {}",
                key.server_id,
                key.root.display()
            );
            client.shutdown().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Tests use unwrap for clear failure messages")]
mod tests {
    use super::*;

    fn manager() -> ClientManager {
        ClientManager::from_config(&Config::default())
    }

    #[tokio::test]
    async fn test_missing_file_does_not_touch_pool() {
        let manager = manager();
        let result = manager
            .hover(Path::new("/nonexistent/file.ext"), 0, 0, None)
            .await;

        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("File not found: /nonexistent/file.ext")
        );
        assert_eq!(manager.pool_size().await, 0);
        assert_eq!(manager.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.xyz");
        std::fs::write(&file, "hello").unwrap();

        let manager = manager();
        let result = manager.hover(&file, 0, 0, None).await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("No server available for '.xyz' files. Supported: "));
        assert!(error.contains(".py"));
        assert_eq!(manager.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_broken_reports_membership() {
        let manager = manager();
        let key = ConnectionKey {
            server_id: "python".to_string(),
            root: PathBuf::from("/work"),
        };
        manager.state.lock().await.broken.insert(key.clone());

        assert_eq!(manager.broken_keys().await, vec![key]);
        assert!(manager.reset_broken("python", Path::new("/work")).await);
        assert!(!manager.reset_broken("python", Path::new("/work")).await);
        assert_eq!(manager.reset_all_broken().await, 0);
    }

    #[test]
    fn test_eviction_needs_an_initialized_entry() {
        let mut state = PoolState::default();
        state.entries.insert(
            ConnectionKey {
                server_id: "python".to_string(),
                root: PathBuf::from("/a"),
            },
            PoolEntry {
                slot: Arc::new(OnceCell::new()),
                last_used: Instant::now(),
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );

        assert_eq!(state.evict(1).err(), Some(LspError::PoolExhausted(1)));
        assert_eq!(state.entries.len(), 1);
    }

    #[test]
    fn test_eviction_skips_busy_entries() {
        let busy_key = ConnectionKey {
            server_id: "python".to_string(),
            root: PathBuf::from("/busy"),
        };
        let slot: Slot = Arc::new(OnceCell::new());
        assert!(slot.set(Err(LspError::ConnectionClosed)).is_ok());
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut state = PoolState::default();
        state.entries.insert(
            busy_key.clone(),
            PoolEntry {
                slot,
                last_used: Instant::now(),
                in_flight: in_flight.clone(),
            },
        );

        let guard = InFlightGuard::new(in_flight);
        assert_eq!(state.evict(1).err(), Some(LspError::PoolExhausted(1)));
        assert!(state.entries.contains_key(&busy_key));

        drop(guard);
        assert!(state.evict(1).unwrap().is_none());
        assert!(state.entries.is_empty());
    }

    #[test]
    fn test_in_flight_guard_counts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = InFlightGuard::new(counter.clone());
        let second = InFlightGuard::new(counter.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        drop(first);
        drop(second);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
