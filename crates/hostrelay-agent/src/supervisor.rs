//! Keyed registry of execution hosts
//!
//! Sessions lease a host by key. A host outlives its last lease by the grace
//! period so a client that reconnects finds its previous host still alive;
//! a host that exits on its own is dropped from the table at once and is
//! never respawned behind the sessions' back.

use crate::config::{DataDirs, HostCommand};
use crate::error::{AgentError, Result};
use crate::execution_host::ExecutionHost;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supervisor entry for one host key
struct HostEntry {
    host: Arc<ExecutionHost>,
    /// Outstanding leases
    ref_count: usize,
    /// Bumped on every acquire/release so stale reclaim timers can tell
    epoch: u64,
    /// Pending reclaim timer
    reclaim: Option<JoinHandle<()>>,
    /// Last acquire or release
    last_active: Instant,
}

struct SupervisorInner {
    command: HostCommand,
    dirs: DataDirs,
    grace: Duration,
    hosts: Mutex<HashMap<String, HostEntry>>,
    count_tx: watch::Sender<usize>,
    spawns: AtomicU64,
    closed: AtomicBool,
}

/// Supervisor statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Hosts currently in the table
    pub live_hosts: usize,
    /// Hosts spawned since start-up
    pub total_spawns: u64,
}

/// Keyed execution host registry with reference counts and deferred reclamation
#[derive(Clone)]
pub struct HostSupervisor {
    inner: Arc<SupervisorInner>,
}

impl HostSupervisor {
    /// Create a supervisor launching `command` with the given directories
    pub fn new(command: HostCommand, dirs: DataDirs, grace: Duration) -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(SupervisorInner {
                command,
                dirs,
                grace,
                hosts: Mutex::new(HashMap::new()),
                count_tx,
                spawns: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease the live host for `key`, spawning one when there is none
    pub async fn acquire(&self, key: &str) -> Result<HostLease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AgentError::ShuttingDown);
        }

        let mut hosts = self.inner.hosts.lock().await;

        if let Some(entry) = hosts.get_mut(key) {
            if entry.host.status() == crate::execution_host::HostStatus::Running {
                entry.ref_count += 1;
                entry.epoch += 1;
                entry.last_active = Instant::now();
                if let Some(timer) = entry.reclaim.take() {
                    timer.abort();
                    debug!("Cancelled reclamation of host {} for '{}'", entry.host.id(), key);
                }
                debug!("Reusing host {} for '{}' ({} leases)", entry.host.id(), key, entry.ref_count);
                return Ok(HostLease::new(self.clone(), Arc::clone(&entry.host)));
            }
        }
        if let Some(stale) = hosts.remove(key) {
            if let Some(timer) = stale.reclaim {
                timer.abort();
            }
        }

        // Spawning happens under the table lock: one spawn per key
        let host = ExecutionHost::spawn(key, &self.inner.command, &self.inner.dirs)?;
        self.inner.spawns.fetch_add(1, Ordering::SeqCst);

        hosts.insert(key.to_string(), HostEntry {
            host: Arc::clone(&host),
            ref_count: 1,
            epoch: 0,
            reclaim: None,
            last_active: Instant::now(),
        });
        self.inner.count_tx.send_replace(hosts.len());
        drop(hosts);

        let supervisor = self.clone();
        let watched = Arc::clone(&host);
        let watched_key = key.to_string();
        tokio::spawn(async move {
            watched.exited().await;
            supervisor.on_host_exit(&watched_key, watched.id()).await;
        });

        Ok(HostLease::new(self.clone(), host))
    }

    async fn release_host(&self, key: &str, host_id: Uuid) {
        let mut hosts = self.inner.hosts.lock().await;
        let Some(entry) = hosts.get_mut(key).filter(|e| e.host.id() == host_id) else {
            return;
        };

        entry.ref_count = entry.ref_count.saturating_sub(1);
        entry.epoch += 1;
        entry.last_active = Instant::now();
        debug!("Released host {} for '{}' ({} leases)", host_id, key, entry.ref_count);

        if entry.ref_count == 0 && !self.inner.closed.load(Ordering::SeqCst) {
            let supervisor = self.clone();
            let epoch = entry.epoch;
            let grace = self.inner.grace;
            let reclaim_key = key.to_string();
            if let Some(previous) = entry.reclaim.take() {
                previous.abort();
            }
            entry.reclaim = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                supervisor.reclaim(&reclaim_key, host_id, epoch).await;
            }));
            debug!("Host {} for '{}' will be reclaimed in {:?}", host_id, key, grace);
        }
    }

    async fn reclaim(&self, key: &str, host_id: Uuid, epoch: u64) {
        let host = {
            let mut hosts = self.inner.hosts.lock().await;
            match hosts.get(key) {
                Some(entry) if entry.host.id() == host_id && entry.ref_count == 0 && entry.epoch == epoch => {}
                _ => return,
            }
            let entry = hosts.remove(key);
            self.inner.count_tx.send_replace(hosts.len());
            entry.map(|e| e.host)
        };

        if let Some(host) = host {
            info!("Reclaiming idle host {} for '{}'", host_id, key);
            host.shutdown().await;
        }
    }

    async fn on_host_exit(&self, key: &str, host_id: Uuid) {
        let mut hosts = self.inner.hosts.lock().await;
        if hosts.get(key).map(|e| e.host.id()) != Some(host_id) {
            return;
        }
        if let Some(entry) = hosts.remove(key) {
            if let Some(timer) = entry.reclaim {
                timer.abort();
            }
            if entry.ref_count > 0 {
                warn!(
                    "Execution host {} for '{}' terminated with {} sessions attached",
                    host_id, key, entry.ref_count
                );
            }
        }
        self.inner.count_tx.send_replace(hosts.len());
    }

    /// Watch of the number of hosts in the table
    pub fn idle_watch(&self) -> watch::Receiver<usize> {
        self.inner.count_tx.subscribe()
    }

    /// Current statistics
    pub async fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            live_hosts: self.inner.hosts.lock().await.len(),
            total_spawns: self.inner.spawns.load(Ordering::SeqCst),
        }
    }

    /// Live host for `key`, without leasing it
    pub async fn host(&self, key: &str) -> Option<Arc<ExecutionHost>> {
        self.inner.hosts.lock().await.get(key).map(|e| Arc::clone(&e.host))
    }

    /// Outstanding leases for `key`
    pub async fn lease_count(&self, key: &str) -> usize {
        self.inner.hosts.lock().await.get(key).map_or(0, |e| e.ref_count)
    }

    /// Time since the host for `key` was last acquired or released
    pub async fn idle_for(&self, key: &str) -> Option<Duration> {
        self.inner.hosts.lock().await.get(key).map(|e| e.last_active.elapsed())
    }

    /// Kill every host and refuse further acquires
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained: Vec<(String, HostEntry)> = {
            let mut hosts = self.inner.hosts.lock().await;
            let drained = hosts.drain().collect();
            self.inner.count_tx.send_replace(0);
            drained
        };

        for (key, entry) in drained {
            if let Some(timer) = entry.reclaim {
                timer.abort();
            }
            debug!("Stopping host {} for '{}'", entry.host.id(), key);
            entry.host.shutdown().await;
        }
        info!("All execution hosts stopped");
    }
}

/// A session's claim on an execution host
///
/// Dropping the lease releases it; [`HostLease::release`] does the same but
/// waits for the bookkeeping to finish.
pub struct HostLease {
    supervisor: HostSupervisor,
    host: Arc<ExecutionHost>,
    released: bool,
}

impl HostLease {
    fn new(supervisor: HostSupervisor, host: Arc<ExecutionHost>) -> Self {
        Self { supervisor, host, released: false }
    }

    /// The leased host
    pub fn host(&self) -> &Arc<ExecutionHost> {
        &self.host
    }

    /// Give the lease back
    pub async fn release(mut self) {
        self.released = true;
        self.supervisor.release_host(self.host.key(), self.host.id()).await;
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let supervisor = self.supervisor.clone();
        let key = self.host.key().to_string();
        let host_id = self.host.id();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    supervisor.release_host(&key, host_id).await;
                });
            }
            Err(_) => warn!("Lease on host {} dropped outside the runtime", host_id),
        }
    }
}
