//! Per-cluster manager: client, index cache and runnables
//!
//! There is one manager for the virtual cluster and one for the physical
//! cluster. Startup is two-phased so indices on both sides are warm before
//! any reconcile runs:
//!
//! 1. indices and runnables are registered while the manager is idle
//! 2. [`ClusterManager::start_cache`] freezes the index set and spawns one
//!    informer per watched resource
//! 3. [`ClusterManager::wait_for_cache_sync`] resolves once every informer
//!    has finished its initial list, or fails after [`CACHE_SYNC_TIMEOUT`]
//!    naming the informer that never synced and its last watch error
//! 4. [`ClusterManager::run`] drives the registered runnables

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vkube_common::{Error, Result};

use crate::index::{Index, IndexSpec};
use crate::object::ObjectKey;

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// How long startup waits for every informer's initial list
pub const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// A long-running unit of work owned by a manager
pub type Runnable = BoxFuture<'static, Result<()>>;

/// Progress of one informer's initial list
#[derive(Debug, Clone, PartialEq, Eq)]
enum SyncState {
    Pending,
    /// Still unsynced; carries the latest watch error
    Failing(String),
    Synced,
}

struct WatchGroup {
    spec: IndexSpec,
    indices: Vec<Arc<Index>>,
}

/// Which cluster a manager talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    /// Tenant-facing API server
    Virtual,
    /// Shared host cluster
    Physical,
}

impl ClusterRole {
    /// Lowercase name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterRole::Virtual => "virtual",
            ClusterRole::Physical => "physical",
        }
    }
}

/// Client, index cache and runnables for one cluster
pub struct ClusterManager {
    role: ClusterRole,
    client: Client,
    indices: DashMap<String, Arc<Index>>,
    watch_groups: Mutex<BTreeMap<String, WatchGroup>>,
    runnables: Mutex<Vec<(String, Runnable)>>,
    registered: Mutex<Vec<String>>,
    synced: Mutex<Vec<(String, watch::Receiver<SyncState>)>>,
    started: AtomicBool,
}

impl ClusterManager {
    /// Create an idle manager
    pub fn new(role: ClusterRole, client: Client) -> Arc<Self> {
        Arc::new(Self {
            role,
            client,
            indices: DashMap::new(),
            watch_groups: Mutex::new(BTreeMap::new()),
            runnables: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            synced: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Which cluster this manager serves
    pub fn role(&self) -> ClusterRole {
        self.role
    }

    /// Shared client for this cluster
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Whether the cache has been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register an index. Fails once the cache has started or on a duplicate name.
    pub fn register_index(&self, spec: IndexSpec) -> Result<()> {
        let mut groups = self.watch_groups.lock();
        // checked under the lock so it cannot race start_cache
        if self.is_started() {
            return Err(Error::registration(
                spec.name.clone(),
                format!("cannot register index after the {} cache started", self.role.as_str()),
            ));
        }
        if self.indices.contains_key(&spec.name) {
            return Err(Error::registration(
                spec.name.clone(),
                "index already registered",
            ));
        }

        let index = Arc::new(Index::new(spec.key_fn.clone()));
        self.indices.insert(spec.name.clone(), index.clone());
        groups
            .entry(spec.watch_id())
            .or_insert_with(|| WatchGroup {
                spec: spec.clone(),
                indices: Vec::new(),
            })
            .indices
            .push(index);

        debug!(cluster = self.role.as_str(), index = %spec.name, "index registered");
        Ok(())
    }

    /// Objects stored under `value` in the named index
    pub fn lookup(&self, index: &str, value: &str) -> Vec<ObjectKey> {
        match self.indices.get(index) {
            Some(idx) => idx.lookup(value),
            None => {
                debug!(cluster = self.role.as_str(), index, "lookup on unknown index");
                Vec::new()
            }
        }
    }

    /// Register a runnable. Fails once the manager has started.
    pub fn add_runnable(&self, name: impl Into<String>, runnable: Runnable) -> Result<()> {
        let name = name.into();
        let mut runnables = self.runnables.lock();
        if self.is_started() {
            return Err(Error::registration(
                name,
                format!("cannot add runnable after the {} manager started", self.role.as_str()),
            ));
        }
        self.registered.lock().push(name.clone());
        runnables.push((name, runnable));
        Ok(())
    }

    /// Names of registered runnables in registration order
    pub fn runnable_names(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    /// Freeze the index set and spawn one informer per watched resource
    pub fn start_cache(&self, cancel: &CancellationToken) -> Result<()> {
        let groups = {
            let mut groups = self.watch_groups.lock();
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(Error::internal_with_context(
                    "manager",
                    format!("{} cache already started", self.role.as_str()),
                ));
            }
            std::mem::take(&mut *groups)
        };

        let mut synced = self.synced.lock();
        for (id, group) in groups {
            let (tx, rx) = watch::channel(SyncState::Pending);
            synced.push((id.clone(), rx));
            let api: Api<DynamicObject> = match &group.spec.namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &group.spec.resource),
                None => Api::all_with(self.client.clone(), &group.spec.resource),
            };
            info!(cluster = self.role.as_str(), informer = %id, indices = group.indices.len(), "starting informer");
            tokio::spawn(run_informer(api, group.indices, tx, cancel.clone()));
        }
        Ok(())
    }

    /// Resolve once every informer has completed its initial list.
    ///
    /// Fails after [`CACHE_SYNC_TIMEOUT`].
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_cache_sync_within(cancel, CACHE_SYNC_TIMEOUT).await
    }

    /// [`Self::wait_for_cache_sync`] with an explicit deadline
    pub async fn wait_for_cache_sync_within(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<()> {
        let receivers = self.synced.lock().clone();
        let deadline = tokio::time::Instant::now() + timeout;
        for (id, mut rx) in receivers {
            tokio::select! {
                res = async { rx.wait_for(|state| *state == SyncState::Synced).await.map(|_| ()) } => {
                    res.map_err(|_| Error::internal_with_context(
                        "manager",
                        format!("informer {id} stopped before sync"),
                    ))?;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let reason = match &*rx.borrow() {
                        SyncState::Failing(e) => format!("last watch error: {e}"),
                        _ => "no watch error reported".to_string(),
                    };
                    return Err(Error::internal_with_context(
                        "manager",
                        format!(
                            "{} informer {id} did not sync within {}s, {reason}",
                            self.role.as_str(),
                            timeout.as_secs()
                        ),
                    ));
                }
                _ = cancel.cancelled() => {
                    return Err(Error::internal_with_context("manager", "cancelled while waiting for cache sync"));
                }
            }
        }
        info!(cluster = self.role.as_str(), "cache synced");
        Ok(())
    }

    /// Drive every registered runnable until cancellation.
    ///
    /// A runnable returning an error is fatal: the token is cancelled so the
    /// rest of the process shuts down, and the error is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let runnables = {
            let mut runnables = self.runnables.lock();
            self.started.store(true, Ordering::SeqCst);
            std::mem::take(&mut *runnables)
        };

        let mut set = JoinSet::new();
        for (name, runnable) in runnables {
            info!(cluster = self.role.as_str(), runnable = %name, "starting");
            set.spawn(async move { (name, runnable.await) });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(cluster = self.role.as_str(), runnable = %name, "runnable finished")
                }
                Ok((name, Err(e))) => {
                    error!(cluster = self.role.as_str(), runnable = %name, error = %e, "runnable failed");
                    cancel.cancel();
                    first_error.get_or_insert(Error::registration(name, e.to_string()));
                }
                Err(e) => {
                    error!(cluster = self.role.as_str(), error = %e, "runnable panicked");
                    cancel.cancel();
                    first_error.get_or_insert(Error::internal_with_context(
                        "manager",
                        format!("runnable panicked: {e}"),
                    ));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_informer(
    api: Api<DynamicObject>,
    indices: Vec<Arc<Index>>,
    synced: watch::Sender<SyncState>,
    cancel: CancellationToken,
) {
    let mut stream = index_watch(api).boxed();
    let mut relisted: HashSet<ObjectKey> = HashSet::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(Event::Init)) => relisted.clear(),
            Some(Ok(Event::InitApply(obj))) => {
                relisted.insert(ObjectKey::from_object(&obj));
                indices.iter().for_each(|idx| idx.apply(&obj));
            }
            Some(Ok(Event::InitDone)) => {
                let live = std::mem::take(&mut relisted);
                indices.iter().for_each(|idx| idx.retain(&live));
                synced.send_replace(SyncState::Synced);
            }
            Some(Ok(Event::Apply(obj))) => indices.iter().for_each(|idx| idx.apply(&obj)),
            Some(Ok(Event::Delete(obj))) => {
                let key = ObjectKey::from_object(&obj);
                indices.iter().for_each(|idx| idx.delete(&key));
            }
            Some(Err(e)) => {
                warn!(error = %e, "informer watch error");
                synced.send_if_modified(|state| match state {
                    SyncState::Synced => false,
                    _ => {
                        *state = SyncState::Failing(e.to_string());
                        true
                    }
                });
            }
            None => return,
        }
    }
}

fn index_watch(
    api: Api<DynamicObject>,
) -> impl futures::Stream<Item = std::result::Result<Event<DynamicObject>, watcher::Error>> {
    watcher::watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)).default_backoff()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::FutureExt;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::discovery::ApiResource;

    /// Client pointed at a closed port; building it needs a runtime but no server
    pub(crate) fn offline_client() -> Client {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let config = kube::Config::new("http://127.0.0.1:9".parse().expect("static uri"));
        Client::try_from(config).expect("client from static config")
    }

    fn spec(name: &str) -> IndexSpec {
        IndexSpec::new(
            name,
            ApiResource::erase::<ConfigMap>(&()),
            None,
            Arc::new(|_obj: &DynamicObject| vec![]),
        )
    }

    #[tokio::test]
    async fn story_indices_must_be_registered_before_cache_start() {
        let manager = ClusterManager::new(ClusterRole::Physical, offline_client());
        manager.register_index(spec("configmaps/virtual-ref")).unwrap();

        // duplicate names are rejected
        assert!(manager.register_index(spec("configmaps/virtual-ref")).is_err());

        let cancel = CancellationToken::new();
        manager.start_cache(&cancel).unwrap();
        assert!(manager.is_started());

        let err = manager
            .register_index(spec("configmaps/late"))
            .expect_err("late registration must fail");
        assert!(err.to_string().contains("after the physical cache started"));

        // second start is an error too
        assert!(manager.start_cache(&cancel).is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn story_runnables_keep_registration_order() {
        let manager = ClusterManager::new(ClusterRole::Virtual, offline_client());
        manager.add_runnable("first", async { Ok(()) }.boxed()).unwrap();
        manager.add_runnable("second", async { Ok(()) }.boxed()).unwrap();
        assert_eq!(manager.runnable_names(), vec!["first", "second"]);

        let cancel = CancellationToken::new();
        manager.run(cancel.clone()).await.unwrap();
        assert!(!cancel.is_cancelled());

        assert!(manager.add_runnable("late", async { Ok(()) }.boxed()).is_err());
    }

    #[tokio::test]
    async fn story_failing_runnable_cancels_the_rest() {
        let manager = ClusterManager::new(ClusterRole::Virtual, offline_client());
        let cancel = CancellationToken::new();

        let waiter = cancel.clone();
        manager
            .add_runnable(
                "long-lived",
                async move {
                    waiter.cancelled().await;
                    Ok(())
                }
                .boxed(),
            )
            .unwrap();
        manager
            .add_runnable(
                "broken",
                async { Err(Error::internal("listener bind failed")) }.boxed(),
            )
            .unwrap();

        let err = manager.run(cancel.clone()).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_lookup_on_unknown_index_is_empty() {
        let manager = ClusterManager::new(ClusterRole::Virtual, offline_client());
        assert!(manager.lookup("missing", "value").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn story_unreachable_informer_fails_sync_after_deadline() {
        let manager = ClusterManager::new(ClusterRole::Physical, offline_client());
        manager.register_index(spec("configmaps/virtual-ref")).unwrap();
        let cancel = CancellationToken::new();
        manager.start_cache(&cancel).unwrap();

        let err = manager
            .wait_for_cache_sync_within(&cancel, Duration::from_secs(30))
            .await
            .expect_err("an informer that never lists must not block startup forever");
        let msg = err.to_string();
        assert!(msg.contains("physical informer v1/configmaps@*"), "{msg}");
        assert!(msg.contains("did not sync within 30s"), "{msg}");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_without_informers() {
        let manager = ClusterManager::new(ClusterRole::Virtual, offline_client());
        let cancel = CancellationToken::new();
        manager.start_cache(&cancel).unwrap();
        manager.wait_for_cache_sync(&cancel).await.unwrap();
    }
}
