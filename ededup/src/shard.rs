//! Shard registries: the only shared mutable state of a run.
//!
//! Each shard owns the fingerprints the [`Router`] assigns to it and answers
//! `check_and_insert` atomically. Two forms satisfy the same contract:
//!
//! - [`ShardPool`]: one tokio task per shard draining a bounded request
//!   queue. The task is the single writer, so requests are linearized in
//!   queue order.
//! - [`LockedShardPool`]: one mutex-guarded [`ShardState`] per shard.
//!
//! Either way callers for different shards never contend with each other.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ShardError};
use crate::fingerprint::Fingerprint;
use crate::metrics_consts::SHARD_ADMISSIONS_TOTAL;
use crate::router::{Router, ShardIndex};
use crate::table::RowRef;

/// Answer to a `check_and_insert` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// First time this fingerprint was seen in the run; it is now recorded.
    Admitted,
    /// The fingerprint was already admitted, by the row in `original`.
    Duplicate { original: RowRef },
}

impl AdmissionDecision {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AdmissionDecision::Duplicate { .. })
    }
}

/// Which form of shard registry a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    #[default]
    Actor,
    Mutex,
}

impl FromStr for RegistryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actor" => Ok(RegistryMode::Actor),
            "mutex" => Ok(RegistryMode::Mutex),
            _ => Err(ConfigError::UnknownRegistryMode(s.to_owned())),
        }
    }
}

/// Counters a shard reports when it shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardReport {
    pub shard: ShardIndex,
    pub admitted: usize,
    pub duplicates: u64,
}

/// The admitted fingerprints of one shard. Nothing is ever evicted.
#[derive(Debug, Default)]
pub struct ShardState {
    seen: HashMap<Fingerprint, RowRef, ahash::RandomState>,
    duplicates: u64,
}

impl ShardState {
    pub fn check_and_insert(
        &mut self,
        fingerprint: Fingerprint,
        origin: RowRef,
    ) -> AdmissionDecision {
        match self.seen.entry(fingerprint) {
            Entry::Occupied(entry) => {
                self.duplicates += 1;
                AdmissionDecision::Duplicate {
                    original: entry.get().clone(),
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(origin);
                AdmissionDecision::Admitted
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn report(&self, shard: ShardIndex) -> ShardReport {
        ShardReport {
            shard,
            admitted: self.seen.len(),
            duplicates: self.duplicates,
        }
    }
}

fn record_decision(decision: &AdmissionDecision) {
    let label = if decision.is_duplicate() {
        "duplicate"
    } else {
        "admitted"
    };
    metrics::counter!(SHARD_ADMISSIONS_TOTAL, "decision" => label).increment(1);
}

/// Atomic membership testing over the whole fingerprint space.
#[async_trait]
pub trait AdmissionRegistry: Send + Sync {
    fn router(&self) -> Router;

    /// Record `fingerprint` as admitted by `origin` unless it was seen before.
    /// Of many concurrent calls for one fingerprint exactly one is `Admitted`.
    async fn check_and_insert(
        &self,
        fingerprint: Fingerprint,
        origin: RowRef,
    ) -> Result<AdmissionDecision, ShardError>;
}

struct AdmissionRequest {
    fingerprint: Fingerprint,
    origin: RowRef,
    reply: oneshot::Sender<AdmissionDecision>,
}

/// A single shard running as a task that owns its state.
struct ShardRegistry {
    shard: ShardIndex,
    receiver: mpsc::Receiver<AdmissionRequest>,
    state: ShardState,
}

impl ShardRegistry {
    fn spawn(shard: ShardIndex, queue_capacity: usize) -> (ShardHandle, JoinHandle<ShardReport>) {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let registry = ShardRegistry {
            shard,
            receiver,
            state: ShardState::default(),
        };

        (ShardHandle { shard, sender }, tokio::spawn(registry.run()))
    }

    /// Serve requests until every handle is dropped.
    async fn run(mut self) -> ShardReport {
        debug!(shard = %self.shard, "shard registry accepting requests");

        while let Some(request) = self.receiver.recv().await {
            let decision = self
                .state
                .check_and_insert(request.fingerprint, request.origin);
            record_decision(&decision);

            if request.reply.send(decision).is_err() {
                // The caller is gone but the admission stands.
                debug!(shard = %self.shard, "admission reply dropped");
            }
        }

        let report = self.state.report(self.shard);
        info!(
            shard = %self.shard,
            admitted = report.admitted,
            duplicates = report.duplicates,
            "shard registry stopped"
        );
        report
    }
}

/// Sending side of a shard task.
#[derive(Clone)]
pub struct ShardHandle {
    shard: ShardIndex,
    sender: mpsc::Sender<AdmissionRequest>,
}

impl ShardHandle {
    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub async fn check_and_insert(
        &self,
        fingerprint: Fingerprint,
        origin: RowRef,
    ) -> Result<AdmissionDecision, ShardError> {
        let (reply, response) = oneshot::channel();
        let request = AdmissionRequest {
            fingerprint,
            origin,
            reply,
        };

        self.sender
            .send(request)
            .await
            .map_err(|_| ShardError::Unavailable { shard: self.shard })?;

        response
            .await
            .map_err(|_| ShardError::Unavailable { shard: self.shard })
    }
}

/// Handles to every shard task of a run.
pub struct ShardPool {
    router: Router,
    shards: Vec<ShardHandle>,
}

impl ShardPool {
    /// Spawn `shard_count` shard tasks. The tasks stop once the pool is dropped.
    pub fn start(shard_count: NonZeroUsize, queue_capacity: usize) -> (Self, ShardSupervisor) {
        let mut shards = Vec::with_capacity(shard_count.get());
        let mut tasks = Vec::with_capacity(shard_count.get());

        for i in 0..shard_count.get() {
            let (handle, task) = ShardRegistry::spawn(ShardIndex(i), queue_capacity);
            shards.push(handle);
            tasks.push((ShardIndex(i), task));
        }

        let pool = Self {
            router: Router::new(shard_count),
            shards,
        };
        (pool, ShardSupervisor { tasks })
    }

    pub fn shard(&self, shard: ShardIndex) -> Option<&ShardHandle> {
        self.shards.get(shard.0)
    }
}

#[async_trait]
impl AdmissionRegistry for ShardPool {
    fn router(&self) -> Router {
        self.router
    }

    async fn check_and_insert(
        &self,
        fingerprint: Fingerprint,
        origin: RowRef,
    ) -> Result<AdmissionDecision, ShardError> {
        let shard = self.router.route(&fingerprint);
        let handle = self
            .shards
            .get(shard.0)
            .ok_or(ShardError::Unavailable { shard })?;

        handle.check_and_insert(fingerprint, origin).await
    }
}

/// Owns the shard tasks so their reports can be collected at shutdown.
pub struct ShardSupervisor {
    tasks: Vec<(ShardIndex, JoinHandle<ShardReport>)>,
}

impl ShardSupervisor {
    /// Cancel every shard task. Callers still holding handles get `Unavailable`.
    pub fn abort(&self) {
        for (_, task) in &self.tasks {
            task.abort();
        }
    }

    /// Wait for every shard to drain and stop. Only completes once all
    /// `ShardPool` handles have been dropped.
    pub async fn join(self) -> Result<Vec<ShardReport>, ShardError> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for (shard, task) in self.tasks {
            match task.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(shard = %shard, error = ?e, "shard registry task failed");
                    return Err(ShardError::Crashed { shard });
                }
            }
        }
        Ok(reports)
    }
}

/// Shards as mutex-guarded sets, for callers that prefer shared memory over
/// message passing.
pub struct LockedShardPool {
    router: Router,
    shards: Vec<Mutex<ShardState>>,
}

impl LockedShardPool {
    pub fn new(shard_count: NonZeroUsize) -> Self {
        Self {
            router: Router::new(shard_count),
            shards: (0..shard_count.get())
                .map(|_| Mutex::new(ShardState::default()))
                .collect(),
        }
    }

    pub fn reports(&self) -> Result<Vec<ShardReport>, ShardError> {
        self.shards
            .iter()
            .enumerate()
            .map(|(i, shard)| {
                let shard_index = ShardIndex(i);
                shard
                    .lock()
                    .map(|state| state.report(shard_index))
                    .map_err(|_| ShardError::Poisoned { shard: shard_index })
            })
            .collect()
    }
}

#[async_trait]
impl AdmissionRegistry for LockedShardPool {
    fn router(&self) -> Router {
        self.router
    }

    async fn check_and_insert(
        &self,
        fingerprint: Fingerprint,
        origin: RowRef,
    ) -> Result<AdmissionDecision, ShardError> {
        let shard = self.router.route(&fingerprint);
        let decision = {
            let mut state = self
                .shards
                .get(shard.0)
                .ok_or(ShardError::Unavailable { shard })?
                .lock()
                .map_err(|_| ShardError::Poisoned { shard })?;
            state.check_and_insert(fingerprint, origin)
        };
        record_decision(&decision);
        Ok(decision)
    }
}

/// The registries of one run, in whichever form was configured.
pub enum RunningRegistry {
    Actor {
        pool: Arc<ShardPool>,
        supervisor: ShardSupervisor,
    },
    Locked(Arc<LockedShardPool>),
}

impl RunningRegistry {
    pub fn start(
        mode: RegistryMode,
        shard_count: NonZeroUsize,
        queue_capacity: usize,
        resource_hint: f64,
    ) -> Self {
        info!(
            mode = ?mode,
            shards = shard_count.get(),
            resource_hint,
            "starting shard registries"
        );

        match mode {
            RegistryMode::Actor => {
                let (pool, supervisor) = ShardPool::start(shard_count, queue_capacity);
                RunningRegistry::Actor {
                    pool: Arc::new(pool),
                    supervisor,
                }
            }
            RegistryMode::Mutex => {
                RunningRegistry::Locked(Arc::new(LockedShardPool::new(shard_count)))
            }
        }
    }

    pub fn registry(&self) -> Arc<dyn AdmissionRegistry> {
        match self {
            RunningRegistry::Actor { pool, .. } => pool.clone(),
            RunningRegistry::Locked(pool) => pool.clone(),
        }
    }

    pub fn abort(&self) {
        if let RunningRegistry::Actor { supervisor, .. } = self {
            supervisor.abort();
        }
    }

    /// Stop the registries and collect their reports. Every `registry()`
    /// clone must be dropped first or this waits forever in actor mode.
    pub async fn shutdown(self) -> Result<Vec<ShardReport>, ShardError> {
        match self {
            RunningRegistry::Actor { pool, supervisor } => {
                drop(pool);
                supervisor.join().await
            }
            RunningRegistry::Locked(pool) => pool.reports(),
        }
    }
}
