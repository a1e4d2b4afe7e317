//! In-memory simulated replica set
//!
//! One primary and a configurable number of secondaries share a single oplog.
//! The primary applies every entry immediately; each secondary trails the
//! primary by a random number of entries drawn from [`ReplicationLag`]. Write
//! concerns force enough secondaries to catch up before a write is
//! acknowledged, read concerns pick the point in the oplog a read observes,
//! and a [`LatencyModel`] turns round trips into real (tokio) sleeps so the
//! cost of stronger guarantees shows up in measured latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::*;
use crate::concern::{Acknowledgement, ConcernSet, ReadConcern, ReadPreference, WriteConcern};

type Collections = BTreeMap<String, BTreeMap<Key, Record>>;

/// How far secondaries trail the primary, in oplog entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationLag {
    pub min_entries: u64,
    pub max_entries: u64,
}

impl Default for ReplicationLag {
    fn default() -> Self {
        Self {
            min_entries: 0,
            max_entries: 2,
        }
    }
}

impl ReplicationLag {
    /// No lag: secondaries apply every entry as soon as it is written
    pub fn none() -> Self {
        Self {
            min_entries: 0,
            max_entries: 0,
        }
    }

    /// Secondaries always trail by exactly `entries`
    pub fn fixed(entries: u64) -> Self {
        Self {
            min_entries: entries,
            max_entries: entries,
        }
    }

    fn sample(&self, rng: &mut StdRng) -> u64 {
        let low = self.min_entries.min(self.max_entries);
        let high = self.min_entries.max(self.max_entries);
        rng.gen_range(low..=high)
    }
}

/// Simulated network and disk latencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyModel {
    /// Client to primary round trip
    #[serde(with = "duration_millis")]
    pub round_trip: Duration,

    /// Primary to secondary replication round trip
    #[serde(with = "duration_millis")]
    pub replication: Duration,

    /// Journal flush
    #[serde(with = "duration_millis")]
    pub journal: Duration,

    /// Upper bound of uniform random jitter added to each round trip
    #[serde(with = "duration_millis")]
    pub jitter: Duration,
}

impl LatencyModel {
    /// No simulated latency (tests)
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Simulated replica set configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of secondaries next to the primary
    pub secondaries: u32,

    /// Replication lag of the secondaries
    pub replication_lag: ReplicationLag,

    /// Latency model
    pub latency: LatencyModel,

    /// Seed of the simulation's random number generator
    pub seed: u64,

    /// Probability that a transaction commit fails with a transient error
    pub commit_failure_rate: f64,

    /// Version reported by `server_info`
    pub server_version: String,

    /// Storage engine reported by `server_info`
    pub storage_engine: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            secondaries: 2,
            replication_lag: ReplicationLag::default(),
            latency: LatencyModel::default(),
            seed: 42,
            commit_failure_rate: 0.0,
            server_version: "4.0.0-sim".to_string(),
            storage_engine: "inMemory".to_string(),
        }
    }
}

impl SimulationConfig {
    pub fn with_secondaries(mut self, secondaries: u32) -> Self {
        self.secondaries = secondaries;
        self
    }

    pub fn with_replication_lag(mut self, lag: ReplicationLag) -> Self {
        self.replication_lag = lag;
        self
    }

    pub fn with_latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_commit_failure_rate(mut self, rate: f64) -> Self {
        self.commit_failure_rate = rate.clamp(0.0, 1.0);
        self
    }
}

/// A single oplog operation
#[derive(Debug, Clone)]
enum OplogOp {
    Drop {
        collection: String,
    },
    Insert {
        collection: String,
        record: Record,
    },
    Inc {
        collection: String,
        key: Key,
        field: String,
        delta: i64,
    },
    /// Writes of a committed transaction, applied atomically
    ApplyOps(Vec<OplogOp>),
}

impl OplogOp {
    fn apply(&self, data: &mut Collections) {
        match self {
            Self::Drop { collection } => {
                data.remove(collection);
            }
            Self::Insert { collection, record } => {
                data.entry(collection.clone())
                    .or_default()
                    .insert(record.id, record.clone());
            }
            Self::Inc {
                collection,
                key,
                field,
                delta,
            } => {
                if let Some(record) = data.get_mut(collection).and_then(|c| c.get_mut(key)) {
                    *record.fields.entry(field.clone()).or_insert(0) += delta;
                }
            }
            Self::ApplyOps(ops) => {
                for op in ops {
                    op.apply(data);
                }
            }
        }
    }

    fn touches(&self, target: &str, target_key: Key) -> bool {
        match self {
            Self::Drop { collection } => collection == target,
            Self::Insert { collection, record } => collection == target && record.id == target_key,
            Self::Inc {
                collection, key, ..
            } => collection == target && *key == target_key,
            Self::ApplyOps(ops) => ops.iter().any(|op| op.touches(target, target_key)),
        }
    }
}

struct OplogEntry {
    ts: u64,
    op: OplogOp,
}

struct TransactionState {
    snapshot_ts: u64,
    write_concern: Option<WriteConcern>,
    writes: Vec<OplogOp>,
}

struct SessionState {
    causal: bool,
    /// Highest oplog position this session has written or observed
    operation_time: u64,
    transaction: Option<TransactionState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    Primary,
    Secondary(usize),
}

struct ClusterState {
    reachable: bool,
    /// Data as of `base_ts`, the oldest position any reader may still need
    base: Collections,
    base_ts: u64,
    /// Entries after `base_ts`, in order
    oplog: Vec<OplogEntry>,
    /// Primary data as of `head`
    primary: Collections,
    head: u64,
    /// Applied oplog position of each secondary
    secondaries: Vec<u64>,
    sessions: HashMap<SessionId, SessionState>,
    rng: StdRng,
}

impl ClusterState {
    fn new(config: &SimulationConfig) -> Self {
        Self {
            reachable: true,
            base: Collections::new(),
            base_ts: 0,
            oplog: Vec::new(),
            primary: Collections::new(),
            head: 0,
            secondaries: vec![0; config.secondaries as usize],
            sessions: HashMap::new(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    fn members(&self) -> u32 {
        self.secondaries.len() as u32 + 1
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StoreError::Unreachable(
                "no reachable replica set members".to_string(),
            ))
        }
    }

    fn applied(&self, member: Member) -> u64 {
        match member {
            Member::Primary => self.head,
            Member::Secondary(i) => self.secondaries[i],
        }
    }

    /// Highest position applied by a majority of members
    fn majority_point(&self) -> u64 {
        let mut positions: Vec<u64> = std::iter::once(self.head)
            .chain(self.secondaries.iter().copied())
            .collect();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        let majority = Acknowledgement::Majority.required_members(self.members()) as usize;
        positions[majority - 1]
    }

    fn view_at(&self, ts: u64) -> Collections {
        if ts >= self.head {
            return self.primary.clone();
        }
        let mut view = self.base.clone();
        for entry in self.oplog.iter().take_while(|e| e.ts <= ts) {
            entry.op.apply(&mut view);
        }
        view
    }

    fn round_trip(&mut self, latency: &LatencyModel) -> Duration {
        let jitter = latency.jitter.as_micros() as u64;
        if jitter == 0 {
            latency.round_trip
        } else {
            latency.round_trip + Duration::from_micros(self.rng.gen_range(0..=jitter))
        }
    }

    fn select_member(&mut self, preference: ReadPreference) -> Result<Member, StoreError> {
        let secondaries = self.secondaries.len();
        match preference {
            ReadPreference::Primary | ReadPreference::PrimaryPreferred => Ok(Member::Primary),
            ReadPreference::Secondary if secondaries == 0 => {
                Err(StoreError::NoEligibleMember(preference))
            }
            ReadPreference::SecondaryPreferred if secondaries == 0 => Ok(Member::Primary),
            ReadPreference::Secondary | ReadPreference::SecondaryPreferred => {
                Ok(Member::Secondary(self.rng.gen_range(0..secondaries)))
            }
            ReadPreference::Nearest => match self.rng.gen_range(0..=secondaries) {
                0 => Ok(Member::Primary),
                i => Ok(Member::Secondary(i - 1)),
            },
        }
    }

    /// Append an entry on the primary and let secondaries replicate
    fn append(&mut self, op: OplogOp, lag: &ReplicationLag) -> u64 {
        self.head += 1;
        op.apply(&mut self.primary);
        self.oplog.push(OplogEntry { ts: self.head, op });

        for i in 0..self.secondaries.len() {
            let target = self.head.saturating_sub(lag.sample(&mut self.rng));
            self.secondaries[i] = self.secondaries[i].max(target);
        }
        self.head
    }

    /// Bring the most advanced secondaries up to `ts` until `required`
    /// members (primary included) have applied it
    fn await_members(&mut self, ts: u64, required: u32) {
        let needed = (required.saturating_sub(1) as usize).min(self.secondaries.len());
        let mut order: Vec<usize> = (0..self.secondaries.len()).collect();
        order.sort_unstable_by(|a, b| self.secondaries[*b].cmp(&self.secondaries[*a]));
        for i in order.into_iter().take(needed) {
            self.secondaries[i] = self.secondaries[i].max(ts);
        }
    }

    /// Wait for the write at `ts` as `write_concern` demands, returning the
    /// client-visible delay
    fn acknowledge(
        &mut self,
        ts: u64,
        write_concern: WriteConcern,
        latency: &LatencyModel,
    ) -> Duration {
        let mut delay = Duration::ZERO;
        if write_concern.is_acknowledged() {
            delay += self.round_trip(latency);
        }
        let required = write_concern.w.required_members(self.members()).min(self.members());
        if required > 1 {
            self.await_members(ts, required);
            delay += latency.replication;
        }
        if write_concern.journal == Some(true) {
            delay += latency.journal;
        }
        delay
    }

    /// Fold oplog entries every reader has moved past into the base snapshot
    fn compact(&mut self) {
        let oldest_snapshot = self
            .sessions
            .values()
            .filter_map(|s| s.transaction.as_ref().map(|t| t.snapshot_ts))
            .min()
            .unwrap_or(self.head);
        let floor = self
            .secondaries
            .iter()
            .copied()
            .min()
            .unwrap_or(self.head)
            .min(oldest_snapshot);

        if floor <= self.base_ts {
            return;
        }
        let split = self.oplog.partition_point(|e| e.ts <= floor);
        for entry in self.oplog.drain(..split) {
            entry.op.apply(&mut self.base);
        }
        self.base_ts = floor;
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut SessionState, StoreError> {
        self.sessions
            .get_mut(id)
            .ok_or(StoreError::SessionNotFound(*id))
    }

    fn observe(&mut self, session: Option<&SessionId>, ts: u64) {
        if let Some(state) = session.and_then(|id| self.sessions.get_mut(id)) {
            if state.causal {
                state.operation_time = state.operation_time.max(ts);
            }
        }
    }

    /// Data a read observes, and the delay the read costs
    fn read_view(
        &mut self,
        concerns: &ConcernSet,
        session: Option<&SessionId>,
        config: &SimulationConfig,
    ) -> Result<(Collections, Duration), StoreError> {
        let latency = &config.latency;
        let mut delay = self.round_trip(latency);

        let mut after_cluster_time = 0;
        if let Some(id) = session {
            let state = self
                .sessions
                .get(id)
                .ok_or(StoreError::SessionNotFound(*id))?;
            if let Some(txn) = &state.transaction {
                let mut view = self.view_at(txn.snapshot_ts);
                for op in &txn.writes {
                    op.apply(&mut view);
                }
                return Ok((view, delay));
            }
            if state.causal {
                after_cluster_time = state.operation_time;
            }
        }

        let read = concerns.effective_read();
        let member = self.select_member(concerns.effective_preference())?;
        if read == ReadConcern::Linearizable && member != Member::Primary {
            return Err(StoreError::InvalidOperation(
                "read concern linearizable requires read preference primary".to_string(),
            ));
        }

        // afterClusterTime: the serving member and, for majority reads, the
        // commit point must reach the session's operation time
        if let Member::Secondary(i) = member {
            if self.secondaries[i] < after_cluster_time {
                self.secondaries[i] = after_cluster_time;
                delay += latency.replication;
            }
        }
        let majority = Acknowledgement::Majority.required_members(self.members());
        if read == ReadConcern::Majority && self.majority_point() < after_cluster_time {
            self.await_members(after_cluster_time, majority);
            delay += latency.replication;
        }

        let ts = match read {
            ReadConcern::Local | ReadConcern::Available => self.applied(member),
            ReadConcern::Majority => self.applied(member).min(self.majority_point()),
            ReadConcern::Linearizable => {
                let head = self.head;
                self.await_members(head, majority);
                delay += latency.replication;
                head
            }
            ReadConcern::Snapshot => {
                return Err(StoreError::InvalidOperation(
                    "read concern snapshot is only valid in a transaction".to_string(),
                ))
            }
        };

        self.observe(session, ts);
        Ok((self.view_at(ts), delay))
    }

    /// Apply (or, inside a transaction, buffer) a write
    fn write(
        &mut self,
        concerns: &ConcernSet,
        session: Option<&SessionId>,
        op: OplogOp,
        config: &SimulationConfig,
    ) -> Result<Duration, StoreError> {
        if let Some(id) = session {
            let in_transaction = self.session_mut(id)?.transaction.is_some();
            if in_transaction {
                return self.buffer_write(id, op, &config.latency);
            }
        }

        if let OplogOp::Inc {
            collection, key, ..
        } = &op
        {
            let exists = self
                .primary
                .get(collection)
                .is_some_and(|c| c.contains_key(key));
            if !exists {
                return Err(StoreError::NotFound {
                    collection: collection.clone(),
                    key: *key,
                });
            }
        }
        if let OplogOp::Insert { collection, record } = &op {
            let exists = self
                .primary
                .get(collection)
                .is_some_and(|c| c.contains_key(&record.id));
            if exists {
                return Err(StoreError::InvalidOperation(format!(
                    "duplicate key {} in {}",
                    record.id, collection
                )));
            }
        }

        let ts = self.append(op, &config.replication_lag);
        let delay = self.acknowledge(ts, concerns.effective_write(), &config.latency);
        self.observe(session, ts);
        self.compact();
        Ok(delay)
    }

    fn buffer_write(
        &mut self,
        id: &SessionId,
        op: OplogOp,
        latency: &LatencyModel,
    ) -> Result<Duration, StoreError> {
        let (collection, key) = match &op {
            OplogOp::Inc {
                collection, key, ..
            } => (collection.clone(), *key),
            OplogOp::Insert { collection, record } => (collection.clone(), record.id),
            OplogOp::Drop { .. } | OplogOp::ApplyOps(_) => {
                return Err(StoreError::InvalidOperation(
                    "operation not allowed in a transaction".to_string(),
                ))
            }
        };

        let snapshot_ts = self
            .session_mut(id)?
            .transaction
            .as_ref()
            .map(|txn| txn.snapshot_ts)
            .ok_or(StoreError::NoTransaction(*id))?;

        let conflict = self
            .oplog
            .iter()
            .filter(|e| e.ts > snapshot_ts)
            .any(|e| e.op.touches(&collection, key));
        if conflict {
            self.session_mut(id)?.transaction = None;
            return Err(StoreError::WriteConflict { collection, key });
        }

        let mut view = self.view_at(snapshot_ts);
        let state = self.session_mut(id)?;
        let txn = state
            .transaction
            .as_mut()
            .ok_or(StoreError::NoTransaction(*id))?;
        for pending in &txn.writes {
            pending.apply(&mut view);
        }
        let present = view.get(&collection).is_some_and(|c| c.contains_key(&key));
        match &op {
            OplogOp::Inc { .. } if !present => {
                return Err(StoreError::NotFound { collection, key })
            }
            OplogOp::Insert { .. } if present => {
                return Err(StoreError::InvalidOperation(format!(
                    "duplicate key {} in {}",
                    key, collection
                )))
            }
            _ => {}
        }
        txn.writes.push(op);

        Ok(self.round_trip(latency))
    }
}

/// In-memory simulated replica set
///
/// Cloning shares the same cluster. Connect with [`InMemoryReplicaSet::connect`]
/// to obtain a [`ReplicaSetHandle`] bound to one concern triple.
///
/// # Example
///
/// ```
/// use txcost_core::{ConcernSet, InMemoryReplicaSet, SimulationConfig};
///
/// let cluster = InMemoryReplicaSet::new(SimulationConfig::default());
/// let handle = cluster.connect(ConcernSet::new()).unwrap();
/// ```
#[derive(Clone)]
pub struct InMemoryReplicaSet {
    state: Arc<Mutex<ClusterState>>,
    config: Arc<SimulationConfig>,
}

impl InMemoryReplicaSet {
    /// Create a new replica set
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new(&config))),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Number of members (primary included)
    pub fn member_count(&self) -> u32 {
        self.state.lock().members()
    }

    /// Make the whole replica set (un)reachable
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    /// Open a handle bound to `concerns`
    pub fn connect(&self, concerns: ConcernSet) -> Result<ReplicaSetHandle, StoreError> {
        let state = self.state.lock();
        state.check_reachable()?;

        if let Some(write) = concerns.write {
            if let Acknowledgement::Nodes(n) = write.w {
                if n > state.members() {
                    return Err(StoreError::InvalidOperation(format!(
                        "write concern w={} exceeds the {} replica set members",
                        n,
                        state.members()
                    )));
                }
            }
        }
        if concerns.read == Some(ReadConcern::Linearizable)
            && concerns.effective_preference() != ReadPreference::Primary
        {
            return Err(StoreError::InvalidOperation(
                "read concern linearizable requires read preference primary".to_string(),
            ));
        }

        debug!(concerns = %concerns, "opened replica set handle");
        Ok(ReplicaSetHandle {
            cluster: self.clone(),
            concerns,
        })
    }

    /// Records of a collection as the primary sees them
    pub fn primary_records(&self, collection: &str) -> Vec<Record> {
        self.state
            .lock()
            .primary
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Records of a collection as a secondary sees them
    pub fn secondary_records(&self, secondary: usize, collection: &str) -> Vec<Record> {
        let state = self.state.lock();
        let ts = state.secondaries.get(secondary).copied().unwrap_or(state.head);
        state
            .view_at(ts)
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Primary head position and each secondary's applied position
    pub fn replication_positions(&self) -> (u64, Vec<u64>) {
        let state = self.state.lock();
        (state.head, state.secondaries.clone())
    }

    /// Number of sessions not yet ended
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of sessions with an open transaction
    pub fn open_transactions(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.transaction.is_some())
            .count()
    }
}

/// Handle on an [`InMemoryReplicaSet`] bound to one concern triple
#[derive(Clone)]
pub struct ReplicaSetHandle {
    cluster: InMemoryReplicaSet,
    concerns: ConcernSet,
}

impl ReplicaSetHandle {
    pub fn cluster(&self) -> &InMemoryReplicaSet {
        &self.cluster
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Database for ReplicaSetHandle {
    fn concerns(&self) -> &ConcernSet {
        &self.concerns
    }

    async fn find_one(
        &self,
        collection: &str,
        key: Key,
        session: Option<&SessionId>,
    ) -> Result<Record, StoreError> {
        let (result, delay) = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let (view, delay) = state.read_view(&self.concerns, session, &self.cluster.config)?;
            let record = view
                .get(collection)
                .and_then(|c| c.get(&key))
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    key,
                });
            (record, delay)
        };
        pause(delay).await;
        result
    }

    async fn update_one(
        &self,
        collection: &str,
        key: Key,
        field: &str,
        delta: i64,
        session: Option<&SessionId>,
    ) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let op = OplogOp::Inc {
                collection: collection.to_string(),
                key,
                field: field.to_string(),
                delta,
            };
            state.write(&self.concerns, session, op, &self.cluster.config)?
        };
        pause(delay).await;
        Ok(())
    }

    async fn aggregate_sum(
        &self,
        collection: &str,
        group_key: &str,
        field: &str,
        session: Option<&SessionId>,
    ) -> Result<i64, StoreError> {
        let (total, delay) = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let (view, delay) = state.read_view(&self.concerns, session, &self.cluster.config)?;
            let total: i64 = view
                .get(collection)
                .map(|c| c.values().filter_map(|r| r.get(field)).sum())
                .unwrap_or(0);
            (total, delay)
        };
        debug!(group = group_key, field, total, "aggregated sum");
        pause(delay).await;
        Ok(total)
    }

    async fn start_session(&self, causal_consistency: bool) -> Result<SessionId, StoreError> {
        let mut state = self.cluster.state.lock();
        state.check_reachable()?;
        let id = SessionId::new();
        state.sessions.insert(
            id,
            SessionState {
                causal: causal_consistency,
                operation_time: 0,
                transaction: None,
            },
        );
        Ok(id)
    }

    async fn start_transaction(
        &self,
        session: &SessionId,
        options: &ConcernSet,
    ) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;

            if options.effective_preference() != ReadPreference::Primary {
                return Err(StoreError::InvalidOperation(
                    "read preference in a transaction must be primary".to_string(),
                ));
            }
            let read = options.read.or(self.concerns.read).unwrap_or_default();
            if read == ReadConcern::Linearizable || read == ReadConcern::Available {
                return Err(StoreError::InvalidOperation(format!(
                    "read concern {} is not supported in a transaction",
                    read
                )));
            }
            if state.session_mut(session)?.transaction.is_some() {
                return Err(StoreError::TransactionInProgress(*session));
            }

            // majority and snapshot transactions read a majority-committed snapshot
            let mut delay = Duration::ZERO;
            let head = state.head;
            if matches!(read, ReadConcern::Majority | ReadConcern::Snapshot)
                && state.majority_point() < head
            {
                let majority = Acknowledgement::Majority.required_members(state.members());
                state.await_members(head, majority);
                delay += self.cluster.config.latency.replication;
            }

            let write_concern = options.write.or(self.concerns.write);
            state.session_mut(session)?.transaction = Some(TransactionState {
                snapshot_ts: head,
                write_concern,
                writes: Vec::new(),
            });
            delay
        };
        pause(delay).await;
        Ok(())
    }

    async fn commit_transaction(&self, session: &SessionId) -> Result<(), StoreError> {
        let (result, delay) = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let txn = state
                .session_mut(session)?
                .transaction
                .take()
                .ok_or(StoreError::NoTransaction(*session))?;
            let mut delay = state.round_trip(&self.cluster.config.latency);

            let rate = self.cluster.config.commit_failure_rate.clamp(0.0, 1.0);
            if rate > 0.0 && state.rng.gen_bool(rate) {
                state.compact();
                (
                    Err(StoreError::TransactionAborted(
                        "transient transaction error during commit".to_string(),
                    )),
                    delay,
                )
            } else {
                if !txn.writes.is_empty() {
                    let ts = state.append(
                        OplogOp::ApplyOps(txn.writes),
                        &self.cluster.config.replication_lag,
                    );
                    delay = state.acknowledge(
                        ts,
                        txn.write_concern.unwrap_or_default(),
                        &self.cluster.config.latency,
                    );
                    state.observe(Some(session), ts);
                }
                state.compact();
                (Ok(()), delay)
            }
        };
        pause(delay).await;
        result
    }

    async fn abort_transaction(&self, session: &SessionId) -> Result<(), StoreError> {
        let mut state = self.cluster.state.lock();
        state
            .session_mut(session)?
            .transaction
            .take()
            .ok_or(StoreError::NoTransaction(*session))?;
        state.compact();
        Ok(())
    }

    async fn end_session(&self, session: SessionId) -> Result<(), StoreError> {
        let mut state = self.cluster.state.lock();
        state
            .sessions
            .remove(&session)
            .ok_or(StoreError::SessionNotFound(session))?;
        state.compact();
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let op = OplogOp::Drop {
                collection: collection.to_string(),
            };
            state.write(&self.concerns, None, op, &self.cluster.config)?
        };
        pause(delay).await;
        Ok(())
    }

    async fn insert(&self, collection: &str, record: Record) -> Result<(), StoreError> {
        let delay = {
            let mut state = self.cluster.state.lock();
            state.check_reachable()?;
            let op = OplogOp::Insert {
                collection: collection.to_string(),
                record,
            };
            state.write(&self.concerns, None, op, &self.cluster.config)?
        };
        pause(delay).await;
        Ok(())
    }

    async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        self.cluster.state.lock().check_reachable()?;
        Ok(ServerInfo {
            version: self.cluster.config.server_version.clone(),
            storage_engine: self.cluster.config.storage_engine.clone(),
        })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
