/// Swarm coordinator: the single owner of download bookkeeping.
///
/// ```text
///   needed = [0, total) \ (written ∪ assigned)
///
///   needed ──assign──► assigned ──write──► written ──verify ok──► verified
///     ▲                   │                  │
///     └──── queued / failed / closed ────────┘◄──── verify failed
/// ```
///
/// Sources talk to the coordinator through four events (active, queued,
/// wrote, failed/closed) and receive at most one assignment at a time.
/// Every event runs under one mutex; verification reads and hashing happen
/// outside it with the blocks parked in `verifying` so nothing is judged twice.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SwarmConfig;
use crate::connection::{ConnectionId, ConnectionState, QueueInfo, SourceConnection};
use crate::error::{Result, SwarmError};
use crate::logging::{NullLogger, SwarmEvent, SwarmLog, SwarmLogger};
use crate::progress::SwarmProgress;
use crate::range::{Range, RangeSet};
use crate::selection::{SelectionStrategy, SequentialStrategy};
use crate::verifier::{BlockReader, BlockVerifier};

/// Why a transfer stopped without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Bytes are missing and no source is active or queued.
    InsufficientSources { missing: u64 },
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientSources { missing } => {
                write!(f, "insufficient sources, {} bytes missing", missing)
            }
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal notification. Published once, never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmOutcome {
    Complete { bytes: u64 },
    Failed(FailureReason),
}

impl SwarmOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// Every bookkeeping set and connection, read under one lock.
#[derive(Debug, Clone)]
pub struct CoverageSnapshot {
    pub needed: RangeSet,
    pub assigned: RangeSet,
    pub written: RangeSet,
    pub verified: RangeSet,
    pub verifying: RangeSet,
    pub connections: Vec<SourceConnection>,
    pub outcome: Option<SwarmOutcome>,
}

struct CoordinatorState {
    written: RangeSet,
    verified: RangeSet,
    /// Written blocks handed to the verifier and not judged yet.
    verifying: RangeSet,
    assigned: RangeSet,
    connections: BTreeMap<ConnectionId, SourceConnection>,
    next_id: u64,
    outcome: Option<SwarmOutcome>,
}

impl CoordinatorState {
    fn connection(&mut self, id: ConnectionId) -> Result<&mut SourceConnection> {
        self.connections
            .get_mut(&id)
            .ok_or(SwarmError::UnknownConnection(id))
    }

    fn needed(&self, whole: Range) -> RangeSet {
        let claimed = self.written.union(&self.assigned);
        claimed.complement(whole).into_iter().collect()
    }

    fn has_live_connection(&self) -> bool {
        self.connections.values().any(|c| c.state().is_live())
    }
}

pub struct SwarmCoordinator {
    transfer_id: Uuid,
    whole: Range,
    max_chunk_size: u64,
    verifier: Arc<dyn BlockVerifier>,
    reader: Arc<dyn BlockReader>,
    selector: Box<dyn SelectionStrategy>,
    logger: Arc<dyn SwarmLogger>,
    progress: Arc<SwarmProgress>,
    state: Mutex<CoordinatorState>,
    outcome_tx: watch::Sender<Option<SwarmOutcome>>,
    wakeup: Notify,
}

impl SwarmCoordinator {
    /// Coordinator for a payload of `total_length` bytes, verified by
    /// `verifier` against data read back through `reader`.
    pub fn new(
        total_length: u64,
        verifier: Arc<dyn BlockVerifier>,
        reader: Arc<dyn BlockReader>,
    ) -> Result<Self> {
        let whole = Range::new(0, total_length)?;
        let (outcome_tx, _) = watch::channel(None);
        Ok(Self {
            transfer_id: Uuid::new_v4(),
            whole,
            max_chunk_size: SwarmConfig::default().max_chunk_size,
            verifier,
            reader,
            selector: Box::new(SequentialStrategy),
            logger: Arc::new(NullLogger),
            progress: Arc::new(SwarmProgress::new(total_length)),
            state: Mutex::new(CoordinatorState {
                written: RangeSet::new(),
                verified: RangeSet::new(),
                verifying: RangeSet::new(),
                assigned: RangeSet::new(),
                connections: BTreeMap::new(),
                next_id: 1,
                outcome: None,
            }),
            outcome_tx,
            wakeup: Notify::new(),
        })
    }

    /// Apply chunk size and selection heuristic from `config`.
    pub fn with_config(mut self, config: &SwarmConfig) -> Self {
        self.max_chunk_size = config.max_chunk_size.max(1);
        self.selector = config.selection.build();
        self
    }

    pub fn with_selection(mut self, selector: Box<dyn SelectionStrategy>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: u64) -> Self {
        self.max_chunk_size = max_chunk_size.max(1);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn SwarmLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_transfer_id(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = transfer_id;
        self
    }

    pub fn transfer_id(&self) -> Uuid {
        self.transfer_id
    }

    pub fn total_length(&self) -> u64 {
        self.whole.end()
    }

    pub fn progress(&self) -> Arc<SwarmProgress> {
        self.progress.clone()
    }

    /// Notified whenever bytes may have become available or the outcome
    /// was published. Idle sources wait on this.
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    // ── Transport events ───────────────────────────────────────────────

    /// Add a source in `ACTIVE` state. `available` limits it to the bytes
    /// the remote holds.
    pub fn register(&self, label: impl Into<String>, available: Option<RangeSet>) -> Result<ConnectionId> {
        let label = label.into();
        let mut state = self.lock();
        if state.outcome.is_some() {
            return Err(SwarmError::TransferFinished);
        }
        let id = ConnectionId(state.next_id);
        state.next_id += 1;

        let available = available.map(|set| set.intersect_range(self.whole));
        state
            .connections
            .insert(id, SourceConnection::new(id, label.clone(), available));
        self.emit(SwarmEvent::SourceAdded { id, label });
        Ok(id)
    }

    /// Source is ready to serve. Returns its current assignment, granting a
    /// new one if it was idle. `None` means nothing to do right now.
    pub fn became_active(&self, id: ConnectionId) -> Result<Option<Range>> {
        let mut state = self.lock();
        let conn = state.connection(id)?;
        let from = conn.state();
        conn.activate()?;
        if from != ConnectionState::Active {
            self.emit(SwarmEvent::StateChanged {
                id,
                from,
                to: ConnectionState::Active,
            });
        }
        if let Some(current) = conn.assignment() {
            return Ok(Some(current));
        }
        self.assign_next(&mut state, id)
    }

    /// Remote paused the source. Its assignment returns to the free pool.
    pub fn became_queued(&self, id: ConnectionId, info: QueueInfo) -> Result<()> {
        let mut state = self.lock();
        let conn = state.connection(id)?;
        let from = conn.state();
        let released = conn.enqueue(info)?;
        if from != ConnectionState::Queued {
            self.emit(SwarmEvent::StateChanged {
                id,
                from,
                to: ConnectionState::Queued,
            });
        }
        self.release(&mut state, id, released);
        Ok(())
    }

    /// Source failed. Its assignment returns to the free pool.
    pub fn failed(&self, id: ConnectionId, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut state = self.lock();
        let conn = state.connection(id)?;
        let from = conn.state();
        let released = conn.fail()?;
        if from != ConnectionState::Failed {
            self.progress
                .sources_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.emit(SwarmEvent::SourceFailed { id, reason });
            self.emit(SwarmEvent::StateChanged {
                id,
                from,
                to: ConnectionState::Failed,
            });
        }
        self.release(&mut state, id, released);
        self.check_liveness_locked(&mut state);
        Ok(())
    }

    /// Source closed for good. Its assignment returns to the free pool.
    pub fn closed(&self, id: ConnectionId) -> Result<()> {
        let mut state = self.lock();
        let conn = state.connection(id)?;
        let from = conn.state();
        let released = conn.close()?;
        self.emit(SwarmEvent::StateChanged {
            id,
            from,
            to: ConnectionState::Closed,
        });
        self.release(&mut state, id, released);
        self.check_liveness_locked(&mut state);
        Ok(())
    }

    /// Source wrote `length` bytes at `offset`, a prefix of its assignment.
    ///
    /// Triggers verification of every block that became fully written.
    /// Returns the unwritten remainder of the assignment; `None` means the
    /// connection is idle and asks again through `became_active`.
    pub fn write_completed(&self, id: ConnectionId, offset: u64, length: u64) -> Result<Option<Range>> {
        let range = Range::with_len(offset, length)?;
        range.check_bounds(self.total_length())?;

        let blocks = {
            let mut state = self.lock();
            state.connection(id)?.consume(range)?;
            state.assigned.remove(range);
            state.written.add(range);
            self.emit(SwarmEvent::RangeWritten { id, range });
            self.publish_coverage(&state);
            self.claim_verifiable(&mut state)
        };

        let results = self.run_verification(&blocks);

        let mut state = self.lock();
        self.apply_verification(&mut state, results);
        Ok(state.connection(id)?.assignment())
    }

    /// Stop the transfer: close every connection, discard outstanding
    /// assignments and publish `Failed(Cancelled)` unless already finished.
    /// Callers drain in-flight writes first.
    pub fn cancel(&self) {
        let mut state = self.lock();
        let ids: Vec<ConnectionId> = state.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = state.connections.get_mut(&id) else {
                continue;
            };
            if conn.state() == ConnectionState::Closed {
                continue;
            }
            if let Ok(Some(range)) = conn.close() {
                state.assigned.remove(range);
                debug!(%id, %range, "discarded assignment on cancel");
            }
        }
        state.assigned.clear();
        if state.outcome.is_none() {
            self.publish(&mut state, SwarmOutcome::Failed(FailureReason::Cancelled));
        }
    }

    /// Publish `InsufficientSources` if bytes are missing and no source is
    /// active or queued. Drivers call this when they run out of sources.
    pub fn check_liveness(&self) {
        let mut state = self.lock();
        self.check_liveness_locked(&mut state);
    }

    /// Throw away all verification results and judge every written block again.
    /// Returns the number of bytes that failed.
    pub fn reverify(&self) -> Result<u64> {
        let blocks = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return Err(SwarmError::TransferFinished);
            }
            state.verified.clear();
            self.publish_coverage(&state);
            self.claim_verifiable(&mut state)
        };
        let results = self.run_verification(&blocks);
        let lost = results
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(block, _)| block.len())
            .sum();

        let mut state = self.lock();
        self.apply_verification(&mut state, results);
        Ok(lost)
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// Bytes nobody has written or been assigned.
    pub fn needed(&self) -> RangeSet {
        self.lock().needed(self.whole)
    }

    pub fn written(&self) -> RangeSet {
        self.lock().written.clone()
    }

    pub fn verified(&self) -> RangeSet {
        self.lock().verified.clone()
    }

    pub fn assigned(&self) -> RangeSet {
        self.lock().assigned.clone()
    }

    /// Consistent view for callers that compare several sets at once.
    pub fn snapshot(&self) -> CoverageSnapshot {
        let state = self.lock();
        CoverageSnapshot {
            needed: state.needed(self.whole),
            assigned: state.assigned.clone(),
            written: state.written.clone(),
            verified: state.verified.clone(),
            verifying: state.verifying.clone(),
            connections: state.connections.values().cloned().collect(),
            outcome: state.outcome.clone(),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<SourceConnection> {
        self.lock().connections.get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<SourceConnection> {
        self.lock().connections.values().cloned().collect()
    }

    /// Whether `id` holds any byte that is not verified yet.
    pub fn can_contribute(&self, id: ConnectionId) -> bool {
        let state = self.lock();
        let Some(conn) = state.connections.get(&id) else {
            return false;
        };
        if !conn.state().is_live() {
            return false;
        }
        match conn.available() {
            None => !state.verified.contains(self.whole),
            Some(available) => !available.difference(&state.verified).is_empty(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().verified.contains(self.whole)
    }

    pub fn outcome(&self) -> Option<SwarmOutcome> {
        self.lock().outcome.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SwarmOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Wait for the terminal outcome.
    pub async fn finished(&self) -> SwarmOutcome {
        let mut rx = self.outcome_tx.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok().and_then(|o| o.clone());
        outcome.unwrap_or(SwarmOutcome::Failed(FailureReason::Cancelled))
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SwarmEvent) {
        self.logger.log(SwarmLog {
            component: "coordinator",
            transfer_id: self.transfer_id,
            event,
        });
    }

    fn assign_next(&self, state: &mut CoordinatorState, id: ConnectionId) -> Result<Option<Range>> {
        if state.outcome.is_some() {
            return Ok(None);
        }
        let mut candidates = state.needed(self.whole);
        let conn = state.connection(id)?;
        if !conn.is_idle() {
            return Ok(conn.assignment());
        }
        if let Some(available) = conn.available() {
            candidates = candidates.intersect(available);
        }

        let block_size = self.verifier.block_size();
        let Some(range) = self.selector.pick(&candidates, self.max_chunk_size, block_size) else {
            return Ok(None);
        };
        if !candidates.contains(range) {
            warn!(%id, %range, "selection strategy picked bytes that are not free");
            return Ok(None);
        }

        state.connection(id)?.assign(range)?;
        state.assigned.add(range);
        self.progress
            .assignments
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.emit(SwarmEvent::RangeAssigned { id, range });
        Ok(Some(range))
    }

    fn release(&self, state: &mut CoordinatorState, id: ConnectionId, released: Option<Range>) {
        if let Some(range) = released {
            state.assigned.remove(range);
            self.emit(SwarmEvent::RangeReleased { id, range });
            self.wakeup.notify_waiters();
        }
    }

    /// Blocks that just became verifiable, moved into `verifying`.
    fn claim_verifiable(&self, state: &mut CoordinatorState) -> Vec<Range> {
        let unverified = state
            .written
            .difference(&state.verified)
            .difference(&state.verifying);
        if unverified.is_empty() {
            return Vec::new();
        }
        let blocks: Vec<Range> = self
            .verifier
            .scan_verifiable(&unverified, self.total_length())
            .into_iter()
            .filter(|block| unverified.contains(*block))
            .collect();
        for block in &blocks {
            state.verifying.add(*block);
        }
        blocks
    }

    fn run_verification(&self, blocks: &[Range]) -> Vec<(Range, bool)> {
        blocks
            .iter()
            .map(|block| (*block, self.verifier.verify(*block, self.reader.as_ref())))
            .collect()
    }

    fn apply_verification(&self, state: &mut CoordinatorState, results: Vec<(Range, bool)>) {
        let judged = !results.is_empty();
        for (block, ok) in results {
            state.verifying.remove(block);
            self.progress.record_verification(ok, block.len());
            if ok {
                state.verified.add(block);
                self.emit(SwarmEvent::BlockVerified { range: block });
            } else {
                // Back into `needed`; never counted as verified.
                state.written.remove(block);
                self.emit(SwarmEvent::BlockRejected { range: block });
            }
        }

        self.accept_unverifiable(state);
        self.publish_coverage(state);

        if state.outcome.is_none() && state.verified.contains(self.whole) {
            let lost = self.progress.lost();
            info!(bytes = self.total_length(), lost, "transfer verified");
            self.emit(SwarmEvent::TransferComplete {
                total_bytes: self.total_length(),
                lost_bytes: lost,
            });
            self.publish(
                state,
                SwarmOutcome::Complete {
                    bytes: self.total_length(),
                },
            );
        } else if judged {
            // Rejected bytes may be back in `needed` after the last source left.
            self.check_liveness_locked(state);
            self.wakeup.notify_waiters();
        }
    }

    /// A fully written file whose remainder the verifier will never judge
    /// (verification disabled) counts as verified.
    fn accept_unverifiable(&self, state: &mut CoordinatorState) {
        if !state.verifying.is_empty() || !state.written.contains(self.whole) {
            return;
        }
        let remainder = state.written.difference(&state.verified);
        if remainder.is_empty() {
            return;
        }
        if self
            .verifier
            .scan_verifiable(&remainder, self.total_length())
            .is_empty()
        {
            debug!(bytes = remainder.len_bytes(), "accepting bytes the verifier cannot judge");
            state.verified.add_set(&remainder);
        }
    }

    fn check_liveness_locked(&self, state: &mut CoordinatorState) {
        if state.outcome.is_some() || state.has_live_connection() {
            return;
        }
        let missing = state.needed(self.whole).len_bytes();
        if missing == 0 {
            return;
        }
        let reason = FailureReason::InsufficientSources { missing };
        let err = SwarmError::InsufficientSources { missing };
        warn!("{}", err);
        self.emit(SwarmEvent::TransferFailed {
            reason: reason.to_string(),
        });
        self.publish(state, SwarmOutcome::Failed(reason));
    }

    fn publish(&self, state: &mut CoordinatorState, outcome: SwarmOutcome) {
        state.outcome = Some(outcome.clone());
        self.outcome_tx.send_replace(Some(outcome));
        self.wakeup.notify_waiters();
    }

    fn publish_coverage(&self, state: &CoordinatorState) {
        self.progress
            .set_coverage(state.written.len_bytes(), state.verified.len_bytes());
    }
}
