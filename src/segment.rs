//! Replicated segment state machine
//!
//! One [`ReplicatedSegment`] tracks the replication of a single log
//! segment to `num_replicas` backups. Each replica walks a small state
//! machine (open, write until caught up, close, free) driven entirely by
//! `perform_task` calls from the scheduler; at most one RPC per replica is
//! outstanding at a time, and nothing here blocks.
//!
//! Failure handling is absorbed internally: a transient RPC error retries
//! against the same backup a bounded number of times, anything worse rolls
//! the replica back to NotStarted so a new backup can be selected.

use log::{debug, trace, warn};

use crate::backup::{BackupClient, CoordinatorClient, RpcId, RpcStatus, ServerId};
use crate::metrics::ReplicaMetrics;
use crate::selector::BackupSelector;
use crate::task::{TaskId, TaskScheduler};

/// Consecutive transient failures tolerated on one backup before it is
/// treated as down and the replica is re-placed.
pub(crate) const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Global bound on concurrently outstanding data-carrying (open/write)
/// RPCs across all segments of one manager.
pub(crate) const MAX_WRITE_RPCS_IN_FLIGHT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// No backup chosen yet.
    NotStarted,
    /// Open RPC carrying the first `open_len` bytes.
    Opening,
    /// Durably open; accepting writes.
    Open,
    /// Write RPC in flight.
    Writing,
    /// Close RPC in flight.
    Closing,
    /// Sealed on the backup.
    Closed,
    /// Free RPC in flight.
    Freeing,
    /// Terminal.
    Done,
}

pub(crate) struct Replica {
    pub(crate) state: ReplicaState,
    pub(crate) backup: Option<ServerId>,
    pub(crate) rpc: Option<RpcId>,
    /// Bytes the backup has acknowledged durable.
    pub(crate) acked_bytes: u32,
    /// Consecutive transient failures of the current operation.
    pub(crate) retries: u32,
    /// An open has been issued at least once for this replica slot. Input
    /// to the open-ordering invariant; stays set across re-placement.
    pub(crate) open_issued: bool,
    /// Holds one unit of the global write-RPC budget.
    pub(crate) holds_budget: bool,
}

impl Replica {
    fn new() -> Self {
        Self {
            state: ReplicaState::NotStarted,
            backup: None,
            rpc: None,
            acked_bytes: 0,
            retries: 0,
            open_issued: false,
            holds_budget: false,
        }
    }
}

/// Everything a segment needs from its manager for one `perform_task`
/// call. Segments hold no back-pointer; the manager assembles this view
/// per task per pass.
pub(crate) struct TaskContext<'a, C: CoordinatorClient, B: BackupClient> {
    pub(crate) task_id: TaskId,
    pub(crate) scheduler: &'a mut TaskScheduler,
    pub(crate) selector: &'a mut BackupSelector<C>,
    pub(crate) transport: &'a mut B,
    /// The master's id, once it has enlisted. No RPC is issued before it
    /// is known.
    pub(crate) master_id: Option<ServerId>,
    pub(crate) write_rpcs_in_flight: &'a mut u32,
    /// True when every replica of the predecessor segment has issued its
    /// open RPC (or there is no predecessor).
    pub(crate) preceding_opens_done: bool,
    pub(crate) metrics: &'a ReplicaMetrics,
}

/// Replication state for one log segment.
///
/// The segment bytes are referenced raw: the caller of
/// `ReplicaManager::open_segment` guarantees the memory at `data` stays
/// valid and unchanged up to every offset passed to `write` until the
/// free completes or the manager is dropped.
pub struct ReplicatedSegment {
    segment_id: u64,
    data: *const u8,
    open_len: u32,
    /// High-water mark of bytes enqueued for replication.
    queued_bytes: u32,
    closed: bool,
    free_requested: bool,
    /// Predecessor in the log, while its opens are still outstanding.
    preceding: Option<TaskId>,
    replicas: Box<[Replica]>,
}

impl ReplicatedSegment {
    pub(crate) fn new(
        segment_id: u64,
        data: *const u8,
        open_len: u32,
        num_replicas: u32,
        preceding: Option<TaskId>,
    ) -> Self {
        Self {
            segment_id,
            data,
            open_len,
            queued_bytes: open_len,
            closed: false,
            free_requested: false,
            preceding,
            replicas: (0..num_replicas).map(|_| Replica::new()).collect(),
        }
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn queued_bytes(&self) -> u32 {
        self.queued_bytes
    }

    pub(crate) fn preceding(&self) -> Option<TaskId> {
        self.preceding
    }

    pub(crate) fn clear_preceding(&mut self) {
        self.preceding = None;
    }

    /// Every replica slot has issued its open at least once. Successor
    /// segments may not open before this holds.
    pub(crate) fn all_opens_issued(&self) -> bool {
        self.replicas.iter().all(|r| r.open_issued)
    }

    pub(crate) fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Advance the high-water mark of bytes ready to ship to `offset`.
    ///
    /// Offsets must be strictly increasing; the segment must not be
    /// closed or freed.
    pub(crate) fn write(&mut self, offset: u32) {
        if self.free_requested {
            panic!(
                "write on segment {} after free was requested",
                self.segment_id
            );
        }
        if self.closed {
            panic!("write on closed segment {}", self.segment_id);
        }
        if offset <= self.queued_bytes {
            panic!(
                "non-monotonic write on segment {}: offset {} <= queued {}",
                self.segment_id, offset, self.queued_bytes
            );
        }
        trace!(
            "segment {}: queued bytes {} -> {}",
            self.segment_id, self.queued_bytes, offset
        );
        self.queued_bytes = offset;
    }

    /// Declare the segment immutable. Illegal after `free`.
    pub(crate) fn close(&mut self) {
        if self.free_requested {
            panic!(
                "close on segment {} after free was requested",
                self.segment_id
            );
        }
        if self.closed {
            panic!("segment {} closed twice", self.segment_id);
        }
        debug!("segment {}: close at {} bytes", self.segment_id, self.queued_bytes);
        self.closed = true;
    }

    /// The log no longer needs the replicas; discard them on the backups.
    pub(crate) fn free(&mut self) {
        debug!("segment {}: free requested", self.segment_id);
        self.free_requested = true;
    }

    /// Everything enqueued is durable and no outstanding frees remain.
    pub fn is_synced(&self) -> bool {
        let free_pending = self.free_requested
            && !self
                .replicas
                .iter()
                .all(|r| r.state == ReplicaState::Done);
        let writes_durable = !self.closed
            || self
                .replicas
                .iter()
                .all(|r| r.acked_bytes == self.queued_bytes);
        writes_durable && !free_pending
    }

    /// Advance each replica by at most one RPC transition.
    ///
    /// Returns true once the segment has been freed on every backup and
    /// the manager should destroy it. Re-schedules itself while work
    /// remains.
    pub(crate) fn perform_task<C: CoordinatorClient, B: BackupClient>(
        &mut self,
        ctx: &mut TaskContext<'_, C, B>,
    ) -> bool {
        // The invariant only ever becomes true, so the link can drop as
        // soon as it is observed satisfied.
        if ctx.preceding_opens_done {
            self.preceding = None;
        }

        self.reap_completed(ctx);
        self.check_cluster_membership(ctx);
        for index in 0..self.replicas.len() {
            self.advance_replica(index, ctx);
        }

        if self.free_requested
            && self
                .replicas
                .iter()
                .all(|r| r.state == ReplicaState::Done)
        {
            debug_assert!(self.replicas.iter().all(|r| !r.holds_budget));
            debug!("segment {}: freed on all backups", self.segment_id);
            return true;
        }
        if self.work_remains() {
            ctx.scheduler.schedule(ctx.task_id);
        }
        false
    }

    /// Poll outstanding RPCs and fold their results into replica state.
    fn reap_completed<C: CoordinatorClient, B: BackupClient>(
        &mut self,
        ctx: &mut TaskContext<'_, C, B>,
    ) {
        let segment_id = self.segment_id;
        let free_requested = self.free_requested;
        for replica in self.replicas.iter_mut() {
            let Some(rpc) = replica.rpc else { continue };
            match ctx.transport.poll(rpc) {
                RpcStatus::Pending => {}
                RpcStatus::Done { durable_bytes } => {
                    replica.rpc = None;
                    replica.retries = 0;
                    release_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                    match replica.state {
                        ReplicaState::Opening | ReplicaState::Writing => {
                            replica.acked_bytes = replica.acked_bytes.max(durable_bytes);
                            replica.state = ReplicaState::Open;
                            trace!(
                                "segment {}: backup {} durable to {}",
                                segment_id,
                                replica.backup.expect("rpc without backup"),
                                replica.acked_bytes
                            );
                        }
                        ReplicaState::Closing => replica.state = ReplicaState::Closed,
                        ReplicaState::Freeing => replica.state = ReplicaState::Done,
                        state => unreachable!("rpc completed in state {state:?}"),
                    }
                }
                RpcStatus::TransientError => {
                    replica.rpc = None;
                    release_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                    replica.retries += 1;
                    ctx.metrics.rpc_retries.increment();
                    if replica.retries > MAX_TRANSIENT_RETRIES {
                        fail_replica(replica, segment_id, free_requested, ctx.metrics);
                    }
                    // Otherwise the replica keeps its state with no RPC
                    // outstanding and the issue pass retries the same
                    // backup.
                }
                RpcStatus::PermanentError => {
                    replica.rpc = None;
                    release_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                    fail_replica(replica, segment_id, free_requested, ctx.metrics);
                }
            }
        }
    }

    /// Roll back replicas whose backup disappeared from the cluster view.
    fn check_cluster_membership<C: CoordinatorClient, B: BackupClient>(
        &mut self,
        ctx: &mut TaskContext<'_, C, B>,
    ) {
        let segment_id = self.segment_id;
        let free_requested = self.free_requested;
        for replica in self.replicas.iter_mut() {
            if let Some(backup) = replica.backup
                && replica.state != ReplicaState::Done
                && !ctx.selector.is_listed(backup)
            {
                // Any RPC to the dropped backup is abandoned; the
                // transport's eventual answer for it no longer matters.
                replica.rpc = None;
                release_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                fail_replica(replica, segment_id, free_requested, ctx.metrics);
            }
        }
    }

    /// Issue at most one RPC for the replica at `index`.
    fn advance_replica<C: CoordinatorClient, B: BackupClient>(
        &mut self,
        index: usize,
        ctx: &mut TaskContext<'_, C, B>,
    ) {
        if self.replicas[index].rpc.is_some() {
            return;
        }
        let Some(master) = ctx.master_id else {
            // Not enlisted yet; stay scheduled until the id arrives.
            return;
        };

        let segment_id = self.segment_id;
        let data = self.data;
        let open_len = self.open_len;
        let queued_bytes = self.queued_bytes;
        // Close is not issued until every replica has caught up, so the
        // close RPCs go out together once the segment is fully durable.
        let closed = self.closed
            && self
                .replicas
                .iter()
                .all(|r| r.acked_bytes == self.queued_bytes);

        if self.free_requested {
            let replica = &mut self.replicas[index];
            match replica.state {
                ReplicaState::Done => {}
                ReplicaState::NotStarted => {
                    // Never placed; nothing on any backup to discard.
                    replica.state = ReplicaState::Done;
                }
                _ => {
                    let backup = replica.backup.expect("started replica without backup");
                    replica.rpc = Some(ctx.transport.free(backup, master, segment_id));
                    replica.state = ReplicaState::Freeing;
                    ctx.metrics.free_rpcs.increment();
                    trace!("segment {segment_id}: freeing replica on backup {backup}");
                }
            }
            return;
        }

        match self.replicas[index].state {
            ReplicaState::NotStarted => {
                // Opening is gated on the predecessor having issued all
                // of its opens, so crash recovery can find the log head.
                if self.preceding.is_some() {
                    return;
                }
                if *ctx.write_rpcs_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
                    return;
                }
                let chosen: Vec<ServerId> =
                    self.replicas.iter().filter_map(|r| r.backup).collect();
                let Some(backup) = ctx.selector.select(master, &chosen) else {
                    return;
                };
                let open_data = unsafe { std::slice::from_raw_parts(data, open_len as usize) };
                let replica = &mut self.replicas[index];
                replica.backup = Some(backup);
                replica.rpc = Some(ctx.transport.open(backup, master, segment_id, open_data));
                replica.state = ReplicaState::Opening;
                replica.open_issued = true;
                replica.acked_bytes = 0;
                acquire_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                ctx.metrics.open_rpcs.increment();
                debug!(
                    "segment {segment_id}: opening replica {index} on backup {backup} \
                     ({open_len} bytes)"
                );
            }
            ReplicaState::Opening => {
                // Transient-failure retry of the open.
                if *ctx.write_rpcs_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
                    return;
                }
                let open_data = unsafe { std::slice::from_raw_parts(data, open_len as usize) };
                let replica = &mut self.replicas[index];
                let backup = replica.backup.expect("opening replica without backup");
                replica.rpc = Some(ctx.transport.open(backup, master, segment_id, open_data));
                acquire_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                ctx.metrics.open_rpcs.increment();
            }
            ReplicaState::Open | ReplicaState::Writing => {
                let replica = &mut self.replicas[index];
                let backup = replica.backup.expect("open replica without backup");
                if replica.acked_bytes < queued_bytes {
                    if *ctx.write_rpcs_in_flight >= MAX_WRITE_RPCS_IN_FLIGHT {
                        return;
                    }
                    let offset = replica.acked_bytes;
                    let delta = unsafe {
                        std::slice::from_raw_parts(
                            data.add(offset as usize),
                            (queued_bytes - offset) as usize,
                        )
                    };
                    replica.rpc =
                        Some(ctx.transport.write(backup, master, segment_id, offset, delta));
                    replica.state = ReplicaState::Writing;
                    acquire_budget(replica, ctx.write_rpcs_in_flight, ctx.metrics);
                    ctx.metrics.write_rpcs.increment();
                    trace!(
                        "segment {segment_id}: writing [{offset}, {queued_bytes}) to \
                         backup {backup}"
                    );
                } else if closed && replica.state == ReplicaState::Open {
                    replica.rpc = Some(ctx.transport.close(backup, master, segment_id));
                    replica.state = ReplicaState::Closing;
                    ctx.metrics.close_rpcs.increment();
                    trace!("segment {segment_id}: closing replica on backup {backup}");
                }
            }
            ReplicaState::Closing => {
                let replica = &mut self.replicas[index];
                let backup = replica.backup.expect("closing replica without backup");
                replica.rpc = Some(ctx.transport.close(backup, master, segment_id));
                ctx.metrics.close_rpcs.increment();
            }
            ReplicaState::Closed | ReplicaState::Done => {}
            ReplicaState::Freeing => {
                let replica = &mut self.replicas[index];
                let backup = replica.backup.expect("freeing replica without backup");
                replica.rpc = Some(ctx.transport.free(backup, master, segment_id));
                ctx.metrics.free_rpcs.increment();
            }
        }
    }

    fn work_remains(&self) -> bool {
        self.replicas.iter().any(|r| {
            if r.rpc.is_some() {
                return true;
            }
            match r.state {
                ReplicaState::NotStarted
                | ReplicaState::Opening
                | ReplicaState::Writing
                | ReplicaState::Closing
                | ReplicaState::Freeing => true,
                ReplicaState::Open => {
                    self.free_requested
                        || r.acked_bytes < self.queued_bytes
                        || self.closed
                }
                ReplicaState::Closed => self.free_requested,
                ReplicaState::Done => false,
            }
        })
    }
}

fn acquire_budget(replica: &mut Replica, in_flight: &mut u32, metrics: &ReplicaMetrics) {
    debug_assert!(!replica.holds_budget);
    *in_flight += 1;
    metrics.write_rpcs_in_flight.increment();
    replica.holds_budget = true;
}

fn release_budget(replica: &mut Replica, in_flight: &mut u32, metrics: &ReplicaMetrics) {
    if replica.holds_budget {
        *in_flight -= 1;
        metrics.write_rpcs_in_flight.decrement();
        replica.holds_budget = false;
    }
}

/// Give up on the replica's current backup.
///
/// Under a pending free the replica's data is unreachable anyway, so the
/// free is considered satisfied; otherwise the replica re-places from
/// scratch.
fn fail_replica(
    replica: &mut Replica,
    segment_id: u64,
    free_requested: bool,
    metrics: &ReplicaMetrics,
) {
    let backup = replica.backup;
    metrics.backup_failures.increment();
    replica.rpc = None;
    replica.retries = 0;
    if free_requested {
        warn!(
            "segment {segment_id}: backup {backup:?} failed during free; treating \
             replica as discarded"
        );
        replica.state = ReplicaState::Done;
        return;
    }
    warn!(
        "segment {segment_id}: backup {backup:?} failed; re-placing replica on a \
         new backup"
    );
    replica.state = ReplicaState::NotStarted;
    replica.backup = None;
    replica.acked_bytes = 0;
}
