//! Replica manager
//!
//! Owns every [`ReplicatedSegment`] of one master's log, the cooperative
//! scheduler that drives them, and the backup selector. The log enqueues
//! work through segment handles and makes progress by calling `proceed`
//! (non-blocking) or `sync` (cooperative spin until everything enqueued
//! is durable).
//!
//! Segments live in an id-indexed pool; handles are pool ids, valid until
//! the segment's free completes or the manager is dropped. Slots are
//! reused, so a caller must not touch a handle after its free has been
//! observed complete.

use std::rc::Rc;

use log::{debug, trace};

use crate::backup::{BackupClient, CoordinatorClient, MasterIdCell};
use crate::metrics::{ReplicaMetrics, TickTimer};
use crate::segment::{ReplicatedSegment, TaskContext};
use crate::selector::BackupSelector;
use crate::task::{TaskId, TaskScheduler};

/// Handle to a replicated segment, returned by
/// [`ReplicaManager::open_segment`].
pub type SegmentHandle = TaskId;

pub struct ReplicaManager<C: CoordinatorClient, B: BackupClient> {
    num_replicas: u32,
    /// The master's id, populated once it enlists with the coordinator.
    /// No replica is placed before it is known.
    master_id: MasterIdCell,
    selector: BackupSelector<C>,
    transport: B,
    scheduler: TaskScheduler,
    /// Id-indexed segment pool; freed slots are reused.
    slots: Vec<Option<ReplicatedSegment>>,
    free_slots: Vec<TaskId>,
    /// Live segments in log order, oldest first.
    order: Vec<TaskId>,
    /// Outstanding data-carrying RPCs across all segments.
    write_rpcs_in_flight: u32,
    metrics: Rc<ReplicaMetrics>,
}

impl<C: CoordinatorClient, B: BackupClient> ReplicaManager<C, B> {
    pub fn new(
        num_replicas: u32,
        coordinator: C,
        master_id: MasterIdCell,
        transport: B,
        metrics: Rc<ReplicaMetrics>,
    ) -> Self {
        Self {
            num_replicas,
            master_id,
            selector: BackupSelector::new(coordinator),
            transport,
            scheduler: TaskScheduler::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            order: Vec::new(),
            write_rpcs_in_flight: 0,
            metrics,
        }
    }

    pub fn num_replicas(&self) -> u32 {
        self.num_replicas
    }

    pub fn metrics(&self) -> &ReplicaMetrics {
        &self.metrics
    }

    /// Enqueue a segment for replication and return its handle.
    ///
    /// Backup selection and replication happen later, as the scheduler
    /// runs; the data is not durably open on backups until `sync`
    /// returns. The first `open_len` bytes travel atomically with the
    /// open RPC.
    ///
    /// # Safety
    ///
    /// The memory at `data` must stay valid and unchanged up to every
    /// offset later passed to `write` until the segment's free completes
    /// (its handle is destroyed) or the manager is dropped; outstanding
    /// backup RPCs read it. `segment_id` must never repeat within this
    /// manager's log.
    pub unsafe fn open_segment(
        &mut self,
        segment_id: u64,
        data: *const u8,
        open_len: u32,
    ) -> SegmentHandle {
        let metrics = self.metrics.clone();
        let _timer = TickTimer::new(&metrics.replica_manager_ticks);
        debug!(
            "master {:?}: open segment {segment_id} ({open_len} open bytes)",
            self.master_id.get()
        );

        let preceding = self.order.last().copied();
        let segment = ReplicatedSegment::new(
            segment_id,
            data,
            open_len,
            self.num_replicas,
            preceding,
        );
        let handle = match self.free_slots.pop() {
            Some(id) => {
                self.slots[id] = Some(segment);
                id
            }
            None => {
                self.slots.push(Some(segment));
                self.slots.len() - 1
            }
        };
        self.order.push(handle);
        self.scheduler.schedule(handle);
        metrics.segments_opened.increment();
        metrics.segments_live.increment();
        handle
    }

    /// Enqueue bytes up to `offset` for replication. Offsets must be
    /// strictly increasing per segment.
    pub fn write(&mut self, handle: SegmentHandle, offset: u32) {
        self.segment_mut(handle).write(offset);
        self.scheduler.schedule(handle);
    }

    /// Declare the segment immutable. Illegal after `free`.
    pub fn close(&mut self, handle: SegmentHandle) {
        self.segment_mut(handle).close();
        self.scheduler.schedule(handle);
    }

    /// Discard the segment's replicas. The handle is destroyed once every
    /// backup acknowledges; afterwards it must not be used again.
    pub fn free(&mut self, handle: SegmentHandle) {
        self.segment_mut(handle).free();
        self.scheduler.schedule(handle);
    }

    pub fn is_segment_synced(&self, handle: SegmentHandle) -> bool {
        self.segment(handle).is_synced()
    }

    /// Every segment's enqueued data is durable and no frees are pending.
    pub fn is_synced(&self) -> bool {
        self.order
            .iter()
            .all(|&id| self.segment(id).is_synced())
    }

    /// Make progress on replication and replica freeing without blocking:
    /// one scheduler pass.
    pub fn proceed(&mut self) {
        let metrics = self.metrics.clone();
        let _timer = TickTimer::new(&metrics.replica_manager_ticks);
        self.run_pass();
    }

    /// Spin cooperatively until everything enqueued is durable on the
    /// proper number of backups and no scheduled work remains (including
    /// outstanding frees).
    ///
    /// Intended for the log's critical path; it does not yield the CPU.
    /// Host failures can of course still eliminate replicas immediately
    /// after it returns.
    pub fn sync(&mut self) {
        trace!("syncing");
        let metrics = self.metrics.clone();
        let _timer = TickTimer::new(&metrics.replica_manager_ticks);
        while !self.is_synced() || !self.scheduler.is_idle() {
            self.run_pass();
        }
    }

    /// React to a change in cluster membership. One call suffices: every
    /// segment is scheduled and re-checks its replicas against the fresh
    /// cluster view, re-placing any that landed on departed backups.
    pub fn cluster_configuration_changed(&mut self) {
        debug!("cluster configuration changed; revalidating all replicas");
        self.selector.invalidate();
        for &id in &self.order {
            self.scheduler.schedule(id);
        }
    }

    fn segment(&self, handle: SegmentHandle) -> &ReplicatedSegment {
        self.slots
            .get(handle)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("stale segment handle {handle}"))
    }

    fn segment_mut(&mut self, handle: SegmentHandle) -> &mut ReplicatedSegment {
        self.slots
            .get_mut(handle)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("stale segment handle {handle}"))
    }

    /// One pass over the scheduled segments.
    fn run_pass(&mut self) {
        let Self {
            master_id,
            selector,
            transport,
            scheduler,
            slots,
            free_slots,
            order,
            write_rpcs_in_flight,
            metrics,
            ..
        } = self;
        let metrics: &ReplicaMetrics = &**metrics;
        let master = master_id.get();

        let mut destroyed: Vec<TaskId> = Vec::new();
        scheduler.proceed(|id, scheduler| {
            let Some(mut segment) = slots[id].take() else {
                return;
            };
            let preceding_opens_done = match segment.preceding() {
                None => true,
                // A destroyed predecessor issued (and completed) all of
                // its opens long ago.
                Some(p) => slots
                    .get(p)
                    .and_then(Option::as_ref)
                    .map(ReplicatedSegment::all_opens_issued)
                    .unwrap_or(true),
            };
            let mut ctx = TaskContext {
                task_id: id,
                scheduler,
                selector: &mut *selector,
                transport: &mut *transport,
                master_id: master,
                write_rpcs_in_flight: &mut *write_rpcs_in_flight,
                preceding_opens_done,
                metrics,
            };
            if segment.perform_task(&mut ctx) {
                destroyed.push(id);
            } else {
                slots[id] = Some(segment);
            }
        });

        for id in destroyed {
            debug_assert!(!scheduler.is_scheduled(id));
            order.retain(|&live| live != id);
            for segment in slots.iter_mut().flatten() {
                if segment.preceding() == Some(id) {
                    segment.clear_preceding();
                }
            }
            free_slots.push(id);
            metrics.segments_freed.increment();
            metrics.segments_live.decrement();
            debug!("segment slot {id} destroyed and returned to the pool");
        }
    }
}

impl<C: CoordinatorClient, B: BackupClient> Drop for ReplicaManager<C, B> {
    /// Drain all queued work, then release every remaining segment.
    ///
    /// Replicas that were never freed stay behind on the backups; the
    /// coordinator's normal lifecycle garbage-collects them.
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.sync();
        // sync is not enough: frees queued but unacknowledged keep the
        // scheduler busy.
        while !self.scheduler.is_idle() {
            self.run_pass();
        }
        self.order.clear();
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::backup::testing::{MockCoordinator, MockTransport, Observed};
    use crate::backup::ServerId;

    const MASTER: ServerId = ServerId(99);

    type TestManager =
        ReplicaManager<Rc<RefCell<MockCoordinator>>, Rc<RefCell<MockTransport>>>;

    fn make_manager(
        backups: u64,
        num_replicas: u32,
    ) -> (
        TestManager,
        Rc<RefCell<MockCoordinator>>,
        Rc<RefCell<MockTransport>>,
        Rc<ReplicaMetrics>,
    ) {
        let coordinator = Rc::new(RefCell::new(MockCoordinator::with_backups(backups)));
        let transport = Rc::new(RefCell::new(MockTransport::new()));
        let metrics = Rc::new(ReplicaMetrics::new());
        let manager = ReplicaManager::new(
            num_replicas,
            coordinator.clone(),
            MasterIdCell::with_id(MASTER),
            transport.clone(),
            metrics.clone(),
        );
        (manager, coordinator, transport, metrics)
    }

    #[test]
    fn test_open_write_sync_reaches_all_backups() {
        let buf = vec![0xabu8; 256];
        let (mut manager, _coordinator, transport, _metrics) = make_manager(3, 2);

        let handle = unsafe { manager.open_segment(42, buf.as_ptr(), 128) };
        manager.write(handle, 256);
        manager.sync();

        assert!(manager.is_synced());
        assert!(manager.is_segment_synced(handle));

        let transport = transport.borrow();
        let backups = transport.opens_for(42);
        assert_eq!(backups.len(), 2);
        for backup in backups {
            let stored = transport.replica(backup, 42).unwrap();
            assert_eq!(stored.bytes, &buf[..]);

            // OPEN(128) strictly before WRITE(128..256) for this backup.
            let ops: Vec<Observed> = transport
                .observed
                .iter()
                .filter(|op| matches!(op,
                    Observed::Open { backup: b, .. } | Observed::Write { backup: b, .. }
                        if *b == backup))
                .cloned()
                .collect();
            assert_eq!(
                ops,
                vec![
                    Observed::Open {
                        backup,
                        segment_id: 42,
                        len: 128
                    },
                    Observed::Write {
                        backup,
                        segment_id: 42,
                        offset: 128,
                        len: 128
                    },
                ]
            );
        }
    }

    #[test]
    fn test_open_ordering_between_successive_segments() {
        let buf1 = vec![1u8; 64];
        let buf2 = vec![2u8; 64];
        // Keep RPCs pending across passes so the segments overlap.
        let (mut manager, _coordinator, transport, _metrics) = make_manager(4, 3);
        transport.borrow_mut().delay = 2;

        let _h1 = unsafe { manager.open_segment(1, buf1.as_ptr(), 64) };
        let _h2 = unsafe { manager.open_segment(2, buf2.as_ptr(), 64) };
        manager.sync();

        let transport = transport.borrow();
        let opens: Vec<u64> = transport
            .observed
            .iter()
            .filter_map(|op| match op {
                Observed::Open { segment_id, .. } => Some(*segment_id),
                _ => None,
            })
            .collect();
        assert_eq!(opens.len(), 6);
        let last_first = opens.iter().rposition(|&id| id == 1).unwrap();
        let first_second = opens.iter().position(|&id| id == 2).unwrap();
        assert!(
            last_first < first_second,
            "segment 2 opened before segment 1 finished opening: {opens:?}"
        );
    }

    #[test]
    fn test_backup_failure_recovers_and_syncs() {
        let buf = vec![7u8; 512];
        let (mut manager, _coordinator, transport, metrics) = make_manager(3, 2);

        let handle = unsafe { manager.open_segment(8, buf.as_ptr(), 128) };
        manager.sync();

        let victim = transport.borrow().opens_for(8)[0];
        transport.borrow_mut().crash_backup(victim);

        manager.write(handle, 512);
        manager.sync();

        assert!(metrics.backup_failures.value() >= 1);
        let transport = transport.borrow();
        let survivors: Vec<ServerId> = transport
            .replicas
            .keys()
            .filter(|(_, seg)| *seg == 8)
            .map(|(backup, _)| *backup)
            .collect();
        assert_eq!(survivors.len(), 2);
        for backup in survivors {
            assert_ne!(backup, victim);
            assert_eq!(transport.replica(backup, 8).unwrap().bytes, &buf[..]);
        }
    }

    #[test]
    fn test_cluster_configuration_change_replaces_replicas() {
        let buf = vec![4u8; 32];
        let (mut manager, coordinator, transport, _metrics) = make_manager(3, 2);

        let handle = unsafe { manager.open_segment(5, buf.as_ptr(), 32) };
        manager.sync();

        let victim = transport.borrow().opens_for(5)[0];
        coordinator.borrow_mut().remove(victim);
        manager.cluster_configuration_changed();
        manager.sync();

        assert!(manager.is_segment_synced(handle));
        let transport = transport.borrow();
        let hosting: Vec<ServerId> = transport
            .opens_for(5)
            .into_iter()
            .filter(|&b| b != victim)
            .collect();
        assert_eq!(hosting.len(), 2);
    }

    #[test]
    fn test_free_destroys_handle_and_reuses_slot() {
        let buf = vec![1u8; 16];
        let (mut manager, _coordinator, transport, metrics) = make_manager(3, 2);

        let first = unsafe { manager.open_segment(1, buf.as_ptr(), 16) };
        manager.close(first);
        manager.sync();

        manager.free(first);
        manager.sync();
        while !manager.scheduler.is_idle() {
            manager.proceed();
        }

        assert_eq!(metrics.segments_freed.value(), 1);
        assert_eq!(metrics.segments_live.value(), 0);
        for replica in transport.borrow().replicas.values() {
            assert!(replica.freed);
        }

        // The pool slot is reusable: the next segment gets the same
        // handle back.
        let second = unsafe { manager.open_segment(2, buf.as_ptr(), 16) };
        assert_eq!(second, first);
        manager.sync();
    }

    #[test]
    #[should_panic(expected = "stale segment handle")]
    fn test_stale_handle_is_fatal() {
        let buf = vec![1u8; 16];
        let (mut manager, _coordinator, _transport, _metrics) = make_manager(3, 1);

        let handle = unsafe { manager.open_segment(1, buf.as_ptr(), 16) };
        manager.free(handle);
        manager.sync();
        while !manager.scheduler.is_idle() {
            manager.proceed();
        }
        manager.write(handle, 32);
    }

    #[test]
    fn test_sync_implies_durable_and_idle() {
        let buf = vec![2u8; 64];
        let (mut manager, _coordinator, _transport, _metrics) = make_manager(3, 3);

        let handle = unsafe { manager.open_segment(3, buf.as_ptr(), 8) };
        manager.write(handle, 64);
        manager.close(handle);
        manager.sync();

        assert!(manager.is_synced());
        assert!(manager.scheduler.is_idle());
        assert_eq!(manager.metrics().write_rpcs_in_flight.value(), 0);
    }

    #[test]
    fn test_drop_drains_queued_work() {
        let buf = vec![6u8; 128];
        let (mut manager, _coordinator, transport, _metrics) = make_manager(3, 2);

        let handle = unsafe { manager.open_segment(11, buf.as_ptr(), 64) };
        manager.write(handle, 128);
        drop(manager);

        // Destruction synced the enqueued bytes but left the unfreed
        // replicas behind on the backups.
        let transport = transport.borrow();
        for ((_, segment_id), replica) in transport.replicas.iter() {
            assert_eq!(*segment_id, 11);
            assert_eq!(replica.bytes, &buf[..]);
            assert!(!replica.freed);
        }
        assert_eq!(transport.replicas.len(), 2);
    }

    #[test]
    fn test_open_waits_for_master_enlistment() {
        let buf = vec![9u8; 16];
        let coordinator = Rc::new(RefCell::new(MockCoordinator::with_backups(2)));
        let transport = Rc::new(RefCell::new(MockTransport::new()));
        let master_id = MasterIdCell::new();
        let mut manager = ReplicaManager::new(
            1,
            coordinator,
            master_id.clone(),
            transport.clone(),
            Rc::new(ReplicaMetrics::new()),
        );

        let handle = unsafe { manager.open_segment(1, buf.as_ptr(), 16) };
        manager.proceed();
        manager.proceed();
        assert!(transport.borrow().observed.is_empty());

        // Once the master enlists, replication starts.
        master_id.set(MASTER);
        manager.sync();
        assert!(manager.is_segment_synced(handle));
        assert_eq!(transport.borrow().opens_for(1).len(), 1);
    }
}
