//! External interfaces of the durability core
//!
//! The log storage engine, the coordinator, and the RPC transport are
//! collaborators owned elsewhere; only their surfaces live here. The
//! transport is strictly non-blocking: every RPC returns a pollable id and
//! the replica state machine absorbs failures itself.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Cluster-unique server identifier, assigned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Late-populated holder for the master's own ServerId.
///
/// The replica manager is constructed before the master enlists with the
/// coordinator, so the id it reads has to be settable afterwards. Clones
/// share the same cell.
#[derive(Clone, Default)]
pub struct MasterIdCell(Rc<Cell<Option<ServerId>>>);

impl MasterIdCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: ServerId) -> Self {
        let cell = Self::new();
        cell.set(id);
        cell
    }

    pub fn set(&self, id: ServerId) {
        self.0.set(Some(id));
    }

    pub fn get(&self) -> Option<ServerId> {
        self.0.get()
    }
}

/// One backup as published by the coordinator.
#[derive(Debug, Clone)]
pub struct BackupDescriptor {
    pub server_id: ServerId,
    /// Service locator used by the transport to reach the backup.
    pub locator: String,
    /// Placement group; replicas of one segment should spread across
    /// distinct domains when the cluster allows it.
    pub failure_domain: u64,
}

/// Client for the cluster coordinator.
///
/// `enumerate_backups` may block briefly on first use while the server
/// list is fetched; afterwards implementations are expected to answer from
/// a local copy. Change notifications arrive out of band and surface as
/// `ReplicaManager::cluster_configuration_changed` calls.
pub trait CoordinatorClient {
    fn enumerate_backups(&mut self) -> Vec<BackupDescriptor>;
}

/// Identifier for an in-flight backup RPC.
pub type RpcId = u64;

/// Outcome of polling an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Pending,
    /// The backup acknowledged; `durable_bytes` is its new durable length
    /// for the segment (zero for close and free acknowledgements).
    Done { durable_bytes: u32 },
    /// Worth retrying against the same backup.
    TransientError,
    /// The backup cannot serve this replica; pick a new one.
    PermanentError,
}

/// Non-blocking RPC surface to backup servers.
///
/// All four calls address a `(backup, master, segment_id)` tuple and
/// return immediately with a pollable id. Timeouts are the transport's
/// business; a timed-out RPC simply polls as an error.
pub trait BackupClient {
    /// Atomically open the replica with its first `data.len()` bytes.
    fn open(&mut self, backup: ServerId, master: ServerId, segment_id: u64, data: &[u8]) -> RpcId;

    /// Append `data` at `offset`. Offsets for one replica are issued in
    /// strictly increasing order.
    fn write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        offset: u32,
        data: &[u8],
    ) -> RpcId;

    /// Seal the replica; no further writes will follow.
    fn close(&mut self, backup: ServerId, master: ServerId, segment_id: u64) -> RpcId;

    /// Discard the replica.
    fn free(&mut self, backup: ServerId, master: ServerId, segment_id: u64) -> RpcId;

    /// Poll an outstanding RPC. Once a non-`Pending` status is returned
    /// the id is dead and must not be polled again.
    fn poll(&mut self, rpc: RpcId) -> RpcStatus;
}

impl<C: CoordinatorClient> CoordinatorClient for Rc<std::cell::RefCell<C>> {
    fn enumerate_backups(&mut self) -> Vec<BackupDescriptor> {
        self.borrow_mut().enumerate_backups()
    }
}

impl<B: BackupClient> BackupClient for Rc<std::cell::RefCell<B>> {
    fn open(&mut self, backup: ServerId, master: ServerId, segment_id: u64, data: &[u8]) -> RpcId {
        self.borrow_mut().open(backup, master, segment_id, data)
    }

    fn write(
        &mut self,
        backup: ServerId,
        master: ServerId,
        segment_id: u64,
        offset: u32,
        data: &[u8],
    ) -> RpcId {
        self.borrow_mut().write(backup, master, segment_id, offset, data)
    }

    fn close(&mut self, backup: ServerId, master: ServerId, segment_id: u64) -> RpcId {
        self.borrow_mut().close(backup, master, segment_id)
    }

    fn free(&mut self, backup: ServerId, master: ServerId, segment_id: u64) -> RpcId {
        self.borrow_mut().free(backup, master, segment_id)
    }

    fn poll(&mut self, rpc: RpcId) -> RpcStatus {
        self.borrow_mut().poll(rpc)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_master_id_cell_shared() {
        let cell = MasterIdCell::new();
        let clone = cell.clone();
        assert_eq!(clone.get(), None);
        cell.set(ServerId(9));
        assert_eq!(clone.get(), Some(ServerId(9)));
    }

    #[test]
    fn test_mock_transport_open_write_close() {
        let mut transport = MockTransport::new();
        let backup = ServerId(1);
        let master = ServerId(99);

        let rpc = transport.open(backup, master, 5, b"head");
        assert_eq!(transport.poll(rpc), RpcStatus::Done { durable_bytes: 4 });

        let rpc = transport.write(backup, master, 5, 4, b"more");
        assert_eq!(transport.poll(rpc), RpcStatus::Done { durable_bytes: 8 });

        let rpc = transport.close(backup, master, 5);
        assert_eq!(transport.poll(rpc), RpcStatus::Done { durable_bytes: 0 });

        let stored = transport.replica(backup, 5).unwrap();
        assert_eq!(stored.bytes, b"headmore");
        assert!(stored.closed);
    }

    #[test]
    fn test_mock_transport_down_backup() {
        let mut transport = MockTransport::new();
        let backup = ServerId(1);
        transport.crash_backup(backup);

        let rpc = transport.open(backup, ServerId(99), 5, b"head");
        assert_eq!(transport.poll(rpc), RpcStatus::PermanentError);
        assert!(transport.replica(backup, 5).is_none());
    }

    #[test]
    fn test_mock_transport_delay() {
        let mut transport = MockTransport::new();
        transport.delay = 2;
        let rpc = transport.open(ServerId(1), ServerId(99), 5, b"x");
        assert_eq!(transport.poll(rpc), RpcStatus::Pending);
        assert_eq!(transport.poll(rpc), RpcStatus::Pending);
        assert_eq!(transport.poll(rpc), RpcStatus::Done { durable_bytes: 1 });
    }
}
