//! Backup placement
//!
//! Chooses which backup hosts each replica of a segment. Placement rules:
//! never the master itself, never a backup already holding a replica of
//! the same segment, and a failure domain distinct from the previously
//! chosen backups whenever the cluster offers one. When nothing qualifies
//! the selector reports "try again later" instead of failing; replication
//! simply stays scheduled until the cluster can satisfy the request.

use log::debug;

use crate::backup::{BackupDescriptor, CoordinatorClient, ServerId};

pub struct BackupSelector<C: CoordinatorClient> {
    coordinator: C,
    /// Cached cluster view; populated on first use, refreshed only after
    /// `invalidate`.
    backups: Vec<BackupDescriptor>,
    populated: bool,
    /// Rotates the starting probe position so placement spreads across
    /// the cluster instead of piling onto the first listed backup.
    next: usize,
}

impl<C: CoordinatorClient> BackupSelector<C> {
    pub fn new(coordinator: C) -> Self {
        Self {
            coordinator,
            backups: Vec::new(),
            populated: false,
            next: 0,
        }
    }

    /// Drop the cached cluster view; the next query re-enumerates.
    pub fn invalidate(&mut self) {
        self.populated = false;
    }

    fn populate(&mut self) {
        if !self.populated {
            self.backups = self.coordinator.enumerate_backups();
            self.populated = true;
            debug!("backup selector sees {} backups", self.backups.len());
        }
    }

    /// Whether `id` is still in the cluster view. Replicas on a backup
    /// that disappears from the view must be re-placed.
    pub fn is_listed(&mut self, id: ServerId) -> bool {
        self.populate();
        self.backups.iter().any(|b| b.server_id == id)
    }

    /// Choose a backup for one more replica of a segment.
    ///
    /// `master` is the replicating master (never a valid host for its own
    /// replicas) and `chosen` names the backups already holding replicas
    /// of this segment. Returns `None` when no acceptable backup exists
    /// right now.
    pub fn select(&mut self, master: ServerId, chosen: &[ServerId]) -> Option<ServerId> {
        self.populate();
        if self.backups.is_empty() {
            return None;
        }

        let conflict = |b: &BackupDescriptor| {
            b.server_id == master || chosen.contains(&b.server_id)
        };
        let chosen_domains: Vec<u64> = self
            .backups
            .iter()
            .filter(|b| chosen.contains(&b.server_id))
            .map(|b| b.failure_domain)
            .collect();

        let len = self.backups.len();
        let start = self.next % len;
        self.next = self.next.wrapping_add(1);

        // First pass insists on a fresh failure domain; the fallback pass
        // accepts any non-conflicting backup.
        for fresh_domain_only in [true, false] {
            for probe in 0..len {
                let candidate = &self.backups[(start + probe) % len];
                if conflict(candidate) {
                    continue;
                }
                if fresh_domain_only && chosen_domains.contains(&candidate.failure_domain) {
                    continue;
                }
                debug!(
                    "selected backup {} (domain {}) for replica {} of a segment",
                    candidate.server_id,
                    candidate.failure_domain,
                    chosen.len()
                );
                return Some(candidate.server_id);
            }
        }
        None
    }
}
