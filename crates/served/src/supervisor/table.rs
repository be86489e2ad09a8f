//! The process table: live workers plus the poll set that watches them.
//!
//! Two parallel sequences are kept in lockstep. `slots[0]` is always the
//! listener and `slots[i + 1]` watches the diagnostic pipe of `workers[i]`.
//! Removal swaps the last entry into the hole in both sequences at once, so
//! the correspondence survives without any index bookkeeping.

use std::collections::TryReserveError;
use std::mem;
use std::os::fd::RawFd;

use tracing::debug;

use super::worker::WorkerProcess;

/// Errors that can occur while making room for another worker.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Process table cannot grow beyond {capacity} entries")]
    CapacityExhausted { capacity: usize },

    #[error("Cannot allocate memory for process table: {0}")]
    OutOfMemory(#[from] TryReserveError),
}

/// Next capacity after `current`, doubling and saturating at `limit`.
///
/// Returns `None` once `current` has reached `limit`.
pub fn grown_capacity(current: usize, limit: usize) -> Option<usize> {
    if current >= limit {
        return None;
    }
    if current == 0 {
        return Some(1);
    }
    Some(current.saturating_mul(2).min(limit))
}

/// Largest worker count whose two sequences stay addressable.
fn max_entries() -> usize {
    let by_workers = isize::MAX as usize / mem::size_of::<WorkerProcess>().max(1);
    let by_slots = (isize::MAX as usize / mem::size_of::<libc::pollfd>()).saturating_sub(1);
    by_workers.min(by_slots)
}

fn slot(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

#[derive(Debug)]
pub struct ProcessTable {
    workers: Vec<WorkerProcess>,
    slots: Vec<libc::pollfd>,
    /// Logical capacity; grows geometrically
    capacity: usize,
    /// Hard ceiling on `capacity`
    limit: usize,
}

impl ProcessTable {
    /// Creates an empty table whose poll set watches `listener`.
    pub fn new(listener: RawFd) -> Self {
        Self::with_limit(listener, max_entries())
    }

    pub(crate) fn with_limit(listener: RawFd, limit: usize) -> Self {
        Self {
            workers: Vec::new(),
            slots: vec![slot(listener)],
            capacity: 0,
            limit: limit.min(max_entries()),
        }
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes sure one more worker can be pushed without allocating.
    ///
    /// Called before a spawn so a failure here never leaves an untracked
    /// child behind.
    pub fn reserve_one(&mut self) -> Result<(), TableError> {
        if self.workers.len() < self.capacity {
            return Ok(());
        }
        let next = grown_capacity(self.capacity, self.limit).ok_or(
            TableError::CapacityExhausted {
                capacity: self.capacity,
            },
        )?;

        self.workers.try_reserve_exact(next - self.workers.len())?;
        self.slots.try_reserve_exact(next + 1 - self.slots.len())?;
        debug!(from = self.capacity, to = next, "Grew process table");
        self.capacity = next;
        Ok(())
    }

    /// Appends a worker and a poll slot for its diagnostic pipe.
    ///
    /// Must follow a successful [`ProcessTable::reserve_one`].
    pub fn push(&mut self, worker: WorkerProcess) {
        debug_assert!(self.workers.len() < self.capacity);
        self.slots.push(slot(worker.diagnostic_fd()));
        self.workers.push(worker);
    }

    /// Removes the worker at `index`, moving the last worker into its place.
    pub fn remove(&mut self, index: usize) -> Option<WorkerProcess> {
        if index >= self.workers.len() {
            return None;
        }
        self.slots.swap_remove(index + 1);
        Some(self.workers.swap_remove(index))
    }

    pub fn worker(&self, index: usize) -> Option<&WorkerProcess> {
        self.workers.get(index)
    }

    pub fn worker_mut(&mut self, index: usize) -> Option<&mut WorkerProcess> {
        self.workers.get_mut(index)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().map(WorkerProcess::pid).collect()
    }

    /// Stops polling a worker's pipe. A negative descriptor is ignored by
    /// `poll(2)`; complementing keeps the descriptor recoverable.
    pub fn mute(&mut self, index: usize) {
        let Some(worker) = self.workers.get_mut(index) else {
            return;
        };
        worker.set_muted();
        let entry = &mut self.slots[index + 1];
        if entry.fd >= 0 {
            entry.fd = !entry.fd;
        }
    }

    /// Whether any worker's pipe is currently left out of the poll set.
    pub fn any_muted(&self) -> bool {
        self.workers.iter().any(WorkerProcess::is_muted)
    }

    /// Returns the poll set with stale `revents` cleared.
    ///
    /// Without the listener the returned slice starts at the first worker.
    pub fn poll_slots(&mut self, include_listener: bool) -> &mut [libc::pollfd] {
        for entry in &mut self.slots {
            entry.revents = 0;
        }
        if include_listener {
            &mut self.slots
        } else {
            &mut self.slots[1..]
        }
    }

    pub fn listener_ready(&self) -> bool {
        self.slots[0].revents & libc::POLLIN != 0
    }

    /// Events reported for the worker at `index` by the last poll.
    pub fn revents(&self, index: usize) -> libc::c_short {
        self.slots.get(index + 1).map_or(0, |entry| entry.revents)
    }

    /// Checks that both sequences still describe the same workers.
    pub fn is_consistent(&self) -> bool {
        self.slots.len() == self.workers.len() + 1
            && self.workers.len() <= self.capacity
            && self.capacity <= self.limit
            && self.workers.iter().zip(&self.slots[1..]).all(|(worker, entry)| {
                let fd = if entry.fd < 0 { !entry.fd } else { entry.fd };
                fd == worker.diagnostic_fd() && (entry.fd < 0) == worker.is_muted()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::process::{Command, Stdio};

    use crate::nbio;

    fn spawn_worker() -> WorkerProcess {
        let (read, write) = nbio::nonblocking_pipe().unwrap();
        let child = Command::new("sh")
            .arg("-c")
            .arg("exit 0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(write)
            .spawn()
            .unwrap();
        WorkerProcess::new(child, read)
    }

    fn reap_all(table: &mut ProcessTable) {
        while let Some(mut worker) = table.remove(0) {
            while worker.try_reap().unwrap().is_none() {
                std::thread::yield_now();
            }
        }
    }

    #[test]
    fn test_grown_capacity() {
        assert_eq!(grown_capacity(0, 100), Some(1));
        assert_eq!(grown_capacity(1, 100), Some(2));
        assert_eq!(grown_capacity(2, 100), Some(4));
        assert_eq!(grown_capacity(64, 100), Some(100));
        assert_eq!(grown_capacity(100, 100), None);
        assert_eq!(grown_capacity(usize::MAX - 1, usize::MAX), Some(usize::MAX));
    }

    #[test]
    fn test_reserve_saturates_at_limit() {
        let mut table = ProcessTable::with_limit(-1, 5);
        let mut seen = Vec::new();
        for _ in 0..5 {
            table.reserve_one().unwrap();
            seen.push(table.capacity());
            table.push(spawn_worker());
        }
        assert_eq!(seen, [1, 2, 4, 4, 5]);
        assert!(matches!(
            table.reserve_one(),
            Err(TableError::CapacityExhausted { capacity: 5 })
        ));
        assert!(table.is_consistent());
        reap_all(&mut table);
    }

    #[test]
    fn test_remove_keeps_sequences_aligned() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut table = ProcessTable::new(listener.as_raw_fd());
        for _ in 0..4 {
            table.reserve_one().unwrap();
            table.push(spawn_worker());
        }
        let pids = table.pids();

        let removed = table.remove(1).unwrap();
        assert_eq!(removed.pid(), pids[1]);
        assert_eq!(table.pids(), [pids[0], pids[3], pids[2]]);
        assert!(table.is_consistent());

        assert!(table.remove(3).is_none());
        assert!(table.is_consistent());

        drop(removed);
        reap_all(&mut table);
        assert!(table.is_empty());
        assert!(table.is_consistent());
    }

    #[test]
    fn test_mute_hides_slot_from_poll() {
        let mut table = ProcessTable::with_limit(-1, 4);
        table.reserve_one().unwrap();
        table.push(spawn_worker());
        let fd = table.worker(0).unwrap().diagnostic_fd();

        assert!(!table.any_muted());
        table.mute(0);
        table.mute(0);
        assert!(table.any_muted());
        assert_eq!(table.poll_slots(false)[0].fd, !fd);
        assert!(table.is_consistent());
        reap_all(&mut table);
    }

    #[test]
    fn test_poll_slots_clears_revents() {
        let mut table = ProcessTable::with_limit(-1, 4);
        table.poll_slots(true)[0].revents = libc::POLLIN;
        assert!(table.listener_ready());
        assert_eq!(table.poll_slots(true).len(), 1);
        assert!(!table.listener_ready());
        assert!(table.poll_slots(false).is_empty());
        assert_eq!(table.revents(7), 0);
    }
}
