//! Upward propagation of container modification times.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::traits::{ContainerChange, ContainerMdChangeListener, ContainerMdEvent, ContainerMdSvc};
use crate::types::{ContainerId, MAX_TREE_DEPTH, SYNC_TIME_ATTR, Timespec};

/// Container ids waiting for propagation, each at most once, in arrival
/// order.
#[derive(Debug, Default)]
struct Batch {
    order: Vec<ContainerId>,
    seen: HashSet<ContainerId>,
}

impl Batch {
    fn insert(&mut self, id: ContainerId) {
        if self.seen.insert(id) {
            self.order.push(id);
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn take(&mut self) -> Vec<ContainerId> {
        self.seen.clear();
        std::mem::take(&mut self.order)
    }
}

#[derive(Debug, Default)]
struct Queue {
    filling: Batch,
    in_flight: bool,
    shutdown: bool,
}

struct Shared {
    containers: Weak<dyn ContainerMdSvc>,
    queue: Mutex<Queue>,
    wake: Condvar,
    idle: Condvar,
    interval: Duration,
}

impl Shared {
    /// Walk from `start` towards the root raising `tmtime`.
    ///
    /// The first container always takes its own mtime. The walk moves on to
    /// the parent only while the current container carries
    /// [`SYNC_TIME_ATTR`], and stops at the first ancestor that already has
    /// an equal or newer `tmtime`.
    fn propagate(&self, start: ContainerId) {
        let Some(containers) = self.containers.upgrade() else {
            return;
        };
        let mut id = start;
        let mut stamp: Option<Timespec> = None;

        for hop in 0..MAX_TREE_DEPTH {
            let container = match containers.get_container_md(id) {
                Ok(container) => container,
                Err(e) if e.is_not_found() => {
                    debug!(start, id, "mtime propagation target vanished");
                    return;
                }
                Err(e) => {
                    error!(start, id, error = %e, "mtime propagation failed");
                    return;
                }
            };
            let (accepted, parent_id, onward) = {
                let mut guard = container.write();
                let mtime = *stamp.get_or_insert(guard.mtime());
                let accepted = guard.set_tmtime(mtime);
                let onward = !guard.is_root() && guard.has_attribute(SYNC_TIME_ATTR);
                (accepted, guard.parent_id(), onward)
            };
            if accepted {
                if let Err(e) = containers.update_store(&container) {
                    error!(id, error = %e, "cannot persist tmtime");
                }
            } else if hop > 0 {
                return;
            }
            if !onward {
                return;
            }
            id = parent_id;
        }
        warn!(start, "mtime propagation hit the depth cap");
    }

    fn run(self: Arc<Self>) {
        debug!("mtime propagation worker started");
        loop {
            let batch = {
                let mut queue = self.queue.lock();
                while queue.filling.is_empty() && !queue.shutdown {
                    self.wake.wait(&mut queue);
                }
                if queue.filling.is_empty() {
                    break;
                }
                queue.in_flight = true;
                queue.filling.take()
            };

            for id in batch {
                self.propagate(id);
            }

            let mut queue = self.queue.lock();
            queue.in_flight = false;
            self.idle.notify_all();

            // Let the next batch accumulate.
            let deadline = Instant::now() + self.interval;
            while !queue.shutdown {
                if self.wake.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
        }
        debug!("mtime propagation worker stopped");
    }
}

/// Propagates `tmtime` up the tree on `MTimeChange` events.
///
/// Built with [`new`](Self::new) the walk runs on the thread publishing the
/// event. Built with [`with_worker`](Self::with_worker) events only record the
/// container id in a batch; a background thread swaps the batch out every
/// `interval` and walks each distinct id once. [`flush`](Self::flush) forces
/// a round trip for callers that must observe propagated values.
///
/// The accounting holds a weak handle to the container service, which in turn
/// owns the accounting as a listener.
pub struct SyncTimeAccounting {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SyncTimeAccounting {
    /// Propagate synchronously on the publishing thread.
    pub fn new(containers: &Arc<dyn ContainerMdSvc>) -> Self {
        Self {
            shared: Self::shared(containers, Duration::ZERO),
            worker: None,
        }
    }

    /// Propagate on a background thread, one batch per `interval`.
    pub fn with_worker(containers: &Arc<dyn ContainerMdSvc>, interval: Duration) -> Self {
        let shared = Self::shared(containers, interval);
        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("mtime-propagation".into())
                .spawn(move || shared.run())
        };
        match worker {
            Ok(handle) => Self {
                shared,
                worker: Some(handle),
            },
            Err(e) => {
                warn!(error = %e, "cannot start propagation worker, propagating synchronously");
                Self {
                    shared,
                    worker: None,
                }
            }
        }
    }

    fn shared(containers: &Arc<dyn ContainerMdSvc>, interval: Duration) -> Arc<Shared> {
        Arc::new(Shared {
            containers: Arc::downgrade(containers),
            queue: Mutex::new(Queue::default()),
            wake: Condvar::new(),
            idle: Condvar::new(),
            interval,
        })
    }

    /// Returns `true` when a background worker applies the updates.
    pub fn is_async(&self) -> bool {
        self.worker.is_some()
    }

    /// Number of container ids waiting in the filling batch.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().filling.order.len()
    }

    /// Apply every queued update before returning.
    ///
    /// Waits for the batch the worker is draining, then drains the filling
    /// batch on the calling thread.
    pub fn flush(&self) {
        if self.worker.is_none() {
            return;
        }
        let batch = {
            let mut queue = self.shared.queue.lock();
            while queue.in_flight {
                self.shared.idle.wait(&mut queue);
            }
            queue.filling.take()
        };
        for id in batch {
            self.shared.propagate(id);
        }
    }
}

impl ContainerMdChangeListener for SyncTimeAccounting {
    fn container_md_changed(&self, event: &ContainerMdEvent) {
        if event.change != ContainerChange::MTimeChange {
            return;
        }
        if self.worker.is_none() {
            self.shared.propagate(event.container_id);
            return;
        }
        self.shared.queue.lock().filling.insert(event.container_id);
        self.shared.wake.notify_one();
    }
}

impl Drop for SyncTimeAccounting {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared.queue.lock().shutdown = true;
        self.shared.wake.notify_all();
        if worker.join().is_err() {
            error!("mtime propagation worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::ContainerMdPtr;
    use crate::svc::InMemoryContainerMdSvc;

    /// root(1) <- a(2) <- b(3), with propagation enabled on `b` and `a`.
    fn tree() -> (Arc<dyn ContainerMdSvc>, Vec<ContainerMdPtr>) {
        let svc = InMemoryContainerMdSvc::new();
        svc.initialize().unwrap();
        let svc: Arc<dyn ContainerMdSvc> = Arc::new(svc);
        let mut nodes = Vec::new();
        for parent in [1, 1, 2] {
            let node = svc.create_container().unwrap();
            {
                let mut guard = node.write();
                guard.set_parent_id(parent);
                if guard.id() != 1 {
                    guard.set_attribute(SYNC_TIME_ATTR, "1").unwrap();
                }
            }
            nodes.push(node);
        }
        (svc, nodes)
    }

    fn touch(node: &ContainerMdPtr, sec: u64) -> ContainerMdEvent {
        let mut guard = node.write();
        guard.set_mtime(Timespec::new(sec, 0));
        ContainerMdEvent::new(guard.id(), guard.parent_id(), ContainerChange::MTimeChange)
    }

    #[test]
    fn synchronous_walk_reaches_root() {
        let (svc, nodes) = tree();
        let accounting = SyncTimeAccounting::new(&svc);
        accounting.container_md_changed(&touch(&nodes[2], 50));
        for node in &nodes {
            assert_eq!(node.read().tmtime(), Timespec::new(50, 0));
        }
    }

    #[test]
    fn walk_stops_below_container_without_attribute() {
        let (svc, nodes) = tree();
        nodes[1].write().remove_attribute(SYNC_TIME_ATTR).unwrap();
        let accounting = SyncTimeAccounting::new(&svc);
        accounting.container_md_changed(&touch(&nodes[2], 50));
        assert_eq!(nodes[2].read().tmtime(), Timespec::new(50, 0));
        assert_eq!(nodes[1].read().tmtime(), Timespec::new(50, 0));
        assert_eq!(nodes[0].read().tmtime(), Timespec::default());
    }

    #[test]
    fn older_stamp_never_lowers_tmtime() {
        let (svc, nodes) = tree();
        let accounting = SyncTimeAccounting::new(&svc);
        accounting.container_md_changed(&touch(&nodes[2], 50));
        accounting.container_md_changed(&touch(&nodes[1], 40));
        assert_eq!(nodes[1].read().tmtime(), Timespec::new(50, 0));
        assert_eq!(nodes[0].read().tmtime(), Timespec::new(50, 0));
    }

    #[test]
    fn other_changes_are_ignored() {
        let (svc, nodes) = tree();
        let accounting = SyncTimeAccounting::new(&svc);
        nodes[2].write().set_mtime(Timespec::new(9, 0));
        accounting.container_md_changed(&ContainerMdEvent::new(3, 2, ContainerChange::Updated));
        assert_eq!(nodes[2].read().tmtime(), Timespec::default());
    }

    #[test]
    fn worker_collapses_and_flush_applies() {
        let (svc, nodes) = tree();
        let accounting = SyncTimeAccounting::with_worker(&svc, Duration::from_secs(3600));
        assert!(accounting.is_async());

        accounting.container_md_changed(&touch(&nodes[2], 70));
        accounting.container_md_changed(&touch(&nodes[2], 80));
        accounting.flush();

        for node in &nodes {
            assert_eq!(node.read().tmtime(), Timespec::new(80, 0));
        }
        assert_eq!(accounting.pending(), 0);
    }

    #[test]
    fn batch_keeps_first_arrival_order() {
        let mut batch = Batch::default();
        for id in [3, 1, 3, 2, 1] {
            batch.insert(id);
        }
        assert_eq!(batch.take(), vec![3, 1, 2]);
        assert!(batch.is_empty());
        batch.insert(3);
        assert_eq!(batch.take(), vec![3]);
    }

    #[test]
    fn dropping_worker_joins() {
        let (svc, nodes) = tree();
        let accounting = SyncTimeAccounting::with_worker(&svc, Duration::from_millis(1));
        accounting.container_md_changed(&touch(&nodes[2], 5));
        drop(accounting);
        assert_eq!(nodes[2].read().tmtime(), Timespec::new(5, 0));
    }
}
