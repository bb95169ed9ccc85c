//! Suspect-down watchlist.
//!
//! A peer lands here after a failed session while it was last known Up.
//! The watch either gets cancelled by a later successful session
//! (`remove`), or expires and fires the registered callback, which
//! demotes the peer to Down. At most one active watch per node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::types::NodeId;

#[derive(Debug, Error)]
pub enum ProbationError {
    #[error("probation worker already started")]
    AlreadyStarted,
    #[error("probation worker failed to spawn: {0}")]
    Spawn(std::io::Error),
}

pub type ProbationCallback<D> = Arc<dyn Fn(NodeId, D) + Send + Sync>;

struct Watch<D> {
    deadline: Instant,
    data: D,
}

enum Control {
    Wake,
    Stop,
}

pub struct Probation<D> {
    name: String,
    timeout: Duration,
    callback: ProbationCallback<D>,
    watches: Arc<Mutex<BTreeMap<NodeId, Watch<D>>>>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Send + 'static> Probation<D> {
    pub fn new(name: impl Into<String>, timeout: Duration, callback: ProbationCallback<D>) -> Self {
        let (control_tx, control_rx) = channel::unbounded();
        Self {
            name: name.into(),
            timeout,
            callback,
            watches: Arc::new(Mutex::new(BTreeMap::new())),
            control_tx,
            control_rx,
            worker: Mutex::new(None),
        }
    }

    /// Spawn the timer worker. Watches added before `start` are picked
    /// up on the first pass.
    pub fn start(&self) -> Result<(), ProbationError> {
        let mut worker = self.worker.lock().expect("probation lock poisoned");
        if worker.is_some() {
            return Err(ProbationError::AlreadyStarted);
        }

        let watches = Arc::clone(&self.watches);
        let callback = Arc::clone(&self.callback);
        let control_rx = self.control_rx.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("probation-{name}"))
            .spawn(move || run_timer_loop(watches, callback, control_rx))
            .map_err(ProbationError::Spawn)?;
        *worker = Some(handle);
        Ok(())
    }

    /// Put `id` on the watchlist with deadline `now + timeout`. An
    /// existing watch is kept as-is unless `replace` is set.
    pub fn add(&self, id: NodeId, data: D, replace: bool) {
        let deadline = Instant::now() + self.timeout;
        {
            let mut watches = self.watches.lock().expect("probation lock poisoned");
            if !replace && watches.contains_key(&id) {
                return;
            }
            watches.insert(id, Watch { deadline, data });
        }
        let _ = self.control_tx.send(Control::Wake);
    }

    /// Cancel the watch for `id`. The callback is not invoked. Returns
    /// whether a watch existed.
    pub fn remove(&self, id: &NodeId) -> bool {
        let removed = self
            .watches
            .lock()
            .expect("probation lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            let _ = self.control_tx.send(Control::Wake);
        }
        removed
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.watches
            .lock()
            .expect("probation lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.watches.lock().expect("probation lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Halt the timer worker. Pending watches are dropped without
    /// firing.
    pub fn stop(&self) {
        let handle = self.worker.lock().expect("probation lock poisoned").take();
        if let Some(handle) = handle {
            let _ = self.control_tx.send(Control::Stop);
            let _ = handle.join();
        }
    }
}

impl<D> Drop for Probation<D> {
    fn drop(&mut self) {
        let handle = self.worker.lock().expect("probation lock poisoned").take();
        if let Some(handle) = handle {
            let _ = self.control_tx.send(Control::Stop);
            let _ = handle.join();
        }
    }
}

fn run_timer_loop<D: Send + 'static>(
    watches: Arc<Mutex<BTreeMap<NodeId, Watch<D>>>>,
    callback: ProbationCallback<D>,
    control_rx: Receiver<Control>,
) {
    loop {
        let next_deadline = watches
            .lock()
            .expect("probation lock poisoned")
            .values()
            .map(|watch| watch.deadline)
            .min();

        let control = match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                control_rx.recv_timeout(wait)
            }
            None => control_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match control {
            Ok(Control::Wake) => continue,
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        let expired: Vec<(NodeId, D)> = {
            let mut watches = watches.lock().expect("probation lock poisoned");
            let ids: Vec<NodeId> = watches
                .iter()
                .filter(|(_, watch)| watch.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| watches.remove(&id).map(|watch| (id, watch.data)))
                .collect()
        };

        // Callbacks run off-lock so they may re-enter the watchlist.
        for (id, data) in expired {
            tracing::debug!(node = %id, "probation expired");
            callback(id, data);
        }
    }
}
