//! Process-wide pool of argument buffers.
//!
//! Buffers are keyed by their exact length. A single arbiter thread owns the
//! free lists; everyone else talks to it over a channel, so the lists need no
//! lock. If the arbiter is unreachable the pool falls back to plain
//! allocation and checkout/checkin keep working.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::thread;

use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

static GLOBAL: Lazy<ArgumentPool> = Lazy::new(ArgumentPool::new);

/// Fixed-length slots holding the wire text of each argument.
/// `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentBuffer {
    slots: Box<[Option<String>]>,
}

impl ArgumentBuffer {
    fn with_len(len: usize) -> Self {
        Self {
            slots: vec![None; len].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Store the encoded argument for position `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    pub fn set(&mut self, idx: usize, value: Option<String>) {
        self.slots[idx] = value;
    }

    pub fn slots(&self) -> &[Option<String>] {
        &self.slots
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}

/// Counters for one buffer length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers of this length ever created by the pool.
    pub allocated: usize,
    /// Buffers of this length currently on the free list.
    pub idle: usize,
}

enum Request {
    Checkout {
        size: usize,
        reply: oneshot::Sender<ArgumentBuffer>,
    },
    Checkin(ArgumentBuffer),
    Stats {
        size: usize,
        reply: oneshot::Sender<PoolStats>,
    },
}

/// Handle to an argument pool. Cloning is cheap; clones share the arbiter.
#[derive(Clone)]
pub struct ArgumentPool {
    requests: Option<mpsc::UnboundedSender<Request>>,
}

impl ArgumentPool {
    /// Start a pool with its own arbiter thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = thread::Builder::new()
            .name("pqwire-argpool".to_string())
            .spawn(move || Arbiter::default().run(rx));

        match spawned {
            Ok(_) => Self { requests: Some(tx) },
            Err(e) => {
                warn!(error = %e, "argument pool arbiter failed to start; allocating per call");
                Self::unpooled()
            }
        }
    }

    /// The process-wide pool, started on first use.
    pub fn global() -> &'static ArgumentPool {
        &GLOBAL
    }

    /// A pool with no arbiter: every checkout allocates, checkins are dropped.
    pub(crate) fn unpooled() -> Self {
        Self { requests: None }
    }

    /// Take a buffer with exactly `size` empty slots.
    pub async fn checkout(&self, size: usize) -> ArgumentBuffer {
        if let Some(requests) = &self.requests {
            let (reply, rx) = oneshot::channel();
            if requests.send(Request::Checkout { size, reply }).is_ok() {
                if let Ok(buffer) = rx.await {
                    return buffer;
                }
            }
            warn!(size, "argument pool arbiter unreachable; allocating");
        }
        ArgumentBuffer::with_len(size)
    }

    /// Return a buffer. Its slots are cleared before it is reused.
    pub fn checkin(&self, mut buffer: ArgumentBuffer) {
        buffer.clear();
        if let Some(requests) = &self.requests {
            if requests.send(Request::Checkin(buffer)).is_err() {
                warn!("argument pool arbiter unreachable; dropping buffer");
            }
        }
    }

    /// Check out a buffer that checks itself back in when dropped.
    pub async fn lend(&self, size: usize) -> LentBuffer {
        LentBuffer {
            buffer: self.checkout(size).await,
            pool: self.clone(),
        }
    }

    pub async fn stats(&self, size: usize) -> PoolStats {
        let Some(requests) = &self.requests else {
            return PoolStats::default();
        };
        let (reply, rx) = oneshot::channel();
        if requests.send(Request::Stats { size, reply }).is_err() {
            return PoolStats::default();
        }
        rx.await.unwrap_or_default()
    }
}

impl Default for ArgumentPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the free lists. Runs until every pool handle is gone.
#[derive(Default)]
struct Arbiter {
    free: HashMap<usize, Vec<ArgumentBuffer>>,
    allocated: HashMap<usize, usize>,
}

impl Arbiter {
    fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        while let Some(request) = requests.blocking_recv() {
            match request {
                Request::Checkout { size, reply } => {
                    let buffer = self.take(size);
                    // The requester went away; keep the buffer.
                    if let Err(buffer) = reply.send(buffer) {
                        self.put(buffer);
                    }
                }
                Request::Checkin(buffer) => self.put(buffer),
                Request::Stats { size, reply } => {
                    let _ = reply.send(PoolStats {
                        allocated: self.allocated.get(&size).copied().unwrap_or(0),
                        idle: self.free.get(&size).map_or(0, Vec::len),
                    });
                }
            }
        }
        debug!(sizes = self.free.len(), "argument pool arbiter stopped");
    }

    fn take(&mut self, size: usize) -> ArgumentBuffer {
        if let Some(buffer) = self.free.get_mut(&size).and_then(Vec::pop) {
            return buffer;
        }
        *self.allocated.entry(size).or_insert(0) += 1;
        ArgumentBuffer::with_len(size)
    }

    fn put(&mut self, buffer: ArgumentBuffer) {
        self.free.entry(buffer.len()).or_default().push(buffer);
    }
}

/// A checked-out buffer that goes back to its pool when dropped.
pub struct LentBuffer {
    buffer: ArgumentBuffer,
    pool: ArgumentPool,
}

impl Deref for LentBuffer {
    type Target = ArgumentBuffer;

    fn deref(&self) -> &ArgumentBuffer {
        &self.buffer
    }
}

impl DerefMut for LentBuffer {
    fn deref_mut(&mut self) -> &mut ArgumentBuffer {
        &mut self.buffer
    }
}

impl Drop for LentBuffer {
    fn drop(&mut self) {
        // A zero-length box does not allocate.
        let buffer = std::mem::replace(&mut self.buffer, ArgumentBuffer::with_len(0));
        self.pool.checkin(buffer);
    }
}
