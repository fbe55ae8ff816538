//! Bounded pool of FastCGI request IDs.
//!
//! Request IDs distinguish multiplexed requests on one connection. The
//! pool hands out IDs from `[1, limit]`; ID 0 is reserved for management
//! records. `alloc` blocks while every ID is in flight; `release` never
//! blocks.
//!
//! # Example
//!
//! ```ignore
//! let pool = IdPool::new(8);
//! let id = pool.alloc().await;
//! // ... run the request ...
//! pool.release(id);
//! ```

use tokio::sync::{mpsc, Mutex};

/// Pool of unallocated 16-bit request IDs.
///
/// Backed by a bounded channel seeded with every ID, so allocation order
/// and waiter wake-up are both FIFO.
pub struct IdPool {
    free_rx: Mutex<mpsc::Receiver<u16>>,
    free_tx: mpsc::Sender<u16>,
    limit: u16,
}

impl IdPool {
    /// Create a pool covering `[1, limit]`.
    ///
    /// A `limit` of 0 selects the protocol maximum of 65,535.
    pub fn new(limit: u16) -> Self {
        let limit = if limit == 0 { u16::MAX } else { limit };
        let (free_tx, free_rx) = mpsc::channel(usize::from(limit));
        for id in 1..=limit {
            // Capacity equals the ID count, so seeding cannot fail.
            let _ = free_tx.try_send(id);
        }
        Self {
            free_rx: Mutex::new(free_rx),
            free_tx,
            limit,
        }
    }

    /// Allocate an ID, waiting until one is free.
    pub async fn alloc(&self) -> u16 {
        let mut rx = self.free_rx.lock().await;
        rx.recv().await.expect("pool holds its own sender")
    }

    /// Return an ID to the pool without blocking.
    ///
    /// Releasing an ID that was never allocated cannot corrupt the pool:
    /// once the channel holds `limit` entries the extra release is dropped.
    pub fn release(&self, id: u16) {
        if self.free_tx.try_send(id).is_err() {
            tracing::debug!("dropped release of request id {id}: pool already full");
        }
    }

    /// The highest ID this pool hands out.
    #[inline]
    pub fn limit(&self) -> u16 {
        self.limit
    }
}
