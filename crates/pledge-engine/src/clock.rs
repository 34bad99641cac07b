use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the monotonically increasing block height that delay queues
/// measure maturity against. The counter may advance by any number of
/// blocks between engine calls.
pub trait BlockClock: Send + Sync {
    fn current_block(&self) -> u64;
}

/// Block counter advanced explicitly by the embedder.
#[derive(Debug, Default)]
pub struct ManualClock {
    height: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            height: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, blocks: u64) {
        self.height.fetch_add(blocks, Ordering::SeqCst);
    }
}

impl BlockClock for ManualClock {
    fn current_block(&self) -> u64 {
        self.height.load(Ordering::SeqCst)
    }
}
