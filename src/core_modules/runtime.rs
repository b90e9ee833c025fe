// THEORY:
// Numeric-runtime state (which backend runs the math, how many bytes of tensors are
// alive) is carried in an explicit `RuntimeContext` rather than in process globals.
// Callers create one, pass it by reference into the stages that allocate, and derive
// a `scoped` child per request so that every request accounts for its own buffers.
//
// `MemoryTicket` is the accounting handle for one tensor. It registers the buffer's
// size on creation and releases it on drop, so the ledger returns to zero as soon as
// the owning stage lets go of its activations and gradients, on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::core_modules::feature_map::FeatureMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Plain CPU execution. `threads` is a hint for callers that fan work out.
    Cpu { threads: usize },
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Cpu {
            threads: num_cpus::get(),
        }
    }
}

/// Live/peak byte counters for tensors owned by one context.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
}

impl MemoryLedger {
    fn acquire(&self, bytes: usize) {
        let live = self.live_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak_bytes.fetch_max(live, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self, bytes: usize) {
        self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Acquire)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeContext {
    label: String,
    backend: Backend,
    ledger: Arc<MemoryLedger>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new("root", Backend::default())
    }
}

impl RuntimeContext {
    pub fn new(label: impl Into<String>, backend: Backend) -> Self {
        Self {
            label: label.into(),
            backend,
            ledger: Arc::new(MemoryLedger::default()),
        }
    }

    /// Same backend, fresh ledger. One per request.
    pub fn scoped(&self, label: impl Into<String>) -> Self {
        Self::new(format!("{}/{}", self.label, label.into()), self.backend)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn ledger(&self) -> &MemoryLedger {
        &self.ledger
    }

    /// Registers `map` with the ledger until the returned ticket is dropped.
    pub fn track(&self, map: &FeatureMap) -> MemoryTicket {
        let bytes = map.byte_len();
        self.ledger.acquire(bytes);
        MemoryTicket {
            ledger: Arc::clone(&self.ledger),
            bytes,
        }
    }
}

#[derive(Debug)]
pub struct MemoryTicket {
    ledger: Arc<MemoryLedger>,
    bytes: usize,
}

impl MemoryTicket {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryTicket {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_release_on_drop_and_keep_peak() {
        let runtime = RuntimeContext::default();
        let a = FeatureMap::zeros(4, 4, 2);
        let b = FeatureMap::zeros(2, 2, 1);
        {
            let _ta = runtime.track(&a);
            let _tb = runtime.track(&b);
            assert_eq!(runtime.ledger().live_bytes(), (32 + 4) * 4);
        }
        assert_eq!(runtime.ledger().live_bytes(), 0);
        assert_eq!(runtime.ledger().peak_bytes(), (32 + 4) * 4);
        assert_eq!(runtime.ledger().allocations(), 2);
    }

    #[test]
    fn scoped_contexts_have_private_ledgers() {
        let root = RuntimeContext::new("root", Backend::Cpu { threads: 2 });
        let child = root.scoped("scan-1");
        let map = FeatureMap::zeros(2, 2, 2);
        let _ticket = child.track(&map);
        assert_eq!(child.label(), "root/scan-1");
        assert_eq!(child.backend(), Backend::Cpu { threads: 2 });
        assert_eq!(root.ledger().live_bytes(), 0);
        assert_eq!(child.ledger().live_bytes(), 32);
    }
}
