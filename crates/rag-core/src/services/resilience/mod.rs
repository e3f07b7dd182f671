//! Resilience layer wrapped around every call to an external collaborator.
//!
//! Composition order (outer to inner) is fixed by [`ResiliencePolicy::run`]:
//! memory guard, per-attempt timeout, retry with exponential backoff,
//! then degradation to a registered fallback.

mod init_cache;
mod memory;
mod policy;

pub use init_cache::InitCache;
pub use memory::{MemoryGuard, MemoryProbe, MemorySample, MemoryStatus, SystemMemoryProbe};
pub use policy::{PolicyConfig, ResiliencePolicy};
