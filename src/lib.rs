//! arcadb: an embedded object-database storage engine core.
//!
//! Layered bottom-up:
//!
//! * [`arena`] — the mmap'd allocator everything else is built on (C1).
//! * [`crypto`] — the optional encrypted page mapping `arena` can sit on
//!   top of instead of a plain file (C2).
//! * [`codec`] — bit-packed node headers and value packing shared by every
//!   B+-tree node (C3/C4 wire format).
//! * [`btree`] — the persistent, copy-on-write B+-tree array (C4).
//! * [`leaf`] — typed column families built on top of the array (C5).
//! * [`snapshot`] — the MVCC coordinator tying reader/writer lifecycles
//!   to arena reclamation (C6).
//! * [`commitlog`] — the durable two-file changeset log (C7).
//! * [`observer`] — the change-notification pipeline (C8).
//!
//! [`config`] and [`error`] are the ambient session/error surface used
//! throughout.

pub mod arena;
pub mod btree;
pub mod codec;
pub mod commitlog;
pub mod config;
pub mod crypto;
pub mod error;
pub mod leaf;
pub mod observer;
pub mod snapshot;

pub use config::{EncryptionKey, GrowthPolicy, SessionConfig};
pub use error::{EngineError, Result};

/// Initializes the crate's `tracing` subscriber for standalone binaries
/// and examples; libraries embedding `arcadb` are expected to install
/// their own subscriber instead (§10.2).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
