//! # pagestore - Transactional Page Storage
//!
//! pagestore is an embedded, ACID-compliant storage layer managing a single
//! file as an array of fixed-size pages. It gives higher layers transactional
//! page allocation, reads, and writes and leaves the interpretation of page
//! contents entirely to them. The design prioritizes:
//!
//! - **Snapshot isolation**: readers see their begin-time state, always
//! - **One fsync-bounded commit**: writes batch through an async writer
//! - **Crash safety without replay**: double-buffered meta + shadow paging
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagestore::{File, Options};
//!
//! let store = File::open("data.store", Options::default())?;
//!
//! let mut tx = store.begin();
//! let id = tx.alloc()?;
//! tx.page(id)?.set_bytes(b"hello")?;
//! tx.set_root(id)?;
//! tx.commit()?;
//!
//! let mut reader = store.begin_readonly();
//! let root = reader.root();
//! let bytes = reader.page(root)?.bytes()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (File / Tx)         │
//! ├─────────────────────────────────────┤
//! │ Commit Pipeline │ Four-Level TxLock  │
//! ├─────────────────┼───────────────────┤
//! │  Page Allocator │  WAL Shadow Pages  │
//! ├─────────────────────────────────────┤
//! │  Meta Pages (double-buffered, CRC)   │
//! ├─────────────────────────────────────┤
//! │  VFS: mmap reads, async fd writes    │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! page 0   meta slot A ┐ the newer valid slot is authoritative;
//! page 1   meta slot B ┘ commits always overwrite the older one
//! page 2+  data pages, WAL shadow pages, free-list and WAL chains
//! ```
//!
//! A commit writes new content to unreferenced pages first, waits for the
//! writer barrier, then writes the meta page to the inactive slot and waits
//! again. A crash at any point leaves one valid meta slot describing a fully
//! consistent older generation; there is no log replay on open.
//!
//! ## Module Overview
//!
//! - [`file`]: open/close, shared state, transaction entry points
//! - [`tx`]: transactions, page handles, the commit pipeline
//! - [`alloc`]: two-area page allocator and free-list persistence
//! - [`wal`]: original-to-shadow mapping and its on-disk chain
//! - [`meta`]: meta page codec and active-slot selection
//! - [`lock`]: shared/reserved/pending/exclusive transaction lock
//! - [`writer`]: order-preserving asynchronous write thread
//! - [`vfs`]: OS file access, advisory locking, memory mapping
//! - [`region`]: page id, region, and free-list primitives

pub mod alloc;
pub mod error;
pub mod file;
pub mod lock;
pub mod meta;
pub mod region;
pub mod tx;
pub mod vfs;
pub mod wal;
pub mod writer;

pub use error::StorageError;
pub use file::{File, FileStats, Options, TxOptions, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use region::{PageId, Region};
pub use tx::{PageRef, Tx};

pub use eyre::Result;
