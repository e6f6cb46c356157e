//! Persistent storage for the collaboration layer.
//!
//! ```text
//! ┌──────────────┐  append / delete  ┌──────────────┐
//! │ ActivityLedger│ ───────────────► │ LedgerStore  │
//! │ (server)      │  (LedgerSink)    │ (RocksDB)    │
//! └──────┬───────┘                   └──────┬───────┘
//!        │ on startup                       │ column families
//!        ▼                                  ▼
//!   load_activities()            CF "activities" — LZ4 bincode rows
//!                                CF "metadata"   — session id, next id
//!
//! ┌──────────────┐  publish / fetch  ┌──────────────────────┐
//! │ PackageManager│ ───────────────► │ DirectoryFileSharing │
//! └──────────────┘                   └──────────────────────┘
//! ```
//!
//! ## Performance Targets
//!
//! | Metric                  | Target |
//! |-------------------------|--------|
//! | Activity append (1KB)   | <50μs  |
//! | Recovery (100k rows)    | <1s    |
//! | Shared file publish 1MB | <5ms   |

pub mod file_share;
pub mod rocks;

pub use file_share::{DirectoryFileSharing, FileShareError, FileSharing};
pub use rocks::{LedgerStore, StoreConfig, StoreError};
