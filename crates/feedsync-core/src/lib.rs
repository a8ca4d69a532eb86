//! `feedsync-core`: wait for an engine's feed sync to finish, then snapshot
//! its database.
//!
//! ```text
//! Workflow ── executor ──► docker-compose / engine CLI / sync trigger
//!    │
//!    └─ Poller ── check ──► FeedsClient ──► GET /system/feeds
//!                              │
//!                              ▼
//!                         evaluator::classify (timestamp::parse_last_sync)
//! ```

pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod fetcher;
pub mod poller;
pub mod status;
pub mod timestamp;
pub mod workflow;

pub use config::{Config, RunOptions};
pub use error::{FeedSyncError, Result};
pub use evaluator::{classify, SyncSummary};
pub use executor::Cancellation;
pub use fetcher::{FeedsClient, FetchError};
pub use poller::{PollOutcome, PollState, Poller};
pub use workflow::{Progress, Snapshot, Stage, Workflow};
