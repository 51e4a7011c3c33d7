//! Core of the ClamAV signature mirror updater.
//!
//! Brings the `main`, `daily` and `bytecode` signature databases in a local
//! directory up to the versions published by the mirror, preferring the
//! incremental `.cdiff` files and falling back to a full `.cvd` download
//! whenever the local state cannot be trusted.

pub mod config;
pub mod fetch;
pub mod probe;
pub mod reconcile;
pub mod sync;
pub mod version;

pub use config::SyncConfig;
pub use fetch::{FetchError, FetchOutcome, Fetcher, MirrorTransport, Transport};
pub use probe::{ProbeError, Sigtool, VersionProbe};
pub use reconcile::{Downloader, ReconcileKind, ReconcileReport, Reconciler};
pub use sync::{run_sync, SyncRun, SyncSummary};
pub use version::{Artifact, RecordError, VersionRecord};
