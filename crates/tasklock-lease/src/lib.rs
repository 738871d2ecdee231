//! `tasklock-lease`: time-bounded, ownership-tagged exclusive claims on a
//! task name, arbitrated by a shared store.
//!
//! # Overview
//!
//! A [`LeaseStore`] holds one row per task name and exposes atomic
//! conditional writes. The [`LeaseManager`] layers the acquire / extend /
//! release protocol on top of it and enforces the two hold bounds of a
//! [`LockConfiguration`]:
//!
//! | Bound               | Effect                                                  |
//! |---------------------|---------------------------------------------------------|
//! | `lock_at_least_for` | release never makes the row reacquirable before this    |
//! | `lock_at_most_for`  | the row expires on its own after this, holder or not    |
//!
//! Two stores ship with the crate: [`SqliteLeaseStore`] (a table shared by
//! every process pointing at the same database file) and
//! [`InMemoryLeaseStore`] (single process, tests).

pub mod db;
pub mod error;
pub mod manager;
pub mod memory;
pub mod scope;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{LeaseError, Result};
pub use manager::{AcquireOutcome, ExtendOutcome, LeaseManager, ReleaseOutcome};
pub use memory::InMemoryLeaseStore;
pub use scope::{assert_locked, extend_active_lock, with_lock_scope, ActiveLease};
pub use sqlite::SqliteLeaseStore;
pub use store::{LeaseStore, OwnerWrite, UpsertOutcome};
pub use types::{InstanceId, Lease, LeaseHandle, LockConfiguration, MAX_HOLD};
