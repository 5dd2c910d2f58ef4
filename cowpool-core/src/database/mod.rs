// vim: tw=80

//! The Database layer owns the pool, the dataset graph, and every open objset
//!
//! Clients use the Database to manage datasets and to obtain handles to them.
//! The Database also runs the transaction group sync protocol.

use atomic_enum::atomic_enum;

mod database;
mod sync_task;

pub use self::database::{Database, DatasetHandle, ScrubStats, Transaction};
pub(crate) use self::sync_task::SyncTask;

/// Lifecycle of an imported pool
#[atomic_enum]
#[derive(PartialEq)]
pub enum PoolState {
    Active,
    /// Exported or destroyed.  Every operation fails with `Shutdown`.
    Exported,
}
