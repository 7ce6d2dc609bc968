//! Synchronization Primitives
//!
//! Safe synchronization and global state management for Rust 2024 edition.

pub mod list;
pub mod once_lock;
pub mod spinlock;

pub use list::{IntrusiveList, Linked, ListLink};
pub use once_lock::{GlobalState, LazyLock, OnceLock};
pub use spinlock::{current_irql, lower_irql, raise_irql, raise_irql_guarded, Irql, SpinLock, SpinLockGuard};
