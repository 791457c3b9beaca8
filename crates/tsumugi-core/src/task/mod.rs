//! Structured task execution: runner, handles, scopes, joins.

pub mod handle;
pub mod join;
pub mod runner;
pub mod scope;

pub use handle::{TaskHandle, TaskObserver, TaskState};
pub use join::join_all_or_cancel;
pub use runner::TaskRunner;
pub use scope::TaskScope;
