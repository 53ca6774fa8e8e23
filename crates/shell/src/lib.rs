//! Accessibility tree as a filesystem: mapping, path resolution, commands
//! and the per-session navigation kernel.

pub mod command;
pub mod kernel;
pub mod mapper;
pub mod resolver;
pub mod search;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use command::{Command, SearchSpec};
pub use kernel::{Kernel, KernelState, Reply, Session};
pub use mapper::{Snapshot, VfsEntry};
pub use resolver::BrowserPath;
