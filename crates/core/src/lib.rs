pub mod config;
pub mod control;
pub mod error;
pub mod paths;

pub use config::Config;
pub use control::{AxNode, DomControl, FrameInfo, PageInfo, TabInfo};
pub use error::{Error, Result};
pub use paths::Paths;

/// Truncate a string to at most `max_chars` characters, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
