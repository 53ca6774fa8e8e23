//! Chrome DevTools Protocol realisation of the DOM-control collaborator.

pub mod ax;
pub mod cdp;
pub mod control;
pub mod discovery;

pub use control::CdpControl;
