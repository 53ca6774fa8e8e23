pub mod audit;

pub use audit::{AuditDecision, AuditLogger, AuditRecord};
