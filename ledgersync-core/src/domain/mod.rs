//! Domain types for LedgerSync

pub mod ids;
pub mod record;

pub use ids::ExportId;
pub use record::{sort_by_date, FieldValue, Record};
