//! Score extraction core: transcript parsing, layout disambiguation, reconciliation into
//! canonical records, and per-category trends.

pub mod classify;
pub mod disambiguate;
pub mod layout;
pub mod normalize;
pub mod pipeline;
pub mod ranges;
pub mod reconcile;
pub mod schema;
pub mod summary;
pub mod table_parse;
#[cfg(test)]
mod tests;
pub mod trend;
pub mod types;

pub use disambiguate::LayoutHint;
pub use layout::LayoutVariant;
pub use pipeline::{DocumentReport, DocumentRequest, ReportPipeline, Services};
pub use summary::render_markdown;
