//! CSV import of supplier deliveries.
//!
//! A three-step flow (`upload -> mapping -> review`) that turns a supplier's
//! CSV file into `(product, quantity, price)` lines bound to the product
//! catalog. Rows that cannot be bound are flagged, not rejected, so the rest
//! of the file still imports. No IO: the caller supplies the file text and
//! the catalog snapshot, and performs the creation calls on confirm.

pub mod mapping;
pub mod matching;
pub mod parse;
pub mod session;
pub mod template;

pub use mapping::ColumnMapping;
pub use matching::{CatalogProduct, MatchTier, match_product};
pub use parse::{detect_delimiter, parse_csv, parse_decimal, parse_price};
pub use session::{
    ImportConfirmation, ImportError, ImportItem, ImportSession, ImportStep, ImportSummary,
    ParsedRow, RowError, UNIT_FALLBACK,
};
pub use template::{TEMPLATE_FILE_NAME, template_csv};
