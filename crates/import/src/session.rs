//! The `upload -> mapping -> review` import flow.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockpro_core::RecordId;

use crate::mapping::ColumnMapping;
use crate::matching::{CatalogProduct, match_product};
use crate::parse::{detect_delimiter, parse_csv, parse_decimal, parse_price};

/// Unit used when neither the file nor the matched product gives one.
pub const UNIT_FALLBACK: &str = "unit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStep {
    Upload,
    Mapping,
    Review,
}

impl core::fmt::Display for ImportStep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ImportStep::Upload => "upload",
            ImportStep::Mapping => "mapping",
            ImportStep::Review => "review",
        })
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot {action} during the {step} step")]
    WrongStep { step: ImportStep, action: &'static str },
    #[error("file contains no rows")]
    EmptyFile,
    #[error("invalid delimiter {0:?}")]
    InvalidDelimiter(char),
    #[error("row {0} does not exist")]
    RowOutOfRange(usize),
    #[error("product {0} is not in the catalog")]
    UnknownProduct(RecordId),
    #[error("a supplier must be selected")]
    MissingSupplier,
    #[error("no importable rows")]
    NothingToImport,
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// Why a row cannot be imported as is. The first applicable reason wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowError {
    MissingProductName,
    InvalidQuantity,
    UnrecognizedProduct,
}

impl core::fmt::Display for RowError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            RowError::MissingProductName => "missing product name",
            RowError::InvalidQuantity => "invalid quantity",
            RowError::UnrecognizedProduct => "unrecognized product",
        })
    }
}

/// One data row after mapping and catalog matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRow {
    /// 1-based line in the parsed file (blank lines excluded).
    pub line: usize,
    pub product_name: String,
    pub quantity: f64,
    pub unit: String,
    pub price: f64,
    pub matched: Option<CatalogProduct>,
    pub error: Option<RowError>,
    /// Unit column as read from the file; empty when absent.
    csv_unit: String,
}

impl ParsedRow {
    fn new(line: usize, raw: &[String], mapping: &ColumnMapping, catalog: &[CatalogProduct]) -> Self {
        let product_name = ColumnMapping::field(raw, mapping.product).to_string();
        let quantity = parse_decimal(ColumnMapping::field(raw, mapping.quantity));
        let price = parse_price(ColumnMapping::field(raw, mapping.price));
        let csv_unit = ColumnMapping::field(raw, mapping.unit).to_string();
        let matched = match_product(&product_name, catalog).map(|(p, _)| p.clone());

        let mut row = Self {
            line,
            product_name,
            quantity,
            unit: String::new(),
            price,
            matched,
            error: None,
            csv_unit,
        };
        row.refresh();
        row
    }

    /// Recompute unit and error after the match changed.
    fn refresh(&mut self) {
        self.unit = if !self.csv_unit.is_empty() {
            self.csv_unit.clone()
        } else if let Some(p) = &self.matched {
            p.unit.clone()
        } else {
            UNIT_FALLBACK.to_string()
        };

        self.error = if self.product_name.trim().is_empty() && self.matched.is_none() {
            Some(RowError::MissingProductName)
        } else if self.quantity <= 0.0 {
            Some(RowError::InvalidQuantity)
        } else if self.matched.is_none() {
            Some(RowError::UnrecognizedProduct)
        } else {
            None
        };
    }

    pub fn is_importable(&self) -> bool {
        self.matched.is_some() && self.quantity > 0.0
    }
}

/// A line handed to the creation API on confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportItem {
    pub product_id: RecordId,
    pub quantity: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportConfirmation {
    pub supplier: String,
    pub items: Vec<ImportItem>,
}

/// Counts for the review screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub total: usize,
    pub matched: usize,
    pub errors: usize,
    pub importable: usize,
}

/// State of one import.
///
/// Forward moves happen only through [`load`](Self::load) and
/// [`process`](Self::process); [`back`](Self::back) steps one state back.
#[derive(Debug, Clone)]
pub struct ImportSession {
    step: ImportStep,
    catalog: Vec<CatalogProduct>,
    content: String,
    delimiter: u8,
    has_header: bool,
    raw_rows: Vec<Vec<String>>,
    mapping: ColumnMapping,
    rows: Vec<ParsedRow>,
}

impl ImportSession {
    /// Start an import against a catalog snapshot. The snapshot is not
    /// refreshed during the flow.
    pub fn new(catalog: Vec<CatalogProduct>) -> Self {
        Self {
            step: ImportStep::Upload,
            catalog,
            content: String::new(),
            delimiter: b',',
            has_header: true,
            raw_rows: Vec::new(),
            mapping: ColumnMapping::default(),
            rows: Vec::new(),
        }
    }

    pub fn step(&self) -> ImportStep {
        self.step
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn has_header(&self) -> bool {
        self.has_header
    }

    pub fn mapping(&self) -> ColumnMapping {
        self.mapping
    }

    /// Parsed file rows, header included.
    pub fn raw_rows(&self) -> &[Vec<String>] {
        &self.raw_rows
    }

    /// Header row, when the file has one.
    pub fn headers(&self) -> Option<&[String]> {
        if self.has_header {
            self.raw_rows.first().map(Vec::as_slice)
        } else {
            None
        }
    }

    pub fn rows(&self) -> &[ParsedRow] {
        &self.rows
    }

    fn expect_step(&self, step: ImportStep, action: &'static str) -> Result<(), ImportError> {
        if self.step != step {
            return Err(ImportError::WrongStep {
                step: self.step,
                action,
            });
        }
        Ok(())
    }

    /// `upload -> mapping`: keep the file text, detect the delimiter, parse.
    pub fn load(&mut self, content: impl Into<String>) -> Result<(), ImportError> {
        self.expect_step(ImportStep::Upload, "load a file")?;
        let content = content.into();
        let delimiter = detect_delimiter(&content);
        let raw_rows = parse_csv(&content, delimiter)?;
        if raw_rows.is_empty() {
            return Err(ImportError::EmptyFile);
        }

        self.content = content;
        self.delimiter = delimiter;
        self.raw_rows = raw_rows;
        self.has_header = true;
        self.mapping = ColumnMapping::guess(&self.raw_rows[0]);
        self.step = ImportStep::Mapping;
        tracing::debug!(
            rows = self.raw_rows.len(),
            delimiter = %char::from(delimiter).escape_default(),
            "import file loaded"
        );
        Ok(())
    }

    /// Change the delimiter and re-split the original file text.
    pub fn set_delimiter(&mut self, delimiter: u8) -> Result<(), ImportError> {
        self.expect_step(ImportStep::Mapping, "change the delimiter")?;
        if matches!(delimiter, b'"' | b'\n' | b'\r') || !delimiter.is_ascii() {
            return Err(ImportError::InvalidDelimiter(char::from(delimiter)));
        }
        self.raw_rows = parse_csv(&self.content, delimiter)?;
        self.delimiter = delimiter;
        if self.has_header {
            if let Some(headers) = self.raw_rows.first() {
                self.mapping = ColumnMapping::guess(headers);
            }
        }
        Ok(())
    }

    pub fn set_has_header(&mut self, has_header: bool) -> Result<(), ImportError> {
        self.expect_step(ImportStep::Mapping, "change the header setting")?;
        self.has_header = has_header;
        Ok(())
    }

    pub fn set_mapping(&mut self, mapping: ColumnMapping) -> Result<(), ImportError> {
        self.expect_step(ImportStep::Mapping, "change the column mapping")?;
        self.mapping = mapping;
        Ok(())
    }

    /// `mapping -> review`: extract, parse and match every data row.
    pub fn process(&mut self) -> Result<&[ParsedRow], ImportError> {
        self.expect_step(ImportStep::Mapping, "process rows")?;
        let skip = usize::from(self.has_header);
        self.rows = self
            .raw_rows
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(i, raw)| ParsedRow::new(i + 1, raw, &self.mapping, &self.catalog))
            .collect();
        self.step = ImportStep::Review;

        let summary = self.summary();
        tracing::info!(
            total = summary.total,
            matched = summary.matched,
            errors = summary.errors,
            "import rows processed"
        );
        Ok(&self.rows)
    }

    /// One step back: `review -> mapping` or `mapping -> upload`.
    pub fn back(&mut self) -> Result<ImportStep, ImportError> {
        self.step = match self.step {
            ImportStep::Review => {
                self.rows.clear();
                ImportStep::Mapping
            }
            ImportStep::Mapping => {
                self.content.clear();
                self.raw_rows.clear();
                self.mapping = ColumnMapping::default();
                ImportStep::Upload
            }
            ImportStep::Upload => {
                return Err(ImportError::WrongStep {
                    step: ImportStep::Upload,
                    action: "go back",
                });
            }
        };
        Ok(self.step)
    }

    /// Bind a row to a catalog product by hand.
    pub fn assign_product(&mut self, row: usize, product_id: &RecordId) -> Result<&ParsedRow, ImportError> {
        self.expect_step(ImportStep::Review, "assign a product")?;
        let product = self
            .catalog
            .iter()
            .find(|p| &p.id == product_id)
            .cloned()
            .ok_or_else(|| ImportError::UnknownProduct(product_id.clone()))?;
        let entry = self.rows.get_mut(row).ok_or(ImportError::RowOutOfRange(row))?;
        entry.matched = Some(product);
        entry.refresh();
        Ok(entry)
    }

    /// Drop a row from the review list. There is no undo.
    pub fn remove_row(&mut self, row: usize) -> Result<ParsedRow, ImportError> {
        self.expect_step(ImportStep::Review, "remove a row")?;
        if row >= self.rows.len() {
            return Err(ImportError::RowOutOfRange(row));
        }
        Ok(self.rows.remove(row))
    }

    pub fn summary(&self) -> ImportSummary {
        ImportSummary {
            total: self.rows.len(),
            matched: self.rows.iter().filter(|r| r.matched.is_some()).count(),
            errors: self.rows.iter().filter(|r| r.error.is_some()).count(),
            importable: self.rows.iter().filter(|r| r.is_importable()).count(),
        }
    }

    /// Matched rows with a positive quantity, for `supplier`.
    pub fn confirm(&self, supplier: &str) -> Result<ImportConfirmation, ImportError> {
        self.expect_step(ImportStep::Review, "confirm the import")?;
        let supplier = supplier.trim();
        if supplier.is_empty() {
            return Err(ImportError::MissingSupplier);
        }

        let items: Vec<ImportItem> = self
            .rows
            .iter()
            .filter(|r| r.is_importable())
            .filter_map(|r| {
                r.matched.as_ref().map(|p| ImportItem {
                    product_id: p.id.clone(),
                    quantity: r.quantity,
                    price: r.price,
                })
            })
            .collect();
        if items.is_empty() {
            return Err(ImportError::NothingToImport);
        }

        tracing::info!(supplier, items = items.len(), "import confirmed");
        Ok(ImportConfirmation {
            supplier: supplier.to_string(),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogProduct> {
        vec![
            CatalogProduct {
                id: RecordId::remote("p-1"),
                name: "Carottes".to_string(),
                unit: "kg".to_string(),
            },
            CatalogProduct {
                id: RecordId::remote("p-2"),
                name: "Crème liquide".to_string(),
                unit: "l".to_string(),
            },
        ]
    }

    const FILE: &str = "Produit;Quantité;Unité;Prix\n\
                        Carottes;10;kg;1,20 €\n\
                        crème liquide;2,5;;3,40\n\
                        Saumon;4;kg;22\n\
                        ;0;;\n";

    fn reviewed() -> ImportSession {
        let mut session = ImportSession::new(catalog());
        session.load(FILE).unwrap();
        session.process().unwrap();
        session
    }

    #[test]
    fn load_detects_delimiter_and_headers() {
        let mut session = ImportSession::new(catalog());
        session.load(FILE).unwrap();
        assert_eq!(session.step(), ImportStep::Mapping);
        assert_eq!(session.delimiter(), b';');
        assert_eq!(session.headers().unwrap()[0], "Produit");
        assert_eq!(session.mapping(), ColumnMapping::default());
    }

    #[test]
    fn rows_are_matched_and_flagged() {
        let session = reviewed();
        let rows = session.rows();
        assert_eq!(rows.len(), 4);

        assert_eq!(rows[0].matched.as_ref().unwrap().id, RecordId::remote("p-1"));
        assert_eq!(rows[0].price, 1.2);
        assert_eq!(rows[0].error, None);

        // Unit comes from the matched product when the file has none.
        assert_eq!(rows[1].quantity, 2.5);
        assert_eq!(rows[1].unit, "l");

        assert_eq!(rows[2].error, Some(RowError::UnrecognizedProduct));
        assert_eq!(rows[2].unit, "kg");

        // Empty name wins over zero quantity.
        assert_eq!(rows[3].error, Some(RowError::MissingProductName));
        assert_eq!(rows[3].unit, UNIT_FALLBACK);

        assert_eq!(
            session.summary(),
            ImportSummary {
                total: 4,
                matched: 2,
                errors: 2,
                importable: 2,
            }
        );
    }

    #[test]
    fn delimiter_change_reparses_original_text() {
        let mut session = ImportSession::new(catalog());
        // One comma and one semicolon in the header: detection falls back to a comma.
        session.load("a,b;c\nCarottes,3;kg\n").unwrap();
        assert_eq!(session.delimiter(), b',');
        assert_eq!(session.raw_rows()[1], vec!["Carottes", "3;kg"]);

        session.set_delimiter(b';').unwrap();
        assert_eq!(session.raw_rows()[1], vec!["Carottes,3", "kg"]);

        session.set_delimiter(b',').unwrap();
        assert_eq!(session.raw_rows()[1], vec!["Carottes", "3;kg"]);
    }

    #[test]
    fn steps_cannot_be_skipped() {
        let mut session = ImportSession::new(catalog());
        assert!(matches!(session.process(), Err(ImportError::WrongStep { .. })));
        assert!(matches!(session.confirm("Metro"), Err(ImportError::WrongStep { .. })));
        assert!(session.back().is_err());

        session.load(FILE).unwrap();
        assert!(session.load(FILE).is_err());
        session.process().unwrap();
        assert!(session.set_delimiter(b',').is_err());

        assert_eq!(session.back().unwrap(), ImportStep::Mapping);
        assert!(session.rows().is_empty());
        assert_eq!(session.back().unwrap(), ImportStep::Upload);
        assert!(session.raw_rows().is_empty());
    }

    #[test]
    fn empty_file_is_rejected() {
        let mut session = ImportSession::new(catalog());
        assert!(matches!(session.load("\n \n"), Err(ImportError::EmptyFile)));
        assert_eq!(session.step(), ImportStep::Upload);
    }

    #[test]
    fn manual_assignment_clears_error_unless_quantity_is_invalid() {
        let mut session = reviewed();

        let row = session.assign_product(2, &RecordId::remote("p-1")).unwrap();
        assert_eq!(row.error, None);
        assert_eq!(row.unit, "kg");

        let row = session.assign_product(3, &RecordId::remote("p-2")).unwrap();
        assert_eq!(row.error, Some(RowError::InvalidQuantity));
        assert_eq!(row.unit, "l");

        assert!(matches!(
            session.assign_product(9, &RecordId::remote("p-1")),
            Err(ImportError::RowOutOfRange(9))
        ));
        assert!(matches!(
            session.assign_product(0, &RecordId::remote("p-404")),
            Err(ImportError::UnknownProduct(_))
        ));
    }

    #[test]
    fn confirm_requires_supplier_and_keeps_importable_rows() {
        let mut session = reviewed();
        assert!(matches!(session.confirm("  "), Err(ImportError::MissingSupplier)));

        session.remove_row(0).unwrap();
        let confirmation = session.confirm("Primeurs du Sud").unwrap();
        assert_eq!(confirmation.supplier, "Primeurs du Sud");
        assert_eq!(
            confirmation.items,
            vec![ImportItem {
                product_id: RecordId::remote("p-2"),
                quantity: 2.5,
                price: 3.4,
            }]
        );

        session.remove_row(0).unwrap();
        assert!(matches!(
            session.confirm("Primeurs du Sud"),
            Err(ImportError::NothingToImport)
        ));
    }

    #[test]
    fn malformed_line_is_flagged_and_the_rest_imports() {
        let mut session = ImportSession::new(catalog());
        session
            .load("Produit,Quantité\n\"Saumon,4\nCarottes,10\n,,,\n")
            .unwrap();
        let rows = session.process().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].product_name, "Saumon,4");
        assert_eq!(rows[0].error, Some(RowError::InvalidQuantity));
        assert!(rows[1].is_importable());
        assert_eq!(rows[2].error, Some(RowError::MissingProductName));
    }

    #[test]
    fn headerless_files_use_every_row() {
        let mut session = ImportSession::new(catalog());
        session.load("Carottes,5,kg,1.10\n").unwrap();
        session.set_has_header(false).unwrap();
        session.process().unwrap();
        assert_eq!(session.rows().len(), 1);
        assert_eq!(session.rows()[0].line, 1);
        assert!(session.rows()[0].is_importable());
    }
}
