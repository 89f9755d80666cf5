//! Downloadable sample file.

/// File name offered for the template download.
pub const TEMPLATE_FILE_NAME: &str = "stockpro_import_template.csv";

/// A sample delivery file in the default column layout, semicolon separated
/// with decimal commas.
pub fn template_csv() -> String {
    [
        "Produit;Quantité;Unité;Prix",
        "Carottes;10;kg;1,20 €",
        "Crème liquide;6;l;3,40 €",
        "Oeufs;60;pièce;0,25 €",
    ]
    .join("\n")
        + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::ColumnMapping;
    use crate::session::{ImportSession, ImportStep};

    #[test]
    fn template_loads_with_default_mapping() {
        let mut session = ImportSession::new(Vec::new());
        session.load(template_csv()).unwrap();
        assert_eq!(session.step(), ImportStep::Mapping);
        assert_eq!(session.delimiter(), b';');
        assert_eq!(session.mapping(), ColumnMapping::default());

        let rows = session.process().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].product_name, "Carottes");
        assert_eq!(rows[0].quantity, 10.0);
        assert_eq!(rows[0].unit, "kg");
        assert_eq!(rows[0].price, 1.2);
    }
}
