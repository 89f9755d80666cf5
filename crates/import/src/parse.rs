//! Tokenizing and number parsing.

/// Candidate delimiters, in tie-break order.
const CANDIDATES: [u8; 3] = [b',', b';', b'\t'];

/// Pick the delimiter occurring strictly most often in the first line.
///
/// Ties (including no delimiter at all) resolve to a comma.
pub fn detect_delimiter(content: &str) -> u8 {
    let first_line = content.lines().next().unwrap_or_default();
    let count = |d: u8| first_line.bytes().filter(|&b| b == d).count();

    let [comma, semicolon, tab] = CANDIDATES.map(count);
    if semicolon > comma && semicolon > tab {
        b';'
    } else if tab > comma && tab > semicolon {
        b'\t'
    } else {
        b','
    }
}

/// Split `content` into trimmed fields.
///
/// Lines are cut first, so a quote never spans a line break; within a line
/// a quoted field may contain the delimiter. Blank lines are dropped; rows
/// may have differing lengths.
pub fn parse_csv(content: &str, delimiter: u8) -> Result<Vec<Vec<String>>, csv::Error> {
    content
        .split(['\r', '\n'])
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_line(line, delimiter))
        .collect()
}

fn parse_line(line: &str, delimiter: u8) -> Result<Vec<String>, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter)
        .from_reader(line.as_bytes());

    let mut fields = Vec::new();
    for record in rdr.records() {
        fields.extend(record?.iter().map(str::to_string));
    }
    Ok(fields)
}

/// Parse a decimal accepting `.` or `,` as separator. Unparseable input is `0`.
pub fn parse_decimal(raw: &str) -> f64 {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Like [`parse_decimal`], after dropping a trailing currency symbol
/// (`12,50 €`, `3.10$`).
pub fn parse_price(raw: &str) -> f64 {
    let trimmed = raw
        .trim()
        .trim_end_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','));
    parse_decimal(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_picks_strict_winner() {
        assert_eq!(detect_delimiter("a,b,c;d\te"), b',');
        assert_eq!(detect_delimiter("a;b;c,d\te"), b';');
        assert_eq!(detect_delimiter("a\tb\tc,d;e"), b'\t');
    }

    #[test]
    fn detection_defaults_to_comma_on_tie() {
        assert_eq!(detect_delimiter("a,b;c\td"), b',');
        assert_eq!(detect_delimiter("a;b\tc"), b',');
        assert_eq!(detect_delimiter("just text"), b',');
        assert_eq!(detect_delimiter(""), b',');
    }

    #[test]
    fn detection_only_reads_first_line() {
        assert_eq!(detect_delimiter("a;b\nc,d,e,f,g"), b';');
    }

    #[test]
    fn quoted_delimiter_is_literal() {
        let rows = parse_csv("\"Smith, John\",10,kg,5.00", b',').unwrap();
        assert_eq!(rows, vec![vec!["Smith, John", "10", "kg", "5.00"]]);
    }

    #[test]
    fn blank_lines_are_dropped_and_fields_trimmed() {
        let rows = parse_csv("Carottes ; 10\n\n   \r\nPoireaux;  4 \n", b';').unwrap();
        assert_eq!(
            rows,
            vec![vec!["Carottes", "10"], vec!["Poireaux", "4"]]
        );
    }

    #[test]
    fn unbalanced_quote_stays_on_its_line() {
        let rows = parse_csv("\"Carottes,10,kg\nPoireaux,4,kg\nNavets,2,kg\n", b',').unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["Carottes,10,kg"]);
        assert_eq!(rows[1], vec!["Poireaux", "4", "kg"]);
        assert_eq!(rows[2], vec!["Navets", "2", "kg"]);
    }

    #[test]
    fn delimiter_only_lines_are_rows() {
        let rows = parse_csv("Carottes,10\n,,,\n", b',').unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["", "", "", ""]);
    }

    #[test]
    fn bare_carriage_returns_end_lines() {
        let rows = parse_csv("a;1\rb;2\r\nc;3", b';').unwrap();
        assert_eq!(rows, vec![vec!["a", "1"], vec!["b", "2"], vec!["c", "3"]]);
    }

    #[test]
    fn ragged_rows_are_kept() {
        let rows = parse_csv("a,b,c\nd\n", b',').unwrap();
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[1].len(), 1);
    }

    #[test]
    fn decimals_accept_both_separators() {
        assert_eq!(parse_decimal("12.5"), 12.5);
        assert_eq!(parse_decimal("12,5"), 12.5);
        assert_eq!(parse_decimal(" 3 "), 3.0);
        assert_eq!(parse_decimal("abc"), 0.0);
        assert_eq!(parse_decimal(""), 0.0);
        assert_eq!(parse_decimal("inf"), 0.0);
    }

    #[test]
    fn prices_strip_trailing_currency() {
        assert_eq!(parse_price("12,50 €"), 12.5);
        assert_eq!(parse_price("3.10$"), 3.1);
        assert_eq!(parse_price("7"), 7.0);
        assert_eq!(parse_price("€"), 0.0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: comma and dot notations of the same value parse identically.
            #[test]
            fn comma_and_dot_agree(int in 0u32..100_000, frac in 0u32..100) {
                let dot = format!("{int}.{frac:02}");
                let comma = format!("{int},{frac:02}");
                prop_assert_eq!(parse_decimal(&dot), parse_decimal(&comma));
            }

            /// Property: parsing never yields NaN or infinity.
            #[test]
            fn parse_is_always_finite(raw in ".{0,16}") {
                prop_assert!(parse_decimal(&raw).is_finite());
                prop_assert!(parse_price(&raw).is_finite());
            }
        }
    }
}
