use std::fmt::Write;

use chrono::{
    format::{Item, StrftimeItems},
    NaiveDate, NaiveDateTime, NaiveTime,
};
use log::debug;

use crate::BatchError;

use super::{
    field::{CompositePart, DataType, FieldMapping, TransformationType},
    record::{Record, Value},
};

/// Computes the output value of one field for one source record.
///
/// [`FieldTransformer::transform`] never fails: anything that cannot be resolved
/// degrades to the mapping's default value (or the empty string), so a single bad
/// cell cannot abort a batch. [`FieldTransformer::try_transform`] exposes the
/// underlying failure for callers that prefer to skip the whole record.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldTransformer;

impl FieldTransformer {
    pub fn new() -> Self {
        Self
    }

    pub fn transform(&self, record: &Record, mapping: &FieldMapping) -> String {
        match self.try_transform(record, mapping) {
            Ok(value) => value,
            Err(error) => {
                debug!("Using default for {}: {}", mapping.output_key(), error);
                mapping.default_or_empty()
            }
        }
    }

    pub fn try_transform(&self, record: &Record, mapping: &FieldMapping) -> Result<String, BatchError> {
        let value = match mapping.transformation_type {
            TransformationType::Constant => mapping
                .value
                .clone()
                .unwrap_or_else(|| mapping.default_or_empty()),
            TransformationType::Source => self.source_value(record, mapping)?,
            TransformationType::Composite => self.composite_value(record, mapping),
            // No branch and no else yields an empty field; configurations are
            // checked for a missing else at resolution time.
            TransformationType::Conditional => mapping
                .condition
                .as_ref()
                .and_then(|condition| condition.evaluate(record))
                .unwrap_or_default(),
            TransformationType::Lookup => self.lookup_value(record, mapping)?,
        };

        Ok(apply_format(value, mapping.format.as_deref()))
    }

    fn source_value(&self, record: &Record, mapping: &FieldMapping) -> Result<String, BatchError> {
        let source_field = mapping.source_field.as_deref().unwrap_or(&mapping.field_name);

        let Some(value) = record.get_present(source_field) else {
            return Ok(mapping.default_or_empty());
        };

        match (&mapping.source_format, &mapping.target_format) {
            (Some(source_format), Some(target_format)) => {
                convert(value, mapping.data_type, source_format, target_format).map_err(|message| {
                    BatchError::Transformation {
                        field: mapping.output_key().to_string(),
                        message,
                    }
                })
            }
            _ => Ok(value.to_string()),
        }
    }

    fn composite_value(&self, record: &Record, mapping: &FieldMapping) -> String {
        let value: String = mapping
            .composite_parts
            .iter()
            .map(|part| match part {
                CompositePart::Literal(text) => text.clone(),
                CompositePart::Field(name) => record
                    .get_present(name)
                    .map(Value::to_string)
                    .unwrap_or_default(),
            })
            .collect();

        if value.is_empty() {
            mapping.default_or_empty()
        } else {
            value
        }
    }

    fn lookup_value(&self, record: &Record, mapping: &FieldMapping) -> Result<String, BatchError> {
        let source_field = mapping.source_field.as_deref().unwrap_or(&mapping.field_name);
        let key = record
            .get_present(source_field)
            .map(Value::to_string)
            .unwrap_or_default();

        match mapping.lookup.get(key.trim()) {
            Some(value) => Ok(value.clone()),
            None => Err(BatchError::Transformation {
                field: mapping.output_key().to_string(),
                message: format!("no lookup entry for `{key}`"),
            }),
        }
    }
}

fn apply_format(value: String, format: Option<&str>) -> String {
    match format.map(|f| f.trim().to_ascii_lowercase()) {
        Some(f) if f == "upper" || f == "uppercase" => value.to_uppercase(),
        Some(f) if f == "lower" || f == "lowercase" => value.to_lowercase(),
        Some(f) if f == "trim" => value.trim().to_string(),
        _ => value,
    }
}

/// Reformats a value from `source_format` to `target_format`.
fn convert(value: &Value, data_type: DataType, source_format: &str, target_format: &str) -> Result<String, String> {
    match data_type {
        DataType::Date => {
            let target = to_chrono_pattern(target_format);
            let parsed = match value {
                Value::Date(date) => date.and_time(NaiveTime::default()),
                other => parse_date(other.to_string().trim(), &to_chrono_pattern(source_format))?,
            };
            let mut out = String::new();
            write!(out, "{}", parsed.format(&target))
                .map_err(|_| format!("cannot render `{parsed}` as `{target_format}`"))?;
            Ok(out)
        }
        DataType::Number => {
            let number = value
                .as_number()
                .ok_or_else(|| format!("`{value}` is not a number"))?;
            let scaled = match implied_decimals(source_format) {
                Some(places) => number / 10f64.powi(places as i32),
                None => number,
            };
            format_number(scaled, target_format)
        }
        DataType::String => Ok(value.to_string()),
    }
}

/// Date-only sources are read as midnight so time fields in the target render as zeros.
fn parse_date(text: &str, pattern: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(text, pattern)
        .or_else(|_| NaiveDate::parse_from_str(text, pattern).map(|d| d.and_time(NaiveTime::default())))
        .map_err(|e| format!("`{text}` does not match `{pattern}`: {e}"))
}

/// Rejects date patterns chrono cannot interpret.
pub fn check_date_pattern(pattern: &str) -> Result<(), String> {
    let translated = to_chrono_pattern(pattern);
    if StrftimeItems::new(&translated).any(|item| matches!(item, Item::Error)) {
        Err(format!("`{pattern}` is not a valid date pattern"))
    } else {
        Ok(())
    }
}

/// Translates `yyyyMMdd`-style patterns to chrono's `%Y%m%d`. Patterns that
/// already contain `%` are returned unchanged.
pub fn to_chrono_pattern(pattern: &str) -> String {
    if pattern.contains('%') {
        return pattern.to_string();
    }

    const TOKENS: [(&str, &str); 9] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("SSS", "%3f"),
        ("DDD", "%j"),
    ];

    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(stripped) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = stripped;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// `V99`-style implied decimal count in a source number format.
fn implied_decimals(format: &str) -> Option<usize> {
    let upper = format.to_ascii_uppercase();
    let (_, decimals) = upper.split_once('V')?;
    Some(decimals.chars().filter(|c| matches!(c, '0' | '9')).count())
}

/// Formats a number against a `0`/`#`/`.`/`V` picture.
///
/// `0.00` gives two decimals, `000000` zero-pads to six digits, `9(7)V99`-like
/// pictures (`0000000V00`) drop the decimal point.
fn format_number(number: f64, picture: &str) -> Result<String, String> {
    let upper = picture.to_ascii_uppercase();
    let (integer_part, fraction_part, implied) = if let Some((i, f)) = upper.split_once('.') {
        (i.to_string(), f.to_string(), false)
    } else if let Some((i, f)) = upper.split_once('V') {
        (i.to_string(), f.to_string(), true)
    } else {
        (upper.clone(), String::new(), false)
    };

    if integer_part
        .chars()
        .chain(fraction_part.chars())
        .any(|c| !matches!(c, '0' | '#' | '9'))
    {
        return Err(format!("unsupported number format `{picture}`"));
    }

    let decimals = fraction_part.len();
    let width = integer_part.chars().filter(|c| *c == '0' || *c == '9').count();
    let negative = number < 0.0;
    let formatted = format!("{:.*}", decimals, number.abs());
    let (int_digits, frac_digits) = formatted.split_once('.').unwrap_or((formatted.as_str(), ""));

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&format!("{int_digits:0>width$}"));
    if decimals > 0 {
        if !implied {
            out.push('.');
        }
        out.push_str(frac_digits);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::mapping::{condition::Condition, field::Pad};

    fn row() -> Record {
        Record::new()
            .with("AMOUNT", "100")
            .with("STATUS", "A")
            .with("ACCOUNT_ID", "12345")
            .with("OPEN_DATE", "2024-03-15")
    }

    #[test]
    fn constant_returns_value_verbatim() {
        let mapping = FieldMapping::constant("REC_TYPE", "D1", 1, 2);

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "D1");
    }

    #[test]
    fn source_missing_falls_back_to_default() {
        let mapping = FieldMapping::source("NAME", "CUSTOMER_NAME", 1, 8).with_default("UNKNOWN");

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "UNKNOWN");
    }

    #[test]
    fn source_date_is_reformatted() {
        let mapping = FieldMapping::source("OPENED", "OPEN_DATE", 1, 8).with_formats(
            DataType::Date,
            "yyyy-MM-dd",
            "yyyyMMdd",
        );

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "20240315");
    }

    #[test]
    fn native_dates_only_need_target_format() {
        let record = Record::new().with("D", NaiveDate::from_ymd_opt(2023, 12, 1).unwrap());
        let mapping = FieldMapping::source("D", "D", 1, 10).with_formats(DataType::Date, "ignored", "MM/dd/yyyy");

        assert_eq!(FieldTransformer::new().transform(&record, &mapping), "12/01/2023");
    }

    #[test]
    fn time_fields_in_target_render_as_midnight() {
        let mapping = FieldMapping::source("OPENED", "OPEN_DATE", 1, 17)
            .with_formats(DataType::Date, "yyyy-MM-dd", "yyyyMMddHHmmssSSS")
            .with_default("00000000000000000");

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "20240315000000000");
    }

    #[test]
    fn unrenderable_target_pattern_degrades_to_default() {
        let mapping = FieldMapping::source("OPENED", "OPEN_DATE", 1, 14)
            .with_formats(DataType::Date, "yyyy-MM-dd", "%Y%z")
            .with_default("00000000000000");
        let transformer = FieldTransformer::new();

        assert!(matches!(
            transformer.try_transform(&row(), &mapping),
            Err(BatchError::Transformation { .. })
        ));
        assert_eq!(transformer.transform(&row(), &mapping), "00000000000000");
    }

    #[test]
    fn date_patterns_are_checked() {
        assert!(check_date_pattern("yyyyMMddHHmmss").is_ok());
        assert!(check_date_pattern("%Y-%m-%d").is_ok());
        assert!(check_date_pattern("%Y%Q").is_err());
    }

    #[test]
    fn unparseable_date_degrades_to_default() {
        let record = Record::new().with("OPEN_DATE", "not-a-date");
        let mapping = FieldMapping::source("OPENED", "OPEN_DATE", 1, 8)
            .with_formats(DataType::Date, "yyyy-MM-dd", "yyyyMMdd")
            .with_default("00000000");
        let transformer = FieldTransformer::new();

        assert!(transformer.try_transform(&record, &mapping).is_err());
        assert_eq!(transformer.transform(&record, &mapping), "00000000");
    }

    #[test]
    fn numbers_are_formatted_against_pictures() {
        let mapping = FieldMapping::source("AMT", "AMOUNT", 1, 12).with_formats(DataType::Number, "0", "0000000.00");
        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "0000100.00");

        let implied = FieldMapping::source("AMT", "AMOUNT", 1, 9).with_formats(DataType::Number, "0", "0000000V00");
        assert_eq!(FieldTransformer::new().transform(&row(), &implied), "000010000");

        let cents = Record::new().with("AMOUNT", "12345");
        let from_implied = FieldMapping::source("AMT", "AMOUNT", 1, 9).with_formats(DataType::Number, "9V99", "0.00");
        assert_eq!(FieldTransformer::new().transform(&cents, &from_implied), "123.45");
    }

    #[test]
    fn composite_concatenates_literals_and_fields() {
        let mapping = FieldMapping::composite("REF", &["'ACC-'", "ACCOUNT_ID", "'/'", "STATUS"], 1, 20);

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "ACC-12345/A");
    }

    #[test]
    fn conditional_scenario_active() {
        let condition = Condition::new("STATUS = 'A'", "'ACTIVE'").unwrap().otherwise("'INACTIVE'");
        let mapping = FieldMapping::conditional("STATUS_DESC", condition, 1, 10).with_pad(Pad::Right, ' ');
        let transformer = FieldTransformer::new();

        assert_eq!(transformer.transform(&row(), &mapping), "ACTIVE");
        assert_eq!(
            transformer.transform(&Record::new().with("STATUS", "C"), &mapping),
            "INACTIVE"
        );
    }

    #[test]
    fn conditional_without_match_or_else_is_empty() {
        let condition = Condition::new("STATUS = 'Z'", "'ZULU'").unwrap();
        let mapping = FieldMapping::conditional("S", condition, 1, 4).with_default("IGNORED");

        assert_eq!(FieldTransformer::new().transform(&row(), &mapping), "");
    }

    #[test]
    fn lookup_translates_codes() {
        let mapping = FieldMapping::lookup("STATUS_TXT", "STATUS", &[("A", "ACTIVE"), ("C", "CLOSED")], 1, 8)
            .with_default("OTHER");
        let transformer = FieldTransformer::new();

        assert_eq!(transformer.transform(&row(), &mapping), "ACTIVE");
        assert_eq!(transformer.transform(&Record::new().with("STATUS", "X"), &mapping), "OTHER");
    }

    #[test]
    fn format_post_processing() {
        let mut mapping = FieldMapping::source("NAME", "NAME", 1, 10);
        mapping.format = Some("upper".to_string());
        let record = Record::new().with("NAME", "ada");

        assert_eq!(FieldTransformer::new().transform(&record, &mapping), "ADA");
    }

    #[test]
    fn java_patterns_translate_to_chrono() {
        assert_eq!(to_chrono_pattern("yyyyMMdd"), "%Y%m%d");
        assert_eq!(to_chrono_pattern("dd/MM/yy HH:mm:ss"), "%d/%m/%y %H:%M:%S");
        assert_eq!(to_chrono_pattern("%Y-%m"), "%Y-%m");
    }
}
