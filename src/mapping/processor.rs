use std::{collections::BTreeSet, sync::Arc};

use sha2::{Digest, Sha256};

use crate::{
    core::item::{ItemProcessor, ItemProcessorResult},
    BatchError,
};

use super::{
    field::{FileType, MappingSet, Pad},
    record::Record,
    transformer::FieldTransformer,
};

/// Fits `value` into exactly `length` characters.
///
/// Longer values are truncated (legacy fixed-width layouts accept the data loss);
/// shorter values are filled with `pad_char` on the `pad` side.
pub fn apply_padding(value: &str, length: usize, pad: Pad, pad_char: char) -> String {
    let current = value.chars().count();

    if current > length {
        return value.chars().take(length).collect();
    }
    if current == length {
        return value.to_string();
    }

    let fill: String = std::iter::repeat_n(pad_char, length - current).collect();
    match pad {
        Pad::Left => fill + value,
        Pad::Right => format!("{value}{fill}"),
    }
}

/// One transformed record: `(output key, padded value)` pairs in target-position order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputRow {
    fields: Vec<(String, String)>,
}

impl OutputRow {
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    /// Renders the row as one output line (without terminator).
    pub fn to_line(&self, file_type: FileType, delimiter: &str) -> String {
        let values = self.fields.iter().map(|(_, v)| v.as_str());
        match file_type {
            FileType::FixedWidth => values.collect(),
            FileType::Delimited => values.collect::<Vec<_>>().join(delimiter),
        }
    }
}

/// Replaces sensitive field values before padding.
pub trait FieldProtector: Send + Sync {
    fn protect(&self, field: &str, value: &str) -> String;
}

/// Tokenizes values as a salted SHA-256 hex digest.
pub struct HashingProtector {
    salt: String,
}

impl HashingProtector {
    pub fn new(salt: &str) -> Self {
        Self {
            salt: salt.to_string(),
        }
    }
}

impl FieldProtector for HashingProtector {
    fn protect(&self, field: &str, value: &str) -> String {
        if value.is_empty() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(field.as_bytes());
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Turns a source [`Record`] into an [`OutputRow`] using a resolved [`MappingSet`].
///
/// Fields are emitted in ascending target position whatever the order of the
/// source row. Processing is pure: the same record and mapping set always give
/// the same row.
pub struct RecordProcessor {
    mapping_set: Arc<MappingSet>,
    transformer: FieldTransformer,
    strict: bool,
    protector: Option<(Arc<dyn FieldProtector>, BTreeSet<String>)>,
}

impl RecordProcessor {
    pub fn new(mapping_set: Arc<MappingSet>) -> Self {
        Self {
            mapping_set,
            transformer: FieldTransformer::new(),
            strict: false,
            protector: None,
        }
    }

    /// In strict mode an unresolvable field fails the whole record (which the
    /// step then skips) instead of falling back to its default value.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn protect_fields(mut self, protector: Arc<dyn FieldProtector>, fields: &[String]) -> Self {
        if !fields.is_empty() {
            self.protector = Some((protector, fields.iter().cloned().collect()));
        }
        self
    }

    pub fn mapping_set(&self) -> &MappingSet {
        &self.mapping_set
    }

    pub fn process_record(&self, record: &Record) -> Result<OutputRow, BatchError> {
        let mappings = self.mapping_set.mappings();
        let delimited = self.mapping_set.file_type() == FileType::Delimited;
        let mut fields = Vec::with_capacity(mappings.len());

        for mapping in mappings {
            let mut value = if self.strict {
                self.transformer.try_transform(record, mapping)?
            } else {
                self.transformer.transform(record, mapping)
            };

            if let Some((protector, protected)) = &self.protector {
                if protected.contains(mapping.output_key()) {
                    value = protector.protect(mapping.output_key(), &value);
                }
            }

            // Zero-length fields in delimited files are variable width.
            let value = if delimited && mapping.length == 0 {
                value
            } else {
                apply_padding(&value, mapping.length, mapping.pad, mapping.pad_char)
            };

            fields.push((mapping.output_key().to_string(), value));
        }

        Ok(OutputRow::new(fields))
    }
}

impl ItemProcessor<Record, OutputRow> for RecordProcessor {
    fn process(&self, item: &Record) -> ItemProcessorResult<OutputRow> {
        self.process_record(item)
    }
}
