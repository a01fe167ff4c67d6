use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

use super::condition::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransformationType {
    Constant,
    Source,
    Composite,
    Conditional,
    Lookup,
}

impl FromStr for TransformationType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "source" => Ok(Self::Source),
            "composite" => Ok(Self::Composite),
            "conditional" => Ok(Self::Conditional),
            "lookup" => Ok(Self::Lookup),
            other => Err(ConfigurationError::Invalid(format!(
                "unknown transformationType `{other}`"
            ))),
        }
    }
}

/// Side on which a short value is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Pad {
    Left,
    #[default]
    Right,
}

impl FromStr for Pad {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Pad::Left),
            "right" => Ok(Pad::Right),
            other => Err(ConfigurationError::Invalid(format!("unknown pad `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    #[default]
    String,
    Number,
    Date,
}

impl FromStr for DataType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "varchar" | "char" => Ok(DataType::String),
            "number" | "numeric" | "decimal" | "integer" => Ok(DataType::Number),
            "date" | "datetime" | "timestamp" => Ok(DataType::Date),
            other => Err(ConfigurationError::Invalid(format!(
                "unknown dataType `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    #[default]
    FixedWidth,
    Delimited,
}

impl FromStr for FileType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "fixed_width" | "fixed" => Ok(FileType::FixedWidth),
            "delimited" | "csv" => Ok(FileType::Delimited),
            other => Err(ConfigurationError::Invalid(format!(
                "unknown fileType `{other}`"
            ))),
        }
    }
}

/// One piece of a COMPOSITE value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositePart {
    Literal(String),
    Field(String),
}

impl CompositePart {
    /// `'text'` (or `"text"`) is a literal, anything else names a source field.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let quoted = trimmed.len() >= 2
            && (trimmed.starts_with('\'') && trimmed.ends_with('\'')
                || trimmed.starts_with('"') && trimmed.ends_with('"'));
        if quoted {
            CompositePart::Literal(trimmed[1..trimmed.len() - 1].to_string())
        } else {
            CompositePart::Field(trimmed.to_string())
        }
    }
}

/// One field's transformation rule.
///
/// Built once per configuration resolution and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub field_name: String,
    pub source_field: Option<String>,
    pub target_field: Option<String>,
    pub transformation_type: TransformationType,
    /// Literal for CONSTANT mappings.
    pub value: Option<String>,
    pub target_position: u32,
    pub length: usize,
    pub pad: Pad,
    pub pad_char: char,
    pub default_value: Option<String>,
    pub data_type: DataType,
    /// Post-processing applied to the resolved value (`upper`, `lower`, `trim`).
    pub format: Option<String>,
    pub source_format: Option<String>,
    pub target_format: Option<String>,
    pub composite: bool,
    pub composite_parts: Vec<CompositePart>,
    pub condition: Option<Condition>,
    pub lookup: BTreeMap<String, String>,
}

impl FieldMapping {
    pub fn new(field_name: &str, transformation_type: TransformationType, target_position: u32, length: usize) -> Self {
        Self {
            field_name: field_name.to_string(),
            source_field: None,
            target_field: None,
            transformation_type,
            value: None,
            target_position,
            length,
            pad: Pad::Right,
            pad_char: ' ',
            default_value: None,
            data_type: DataType::String,
            format: None,
            source_format: None,
            target_format: None,
            composite: transformation_type == TransformationType::Composite,
            composite_parts: Vec::new(),
            condition: None,
            lookup: BTreeMap::new(),
        }
    }

    pub fn constant(field_name: &str, value: &str, target_position: u32, length: usize) -> Self {
        let mut mapping = Self::new(field_name, TransformationType::Constant, target_position, length);
        mapping.value = Some(value.to_string());
        mapping
    }

    pub fn source(field_name: &str, source_field: &str, target_position: u32, length: usize) -> Self {
        let mut mapping = Self::new(field_name, TransformationType::Source, target_position, length);
        mapping.source_field = Some(source_field.to_string());
        mapping
    }

    pub fn conditional(field_name: &str, condition: Condition, target_position: u32, length: usize) -> Self {
        let mut mapping = Self::new(field_name, TransformationType::Conditional, target_position, length);
        mapping.condition = Some(condition);
        mapping
    }

    pub fn composite(field_name: &str, parts: &[&str], target_position: u32, length: usize) -> Self {
        let mut mapping = Self::new(field_name, TransformationType::Composite, target_position, length);
        mapping.composite_parts = parts.iter().map(|p| CompositePart::parse(p)).collect();
        mapping
    }

    pub fn lookup(field_name: &str, source_field: &str, table: &[(&str, &str)], target_position: u32, length: usize) -> Self {
        let mut mapping = Self::new(field_name, TransformationType::Lookup, target_position, length);
        mapping.source_field = Some(source_field.to_string());
        mapping.lookup = table
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        mapping
    }

    pub fn with_pad(mut self, pad: Pad, pad_char: char) -> Self {
        self.pad = pad;
        self.pad_char = pad_char;
        self
    }

    pub fn with_default(mut self, default_value: &str) -> Self {
        self.default_value = Some(default_value.to_string());
        self
    }

    pub fn with_formats(mut self, data_type: DataType, source_format: &str, target_format: &str) -> Self {
        self.data_type = data_type;
        self.source_format = Some(source_format.to_string());
        self.target_format = Some(target_format.to_string());
        self
    }

    /// Key of this field in the output row.
    pub fn output_key(&self) -> &str {
        if self.field_name.is_empty() {
            self.target_field.as_deref().unwrap_or_default()
        } else {
            &self.field_name
        }
    }

    /// Default used whenever the transformation cannot be resolved.
    pub fn default_or_empty(&self) -> String {
        self.default_value.clone().unwrap_or_default()
    }

    fn validate(&self, strict_conditionals: bool) -> Result<(), ConfigurationError> {
        let invalid = |message: &str| {
            ConfigurationError::Invalid(format!("field `{}`: {}", self.output_key(), message))
        };

        if self.output_key().is_empty() {
            return Err(ConfigurationError::Invalid(format!(
                "mapping at position {} has neither fieldName nor targetField",
                self.target_position
            )));
        }

        match self.transformation_type {
            TransformationType::Source | TransformationType::Lookup if self.source_field.is_none() => {
                Err(invalid("sourceField is required"))
            }
            TransformationType::Conditional => match &self.condition {
                None => Err(invalid("conditions are required")),
                Some(condition) if strict_conditionals && !condition.has_else() => {
                    Err(invalid("conditional mapping has no else branch"))
                }
                Some(_) => Ok(()),
            },
            TransformationType::Composite if self.composite_parts.is_empty() => {
                Err(invalid("composite mapping has no parts"))
            }
            _ => Ok(()),
        }
    }
}

/// The resolved mapping configuration for one (source system, job, transaction
/// type) triple. Mappings are held sorted by `target_position`.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingSet {
    transaction_type: String,
    file_type: FileType,
    delimiter: String,
    mappings: Vec<FieldMapping>,
}

impl MappingSet {
    /// Validates and orders the mappings.
    ///
    /// Fails when the set is empty, when two mappings share a target position or
    /// an output key, or when an individual mapping is inconsistent.
    pub fn new(
        transaction_type: &str,
        file_type: FileType,
        mut mappings: Vec<FieldMapping>,
        strict_conditionals: bool,
    ) -> Result<Self, ConfigurationError> {
        if mappings.is_empty() {
            return Err(ConfigurationError::Invalid(format!(
                "mapping set for `{transaction_type}` has no field mappings"
            )));
        }

        for mapping in &mappings {
            mapping.validate(strict_conditionals)?;
        }

        mappings.sort_by_key(|m| m.target_position);

        for pair in mappings.windows(2) {
            if pair[0].target_position == pair[1].target_position {
                return Err(ConfigurationError::Invalid(format!(
                    "fields `{}` and `{}` share targetPosition {}",
                    pair[0].output_key(),
                    pair[1].output_key(),
                    pair[0].target_position
                )));
            }
        }

        let mut keys: Vec<&str> = mappings.iter().map(FieldMapping::output_key).collect();
        keys.sort_unstable();
        if let Some(pair) = keys.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigurationError::Invalid(format!(
                "field `{}` is mapped twice",
                pair[0]
            )));
        }

        Ok(Self {
            transaction_type: transaction_type.to_string(),
            file_type,
            delimiter: "|".to_string(),
            mappings,
        })
    }

    pub fn with_delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Mappings in ascending `target_position` order.
    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    pub fn get(&self, field_name: &str) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.output_key() == field_name)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Total record width for fixed-width output.
    pub fn record_width(&self) -> usize {
        self.mappings.iter().map(|m| m.length).sum()
    }
}

impl fmt::Display for MappingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {} fields)",
            self.transaction_type,
            self.file_type,
            self.mappings.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_set_orders_by_target_position() {
        let set = MappingSet::new(
            "DEPOSIT",
            FileType::FixedWidth,
            vec![
                FieldMapping::constant("B", "2", 2, 1),
                FieldMapping::constant("A", "1", 1, 1),
                FieldMapping::constant("C", "3", 10, 1),
            ],
            true,
        )
        .unwrap();

        let keys: Vec<&str> = set.mappings().iter().map(FieldMapping::output_key).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert_eq!(set.record_width(), 3);
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let result = MappingSet::new(
            "DEPOSIT",
            FileType::FixedWidth,
            vec![
                FieldMapping::constant("A", "1", 1, 1),
                FieldMapping::constant("B", "2", 1, 1),
            ],
            true,
        );

        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }

    #[test]
    fn empty_sets_are_rejected() {
        assert!(MappingSet::new("DEPOSIT", FileType::Delimited, Vec::new(), true).is_err());
    }

    #[test]
    fn conditional_without_else_rejected_only_when_strict() {
        let condition = Condition::new("STATUS = 'A'", "'ACTIVE'").unwrap();
        let mapping = FieldMapping::conditional("STATUS_DESC", condition, 1, 10);

        assert!(MappingSet::new("T", FileType::FixedWidth, vec![mapping.clone()], true).is_err());
        assert!(MappingSet::new("T", FileType::FixedWidth, vec![mapping], false).is_ok());
    }

    #[test]
    fn source_mapping_requires_source_field() {
        let mut mapping = FieldMapping::source("NAME", "CUSTOMER_NAME", 1, 10);
        mapping.source_field = None;

        assert!(MappingSet::new("T", FileType::FixedWidth, vec![mapping], true).is_err());
    }

    #[test]
    fn output_key_falls_back_to_target_field() {
        let mut mapping = FieldMapping::constant("", "X", 1, 1);
        mapping.target_field = Some("TGT".to_string());

        assert_eq!(mapping.output_key(), "TGT");
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("Conditional".parse::<TransformationType>().unwrap(), TransformationType::Conditional);
        assert_eq!("LEFT".parse::<Pad>().unwrap(), Pad::Left);
        assert_eq!("fixed-width".parse::<FileType>().unwrap(), FileType::FixedWidth);
        assert!("sideways".parse::<Pad>().is_err());
    }
}
