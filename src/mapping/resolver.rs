//! Resolution of mapping sets from stored JSON configuration or packaged
//! YAML templates, with a process-local cache.
//!
//! Two paths produce the same [`MappingSet`]:
//!
//! 1. **Dynamic**: a `config_id` is supplied and the [`JobConfigurationStore`]
//!    holds a JSON document for it:
//!
//!    ```json
//!    { "transactionType": "DEPOSIT", "fileType": "FIXED_WIDTH",
//!      "fieldMappings": [ { "fieldName": "STATUS_DESC", "transformationType": "conditional",
//!                           "targetPosition": 1, "length": 10,
//!                           "conditions": [ { "ifExpr": "STATUS = 'A'", "then": "ACTIVE",
//!                                             "elseExpr": "INACTIVE" } ] } ] }
//!    ```
//!
//! 2. **Static**: a YAML template found by the [`TemplateSource`] under
//!    `{source_system}/{job}/{transaction_type}.yml`, with fields keyed by name.
//!
//! Cached entries live until the configured TTL elapses, until the cache
//! generation is bumped, or until a [`ConfigurationChange`] evicts them.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::{error::ConfigurationError, BatchError};

use super::{
    condition::{BranchValue, Condition, Expression},
    field::{CompositePart, DataType, FieldMapping, FileType, MappingSet, Pad, TransformationType},
    transformer::check_date_pattern,
};

/// Source of stored job configuration rows.
pub trait JobConfigurationStore: Send + Sync {
    /// Raw JSON payload stored against `config_id`, if any.
    fn fetch(&self, config_id: &str) -> Result<Option<String>, BatchError>;
}

/// Source of packaged static templates.
pub trait TemplateSource: Send + Sync {
    /// Raw YAML template for the triple, if one is packaged.
    fn load(&self, source_system: &str, job: &str, transaction_type: &str) -> Result<Option<String>, BatchError>;
}

/// Relative template path for a triple: `{source_system}/{job}/{transaction_type}.yml`.
pub fn template_path(source_system: &str, job: &str, transaction_type: &str) -> PathBuf {
    Path::new(source_system)
        .join(job)
        .join(format!("{transaction_type}.yml"))
}

/// Templates stored as files below a root directory.
pub struct FileTemplateSource {
    root: PathBuf,
}

impl FileTemplateSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl TemplateSource for FileTemplateSource {
    fn load(&self, source_system: &str, job: &str, transaction_type: &str) -> Result<Option<String>, BatchError> {
        let path = self.root.join(template_path(source_system, job, transaction_type));
        if !path.is_file() {
            debug!("No template at {}", path.display());
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }
}

/// Change notification emitted by a configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationChange {
    /// A stored configuration row was inserted or updated.
    Updated { config_id: String },
    /// A stored configuration row was removed.
    Deleted { config_id: String },
    /// Packaged templates were redeployed.
    TemplatesReloaded,
}

/// Receiver of [`ConfigurationChange`] events.
pub trait ConfigurationChangeListener: Send + Sync {
    fn on_change(&self, change: &ConfigurationChange);
}

/// What to resolve: the triple plus an optional stored configuration id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveRequest {
    pub source_system: String,
    pub job: String,
    pub transaction_type: String,
    pub config_id: Option<String>,
}

impl ResolveRequest {
    pub fn new(source_system: &str, job: &str, transaction_type: &str) -> Self {
        Self {
            source_system: source_system.to_string(),
            job: job.to_string(),
            transaction_type: transaction_type.to_string(),
            config_id: None,
        }
    }

    pub fn with_config_id(mut self, config_id: &str) -> Self {
        self.config_id = Some(config_id.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheOrigin {
    Stored(String),
    Template(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    origin: CacheOrigin,
    transaction_type: String,
}

struct CacheEntry {
    mapping_set: Arc<MappingSet>,
    generation: u64,
    inserted_at: Instant,
}

/// Resolved mapping sets keyed by configuration origin and transaction type.
///
/// Concurrent misses on the same key may both resolve; the first insert wins
/// and later ones return the cached value.
pub struct MappingCache {
    entries: DashMap<CacheKey, CacheEntry>,
    generation: AtomicU64,
    ttl: Option<Duration>,
}

impl MappingCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Arc<MappingSet>> {
        let generation = self.generation.load(Ordering::Acquire);
        let fresh = {
            let entry = self.entries.get(key)?;
            let expired = self.ttl.is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl);
            if entry.generation == generation && !expired {
                Some(Arc::clone(&entry.mapping_set))
            } else {
                None
            }
        };
        if fresh.is_none() {
            self.entries.remove(key);
        }
        fresh
    }

    fn insert_if_absent(&self, key: CacheKey, mapping_set: Arc<MappingSet>) -> Arc<MappingSet> {
        let generation = self.generation.load(Ordering::Acquire);
        let entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            mapping_set,
            generation,
            inserted_at: Instant::now(),
        });
        Arc::clone(&entry.mapping_set)
    }

    /// Invalidates every entry without walking the map.
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn evict_stored(&self, config_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !matches!(&key.origin, CacheOrigin::Stored(id) if id == config_id));
        before - self.entries.len()
    }

    fn evict_templates(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !matches!(key.origin, CacheOrigin::Template(_)));
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.bump_generation();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Loads and caches mapping sets.
///
/// ```
/// use std::sync::Arc;
/// use etl_batch_rs::mapping::resolver::{ConfigurationResolverBuilder, JobConfigurationStore, ResolveRequest};
/// use etl_batch_rs::BatchError;
///
/// struct Store;
/// impl JobConfigurationStore for Store {
///     fn fetch(&self, _config_id: &str) -> Result<Option<String>, BatchError> {
///         Ok(Some(r#"{"transactionType":"DEPOSIT","fieldMappings":[
///             {"fieldName":"TYPE","transformationType":"constant","value":"D","targetPosition":1,"length":1}
///         ]}"#.to_string()))
///     }
/// }
///
/// let resolver = ConfigurationResolverBuilder::new()
///     .job_store(Arc::new(Store))
///     .build();
///
/// let request = ResolveRequest::new("CORE", "LOAD_TXN", "DEPOSIT").with_config_id("42");
/// let mapping_set = resolver.resolve(&request).unwrap();
/// assert_eq!(mapping_set.len(), 1);
/// ```
pub struct ConfigurationResolver {
    job_store: Option<Arc<dyn JobConfigurationStore>>,
    templates: Option<Arc<dyn TemplateSource>>,
    cache: MappingCache,
    strict_conditionals: bool,
    default_delimiter: Option<String>,
}

impl ConfigurationResolver {
    /// Resolves a mapping set, from the cache when possible.
    ///
    /// The stored configuration is tried first when a `config_id` is given;
    /// the static template is the fallback.
    ///
    /// # Errors
    /// - `ConfigurationError::NotFound` when neither source has a configuration
    /// - `ConfigurationError::Parse` / `Invalid` when the configuration is unusable
    pub fn resolve(&self, request: &ResolveRequest) -> Result<Arc<MappingSet>, BatchError> {
        if let Some(config_id) = &request.config_id {
            let key = CacheKey {
                origin: CacheOrigin::Stored(config_id.clone()),
                transaction_type: request.transaction_type.clone(),
            };
            if let Some(hit) = self.cache.get(&key) {
                return Ok(hit);
            }
            if let Some(mapping_set) = self.load_stored(config_id, &request.transaction_type)? {
                info!("Resolved {} from stored configuration {}", mapping_set, config_id);
                return Ok(self.cache.insert_if_absent(key, Arc::new(mapping_set)));
            }
            debug!("No stored configuration {}, trying static template", config_id);
        }

        let template_key = template_path(&request.source_system, &request.job, &request.transaction_type)
            .to_string_lossy()
            .replace('\\', "/");
        let key = CacheKey {
            origin: CacheOrigin::Template(template_key.clone()),
            transaction_type: request.transaction_type.clone(),
        };
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let raw = match &self.templates {
            Some(templates) => templates.load(&request.source_system, &request.job, &request.transaction_type)?,
            None => None,
        };

        let Some(raw) = raw else {
            return Err(ConfigurationError::NotFound {
                source_system: request.source_system.clone(),
                job: request.job.clone(),
                transaction_type: request.transaction_type.clone(),
            }
            .into());
        };

        let mapping_set = yaml_template(
            &raw,
            &request.transaction_type,
            self.strict_conditionals,
            self.default_delimiter.as_deref(),
        )?;
        info!("Resolved {} from template {}", mapping_set, template_key);
        Ok(self.cache.insert_if_absent(key, Arc::new(mapping_set)))
    }

    fn load_stored(&self, config_id: &str, transaction_type: &str) -> Result<Option<MappingSet>, BatchError> {
        let Some(store) = &self.job_store else {
            return Ok(None);
        };
        match store.fetch(config_id)? {
            Some(raw) => Ok(Some(json_configuration(
                &raw,
                transaction_type,
                self.strict_conditionals,
                self.default_delimiter.as_deref(),
            )?)),
            None => Ok(None),
        }
    }

    /// Drops every cached mapping set.
    pub fn clear_cache(&self) {
        info!("Clearing mapping cache ({} entries)", self.cache.len());
        self.cache.clear();
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }
}

impl ConfigurationChangeListener for ConfigurationResolver {
    fn on_change(&self, change: &ConfigurationChange) {
        let evicted = match change {
            ConfigurationChange::Updated { config_id } | ConfigurationChange::Deleted { config_id } => {
                self.cache.evict_stored(config_id)
            }
            ConfigurationChange::TemplatesReloaded => self.cache.evict_templates(),
        };
        info!("Configuration change {:?} evicted {} cached mapping sets", change, evicted);
    }
}

pub struct ConfigurationResolverBuilder {
    job_store: Option<Arc<dyn JobConfigurationStore>>,
    templates: Option<Arc<dyn TemplateSource>>,
    ttl: Option<Duration>,
    strict_conditionals: bool,
    default_delimiter: Option<String>,
}

impl Default for ConfigurationResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationResolverBuilder {
    pub fn new() -> Self {
        Self {
            job_store: None,
            templates: None,
            ttl: None,
            strict_conditionals: true,
            default_delimiter: None,
        }
    }

    pub fn job_store(mut self, store: Arc<dyn JobConfigurationStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn templates(mut self, templates: Arc<dyn TemplateSource>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn template_root<P: AsRef<Path>>(self, root: P) -> Self {
        self.templates(Arc::new(FileTemplateSource::new(root)))
    }

    /// Maximum age of a cached mapping set; `None` keeps entries until invalidated.
    pub fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Reject CONDITIONAL mappings that have no `else` branch (default: on).
    pub fn strict_conditionals(mut self, strict: bool) -> Self {
        self.strict_conditionals = strict;
        self
    }

    /// Delimiter for DELIMITED mapping sets that do not name their own.
    pub fn default_delimiter(mut self, delimiter: &str) -> Self {
        self.default_delimiter = Some(delimiter.to_string());
        self
    }

    pub fn build(self) -> ConfigurationResolver {
        if self.job_store.is_none() && self.templates.is_none() {
            warn!("Configuration resolver built without any configuration source");
        }
        ConfigurationResolver {
            job_store: self.job_store,
            templates: self.templates,
            cache: MappingCache::new(self.ttl),
            strict_conditionals: self.strict_conditionals,
            default_delimiter: self.default_delimiter,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCondition {
    if_expr: String,
    then: String,
    #[serde(default)]
    else_if_exprs: Vec<RawCondition>,
    else_expr: Option<String>,
}

impl RawCondition {
    fn into_condition(self) -> Result<Condition, ConfigurationError> {
        let else_ifs = self
            .else_if_exprs
            .into_iter()
            .map(RawCondition::into_condition)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Condition {
            if_expr: Expression::parse(&self.if_expr)?,
            if_source: self.if_expr,
            then: BranchValue::parse(&self.then),
            else_ifs,
            else_value: self.else_expr.as_deref().map(BranchValue::parse),
        })
    }
}

/// One field as described in JSON or YAML; everything is optional so that
/// missing required fields produce a configuration error rather than a parse error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldDescriptor {
    field_name: Option<String>,
    transformation_type: Option<String>,
    length: Option<i64>,
    target_position: Option<i64>,
    value: Option<String>,
    source_field: Option<String>,
    target_field: Option<String>,
    format: Option<String>,
    default_value: Option<String>,
    pad: Option<String>,
    pad_char: Option<String>,
    data_type: Option<String>,
    source_format: Option<String>,
    target_format: Option<String>,
    #[serde(default)]
    composite: bool,
    #[serde(default)]
    composite_parts: Vec<String>,
    #[serde(default)]
    conditions: Vec<RawCondition>,
    #[serde(default)]
    lookup: BTreeMap<String, String>,
}

impl FieldDescriptor {
    fn into_mapping(self, index: usize) -> Result<FieldMapping, ConfigurationError> {
        let label = self
            .field_name
            .clone()
            .or_else(|| self.target_field.clone())
            .unwrap_or_else(|| format!("#{index}"));
        let missing = |what: &str| ConfigurationError::Invalid(format!("field `{label}`: {what} is required"));

        let field_name = self.field_name.clone().ok_or_else(|| missing("fieldName"))?;
        let transformation_type: TransformationType = self
            .transformation_type
            .as_deref()
            .ok_or_else(|| missing("transformationType"))?
            .parse()?;
        let target_position = self.target_position.ok_or_else(|| missing("targetPosition"))?;
        let target_position = u32::try_from(target_position).map_err(|_| {
            ConfigurationError::Invalid(format!("field `{label}`: targetPosition {target_position} is out of range"))
        })?;
        let length = usize::try_from(self.length.unwrap_or(0))
            .map_err(|_| ConfigurationError::Invalid(format!("field `{label}`: length must be >= 0")))?;

        let pad = self.pad.as_deref().map(str::parse::<Pad>).transpose()?.unwrap_or_default();
        let pad_char = match self.pad_char.as_deref() {
            None => ' ',
            Some(text) => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(ConfigurationError::Invalid(format!(
                            "field `{label}`: padChar `{text}` must be a single character"
                        )))
                    }
                }
            }
        };
        let data_type = self
            .data_type
            .as_deref()
            .map(str::parse::<DataType>)
            .transpose()?
            .unwrap_or_default();
        if data_type == DataType::Date {
            for pattern in [&self.source_format, &self.target_format].into_iter().flatten() {
                check_date_pattern(pattern)
                    .map_err(|message| ConfigurationError::Invalid(format!("field `{label}`: {message}")))?;
            }
        }

        if self.conditions.len() > 1 {
            return Err(ConfigurationError::Invalid(format!(
                "field `{label}`: {} conditions given; chain further branches with elseIfExprs",
                self.conditions.len()
            )));
        }
        let condition = self
            .conditions
            .into_iter()
            .next()
            .map(RawCondition::into_condition)
            .transpose()?;

        Ok(FieldMapping {
            field_name,
            source_field: self.source_field,
            target_field: self.target_field,
            transformation_type,
            value: self.value,
            target_position,
            length,
            pad,
            pad_char,
            default_value: self.default_value,
            data_type,
            format: self.format,
            source_format: self.source_format,
            target_format: self.target_format,
            composite: self.composite || transformation_type == TransformationType::Composite,
            composite_parts: self.composite_parts.iter().map(|p| CompositePart::parse(p)).collect(),
            condition,
            lookup: self.lookup,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonConfiguration {
    transaction_type: Option<String>,
    file_type: Option<String>,
    delimiter: Option<String>,
    #[serde(default)]
    field_mappings: Vec<FieldDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct YamlTemplate {
    transaction_type: Option<String>,
    file_type: Option<String>,
    delimiter: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, FieldDescriptor>,
}

fn build_mapping_set(
    transaction_type: &str,
    file_type: Option<&str>,
    delimiter: Option<String>,
    descriptors: Vec<FieldDescriptor>,
    strict_conditionals: bool,
) -> Result<MappingSet, ConfigurationError> {
    let file_type = file_type.map(str::parse::<FileType>).transpose()?.unwrap_or_default();
    let mappings = descriptors
        .into_iter()
        .enumerate()
        .map(|(index, descriptor)| descriptor.into_mapping(index))
        .collect::<Result<Vec<_>, _>>()?;

    let mapping_set = MappingSet::new(transaction_type, file_type, mappings, strict_conditionals)?;
    Ok(match delimiter {
        Some(delimiter) => mapping_set.with_delimiter(&delimiter),
        None => mapping_set,
    })
}

/// Parses a stored JSON configuration document.
///
/// `transaction_type` is used when the document does not name one.
pub fn parse_json_configuration(
    raw: &str,
    transaction_type: &str,
    strict_conditionals: bool,
) -> Result<MappingSet, ConfigurationError> {
    json_configuration(raw, transaction_type, strict_conditionals, None)
}

fn json_configuration(
    raw: &str,
    transaction_type: &str,
    strict_conditionals: bool,
    default_delimiter: Option<&str>,
) -> Result<MappingSet, ConfigurationError> {
    let document: JsonConfiguration =
        serde_json::from_str(raw).map_err(|e| ConfigurationError::Parse(e.to_string()))?;

    let transaction_type = document.transaction_type.as_deref().unwrap_or(transaction_type);
    build_mapping_set(
        transaction_type,
        document.file_type.as_deref(),
        document.delimiter.or_else(|| default_delimiter.map(str::to_string)),
        document.field_mappings,
        strict_conditionals,
    )
}

/// Parses a YAML template. Map keys supply `fieldName` when it is omitted.
pub fn parse_yaml_template(
    raw: &str,
    transaction_type: &str,
    strict_conditionals: bool,
) -> Result<MappingSet, ConfigurationError> {
    yaml_template(raw, transaction_type, strict_conditionals, None)
}

fn yaml_template(
    raw: &str,
    transaction_type: &str,
    strict_conditionals: bool,
    default_delimiter: Option<&str>,
) -> Result<MappingSet, ConfigurationError> {
    let template: YamlTemplate =
        serde_yaml::from_str(raw).map_err(|e| ConfigurationError::Parse(e.to_string()))?;

    let descriptors = template
        .fields
        .into_iter()
        .map(|(name, mut descriptor)| {
            descriptor.field_name.get_or_insert(name);
            descriptor
        })
        .collect();

    let transaction_type = template.transaction_type.as_deref().unwrap_or(transaction_type);
    build_mapping_set(
        transaction_type,
        template.file_type.as_deref(),
        template.delimiter.or_else(|| default_delimiter.map(str::to_string)),
        descriptors,
        strict_conditionals,
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::mapping::record::Record;

    const DEPOSIT_JSON: &str = r#"{
        "transactionType": "DEPOSIT",
        "fileType": "FIXED_WIDTH",
        "fieldMappings": [
            {"fieldName": "AMOUNT", "transformationType": "source", "sourceField": "AMT",
             "targetPosition": 2, "length": 6, "pad": "left", "padChar": "0"},
            {"fieldName": "STATUS_DESC", "transformationType": "conditional",
             "targetPosition": 1, "length": 10,
             "conditions": [{"ifExpr": "STATUS = 'A'", "then": "'ACTIVE'",
                             "elseIfExprs": [{"ifExpr": "STATUS = 'C'", "then": "'CLOSED'"}],
                             "elseExpr": "'INACTIVE'"}]}
        ]
    }"#;

    struct CountingStore {
        payloads: Mutex<BTreeMap<String, String>>,
        fetches: AtomicUsize,
    }

    impl CountingStore {
        fn with(config_id: &str, payload: &str) -> Self {
            let mut payloads = BTreeMap::new();
            payloads.insert(config_id.to_string(), payload.to_string());
            Self {
                payloads: Mutex::new(payloads),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    impl JobConfigurationStore for CountingStore {
        fn fetch(&self, config_id: &str) -> Result<Option<String>, BatchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.payloads.lock().unwrap().get(config_id).cloned())
        }
    }

    #[test]
    fn json_configuration_applies_defaults() {
        let set = parse_json_configuration(DEPOSIT_JSON, "IGNORED", true).unwrap();

        assert_eq!(set.transaction_type(), "DEPOSIT");
        let status = set.get("STATUS_DESC").unwrap();
        assert_eq!(status.pad, Pad::Right);
        assert_eq!(status.pad_char, ' ');
        assert_eq!(status.data_type, DataType::String);

        let amount = set.get("AMOUNT").unwrap();
        assert_eq!(amount.pad, Pad::Left);
        assert_eq!(amount.pad_char, '0');
        assert_eq!(set.mappings()[0].field_name, "STATUS_DESC");
    }

    #[test]
    fn conditions_are_parsed_at_resolution_time() {
        let set = parse_json_configuration(DEPOSIT_JSON, "DEPOSIT", true).unwrap();
        let condition = set.get("STATUS_DESC").unwrap().condition.as_ref().unwrap();

        assert_eq!(condition.else_ifs.len(), 1);
        let closed = Record::new().with("STATUS", "C");
        assert_eq!(condition.evaluate(&closed), Some("CLOSED".to_string()));
    }

    #[test]
    fn missing_required_fields_are_invalid() {
        let no_position = r#"{"fieldMappings":[{"fieldName":"A","transformationType":"constant","length":1}]}"#;
        let no_type = r#"{"fieldMappings":[{"fieldName":"A","targetPosition":1,"length":1}]}"#;
        let no_name = r#"{"fieldMappings":[{"transformationType":"constant","targetPosition":1}]}"#;

        for raw in [no_position, no_type, no_name] {
            assert!(matches!(
                parse_json_configuration(raw, "T", true),
                Err(ConfigurationError::Invalid(_))
            ));
        }
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            parse_json_configuration("{ not json", "T", true),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn bad_pad_char_and_negative_length_are_invalid() {
        let pad_char = r#"{"fieldMappings":[{"fieldName":"A","transformationType":"constant","targetPosition":1,"length":2,"padChar":"ab"}]}"#;
        let length = r#"{"fieldMappings":[{"fieldName":"A","transformationType":"constant","targetPosition":1,"length":-1}]}"#;

        assert!(parse_json_configuration(pad_char, "T", true).is_err());
        assert!(parse_json_configuration(length, "T", true).is_err());
    }

    #[test]
    fn conditional_without_else_fails_fast_when_strict() {
        let raw = r#"{"fieldMappings":[{"fieldName":"S","transformationType":"conditional","targetPosition":1,"length":1,
                      "conditions":[{"ifExpr":"A = 'B'","then":"'X'"}]}]}"#;

        assert!(parse_json_configuration(raw, "T", true).is_err());
        assert!(parse_json_configuration(raw, "T", false).is_ok());
    }

    #[test]
    fn date_patterns_are_validated_at_resolution() {
        let bad = r#"{"fieldMappings":[{"fieldName":"D","transformationType":"source","targetPosition":1,"length":8,
                      "dataType":"date","sourceFormat":"yyyy-MM-dd","targetFormat":"%Y%Q"}]}"#;
        let timestamp = r#"{"fieldMappings":[{"fieldName":"D","transformationType":"source","targetPosition":1,"length":14,
                      "dataType":"date","sourceFormat":"yyyy-MM-dd","targetFormat":"yyyyMMddHHmmss"}]}"#;

        assert!(matches!(
            parse_json_configuration(bad, "T", true),
            Err(ConfigurationError::Invalid(message)) if message.contains("%Y%Q")
        ));
        assert!(parse_json_configuration(timestamp, "T", true).is_ok());
    }

    #[test]
    fn more_than_one_condition_entry_is_invalid() {
        let raw = r#"{"fieldMappings":[{"fieldName":"S","transformationType":"conditional","targetPosition":1,"length":1,
                      "conditions":[{"ifExpr":"A = 'B'","then":"'X'","elseExpr":"'Z'"},
                                    {"ifExpr":"A = 'C'","then":"'Y'","elseExpr":"'Z'"}]}]}"#;

        assert!(matches!(
            parse_json_configuration(raw, "T", true),
            Err(ConfigurationError::Invalid(message)) if message.contains("elseIfExprs")
        ));
    }

    #[test]
    fn yaml_template_keys_supply_field_names() {
        let raw = "
transactionType: WITHDRAWAL
fileType: DELIMITED
delimiter: ';'
fields:
  ACCOUNT:
    transformationType: source
    sourceField: ACCT_NO
    targetPosition: 1
    length: 10
  REF:
    transformationType: composite
    compositeParts: [\"'W-'\", ACCT_NO]
    targetPosition: 2
    length: 12
";
        let set = parse_yaml_template(raw, "WITHDRAWAL", true).unwrap();

        assert_eq!(set.file_type(), FileType::Delimited);
        assert_eq!(set.delimiter(), ";");
        assert_eq!(set.mappings()[0].field_name, "ACCOUNT");
        assert!(set.get("REF").unwrap().composite);
    }

    #[test]
    fn stored_configuration_is_cached() {
        let store = Arc::new(CountingStore::with("7", DEPOSIT_JSON));
        let resolver = ConfigurationResolverBuilder::new().job_store(store.clone()).build();
        let request = ResolveRequest::new("CORE", "LOAD", "DEPOSIT").with_config_id("7");

        let first = resolver.resolve(&request).unwrap();
        let second = resolver.resolve(&request).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn change_events_and_clear_cache_evict() {
        let store = Arc::new(CountingStore::with("7", DEPOSIT_JSON));
        let resolver = ConfigurationResolverBuilder::new().job_store(store.clone()).build();
        let request = ResolveRequest::new("CORE", "LOAD", "DEPOSIT").with_config_id("7");

        resolver.resolve(&request).unwrap();
        resolver.on_change(&ConfigurationChange::Updated {
            config_id: "8".to_string(),
        });
        resolver.resolve(&request).unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);

        resolver.on_change(&ConfigurationChange::Updated {
            config_id: "7".to_string(),
        });
        resolver.resolve(&request).unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);

        resolver.clear_cache();
        resolver.resolve(&request).unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn generation_bump_invalidates_without_eviction() {
        let store = Arc::new(CountingStore::with("7", DEPOSIT_JSON));
        let resolver = ConfigurationResolverBuilder::new().job_store(store.clone()).build();
        let request = ResolveRequest::new("CORE", "LOAD", "DEPOSIT").with_config_id("7");

        resolver.resolve(&request).unwrap();
        resolver.cache().bump_generation();
        resolver.resolve(&request).unwrap();

        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zero_ttl_never_serves_from_cache() {
        let store = Arc::new(CountingStore::with("7", DEPOSIT_JSON));
        let resolver = ConfigurationResolverBuilder::new()
            .job_store(store.clone())
            .cache_ttl(Some(Duration::ZERO))
            .build();
        let request = ResolveRequest::new("CORE", "LOAD", "DEPOSIT").with_config_id("7");

        resolver.resolve(&request).unwrap();
        resolver.resolve(&request).unwrap();

        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nothing_found_is_not_found() {
        let store = Arc::new(CountingStore::with("7", DEPOSIT_JSON));
        let resolver = ConfigurationResolverBuilder::new().job_store(store).build();
        let request = ResolveRequest::new("CORE", "LOAD", "DEPOSIT").with_config_id("unknown");

        assert!(matches!(
            resolver.resolve(&request),
            Err(BatchError::Configuration(ConfigurationError::NotFound { .. }))
        ));
    }

    #[test]
    fn default_delimiter_applies_only_when_unnamed() {
        let unnamed = r#"{"fileType": "DELIMITED", "fieldMappings": [
            {"fieldName": "A", "transformationType": "constant", "value": "x", "targetPosition": 1, "length": 1}
        ]}"#;
        let named = unnamed.replace(r#""fileType""#, r#""delimiter": ";", "fileType""#);
        let store = Arc::new(CountingStore::with("1", unnamed));
        store.payloads.lock().unwrap().insert("2".to_string(), named);
        let resolver = ConfigurationResolverBuilder::new()
            .job_store(store)
            .default_delimiter(",")
            .build();

        let first = resolver
            .resolve(&ResolveRequest::new("CORE", "LOAD", "FEE").with_config_id("1"))
            .unwrap();
        let second = resolver
            .resolve(&ResolveRequest::new("CORE", "LOAD", "FEE").with_config_id("2"))
            .unwrap();

        assert_eq!(first.delimiter(), ",");
        assert_eq!(second.delimiter(), ";");
    }

    #[test]
    fn template_path_follows_naming_convention() {
        assert_eq!(
            template_path("HR", "LOAD_EMP", "HIRE"),
            PathBuf::from("HR").join("LOAD_EMP").join("HIRE.yml")
        );
    }
}
