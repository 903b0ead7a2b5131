//! Pattern catalog: the static table of IoT backend providers.
//!
//! Each provider carries match rules (evaluated during extraction), post
//! filters (applied to the accumulated matches afterwards) and the seed
//! queries issued against DNSDB. The default catalog is embedded in the
//! binary; an alternate TOML file with the same layout may be loaded instead.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::config::{ConfigError, QuerySelection};
use crate::domain_utils;
use crate::fetch::{Query, QueryMode};

/// Embedded default catalog
pub const DEFAULT_CATALOG: &str = include_str!("../config/catalog.toml");

#[derive(Debug, Deserialize)]
struct CatalogFile {
    version: String,
    #[serde(default)]
    providers: Vec<ProviderDef>,
}

#[derive(Debug, Deserialize)]
struct ProviderDef {
    name: String,
    display_name: Option<String>,
    #[serde(default)]
    rules: Vec<RuleDef>,
    #[serde(default)]
    filters: Vec<FilterDef>,
    #[serde(default)]
    queries: Vec<Query>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RuleDef {
    Suffix {
        value: String,
        #[serde(default)]
        id: Option<String>,
    },
    Regex {
        pattern: String,
        #[serde(default)]
        id: Option<String>,
    },
    Contains {
        value: String,
        #[serde(default)]
        id: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum FilterDef {
    MustContain { value: String },
    MustNotContain { value: String },
    MustMatchAny { values: Vec<String> },
}

/// How a rule recognizes a candidate name
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Parent domain suffix, matched on label boundaries
    Suffix(String),
    /// Case-insensitive pattern anchored to a label-aligned suffix
    Regex(Regex),
    /// Case-insensitive substring
    Contains(String),
}

/// A provider-scoped match rule with a stable identity
#[derive(Debug, Clone)]
pub struct MatchRule {
    pub id: String,
    pub kind: RuleKind,
}

impl MatchRule {
    pub fn suffix(id: impl Into<String>, suffix: &str) -> Self {
        Self {
            id: id.into(),
            kind: RuleKind::Suffix(domain_utils::normalize_domain(suffix)),
        }
    }

    pub fn contains(id: impl Into<String>, needle: &str) -> Self {
        Self {
            id: id.into(),
            kind: RuleKind::Contains(needle.to_lowercase()),
        }
    }

    /// Compile a regex rule. A leading `^` or trailing `$` in `pattern` is
    /// dropped; the compiled rule only fires when the pattern covers a run of
    /// whole labels at the end of the candidate.
    pub fn regex(id: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        let id = id.into();
        let trimmed = pattern.trim();
        let trimmed = trimmed.strip_prefix('^').unwrap_or(trimmed);
        let trimmed = trimmed.strip_suffix('$').unwrap_or(trimmed);
        let anchored = format!(r"(?i)(?:^|\.)(?:{})$", trimmed);
        Ok(Self {
            id,
            kind: RuleKind::Regex(Regex::new(&anchored)?),
        })
    }

    /// Evaluate the rule against a normalized candidate name
    pub fn evaluate(&self, candidate: &str) -> bool {
        match &self.kind {
            RuleKind::Suffix(suffix) => domain_utils::has_label_suffix(candidate, suffix),
            RuleKind::Regex(re) => re.is_match(candidate),
            RuleKind::Contains(needle) => candidate.to_lowercase().contains(needle.as_str()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RuleKind::Suffix(_) => "suffix",
            RuleKind::Regex(_) => "regex",
            RuleKind::Contains(_) => "contains",
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            RuleKind::Suffix(s) => s.clone(),
            RuleKind::Regex(re) => re.as_str().to_string(),
            RuleKind::Contains(s) => s.clone(),
        }
    }
}

/// A predicate over a matched domain, applied after extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostFilter {
    MustContain(String),
    MustNotContain(String),
    MustMatchAny(Vec<String>),
}

impl PostFilter {
    /// True if `domain` satisfies the filter. Comparison is case-insensitive.
    pub fn accepts(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        match self {
            PostFilter::MustContain(s) => domain.contains(s.as_str()),
            PostFilter::MustNotContain(s) => !domain.contains(s.as_str()),
            PostFilter::MustMatchAny(set) => set.iter().any(|s| domain.contains(s.as_str())),
        }
    }
}

impl std::fmt::Display for PostFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostFilter::MustContain(s) => write!(f, "must contain '{}'", s),
            PostFilter::MustNotContain(s) => write!(f, "must not contain '{}'", s),
            PostFilter::MustMatchAny(set) => write!(f, "must contain any of {:?}", set),
        }
    }
}

/// An IoT backend provider and its rules
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub display_name: String,
    pub rules: Vec<MatchRule>,
    pub filters: Vec<PostFilter>,
    pub queries: Vec<Query>,
}

impl Provider {
    /// Id of the first rule firing on `candidate`, if any
    pub fn evaluate(&self, candidate: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.evaluate(candidate))
            .map(|rule| rule.id.as_str())
    }

    /// Seed queries for the selected mode(s)
    pub fn seed_queries(&self, selection: QuerySelection) -> impl Iterator<Item = &Query> {
        self.queries.iter().filter(move |q| match selection {
            QuerySelection::Both => true,
            QuerySelection::Basic => q.mode == QueryMode::Basic,
            QuerySelection::Flexible => q.mode == QueryMode::Flexible,
        })
    }
}

/// Immutable, versioned table of providers
#[derive(Debug, Clone)]
pub struct PatternCatalog {
    version: String,
    providers: Vec<Provider>,
}

impl PatternCatalog {
    /// The catalog compiled into the binary
    pub fn embedded() -> Result<Self, ConfigError> {
        Self::from_toml(DEFAULT_CATALOG)
    }

    /// Load a catalog file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a catalog definition
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = toml::from_str(content)?;
        if file.providers.is_empty() {
            return Err(ConfigError::EmptyCatalog);
        }

        let mut seen = HashSet::new();
        let mut providers = Vec::with_capacity(file.providers.len());
        for def in file.providers {
            let name = def.name.trim().to_lowercase();
            if name.is_empty() {
                return Err(ConfigError::EmptyRequired {
                    field: "providers[].name".to_string(),
                });
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigError::DuplicateProvider(name));
            }
            providers.push(Self::build_provider(name, def)?);
        }

        let catalog = Self {
            version: file.version,
            providers,
        };
        debug!(
            "Loaded pattern catalog {} with {} providers",
            catalog.version,
            catalog.providers.len()
        );
        Ok(catalog)
    }

    fn build_provider(name: String, def: ProviderDef) -> Result<Provider, ConfigError> {
        if def.rules.is_empty() {
            return Err(ConfigError::NoRules(name));
        }

        let non_empty = |value: &str, field: String| -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                Err(ConfigError::EmptyRequired { field })
            } else {
                Ok(())
            }
        };

        let mut rules = Vec::with_capacity(def.rules.len());
        for (index, rule) in def.rules.into_iter().enumerate() {
            let default_id = format!("{}-{}", name, index + 1);
            let field = format!("providers.{}.rules[{}]", name, index);
            let rule = match rule {
                RuleDef::Suffix { value, id } => {
                    non_empty(&value, field)?;
                    MatchRule::suffix(id.unwrap_or(default_id), &value)
                }
                RuleDef::Contains { value, id } => {
                    non_empty(&value, field)?;
                    MatchRule::contains(id.unwrap_or(default_id), &value)
                }
                RuleDef::Regex { pattern, id } => {
                    non_empty(&pattern, field.clone())?;
                    MatchRule::regex(id.unwrap_or(default_id), &pattern).map_err(|e| {
                        ConfigError::InvalidRegex {
                            pattern_name: field,
                            pattern: pattern.clone(),
                            error: e.to_string(),
                        }
                    })?
                }
            };
            rules.push(rule);
        }

        let mut filters = Vec::with_capacity(def.filters.len());
        for (index, filter) in def.filters.into_iter().enumerate() {
            let field = format!("providers.{}.filters[{}]", name, index);
            let filter = match filter {
                FilterDef::MustContain { value } => {
                    non_empty(&value, field)?;
                    PostFilter::MustContain(value.to_lowercase())
                }
                FilterDef::MustNotContain { value } => {
                    non_empty(&value, field)?;
                    PostFilter::MustNotContain(value.to_lowercase())
                }
                FilterDef::MustMatchAny { values } => {
                    if values.is_empty() {
                        return Err(ConfigError::EmptyRequired { field });
                    }
                    for value in &values {
                        non_empty(value, field.clone())?;
                    }
                    PostFilter::MustMatchAny(values.iter().map(|v| v.to_lowercase()).collect())
                }
            };
            filters.push(filter);
        }

        for (index, query) in def.queries.iter().enumerate() {
            non_empty(&query.term, format!("providers.{}.queries[{}].term", name, index))?;
        }

        Ok(Provider {
            display_name: def.display_name.unwrap_or_else(|| name.clone()),
            name,
            rules,
            filters,
            queries: def.queries,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Rules of `provider`; empty for unknown providers
    pub fn rules_for(&self, provider: &str) -> &[MatchRule] {
        self.provider(provider).map(|p| p.rules.as_slice()).unwrap_or(&[])
    }

    /// Post filters of `provider`; empty (pass-through) for unknown providers
    pub fn filters_for(&self, provider: &str) -> &[PostFilter] {
        self.provider(provider).map(|p| p.filters.as_slice()).unwrap_or(&[])
    }

    /// True if `domain` satisfies every post filter of `provider`
    pub fn passes_filters(&self, provider: &str, domain: &str) -> bool {
        self.filters_for(provider).iter().all(|f| f.accepts(domain))
    }

    /// Resolve a run's provider selection. An empty selection means every provider.
    pub fn select(&self, names: &[String]) -> Result<Vec<String>, ConfigError> {
        if names.is_empty() {
            return Ok(self.providers.iter().map(|p| p.name.clone()).collect());
        }

        let mut selected: Vec<String> = Vec::new();
        for name in names {
            let name = name.trim().to_lowercase();
            if self.provider(&name).is_none() {
                return Err(ConfigError::UnknownProvider(name));
            }
            if !selected.contains(&name) {
                selected.push(name);
            }
        }
        Ok(selected)
    }
}
