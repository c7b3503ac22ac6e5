//! Shard catalog, themes and validated SQL identifiers
//!
//! Table and database names cannot travel as bind parameters, so every name
//! that ends up inside SQL text is first wrapped in an [`Ident`], which only
//! admits lowercase ASCII identifiers.

use crate::error::{CompilerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_IDENT_LEN: usize = 63;

/// A SQL identifier that passed the allow-list: `[a-z_][a-z0-9_]*`, at most 63 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();

        if value.is_empty() {
            return Err(CompilerError::invalid_identifier(value, "empty"));
        }
        if value.len() > MAX_IDENT_LEN {
            return Err(CompilerError::invalid_identifier(value, "longer than 63 bytes"));
        }

        let mut chars = value.chars();
        let first_ok = chars
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false);
        if !first_ok {
            return Err(CompilerError::invalid_identifier(
                value,
                "must start with a lowercase letter or underscore",
            ));
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(CompilerError::invalid_identifier(
                value,
                "only lowercase letters, digits and underscores are allowed",
            ));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for interpolation into SQL text
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Ident {
    type Error = CompilerError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl std::str::FromStr for Ident {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

/// Name of a regional database. Doubles as the region label written to
/// provenance and baseline rows.
pub type ShardName = Ident;

/// Schema-qualified table reference built only from validated parts
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Ident,
    pub table: Ident,
}

impl TableRef {
    pub fn new(schema: Ident, table: Ident) -> Self {
        Self { schema, table }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema.quoted(), self.table.quoted())
    }
}

/// Reporting year, bounded to a sane range before it is used in table names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Year(i32);

impl Year {
    pub const MIN: i32 = 1900;
    pub const MAX: i32 = 2100;

    pub fn new(value: i32) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(CompilerError::invalid_identifier(
                value.to_string(),
                format!("year must be within {}..={}", Self::MIN, Self::MAX),
            ))
        }
    }

    pub fn value(self) -> i32 {
        self.0
    }

    /// Inclusive range of years, ascending
    pub fn range(from: Year, to: Year) -> impl Iterator<Item = Year> {
        (from.0..=to.0).map(Year)
    }
}

impl fmt::Display for Year {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<i32> for Year {
    type Error = CompilerError;

    fn try_from(value: i32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Year> for i32 {
    fn from(value: Year) -> Self {
        value.0
    }
}

impl std::str::FromStr for Year {
    type Err = CompilerError;

    fn from_str(s: &str) -> Result<Self> {
        let value: i32 = s
            .trim()
            .parse()
            .map_err(|_| CompilerError::invalid_identifier(s, "not a year"))?;
        Self::new(value)
    }
}

/// The two surveyed feature categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Theme {
    #[serde(rename = "current-state")]
    Current,
    #[serde(rename = "potential-state")]
    Potential,
}

impl Theme {
    pub const ALL: [Theme; 2] = [Theme::Current, Theme::Potential];

    pub fn label(self) -> &'static str {
        match self {
            Theme::Current => "current-state",
            Theme::Potential => "potential-state",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-theme table naming, derived from the configured table stems.
///
/// For stem `existing` and year 2025: source `existing_2025`, QC input
/// `existing_2025_qc`, baseline `existing_2025_baseline`, object-store
/// label `EXISTING`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeTables {
    current: Ident,
    potential: Ident,
}

impl ThemeTables {
    pub fn new(current: Ident, potential: Ident) -> Self {
        Self { current, potential }
    }

    pub fn stem(&self, theme: Theme) -> &Ident {
        match theme {
            Theme::Current => &self.current,
            Theme::Potential => &self.potential,
        }
    }

    /// Upper-case label used in object keys and artifact names
    pub fn label(&self, theme: Theme) -> String {
        self.stem(theme).as_str().to_uppercase()
    }

    pub fn data_table(&self, theme: Theme, year: Year) -> Result<Ident> {
        Ident::new(format!("{}_{}", self.stem(theme), year))
    }

    pub fn qc_table(&self, theme: Theme, year: Year) -> Result<Ident> {
        Ident::new(format!("{}_{}_qc", self.stem(theme), year))
    }

    pub fn baseline_table(&self, theme: Theme, year: Year) -> Result<Ident> {
        Ident::new(format!("{}_{}_baseline", self.stem(theme), year))
    }

    pub fn template_table(&self, theme: Theme) -> Result<Ident> {
        Ident::new(format!("{}_template", self.stem(theme)))
    }

    /// Layer name used inside tile archives and geodatabases, e.g. `EXISTING_2025`
    pub fn layer_name(&self, theme: Theme, year: Year) -> String {
        format!("{}_{}", self.label(theme), year)
    }
}

/// Static list of shard databases plus the coordination database
#[derive(Debug, Clone)]
pub struct ShardCatalog {
    coordination: Ident,
    shards: Vec<ShardName>,
}

impl ShardCatalog {
    pub fn new(coordination: Ident, shards: Vec<ShardName>) -> Result<Self> {
        if shards.is_empty() {
            return Err(CompilerError::critical("shard catalog is empty"));
        }

        let mut seen = std::collections::HashSet::new();
        for shard in &shards {
            if !seen.insert(shard) {
                return Err(CompilerError::invalid_identifier(
                    shard.as_str(),
                    "duplicate shard name",
                ));
            }
        }

        Ok(Self {
            coordination,
            shards,
        })
    }

    pub fn coordination(&self) -> &Ident {
        &self.coordination
    }

    pub fn shards(&self) -> &[ShardName] {
        &self.shards
    }

    /// Restrict the catalog to the named shards, keeping catalog order
    pub fn only(&self, names: &[ShardName]) -> Result<Self> {
        let shards: Vec<ShardName> = self
            .shards
            .iter()
            .filter(|s| names.contains(s))
            .cloned()
            .collect();
        for name in names {
            if !self.shards.contains(name) {
                return Err(CompilerError::invalid_identifier(
                    name.as_str(),
                    "not in shard catalog",
                ));
            }
        }
        Self::new(self.coordination.clone(), shards)
    }
}
