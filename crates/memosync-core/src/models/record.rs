//! Record model: memos and categories

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::{next_timestamp, now_millis};

/// Prefix marking a locally assigned id the server has not replaced yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Identifier of a record.
///
/// Locally created records get a `temp-` prefixed UUID v7 until the server
/// assigns a canonical id on first successful push.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new temporary id
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Wrap an existing id (canonical or temporary)
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was assigned locally and awaits a canonical id
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("record id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The two record variants the engine synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Memo,
    Category,
}

impl EntityKind {
    pub const ALL: [Self; 2] = [Self::Memo, Self::Category];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memo => "memo",
            Self::Category => "category",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memo" => Ok(Self::Memo),
            "category" => Ok(Self::Category),
            other => Err(Error::InvalidInput(format!("unknown entity kind: {other}"))),
        }
    }
}

/// Synchronization state of a local record.
///
/// `Conflict` supersedes `Pending`: a record flagged as conflicting stays
/// flagged until the conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    #[default]
    Pending,
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// A user-editable field of a record body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Content,
    CategoryId,
    Tags,
    Name,
    Color,
}

const MEMO_FIELDS: &[Field] = &[Field::Title, Field::Content, Field::CategoryId, Field::Tags];
const CATEGORY_FIELDS: &[Field] = &[Field::Name, Field::Color];

/// A memo
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    pub title: String,
    pub content: String,
    /// Owning category; may still be a temporary id
    #[serde(default)]
    pub category_id: Option<RecordId>,
    /// Tags, stored lowercase
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Memo {
    #[must_use]
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            category_id: None,
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_category(mut self, category_id: RecordId) -> Self {
        self.category_id = Some(category_id);
        self
    }

    /// Add tags, normalized to trimmed lowercase with empties dropped
    #[must_use]
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.tags.extend(
            tags.into_iter()
                .map(|tag| tag.as_ref().trim().trim_start_matches('#').to_lowercase())
                .filter(|tag| !tag.is_empty()),
        );
        self
    }
}

/// A category (only `name` and `color` are mutable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    /// `#rrggbb` hex color
    pub color: String,
}

impl Category {
    #[must_use]
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Variant-specific content of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordBody {
    Memo(Memo),
    Category(Category),
}

impl RecordBody {
    pub const fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Memo(_) => EntityKind::Memo,
            Self::Category(_) => EntityKind::Category,
        }
    }

    /// The user-editable fields of this variant
    pub const fn fields(&self) -> &'static [Field] {
        match self {
            Self::Memo(_) => MEMO_FIELDS,
            Self::Category(_) => CATEGORY_FIELDS,
        }
    }

    /// Fields whose values differ between `self` and `other`.
    ///
    /// Bodies of different variants differ in every field of both.
    pub fn changed_fields(&self, other: &Self) -> BTreeSet<Field> {
        match (self, other) {
            (Self::Memo(a), Self::Memo(b)) => {
                let mut changed = BTreeSet::new();
                if a.title != b.title {
                    changed.insert(Field::Title);
                }
                if a.content != b.content {
                    changed.insert(Field::Content);
                }
                if a.category_id != b.category_id {
                    changed.insert(Field::CategoryId);
                }
                if a.tags != b.tags {
                    changed.insert(Field::Tags);
                }
                changed
            }
            (Self::Category(a), Self::Category(b)) => {
                let mut changed = BTreeSet::new();
                if a.name != b.name {
                    changed.insert(Field::Name);
                }
                if a.color != b.color {
                    changed.insert(Field::Color);
                }
                changed
            }
            _ => self.fields().iter().chain(other.fields()).copied().collect(),
        }
    }

    /// Overwrite one field with the value held by `source`.
    ///
    /// No-op when the variants differ or the field does not belong to them.
    pub fn copy_field(&mut self, source: &Self, field: Field) {
        match (self, source) {
            (Self::Memo(target), Self::Memo(source)) => match field {
                Field::Title => target.title.clone_from(&source.title),
                Field::Content => target.content.clone_from(&source.content),
                Field::CategoryId => target.category_id.clone_from(&source.category_id),
                Field::Tags => target.tags.clone_from(&source.tags),
                Field::Name | Field::Color => {}
            },
            (Self::Category(target), Self::Category(source)) => match field {
                Field::Name => target.name.clone_from(&source.name),
                Field::Color => target.color.clone_from(&source.color),
                _ => {}
            },
            _ => {}
        }
    }

    /// Add every tag of `other` to this body's tags (memos only)
    pub fn union_tags(&mut self, other: &Self) {
        if let (Self::Memo(target), Self::Memo(source)) = (self, other) {
            target.tags.extend(source.tags.iter().cloned());
        }
    }

    /// The record this body points at, if any
    pub const fn foreign_key(&self) -> Option<&RecordId> {
        match self {
            Self::Memo(memo) => memo.category_id.as_ref(),
            Self::Category(_) => None,
        }
    }

    /// Whether this body holds a foreign key to `id`
    pub fn references(&self, id: &RecordId) -> bool {
        self.foreign_key() == Some(id)
    }

    /// Rewrite a foreign key from `from` to `to`. Returns whether anything changed.
    pub fn remap_reference(&mut self, from: &RecordId, to: &RecordId) -> bool {
        match self {
            Self::Memo(memo) if memo.category_id.as_ref() == Some(from) => {
                memo.category_id = Some(to.clone());
                true
            }
            _ => false,
        }
    }

    /// Validate user-provided content
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Memo(memo) => {
                if memo.title.trim().is_empty() && memo.content.trim().is_empty() {
                    return Err(Error::InvalidInput(
                        "memo needs a title or content".into(),
                    ));
                }
                Ok(())
            }
            Self::Category(category) => {
                if category.name.trim().is_empty() {
                    return Err(Error::InvalidInput("category name cannot be empty".into()));
                }
                if !is_hex_color(&category.color) {
                    return Err(Error::InvalidInput(format!(
                        "category color must look like #rrggbb, got {}",
                        category.color
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A synchronized record with its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub body: RecordBody,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms), strictly increasing per record
    pub updated_at: i64,
    /// When this record last matched the server (Unix ms)
    #[serde(default)]
    pub last_sync_at: Option<i64>,
    /// Soft delete flag, kept until the delete reaches the server
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Incremented on every local write
    #[serde(default)]
    pub sync_version: i64,
}

impl Record {
    /// Create a new local record with a temporary id
    #[must_use]
    pub fn new(body: RecordBody) -> Self {
        Self::with_id(RecordId::temporary(), body)
    }

    /// Create a new local record with the given id
    #[must_use]
    pub fn with_id(id: RecordId, body: RecordBody) -> Self {
        let now = now_millis();
        Self {
            id,
            body,
            created_at: now,
            updated_at: now,
            last_sync_at: None,
            is_deleted: false,
            sync_status: SyncStatus::Pending,
            sync_version: 1,
        }
    }

    pub const fn entity_kind(&self) -> EntityKind {
        self.body.entity_kind()
    }

    pub const fn memo(&self) -> Option<&Memo> {
        match &self.body {
            RecordBody::Memo(memo) => Some(memo),
            RecordBody::Category(_) => None,
        }
    }

    pub const fn category(&self) -> Option<&Category> {
        match &self.body {
            RecordBody::Category(category) => Some(category),
            RecordBody::Memo(_) => None,
        }
    }

    /// Structural diff over user fields; bookkeeping is ignored
    pub fn changed_fields(&self, other: &Self) -> BTreeSet<Field> {
        self.body.changed_fields(&other.body)
    }

    /// Whether both snapshots carry the same user-visible state
    pub fn same_content(&self, other: &Self) -> bool {
        self.body == other.body && self.is_deleted == other.is_deleted
    }

    /// Mark a local write: bump `updated_at` and `sync_version`
    pub fn touch(&mut self) {
        self.updated_at = next_timestamp(self.updated_at);
        self.sync_version += 1;
    }

    /// Short human-readable label
    pub fn title_preview(&self, max_len: usize) -> String {
        let text = match &self.body {
            RecordBody::Memo(memo) if !memo.title.trim().is_empty() => memo.title.as_str(),
            RecordBody::Memo(memo) => memo.content.lines().next().unwrap_or(""),
            RecordBody::Category(category) => category.name.as_str(),
        };
        text.trim().chars().take(max_len).collect()
    }
}

fn is_hex_color(value: &str) -> bool {
    static COLOR: OnceLock<Regex> = OnceLock::new();
    COLOR
        .get_or_init(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("Invalid regex"))
        .is_match(value)
}

/// Extract #tags from text
///
/// Valid tags match the pattern: `#[a-zA-Z][a-zA-Z0-9_-]*`
/// Tags are returned in lowercase and deduplicated.
///
/// # Examples
///
/// ```
/// use memosync_core::models::extract_tags;
///
/// let tags = extract_tags("Hello #world this is #Rust-lang");
/// assert!(tags.contains("world"));
/// assert!(tags.contains("rust-lang"));
/// ```
#[must_use]
pub fn extract_tags(text: &str) -> BTreeSet<String> {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"#([a-zA-Z][a-zA-Z0-9_-]*)").expect("Invalid regex"))
        .captures_iter(text)
        .map(|cap| cap[1].to_lowercase())
        .collect()
}
