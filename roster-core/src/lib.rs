//! # roster-core: data model for the roster application
//!
//! A [`Document`] is an open mapping of field name to JSON value plus two
//! reserved slots: the collection-unique `id` and the store-assigned
//! [`Revision`]. Roster records ([`Student`], [`Tutor`]) are typed views that
//! convert to and from document fields through serde.
//!
//! [`pairing`] scores tutor/student pairings against past sessions.

pub mod pairing;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Invalid revision '{0}'")]
    InvalidRevision(String),
    #[error("Revision {0} cannot be superseded")]
    RevisionExhausted(String),
    #[error("Record must serialize to a JSON object, got {0}")]
    NotAnObject(String),
    #[error("Field conversion failed: {0}")]
    Conversion(String),
}

/// Optimistic-concurrency token assigned by the store on every write.
///
/// Rendered as `"<generation>-<tag>"`. Ordered by generation first, then by
/// tag, so two replicas that wrote the same document concurrently agree on
/// a single winner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    generation: u64,
    tag: String,
}

impl Revision {
    /// Revision for the first write of a document.
    pub fn first() -> Self {
        Self::with_generation(1)
    }

    /// Revision that supersedes `self`.
    ///
    /// Fails once the generation counter is exhausted. Replicas can hand us
    /// any generation, so this is reachable.
    pub fn next(&self) -> Result<Self, DocumentError> {
        self.generation
            .checked_add(1)
            .map(Self::with_generation)
            .ok_or_else(|| DocumentError::RevisionExhausted(self.to_string()))
    }

    fn with_generation(generation: u64) -> Self {
        Self {
            generation,
            tag: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.tag.cmp(&other.tag))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.tag)
    }
}

impl FromStr for Revision {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, tag) = s
            .split_once('-')
            .ok_or_else(|| DocumentError::InvalidRevision(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| DocumentError::InvalidRevision(s.to_string()))?;
        if generation == 0 || tag.is_empty() {
            return Err(DocumentError::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            generation,
            tag: tag.to_string(),
        })
    }
}

/// A single record in a named collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    /// Unique within the collection; assigned by the store on insert when absent.
    pub id: Option<String>,
    /// Current revision; `None` until the document has been stored.
    pub revision: Option<Revision>,
    /// User fields.
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self {
            id: None,
            revision: None,
            fields,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of `field`, if present and a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Build a document from any record that serializes to a JSON object.
    pub fn from_record<T: Serialize>(record: &T) -> Result<Self, DocumentError> {
        match serde_json::to_value(record) {
            Ok(Value::Object(fields)) => Ok(Self::from_fields(fields)),
            Ok(other) => Err(DocumentError::NotAnObject(value_kind(&other).to_string())),
            Err(e) => Err(DocumentError::Conversion(e.to_string())),
        }
    }

    /// Decode the document's fields into a typed record.
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T, DocumentError> {
        serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| DocumentError::Conversion(e.to_string()))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn active() -> bool {
    true
}

/// A student on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub name: String,
    #[serde(default)]
    pub grade: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub init_assessment: String,
    /// Inactive students are left off new attendance sheets.
    #[serde(default = "active")]
    pub is_active: bool,
}

impl Default for Student {
    fn default() -> Self {
        Self {
            name: String::new(),
            grade: String::new(),
            gender: String::new(),
            init_assessment: String::new(),
            is_active: true,
        }
    }
}

impl Student {
    /// A student known only by name, as entered from the list screen.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A tutor available for pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutor {
    pub first: String,
    pub last: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default = "active")]
    pub is_active: bool,
}

impl Tutor {
    pub fn new(first: impl Into<String>, last: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            last: last.into(),
            gender: String::new(),
            is_active: true,
        }
    }

    /// Split a full name at the first space; the rest is the last name.
    pub fn from_full_name(name: &str) -> Self {
        let name = name.trim();
        match name.split_once(' ') {
            Some((first, last)) => Self::new(first, last.trim()),
            None => Self::new(name, ""),
        }
    }

    /// Name used to key pairings.
    pub fn full_name(&self) -> String {
        if self.last.is_empty() {
            return self.first.clone();
        }
        format!("{} {}", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_revision_ordering() {
        let first = Revision::first();
        let second = first.next().unwrap();
        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 2);
        assert!(second > first);
        assert_eq!(first.tag().len(), 32);
    }

    #[test]
    fn test_revision_same_generation_orders_by_tag() {
        let a: Revision = "3-aaaa".parse().unwrap();
        let b: Revision = "3-bbbb".parse().unwrap();
        let c: Revision = "2-ffff".parse().unwrap();
        assert!(b > a);
        assert!(a > c);
    }

    #[test]
    fn test_revision_display_parse() {
        let rev = Revision::first().next().unwrap();
        let parsed: Revision = rev.to_string().parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn test_revision_parse_rejects_garbage() {
        assert!("".parse::<Revision>().is_err());
        assert!("abc".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("x-abc".parse::<Revision>().is_err());
        assert!("4-".parse::<Revision>().is_err());
    }

    #[test]
    fn test_revision_next_at_max_generation_fails() {
        let last: Revision = format!("{}-abc", u64::MAX).parse().unwrap();
        let err = last.next().unwrap_err();
        assert_eq!(
            err,
            DocumentError::RevisionExhausted(format!("{}-abc", u64::MAX))
        );
        let almost: Revision = format!("{}-abc", u64::MAX - 1).parse().unwrap();
        assert_eq!(almost.next().unwrap().generation(), u64::MAX);
    }

    #[test]
    fn test_document_builder() {
        let doc = Document::new()
            .with_id("s1")
            .with_field("name", "Ana")
            .with_field("age", 9);
        assert_eq!(doc.id(), Some("s1"));
        assert!(doc.revision().is_none());
        assert_eq!(doc.get_str("name"), Some("Ana"));
        assert_eq!(doc.get("age"), Some(&json!(9)));
        assert!(doc.get("missing").is_none());
    }

    #[test]
    fn test_student_record_conversion() {
        let student = Student::named("Ana");
        let doc = Document::from_record(&student).unwrap();
        assert_eq!(doc.get_str("name"), Some("Ana"));
        assert_eq!(doc.get_str("grade"), Some(""));

        let back: Student = doc.to_record().unwrap();
        assert_eq!(back, student);
    }

    #[test]
    fn test_student_tolerates_missing_optional_fields() {
        let doc = Document::new().with_field("name", "Ben");
        let student: Student = doc.to_record().unwrap();
        assert_eq!(student.name, "Ben");
        assert!(student.grade.is_empty());
        assert!(student.is_active);
    }

    #[test]
    fn test_record_must_be_object() {
        let err = Document::from_record(&vec![1, 2, 3]).unwrap_err();
        assert_eq!(err, DocumentError::NotAnObject("array".into()));
    }

    #[test]
    fn test_tutor_full_name() {
        let tutor = Tutor::new("Grace", "Hopper");
        assert_eq!(tutor.full_name(), "Grace Hopper");
        let doc = Document::from_record(&tutor).unwrap();
        assert_eq!(doc.get_str("last"), Some("Hopper"));

        assert_eq!(Tutor::from_full_name("Ada King Lovelace").last, "King Lovelace");
        assert_eq!(Tutor::from_full_name("Cher").full_name(), "Cher");
    }
}
