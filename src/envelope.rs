//! The canonical record shape flowing through the pipeline.
//!
//! Grounded in a `LoggerState`/`JsonRecord` split (`state.rs`,
//! `format/json.rs`), generalized from a fixed `tracing::Level` + flat
//! string map into a dynamic, JSON-safe payload model.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, Ordering};

/// Built-in severities, ordered:
/// TRACE < DEBUG < INFO < NOTICE < WARN < ERROR < CRITICAL.
///
/// Priorities leave gaps so user-registered levels (see [`LevelRegistry`])
/// can be inserted between built-ins without renumbering everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Level(pub i32);

impl Level {
    pub const TRACE: Level = Level(0);
    pub const DEBUG: Level = Level(100);
    pub const INFO: Level = Level(200);
    pub const NOTICE: Level = Level(250);
    pub const WARN: Level = Level(300);
    pub const ERROR: Level = Level(400);
    pub const CRITICAL: Level = Level(500);

    /// Parses one of the built-in level names (case-insensitive). Returns
    /// `None` for anything not a built-in; callers that support custom
    /// levels should fall back to [`LevelRegistry::resolve`].
    pub fn from_builtin_name(name: &str) -> Option<Level> {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => Some(Level::TRACE),
            "DEBUG" => Some(Level::DEBUG),
            "INFO" => Some(Level::INFO),
            "NOTICE" => Some(Level::NOTICE),
            "WARN" | "WARNING" => Some(Level::WARN),
            "ERROR" => Some(Level::ERROR),
            "CRITICAL" | "FATAL" => Some(Level::CRITICAL),
            _ => None,
        }
    }

    pub fn builtin_name(self) -> Option<&'static str> {
        match self {
            Level::TRACE => Some("TRACE"),
            Level::DEBUG => Some("DEBUG"),
            Level::INFO => Some("INFO"),
            Level::NOTICE => Some("NOTICE"),
            Level::WARN => Some("WARN"),
            Level::ERROR => Some("ERROR"),
            Level::CRITICAL => Some("CRITICAL"),
            _ => None,
        }
    }
}

/// Registry mapping user-defined level names to integer priorities.
///
/// Built-in levels never need registration; this exists purely to map
/// user-registered levels to integer priorities.
pub struct LevelRegistry {
    custom: parking_lot::RwLock<AHashMap<String, Level>>,
    next_custom_priority: AtomicU32,
}

impl Default for LevelRegistry {
    fn default() -> Self {
        Self {
            custom: parking_lot::RwLock::new(AHashMap::new()),
            next_custom_priority: AtomicU32::new(1_000),
        }
    }
}

impl LevelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` at a freshly allocated priority above all
    /// built-ins, or returns its existing priority if already registered.
    pub fn register(&self, name: &str) -> Level {
        let key = name.to_ascii_uppercase();
        if let Some(existing) = self.custom.read().get(&key) {
            return *existing;
        }
        let priority = self.next_custom_priority.fetch_add(1, Ordering::Relaxed) as i32;
        let level = Level(priority);
        self.custom.write().insert(key, level);
        level
    }

    /// Resolves a name against both built-ins and previously registered
    /// custom levels.
    pub fn resolve(&self, name: &str) -> Option<Level> {
        Level::from_builtin_name(name).or_else(|| self.custom.read().get(&name.to_ascii_uppercase()).copied())
    }
}

/// Where an envelope originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Native,
    Bridged,
    ThirdParty,
}

/// A dynamic, JSON-safe value for envelope payload and context fields.
///
/// A tagged sum over eight kinds, using `SmallVec` for
/// shallow lists to avoid a heap allocation on the common one-or-two-item
/// case, and `IndexMap` for maps — insertion order must survive to the
/// serializer (see `pipeline::serialize`), which `AHashMap` cannot offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "bytes_as_base64")] Vec<u8>),
    List(SmallVec<[Value; 4]>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&crate::pipeline::serialize::base64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        crate::pipeline::serialize::base64_decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Correlation identifiers, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl CorrelationIds {
    pub fn is_empty(&self) -> bool {
        self.request_id.is_none()
            && self.trace_id.is_none()
            && self.span_id.is_none()
            && self.user_id.is_none()
            && self.tenant_id.is_none()
    }
}

/// The terminal outcome of an envelope once it leaves the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Written,
    Filtered,
    Dropped,
}

/// The canonical in-memory log record.
///
/// Mutable only while owned by a worker's stage pipeline (invariant a);
/// once handed to the serializer or dropped at the queue it must not be
/// mutated further by anything holding a shared reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Cached rendering of `level` for built-ins; custom levels render
    /// via the registry at serialize time.
    #[serde(skip)]
    pub level_name: String,
    pub message: String,
    /// Insertion-ordered so the serializer's "stable key ordering"
    /// guarantee holds without a second sort pass.
    pub context: IndexMap<String, Value>,
    pub data: IndexMap<String, Value>,
    pub diagnostics: IndexMap<String, Value>,
    pub origin: Origin,
    #[serde(flatten)]
    pub correlation: CorrelationIds,
    /// Monotonically non-decreasing within a single worker (invariant b).
    #[serde(skip)]
    pub sequence: u64,
}

impl Envelope {
    pub fn new(level: Level, level_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            level_name: level_name.into(),
            message: message.into(),
            context: IndexMap::new(),
            data: IndexMap::new(),
            diagnostics: IndexMap::new(),
            origin: Origin::Native,
            correlation: CorrelationIds::default(),
            sequence: 0,
        }
    }

    /// Records a non-fatal issue raised by an enricher or redactor into
    /// this envelope's diagnostic submap.
    pub fn push_diagnostic(&mut self, source: &str, reason: impl Into<Value>) {
        self.diagnostics.insert(source.to_string(), reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering_matches_spec() {
        assert!(Level::TRACE < Level::DEBUG);
        assert!(Level::DEBUG < Level::INFO);
        assert!(Level::INFO < Level::NOTICE);
        assert!(Level::NOTICE < Level::WARN);
        assert!(Level::WARN < Level::ERROR);
        assert!(Level::ERROR < Level::CRITICAL);
    }

    #[test]
    fn level_from_builtin_name_case_insensitive() {
        assert_eq!(Level::from_builtin_name("info"), Some(Level::INFO));
        assert_eq!(Level::from_builtin_name("WARNING"), Some(Level::WARN));
        assert_eq!(Level::from_builtin_name("fatal"), Some(Level::CRITICAL));
        assert_eq!(Level::from_builtin_name("bogus"), None);
    }

    #[test]
    fn level_registry_assigns_stable_priority_above_builtins() {
        let reg = LevelRegistry::new();
        let audit = reg.register("AUDIT");
        assert!(audit > Level::CRITICAL);
        assert_eq!(reg.register("audit"), audit);
        assert_eq!(reg.resolve("Audit"), Some(audit));
        assert_eq!(reg.resolve("INFO"), Some(Level::INFO));
    }

    #[test]
    fn correlation_ids_is_empty() {
        let c = CorrelationIds::default();
        assert!(c.is_empty());
        let c2 = CorrelationIds {
            trace_id: Some("t1".into()),
            ..Default::default()
        };
        assert!(!c2.is_empty());
    }

    #[test]
    fn envelope_push_diagnostic() {
        let mut env = Envelope::new(Level::INFO, "INFO", "hi");
        env.push_diagnostic("redactor:field_mask", "depth cap exceeded");
        assert_eq!(
            env.diagnostics.get("redactor:field_mask"),
            Some(&Value::Str("depth cap exceeded".to_string()))
        );
    }
}
