// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-log (oplog) entries.
//!
//! Parses the raw entries a source hands out while tailing into typed
//! [`OplogEntry`] values, and applies partial-update deltas to documents.
//!
//! # Raw Entry Shape
//!
//! ```text
//! { "ts": {"t": 1700000000, "i": 3},      // or {"$timestamp": {"t":..,"i":..}}
//!   "op": "i" | "u" | "d" | "n" | "c",
//!   "ns": "db.coll",
//!   "o":  { ... },                         // document, delta, id or command
//!   "o2": { "_id": ... } }                 // updates only
//! ```
//!
//! # Update Forms
//!
//! Updates arrive either as operator documents (`$set` / `$unset`, dotted
//! paths allowed) or as the v2 diff form (`{"$v": 2, "diff": {...}}`). An
//! update whose `o` has no `$`-prefixed key is a whole-document replacement.
//!
//! # Ordering
//!
//! [`Timestamp`] orders by `(time, increment)`. Resuming always uses the
//! inclusive bound ([`TailStart::AtOrAfter`]) so the entry at the checkpoint
//! is re-read; applying it twice is harmless.

use crate::database::{document_id, Document};
use crate::error::{ReplicationError, Result};
use crate::namespace::Namespace;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;

/// Position in the source change log: seconds since epoch plus an ordinal
/// within that second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub time: u32,
    pub increment: u32,
}

impl Timestamp {
    pub const fn new(time: u32, increment: u32) -> Self {
        Self { time, increment }
    }

    /// Read `{"t": .., "i": ..}` or the extended `{"$timestamp": {...}}` form.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let obj = match obj.get("$timestamp") {
            Some(inner) => inner.as_object()?,
            None => obj,
        };
        let time = u32::try_from(obj.get("t")?.as_u64()?).ok()?;
        let increment = u32::try_from(obj.get("i")?.as_u64()?).ok()?;
        Some(Self { time, increment })
    }

    pub fn to_value(self) -> Value {
        json!({ "t": self.time, "i": self.increment })
    }

    /// The timestamp handed out for the next write, given the wall clock.
    ///
    /// Strictly greater than `self` unless `self` is the maximum position.
    /// Increments restart at 1 each second, and an exhausted increment rolls
    /// over into the next second even if the clock has not reached it.
    pub fn successor(self, now_secs: u32) -> Self {
        if now_secs > self.time {
            Self::new(now_secs, 1)
        } else if let Some(increment) = self.increment.checked_add(1) {
            Self::new(self.time, increment)
        } else if let Some(time) = self.time.checked_add(1) {
            Self::new(time, 1)
        } else {
            self
        }
    }

    /// Seconds this position trails `now_secs` (0 if it is ahead).
    pub fn lag_secs(self, now_secs: i64) -> u64 {
        u64::try_from(now_secs.saturating_sub(i64::from(self.time))).unwrap_or(0)
    }

    /// Wall-clock time of the position, for logging.
    pub fn to_datetime(self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(i64::from(self.time), 0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.time, self.increment)
    }
}

impl FromStr for Timestamp {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        let (time, increment) = s
            .split_once(':')
            .ok_or_else(|| ReplicationError::OplogParse(format!("Invalid timestamp: {}", s)))?;
        let time = time
            .parse()
            .map_err(|e| ReplicationError::OplogParse(format!("Invalid timestamp {}: {}", s, e)))?;
        let increment = increment
            .parse()
            .map_err(|e| ReplicationError::OplogParse(format!("Invalid timestamp {}: {}", s, e)))?;
        Ok(Self { time, increment })
    }
}

/// Where to open a change-log tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    /// First entry with `ts >= t`.
    AtOrAfter(Timestamp),
    /// First entry with `ts > t`.
    After(Timestamp),
}

impl TailStart {
    pub fn includes(&self, ts: Timestamp) -> bool {
        match *self {
            TailStart::AtOrAfter(start) => ts >= start,
            TailStart::After(start) => ts > start,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match *self {
            TailStart::AtOrAfter(ts) | TailStart::After(ts) => ts,
        }
    }
}

/// One field-level change within an update.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    /// Set the (dotted) path, creating intermediate objects.
    Set { path: String, value: Value },
    /// Remove the path. Array elements become `null`.
    Unset { path: String },
    /// Shrink the array at the path to `len` elements.
    Truncate { path: String, len: usize },
}

/// Partial update to a document, applied in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDelta {
    pub updates: Vec<FieldUpdate>,
}

/// A delta that could not be applied to a particular document.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot apply update at '{path}': {reason}")]
pub struct DeltaError {
    pub path: String,
    pub reason: String,
}

impl DeltaError {
    fn new(path: &str, reason: &str) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl UpdateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.updates.push(FieldUpdate::Set {
            path: path.into(),
            value,
        });
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.updates.push(FieldUpdate::Unset { path: path.into() });
        self
    }

    pub fn truncate(mut self, path: impl Into<String>, len: usize) -> Self {
        self.updates.push(FieldUpdate::Truncate {
            path: path.into(),
            len,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Parse an update `o` field that uses operators or the v2 diff form.
    pub fn from_operators(o: &Document) -> Result<Self> {
        if let Some(diff) = o.get("diff") {
            let diff = diff
                .as_object()
                .ok_or_else(|| ReplicationError::OplogParse("diff is not an object".into()))?;
            let mut delta = Self::new();
            parse_diff(diff, "", &mut delta.updates)?;
            return Ok(delta);
        }

        let mut delta = Self::new();
        for (op, fields) in o {
            match op.as_str() {
                "$v" => {}
                "$set" => {
                    for (path, value) in as_object(fields, op)? {
                        delta.updates.push(FieldUpdate::Set {
                            path: path.clone(),
                            value: value.clone(),
                        });
                    }
                }
                "$unset" => {
                    for path in as_object(fields, op)?.keys() {
                        delta.updates.push(FieldUpdate::Unset { path: path.clone() });
                    }
                }
                other => {
                    return Err(ReplicationError::OplogParse(format!(
                        "Unsupported update operator: {}",
                        other
                    )))
                }
            }
        }
        Ok(delta)
    }

    /// Render as an operator document, or `None` if the delta contains
    /// changes that only the diff form can carry: array truncation, or a
    /// path touched by both `$set` and `$unset`.
    pub fn to_operator_document(&self) -> Option<Document> {
        let mut set = Map::new();
        let mut unset = Map::new();
        for update in &self.updates {
            match update {
                FieldUpdate::Set { path, value } => {
                    set.insert(path.clone(), value.clone());
                }
                FieldUpdate::Unset { path } => {
                    unset.insert(path.clone(), Value::from(1));
                }
                FieldUpdate::Truncate { .. } => return None,
            }
        }
        let overlaps = |a: &str, b: &str| {
            a == b
                || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
                || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
        };
        if set.keys().any(|s| unset.keys().any(|u| overlaps(s, u))) {
            return None;
        }
        let mut o = Map::new();
        if !set.is_empty() {
            o.insert("$set".into(), Value::Object(set));
        }
        if !unset.is_empty() {
            o.insert("$unset".into(), Value::Object(unset));
        }
        Some(o)
    }

    /// Apply every change to `doc` in order.
    ///
    /// On error `doc` may be partially updated; callers apply to a copy.
    pub fn apply_to(&self, doc: &mut Document) -> std::result::Result<(), DeltaError> {
        let mut root = Value::Object(std::mem::take(doc));
        let result = self.updates.iter().try_for_each(|update| match update {
            FieldUpdate::Set { path, value } => {
                let segments: Vec<&str> = path.split('.').collect();
                set_in(&mut root, &segments, value.clone(), path)
            }
            FieldUpdate::Unset { path } => {
                let segments: Vec<&str> = path.split('.').collect();
                unset_in(&mut root, &segments);
                Ok(())
            }
            FieldUpdate::Truncate { path, len } => {
                let segments: Vec<&str> = path.split('.').collect();
                match lookup_mut(&mut root, &segments) {
                    Some(Value::Array(items)) => {
                        items.truncate(*len);
                        Ok(())
                    }
                    Some(_) => Err(DeltaError::new(path, "not an array")),
                    None => Ok(()),
                }
            }
        });
        if let Value::Object(map) = root {
            *doc = map;
        }
        result
    }
}

fn as_object<'a>(value: &'a Value, op: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ReplicationError::OplogParse(format!("{} argument is not an object", op)))
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

/// Flatten a v2 diff into field updates. Deletes, then updates, then
/// inserts, then nested diffs.
fn parse_diff(diff: &Map<String, Value>, prefix: &str, out: &mut Vec<FieldUpdate>) -> Result<()> {
    if diff.get("a") == Some(&Value::Bool(true)) {
        if let Some(len) = diff.get("l") {
            let len = len
                .as_u64()
                .and_then(|l| usize::try_from(l).ok())
                .ok_or_else(|| ReplicationError::OplogParse("Invalid array length".into()))?;
            out.push(FieldUpdate::Truncate {
                path: prefix.to_string(),
                len,
            });
        }
        for (key, value) in diff {
            if key == "a" || key == "l" {
                continue;
            }
            let (kind, index) = match (key.get(..1), key.get(1..)) {
                (Some(kind), Some(index)) => (kind, index),
                _ => ("", ""),
            };
            if index.parse::<usize>().is_err() {
                return Err(ReplicationError::OplogParse(format!(
                    "Invalid array diff key: {}",
                    key
                )));
            }
            let path = join_path(prefix, index);
            match kind {
                "u" => out.push(FieldUpdate::Set {
                    path,
                    value: value.clone(),
                }),
                "s" => parse_diff(as_object(value, key)?, &path, out)?,
                _ => {
                    return Err(ReplicationError::OplogParse(format!(
                        "Invalid array diff key: {}",
                        key
                    )))
                }
            }
        }
        return Ok(());
    }

    if let Some(deleted) = diff.get("d") {
        for field in as_object(deleted, "d")?.keys() {
            out.push(FieldUpdate::Unset {
                path: join_path(prefix, field),
            });
        }
    }
    for section in ["u", "i"] {
        if let Some(fields) = diff.get(section) {
            for (field, value) in as_object(fields, section)? {
                out.push(FieldUpdate::Set {
                    path: join_path(prefix, field),
                    value: value.clone(),
                });
            }
        }
    }
    for (key, value) in diff {
        if matches!(key.as_str(), "d" | "u" | "i") {
            continue;
        }
        match key.strip_prefix('s') {
            Some(field) if !field.is_empty() => {
                parse_diff(as_object(value, key)?, &join_path(prefix, field), out)?
            }
            _ => {
                return Err(ReplicationError::OplogParse(format!(
                    "Invalid diff key: {}",
                    key
                )))
            }
        }
    }
    Ok(())
}

/// Most `null`s a single set may append to pad an array.
const MAX_ARRAY_PADDING: usize = 1_500_000;

fn set_in(
    container: &mut Value,
    segments: &[&str],
    value: Value,
    path: &str,
) -> std::result::Result<(), DeltaError> {
    let Some((head, rest)) = segments.split_first() else {
        *container = value;
        return Ok(());
    };
    match container {
        Value::Object(map) => {
            if rest.is_empty() {
                map.insert(head.to_string(), value);
                return Ok(());
            }
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_in(child, rest, value, path)
        }
        Value::Array(items) => {
            let index: usize = head
                .parse()
                .map_err(|_| DeltaError::new(path, "non-numeric array index"))?;
            if index >= items.len() + MAX_ARRAY_PADDING {
                return Err(DeltaError::new(path, "array index too far past the end"));
            }
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            if rest.is_empty() {
                items[index] = value;
                return Ok(());
            }
            if items[index].is_null() {
                items[index] = Value::Object(Map::new());
            }
            set_in(&mut items[index], rest, value, path)
        }
        _ => Err(DeltaError::new(path, "cannot traverse a scalar value")),
    }
}

fn unset_in(container: &mut Value, segments: &[&str]) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    match lookup_mut(container, parents) {
        Some(Value::Object(map)) => {
            map.shift_remove(*last);
        }
        Some(Value::Array(items)) => {
            if let Some(item) = last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}

fn lookup_mut<'a>(value: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value);
    };
    let child = match value {
        Value::Object(map) => map.get_mut(*head)?,
        Value::Array(items) => items.get_mut(head.parse::<usize>().ok()?)?,
        _ => return None,
    };
    lookup_mut(child, rest)
}

/// What a change-log entry does.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert { document: Document },
    Replace { id: Value, document: Document },
    Update { id: Value, delta: UpdateDelta },
    Delete { id: Value },
    Noop,
    Command { body: Document },
}

impl Operation {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Replace { .. } => "replace",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Noop => "noop",
            Operation::Command { .. } => "command",
        }
    }
}

/// A parsed change-log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    pub ts: Timestamp,
    /// `None` for no-ops that carry no namespace.
    pub namespace: Option<Namespace>,
    pub operation: Operation,
}

impl OplogEntry {
    /// True if the entry targets a namespace that is never replicated.
    pub fn is_internal(&self) -> bool {
        self.namespace.as_ref().is_some_and(Namespace::is_internal)
    }
}

/// Read just the timestamp of a raw entry.
///
/// Used to advance past entries that fail to parse.
pub fn entry_timestamp(raw: &Document) -> Option<Timestamp> {
    raw.get("ts").and_then(Timestamp::from_value)
}

fn object_field<'a>(raw: &'a Document, name: &str) -> Result<&'a Document> {
    raw.get(name)
        .ok_or_else(|| ReplicationError::OplogParse(format!("Missing field: {}", name)))?
        .as_object()
        .ok_or_else(|| ReplicationError::OplogParse(format!("Field {} is not an object", name)))
}

fn id_field(doc: &Document, field: &str) -> Result<Value> {
    document_id(doc)
        .cloned()
        .ok_or_else(|| ReplicationError::OplogParse(format!("Missing _id in {}", field)))
}

/// Parse a raw change-log entry.
pub fn parse_entry(raw: &Document) -> Result<OplogEntry> {
    let ts = raw
        .get("ts")
        .ok_or_else(|| ReplicationError::OplogParse("Missing field: ts".into()))
        .and_then(|v| {
            Timestamp::from_value(v)
                .ok_or_else(|| ReplicationError::OplogParse(format!("Invalid ts: {}", v)))
        })?;

    let op = raw
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| ReplicationError::OplogParse("Missing field: op".into()))?;

    let ns = raw.get("ns").and_then(Value::as_str).unwrap_or("");
    let namespace = Namespace::parse(ns);

    if op == "n" {
        return Ok(OplogEntry {
            ts,
            namespace,
            operation: Operation::Noop,
        });
    }

    let namespace = namespace
        .ok_or_else(|| ReplicationError::OplogParse(format!("Invalid namespace: '{}'", ns)))?;
    let o = object_field(raw, "o")?;

    let operation = match op {
        "i" => {
            id_field(o, "o")?;
            Operation::Insert { document: o.clone() }
        }
        "d" => Operation::Delete {
            id: id_field(o, "o")?,
        },
        "u" => {
            let id = id_field(object_field(raw, "o2")?, "o2")?;
            if o.keys().any(|k| k.starts_with('$')) {
                Operation::Update {
                    id,
                    delta: UpdateDelta::from_operators(o)?,
                }
            } else {
                let mut document = o.clone();
                if !document.contains_key("_id") {
                    document.insert("_id".into(), id.clone());
                }
                Operation::Replace { id, document }
            }
        }
        "c" => Operation::Command { body: o.clone() },
        other => {
            return Err(ReplicationError::OplogParse(format!(
                "Unknown op type: {}",
                other
            )))
        }
    };

    Ok(OplogEntry {
        ts,
        namespace: Some(namespace),
        operation,
    })
}

fn raw_entry(ts: Timestamp, op: &str, ns: &str, o: Document) -> Document {
    let mut raw = Map::new();
    raw.insert("ts".into(), ts.to_value());
    raw.insert("op".into(), Value::from(op));
    raw.insert("ns".into(), Value::from(ns));
    raw.insert("o".into(), Value::Object(o));
    raw
}

fn id_document(id: &Value) -> Document {
    let mut o = Map::new();
    o.insert("_id".into(), id.clone());
    o
}

/// Raw insert entry.
pub fn raw_insert(ts: Timestamp, ns: &Namespace, document: Document) -> Document {
    raw_entry(ts, "i", &ns.to_string(), document)
}

/// Raw update entry; `o` is an operator document, diff document or a
/// replacement.
pub fn raw_update(ts: Timestamp, ns: &Namespace, id: &Value, o: Document) -> Document {
    let mut raw = raw_entry(ts, "u", &ns.to_string(), o);
    raw.insert("o2".into(), Value::Object(id_document(id)));
    raw
}

/// Raw delete entry.
pub fn raw_delete(ts: Timestamp, ns: &Namespace, id: &Value) -> Document {
    raw_entry(ts, "d", &ns.to_string(), id_document(id))
}

/// Raw no-op entry (periodic heartbeat written by the source).
pub fn raw_noop(ts: Timestamp, message: &str) -> Document {
    let mut o = Map::new();
    o.insert("msg".into(), Value::from(message));
    raw_entry(ts, "n", "", o)
}

/// Raw command entry against `db.$cmd`.
pub fn raw_command(ts: Timestamp, database: &str, body: Document) -> Document {
    raw_entry(ts, "c", &format!("{}.$cmd", database), body)
}
