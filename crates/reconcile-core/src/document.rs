//! Dynamic documents
//!
//! Untyped resource payloads are carried as a JSON object with explicit
//! path accessors. Paths are dot-separated; a numeric segment indexes into an
//! array (`spec.template.spec.containers.0.image`). Typed accessors return
//! `DocumentError::TypeMismatch` instead of coercing.

use crate::error::DocumentError;
use serde_json::{Map, Value};

/// Mapping from path to value backed by a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document(Map<String, Value>);

/// Name of a JSON value's type, for error messages.
#[must_use]
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn split(path: &str) -> Result<Vec<&str>, DocumentError> {
    if path.is_empty() {
        return Err(DocumentError::InvalidPath {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(DocumentError::InvalidPath {
            path: path.to_string(),
            reason: "empty segment".to_string(),
        });
    }
    Ok(segments)
}

fn parse_index(segment: &str, path: &str) -> Result<usize, DocumentError> {
    segment.parse::<usize>().map_err(|_| DocumentError::InvalidPath {
        path: path.to_string(),
        reason: format!("'{segment}' is not an array index"),
    })
}

/// Looks up a value by segments.
#[must_use]
pub fn lookup<'a, S: AsRef<str>>(root: &'a Value, segments: &[S]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

impl Document {
    /// Creates an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wraps a JSON value; the root must be an object.
    pub fn from_value(value: Value) -> Result<Self, DocumentError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DocumentError::NotAnObject(kind_of(&other))),
        }
    }

    /// Wraps a JSON value, treating `null` as an empty document.
    pub fn from_value_or_empty(value: Value) -> Result<Self, DocumentError> {
        if value.is_null() {
            return Ok(Self::new());
        }
        Self::from_value(value)
    }

    /// Returns the document as a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Borrow the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the value at `path`, if present.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments = split(path).ok()?;
        let (first, rest) = segments.split_first()?;
        lookup(self.0.get(*first)?, rest)
    }

    /// Returns true when a non-null value exists at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !v.is_null())
    }

    /// Sets `value` at `path`, creating intermediate objects as needed.
    ///
    /// Array segments must address an existing element or the position just
    /// past the end (which appends).
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), DocumentError> {
        let segments = split(path)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| DocumentError::InvalidPath {
                path: path.to_string(),
                reason: "empty path".to_string(),
            })?;

        let mut current: &mut Value = match parents.first() {
            None => {
                self.0.insert((*last).to_string(), value.into());
                return Ok(());
            }
            Some(first) => self
                .0
                .entry((*first).to_string())
                .or_insert_with(|| Value::Object(Map::new())),
        };

        for segment in parents.iter().skip(1) {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry((*segment).to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => {
                    let index = parse_index(segment, path)?;
                    let len = items.len();
                    items.get_mut(index).ok_or_else(|| DocumentError::InvalidPath {
                        path: path.to_string(),
                        reason: format!("index {index} out of bounds (len {len})"),
                    })?
                }
                other => {
                    return Err(DocumentError::TypeMismatch {
                        path: path.to_string(),
                        expected: "object",
                        found: kind_of(other),
                    });
                }
            };
        }

        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        match current {
            Value::Object(map) => {
                map.insert((*last).to_string(), value.into());
                Ok(())
            }
            Value::Array(items) => {
                let index = parse_index(last, path)?;
                if index < items.len() {
                    items[index] = value.into();
                    Ok(())
                } else if index == items.len() {
                    items.push(value.into());
                    Ok(())
                } else {
                    Err(DocumentError::InvalidPath {
                        path: path.to_string(),
                        reason: format!("index {index} out of bounds (len {})", items.len()),
                    })
                }
            }
            other => Err(DocumentError::TypeMismatch {
                path: path.to_string(),
                expected: "object",
                found: kind_of(other),
            }),
        }
    }

    /// Removes and returns the value at `path`.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments = split(path).ok()?;
        let (last, parents) = segments.split_last()?;
        if parents.is_empty() {
            return self.0.remove(*last);
        }
        let (first, rest) = parents.split_first()?;
        let mut current = self.0.get_mut(*first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get_mut(*segment)?,
                Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        match current {
            Value::Object(map) => map.remove(*last),
            Value::Array(items) => {
                let index = last.parse::<usize>().ok()?;
                (index < items.len()).then(|| items.remove(index))
            }
            _ => None,
        }
    }

    fn typed<'a, T>(
        &'a self,
        path: &str,
        expected: &'static str,
        extract: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<Option<T>, DocumentError> {
        match self.get(path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => extract(value).map(Some).ok_or(DocumentError::TypeMismatch {
                path: path.to_string(),
                expected,
                found: kind_of(value),
            }),
        }
    }

    /// String at `path`; `Ok(None)` when absent or null.
    pub fn get_str(&self, path: &str) -> Result<Option<&str>, DocumentError> {
        self.typed(path, "string", Value::as_str)
    }

    /// Integer at `path`; `Ok(None)` when absent or null.
    pub fn get_i64(&self, path: &str) -> Result<Option<i64>, DocumentError> {
        self.typed(path, "integer", Value::as_i64)
    }

    /// Boolean at `path`; `Ok(None)` when absent or null.
    pub fn get_bool(&self, path: &str) -> Result<Option<bool>, DocumentError> {
        self.typed(path, "bool", Value::as_bool)
    }

    /// Array at `path`; `Ok(None)` when absent or null.
    pub fn get_array(&self, path: &str) -> Result<Option<&Vec<Value>>, DocumentError> {
        self.typed(path, "array", Value::as_array)
    }

    /// Object at `path`; `Ok(None)` when absent or null.
    pub fn get_object(&self, path: &str) -> Result<Option<&Map<String, Value>>, DocumentError> {
        self.typed(path, "object", Value::as_object)
    }

    /// String at `path`, failing when absent.
    pub fn require_str(&self, path: &str) -> Result<&str, DocumentError> {
        self.get_str(path)?
            .ok_or_else(|| DocumentError::Missing(path.to_string()))
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

impl TryFrom<Value> for Document {
    type Error = DocumentError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}
