//! Message body and headers.

use std::collections::BTreeMap;

use crate::types::Value;

/// Header map with case-insensitive lookup.
///
/// Keys keep the spelling they were first inserted with; lookups, overwrites
/// and removals ignore ASCII case, so `Content-Type` and `content-type`
/// address the same entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    /// Lower-cased key -> (original key, value).
    entries: BTreeMap<String, (String, Value)>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a header. Returns the previous value, if any.
    ///
    /// Replacing an existing header keeps its original key spelling.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let folded = key.to_ascii_lowercase();
        match self.entries.get_mut(&folded) {
            Some((_, existing)) => Some(std::mem::replace(existing, value.into())),
            None => {
                self.entries.insert(folded, (key, value.into()));
                None
            }
        }
    }

    /// Looks up a header ignoring case.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&key.to_ascii_lowercase()).map(|(_, v)| v)
    }

    /// Removes a header ignoring case.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(&key.to_ascii_lowercase()).map(|(_, v)| v)
    }

    /// Returns `true` if the header is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates headers with their original key spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }
}

/// A message: a dynamic body plus headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    body: Value,
    headers: Headers,
}

impl Message {
    /// Creates a message with the given body and no headers.
    #[must_use]
    pub fn new(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = body.into();
    }

    /// Takes the body, leaving [`Value::Null`] in its place.
    pub fn take_body(&mut self) -> Value {
        std::mem::take(&mut self.body)
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    #[must_use]
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key, value);
    }
}
