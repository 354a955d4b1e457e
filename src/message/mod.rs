//! Multipart pipeline messages.
//!
//! A [`Message`] is an ordered, non-empty sequence of [`Part`]s. Each part
//! carries a byte payload and a bag of string metadata. Part order is
//! significant and survives every hop through the adapters; metadata order
//! is not.

use std::collections::HashMap;

use bytes::Bytes;

/// String key/value metadata attached to a message part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    values: HashMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a metadata value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a metadata value, replacing any previous value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Remove a metadata value, returning it if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all key/value pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One payload plus metadata unit of a multipart message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    payload: Bytes,
    metadata: Metadata,
}

impl Part {
    /// Create a part with empty metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Create a part with the given metadata.
    pub fn with_metadata(payload: impl Into<Bytes>, metadata: Metadata) -> Self {
        Self {
            payload: payload.into(),
            metadata,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Ordered sequence of parts flowing through the pipeline.
///
/// Always holds at least one part. Once handed to an output the message is
/// borrowed immutably for the duration of the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    parts: Vec<Part>,
}

impl Message {
    /// Build a message with one part per payload, all with empty metadata.
    ///
    /// # Panics
    /// Panics if `payloads` is empty.
    pub fn new<P: Into<Bytes>>(payloads: Vec<P>) -> Self {
        Self::from_parts(payloads.into_iter().map(Part::new).collect())
    }

    /// Build a message from already constructed parts.
    ///
    /// # Panics
    /// Panics if `parts` is empty.
    pub fn from_parts(parts: Vec<Part>) -> Self {
        assert!(!parts.is_empty(), "a message requires at least one part");
        Self { parts }
    }

    /// Number of parts. Never zero.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Always false; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Borrow part `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn part(&self, index: usize) -> &Part {
        &self.parts[index]
    }

    /// Mutably borrow part `index`.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn part_mut(&mut self, index: usize) -> &mut Part {
        &mut self.parts[index]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Part> {
        self.parts.iter()
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }
}

impl From<Part> for Message {
    fn from(part: Part) -> Self {
        Self { parts: vec![part] }
    }
}

impl<'a> IntoIterator for &'a Message {
    type Item = &'a Part;
    type IntoIter = std::slice::Iter<'a, Part>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}

#[cfg(test)]
mod tests;
