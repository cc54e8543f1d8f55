//! Call metadata (initial metadata and trailers).

use bytes::Bytes;
use std::collections::HashMap;
use std::iter::FusedIterator;
use std::ops::Index;

/// Key suffix marking a binary-valued metadatum.
pub const BINARY_SUFFIX: &[u8] = b"-bin";

/// A single binary-safe key/value pair.
///
/// Keys are case-insensitive ASCII tokens. A key ending in `-bin` marks the
/// value as opaque bytes; any other value must be printable ASCII.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadatum {
    key: Bytes,
    value: Bytes,
}

impl Metadatum {
    /// Create a metadatum.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The key, exactly as supplied.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Check if the key marks a binary value.
    pub fn is_binary(&self) -> bool {
        self.key.len() > BINARY_SUFFIX.len()
            && self.key[self.key.len() - BINARY_SUFFIX.len()..].eq_ignore_ascii_case(BINARY_SUFFIX)
    }

    /// Check that the key is a legal token and the value fits the key kind.
    pub fn is_valid(&self) -> bool {
        if self.key.is_empty() || self.key[0] == b':' {
            return false;
        }
        if !self.key.iter().all(|&b| is_key_byte(b)) {
            return false;
        }
        self.is_binary() || self.value.iter().all(|&b| (0x20..=0x7e).contains(&b))
    }
}

fn is_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')
}

/// Ordered sequence of metadata.
///
/// Insertion order is preserved and duplicate keys are allowed. Equality
/// compares the collapsed [`to_unordered_map`](Self::to_unordered_map) view,
/// so two sequences with the same final value per key are equal regardless
/// of order.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<Metadatum>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key-value pair.
    pub fn insert(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push(Metadatum::new(key, value));
    }

    /// Append a metadatum.
    pub fn push(&mut self, metadatum: Metadatum) {
        self.entries.push(metadatum);
    }

    /// Get the metadatum at `index`.
    pub fn get(&self, index: usize) -> Option<&Metadatum> {
        self.entries.get(index)
    }

    /// Get the first value for a key, compared case-insensitively.
    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|m| m.key.eq_ignore_ascii_case(key))
            .map(|m| m.value())
    }

    /// Get all values for a key in insertion order.
    pub fn find_all<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |m| m.key.eq_ignore_ascii_case(key))
            .map(|m| m.value())
    }

    /// Iterate over all entries in insertion order.
    ///
    /// The iterator is single-pass: once it returns `None` it keeps
    /// returning `None`. Call `iter()` again to start over.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            entries: &self.entries,
            pos: 0,
        }
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries (including duplicates).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check that every entry is well-formed.
    pub fn is_valid(&self) -> bool {
        self.entries.iter().all(Metadatum::is_valid)
    }

    /// Collapse into a key -> value map.
    ///
    /// Keys are lowercased. When a key appears more than once the last value
    /// wins. Intended for comparisons; iteration order is lost.
    pub fn to_unordered_map(&self) -> HashMap<Bytes, Bytes> {
        self.entries
            .iter()
            .map(|m| {
                (
                    Bytes::from(m.key.to_ascii_lowercase()),
                    m.value.clone(),
                )
            })
            .collect()
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.to_unordered_map() == other.to_unordered_map()
    }
}

impl Eq for Metadata {}

impl Index<usize> for Metadata {
    type Output = Metadatum;

    fn index(&self, index: usize) -> &Metadatum {
        &self.entries[index]
    }
}

impl From<Vec<Metadatum>> for Metadata {
    fn from(entries: Vec<Metadatum>) -> Self {
        Self { entries }
    }
}

impl FromIterator<Metadatum> for Metadata {
    fn from_iter<T: IntoIterator<Item = Metadatum>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<K: Into<Bytes>, V: Into<Bytes>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(key, value)| Metadatum::new(key, value))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = &'a Metadatum;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl IntoIterator for Metadata {
    type Item = Metadatum;
    type IntoIter = std::vec::IntoIter<Metadatum>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Forward, single-pass iterator over [`Metadata`].
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    entries: &'a [Metadatum],
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Metadatum;

    fn next(&mut self) -> Option<&'a Metadatum> {
        let item = self.entries.get(self.pos)?;
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.entries.len().saturating_sub(self.pos);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl FusedIterator for Iter<'_> {}
