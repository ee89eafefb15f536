//! Collection containers.
//!
//! A [`Map`] is an insertion-ordered multimap whose keys compare
//! case-insensitively while keeping the casing they were first added with.

use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    values: Vec<String>,
}

/// Ordered, case-insensitive multimap of string values.
#[derive(Debug, Clone, Default)]
pub struct Map {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Map {
    /// Create a new empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.index.get(&key.to_lowercase()).copied()
    }

    /// Values stored under `key`.
    pub fn get(&self, key: &str) -> &[String] {
        match self.position(key) {
            Some(i) => &self.entries[i].values,
            None => &[],
        }
    }

    /// First value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(|s| s.as_str())
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Every `(key, value)` pair in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.key.as_str(), v.as_str())))
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Pairs whose key matches `re`.
    pub fn find_regex<'a>(&'a self, re: &'a Regex) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .iter()
            .filter(move |e| re.is_match(&e.key))
            .flat_map(|e| e.values.iter().map(move |v| (e.key.as_str(), v.as_str())))
    }

    /// Append a value to `key`.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => self.entries[i].values.push(value),
            None => {
                self.index.insert(key.to_lowercase(), self.entries.len());
                self.entries.push(Entry {
                    key,
                    values: vec![value],
                });
            }
        }
    }

    /// Replace the values of `key`.
    pub fn set(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(i) => self.entries[i].values = values,
            None => {
                self.index.insert(key.to_lowercase(), self.entries.len());
                self.entries.push(Entry { key, values });
            }
        }
    }

    /// Replace `key` with a single value.
    pub fn set_one(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, vec![value.into()]);
    }

    /// Overwrite the value at position `i` of `key`, appending if out of range.
    pub fn set_index(&mut self, key: &str, i: usize, value: impl Into<String>) {
        let value = value.into();
        match self.position(key) {
            Some(pos) => {
                let values = &mut self.entries[pos].values;
                if i < values.len() {
                    values[i] = value;
                } else {
                    values.push(value);
                }
            }
            None => self.add(key.to_string(), value),
        }
    }

    /// Remove `key` and all its values.
    pub fn remove(&mut self, key: &str) {
        if let Some(pos) = self.position(key) {
            self.entries.remove(pos);
            self.reindex();
        }
    }

    /// Remove every key matching `re`.
    pub fn remove_regex(&mut self, re: &Regex) {
        let before = self.entries.len();
        self.entries.retain(|e| !re.is_match(&e.key));
        if self.entries.len() != before {
            self.reindex();
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.to_lowercase(), i))
            .collect();
    }

    /// Number of values (not keys).
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }

    /// Whether the map has no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Parse the first value of `key` as an integer, defaulting to 0.
    pub fn get_int(&self, key: &str) -> i64 {
        self.first(key)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }
}
