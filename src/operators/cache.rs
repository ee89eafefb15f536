//! Process-wide memoization of compiled matchers.
//!
//! Regexes and Aho-Corasick automata are keyed by their source text and
//! shared across rules and transactions. Each entry is built once: callers
//! racing on the same key block on the same cell instead of compiling twice.
//! Only patterns fixed at rule compile time go through the cache; patterns
//! expanded from request data use [`build_regex`] directly.

use aho_corasick::{AhoCorasick, MatchKind};
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;

/// A keyed single-flight cache.
pub(crate) struct Memo<T> {
    cells: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone> Memo<T> {
    fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, building it with `build` if absent.
    pub(crate) fn get_or_try_init<E>(
        &self,
        key: &str,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let cell = {
            let mut cells = self.cells.lock();
            cells.entry(key.to_string()).or_default().clone()
        };
        let result = cell.get_or_try_init(build).cloned();
        if result.is_err() {
            let mut cells = self.cells.lock();
            if cells.get(key).is_some_and(|c| c.get().is_none()) {
                cells.remove(key);
            }
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cells.lock().len()
    }
}

static REGEXES: Lazy<Memo<Regex>> = Lazy::new(Memo::new);
static PHRASES: Lazy<Memo<Arc<AhoCorasick>>> = Lazy::new(Memo::new);

/// Compile a regex with dot-matches-newline on, bypassing the cache.
pub(crate) fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .size_limit(32 * 1024 * 1024)
        .build()
}

/// Compile (or fetch) a regex with dot-matches-newline on.
pub(crate) fn regex(pattern: &str) -> Result<Regex, regex::Error> {
    REGEXES.get_or_try_init(pattern, || build_regex(pattern))
}

/// Build (or fetch) a case-insensitive leftmost-longest automaton.
pub(crate) fn phrases(patterns: &[String]) -> Result<Arc<AhoCorasick>, aho_corasick::BuildError> {
    let key = patterns.join("\n");
    PHRASES.get_or_try_init(&key, || {
        AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(patterns)
            .map(Arc::new)
    })
}
