//! Audit log part selection (`SecAuditLogParts`).

use std::fmt;

/// Parts written when nothing is configured.
pub const DEFAULT_PARTS: &str = "ABCFHZ";

/// Set of audit log parts, one bit per letter `A`..`Z`.
///
/// `A` transaction header, `B` request headers, `C` request body,
/// `E` response body, `F` response headers, `H` trailer, `I` request body
/// without files, `J` uploaded files, `K` matched rules, `Z` end marker.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuditLogParts(u32);

impl AuditLogParts {
    /// No parts.
    pub const fn empty() -> Self {
        Self(0)
    }

    fn bit(part: char) -> Option<u32> {
        let part = part.to_ascii_uppercase();
        part.is_ascii_uppercase().then(|| 1 << (part as u32 - 'A' as u32))
    }

    /// Exact set from a string of letters; unknown characters are ignored.
    fn from_letters(letters: &str) -> Self {
        Self(letters.chars().filter_map(Self::bit).fold(0, |acc, b| acc | b))
    }

    /// Parse a `SecAuditLogParts` value.
    ///
    /// A leading `+` or `-` adds to or removes from the default set,
    /// anything else replaces it.
    pub fn parse(value: &str) -> Self {
        let mut parts = Self::default();
        parts.apply_change(value);
        parts
    }

    /// Apply a `ctl:auditLogParts` style change to this set.
    pub fn apply_change(&mut self, change: &str) {
        let change = change.trim();
        if let Some(added) = change.strip_prefix('+') {
            self.0 |= Self::from_letters(added).0;
        } else if let Some(removed) = change.strip_prefix('-') {
            self.0 &= !Self::from_letters(removed).0;
        } else {
            *self = Self::from_letters(change);
        }
    }

    /// Whether `part` is selected.
    pub fn contains(&self, part: char) -> bool {
        Self::bit(part).is_some_and(|b| self.0 & b != 0)
    }

    /// Whether no part is selected.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Selected letters in alphabetical order.
    pub fn letters(&self) -> impl Iterator<Item = char> + '_ {
        ('A'..='Z').filter(move |c| self.contains(*c))
    }
}

impl Default for AuditLogParts {
    fn default() -> Self {
        Self::from_letters(DEFAULT_PARTS)
    }
}

impl fmt::Display for AuditLogParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.letters().try_for_each(|c| write!(f, "{}", c))
    }
}

impl fmt::Debug for AuditLogParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuditLogParts({})", self)
    }
}
