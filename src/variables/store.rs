//! Per-transaction storage for every variable in the catalog.

use super::collection::Map;
use super::name::{VariableKind, VariableName};
use chrono::{Datelike, Local, Timelike};
use std::time::Instant;

/// One slot per catalog variable, indexed by [`VariableName`].
///
/// Single variables live in `singles`, stored maps in `maps`. Views
/// (`ARGS`, `*_NAMES`, `XML`) and computed variables have no storage of
/// their own; see [`super::resolver`].
#[derive(Debug, Clone)]
pub struct TransactionVariables {
    singles: Vec<Option<String>>,
    maps: Vec<Map>,
    started: Instant,
}

impl Default for TransactionVariables {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionVariables {
    /// Create an empty variable set.
    pub fn new() -> Self {
        let mut vars = Self {
            singles: vec![None; VariableName::COUNT],
            maps: vec![Map::new(); VariableName::COUNT],
            started: Instant::now(),
        };
        vars.set(VariableName::HighestSeverity, "255");
        vars
    }

    /// Value of a single variable.
    pub fn get(&self, name: VariableName) -> Option<&str> {
        self.singles[name as usize].as_deref()
    }

    /// Set a single variable.
    pub fn set(&mut self, name: VariableName, value: impl Into<String>) {
        self.singles[name as usize] = Some(value.into());
    }

    /// Clear a single variable.
    pub fn unset(&mut self, name: VariableName) {
        self.singles[name as usize] = None;
    }

    /// Stored map for `name`. Views and singles return an empty map.
    pub fn map(&self, name: VariableName) -> &Map {
        &self.maps[name as usize]
    }

    /// Mutable stored map for `name`.
    pub fn map_mut(&mut self, name: VariableName) -> &mut Map {
        &mut self.maps[name as usize]
    }

    /// Shorthand for the TX collection.
    pub fn tx(&self) -> &Map {
        self.map(VariableName::Tx)
    }

    /// Mutable shorthand for the TX collection.
    pub fn tx_mut(&mut self) -> &mut Map {
        self.map_mut(VariableName::Tx)
    }

    /// Time since the variables were created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Scalar value of a variable as macros and logs see it.
    ///
    /// Collections yield their first value, computed variables are
    /// evaluated now.
    pub fn value(&self, name: VariableName) -> Option<String> {
        match name.kind() {
            VariableKind::Single => self.get(name).map(str::to_string),
            VariableKind::Computed => Some(self.computed(name)),
            VariableKind::Map => self.map(name).iter().next().map(|(_, v)| v.to_string()),
            VariableKind::Concat(parts) => parts
                .iter()
                .find_map(|p| self.map(*p).iter().next().map(|(_, v)| v.to_string())),
            VariableKind::Names(parts) => parts
                .iter()
                .find_map(|p| self.map(*p).keys().next().map(str::to_string)),
        }
    }

    /// Value of `name[key]`; for single variables the key is ignored.
    pub fn value_of(&self, name: VariableName, key: &str) -> Option<String> {
        match name.kind() {
            VariableKind::Map => self.map(name).first(key).map(str::to_string),
            VariableKind::Concat(parts) => parts
                .iter()
                .find_map(|p| self.map(*p).first(key).map(str::to_string)),
            _ => self.value(name),
        }
    }

    pub(crate) fn computed(&self, name: VariableName) -> String {
        let now = Local::now();
        match name {
            VariableName::Time => now.format("%H:%M:%S").to_string(),
            VariableName::TimeEpoch => now.timestamp().to_string(),
            VariableName::TimeDay => now.day().to_string(),
            VariableName::TimeHour => now.hour().to_string(),
            VariableName::TimeMin => now.minute().to_string(),
            VariableName::TimeSec => now.second().to_string(),
            VariableName::TimeWday => now.weekday().num_days_from_sunday().to_string(),
            VariableName::TimeMon => now.month().to_string(),
            VariableName::TimeYear => now.year().to_string(),
            VariableName::Duration => self.elapsed().as_micros().to_string(),
            VariableName::ArgsCombinedSize => {
                let size: usize = [VariableName::ArgsGet, VariableName::ArgsPost, VariableName::ArgsPath]
                    .iter()
                    .flat_map(|p| self.map(*p).iter())
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                size.to_string()
            }
            _ => String::new(),
        }
    }

    /// Current numeric highest severity (255 when nothing matched).
    pub fn highest_severity(&self) -> u8 {
        self.get(VariableName::HighestSeverity)
            .and_then(|s| s.parse().ok())
            .unwrap_or(255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singles_and_maps() {
        let mut vars = TransactionVariables::new();
        assert_eq!(vars.get(VariableName::RequestMethod), None);
        vars.set(VariableName::RequestMethod, "GET");
        assert_eq!(vars.get(VariableName::RequestMethod), Some("GET"));

        vars.map_mut(VariableName::ArgsGet).add("id", "1");
        assert_eq!(vars.value_of(VariableName::Args, "ID").as_deref(), Some("1"));
        assert_eq!(vars.value(VariableName::ArgsNames).as_deref(), Some("id"));
    }

    #[test]
    fn test_computed_values() {
        let mut vars = TransactionVariables::new();
        vars.map_mut(VariableName::ArgsGet).add("a", "123");
        vars.map_mut(VariableName::ArgsPost).add("bb", "4");
        assert_eq!(vars.value(VariableName::ArgsCombinedSize).as_deref(), Some("7"));

        let year: i32 = vars.value(VariableName::TimeYear).unwrap().parse().unwrap();
        assert!(year >= 2024);
        assert!(vars.value(VariableName::Duration).is_some());
    }

    #[test]
    fn test_highest_severity_default() {
        let vars = TransactionVariables::new();
        assert_eq!(vars.highest_severity(), 255);
    }
}
