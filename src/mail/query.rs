//! OData query options for Graph list and search calls.

use crate::error::{GraphError, GraphResult};

/// Query options Graph accepts on mailbox resources.
pub const QUERY_OPTIONS: [&str; 9] = [
    "count", "expand", "filter", "format", "orderby", "search", "select", "skip", "top",
];

/// Ordered `(option, value)` pairs.
///
/// Setting an option that is already present replaces its value but keeps
/// its position, so serialization order follows first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilters {
    entries: Vec<(String, String)>,
}

impl QueryFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`QueryFilters::set`].
    pub fn with(mut self, option: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(option, value);
        self
    }

    pub fn set(&mut self, option: impl Into<String>, value: impl Into<String>) {
        let option = option.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == option) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((option, value)),
        }
    }

    pub fn get(&self, option: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == option)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Overlay `other` on top of `self`; keys from `other` win.
    pub fn merged(mut self, other: &QueryFilters) -> Self {
        for (key, value) in &other.entries {
            self.set(key.clone(), value.clone());
        }
        self
    }

    /// Serialize as `?$k1=v1&k2=v2`.
    ///
    /// Only the first option carries the `$` prefix; Graph v1.0 accepts
    /// options with or without it. Values are percent-encoded. Unknown
    /// options fail with [`GraphError::Validation`].
    pub fn to_query_string(&self) -> GraphResult<String> {
        let invalid: Vec<&str> = self
            .entries
            .iter()
            .map(|(key, _)| key.as_str())
            .filter(|key| !is_query_option(key))
            .collect();
        if !invalid.is_empty() {
            return Err(GraphError::Validation(format!(
                "Invalid query options [{}], expected one of [{}]",
                invalid.join(", "),
                QUERY_OPTIONS.join(", ")
            )));
        }

        let mut query = String::new();
        for (index, (key, value)) in self.entries.iter().enumerate() {
            query.push_str(if index == 0 { "?$" } else { "&" });
            query.push_str(key);
            query.push('=');
            query.push_str(&urlencoding::encode(value));
        }
        Ok(query)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryFilters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut filters = Self::new();
        for (key, value) in iter {
            filters.set(key, value);
        }
        filters
    }
}

fn is_query_option(key: &str) -> bool {
    QUERY_OPTIONS
        .iter()
        .any(|option| option.eq_ignore_ascii_case(key))
}
