use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Column filters applied to a query, ordered by column name so that two
/// filter sets with the same pairs always compare and hash equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Filters(BTreeMap<String, String>);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a filter, returning self for chaining
    pub fn with(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.0.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<String> {
        self.0.remove(column)
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Filters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Blank search terms mean "no search"
fn normalize_search(search: Option<String>) -> Option<String> {
    search
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Deterministic identifier of one cached query.
///
/// Component order is (resource, page index, page size, search, filters) and
/// equality is structural over all of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub resource: String,
    pub page_index: Option<usize>,
    pub page_size: Option<usize>,
    pub search: Option<String>,
    pub filters: Filters,
}

impl QueryKey {
    /// Key for a non-paginated query (summaries, single resources)
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            page_index: None,
            page_size: None,
            search: None,
            filters: Filters::default(),
        }
    }

    /// Key for the summary of a metric group
    pub fn summary(group: &str) -> Self {
        Self::resource(format!("{}/summary", group))
    }

    /// The base query this key belongs to, if it is a page key
    pub fn base(&self) -> Option<BaseQuery> {
        self.page_size.map(|page_size| BaseQuery {
            resource: self.resource.clone(),
            page_size,
            search: self.search.clone(),
            filters: self.filters.clone(),
        })
    }

    /// Whether this key is a page of the given base query
    pub fn belongs_to(&self, base: &BaseQuery) -> bool {
        self.page_index.is_some()
            && self.resource == base.resource
            && self.page_size == Some(base.page_size)
            && self.search == base.search
            && self.filters == base.filters
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(page) = self.page_index {
            write!(f, "[page={}", page)?;
            if let Some(size) = self.page_size {
                write!(f, ",size={}", size)?;
            }
            write!(f, "]")?;
        }
        if let Some(ref search) = self.search {
            write!(f, "?search={}", search)?;
        }
        for (column, value) in self.filters.iter() {
            write!(f, "&{}={}", column, value)?;
        }
        Ok(())
    }
}

/// A query key without its page index: every page of one scrollable list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseQuery {
    pub resource: String,
    pub page_size: usize,
    pub search: Option<String>,
    pub filters: Filters,
}

impl BaseQuery {
    pub fn new(resource: impl Into<String>, page_size: usize) -> Self {
        Self {
            resource: resource.into(),
            page_size,
            search: None,
            filters: Filters::default(),
        }
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = normalize_search(search);
        self
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// The cache key for one page of this query
    pub fn page(&self, page_index: usize) -> QueryKey {
        QueryKey {
            resource: self.resource.clone(),
            page_index: Some(page_index),
            page_size: Some(self.page_size),
            search: self.search.clone(),
            filters: self.filters.clone(),
        }
    }
}

impl fmt::Display for BaseQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[size={}]", self.resource, self.page_size)?;
        if let Some(ref search) = self.search {
            write!(f, "?search={}", search)?;
        }
        for (column, value) in self.filters.iter() {
            write!(f, "&{}={}", column, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_keys_are_structurally_equal() {
        let a = BaseQuery::new("users", 50)
            .with_filters(Filters::new().with("plan", "pro").with("status", "active"))
            .page(2);
        let b = BaseQuery::new("users", 50)
            .with_filters(Filters::new().with("status", "active").with("plan", "pro"))
            .page(2);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_keys_differ_by_any_component() {
        let base = BaseQuery::new("users", 50);
        assert_ne!(base.page(0), base.page(1));
        assert_ne!(base.page(0), BaseQuery::new("users", 25).page(0));
        assert_ne!(base.page(0), BaseQuery::new("payments", 50).page(0));
        assert_ne!(
            base.page(0),
            base.clone().with_search(Some("ann".into())).page(0)
        );
    }

    #[test]
    fn test_blank_search_normalizes_to_none() {
        let blank = BaseQuery::new("users", 50).with_search(Some("   ".into()));
        assert_eq!(blank, BaseQuery::new("users", 50));

        let padded = BaseQuery::new("users", 50).with_search(Some("  ann ".into()));
        assert_eq!(padded.search.as_deref(), Some("ann"));
    }

    #[test]
    fn test_base_round_trip_and_membership() {
        let base = BaseQuery::new("users", 50).with_search(Some("ann".into()));
        let key = base.page(3);
        assert_eq!(key.base(), Some(base.clone()));
        assert!(key.belongs_to(&base));
        assert!(!QueryKey::summary("users").belongs_to(&base));
        assert_eq!(QueryKey::summary("users").base(), None);
    }

    #[test]
    fn test_display() {
        let key = BaseQuery::new("users", 50)
            .with_search(Some("ann".into()))
            .with_filters(Filters::new().with("plan", "pro"))
            .page(1);
        assert_eq!(key.to_string(), "users[page=1,size=50]?search=ann&plan=pro");
    }
}
