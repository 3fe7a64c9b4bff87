use std::collections::HashSet;

use crate::cache::BaseQuery;
use crate::error::ConsistencyFault;
use crate::source::{Page, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { added: usize, duplicates: usize },
    Rejected(ConsistencyFault),
}

/// Ordered rows assembled from consecutive pages of one base query.
///
/// Pages are accepted strictly in index order with no gaps; rows whose
/// identity is already present are skipped. The total count always comes
/// from the newest accepted page.
#[derive(Debug, Clone)]
pub struct Accumulator<R: Row> {
    base: BaseQuery,
    rows: Vec<R>,
    ids: HashSet<R::Id>,
    pages_appended: usize,
    total_count: Option<usize>,
}

impl<R: Row> Accumulator<R> {
    pub fn new(base: BaseQuery) -> Self {
        Self {
            base,
            rows: Vec::new(),
            ids: HashSet::new(),
            pages_appended: 0,
            total_count: None,
        }
    }

    pub fn base(&self) -> &BaseQuery {
        &self.base
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn total_count(&self) -> Option<usize> {
        self.total_count
    }

    pub fn pages_appended(&self) -> usize {
        self.pages_appended
    }

    /// Index of the only page that may be appended next
    pub fn expected_page(&self) -> usize {
        self.pages_appended
    }

    /// Unknown until the first page lands
    pub fn has_next_page(&self) -> bool {
        match self.total_count {
            None => true,
            Some(total) => self.pages_appended.saturating_mul(self.base.page_size) < total,
        }
    }

    /// Every appended page was full and contributed all of its rows, so the
    /// next page starts exactly at `len()`.
    pub fn is_aligned(&self) -> bool {
        self.rows.len() == self.pages_appended.saturating_mul(self.base.page_size)
    }

    pub fn offer(&mut self, page: &Page<R>) -> AppendOutcome {
        if page.page_index != self.pages_appended {
            return AppendOutcome::Rejected(ConsistencyFault {
                base: self.base.to_string(),
                expected: self.pages_appended,
                received: page.page_index,
            });
        }

        let mut added = 0;
        let mut duplicates = 0;
        for row in &page.rows {
            if self.ids.insert(row.id()) {
                self.rows.push(row.clone());
                added += 1;
            } else {
                duplicates += 1;
            }
        }
        self.pages_appended += 1;

        // An empty page means the source has nothing more, whatever it
        // reported as the total
        self.total_count = if page.rows.is_empty() {
            Some(self.rows.len())
        } else {
            Some(page.total_count)
        };

        AppendOutcome::Appended { added, duplicates }
    }

    /// Drop everything and start over for `base`
    pub fn reset(&mut self, base: BaseQuery) {
        self.base = base;
        self.rows.clear();
        self.ids.clear();
        self.pages_appended = 0;
        self.total_count = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(usize);

    impl Row for Item {
        type Id = usize;

        fn id(&self) -> usize {
            self.0
        }
    }

    fn page(index: usize, size: usize, total: usize) -> Page<Item> {
        let start = index * size;
        let end = (start + size).min(total);
        Page {
            rows: (start..end).map(Item).collect(),
            total_count: total,
            page_index: index,
        }
    }

    #[test]
    fn test_contiguous_pages_append() {
        let mut acc = Accumulator::new(BaseQuery::new("users", 50));
        assert!(acc.has_next_page());

        for i in 0..3 {
            assert!(matches!(acc.offer(&page(i, 50, 120)), AppendOutcome::Appended { .. }));
        }
        assert_eq!(acc.len(), 120);
        assert_eq!(acc.total_count(), Some(120));
        assert!(!acc.has_next_page());
    }

    #[test]
    fn test_out_of_order_arrivals_yield_index_order() {
        let size = 10;
        let total = 55;
        let pages: Vec<Page<Item>> = (0..6).map(|i| page(i, size, total)).collect();
        let mut acc = Accumulator::new(BaseQuery::new("users", size));

        // Completion order 3, 1, 0, 5, 2, 4; rejected pages are retried until
        // every page has been appended
        let mut pending: Vec<usize> = vec![3, 1, 0, 5, 2, 4];
        while !pending.is_empty() {
            pending.retain(|&i| match acc.offer(&pages[i]) {
                AppendOutcome::Appended { .. } => false,
                AppendOutcome::Rejected(fault) => {
                    assert_eq!(fault.received, i);
                    assert_eq!(fault.expected, acc.expected_page());
                    true
                }
            });
        }

        let expected: Vec<Item> = pages.iter().flat_map(|p| p.rows.clone()).collect();
        assert_eq!(acc.rows(), expected.as_slice());
    }

    #[test]
    fn test_gap_is_rejected() {
        let mut acc = Accumulator::new(BaseQuery::new("users", 50));
        acc.offer(&page(0, 50, 200));
        let outcome = acc.offer(&page(2, 50, 200));
        assert_eq!(
            outcome,
            AppendOutcome::Rejected(ConsistencyFault {
                base: "users[size=50]".into(),
                expected: 1,
                received: 2,
            })
        );
        assert_eq!(acc.len(), 50);
    }

    #[test]
    fn test_duplicates_skipped_and_alignment_lost() {
        let mut acc = Accumulator::new(BaseQuery::new("users", 3));
        acc.offer(&Page { rows: vec![Item(1), Item(2), Item(3)], total_count: 9, page_index: 0 });
        assert!(acc.is_aligned());

        // A row was inserted upstream, shifting item 3 onto the next page
        let outcome = acc.offer(&Page { rows: vec![Item(3), Item(4), Item(5)], total_count: 10, page_index: 1 });
        assert_eq!(outcome, AppendOutcome::Appended { added: 2, duplicates: 1 });
        assert_eq!(acc.len(), 5);
        assert!(!acc.is_aligned());
        // Newest page wins
        assert_eq!(acc.total_count(), Some(10));
    }

    #[test]
    fn test_empty_page_ends_the_list() {
        let mut acc = Accumulator::new(BaseQuery::new("users", 50));
        acc.offer(&page(0, 50, 500));
        acc.offer(&Page { rows: vec![], total_count: 500, page_index: 1 });
        assert_eq!(acc.total_count(), Some(50));
        assert!(!acc.has_next_page());
    }

    #[test]
    fn test_reset() {
        let mut acc = Accumulator::new(BaseQuery::new("users", 50));
        acc.offer(&page(0, 50, 120));
        let next = BaseQuery::new("users", 50).with_search(Some("ann".into()));
        acc.reset(next.clone());
        assert!(acc.is_empty());
        assert_eq!(acc.base(), &next);
        assert_eq!(acc.total_count(), None);
        assert_eq!(acc.expected_page(), 0);
    }
}
