//! Page-numbered windows over query results, loaded with
//! [`Query::page`](crate::query::Query::page).

use serde::Serialize;

/// Which page of results to load. Pages are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationParams {
    page: usize,
    per_page: usize,
}

impl PaginationParams {
    /// Page numbers and sizes below 1 are raised to 1.
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn per_page(&self) -> usize {
        self.per_page
    }

    /// Number of matches before this page.
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.per_page)
    }
}

/// One page of matches together with the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub count: usize,
    pub next_page: Option<usize>,
    pub previous_page: Option<usize>,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, count: usize, params: &PaginationParams) -> Self {
        let shown = params.offset().saturating_add(params.per_page);
        Self {
            items,
            count,
            next_page: (shown < count).then(|| params.page + 1),
            previous_page: (params.page > 1).then(|| params.page - 1),
        }
    }

    pub fn is_last(&self) -> bool {
        self.next_page.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_page_and_size_mean_the_first_page_of_one() {
        let params = PaginationParams::new(0, 0);
        assert_eq!((params.page(), params.per_page(), params.offset()), (1, 1, 0));
        assert_eq!(PaginationParams::new(3, 20).offset(), 40);
    }

    #[test]
    fn neighbours_depend_on_the_total() {
        let middle = Page::new(vec![3, 4], 5, &PaginationParams::new(2, 2));
        assert_eq!((middle.previous_page, middle.next_page), (Some(1), Some(3)));

        let last = Page::new(vec![5], 5, &PaginationParams::new(3, 2));
        assert_eq!((last.previous_page, last.next_page), (Some(2), None));
        assert!(last.is_last());

        let exact = Page::new(vec![1, 2], 4, &PaginationParams::new(2, 2));
        assert!(exact.is_last());

        let beyond = Page::<i32>::new(Vec::new(), 1, &PaginationParams::new(usize::MAX, usize::MAX));
        assert!(beyond.is_last());
    }
}
