//! Domain models shared across termscope crates.

pub mod dimension;
pub mod terminology;

pub use dimension::*;
pub use terminology::*;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Embedding vector type (re-exported from pgvector).
pub use pgvector::Vector;

/// Organization (tenant) id. Every entity is owned by exactly one.
pub type OrgId = i64;

/// Acting user id, stamped on mutations.
pub type UserId = i64;

// =============================================================================
// PAGINATION
// =============================================================================

fn default_page() -> i64 {
    defaults::FIRST_PAGE
}

fn default_page_size() -> i64 {
    defaults::PAGE_SIZE
}

/// Requested page, before clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: defaults::FIRST_PAGE,
            page_size: defaults::PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        Self { page, page_size }
    }

    /// Clamp this request against `total_count` matching rows.
    pub fn window(&self, total_count: i64) -> PageWindow {
        PageWindow::compute(total_count, self.page, self.page_size)
    }
}

/// Effective page bounds after clamping.
///
/// `page_size` lands in `[1, PAGE_SIZE_MAX]`; `current_page` lands in
/// `[1, total_pages]`, where `total_pages` is at least 1 even for an empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub current_page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl PageWindow {
    pub fn compute(total_count: i64, page: i64, page_size: i64) -> Self {
        let page_size = page_size.clamp(1, defaults::PAGE_SIZE_MAX);
        let total_count = total_count.max(0);
        let total_pages = if total_count > 0 {
            (total_count + page_size - 1) / page_size
        } else {
            1
        };
        let current_page = page.clamp(1, total_pages);
        Self {
            current_page,
            page_size,
            total_pages,
        }
    }

    /// Row offset of the first item on the current page.
    pub fn offset(&self) -> i64 {
        (self.current_page - 1) * self.page_size
    }
}

/// One page of results plus the clamped window and total count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub current_page: i64,
    pub page_size: i64,
    pub total_count: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, window: PageWindow, total_count: i64) -> Self {
        Self {
            items,
            current_page: window.current_page,
            page_size: window.page_size,
            total_count,
            total_pages: window.total_pages,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            current_page: self.current_page,
            page_size: self.page_size,
            total_count: self.total_count,
            total_pages: self.total_pages,
        }
    }
}

/// Trim a string, returning `None` when nothing is left.
pub fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window_clamps_page_size() {
        assert_eq!(PageWindow::compute(500, 1, 0).page_size, 1);
        assert_eq!(PageWindow::compute(500, 1, -3).page_size, 1);
        assert_eq!(PageWindow::compute(500, 1, 1000).page_size, 100);
        assert_eq!(PageWindow::compute(500, 1, 25).page_size, 25);
    }

    #[test]
    fn test_page_window_empty_set_has_one_page() {
        let w = PageWindow::compute(0, 5, 10);
        assert_eq!(w.total_pages, 1);
        assert_eq!(w.current_page, 1);
        assert_eq!(w.offset(), 0);
    }

    #[test]
    fn test_page_window_clamps_current_page() {
        let w = PageWindow::compute(21, 9, 10);
        assert_eq!(w.total_pages, 3);
        assert_eq!(w.current_page, 3);
        assert_eq!(w.offset(), 20);

        let w = PageWindow::compute(21, -1, 10);
        assert_eq!(w.current_page, 1);
    }

    #[test]
    fn test_page_window_bounds_hold_for_all_inputs() {
        for total in [0_i64, 1, 7, 99, 100, 101, 1000] {
            for page_size in [1_i64, 2, 10, 99, 100, 101, 500, 1000] {
                for page in [-5_i64, 0, 1, 2, 50, 10_000] {
                    let w = PageWindow::compute(total, page, page_size);
                    assert!((1..=100).contains(&w.page_size));
                    assert!(w.total_pages >= 1);
                    assert!(w.current_page >= 1 && w.current_page <= w.total_pages);
                    assert!(w.offset() <= total.max(0));
                }
            }
        }
    }

    #[test]
    fn test_page_map_keeps_window() {
        let page = Page::new(vec![1, 2, 3], PageWindow::compute(13, 2, 3), 13);
        let mapped = page.map(|n| n * 10);
        assert_eq!(mapped.items, vec![10, 20, 30]);
        assert_eq!(mapped.current_page, 2);
        assert_eq!(mapped.total_pages, 5);
        assert_eq!(mapped.total_count, 13);
    }

    #[test]
    fn test_trimmed() {
        assert_eq!(trimmed(Some("  x ")), Some("x".to_string()));
        assert_eq!(trimmed(Some("   ")), None);
        assert_eq!(trimmed(None), None);
    }
}
