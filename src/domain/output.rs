//! Results returned by the executor.

use serde::{Deserialize, Serialize};

use super::value::{Row, Value};

/// One page of a paginated result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Row>,
    pub total: u64,
    pub per_page: u64,
    pub current_page: u64,
}

impl Page {
    pub fn last_page(&self) -> u64 {
        if self.per_page == 0 {
            return 1;
        }
        self.total.div_ceil(self.per_page).max(1)
    }

    pub fn has_more_pages(&self) -> bool {
        self.current_page < self.last_page()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plucked {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    pub value: Value,
}

/// Result of a read operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Row(Option<Row>),
    Scalar(Value),
    Count(u64),
    Exists(bool),
    Plucked(Vec<Plucked>),
    Page(Page),
}

impl QueryOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rows(_) => "rows",
            Self::Row(_) => "row",
            Self::Scalar(_) => "scalar",
            Self::Count(_) => "count",
            Self::Exists(_) => "exists",
            Self::Plucked(_) => "plucked",
            Self::Page(_) => "page",
        }
    }

    pub fn rows(&self) -> &[Row] {
        match self {
            Self::Rows(rows) => rows,
            Self::Row(Some(row)) => std::slice::from_ref(row),
            Self::Page(page) => &page.items,
            _ => &[],
        }
    }

    /// Drops pivot-parent back-references from every row. Returns how many
    /// were removed.
    pub fn strip_pivot_parents(&mut self) -> usize {
        let rows: &mut [Row] = match self {
            Self::Rows(rows) => rows,
            Self::Row(Some(row)) => std::slice::from_mut(row),
            Self::Page(page) => &mut page.items,
            _ => return 0,
        };

        rows.iter_mut()
            .filter_map(|row| row.pivot.as_mut())
            .filter_map(|pivot| pivot.parent.take())
            .count()
    }
}
