//! Row models returned by the repository.

/// Result of one successful upsert: the surrogate post id and how many line
/// items were written alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedPost {
    pub id: i64,
    pub line_items: usize,
}

/// A stored line item, as read back for inspection.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LineItemRow {
    pub post_id: i64,
    pub name: String,
    pub size: String,
    pub price: String,
}
