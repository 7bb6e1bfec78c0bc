use chrono::{DateTime, Utc};

/// A versioned code artifact. At most one row has `superseded_at = None` —
/// the active deployment — at any moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: i64,
    pub commit_id: String,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl Deployment {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }
}
