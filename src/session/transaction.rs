//! Session-scoped transaction handle

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// An active transaction; no coordination beyond its own session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: String,
    started_at: DateTime<Utc>,
}

impl Transaction {
    pub(crate) fn begin() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
