//! Outstanding assignments keyed by correlation id
//!
//! Written by the dispatch path, read by the report path and the deadline
//! sweep. Every entry leaves the table exactly once: through `take` when a
//! valid report arrives, or through `expire_overdue` when its deadline passes.

use pulse_core::{Assignment, CorrelationId};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct AssignmentTable {
    outstanding: Mutex<HashMap<CorrelationId, Assignment>>,
}

impl AssignmentTable {
    pub async fn insert(&self, assignment: Assignment) {
        self.outstanding
            .lock()
            .await
            .insert(assignment.correlation_id.clone(), assignment);
    }

    /// Look without removing
    pub async fn get(&self, correlation_id: &str) -> Option<Assignment> {
        self.outstanding.lock().await.get(correlation_id).cloned()
    }

    /// Remove and return; `None` if already taken or expired
    pub async fn take(&self, correlation_id: &str) -> Option<Assignment> {
        self.outstanding.lock().await.remove(correlation_id)
    }

    /// Remove every assignment whose deadline has passed at `now`
    pub async fn expire_overdue(&self, now: Instant) -> Vec<Assignment> {
        let mut outstanding = self.outstanding.lock().await;
        let overdue: Vec<CorrelationId> = outstanding
            .values()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.correlation_id.clone())
            .collect();
        overdue
            .iter()
            .filter_map(|id| outstanding.remove(id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_take_is_exactly_once() {
        let table = AssignmentTable::default();
        let assignment = Assignment::new("http://a", "w-1", "v-1", Duration::from_secs(10));
        let id = assignment.correlation_id.clone();
        table.insert(assignment).await;

        assert!(table.get(&id).await.is_some());
        assert!(table.take(&id).await.is_some());
        assert!(table.take(&id).await.is_none());
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let table = AssignmentTable::default();
        let short = Assignment::new("http://a", "w-1", "v-1", Duration::from_millis(10));
        let long = Assignment::new("http://b", "w-2", "v-1", Duration::from_secs(60));
        let short_id = short.correlation_id.clone();
        table.insert(short).await;
        table.insert(long).await;

        let expired = table
            .expire_overdue(Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, short_id);
        assert_eq!(table.len().await, 1);

        // Expired entries cannot be taken afterwards
        assert!(table.take(&short_id).await.is_none());
    }
}
