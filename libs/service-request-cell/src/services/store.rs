use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::feed::RequestFeeds;
use crate::{
    AtomicOp, Committed, RequestPatch, RequestQuery, RequestSnapshot, Review, ServiceRequest,
    StoreError, VisitRecord,
};

/// Persistence contract for requests and visit records.
///
/// Every successful write is published on [`RequestStore::feeds`] before the
/// call returns.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn insert(&self, request: ServiceRequest) -> Result<ServiceRequest, StoreError>;

    async fn get(&self, id: Uuid) -> Result<ServiceRequest, StoreError>;

    /// Applies `patch`, bumping `version` and `updated_at`. With
    /// `expected_version` the write is a compare-and-set.
    async fn update(
        &self,
        id: Uuid,
        patch: RequestPatch,
        expected_version: Option<u64>,
    ) -> Result<ServiceRequest, StoreError>;

    async fn list(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>, StoreError>;

    /// All-or-nothing batch. `completed_at` of created records is assigned here.
    async fn run_atomic(&self, ops: Vec<AtomicOp>) -> Result<Committed, StoreError>;

    async fn get_record(&self, id: Uuid) -> Result<VisitRecord, StoreError>;

    async fn record_for_request(&self, request_id: Uuid) -> Result<Option<VisitRecord>, StoreError>;

    /// Newest first.
    async fn records_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<VisitRecord>, StoreError>;

    async fn attach_review(&self, record_id: Uuid, review: Review) -> Result<VisitRecord, StoreError>;

    fn feeds(&self) -> &RequestFeeds;
}

/// Strictly after the doctor's previous completion.
pub fn next_completed_at(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

#[derive(Default)]
struct StoreState {
    requests: HashMap<Uuid, ServiceRequest>,
    records: HashMap<Uuid, VisitRecord>,
    record_by_request: HashMap<Uuid, Uuid>,
    last_completed: HashMap<Uuid, DateTime<Utc>>,
}

/// Process-local store. A single `RwLock` linearizes writes and snapshots are
/// published while the write guard is held.
pub struct InMemoryRequestStore {
    state: Arc<RwLock<StoreState>>,
    feeds: RequestFeeds,
    injected_aborts: AtomicU32,
}

impl InMemoryRequestStore {
    pub fn new(feeds: RequestFeeds) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            feeds,
            injected_aborts: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` calls to `run_atomic` abort as if the backend
    /// had rejected the transaction.
    pub fn inject_atomic_failures(&self, count: u32) {
        self.injected_aborts.store(count, Ordering::SeqCst);
    }

    pub async fn request_count(&self) -> usize {
        self.state.read().await.requests.len()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    fn take_injected_abort(&self) -> bool {
        self.injected_aborts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new(RequestFeeds::default())
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn insert(&self, mut request: ServiceRequest) -> Result<ServiceRequest, StoreError> {
        let mut state = self.state.write().await;
        if state.requests.contains_key(&request.id) {
            return Err(StoreError::Conflict {
                expected: 0,
                actual: request.version,
            });
        }

        request.version = 1;
        state.requests.insert(request.id, request.clone());
        self.feeds.publish_request(RequestSnapshot::of(&request)).await;

        debug!("Inserted service request {}", request.id);
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<ServiceRequest, StoreError> {
        let state = self.state.read().await;
        state.requests.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn update(
        &self,
        id: Uuid,
        patch: RequestPatch,
        expected_version: Option<u64>,
    ) -> Result<ServiceRequest, StoreError> {
        let mut state = self.state.write().await;
        let current = state.requests.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(StoreError::Conflict {
                    expected,
                    actual: current.version,
                });
            }
        }

        patch.apply_to(current);
        current.version += 1;
        current.updated_at = Utc::now();
        let updated = current.clone();

        self.feeds.publish_request(RequestSnapshot::of(&updated)).await;
        Ok(updated)
    }

    async fn list(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>, StoreError> {
        let state = self.state.read().await;
        let mut requests: Vec<ServiceRequest> = state
            .requests
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn run_atomic(&self, ops: Vec<AtomicOp>) -> Result<Committed, StoreError> {
        let mut state = self.state.write().await;

        if self.take_injected_abort() {
            warn!("Atomic batch aborted by injected failure");
            return Err(StoreError::Aborted("injected failure".to_string()));
        }

        // Validate the whole batch before touching anything.
        for op in &ops {
            match op {
                AtomicOp::CreateRecord(record) => {
                    if state.record_by_request.contains_key(&record.request_id) {
                        return Err(StoreError::DuplicateRecord(record.request_id));
                    }
                }
                AtomicOp::DeleteRequest { id, expected_version } => {
                    let current = state.requests.get(id).ok_or(StoreError::NotFound(*id))?;
                    if current.version != *expected_version {
                        return Err(StoreError::Conflict {
                            expected: *expected_version,
                            actual: current.version,
                        });
                    }
                }
            }
        }

        let mut committed = Committed::default();
        let mut tombstones = Vec::new();
        for op in ops {
            match op {
                AtomicOp::CreateRecord(mut record) => {
                    let completed_at =
                        next_completed_at(state.last_completed.get(&record.doctor_id).copied(), Utc::now());
                    record.completed_at = completed_at;
                    state.last_completed.insert(record.doctor_id, completed_at);
                    state.record_by_request.insert(record.request_id, record.id);
                    state.records.insert(record.id, record.clone());
                    committed.records.push(record);
                }
                AtomicOp::DeleteRequest { id, .. } => {
                    if let Some(removed) = state.requests.remove(&id) {
                        tombstones.push(RequestSnapshot::tombstone(&removed));
                        committed.deleted.push(id);
                    }
                }
            }
        }

        for tombstone in tombstones {
            self.feeds.publish_request(tombstone).await;
        }
        for record in &committed.records {
            self.feeds.publish_record(record.clone()).await;
        }

        Ok(committed)
    }

    async fn get_record(&self, id: Uuid) -> Result<VisitRecord, StoreError> {
        let state = self.state.read().await;
        state.records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn record_for_request(&self, request_id: Uuid) -> Result<Option<VisitRecord>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .record_by_request
            .get(&request_id)
            .and_then(|record_id| state.records.get(record_id))
            .cloned())
    }

    async fn records_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<VisitRecord>, StoreError> {
        let state = self.state.read().await;
        let mut records: Vec<VisitRecord> = state
            .records
            .values()
            .filter(|r| r.doctor_id == doctor_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(records)
    }

    async fn attach_review(&self, record_id: Uuid, review: Review) -> Result<VisitRecord, StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or(StoreError::NotFound(record_id))?;

        if record.review.is_some() {
            return Err(StoreError::AlreadyReviewed(record_id));
        }

        record.review = Some(review);
        let updated = record.clone();
        self.feeds.publish_record(updated.clone()).await;
        Ok(updated)
    }

    fn feeds(&self) -> &RequestFeeds {
        &self.feeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_at_never_repeats_for_a_doctor() {
        let now = Utc::now();
        assert_eq!(next_completed_at(None, now), now);
        assert!(next_completed_at(Some(now), now) > now);
        let earlier = now - Duration::seconds(5);
        assert_eq!(next_completed_at(Some(earlier), now), now);
    }
}
