use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Connection;
use redis::AsyncCommands;
use tracing::{debug, warn};
use uuid::Uuid;

use shared_database::RedisPool;

use crate::services::feed::RequestFeeds;
use crate::services::store::{next_completed_at, RequestStore};
use crate::{
    AtomicOp, Committed, RequestPatch, RequestQuery, RequestSnapshot, Review, ServiceRequest,
    StoreError, VisitRecord,
};

/// Redis-backed store. Compare-and-set and the completion batch use
/// `WATCH` + `MULTI/EXEC`; snapshots are published once `EXEC` has committed.
pub struct RedisRequestStore {
    pool: RedisPool,
    feeds: RequestFeeds,
}

impl RedisRequestStore {
    pub fn new(pool: RedisPool, feeds: RequestFeeds) -> Self {
        Self { pool, feeds }
    }

    fn request_key(&self, id: Uuid) -> String {
        self.pool.key(&format!("service_request:{}", id))
    }

    fn request_index_key(&self) -> String {
        self.pool.key("service_requests")
    }

    fn record_key(&self, id: Uuid) -> String {
        self.pool.key(&format!("visit_record:{}", id))
    }

    fn record_by_request_key(&self, request_id: Uuid) -> String {
        self.pool.key(&format!("visit_record_by_request:{}", request_id))
    }

    fn doctor_records_key(&self, doctor_id: Uuid) -> String {
        self.pool.key(&format!("doctor_records:{}", doctor_id))
    }

    fn doctor_last_completed_key(&self, doctor_id: Uuid) -> String {
        self.pool.key(&format!("doctor_last_completed:{}", doctor_id))
    }

    async fn connection(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    async fn load_request(
        &self,
        conn: &mut Connection,
        id: Uuid,
    ) -> Result<Option<ServiceRequest>, StoreError> {
        let raw: Option<String> = conn.get(self.request_key(id)).await?;
        raw.map(|data| serde_json::from_str(&data))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn load_record(
        &self,
        conn: &mut Connection,
        id: Uuid,
    ) -> Result<Option<VisitRecord>, StoreError> {
        let raw: Option<String> = conn.get(self.record_key(id)).await?;
        raw.map(|data| serde_json::from_str(&data))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn watch(conn: &mut Connection, keys: &[String]) -> Result<(), StoreError> {
        let _: () = redis::cmd("WATCH").arg(keys).query_async(conn).await?;
        Ok(())
    }

    async fn unwatch(conn: &mut Connection) {
        let result: redis::RedisResult<()> = redis::cmd("UNWATCH").query_async(conn).await;
        if let Err(e) = result {
            warn!("UNWATCH failed: {}", e);
        }
    }

    /// Clears the watch after a failed watched section. The connection goes
    /// back to the pool either way and must not carry keys into its next
    /// transaction.
    async fn release_on_err<T>(
        conn: &mut Connection,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        if result.is_err() {
            Self::unwatch(conn).await;
        }
        result
    }

    async fn update_watched(
        &self,
        conn: &mut Connection,
        id: Uuid,
        patch: RequestPatch,
        expected_version: Option<u64>,
    ) -> Result<ServiceRequest, StoreError> {
        let mut request = self
            .load_request(conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        if let Some(expected) = expected_version {
            if request.version != expected {
                return Err(StoreError::Conflict {
                    expected,
                    actual: request.version,
                });
            }
        }

        let read_version = request.version;
        patch.apply_to(&mut request);
        request.version += 1;
        request.updated_at = Utc::now();
        let data = serde_json::to_string(&request)?;

        let committed: Option<redis::Value> = redis::pipe()
            .atomic()
            .set(self.request_key(id), data)
            .query_async(conn)
            .await?;

        if committed.is_none() {
            // Someone else wrote between WATCH and EXEC.
            return Err(StoreError::Conflict {
                expected: read_version,
                actual: read_version + 1,
            });
        }
        Ok(request)
    }

    async fn commit_watched_batch(
        &self,
        conn: &mut Connection,
        ops: Vec<AtomicOp>,
    ) -> Result<(Committed, Vec<RequestSnapshot>), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut committed = Committed::default();
        let mut tombstones = Vec::new();

        for op in ops {
            match op {
                AtomicOp::CreateRecord(mut record) => {
                    let existing: Option<String> =
                        conn.get(self.record_by_request_key(record.request_id)).await?;
                    if existing.is_some() {
                        return Err(StoreError::DuplicateRecord(record.request_id));
                    }

                    let last_raw: Option<String> = conn
                        .get(self.doctor_last_completed_key(record.doctor_id))
                        .await?;
                    let last = last_raw
                        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                        .map(|at| at.with_timezone(&Utc));
                    record.completed_at = next_completed_at(last, Utc::now());

                    pipe.set(self.record_key(record.id), serde_json::to_string(&record)?)
                        .ignore()
                        .set(self.record_by_request_key(record.request_id), record.id.to_string())
                        .ignore()
                        .zadd(
                            self.doctor_records_key(record.doctor_id),
                            record.id.to_string(),
                            record.completed_at.timestamp_micros(),
                        )
                        .ignore()
                        .set(
                            self.doctor_last_completed_key(record.doctor_id),
                            record.completed_at.to_rfc3339(),
                        )
                        .ignore();
                    committed.records.push(record);
                }
                AtomicOp::DeleteRequest { id, expected_version } => {
                    let current = self
                        .load_request(conn, id)
                        .await?
                        .ok_or(StoreError::NotFound(id))?;
                    if current.version != expected_version {
                        return Err(StoreError::Conflict {
                            expected: expected_version,
                            actual: current.version,
                        });
                    }

                    pipe.del(self.request_key(id))
                        .ignore()
                        .srem(self.request_index_key(), id.to_string())
                        .ignore();
                    tombstones.push(RequestSnapshot::tombstone(&current));
                    committed.deleted.push(id);
                }
            }
        }

        pipe.cmd("PING");
        let result: Option<redis::Value> = pipe.query_async(conn).await?;
        if result.is_none() {
            warn!("Atomic batch aborted: watched keys changed");
            return Err(StoreError::Aborted("watched keys changed before EXEC".to_string()));
        }
        Ok((committed, tombstones))
    }

    async fn review_watched(
        &self,
        conn: &mut Connection,
        record_id: Uuid,
        review: Review,
    ) -> Result<VisitRecord, StoreError> {
        let mut record = self
            .load_record(conn, record_id)
            .await?
            .ok_or(StoreError::NotFound(record_id))?;
        if record.review.is_some() {
            return Err(StoreError::AlreadyReviewed(record_id));
        }

        record.review = Some(review);
        let committed: Option<redis::Value> = redis::pipe()
            .atomic()
            .set(self.record_key(record_id), serde_json::to_string(&record)?)
            .query_async(conn)
            .await?;
        if committed.is_none() {
            return Err(StoreError::Aborted(format!("record {} changed during review", record_id)));
        }
        Ok(record)
    }
}

#[async_trait]
impl RequestStore for RedisRequestStore {
    async fn insert(&self, mut request: ServiceRequest) -> Result<ServiceRequest, StoreError> {
        let mut conn = self.connection().await?;
        request.version = 1;

        let data = serde_json::to_string(&request)?;
        let created: bool = conn.set_nx(self.request_key(request.id), data).await?;
        if !created {
            return Err(StoreError::Conflict {
                expected: 0,
                actual: request.version,
            });
        }
        let _: () = conn
            .sadd(self.request_index_key(), request.id.to_string())
            .await?;

        self.feeds.publish_request(RequestSnapshot::of(&request)).await;
        debug!("Inserted service request {}", request.id);
        Ok(request)
    }

    async fn get(&self, id: Uuid) -> Result<ServiceRequest, StoreError> {
        let mut conn = self.connection().await?;
        self.load_request(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(
        &self,
        id: Uuid,
        patch: RequestPatch,
        expected_version: Option<u64>,
    ) -> Result<ServiceRequest, StoreError> {
        let mut conn = self.connection().await?;
        Self::watch(&mut conn, &[self.request_key(id)]).await?;

        let result = self.update_watched(&mut conn, id, patch, expected_version).await;
        let request = Self::release_on_err(&mut conn, result).await?;

        self.feeds.publish_request(RequestSnapshot::of(&request)).await;
        Ok(request)
    }

    async fn list(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.request_index_key()).await?;

        let mut requests = Vec::new();
        for raw_id in ids {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                warn!("Skipping malformed request id {} in index", raw_id);
                continue;
            };
            if let Some(request) = self.load_request(&mut conn, id).await? {
                if query.matches(&request) {
                    requests.push(request);
                }
            }
        }

        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn run_atomic(&self, ops: Vec<AtomicOp>) -> Result<Committed, StoreError> {
        let mut conn = self.connection().await?;

        let mut watched = Vec::new();
        for op in &ops {
            match op {
                AtomicOp::CreateRecord(record) => {
                    watched.push(self.record_by_request_key(record.request_id));
                    watched.push(self.doctor_last_completed_key(record.doctor_id));
                }
                AtomicOp::DeleteRequest { id, .. } => watched.push(self.request_key(*id)),
            }
        }
        Self::watch(&mut conn, &watched).await?;

        let result = self.commit_watched_batch(&mut conn, ops).await;
        let (committed, tombstones) = Self::release_on_err(&mut conn, result).await?;

        for tombstone in tombstones {
            self.feeds.publish_request(tombstone).await;
        }
        for record in &committed.records {
            self.feeds.publish_record(record.clone()).await;
        }

        Ok(committed)
    }

    async fn get_record(&self, id: Uuid) -> Result<VisitRecord, StoreError> {
        let mut conn = self.connection().await?;
        self.load_record(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn record_for_request(&self, request_id: Uuid) -> Result<Option<VisitRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let record_id: Option<String> = conn.get(self.record_by_request_key(request_id)).await?;
        match record_id.and_then(|raw| Uuid::parse_str(&raw).ok()) {
            Some(id) => self.load_record(&mut conn, id).await,
            None => Ok(None),
        }
    }

    async fn records_for_doctor(&self, doctor_id: Uuid) -> Result<Vec<VisitRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .zrevrange(self.doctor_records_key(doctor_id), 0, -1)
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for raw_id in ids {
            if let Ok(id) = Uuid::parse_str(&raw_id) {
                if let Some(record) = self.load_record(&mut conn, id).await? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn attach_review(&self, record_id: Uuid, review: Review) -> Result<VisitRecord, StoreError> {
        let mut conn = self.connection().await?;
        Self::watch(&mut conn, &[self.record_key(record_id)]).await?;

        let result = self.review_watched(&mut conn, record_id, review).await;
        let record = Self::release_on_err(&mut conn, result).await?;

        self.feeds.publish_record(record.clone()).await;
        Ok(record)
    }

    fn feeds(&self) -> &RequestFeeds {
        &self.feeds
    }
}
