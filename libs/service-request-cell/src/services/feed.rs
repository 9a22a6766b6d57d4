use uuid::Uuid;

use shared_realtime::{ChangeFeed, Subscription, Topic};

use crate::{RequestSnapshot, VisitRecord};

pub fn request_topic(request_id: Uuid) -> Topic {
    Topic::scoped("requests", request_id)
}

pub fn doctor_requests_topic(doctor_id: Uuid) -> Topic {
    Topic::new(format!("doctors/{}/requests", doctor_id))
}

pub fn patient_requests_topic(patient_id: Uuid) -> Topic {
    Topic::new(format!("patients/{}/requests", patient_id))
}

/// Every request snapshot; consumed by the completion watcher.
pub fn all_requests_topic() -> Topic {
    Topic::new("requests")
}

pub fn doctor_records_topic(doctor_id: Uuid) -> Topic {
    Topic::new(format!("doctors/{}/records", doctor_id))
}

/// Change feeds owned by a request store.
#[derive(Clone)]
pub struct RequestFeeds {
    pub requests: ChangeFeed<RequestSnapshot>,
    pub records: ChangeFeed<VisitRecord>,
}

impl RequestFeeds {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: ChangeFeed::new(capacity),
            records: ChangeFeed::new(capacity),
        }
    }

    pub async fn publish_request(&self, snapshot: RequestSnapshot) {
        let topics = [
            request_topic(snapshot.request_id),
            doctor_requests_topic(snapshot.doctor_id),
            patient_requests_topic(snapshot.patient_id),
            all_requests_topic(),
        ];
        self.requests.publish_all(&topics, snapshot).await;
    }

    pub async fn publish_record(&self, record: VisitRecord) {
        self.records
            .publish(&doctor_records_topic(record.doctor_id), record)
            .await;
    }

    pub async fn subscribe_all_requests(&self) -> Subscription<RequestSnapshot> {
        self.requests.subscribe(all_requests_topic(), Vec::new()).await
    }
}

impl Default for RequestFeeds {
    fn default() -> Self {
        Self::new(128)
    }
}
