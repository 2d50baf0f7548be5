//! Testing utilities for the protocol publishing workspace
//!
//! Shared fixtures, validator doubles and publisher setup.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol_doc::{DocPath, ProtocolDocument};
use protocol_publish::{
    ConformanceValidator, MemoryBackend, PublishRequest, Publisher, PublisherConfig,
    ValidatorError, ValidatorReport,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROTOCOL_ID: &str = "PILOT-001";

/// Three visits over two epochs, three activities, one main timeline.
/// Integrity-clean: no errors, warnings or infos.
pub fn sample_protocol() -> Value {
    json!({
        "name": "Pilot study",
        "studyDesigns": [{
            "id": "SD_1",
            "name": "Main design",
            "epochs": [
                {"id": "EP_SCREEN", "name": "Screening", "nextId": "EP_TREAT"},
                {"id": "EP_TREAT", "name": "Treatment", "previousId": "EP_SCREEN"}
            ],
            "encounters": [
                {"id": "ENC_1", "name": "Screening visit", "type": "visit",
                 "epochId": "EP_SCREEN", "nextId": "ENC_2"},
                {"id": "ENC_2", "name": "Day 1", "type": "visit",
                 "epochId": "EP_TREAT", "previousId": "ENC_1", "nextId": "ENC_3"},
                {"id": "ENC_3", "name": "Week 4", "type": "visit",
                 "epochId": "EP_TREAT", "previousId": "ENC_2"}
            ],
            "activities": [
                {"id": "ACT_CONSENT", "name": "Informed consent"},
                {"id": "ACT_VITALS", "name": "Vital signs"},
                {"id": "ACT_LABS", "name": "Laboratory tests"}
            ],
            "scheduleTimelines": [{
                "id": "TL_MAIN",
                "name": "Main timeline",
                "mainTimeline": true,
                "entryId": "SAI_1",
                "instances": [
                    {"id": "SAI_1", "instanceType": "ScheduledActivityInstance",
                     "encounterId": "ENC_1", "epochId": "EP_SCREEN",
                     "activityIds": ["ACT_CONSENT", "ACT_VITALS"]},
                    {"id": "SAI_2", "instanceType": "ScheduledActivityInstance",
                     "encounterId": "ENC_2", "epochId": "EP_TREAT",
                     "activityIds": ["ACT_VITALS", "ACT_LABS"]},
                    {"id": "SAI_3", "instanceType": "ScheduledActivityInstance",
                     "encounterId": "ENC_3", "epochId": "EP_TREAT",
                     "activityIds": ["ACT_VITALS"]}
                ]
            }]
        }]
    })
}

pub fn sample_document() -> ProtocolDocument {
    ProtocolDocument::new(sample_protocol())
}

pub fn path(text: &str) -> DocPath {
    text.parse().unwrap()
}

/// Pointer to an entity field of the sample design
pub fn entity_path(collection: &str, id: &str, field: &str) -> DocPath {
    path(&format!("/studyDesigns/@id:SD_1/{collection}/@id:{id}/{field}"))
}

/// Pointer to a field of a main-timeline instance of the sample design
pub fn instance_path(id: &str, field: &str) -> DocPath {
    path(&format!(
        "/studyDesigns/@id:SD_1/scheduleTimelines/@id:TL_MAIN/instances/@id:{id}/{field}"
    ))
}

pub fn request(reason: &str) -> PublishRequest {
    PublishRequest::new("tester").with_reason(reason)
}

pub fn forced_request(reason: &str) -> PublishRequest {
    request(reason).forced()
}

#[derive(Debug, Default)]
pub struct AlwaysValid;

#[async_trait]
impl ConformanceValidator for AlwaysValid {
    async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        Ok(ValidatorReport::passing())
    }
}

#[derive(Debug, Default)]
pub struct AlwaysInvalid;

#[async_trait]
impl ConformanceValidator for AlwaysInvalid {
    async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        Ok(ValidatorReport::failing("model rule violated"))
    }
}

#[derive(Debug, Default)]
pub struct Unreachable;

#[async_trait]
impl ConformanceValidator for Unreachable {
    async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        Err(ValidatorError::Unavailable("connection refused".to_string()))
    }
}

/// Answers valid after the wrapped delay
#[derive(Debug)]
pub struct SlowValidator(pub Duration);

#[async_trait]
impl ConformanceValidator for SlowValidator {
    async fn validate(&self, _candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        tokio::time::sleep(self.0).await;
        Ok(ValidatorReport::passing())
    }
}

/// Valid, counting calls and recording the last candidate
#[derive(Debug, Default)]
pub struct RecordingValidator {
    calls: AtomicUsize,
    last: Mutex<Option<Vec<u8>>>,
}

impl RecordingValidator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_candidate(&self) -> Option<Value> {
        self.last
            .lock()
            .as_ref()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
    }
}

#[async_trait]
impl ConformanceValidator for RecordingValidator {
    async fn validate(&self, candidate: &[u8]) -> Result<ValidatorReport, ValidatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(candidate.to_vec());
        Ok(ValidatorReport::passing())
    }
}

/// Publisher over a fresh [`MemoryBackend`]
pub fn memory_publisher(
    validator: Arc<dyn ConformanceValidator>,
) -> (Arc<MemoryBackend>, Publisher) {
    memory_publisher_with(validator, PublisherConfig::default())
}

pub fn memory_publisher_with(
    validator: Arc<dyn ConformanceValidator>,
    config: PublisherConfig,
) -> (Arc<MemoryBackend>, Publisher) {
    let backend = Arc::new(MemoryBackend::new());
    let publisher = Publisher::new(backend.clone(), validator, config);
    (backend, publisher)
}

/// Memory publisher with [`sample_protocol`] bootstrapped as [`PROTOCOL_ID`]
pub async fn sample_publisher(
    validator: Arc<dyn ConformanceValidator>,
) -> (Arc<MemoryBackend>, Publisher) {
    let (backend, publisher) = memory_publisher(validator);
    publisher
        .bootstrap(PROTOCOL_ID, sample_protocol())
        .await
        .unwrap();
    (backend, publisher)
}
