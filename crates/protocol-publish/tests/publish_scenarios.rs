//! End-to-end publish behaviour over the in-memory backend

use pretty_assertions::assert_eq;
use protocol_doc::{EntityKind, PatchOperation, ProtocolDocument};
use protocol_edit::EditSession;
use protocol_integrity::IssueKind;
use protocol_publish::{
    slots, DraftStore, PublishError, PublishState, PublisherConfig, Settlement, StorageBackend,
};
use protocol_test_utils::{
    entity_path, forced_request, instance_path, memory_publisher_with, request, sample_protocol,
    sample_publisher, AlwaysInvalid, AlwaysValid, RecordingValidator, SlowValidator, Unreachable,
    PROTOCOL_ID,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn rename_encounter(id: &str, name: &str) -> Vec<PatchOperation> {
    vec![PatchOperation::replace(
        entity_path("encounters", id, "name"),
        json!(name),
    )]
}

#[tokio::test]
async fn stale_draft_fails_revision_mismatch() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let r0 = publisher.current(PROTOCOL_ID).await.unwrap().revision();

    // Editor B computes a draft against R0 and keeps it client-side
    let stale = publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_3", "Week 6"), "bob")
        .await
        .unwrap();
    publisher.discard_draft(PROTOCOL_ID).await.unwrap();
    assert_eq!(stale.base_revision, r0);

    // Editor A publishes first, moving the document to R1
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_2", "Baseline"), "alice")
        .await
        .unwrap();
    let r1 = publisher
        .publish(PROTOCOL_ID, request("rename baseline"))
        .await
        .unwrap()
        .revision;
    assert_ne!(r0, r1);

    // Editor B's stale draft comes back
    DraftStore::new(backend.clone()).put(&stale).await.unwrap();
    let err = publisher
        .publish(PROTOCOL_ID, request("rename week 4"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    match err {
        PublishError::RevisionMismatch { expected, actual } => {
            assert_eq!(expected, r1);
            assert_eq!(actual, r0);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Nothing moved
    assert_eq!(publisher.current(PROTOCOL_ID).await.unwrap().revision(), r1);
    assert_eq!(publisher.history(PROTOCOL_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dangling_reference_needs_override() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let ops = vec![PatchOperation::add(
        instance_path("SAI_2", "activityIds/-"),
        json!("ACT_GHOST"),
    )];
    publisher
        .save_draft(PROTOCOL_ID, ops, "alice")
        .await
        .unwrap();

    let dry_run = publisher.validate_draft(PROTOCOL_ID).await.unwrap();
    assert_eq!(dry_run.integrity.issues.len(), 1);
    let issue = &dry_run.integrity.issues[0];
    assert_eq!(issue.kind, IssueKind::DanglingReference);
    assert_eq!(issue.referenced_id.as_deref(), Some("ACT_GHOST"));

    let before = backend.list(PROTOCOL_ID, "").await.unwrap();
    let err = publisher
        .publish(PROTOCOL_ID, request("add ghost"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "referential_integrity");
    assert!(err.requires_override());
    let response = err.to_response();
    assert_eq!(response.details["issues"].as_array().unwrap().len(), 1);
    assert_eq!(
        response.details["issues"][0]["kind"],
        json!("dangling_reference")
    );
    assert_eq!(backend.list(PROTOCOL_ID, "").await.unwrap(), before);
    assert!(publisher.draft(PROTOCOL_ID).await.unwrap().is_some());

    let response = publisher
        .publish(PROTOCOL_ID, forced_request("known gap, fixing upstream"))
        .await
        .unwrap();
    assert!(response.validation_summary.forced_publish);
    assert!(!response.validation_summary.integrity_valid);
    assert_eq!(response.validation_summary.integrity_errors, 1);

    let history = publisher.history(PROTOCOL_ID).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].forced_publish);
    assert_eq!(
        history[0].changed_paths,
        vec!["/studyDesigns/@id:SD_1/scheduleTimelines/@id:TL_MAIN/instances/@id:SAI_2/activityIds/-"]
    );
}

#[tokio::test]
async fn three_publishes_chain_and_tampering_is_located() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    for (n, name) in ["Baseline", "Week 6", "Follow-up"].iter().enumerate() {
        let id = format!("ENC_{}", n + 1);
        publisher
            .save_draft(PROTOCOL_ID, rename_encounter(&id, name), "alice")
            .await
            .unwrap();
        let response = publisher
            .publish(PROTOCOL_ID, request(&format!("change {n}")))
            .await
            .unwrap();
        assert_eq!(response.version, n as u64 + 1);
    }

    let verification = publisher.verify_audit(PROTOCOL_ID).await.unwrap();
    assert!(verification.valid);
    assert_eq!(verification.length, 3);

    // Flip one byte inside entry 2's reason
    let mut log = backend
        .read(PROTOCOL_ID, slots::AUDIT_LOG)
        .await
        .unwrap()
        .unwrap();
    let second_line = log.iter().position(|&b| b == b'\n').unwrap() + 1;
    let reason = second_line
        + log[second_line..]
            .windows(10)
            .position(|w| w == b"\"reason\":\"")
            .unwrap()
        + 10;
    log[reason] ^= 0x01;
    backend
        .write(PROTOCOL_ID, slots::AUDIT_LOG, &log)
        .await
        .unwrap();

    let verification = publisher.verify_audit(PROTOCOL_ID).await.unwrap();
    assert!(!verification.valid);
    assert_eq!(verification.broken_at, Some(2));
    assert_eq!(verification.length, 1);
}

#[tokio::test]
async fn editing_session_feeds_the_draft() {
    let (_, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let mut session = EditSession::new(publisher.current(PROTOCOL_ID).await.unwrap());
    session
        .edit(|e, doc| e.set_cell_mark(doc, "ACT_LABS", "ENC_3"))
        .unwrap();
    let (visit, _) = session
        .create(|e, doc| e.add_entity(doc, EntityKind::Encounter, "Week 8", Some("ENC_3")))
        .unwrap();
    session
        .edit(|e, doc| e.set_cell_mark(doc, "ACT_VITALS", &visit))
        .unwrap();
    let expected = session.working().clone();

    publisher
        .save_draft(PROTOCOL_ID, session.into_operations(), "alice")
        .await
        .unwrap();
    let dry_run = publisher.validate_draft(PROTOCOL_ID).await.unwrap();
    assert!(dry_run.integrity.valid, "{:?}", dry_run.integrity.issues);

    let response = publisher
        .publish(PROTOCOL_ID, request("add week 8"))
        .await
        .unwrap();
    assert!(!response.validation_summary.forced_publish);
    assert_eq!(
        publisher.current(PROTOCOL_ID).await.unwrap(),
        ProtocolDocument::new(expected)
    );
}

#[tokio::test]
async fn unreachable_validator_fails_closed() {
    let (_, publisher) = sample_publisher(Arc::new(Unreachable)).await;
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();

    let err = publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_failed");
    let details = err.details();
    assert_eq!(details["summary"]["validatorAvailable"], json!(false));
    assert_eq!(
        details["summary"]["validatorError"],
        json!("validator unavailable: connection refused")
    );

    let response = publisher
        .publish(PROTOCOL_ID, forced_request("validator down"))
        .await
        .unwrap();
    assert!(response.validation_summary.forced_publish);
    assert!(response.validation_summary.integrity_valid);
}

#[tokio::test]
async fn invalid_report_fails_without_override() {
    let (_, publisher) = sample_publisher(Arc::new(AlwaysInvalid)).await;
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();
    let err = publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_failed");
    assert_eq!(err.details()["summary"]["modelErrors"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn slow_validator_times_out_and_fails_closed() {
    let config = PublisherConfig::default().with_validation_timeout(Duration::from_millis(50));
    let (_, publisher) = memory_publisher_with(
        Arc::new(SlowValidator(Duration::from_secs(30))),
        config,
    );
    publisher
        .bootstrap(PROTOCOL_ID, sample_protocol())
        .await
        .unwrap();
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();
    let err = publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_failed");
    assert_eq!(
        err.details()["summary"]["validatorError"],
        json!("validator timed out after 50ms")
    );
}

#[tokio::test]
async fn validator_sees_the_candidate() {
    let validator = Arc::new(RecordingValidator::default());
    let (_, publisher) = sample_publisher(validator.clone()).await;
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();
    publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap();
    assert_eq!(validator.calls(), 1);
    let candidate = validator.last_candidate().unwrap();
    assert_eq!(
        candidate["studyDesigns"][0]["encounters"][0]["name"],
        json!("Screening")
    );
}

#[tokio::test]
async fn concurrent_publishes_are_serialized() {
    let (_, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let publisher = Arc::new(publisher);
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { publisher.publish(PROTOCOL_ID, request("race")).await })
        })
        .collect();
    let mut published = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => published += 1,
            Err(e) => assert_eq!(e.code(), "no_draft"),
        }
    }
    assert_eq!(published, 1);
    assert_eq!(publisher.history(PROTOCOL_ID).await.unwrap().len(), 1);
}

#[tokio::test]
async fn revert_to_version_appends_history() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();
    publisher.publish(PROTOCOL_ID, request("one")).await.unwrap();
    let v1 = publisher.published_version(PROTOCOL_ID, 1).await.unwrap();

    publisher
        .save_draft(
            PROTOCOL_ID,
            vec![PatchOperation::replace(
                protocol_test_utils::path("/name"),
                json!("Pilot study (amended)"),
            )],
            "alice",
        )
        .await
        .unwrap();
    publisher.publish(PROTOCOL_ID, request("two")).await.unwrap();

    let response = publisher
        .revert_to_version(PROTOCOL_ID, 1, request("undo amendment"))
        .await
        .unwrap();
    assert_eq!(response.version, 3);
    assert_eq!(response.revision, v1.revision);
    assert_eq!(publisher.current(PROTOCOL_ID).await.unwrap().content(), &v1.content);

    let history = publisher.history(PROTOCOL_ID).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].reverted_from, Some(1));
    assert_eq!(history[2].changed_paths, vec!["/name"]);
    assert!(publisher.verify_audit(PROTOCOL_ID).await.unwrap().valid);
    assert_eq!(backend.list(PROTOCOL_ID, "history/").await.unwrap().len(), 3);

    let err = publisher
        .revert_to_version(PROTOCOL_ID, 9, request("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "version_not_found");
}

#[tokio::test]
async fn recovery_discards_partial_writes() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let revision = publisher.current(PROTOCOL_ID).await.unwrap().revision();
    backend
        .write(PROTOCOL_ID, "current.json.tmp", b"{\"studyDes")
        .await
        .unwrap();

    let report = publisher.recover(PROTOCOL_ID).await.unwrap();
    assert_eq!(report.discarded, vec!["current.json.tmp"]);
    assert_eq!(report.current_revision, Some(revision));
    assert!(backend
        .read(PROTOCOL_ID, "current.json.tmp")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn invalid_protocol_ids_are_rejected() {
    let (_, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let err = publisher
        .bootstrap("../escape", sample_protocol())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_protocol_id");
    assert!(err.is_client_error());
}

fn commit_stage(err: &PublishError) -> PublishState {
    match err {
        PublishError::CommitFailed { stage, .. } => *stage,
        other => panic!("expected a commit failure, got {other}"),
    }
}

#[tokio::test]
async fn failed_audit_append_is_rolled_forward() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let r0 = publisher.current(PROTOCOL_ID).await.unwrap().revision();
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();

    backend.inject_fault(slots::AUDIT_LOG);
    let err = publisher
        .publish(PROTOCOL_ID, request("rename screening"))
        .await
        .unwrap_err();
    assert_eq!(commit_stage(&err), PublishState::RecordingAudit);
    let r1 = publisher.current(PROTOCOL_ID).await.unwrap().revision();
    assert_ne!(r1, r0);
    assert!(publisher.history(PROTOCOL_ID).await.unwrap().is_empty());

    // The next writer completes the interrupted commit before its own edit
    backend.clear_faults();
    let draft = publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_2", "Baseline"), "alice")
        .await
        .unwrap();
    assert_eq!(draft.base_revision, r1);
    let history = publisher.history(PROTOCOL_ID).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].revision, r1);
    assert_eq!(history[0].reason.as_deref(), Some("rename screening"));

    let response = publisher
        .publish(PROTOCOL_ID, request("rename baseline"))
        .await
        .unwrap();
    assert_eq!(response.version, 2);
    assert_eq!(
        publisher.current(PROTOCOL_ID).await.unwrap().revision(),
        response.revision
    );
    assert_eq!(publisher.history(PROTOCOL_ID).await.unwrap().len(), 2);
    assert!(publisher.verify_audit(PROTOCOL_ID).await.unwrap().valid);
}

#[tokio::test]
async fn recovery_records_a_version_missing_from_the_log() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();
    backend.inject_fault(slots::AUDIT_LOG);
    publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap_err();
    backend.clear_faults();

    let report = publisher.recover(PROTOCOL_ID).await.unwrap();
    assert_eq!(report.settled, Some(Settlement::Recorded { version: 1 }));
    assert!(publisher.draft(PROTOCOL_ID).await.unwrap().is_none());
    let history = publisher.history(PROTOCOL_ID).await.unwrap();
    assert_eq!(Some(history[0].revision), report.current_revision);

    // Settled state is left alone
    assert_eq!(publisher.recover(PROTOCOL_ID).await.unwrap().settled, None);
}

#[tokio::test]
async fn unrecorded_swap_is_rolled_back() {
    let (backend, publisher) = sample_publisher(Arc::new(AlwaysValid)).await;
    let r0 = publisher.current(PROTOCOL_ID).await.unwrap().revision();
    publisher
        .save_draft(PROTOCOL_ID, rename_encounter("ENC_1", "Screening"), "alice")
        .await
        .unwrap();

    backend.inject_fault(slots::PUBLISHED_DIR);
    let err = publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap_err();
    assert_eq!(commit_stage(&err), PublishState::RecordingAudit);
    assert_ne!(publisher.current(PROTOCOL_ID).await.unwrap().revision(), r0);
    backend.clear_faults();

    let report = publisher.recover(PROTOCOL_ID).await.unwrap();
    match report.settled {
        Some(Settlement::Restored { revision, from_slot }) => {
            assert_eq!(revision, r0);
            assert!(from_slot.starts_with("history/"));
        }
        other => panic!("unexpected settlement: {other:?}"),
    }
    assert_eq!(publisher.current(PROTOCOL_ID).await.unwrap().revision(), r0);

    // The draft survived and publishes cleanly
    let response = publisher
        .publish(PROTOCOL_ID, request("rename"))
        .await
        .unwrap();
    assert_eq!(response.version, 1);
    assert!(publisher.verify_audit(PROTOCOL_ID).await.unwrap().valid);
}
