use super::*;
use crate::keys::PlaintextKeys;
use crate::models::{CompressionType, EncryptionAlgorithm, ExportFormat};
use crate::pipeline::AesCipher;
use crate::test_utils::{make_event, make_registration, RecordingPusher, RecordingSenders};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use std::io::Read;
use std::time::Duration;

fn context(senders: &RecordingSenders) -> WorkerContext {
    WorkerContext::new(Arc::new(PlaintextKeys), Arc::new(senders.clone()))
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_disabled_registration_never_sends() {
    let senders = RecordingSenders::new();
    let mut registration = make_registration("r1", "sink-a", &[]);
    registration.enable = false;

    let mut worker = RegistrationWorker::build(registration, context(&senders)).unwrap();
    let outcome = worker
        .process_event(&make_event("e1", "therm-1", "temp", "21.5"))
        .await;

    assert_eq!(outcome, Delivery::Disabled);
    assert_eq!(senders.log.total(), 0);
}

#[tokio::test]
async fn test_device_filter_rejects_other_devices() {
    let senders = RecordingSenders::new();
    let registration = make_registration("r1", "sink-a", &["dev-1"]);
    let mut worker = RegistrationWorker::build(registration, context(&senders)).unwrap();

    let outcome = worker
        .process_event(&make_event("e1", "dev-2", "temp", "1"))
        .await;
    assert_eq!(outcome, Delivery::Filtered);

    let outcome = worker
        .process_event(&make_event("e2", "dev-1", "temp", "1"))
        .await;
    assert_eq!(outcome, Delivery::Delivered);

    let delivered = senders.log.for_registration("r1");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event_id, "e2");
}

#[tokio::test]
async fn test_value_descriptor_filter_narrows_payload() {
    let senders = RecordingSenders::new();
    let mut registration = make_registration("r1", "sink-a", &[]);
    registration.filter.value_descriptor_identifiers = vec!["humidity".to_string()];
    let mut worker = RegistrationWorker::build(registration, context(&senders)).unwrap();

    let mut event = make_event("e1", "dev-1", "temp", "21.5");
    event.readings.push(crate::models::Reading::new("humidity", "40"));
    assert_eq!(worker.process_event(&event).await, Delivery::Delivered);

    let delivered = senders.log.for_registration("r1");
    let body: serde_json::Value = serde_json::from_slice(&delivered[0].payload).unwrap();
    assert_eq!(body["readings"].as_array().unwrap().len(), 1);
    assert_eq!(body["readings"][0]["name"], "humidity");
}

#[tokio::test]
async fn test_compression_precedes_encryption() {
    let senders = RecordingSenders::new();
    let mut registration = make_registration("r1", "sink-a", &[]);
    registration.compression = CompressionType::Gzip;
    registration.encryption.encryption_algorithm = EncryptionAlgorithm::Aes;
    registration.encryption.encryption_key = "export-key".to_string();
    registration.encryption.initializing_vector = "0123456789abcdef".to_string();
    let mut worker = RegistrationWorker::build(registration, context(&senders)).unwrap();

    let event = make_event("e1", "therm-1", "temp", "21.5");
    assert_eq!(worker.process_event(&event).await, Delivery::Delivered);

    let payload = &senders.log.for_registration("r1")[0].payload;
    let cipher = AesCipher::new("export-key", "0123456789abcdef").unwrap();
    let compressed = STANDARD.decode(cipher.decrypt_base64(payload).unwrap()).unwrap();
    let mut formatted = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut formatted)
        .unwrap();

    assert_eq!(formatted, serde_json::to_vec(&event).unwrap());
}

#[tokio::test]
async fn test_unsupported_format_rejects_build() {
    let senders = RecordingSenders::new();
    let mut registration = make_registration("r1", "sink-a", &[]);
    registration.format = ExportFormat::from("CSV");

    let result = RegistrationWorker::build(registration, context(&senders));
    assert!(matches!(
        result.err(),
        Some(BuildError::Stage(StageError::Unsupported { stage: "format", .. }))
    ));
}

#[tokio::test]
async fn test_blank_optional_stages_build_plain_pipeline() {
    let senders = RecordingSenders::new();
    let mut registration = make_registration("r1", "sink-a", &[]);
    registration.compression = CompressionType::from("");
    registration.encryption.encryption_algorithm = EncryptionAlgorithm::from("");

    let mut worker = RegistrationWorker::build(registration, context(&senders)).unwrap();
    let outcome = worker
        .process_event(&make_event("e1", "dev-1", "temp", "21.5"))
        .await;

    assert_eq!(outcome, Delivery::Delivered);
    let delivered = senders.log.for_registration("r1");
    let body: serde_json::Value = serde_json::from_slice(&delivered[0].payload).unwrap();
    assert_eq!(body["id"], "e1");
}

#[tokio::test]
async fn test_sender_failure_rejects_build() {
    let senders = RecordingSenders::new();
    let registration = make_registration("r1", "reject", &[]);

    let result = RegistrationWorker::build(registration, context(&senders));
    assert!(matches!(result.err(), Some(BuildError::Sender(_))));
}

#[tokio::test]
async fn test_nameless_registration_rejected() {
    let senders = RecordingSenders::new();
    let registration = make_registration("", "sink-a", &[]);

    let result = RegistrationWorker::build(registration, context(&senders));
    assert!(matches!(result.err(), Some(BuildError::MissingName)));
}

#[tokio::test]
async fn test_failed_send_reports_failure() {
    let senders = RecordingSenders::new();
    let pusher = RecordingPusher::new();
    let ctx = context(&senders).with_pusher(Arc::new(pusher.clone()));
    let mut worker =
        RegistrationWorker::build(make_registration("r1", "down", &[]), ctx).unwrap();

    let outcome = worker
        .process_event(&make_event("e1", "therm-1", "temp", "1"))
        .await;

    assert_eq!(outcome, Delivery::Failed);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(pusher.pushed().is_empty());
}

#[tokio::test]
async fn test_delivery_marks_event_pushed() {
    let senders = RecordingSenders::new();
    let pusher = RecordingPusher::new();
    let ctx = context(&senders).with_pusher(Arc::new(pusher.clone()));
    let mut worker =
        RegistrationWorker::build(make_registration("r1", "sink-a", &[]), ctx).unwrap();

    worker
        .process_event(&make_event("e7", "therm-1", "temp", "1"))
        .await;

    wait_for(|| !pusher.pushed().is_empty()).await;
    assert_eq!(pusher.pushed(), vec!["e7"]);
}

#[tokio::test]
async fn test_mark_pushed_failure_does_not_affect_delivery() {
    let senders = RecordingSenders::new();
    let pusher = RecordingPusher::failing();
    let ctx = context(&senders).with_pusher(Arc::new(pusher.clone()));
    let mut worker =
        RegistrationWorker::build(make_registration("r1", "sink-a", &[]), ctx).unwrap();

    let outcome = worker
        .process_event(&make_event("e1", "therm-1", "temp", "1"))
        .await;

    assert_eq!(outcome, Delivery::Delivered);
    wait_for(|| !pusher.pushed().is_empty()).await;
    assert_eq!(senders.log.total(), 1);
}

#[tokio::test]
async fn test_rebuild_with_same_registration_is_equivalent() {
    let senders = RecordingSenders::new();
    let registration = make_registration("r1", "sink-a", &["therm-1"]);
    let mut worker = RegistrationWorker::build(registration.clone(), context(&senders)).unwrap();

    let accepted = make_event("e1", "therm-1", "temp", "1");
    let rejected = make_event("e2", "therm-2", "temp", "1");

    let before = (
        worker.process_event(&accepted).await,
        worker.process_event(&rejected).await,
    );
    worker.update(registration.clone()).unwrap();
    worker.update(registration).unwrap();
    let after = (
        worker.process_event(&accepted).await,
        worker.process_event(&rejected).await,
    );

    assert_eq!(before, after);
    let delivered = senders.log.for_registration("r1");
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].payload, delivered[1].payload);
}

#[tokio::test]
async fn test_failed_update_keeps_previous_pipeline() {
    let senders = RecordingSenders::new();
    let mut worker =
        RegistrationWorker::build(make_registration("r1", "sink-a", &[]), context(&senders))
            .unwrap();

    let mut broken = make_registration("r1", "sink-b", &[]);
    broken.compression = CompressionType::from("LZ4");
    assert!(worker.update(broken).is_err());

    assert_eq!(worker.registration().addressable.address, "sink-a");
    worker
        .process_event(&make_event("e1", "therm-1", "temp", "1"))
        .await;
    assert_eq!(senders.log.for_registration("r1")[0].sink, "sink-a");
}

#[tokio::test]
async fn test_spawned_worker_applies_update_before_queued_events() {
    let senders = RecordingSenders::new();
    let ctx = context(&senders).with_event_buffer(8);
    let handle = RegistrationWorker::build(make_registration("r1", "sink-a", &[]), ctx)
        .unwrap()
        .spawn();

    assert!(handle.deliver(Arc::new(make_event("e1", "d", "t", "1"))).await);
    wait_for(|| senders.log.total() == 1).await;

    assert!(handle.update(make_registration("r1", "sink-b", &[])).await);
    assert!(handle.deliver(Arc::new(make_event("e2", "d", "t", "1"))).await);
    wait_for(|| senders.log.total() == 2).await;
    handle.join().await;

    let sinks: Vec<String> = senders
        .log
        .for_registration("r1")
        .into_iter()
        .map(|d| d.sink)
        .collect();
    assert_eq!(sinks, vec!["sink-a", "sink-b"]);
}

#[tokio::test]
async fn test_failed_rebuild_terminates_worker() {
    let senders = RecordingSenders::new();
    let registration = make_registration("r1", "sink-a", &[]);
    let handle = RegistrationWorker::build(registration, context(&senders))
        .unwrap()
        .spawn();

    assert!(handle.update(make_registration("r1", "reject", &[])).await);
    wait_for(|| handle.is_terminated()).await;

    assert!(handle.is_terminated());
    assert!(!handle.deliver(Arc::new(make_event("e1", "d", "t", "1"))).await);
}

#[tokio::test]
async fn test_terminate_stops_worker() {
    let senders = RecordingSenders::new();
    let registration = make_registration("r1", "sink-a", &[]);
    let handle = RegistrationWorker::build(registration, context(&senders))
        .unwrap()
        .spawn();

    handle.terminate();
    wait_for(|| handle.is_terminated()).await;
    assert!(handle.is_terminated());
    assert_eq!(handle.name(), "r1");
}
