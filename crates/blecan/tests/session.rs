use std::time::Duration;

use blecan::command::{CanFilterConfig, FlowControlConfig};
use blecan::presets;
use blecan::session::{AckMode, FrameStatus, SessionConfig};
use blecan::sim::SimAdapter;
use blecan::uds::{self, NegativeResponse, UdsErrorCode, UdsResponse, did};
use blecan::{AttemptError, SessionError, TransportError};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn configure_then_standard_requests() {
    let mut session = SimAdapter::session(SessionConfig::default());
    session
        .configure(&CanFilterConfig::default(), &FlowControlConfig::default())
        .await
        .unwrap();

    let written = session.transport().written();
    assert_eq!(
        hex::encode_upper(&written[0]),
        "AAA6FF00101001F4000007FF00000710FFFFFFFF73"
    );
    assert_eq!(hex::encode_upper(&written[1]), "AAA6FE0004110F055511");

    let responses = session
        .run_requests(&presets::standard_requests())
        .await
        .unwrap();

    let mut vin = vec![0xF1, 0x90];
    vin.extend_from_slice(b"WVWZZZ1JZXW000001");
    assert_eq!(
        responses,
        vec![
            UdsResponse::TesterPresent,
            UdsResponse::SessionStarted,
            UdsResponse::DataRead(vin),
            UdsResponse::DataRead(hex::decode("F18C534E30303432").unwrap()),
            UdsResponse::DataRead(vec![0x01, 0x74, 0x00, 0x2A]),
            UdsResponse::RoutineResult(vec![0x01, 0xC0, 0x08, 0x00]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn configure_waits_between_steps() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let start = Instant::now();
    session
        .configure(&CanFilterConfig::default(), &FlowControlConfig::default())
        .await
        .unwrap();
    // Two 100 ms backoffs, the step delay and the settle delay.
    assert_eq!(start.elapsed(), Duration::from_millis(100 + 200 + 100 + 500));
}

#[tokio::test(start_paused = true)]
async fn fragmented_noisy_notifications() {
    let mut session = SimAdapter::session(SessionConfig::default());
    session.transport_mut().set_chunk_size(Some(3));
    session.transport_mut().set_noise([0x00, 0x13, 0x55, 0x37]);

    let resp = session
        .request(&uds::read_data_by_identifier(did::VIN))
        .await
        .unwrap();
    let UdsResponse::DataRead(data) = resp else {
        panic!("expected data read, got {:?}", resp);
    };
    assert_eq!(&data[2..], b"WVWZZZ1JZXW000001");
}

#[tokio::test(start_paused = true)]
async fn silent_adapter_is_retried() {
    let mut session = SimAdapter::session(SessionConfig::default());
    session.transport_mut().mute_next(1);

    let frame = session
        .encoder()
        .encode_uds_payload(&uds::tester_present())
        .unwrap();
    let outcome = session.transact(1, &frame, &AckMode::AnyFrame).await;
    assert!(outcome.is_acked());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.retries, 1);
    assert_eq!(session.transport().written().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn negative_response_completes_the_transaction() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let resp = session
        .request(&uds::read_data_by_identifier(0xBEEF))
        .await
        .unwrap();
    assert_eq!(
        resp,
        UdsResponse::Negative(NegativeResponse {
            service: uds::SID_RDBI_REQ,
            code: UdsErrorCode::RequestOutOfRange,
        })
    );
    assert_eq!(session.transport().written().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn preset_sequence_runs_to_completion() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let frames = presets::diag_request_frames(session.encoder()).unwrap();
    let report = session.run_sequence(&frames, &AckMode::AnyFrame).await;

    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), presets::DIAG_REQUESTS.len());
    assert!(report.outcomes.iter().all(|o| o.attempts == 1));

    let vin = report.outcomes[4].response().map(uds::interpret).unwrap();
    assert!(matches!(vin, UdsResponse::DataRead(ref d) if d.ends_with(b"000001")));
}

#[tokio::test(start_paused = true)]
async fn segmented_transfer_with_progress() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let blob: Vec<u8> = (0u8..40).collect();
    let mut progress = Vec::new();
    let report = session
        .send_segmented(&blob, |done, total| progress.push((done, total)))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3), (3, 3)]);
    assert_eq!(session.transport().received_blob().unwrap(), blob);
}

#[tokio::test(start_paused = true)]
async fn lost_segment_ack_is_retried() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let blob = [0x5A; 20];
    session.transport_mut().mute_next(1);
    let report = session.send_segmented(&blob, |_, _| {}).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.outcomes[0].attempts, 2);
    assert_eq!(report.outcomes[1].attempts, 1);
    assert_eq!(session.transport().written().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn write_failures_exhaust_attempts() {
    let mut session = SimAdapter::session(SessionConfig::default());
    session.transport_mut().fail_next_writes(3);

    let err = session.request(&uds::tester_present()).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::FrameFailed {
            index: 1,
            attempts: 3,
            cause: AttemptError::TransportWrite(TransportError::Write(
                "simulated write failure".into()
            )),
        }
    );

    // The link recovers for the next request.
    assert_eq!(
        session.request(&uds::tester_present()).await.unwrap(),
        UdsResponse::TesterPresent
    );
}

#[tokio::test(start_paused = true)]
async fn sequence_aborts_after_silent_frame() {
    let config = SessionConfig {
        max_attempts: 2,
        ..SessionConfig::default()
    };
    let mut session = SimAdapter::session(config);
    let frames = presets::diag_request_frames(session.encoder()).unwrap();

    session.transport_mut().mute_next(1);
    let report = session.run_sequence(&frames[..1], &AckMode::AnyFrame).await;
    assert!(report.is_success());

    session.transport_mut().mute_next(2);
    let report = session.run_sequence(&frames, &AckMode::AnyFrame).await;
    assert_eq!(report.failed, Some(1));
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(
        report.outcomes[0].status,
        FrameStatus::Failed(AttemptError::AckTimeout(Duration::from_millis(2000)))
    );
}

#[tokio::test(start_paused = true)]
async fn retransmitted_segment_is_not_duplicated() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let blob: Vec<u8> = (0u8..20).collect();
    session.transport_mut().mute_next(1);
    session.send_segmented(&blob, |_, _| {}).await.unwrap();
    assert_eq!(session.transport().received_blob().unwrap(), blob);
}

#[tokio::test(start_paused = true)]
async fn resumed_transfer_waits_for_carried_segment_index() {
    let mut session = SimAdapter::session(SessionConfig::default());
    let blob: Vec<u8> = (0u8..40).collect();
    let frames = session.encoder().encode_segments(&blob, 16).unwrap();

    let report = session.run_sequence(&frames[..1], &AckMode::IndexedAck).await;
    assert!(report.is_success());

    let report = session.run_sequence(&frames[1..], &AckMode::IndexedAck).await;
    assert!(report.is_success());
    assert!(report.outcomes.iter().all(|o| o.attempts == 1));
    assert_eq!(session.transport().received_blob().unwrap(), blob);
}

#[tokio::test(start_paused = true)]
async fn configure_stops_when_can_step_is_not_acknowledged() {
    let mut session = SimAdapter::session(SessionConfig::default());
    session.transport_mut().mute_next(3);

    let err = session
        .configure(&CanFilterConfig::default(), &FlowControlConfig::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SessionError::FrameFailed {
            index: 1,
            attempts: 3,
            cause: AttemptError::AckTimeout(Duration::from_millis(5000)),
        }
    );

    let written = session.transport().written();
    assert_eq!(written.len(), 3);
    assert!(written.iter().all(|w| w[..3] == [0xAA, 0xA6, 0xFF]));
}
