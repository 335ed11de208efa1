//! End-to-end tests for [`Session`] against the simulated DIMM.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use pretty_assertions::assert_eq;

use dimm_api::{Error, LinkState, Reply, Session, SessionConfig, Verb};
use dimm_mock::{MockConfig, MockDimm};

// ── Helpers ─────────────────────────────────────────────────────────

fn session_config(mock: &MockDimm) -> SessionConfig {
    SessionConfig {
        port: mock.port(),
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

async fn mock_with(config: MockConfig) -> (MockDimm, Session) {
    let mock = MockDimm::start(config).await.unwrap();
    let session = Session::connect(&session_config(&mock)).await.unwrap();
    (mock, session)
}

fn silent(names: &[&str]) -> MockConfig {
    let mut config = MockConfig::default();
    config
        .silent_variables
        .extend(names.iter().map(|n| (*n).to_owned()));
    config
}

// ── Connect & authenticate ──────────────────────────────────────────

#[tokio::test]
async fn connects_authenticates_and_reads_values() {
    let (mock, session) = mock_with(MockConfig::default()).await;

    assert_eq!(session.access_levels().read, 20);
    let reply = session.get(&["AMEBA.MODE", "SKY.TEMP"]).await.unwrap();
    assert_eq!(reply.int("AMEBA.MODE").unwrap(), 1);
    assert!((reply.float("SKY.TEMP").unwrap() - -19.0).abs() < 1e-9);
    assert!(session.table().is_empty());

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn auto_auth_skips_credentials() {
    let mock = MockDimm::start(MockConfig {
        require_auth: false,
        ..MockConfig::default()
    })
    .await
    .unwrap();
    let session = Session::connect(&SessionConfig {
        auto_auth: true,
        ..session_config(&mock)
    })
    .await
    .unwrap();

    let reply = session.get(&["AMEBA.MODE"]).await.unwrap();
    assert_eq!(reply.int("AMEBA.MODE").unwrap(), 1);

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn skipping_auth_on_a_guarded_device_rejects_commands() {
    let mock = MockDimm::start(MockConfig::default()).await.unwrap();
    let session = Session::connect(&SessionConfig {
        auto_auth: true,
        ..session_config(&mock)
    })
    .await
    .unwrap();

    match session.get(&["AMEBA.MODE"]).await.unwrap_err() {
        Error::Rejected { reason, .. } => assert!(reason.contains("UNAUTHENTICATED")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(session.table().is_empty());

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = Session::connect(&SessionConfig {
        port,
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    })
    .await;
    let err = result.err().unwrap();
    assert!(matches!(err, Error::Connect { .. }));
    assert!(err.is_transient());
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn set_then_get_round_trip_through_device() {
    let (mock, session) = mock_with(MockConfig::default()).await;

    let reply = session
        .set(&[("WEATHER.PRESSURE", "812.5".into()), ("WEATHER.RAIN", "0".into())])
        .await
        .unwrap();
    assert!(reply.data.contains_key("WEATHER.PRESSURE"));
    assert_eq!(mock.variable("WEATHER.PRESSURE").unwrap(), "812.5");

    let reply = session.get(&["WEATHER.PRESSURE"]).await.unwrap();
    assert!((reply.float("WEATHER.PRESSURE").unwrap() - 812.5).abs() < 1e-9);

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn device_side_variable_errors_surface_as_data_quality() {
    let (mock, session) = mock_with(MockConfig::default()).await;

    let reply = session.get(&["DOME.POSITION", "AMEBA.MODE"]).await.unwrap();
    assert!(matches!(
        reply.float("DOME.POSITION"),
        Err(Error::DataQuality { .. })
    ));
    assert_eq!(reply.int("AMEBA.MODE").unwrap(), 1);

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn concurrent_commands_each_get_their_own_reply() {
    let (mock, session) = mock_with(MockConfig {
        reply_delay: Duration::from_millis(20),
        ..MockConfig::default()
    })
    .await;

    let names = ["AMEBA.MODE", "SKY.STATUS", "WEATHER.RAIN", "SCOPE.MOTION_STATE"];
    let expected = [1, 3, 1, -1];
    let mut tasks = Vec::new();
    for _ in 0..5 {
        for name in names {
            let s = session.clone();
            tasks.push(tokio::spawn(async move {
                s.get(&[name]).await.map(|r| (name, r.int(name).unwrap()))
            }));
        }
    }
    for task in tasks {
        let (name, value) = task.await.unwrap().unwrap();
        let idx = names.iter().position(|n| *n == name).unwrap();
        assert_eq!(value, expected[idx]);
    }
    assert!(session.table().is_empty());

    session.close().await;
    mock.shutdown().await;
}

// ── Timeouts ────────────────────────────────────────────────────────

#[tokio::test]
async fn unanswered_command_times_out_and_leaves_no_residue() {
    let (mock, session) = mock_with(silent(&["DIMM.SEEING"])).await;

    let err = session.get(&["DIMM.SEEING"]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(session.table().len(), 0);

    // The session keeps working for other variables.
    assert!(session.get(&["AMEBA.MODE"]).await.is_ok());

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn sweep_fails_stale_commands() {
    let (mock, session) = mock_with(silent(&["DIMM.SEEING"])).await;

    let completion = session.issue(Verb::Get, "DIMM.SEEING").await.unwrap();
    assert_eq!(session.table().len(), 1);
    assert_eq!(session.sweep(), 0);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(session.sweep(), 1);
    assert!(session.table().is_empty());

    let err = completion.wait(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    session.close().await;
    mock.shutdown().await;
}

// ── Shutdown & loss ─────────────────────────────────────────────────

#[tokio::test]
async fn close_fails_outstanding_commands_and_disconnects_once() {
    let (mock, session) = mock_with(silent(&["DIMM.SEEING", "DIMM.AIRMASS", "DIMM.FLUX_LEFT"])).await;

    let mut waiters = Vec::new();
    for name in ["DIMM.SEEING", "DIMM.AIRMASS", "DIMM.FLUX_LEFT"] {
        waiters.push(session.issue(Verb::Get, name).await.unwrap());
    }
    assert_eq!(session.table().len(), 3);

    let (first, second) = tokio::join!(session.close(), session.close());
    assert!(first ^ second, "exactly one close call owns the socket");
    assert!(!session.close().await);

    for waiter in waiters {
        let err = waiter.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
    }
    assert_eq!(session.link_state(), LinkState::Closed);
    assert!(matches!(
        session.get(&["AMEBA.MODE"]).await,
        Err(Error::NotConnected)
    ));

    // Give the device a moment to observe the DISCONNECT line.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.stats().disconnects, 1);
    mock.shutdown().await;
}

#[tokio::test]
async fn peer_drop_marks_link_lost_and_fails_pending() {
    let (mock, session) = mock_with(silent(&["DIMM.SEEING"])).await;
    let mut link = session.subscribe_link();

    let waiter = session.issue(Verb::Get, "DIMM.SEEING").await.unwrap();
    mock.drop_client();

    tokio::time::timeout(Duration::from_secs(2), link.wait_for(|s| *s == LinkState::Lost))
        .await
        .unwrap()
        .unwrap();
    let err = waiter.wait(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost { .. }));
    assert!(session.table().is_empty());

    session.close().await;
    mock.shutdown().await;
}

// ── Unsolicited traffic ─────────────────────────────────────────────

#[tokio::test]
async fn garbled_lines_never_break_the_session() {
    let (mock, session) = mock_with(MockConfig {
        event_interval: Some(Duration::from_millis(5)),
        malformed_probability: 1.0,
        seed: Some(7),
        ..MockConfig::default()
    })
    .await;

    for _ in 0..20 {
        let reply = session.get(&["AMEBA.MODE"]).await.unwrap();
        assert_eq!(reply.int("AMEBA.MODE").unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(session.link_state(), LinkState::Open);
    assert!(session.table().is_empty());

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn events_are_broadcast_to_subscribers() {
    let (mock, session) = mock_with(MockConfig {
        event_interval: Some(Duration::from_millis(20)),
        ..MockConfig::default()
    })
    .await;
    let mut events = session.subscribe_events();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Reply::Event { name, kind, .. } => {
            assert_eq!(name, "AMEBA.STATE");
            assert_eq!(kind, "INFO");
        }
        other => panic!("expected an event, got {other:?}"),
    }

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn non_utf8_line_is_discarded_and_the_link_stays_open() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"TPL2 2.0 CONN 1 AUTH PLAIN\n")
            .await
            .unwrap();
        let auth = lines.next_line().await.unwrap().unwrap();
        assert!(auth.starts_with("AUTH PLAIN"));
        write_half.write_all(b"AUTH OK 20 20\n").await.unwrap();

        let get = lines.next_line().await.unwrap().unwrap();
        let id = get.split_whitespace().next().unwrap().to_owned();

        // Latin-1 bytes in an event description
        write_half
            .write_all(b"0 EVENT INFO AMEBA.STATE:1: d\xf4me \xe9tat\n")
            .await
            .unwrap();
        write_half
            .write_all(b"0 EVENT INFO AMEBA.STATE:1: parked\n")
            .await
            .unwrap();
        write_half
            .write_all(
                format!(
                    "{id} COMMAND OK\n{id} DATA INLINE AMEBA.MODE=1\n{id} COMMAND COMPLETE\n"
                )
                .as_bytes(),
            )
            .await
            .unwrap();
        // Hold the connection until the client hangs up
        let _ = lines.next_line().await;
    });

    let session = Session::connect(&SessionConfig {
        port,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        command_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    })
    .await
    .unwrap();
    let mut events = session.subscribe_events();

    let reply = session.get(&["AMEBA.MODE"]).await.unwrap();
    assert_eq!(reply.int("AMEBA.MODE").unwrap(), 1);
    assert_eq!(session.link_state(), LinkState::Open);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        Reply::Event { name, description, .. } => {
            assert_eq!(name, "AMEBA.STATE");
            assert_eq!(description.as_deref(), Some("parked"));
        }
        other => panic!("expected an event, got {other:?}"),
    }
    assert!(events.try_recv().is_err());

    session.close().await;
    device.await.unwrap();
}
