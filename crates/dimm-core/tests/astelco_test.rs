//! Astelco controller and status poller against the simulated DIMM.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use dimm_api::{Session, SessionConfig};
use dimm_core::{
    AmebaMode, AstelcoController, AstelcoSettings, ControllerState, DeviceActivity,
    DimmController, Measurement, Reading, SkyStatus, StatusPoller, Telemetry, TelemetrySink,
    TickOutcome, WeatherReport,
};
use dimm_mock::{MockConfig, MockDimm};

// ── Helpers ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    published: Mutex<Vec<f64>>,
    faults: Mutex<Vec<String>>,
}

impl TelemetrySink for Recorder {
    fn publish(&self, measurement: &Measurement, _expires_at: DateTime<Utc>) {
        self.published.lock().push(measurement.seeing);
    }

    fn faulted(&self, reason: &str) {
        self.faults.lock().push(reason.to_owned());
    }
}

fn settings(mock: &MockDimm) -> AstelcoSettings {
    AstelcoSettings {
        port: mock.port(),
        poll_interval: Duration::from_millis(200),
        command_timeout: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        ..AstelcoSettings::default()
    }
}

fn quick_auto() -> MockConfig {
    MockConfig {
        slew_duration: Duration::from_millis(50),
        measurement_duration: Duration::from_millis(50),
        ..MockConfig::default()
    }
}

async fn running(
    config: MockConfig,
    sink: Arc<Recorder>,
) -> (MockDimm, AstelcoController) {
    let mock = MockDimm::start(config).await.unwrap();
    let ctl = AstelcoController::new(settings(&mock), Duration::from_secs(60), sink).unwrap();
    ctl.start().await.unwrap();
    (mock, ctl)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Measurements ────────────────────────────────────────────────────

#[tokio::test]
async fn records_measurements_in_automatic_mode() {
    let sink = Arc::new(Recorder::default());
    let (mock, ctl) = running(
        MockConfig {
            open_weather: true,
            ..quick_auto()
        },
        sink.clone(),
    )
    .await;

    eventually("a measurement", || ctl.telemetry().current().is_some()).await;
    let m = ctl.telemetry().current().unwrap();
    assert!(m.seeing > 0.0);
    assert!(m.details.airmass.is_some_and(|a| a > 0.0));
    assert_eq!(m.details.nimg, Some(1));
    assert!(!sink.published.lock().is_empty());
    assert!(ctl.status().activity.is_some());

    ctl.stop().await;
    assert_eq!(ctl.telemetry().state(), ControllerState::Disconnected);
    mock.shutdown().await;
}

#[tokio::test]
async fn garbled_event_lines_do_not_disturb_polling() {
    let sink = Arc::new(Recorder::default());
    let (mock, ctl) = running(
        MockConfig {
            open_weather: true,
            event_interval: Some(Duration::from_millis(20)),
            malformed_probability: 1.0,
            ..quick_auto()
        },
        sink.clone(),
    )
    .await;

    eventually("a measurement", || ctl.telemetry().current().is_some()).await;
    assert_eq!(ctl.telemetry().state(), ControllerState::Running);
    assert!(sink.faults.lock().is_empty());

    ctl.stop().await;
    mock.shutdown().await;
}

// ── Polling discipline ──────────────────────────────────────────────

#[tokio::test]
async fn status_queries_never_overlap() {
    let mock = MockDimm::start(MockConfig {
        reply_delay: Duration::from_millis(150),
        ..MockConfig::default()
    })
    .await
    .unwrap();
    let session = Session::connect(&SessionConfig {
        port: mock.port(),
        command_timeout: Duration::from_secs(1),
        ..SessionConfig::default()
    })
    .await
    .unwrap();
    let telemetry = Arc::new(Telemetry::new(Arc::new(Recorder::default())));
    let poller = StatusPoller::new(session.clone(), telemetry, Duration::from_secs(60));

    let (a, b, c) = tokio::join!(poller.tick(), poller.tick(), poller.tick());
    let mut outcomes = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    outcomes.sort_by_key(|o| *o == TickOutcome::Skipped);
    assert_eq!(
        outcomes,
        [TickOutcome::Unchanged, TickOutcome::Skipped, TickOutcome::Skipped]
    );
    assert_eq!(poller.status_queries(), 1);
    assert_eq!(mock.stats().gets, 1);
    assert!(!poller.is_in_flight());
    assert_eq!(poller.status().activity, Some(DeviceActivity::Parked));

    session.close().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn unanswered_status_queries_time_out_without_faulting() {
    let mut config = MockConfig::default();
    config.silent_variables.insert("AMEBA.MODE".into());
    let sink = Arc::new(Recorder::default());
    let (mock, ctl) = running(config, sink.clone()).await;

    eventually("three unanswered queries", || mock.stats().unanswered >= 3).await;
    let session = ctl.session().unwrap();
    assert!(session.table().len() <= 1);
    assert_eq!(ctl.telemetry().state(), ControllerState::Running);
    assert!(ctl.telemetry().current().is_none());
    assert!(sink.faults.lock().is_empty());

    ctl.stop().await;
    assert!(session.table().is_empty());
    mock.shutdown().await;
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn stop_fails_outstanding_commands_and_disconnects_once() {
    let mut config = MockConfig::default();
    config.silent_variables.insert("SKY.STATUS".into());
    let mock = MockDimm::start(config).await.unwrap();
    let ctl = AstelcoController::new(
        AstelcoSettings {
            poll_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(3),
            ..settings(&mock)
        },
        Duration::from_secs(60),
        Arc::new(Recorder::default()),
    )
    .unwrap();
    ctl.start().await.unwrap();

    let session = ctl.session().unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let session = session.clone();
            tokio::spawn(async move { session.get(&["SKY.STATUS"]).await })
        })
        .collect();
    eventually("three silent commands", || mock.stats().unanswered == 3).await;

    ctl.stop().await;
    for waiter in waiters {
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, dimm_api::Error::ConnectionLost { .. }), "{err:?}");
    }
    assert!(ctl.session().is_none());

    ctl.stop().await;
    eventually("the DISCONNECT", || mock.stats().disconnects >= 1).await;
    assert_eq!(mock.stats().disconnects, 1);
    mock.shutdown().await;
}

#[tokio::test]
async fn dropped_link_faults_once_and_recovers() {
    let sink = Arc::new(Recorder::default());
    let mock = MockDimm::start(MockConfig::default()).await.unwrap();
    let ctl = AstelcoController::new(settings(&mock), Duration::from_secs(60), sink.clone())
        .unwrap();
    let controller = DimmController::Astelco(ctl.clone());
    controller.start().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Running);

    mock.drop_client();
    eventually("the fault", || controller.state().is_faulted()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.faults.lock().len(), 1);

    controller.recover().await.unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(mock.stats().connections, 2);
    eventually("a status refresh", || controller.status().mode.is_some()).await;

    controller.stop().await;
    mock.shutdown().await;
}

// ── Device commands ─────────────────────────────────────────────────

#[tokio::test]
async fn forwarded_weather_lets_the_dimm_open() {
    let (mock, ctl) = running(quick_auto(), Arc::new(Recorder::default())).await;

    let report = WeatherReport {
        humidity: Some(40.0),
        wind_speed: Some(Reading {
            value: 2.0,
            avg2m: -99.0,
        }),
        precipitation: Some(0.0),
        snow_depth: Some(0.0),
        sky_temp: Some(-30.0),
        sky_status: Some(SkyStatus::Clear),
        ..WeatherReport::default()
    };
    let accepted = ctl.send_weather(&report).await.unwrap();
    assert_eq!(accepted, 5);
    assert_eq!(mock.variable("WEATHER.RAIN").as_deref(), Some("0"));
    assert_eq!(mock.variable("SKY.STATUS").as_deref(), Some("0"));

    eventually("a measurement", || ctl.telemetry().current().is_some()).await;
    assert!(mock.stats().measurements >= 1);

    ctl.stop().await;
    mock.shutdown().await;
}

#[tokio::test]
async fn ameba_mode_reaches_the_device() {
    let (mock, ctl) = running(MockConfig::default(), Arc::new(Recorder::default())).await;

    ctl.set_ameba_mode(AmebaMode::Off).await.unwrap();
    assert_eq!(mock.variable("AMEBA.MODE").as_deref(), Some("0"));
    eventually("the new mode", || ctl.status().mode == Some(AmebaMode::Off)).await;
    assert_eq!(ctl.status().activity, Some(DeviceActivity::Disabled));

    ctl.stop().await;
    mock.shutdown().await;
}
