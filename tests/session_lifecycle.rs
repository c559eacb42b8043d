mod common;

use common::{mirror_config, network_config, policy, Harness, Shell, HEALTHY_ENCODER};
use q8_streamer::config::{EncoderSettings, SessionPolicy};
use q8_streamer::encoder::FfmpegCommand;
use q8_streamer::stream::{ReasonCode, SessionState, StatusEvent};
use q8_streamer::{DisplayId, DisplayMode, StartError, StreamerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<(String, String)> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push((event.from.name().to_string(), event.to.name().to_string()));
    }
    seen
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    expected.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
}

#[tokio::test]
async fn display_ids_are_stable_across_enumerations() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let first: Vec<DisplayId> = harness.registry.enumerate().await.iter().map(|d| d.id).collect();
    let second: Vec<DisplayId> = harness.registry.enumerate().await.iter().map(|d| d.id).collect();
    assert_eq!(first, vec![DisplayId(1), DisplayId(2)]);
    assert_eq!(first, second);

    let names: Vec<String> = harness.controller.list_displays().await.iter().map(|d| d.display_name()).collect();
    assert_eq!(names[0], "Display 1: Built-in - 1280x800 (Primary)");
    assert_eq!(names[1], "Display 2: Venue - 1920x1080");
}

#[tokio::test]
async fn venue_screen_starts_and_stops() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let mut events = harness.controller.subscribe();

    let started = Instant::now();
    assert_ok!(
        harness
            .controller
            .start(mirror_config("venue-screen", 2, DisplayMode::Fullscreen))
            .await
    );
    harness
        .wait_for("venue-screen", Duration::from_millis(500), |s| *s == SessionState::Running)
        .await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(drain(&mut events), pairs(&[("idle", "starting"), ("starting", "running")]));

    // The window covers the venue display.
    assert_eq!(harness.surfaces.open_surfaces(), 1);
    let placement = &harness.surfaces.placements()[0];
    assert!(placement.fullscreen);
    assert_eq!((placement.geometry.x, placement.geometry.width), (1280, 1920));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.surfaces.presented() > 0);

    assert_ok!(harness.controller.stop("venue-screen").await);
    assert_eq!(drain(&mut events), pairs(&[("running", "stopping"), ("stopping", "idle")]));
    assert_eq!(harness.surfaces.open_surfaces(), 0);

    let status = harness.controller.status("venue-screen").unwrap();
    assert_eq!(status.state, SessionState::Idle);
    assert!(status.frames_delivered > 0);
    assert!(status.run_id.is_some());
}

#[tokio::test]
async fn stop_twice_is_idempotent() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    harness
        .controller
        .start(mirror_config("venue-screen", 2, DisplayMode::Mirror))
        .await
        .unwrap();

    assert_ok!(harness.controller.stop("venue-screen").await);
    assert_ok!(harness.controller.stop("venue-screen").await);
    assert_eq!(harness.controller.state("venue-screen"), Some(SessionState::Idle));

    // And the name can be started again.
    assert_ok!(
        harness
            .controller
            .start(mirror_config("venue-screen", 2, DisplayMode::Mirror))
            .await
    );
    assert_ok!(harness.controller.stop("venue-screen").await);
}

#[tokio::test]
async fn unknown_display_is_a_config_error() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let mut events = harness.controller.subscribe();

    let err = harness
        .controller
        .start(mirror_config("venue-screen", 5, DisplayMode::Fullscreen))
        .await
        .unwrap_err();
    assert!(err.is_config(), "{}", err);
    assert_eq!(harness.controller.state("venue-screen"), Some(SessionState::Idle));
    assert!(drain(&mut events).is_empty());
    assert_eq!(harness.surfaces.open_surfaces(), 0);
}

#[tokio::test]
async fn hotplug_degrades_and_recovers_without_restart() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let watcher = harness.registry.spawn_watcher(Duration::from_millis(50));
    harness
        .controller
        .start(mirror_config("venue-screen", 2, DisplayMode::Fullscreen))
        .await
        .unwrap();

    // Unplug only at the backend; the watcher's next poll must notice.
    harness.backend.unplug("HDMI-1");
    let status = harness
        .wait_for("venue-screen", Duration::from_millis(500), |s| *s == SessionState::Degraded)
        .await;
    assert_eq!(status.reason.unwrap().code, ReasonCode::DisplayLost);

    harness.replug_venue().await;
    let status = harness
        .wait_for("venue-screen", Duration::from_secs(2), |s| *s == SessionState::Running)
        .await;
    assert_eq!(status.reason, None);

    // Same display id after reconnect, and the window was re-placed on it.
    let venue = harness.registry.get(DisplayId(2)).await.unwrap();
    assert!(venue.connected);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.surfaces.placements().len() >= 2);

    assert_ok!(harness.controller.stop("venue-screen").await);
    watcher.abort();
}

#[tokio::test]
async fn display_lost_beyond_grace_fails() {
    let policy = SessionPolicy {
        reconnect_grace_ms: 300,
        ..policy()
    };
    let harness = Harness::with_policy(Arc::new(Shell(HEALTHY_ENCODER)), policy).await;
    harness
        .controller
        .start(mirror_config("venue-screen", 2, DisplayMode::Mirror))
        .await
        .unwrap();

    harness.unplug_venue().await;
    let status = harness
        .wait_for("venue-screen", Duration::from_secs(2), SessionState::is_failed)
        .await;
    match status.state {
        SessionState::Failed(reason) => assert_eq!(reason.code, ReasonCode::DisplayLost),
        other => panic!("unexpected {}", other),
    }

    // Reconnecting does not resurrect a failed session.
    harness.replug_venue().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.controller.state("venue-screen").unwrap().is_failed());
    // The pipeline was released on failure.
    assert_eq!(harness.surfaces.open_surfaces(), 0);

    assert_ok!(harness.controller.stop("venue-screen").await);
    assert_eq!(harness.controller.state("venue-screen"), Some(SessionState::Idle));
}

#[tokio::test]
async fn encoder_exit_fails_session_and_stop_cleans_up() {
    let harness = Harness::new(Arc::new(Shell("sleep 0.3; exit 3"))).await;
    harness.controller.start(network_config("yt-live", "key1")).await.unwrap();
    assert_eq!(harness.controller.state("yt-live"), Some(SessionState::Running));

    // Exit at ~0.3s, one health interval (50ms) to notice.
    let status = harness
        .wait_for("yt-live", Duration::from_millis(1_000), SessionState::is_failed)
        .await;
    match status.state {
        SessionState::Failed(reason) => {
            assert_eq!(reason.code, ReasonCode::EncoderFault);
            assert!(reason.message.contains("exited"), "{}", reason.message);
        }
        other => panic!("unexpected {}", other),
    }

    // No silent restart.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.controller.state("yt-live").unwrap().is_failed());

    let stopping = Instant::now();
    assert_ok!(harness.controller.stop("yt-live").await);
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert_eq!(harness.controller.state("yt-live"), Some(SessionState::Idle));
}

#[tokio::test]
async fn failure_is_published_before_encoder_teardown() {
    // Never reads stdin and outlives the terminate grace.
    let policy = SessionPolicy {
        liveness_window_ms: 300,
        terminate_grace_ms: 2_000,
        stop_timeout_ms: 5_000,
        ..policy()
    };
    let harness = Harness::with_policy(Arc::new(Shell("sleep 30")), policy).await;
    let mut events = harness.controller.subscribe();
    harness.controller.start(network_config("yt-live", "key1")).await.unwrap();

    // Well before the encoder could have been reaped.
    let status = harness
        .wait_for("yt-live", Duration::from_millis(1_500), SessionState::is_failed)
        .await;
    match status.state {
        SessionState::Failed(reason) => assert_eq!(reason.code, ReasonCode::EncoderFault),
        other => panic!("unexpected {}", other),
    }

    // A stop during teardown keeps the failure in the history.
    assert_ok!(harness.controller.stop("yt-live").await);
    assert_eq!(harness.controller.state("yt-live"), Some(SessionState::Idle));
    // The stalled pipe may degrade the session on overrun first.
    let seen = drain(&mut events);
    let tail = &seen[seen.len() - 3..];
    assert!(tail[0].0 == "running" || tail[0].0 == "degraded", "{:?}", seen);
    assert_eq!(tail[0].1, "failed");
    assert_eq!(&tail[1..], &pairs(&[("failed", "stopping"), ("stopping", "idle")])[..]);
}

#[tokio::test]
async fn slow_output_degrades_and_recovers_without_restart() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let mut venue = mirror_config("venue-screen", 2, DisplayMode::Windowed { width: 320, height: 180 });
    venue.frame_rate = 30;
    venue.resolution = q8_streamer::Resolution::new(320, 180);
    harness.controller.start(venue).await.unwrap();
    let run_id = harness.controller.status("venue-screen").unwrap().run_id;

    // ~5 presents per second against 30 offered.
    harness.surfaces.set_present_delay(Duration::from_millis(200));
    let status = harness
        .wait_for("venue-screen", Duration::from_secs(2), |s| *s == SessionState::Degraded)
        .await;
    assert_eq!(status.reason.unwrap().code, ReasonCode::SinkOverrun);

    harness.surfaces.set_present_delay(Duration::ZERO);
    let status = harness
        .wait_for("venue-screen", Duration::from_secs(2), |s| *s == SessionState::Running)
        .await;
    assert_eq!(status.reason, None);
    assert_eq!(status.run_id, run_id);

    assert_ok!(harness.controller.stop("venue-screen").await);
}

#[tokio::test]
async fn brief_display_loss_is_not_an_overrun() {
    let policy = SessionPolicy {
        overrun_window_ms: 1_000,
        ..policy()
    };
    let harness = Harness::with_policy(Arc::new(Shell(HEALTHY_ENCODER)), policy).await;
    let mut venue = mirror_config("venue-screen", 2, DisplayMode::Windowed { width: 320, height: 180 });
    venue.frame_rate = 30;
    venue.resolution = q8_streamer::Resolution::new(320, 180);
    harness.controller.start(venue).await.unwrap();
    let mut events = harness.controller.subscribe();

    // Gone for most of one overrun window, back before it closes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.unplug_venue().await;
    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.replug_venue().await;
    harness
        .wait_for("venue-screen", Duration::from_secs(1), |s| *s == SessionState::Running)
        .await;

    // Past the window boundary and the next one.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let status = harness.controller.status("venue-screen").unwrap();
    assert_eq!(status.state, SessionState::Running);
    assert!(status.frames_dropped > 0);

    let events: Vec<StatusEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(events
        .iter()
        .filter_map(|e| e.reason.as_ref())
        .all(|reason| reason.code == ReasonCode::DisplayLost));

    assert_ok!(harness.controller.stop("venue-screen").await);
}

#[tokio::test]
async fn yt_live_with_missing_encoder_stays_idle() {
    let builder = FfmpegCommand::new(EncoderSettings {
        ffmpeg_path: Some("/nonexistent/bin/ffmpeg".into()),
        ..EncoderSettings::default()
    });
    let harness = Harness::new(Arc::new(builder)).await;
    let mut events = harness.controller.subscribe();

    let err = harness
        .controller
        .start(network_config("yt-live", "key1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamerError::Start(StartError::BinaryMissing(_))), "{}", err);
    assert_eq!(harness.controller.state("yt-live"), Some(SessionState::Idle));
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn stalled_encoder_drops_frames_without_slowing_other_sessions() {
    // Never reads stdin: the pipe fills and writes start timing out.
    let harness = Harness::new(Arc::new(Shell("sleep 30"))).await;
    harness.controller.start(network_config("yt-live", "key1")).await.unwrap();

    let mut venue = mirror_config("venue-screen", 2, DisplayMode::Windowed { width: 320, height: 180 });
    venue.frame_rate = 30;
    venue.resolution = q8_streamer::Resolution::new(320, 180);
    harness.controller.start(venue).await.unwrap();

    let mut drops = Vec::new();
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        drops.push(harness.controller.status("yt-live").unwrap().frames_dropped);
    }
    assert!(drops.windows(2).all(|w| w[0] <= w[1]), "drop counter went backwards: {:?}", drops);
    assert!(drops.last().copied().unwrap_or(0) > 0, "no drops recorded: {:?}", drops);

    // ~1.5s at 30 fps; the mirror session kept its cadence.
    let venue = harness.controller.status("venue-screen").unwrap();
    assert!(venue.frames_delivered >= 25, "venue delivered {}", venue.frames_delivered);
    assert!(!venue.state.is_failed());

    let stopping = Instant::now();
    assert_ok!(harness.controller.stop("yt-live").await);
    assert!(stopping.elapsed() < Duration::from_secs(3));
    assert_ok!(harness.controller.stop("venue-screen").await);
}

#[tokio::test]
async fn one_failing_session_leaves_others_running() {
    let harness = Harness::new(Arc::new(Shell("sleep 0.2; exit 3"))).await;
    harness
        .controller
        .start(mirror_config("venue-screen", 2, DisplayMode::Fullscreen))
        .await
        .unwrap();
    harness.controller.start(network_config("yt-live", "key1")).await.unwrap();

    harness
        .wait_for("yt-live", Duration::from_secs(1), SessionState::is_failed)
        .await;
    assert!(harness.controller.state("venue-screen").unwrap().is_active());
    assert_eq!(harness.surfaces.open_surfaces(), 1);

    harness.controller.shutdown().await;
    assert!(harness
        .controller
        .statuses()
        .iter()
        .all(|s| s.state == SessionState::Idle));
}

#[tokio::test]
async fn transitions_are_published_in_order() {
    let harness = Harness::new(Arc::new(Shell(HEALTHY_ENCODER))).await;
    let mut events = harness.controller.subscribe();

    harness.controller.start(network_config("yt-live", "key1")).await.unwrap();
    harness.controller.stop("yt-live").await.unwrap();

    let events: Vec<StatusEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(events.len(), 4);
    assert!(events.windows(2).all(|w| w[0].at <= w[1].at && w[0].to == w[1].from));
    assert!(events.iter().all(|e| e.session == "yt-live"));
}
