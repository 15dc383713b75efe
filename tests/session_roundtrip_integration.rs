//! Integration tests for session recording and playback
//!
//! These tests validate the complete record/replay workflow:
//! - Call results reproduced call for call
//! - Streamed frames, HID reports and hot-plug changes redelivered
//! - Payload storage modes
//! - Divergence detection

mod common;

use std::sync::Arc;
use std::time::Duration;

use cambackend::backend::{Backend, FrameCallback, HidCallback, MockDeviceSpec};
use cambackend::config::PlaybackConfig;
use cambackend::error::BackendError;
use cambackend::session::{
    CallKind, PlaybackBackend, RecordingMode, SessionLog, DEFAULT_SECTION,
};
use cambackend::types::{DeviceChange, Frame, HidSample, PowerState, XuControl};
use common::mock_helpers::{create_recorder, create_test_channel, create_test_host, temp_log};
use common::test_timeout;

fn replay(path: &std::path::Path, section: &str) -> PlaybackBackend {
    PlaybackBackend::open(path, section, &PlaybackConfig::default()).expect("open playback")
}

/// Control traffic against the SR300: returns every observable result
fn control_session(backend: &dyn Backend) -> Vec<String> {
    let mut results = Vec::new();
    let snapshot = backend.snapshot().unwrap();
    results.push(format!("{:?}", snapshot));

    let usb = backend.open_usb(&snapshot.usb[0]).unwrap();
    let response = usb
        .send_receive(&[0x14, 0x00, 0xab, 0xcd], Duration::from_millis(100), true)
        .unwrap();
    results.push(format!("{:?}", response));
    usb.close();

    let video = backend.open_video(&snapshot.video[0]).unwrap();
    results.push(format!("{:?}", video.profiles().unwrap()));
    let control = XuControl::new(3, 2);
    video.set_xu(control, &[1, 2, 3]).unwrap();
    results.push(format!("{:?}", video.get_xu(control, 4).unwrap()));
    video.set_pu(9963776, 42).unwrap();
    results.push(format!("{:?}", video.get_pu(9963776).unwrap()));
    video.set_power_state(PowerState::D3).unwrap();
    results.push(format!("{:?}", video.power_state().unwrap()));
    video.close();
    results.push(format!("{:?}", video.profiles().map_err(|e| e.to_string())));
    results
}

#[test]
fn test_control_calls_replay_identically() {
    let (_dir, path) = temp_log();
    let live = {
        let recorder = create_recorder(
            create_test_host(),
            &path,
            DEFAULT_SECTION,
            RecordingMode::BestQuality,
        );
        control_session(&recorder)
    };

    let playback = replay(&path, DEFAULT_SECTION);
    let replayed = control_session(&playback);
    assert_eq!(replayed, live);
    assert_eq!(playback.remaining_calls(), 0);
    assert!(!playback.is_poisoned());
}

fn collect_frames(backend: &dyn Backend, expected: usize) -> Vec<Frame> {
    let snapshot = backend.snapshot().unwrap();
    let video = backend.open_video(&snapshot.video[0]).unwrap();
    let profiles = video.profiles().unwrap();

    let (tx, rx) = create_test_channel();
    let callback: FrameCallback = Arc::new(move |frame| {
        let _ = tx.send(frame);
    });
    video.start_streaming(profiles[0], callback).unwrap();

    let frames: Vec<Frame> = (0..expected)
        .map(|_| rx.recv_timeout(test_timeout()).expect("frame delivered"))
        .collect();
    video.stop_streaming().unwrap();
    video.close();
    frames
}

#[test]
fn test_frames_replay_in_order() {
    let (_dir, path) = temp_log();
    let live = {
        let recorder =
            create_recorder(create_test_host(), &path, "stream", RecordingMode::BestQuality);
        collect_frames(&recorder, 4)
    };

    let replayed = collect_frames(&replay(&path, "stream"), 4);
    assert_eq!(replayed, live);
    assert!(replayed.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[test]
fn test_compressed_mode_keeps_payloads() {
    let (_dir, path) = temp_log();
    let live = {
        let recorder =
            create_recorder(create_test_host(), &path, "deflate", RecordingMode::Compressed);
        collect_frames(&recorder, 4)
    };

    let replayed = collect_frames(&replay(&path, "deflate"), 4);
    assert_eq!(replayed, live);
}

#[test]
fn test_blank_frames_mode_keeps_only_lengths() {
    let (_dir, path) = temp_log();
    let live = {
        let recorder =
            create_recorder(create_test_host(), &path, "blank", RecordingMode::BlankFrames);
        collect_frames(&recorder, 4)
    };

    let replayed = collect_frames(&replay(&path, "blank"), 4);
    assert_eq!(replayed.len(), live.len());
    for (replayed, live) in replayed.iter().zip(&live) {
        assert_eq!(replayed.sequence, live.sequence);
        assert_eq!(replayed.profile, live.profile);
        assert_eq!(replayed.data.len(), live.data.len());
        assert!(replayed.data.iter().all(|b| *b == 0));
    }
}

fn collect_reports(backend: &dyn Backend, expected: usize) -> Vec<HidSample> {
    let snapshot = backend.snapshot().unwrap();
    let hid = backend.open_hid(&snapshot.hid[0]).unwrap();
    assert_eq!(hid.sensors().unwrap().len(), 1);

    let (tx, rx) = create_test_channel();
    let callback: HidCallback = Arc::new(move |sample| {
        let _ = tx.send(sample);
    });
    hid.start_capture(callback).unwrap();
    let samples = (0..expected)
        .map(|_| rx.recv_timeout(test_timeout()).expect("report delivered"))
        .collect();
    hid.stop_capture().unwrap();
    assert!(matches!(
        hid.write_report(&[]),
        Err(BackendError::InvalidArgument(_))
    ));
    hid.close();
    samples
}

#[test]
fn test_hid_reports_replay() {
    let (_dir, path) = temp_log();
    let live = {
        let recorder = create_recorder(create_test_host(), &path, "imu", RecordingMode::BestQuality);
        collect_reports(&recorder, 3)
    };

    let replayed = collect_reports(&replay(&path, "imu"), 3);
    assert_eq!(replayed, live);
    assert_eq!(replayed[0].sensor, "accel_3d");
}

#[test]
fn test_hotplug_changes_replay() {
    let (_dir, path) = temp_log();
    let host = create_test_host();

    let live: Vec<DeviceChange> = {
        let recorder = create_recorder(host.clone(), &path, "hotplug", RecordingMode::BestQuality);
        let (tx, rx) = create_test_channel();
        recorder
            .subscribe_devices_changed(Arc::new(move |change| {
                let _ = tx.send(change);
            }))
            .unwrap();
        // Leave room for the replayed subscribe to land before the first change
        std::thread::sleep(Duration::from_millis(50));
        host.plug(&MockDeviceSpec::recovery(0x0ADB, "2-1"));
        host.unplug("1-1");
        let changes = vec![
            rx.recv_timeout(test_timeout()).unwrap(),
            rx.recv_timeout(test_timeout()).unwrap(),
        ];
        recorder.unsubscribe_devices_changed().unwrap();
        changes
    };
    assert_eq!(live[0].added.usb.len(), 1);
    assert_eq!(live[1].removed.video.len(), 2);

    let playback = replay(&path, "hotplug");
    let (tx, rx) = create_test_channel();
    playback
        .subscribe_devices_changed(Arc::new(move |change| {
            let _ = tx.send(change);
        }))
        .unwrap();
    let replayed = vec![
        rx.recv_timeout(test_timeout()).unwrap(),
        rx.recv_timeout(test_timeout()).unwrap(),
    ];
    playback.unsubscribe_devices_changed().unwrap();
    assert_eq!(replayed, live);
}

#[test]
fn test_recorded_error_replays_as_same_variant() {
    let (_dir, path) = temp_log();
    let host = create_test_host();
    let usb_id = host.attached().usb[0].id.clone();
    host.hold_interface(&usb_id);

    {
        let recorder = create_recorder(host.clone(), &path, "held", RecordingMode::BestQuality);
        let usb = recorder.query_usb_interfaces().unwrap();
        assert!(matches!(
            recorder.open_usb(&usb[0]),
            Err(BackendError::AccessDenied(_))
        ));
    }

    let playback = replay(&path, "held");
    let usb = playback.query_usb_interfaces().unwrap();
    assert!(matches!(
        playback.open_usb(&usb[0]),
        Err(BackendError::AccessDenied(ref id)) if *id == usb_id
    ));
}

#[test]
fn test_divergent_call_order_is_reported_at_first_divergence() {
    let (_dir, path) = temp_log();
    {
        let recorder = create_recorder(create_test_host(), &path, "order", RecordingMode::BestQuality);
        recorder.query_video_interfaces().unwrap();
        recorder.query_usb_interfaces().unwrap();
        recorder.query_hid_interfaces().unwrap();
    }

    let playback = replay(&path, "order");
    playback.query_video_interfaces().unwrap();
    let err = playback.query_hid_interfaces().unwrap_err();
    match err {
        BackendError::PlaybackMismatch { seq, expected, actual } => {
            assert_eq!(seq, 1);
            assert_eq!(expected, CallKind::QueryUsbInterfaces.display_name());
            assert_eq!(actual, CallKind::QueryHidInterfaces.display_name());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(playback.is_poisoned());
    assert!(playback.query_usb_interfaces().unwrap_err().is_playback_mismatch());
}

#[test]
fn test_sections_share_one_file() {
    let (_dir, path) = temp_log();
    let host = create_test_host();
    {
        let recorder = create_recorder(host.clone(), &path, "first", RecordingMode::BestQuality);
        recorder.query_usb_interfaces().unwrap();
    }
    {
        let recorder = create_recorder(host.clone(), &path, "second", RecordingMode::BestQuality);
        recorder.query_hid_interfaces().unwrap();
        recorder.query_hid_interfaces().unwrap();
    }

    assert_eq!(
        SessionLog::sections(&path).unwrap(),
        vec!["first".to_string(), "second".to_string()]
    );

    let second = SessionLog::load(&path, "second").unwrap();
    assert!(second.complete);
    assert_eq!(second.calls.len(), 2);

    let playback = replay(&path, "first");
    assert_eq!(playback.query_usb_interfaces().unwrap().len(), 2);
}
