//! End-to-end OLS scenarios against a scripted serial port.

mod common;

use common::{mock_opener, record, Rec};
use drivers::ols::protocol;
use drivers::ols::OlsDriver;
use drivers::Driver;
use meas_types::{ConfigKey, ConfigValue, DeviceStatus, InfoValue, ScanOption};
use session::Session;
use transport::mock::MockSerial;

const CONN: &str = "/dev/ttyACM0";

fn scan_one(mock: &MockSerial) -> (OlsDriver, meas_types::DeviceId) {
    let mut driver = OlsDriver::with_opener(mock_opener(mock.clone()));
    let ids = driver
        .scan(&[ScanOption::Connection(CONN.into())])
        .unwrap();
    assert_eq!(ids.len(), 1);
    (driver, ids[0])
}

#[test]
fn discovery_without_metadata_yields_generic_sump() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (driver, id) = scan_one(&mock);

    let info = driver.device_info(id).unwrap();
    assert_eq!(info.vendor, "Sump");
    assert_eq!(info.model, "Logic Analyzer");
    assert_eq!(info.probes.len(), 32);
    assert!(info.probes.iter().all(|p| p.enabled));
    assert_eq!(info.probes[0].name, "0");
    assert_eq!(info.probes[31].name, "31");
    assert_eq!(info.status, DeviceStatus::Inactive);

    // The probe sequence on the wire: five resets, the identity request,
    // then the metadata request.
    assert_eq!(mock.written(), vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x04]);
}

#[test]
fn discovery_with_metadata_uses_reported_profile() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1ALS");
    mock.on_write(
        &[protocol::CMD_METADATA],
        &[0x01, b'D', b'E', b'V', 0x00, 0x21, 0x00, 0x00, 0x00, 0x20, 0x00],
    );
    let (driver, id) = scan_one(&mock);

    let info = driver.device_info(id).unwrap();
    assert!(info.model.contains("DEV"));
    // 32 bytes of sample memory cap the capture sizing.
    match driver.info_get(meas_types::InfoId::Samplerates, Some(id)).unwrap() {
        InfoValue::Samplerates(meas_types::Samplerates::Range { low, high, step }) => {
            assert_eq!(low, 10);
            assert_eq!(step, 1);
            assert!(high >= protocol::CLOCK_RATE);
        }
        other => panic!("unexpected samplerates answer {:?}", other),
    }
}

#[test]
fn no_device_found_on_wrong_identity() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"XXXX");
    let mut driver = OlsDriver::with_opener(mock_opener(mock.clone()));
    let ids = driver.scan(&[ScanOption::Connection(CONN.into())]).unwrap();
    assert!(ids.is_empty());
}

#[test]
fn config_boundaries() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    // Fewer than four samples is refused outright.
    let err = driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(3))
        .unwrap_err();
    assert_eq!(err.code(), meas_types::error::status::ERR);

    // An out-of-range ratio errors and resets to zero.
    driver
        .config_set(id, ConfigKey::CaptureRatio, &ConfigValue::U64(50))
        .unwrap();
    let err = driver
        .config_set(id, ConfigKey::CaptureRatio, &ConfigValue::U64(101))
        .unwrap_err();
    assert_eq!(err.code(), meas_types::error::status::ERR);

    // Unsupported capability.
    let err = driver
        .config_set(id, ConfigKey::TimeBase, &ConfigValue::U64(1))
        .unwrap_err();
    assert_eq!(err.code(), meas_types::error::status::ERR_ARG);

    // Out-of-range samplerate carries its own status code.
    let err = driver
        .config_set(id, ConfigKey::Samplerate, &ConfigValue::U64(500_000_000))
        .unwrap_err();
    assert_eq!(err.code(), meas_types::error::status::ERR_SAMPLERATE);
}

#[test]
fn samplerate_divider_round_trip() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    for requested in [10u64, 1_000, 99_999, 1_000_000, 33_333_333, 100_000_000] {
        driver
            .config_set(id, ConfigKey::Samplerate, &ConfigValue::U64(requested))
            .unwrap();
        let reported = driver
            .info_get(meas_types::InfoId::CurrentSamplerate, Some(id))
            .unwrap()
            .as_u64()
            .unwrap();
        let expected = protocol::CLOCK_RATE / (protocol::CLOCK_RATE / requested);
        assert_eq!(reported, expected, "requested {}", requested);
    }
}

/// Scenario: eight samples, one channel group, no trigger.
#[test]
fn untriggered_capture_reverses_and_expands() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    driver.open(id).unwrap();
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(8))
        .unwrap();
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false).unwrap();
    }

    let session = Session::new();
    let log = record(&session);
    mock.clear_written();
    driver.acquisition_start(id, &session).unwrap();

    // Device transmits youngest-first.
    mock.push_input(&[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7]);
    session.run().unwrap();

    let mut expected_data = Vec::new();
    for byte in (0xa0..=0xa7u8).rev() {
        expected_data.extend_from_slice(&[byte, 0, 0, 0]);
    }
    assert_eq!(
        &*log.borrow(),
        &[
            Rec::Header,
            Rec::MetaLogic {
                num_probes: 8,
                samplerate: 1_000_000,
            },
            Rec::Logic {
                unitsize: 4,
                data: expected_data,
            },
            Rec::End,
        ]
    );
    assert_eq!(driver.device_info(id).unwrap().status, DeviceStatus::Inactive);

    // The programming sequence: forced stage-0 trigger, divider, capture
    // size, flags, run.
    let written = mock.written();
    let expected: Vec<u8> = [
        vec![0xc0, 0, 0, 0, 0],
        vec![0xc1, 0, 0, 0, 0],
        vec![0xc2, 0x08, 0, 0, 0],
        vec![protocol::CMD_SET_DIVIDER, 99, 0, 0, 0],
        vec![protocol::CMD_CAPTURE_SIZE, 1, 0, 1, 0],
        // Groups 1..3 disabled: flag bits 3..5.
        vec![protocol::CMD_SET_FLAGS, 0x38, 0, 0, 0],
        vec![protocol::CMD_RUN],
    ]
    .concat();
    assert_eq!(written, expected);
}

#[test]
fn external_clock_sets_flag_bit() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    driver.open(id).unwrap();
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(8))
        .unwrap();
    driver
        .config_set(id, ConfigKey::ExternalClock, &ConfigValue::Bool(true))
        .unwrap();
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false).unwrap();
    }

    let session = Session::new();
    let _log = record(&session);
    mock.clear_written();
    driver.acquisition_start(id, &session).unwrap();

    // The flag register carries the external-clock bit alongside the
    // group disables.
    let written = mock.written();
    let flags_cmd = written
        .windows(5)
        .find(|w| w[0] == protocol::CMD_SET_FLAGS)
        .expect("no SET_FLAGS command written")
        .to_vec();
    assert_eq!(flags_cmd, vec![protocol::CMD_SET_FLAGS, 0x78, 0, 0, 0]);

    driver.acquisition_stop(id, &session).unwrap();
    session.run().unwrap();
}

/// Scenario: trigger splits the stream at trigger_at * 4 bytes.
#[test]
fn triggered_capture_splits_at_boundary() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    driver.open(id).unwrap();
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(8))
        .unwrap();
    driver
        .config_set(id, ConfigKey::CaptureRatio, &ConfigValue::U64(50))
        .unwrap();
    driver.set_probe_trigger(id, 0, Some("1")).unwrap();
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false).unwrap();
    }

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    mock.push_input(&[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7]);
    session.run().unwrap();

    // readcount 2, delaycount 1, one stage: trigger_at = (2-1)*4 - 1 = 3.
    let log = log.borrow();
    assert_eq!(log[0], Rec::Header);
    let Rec::Logic { data: pre, .. } = &log[2] else {
        panic!("expected pre-trigger logic, got {:?}", log[2]);
    };
    assert_eq!(log[3], Rec::Trigger);
    let Rec::Logic { data: post, .. } = &log[4] else {
        panic!("expected post-trigger logic, got {:?}", log[4]);
    };
    assert_eq!(pre.len(), 3 * 4);
    assert_eq!(pre[0], 0xa7);
    assert_eq!(post.len(), 5 * 4);
    assert_eq!(post[0], 0xa4);
    assert_eq!(log[5], Rec::End);
    // Concatenated stream still carries every captured byte once.
    assert_eq!(pre.len() + post.len(), 8 * 4);
}

/// Boundary: an RLE repeat that overshoots the limit is clamped.
#[test]
fn rle_replication_clamps_to_limit() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    driver.open(id).unwrap();
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(4))
        .unwrap();
    driver
        .config_set(id, ConfigKey::Rle, &ConfigValue::Bool(true))
        .unwrap();
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false).unwrap();
    }

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    // One literal sample, then a count of 6 repeats for the next sample:
    // 1 + 7 would overflow the 4-sample limit.
    mock.push_input(&[0x01, 0x86, 0x02]);
    session.run().unwrap();

    let log = log.borrow();
    let Rec::Logic { data, .. } = &log[2] else {
        panic!("expected logic packet, got {:?}", log[2]);
    };
    assert_eq!(data.len(), 4 * 4);
    assert_eq!(
        data.as_slice(),
        &[0x02, 0, 0, 0, 0x02, 0, 0, 0, 0x02, 0, 0, 0, 0x01, 0, 0, 0]
    );
    assert_eq!(log[3], Rec::End);
}

/// Stopping mid-capture flushes what arrived and terminates the stream.
#[test]
fn stop_flushes_partial_capture() {
    let mock = MockSerial::new();
    mock.on_write(&[protocol::CMD_ID], b"1SLO");
    let (mut driver, id) = scan_one(&mock);

    driver.open(id).unwrap();
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(8))
        .unwrap();
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false).unwrap();
    }

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    mock.push_input(&[0x11, 0x22]);
    driver.acquisition_stop(id, &session).unwrap();
    // Idempotent.
    driver.acquisition_stop(id, &session).unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_eq!(log.last(), Some(&Rec::End));
    assert_eq!(log.iter().filter(|r| **r == Rec::End).count(), 1);
    assert_eq!(driver.device_info(id).unwrap().status, DeviceStatus::Inactive);
}
