//! End-to-end serial-DMM scenarios against a scripted serial port.

mod common;

use common::{mock_opener, record, Rec};
use drivers::dmm::rs9lcd_driver_with_opener;
use drivers::Driver;
use meas_types::{ConfigKey, ConfigValue, DeviceStatus, Mq, MqFlags, ScanOption, Unit};
use session::Session;
use transport::mock::MockSerial;

const CONN: &str = "/dev/ttyUSB1";

/// The spec's literal DC-volts frame: checksum (0 + 2 + 3*0xd7 + 57) mod
/// 256 = 0xc0.
const DC_VOLTS_FRAME: [u8; 9] = [0x00, 0x02, 0x00, 0x00, 0xd7, 0xd7, 0xd7, 0x00, 0xc0];

fn setup(mock: &MockSerial) -> (impl Driver, meas_types::DeviceId) {
    let mut driver = rs9lcd_driver_with_opener(mock_opener(mock.clone()));
    let ids = driver
        .scan(&[ScanOption::Connection(CONN.into())])
        .unwrap();
    assert_eq!(ids.len(), 1);
    let id = ids[0];
    driver.open(id).unwrap();
    (driver, id)
}

#[test]
fn valid_frame_becomes_analog_packet() {
    let mock = MockSerial::new();
    let (mut driver, id) = setup(&mock);
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(1))
        .unwrap();

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    mock.push_input(&DC_VOLTS_FRAME);
    session.run().unwrap();

    let log = log.borrow();
    assert_eq!(log[0], Rec::Header);
    assert_eq!(log[1], Rec::MetaAnalog { num_probes: 1 });
    let Rec::Analog { mq, unit, mqflags, data } = &log[2] else {
        panic!("expected analog packet, got {:?}", log[2]);
    };
    assert_eq!(*mq, Mq::Voltage);
    assert_eq!(*unit, Unit::Volt);
    assert!(mqflags.contains(MqFlags::DC));
    assert_eq!(data.as_slice(), &[0.0]);
    assert_eq!(log[3], Rec::End);
    assert_eq!(driver.device_info(id).unwrap().status, DeviceStatus::Inactive);
}

/// A frame with two multiplier indicators lit is silently discarded.
#[test]
fn conflicting_indicators_emit_nothing() {
    let mock = MockSerial::new();
    let (mut driver, id) = setup(&mock);
    driver
        .config_set(id, ConfigKey::LimitMsec, &ConfigValue::U64(80))
        .unwrap();

    // Same frame, indicatrix1 = KILO|MEGA, checksum adjusted so only the
    // mutual-exclusion check can reject it.
    let mut frame = DC_VOLTS_FRAME;
    frame[1] = 0x30;
    frame[8] = frame[8].wrapping_add(0x30).wrapping_sub(0x02);

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    mock.push_input(&frame);
    session.run().unwrap();

    let log = log.borrow();
    assert_eq!(
        &*log,
        &[Rec::Header, Rec::MetaAnalog { num_probes: 1 }, Rec::End]
    );
}

#[test]
fn stream_resyncs_across_garbage() {
    let mock = MockSerial::new();
    let (mut driver, id) = setup(&mock);
    driver
        .config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(2))
        .unwrap();

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    let mut stream = vec![0xff, 0x13];
    stream.extend_from_slice(&DC_VOLTS_FRAME);
    stream.push(0x77);
    stream.extend_from_slice(&DC_VOLTS_FRAME);
    mock.push_input(&stream);
    session.run().unwrap();

    let analog_count = log
        .borrow()
        .iter()
        .filter(|r| matches!(r, Rec::Analog { .. }))
        .count();
    assert_eq!(analog_count, 2);
    assert_eq!(log.borrow().last(), Some(&Rec::End));
}

#[test]
fn stop_terminates_stream_once() {
    let mock = MockSerial::new();
    let (mut driver, id) = setup(&mock);

    let session = Session::new();
    let log = record(&session);
    driver.acquisition_start(id, &session).unwrap();
    driver.acquisition_stop(id, &session).unwrap();
    driver.acquisition_stop(id, &session).unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_eq!(log.iter().filter(|r| **r == Rec::End).count(), 1);
    assert_eq!(log.last(), Some(&Rec::End));
}
