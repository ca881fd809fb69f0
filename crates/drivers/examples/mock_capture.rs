//! Run an OLS capture against a scripted serial port and render the
//! sampled bits, no hardware required.
//!
//!     cargo run --example mock_capture

use drivers::ols::protocol::CMD_ID;
use drivers::ols::OlsDriver;
use drivers::Driver;
use meas_types::{ConfigKey, ConfigValue, Packet, ScanOption};
use session::Session;
use transport::mock::MockSerial;
use transport::SerialIo;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mock = MockSerial::new();
    mock.on_write(&[CMD_ID], b"1SLO");
    let port = mock.clone();
    let mut driver = OlsDriver::with_opener(Box::new(move |_path, _params| {
        Ok(Box::new(port.clone()) as Box<dyn SerialIo>)
    }));

    let ids = driver.scan(&[ScanOption::Connection("/dev/null".into())])?;
    let id = ids[0];
    let info = driver.device_info(id)?;
    println!("{} {} with {} probes", info.vendor, info.model, info.probes.len());

    driver.open(id)?;
    driver.config_set(id, ConfigKey::LimitSamples, &ConfigValue::U64(16))?;
    for probe in 8..32 {
        driver.set_probe_enabled(id, probe, false)?;
    }

    let session = Session::new();
    session.datafeed_subscribe(Box::new(|device, packet| match packet {
        Packet::Logic(logic) => {
            for sample in logic.data().chunks(logic.unitsize()) {
                println!(
                    "{}",
                    format!("{:08b}", sample[0]).replace('1', "█").replace('0', " ")
                );
            }
        }
        other => println!("[{}] {} packet", device, other.kind()),
    }));

    driver.acquisition_start(id, &session)?;
    // A walking-ones pattern, youngest sample first.
    let stimulus: Vec<u8> = (0..16u8).map(|i| 1 << (i % 8)).collect();
    mock.push_input(&stimulus);
    session.run()?;
    Ok(())
}
