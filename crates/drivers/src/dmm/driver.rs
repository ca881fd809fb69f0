//! Generic serial-DMM engine: owns a serial source, runs a frame scanner
//! over the byte stream and feeds each accepted reading into the datafeed
//! as a one-sample analog packet.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use meas_types::{
    Analog, ConfigKey, ConfigValue, DeviceId, DeviceStatus, Error, InfoId, InfoValue, MetaAnalog,
    Packet, Probe, ProbeKind, Result, ScanOption, ScanOptionKey,
};
use session::{EventSource, Session, SourceKey, Timeout, Wakeup};
use transport::{SerialIo, SerialParams, SystemSerial};

use super::{DmmParser, FrameScanner};
use crate::types::{DeviceInfo, Driver, SerialOpener};

/// Cadence for sample-limit and time-limit housekeeping while the line is
/// quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct DmmState {
    id: DeviceId,
    status: DeviceStatus,
    vendor: &'static str,
    model: &'static str,
    path: String,
    params: SerialParams,
    serial: Option<Box<dyn SerialIo>>,
    probes: Vec<Probe>,
    limit_samples: u64,
    limit_msec: u64,
    stop_requested: bool,
    source_key: Option<SourceKey>,
}

/// Driver for meters that stream fixed-size frames over a serial line,
/// parameterized by the family's [`DmmParser`].
pub struct SerialDmmDriver<P: DmmParser + Clone + 'static> {
    parser: P,
    vendor: &'static str,
    model: &'static str,
    default_serialcomm: &'static str,
    opener: SerialOpener,
    devices: Vec<Rc<RefCell<DmmState>>>,
}

impl<P: DmmParser + Clone + 'static> SerialDmmDriver<P> {
    pub fn new(
        parser: P,
        vendor: &'static str,
        model: &'static str,
        default_serialcomm: &'static str,
    ) -> SerialDmmDriver<P> {
        SerialDmmDriver::with_opener(
            parser,
            vendor,
            model,
            default_serialcomm,
            Box::new(|path, params| {
                SystemSerial::open(path, params).map(|s| Box::new(s) as Box<dyn SerialIo>)
            }),
        )
    }

    /// Construct with a custom transport opener (used to run against a
    /// scripted serial port).
    pub fn with_opener(
        parser: P,
        vendor: &'static str,
        model: &'static str,
        default_serialcomm: &'static str,
        opener: SerialOpener,
    ) -> SerialDmmDriver<P> {
        SerialDmmDriver {
            parser,
            vendor,
            model,
            default_serialcomm,
            opener,
            devices: Vec::new(),
        }
    }

    fn state(&self, device: DeviceId) -> Result<Rc<RefCell<DmmState>>> {
        if device.driver != self.parser.name() {
            return Err(Error::Bug(format!(
                "{} does not belong to {}",
                device,
                self.parser.name()
            )));
        }
        self.devices
            .get(device.index)
            .cloned()
            .ok_or_else(|| Error::Bug(format!("unknown device {}", device)))
    }
}

impl<P: DmmParser + Clone + 'static> Driver for SerialDmmDriver<P> {
    fn name(&self) -> &'static str {
        self.parser.name()
    }

    fn long_name(&self) -> &'static str {
        self.model
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self) {
        self.devices.clear();
    }

    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>> {
        let mut path = None;
        let mut params: SerialParams = self
            .default_serialcomm
            .parse()
            .map_err(meas_types::Error::from)?;
        for option in options {
            match option {
                ScanOption::Connection(p) => path = Some(p.clone()),
                ScanOption::SerialComm(spec) => {
                    params = spec.parse().map_err(meas_types::Error::from)?
                }
                ScanOption::ModelHint(_) => {}
            }
        }
        let Some(path) = path else {
            return Err(Error::Arg(format!(
                "{} scan needs a connection spec",
                self.parser.name()
            )));
        };
        // The meter streams unconditionally; opening the port is all the
        // probing there is.
        let serial = (self.opener)(&path, params).map_err(meas_types::Error::from)?;
        drop(serial);
        let id = DeviceId {
            driver: self.parser.name(),
            index: self.devices.len(),
        };
        info!("found {} {} at {}", self.vendor, self.model, path);
        self.devices.push(Rc::new(RefCell::new(DmmState {
            id,
            status: DeviceStatus::Inactive,
            vendor: self.vendor,
            model: self.model,
            path,
            params,
            serial: None,
            probes: vec![Probe::new(0, ProbeKind::Analog, "P1")?],
            limit_samples: 0,
            limit_msec: 0,
            stop_requested: false,
            source_key: None,
        })));
        Ok(vec![id])
    }

    fn device_list(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.borrow().id).collect()
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        let state = self.state(device)?;
        let state = state.borrow();
        Ok(DeviceInfo {
            id: state.id,
            status: state.status,
            vendor: state.vendor.to_string(),
            model: state.model.to_string(),
            version: String::new(),
            probes: state.probes.clone(),
        })
    }

    fn open(&mut self, device: DeviceId) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        if state.serial.is_some() {
            return Ok(());
        }
        state.serial =
            Some((self.opener)(&state.path, state.params).map_err(meas_types::Error::from)?);
        state.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, device: DeviceId) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        state.serial = None;
        state.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn info_get(&self, info: InfoId, device: Option<DeviceId>) -> Result<InfoValue> {
        match info {
            InfoId::SupportedOptions => Ok(InfoValue::ScanKeys(vec![
                ScanOptionKey::Connection,
                ScanOptionKey::SerialComm,
            ])),
            InfoId::SupportedCaps => Ok(InfoValue::Caps(vec![
                ConfigKey::LimitSamples,
                ConfigKey::LimitMsec,
                ConfigKey::Continuous,
            ])),
            InfoId::ProbeCount => {
                let state = self.state(device.ok_or_else(no_device)?)?;
                let count = state.borrow().probes.len() as u64;
                Ok(InfoValue::U64(count))
            }
            InfoId::ProbeNames => {
                let state = self.state(device.ok_or_else(no_device)?)?;
                let names = state.borrow().probes.iter().map(|p| p.name.clone()).collect();
                Ok(InfoValue::Strings(names))
            }
            other => Err(Error::Arg(format!(
                "{} does not answer {:?}",
                self.parser.name(),
                other
            ))),
        }
    }

    fn config_set(&mut self, device: DeviceId, key: ConfigKey, value: &ConfigValue) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        match key {
            ConfigKey::LimitSamples => {
                state.limit_samples = value.as_u64()?;
                Ok(())
            }
            ConfigKey::LimitMsec => {
                state.limit_msec = value.as_u64()?;
                Ok(())
            }
            ConfigKey::Continuous => {
                if value.as_bool()? {
                    state.limit_samples = 0;
                    state.limit_msec = 0;
                }
                Ok(())
            }
            other => Err(Error::Arg(format!(
                "{} does not support {:?}",
                self.parser.name(),
                other
            ))),
        }
    }

    fn set_probe_enabled(&mut self, device: DeviceId, probe: usize, enabled: bool) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        let probe = state
            .probes
            .get_mut(probe)
            .ok_or_else(|| Error::Arg(format!("no probe {}", probe)))?;
        probe.enabled = enabled;
        Ok(())
    }

    fn set_probe_trigger(&mut self, _device: DeviceId, _probe: usize, expr: Option<&str>) -> Result<()> {
        if expr.is_some() {
            return Err(Error::Arg("meters have no trigger stages".into()));
        }
        Ok(())
    }

    fn acquisition_start(&mut self, device: DeviceId, session: &Session) -> Result<()> {
        let state_rc = self.state(device)?;
        let mut state = state_rc.borrow_mut();
        if state.source_key.is_some() {
            return Err(Error::General("acquisition already running".into()));
        }
        if state.serial.is_none() {
            return Err(Error::General("device is not open".into()));
        }
        let key = SourceKey(Rc::as_ptr(&state_rc) as u64);
        state.source_key = Some(key);
        state.stop_requested = false;
        let device_id = state.id;
        let limit_samples = state.limit_samples;
        let deadline = if state.limit_msec > 0 {
            Some(Instant::now() + Duration::from_millis(state.limit_msec))
        } else {
            None
        };
        drop(state);

        session.send_header(device_id);
        session.send(device_id, &Packet::MetaAnalog(MetaAnalog { num_probes: 1 }));
        session.source_add(
            key,
            Timeout::After(POLL_INTERVAL),
            Box::new(DmmAcquisition {
                device: device_id,
                state: state_rc.clone(),
                scanner: FrameScanner::new(self.parser.clone()),
                limit_samples,
                num_samples: 0,
                deadline,
                finished: false,
            }),
        );
        Ok(())
    }

    fn acquisition_stop(&mut self, device: DeviceId, session: &Session) -> Result<()> {
        let state_rc = self.state(device)?;
        let mut state = state_rc.borrow_mut();
        let Some(key) = state.source_key else {
            return Ok(());
        };
        if !state.stop_requested {
            debug!("{}: stop requested", device);
            state.stop_requested = true;
            state.status = DeviceStatus::Stopping;
            let _ = session.source_set_timeout(key, Timeout::Poll);
        }
        Ok(())
    }
}

struct DmmAcquisition<P: DmmParser> {
    device: DeviceId,
    state: Rc<RefCell<DmmState>>,
    scanner: FrameScanner<P>,
    limit_samples: u64,
    num_samples: u64,
    deadline: Option<Instant>,
    finished: bool,
}

impl<P: DmmParser> DmmAcquisition<P> {
    fn finalize(&mut self, session: &Session) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("{}: {} readings delivered", self.device, self.num_samples);
        session.send_end(self.device);
        let mut state = self.state.borrow_mut();
        state.serial = None;
        state.source_key = None;
        state.stop_requested = false;
        state.status = DeviceStatus::Inactive;
    }

    fn limits_reached(&self) -> bool {
        if self.limit_samples > 0 && self.num_samples >= self.limit_samples {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

impl<P: DmmParser> EventSource for DmmAcquisition<P> {
    fn readiness(&mut self) -> std::io::Result<bool> {
        let mut state = self.state.borrow_mut();
        match state.serial.as_mut() {
            Some(serial) => serial
                .bytes_available()
                .map(|n| n > 0)
                .map_err(|e| std::io::Error::other(e.to_string())),
            None => Ok(false),
        }
    }

    fn dispatch(&mut self, session: &Session, wakeup: Wakeup) -> bool {
        if self.finished {
            return false;
        }
        if self.state.borrow().stop_requested || self.limits_reached() {
            self.finalize(session);
            return false;
        }
        if wakeup == Wakeup::Ready {
            let mut chunk = [0u8; 64];
            let read = {
                let mut state = self.state.borrow_mut();
                match state.serial.as_mut() {
                    Some(serial) => serial.read(&mut chunk),
                    None => {
                        drop(state);
                        warn!("{}: transport vanished", self.device);
                        self.finalize(session);
                        return false;
                    }
                }
            };
            match read {
                Ok(n) => self.scanner.push(&chunk[..n]),
                Err(e) => {
                    warn!("{}: read failed: {}", self.device, e);
                    self.finalize(session);
                    return false;
                }
            }
            while let Some(reading) = self.scanner.poll() {
                session.send(
                    self.device,
                    &Packet::Analog(Analog {
                        mq: reading.mq,
                        unit: reading.unit,
                        mqflags: reading.mqflags,
                        data: &[reading.value],
                    }),
                );
                self.num_samples += 1;
                if self.limit_samples > 0 && self.num_samples >= self.limit_samples {
                    self.finalize(session);
                    return false;
                }
            }
        }
        true
    }
}

fn no_device() -> Error {
    Error::Arg("query needs a device instance".into())
}

/// The RadioShack 22-812 behind the generic serial engine.
pub fn rs9lcd_driver() -> SerialDmmDriver<super::Rs9lcdParser> {
    SerialDmmDriver::new(super::Rs9lcdParser, "RadioShack", "22-812", "4800/8n1")
}

/// Same, with a scripted transport.
pub fn rs9lcd_driver_with_opener(opener: SerialOpener) -> SerialDmmDriver<super::Rs9lcdParser> {
    SerialDmmDriver::with_opener(super::Rs9lcdParser, "RadioShack", "22-812", "4800/8n1", opener)
}
