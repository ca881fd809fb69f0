//! OLS device discovery, configuration and acquisition control.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, info};

use meas_types::{
    ConfigKey, ConfigValue, DeviceId, DeviceStatus, Error, InfoId, InfoValue, Probe, Result,
    Samplerates, ScanOption, ScanOptionKey,
};
use session::{Session, SourceKey, Timeout};
use transport::{SerialIo, SerialParams, SystemSerial};

use super::acquisition::OlsAcquisition;
use super::protocol::{self, Metadata};
use crate::types::{DeviceInfo, Driver, SerialOpener};

const DRIVER_NAME: &str = "ols";
const DEFAULT_SERIALCOMM: &str = "115200/8n1";
const DEFAULT_PROBES: u16 = 32;
const DEFAULT_SAMPLERATE: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TestPattern {
    Off,
    Internal,
    External,
}

pub(crate) struct OlsState {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub probes: Vec<Probe>,
    pub path: String,
    pub params: SerialParams,
    pub serial: Option<Box<dyn SerialIo>>,
    /// Sample memory in bytes; 0 means the device did not report one and
    /// capture sizing is bounded by the sample limit alone.
    pub max_samples: u64,
    pub max_samplerate: u64,
    pub cur_samplerate: u64,
    pub divider: u32,
    pub demux: bool,
    pub filter: bool,
    pub rle: bool,
    pub external_clock: bool,
    pub pattern: TestPattern,
    pub limit_samples: u64,
    pub capture_ratio: u64,
    pub stop_requested: bool,
    pub source_key: Option<SourceKey>,
}

impl OlsState {
    /// Program the divider state for a requested rate; the effective rate
    /// may differ and is logged when it does.
    fn set_samplerate(&mut self, rate: u64) -> Result<()> {
        if rate < 10 || rate > 2 * protocol::CLOCK_RATE || rate > self.max_samplerate {
            return Err(Error::Samplerate(rate));
        }
        if rate > protocol::CLOCK_RATE {
            self.demux = true;
            self.divider = ((2 * protocol::CLOCK_RATE).div_ceil(rate) - 1) as u32;
            self.cur_samplerate = 2 * protocol::CLOCK_RATE / (self.divider as u64 + 1);
        } else {
            self.demux = false;
            self.divider = (protocol::CLOCK_RATE / rate - 1) as u32;
            self.cur_samplerate = protocol::CLOCK_RATE / (self.divider as u64 + 1);
        }
        if self.cur_samplerate != rate {
            info!(
                "can't match samplerate {} Hz, using {} Hz",
                rate, self.cur_samplerate
            );
        }
        Ok(())
    }
}

/// Driver for SUMP/OLS-family serial logic analyzers.
pub struct OlsDriver {
    opener: SerialOpener,
    devices: Vec<Rc<RefCell<OlsState>>>,
}

impl Default for OlsDriver {
    fn default() -> OlsDriver {
        OlsDriver::new()
    }
}

impl OlsDriver {
    pub fn new() -> OlsDriver {
        OlsDriver::with_opener(Box::new(|path, params| {
            SystemSerial::open(path, params).map(|s| Box::new(s) as Box<dyn SerialIo>)
        }))
    }

    /// Construct with a custom transport opener (used to run against a
    /// scripted serial port).
    pub fn with_opener(opener: SerialOpener) -> OlsDriver {
        OlsDriver {
            opener,
            devices: Vec::new(),
        }
    }

    fn state(&self, device: DeviceId) -> Result<Rc<RefCell<OlsState>>> {
        if device.driver != DRIVER_NAME {
            return Err(Error::Bug(format!("{} does not belong to {}", device, DRIVER_NAME)));
        }
        self.devices
            .get(device.index)
            .cloned()
            .ok_or_else(|| Error::Bug(format!("unknown device {}", device)))
    }

    /// Reset the device and ask it to identify itself.
    fn probe_identity(serial: &mut dyn SerialIo) -> Result<bool> {
        serial.drain_input().map_err(meas_types::Error::from)?;
        for _ in 0..5 {
            protocol::send_shortcommand(serial, protocol::CMD_RESET)
                .map_err(meas_types::Error::from)?;
        }
        protocol::send_shortcommand(serial, protocol::CMD_ID).map_err(meas_types::Error::from)?;
        let mut id = [0u8; 4];
        let mut filled = 0;
        while filled < id.len() {
            let n = serial
                .read_timeout(&mut id[filled..], protocol::PROBE_TIMEOUT)
                .map_err(meas_types::Error::from)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < id.len() {
            debug!("identity request timed out after {} bytes", filled);
            return Ok(false);
        }
        Ok(&id == protocol::ID_SUMP || &id == protocol::ID_OLS)
    }

    fn build_state(
        &self,
        index: usize,
        path: String,
        params: SerialParams,
        metadata: Option<Metadata>,
    ) -> Result<OlsState> {
        let meta = metadata.unwrap_or_default();
        let model = meta
            .device_name
            .clone()
            .unwrap_or_else(|| "Logic Analyzer".to_string());
        let version = match (&meta.fpga_version, &meta.ancillary_version) {
            (Some(f), Some(a)) => format!("{} {}", f, a),
            (Some(f), None) => f.clone(),
            (None, Some(a)) => a.clone(),
            (None, None) => "v1.0".to_string(),
        };
        if let Some(version) = meta.protocol_version {
            debug!("device speaks protocol version {}", version);
        }
        let probe_count = meta
            .probe_count
            .unwrap_or(DEFAULT_PROBES)
            .min(DEFAULT_PROBES);
        let mut probes = Vec::with_capacity(probe_count as usize);
        for i in 0..probe_count as usize {
            probes.push(Probe::logic(i, i.to_string())?);
        }
        let mut state = OlsState {
            id: DeviceId {
                driver: DRIVER_NAME,
                index,
            },
            status: DeviceStatus::Inactive,
            vendor: "Sump".to_string(),
            model,
            version,
            probes,
            path,
            params,
            serial: None,
            max_samples: meta.sample_memory.unwrap_or(0) as u64,
            max_samplerate: meta.max_samplerate.unwrap_or(2 * protocol::CLOCK_RATE),
            cur_samplerate: 0,
            divider: 0,
            demux: false,
            filter: false,
            rle: false,
            external_clock: false,
            pattern: TestPattern::Off,
            limit_samples: 0,
            capture_ratio: 0,
            stop_requested: false,
            source_key: None,
        };
        state.set_samplerate(DEFAULT_SAMPLERATE.min(state.max_samplerate))?;
        Ok(state)
    }
}

impl Driver for OlsDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn long_name(&self) -> &'static str {
        "Openbench Logic Sniffer / SUMP"
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self) {
        self.devices.clear();
    }

    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>> {
        let mut path = None;
        let mut params: SerialParams = DEFAULT_SERIALCOMM
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
            return Err(Error::Arg("ols scan needs a connection spec".into()));
        };
        let mut serial = (self.opener)(&path, params).map_err(meas_types::Error::from)?;
        if !Self::probe_identity(serial.as_mut())? {
            debug!("no OLS-compatible device at {}", path);
            return Ok(vec![]);
        }
        protocol::send_shortcommand(serial.as_mut(), protocol::CMD_METADATA)
            .map_err(meas_types::Error::from)?;
        let metadata = protocol::read_metadata(serial.as_mut()).map_err(meas_types::Error::from)?;
        if metadata.is_none() {
            info!("device at {} sent no metadata, assuming generic Sump profile", path);
        }
        drop(serial);

        let index = self.devices.len();
        let state = self.build_state(index, path, params, metadata)?;
        info!(
            "found {} {} ({} probes) at {}",
            state.vendor,
            state.model,
            state.probes.len(),
            state.path
        );
        let id = state.id;
        self.devices.push(Rc::new(RefCell::new(state)));
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
            vendor: state.vendor.clone(),
            model: state.model.clone(),
            version: state.version.clone(),
            probes: state.probes.clone(),
        })
    }

    fn open(&mut self, device: DeviceId) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        if state.serial.is_some() {
            return Ok(());
        }
        state.serial = Some((self.opener)(&state.path, state.params).map_err(meas_types::Error::from)?);
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
                ConfigKey::Samplerate,
                ConfigKey::CaptureRatio,
                ConfigKey::LimitSamples,
                ConfigKey::Rle,
                ConfigKey::Filter,
                ConfigKey::ExternalClock,
                ConfigKey::PatternMode,
            ])),
            InfoId::TriggerAlphabet => Ok(InfoValue::Str("01".to_string())),
            InfoId::Patterns => Ok(InfoValue::Strings(vec![
                "internal".to_string(),
                "external".to_string(),
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
            InfoId::Samplerates => {
                let high = match device {
                    Some(dev) => self.state(dev)?.borrow().max_samplerate,
                    None => 2 * protocol::CLOCK_RATE,
                };
                Ok(InfoValue::Samplerates(Samplerates::Range {
                    low: 10,
                    high,
                    step: 1,
                }))
            }
            InfoId::CurrentSamplerate => {
                let state = self.state(device.ok_or_else(no_device)?)?;
                let rate = state.borrow().cur_samplerate;
                Ok(InfoValue::U64(rate))
            }
            other => Err(Error::Arg(format!("ols does not answer {:?}", other))),
        }
    }

    fn config_set(&mut self, device: DeviceId, key: ConfigKey, value: &ConfigValue) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        match key {
            ConfigKey::Samplerate => state.set_samplerate(value.as_u64()?),
            ConfigKey::LimitSamples => {
                let limit = value.as_u64()?;
                if limit < protocol::MIN_NUM_SAMPLES {
                    return Err(Error::General(format!(
                        "minimum of {} samples required",
                        protocol::MIN_NUM_SAMPLES
                    )));
                }
                state.limit_samples = limit;
                Ok(())
            }
            ConfigKey::CaptureRatio => {
                let ratio = value.as_u64()?;
                if ratio > 100 {
                    state.capture_ratio = 0;
                    return Err(Error::General(format!(
                        "capture ratio {} out of range, reset to 0",
                        ratio
                    )));
                }
                state.capture_ratio = ratio;
                Ok(())
            }
            ConfigKey::Rle => {
                state.rle = value.as_bool()?;
                Ok(())
            }
            ConfigKey::Filter => {
                state.filter = value.as_bool()?;
                Ok(())
            }
            ConfigKey::ExternalClock => {
                state.external_clock = value.as_bool()?;
                Ok(())
            }
            ConfigKey::PatternMode => {
                state.pattern = match value.as_str()? {
                    "internal" => TestPattern::Internal,
                    "external" => TestPattern::External,
                    other => {
                        return Err(Error::Arg(format!("unknown pattern mode {:?}", other)))
                    }
                };
                Ok(())
            }
            other => Err(Error::Arg(format!("ols does not support {:?}", other))),
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

    fn set_probe_trigger(
        &mut self,
        device: DeviceId,
        probe: usize,
        expr: Option<&str>,
    ) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        if let Some(expr) = expr {
            meas_types::device::validate_trigger(expr, protocol::NUM_TRIGGER_STAGES)?;
            // The OLS hardware triggers on levels only.
            if let Some(ch) = expr.chars().find(|c| !matches!(c, '0' | '1')) {
                return Err(Error::Arg(format!(
                    "ols triggers support only levels, got {:?}",
                    ch
                )));
            }
        }
        let probe = state
            .probes
            .get_mut(probe)
            .ok_or_else(|| Error::Arg(format!("no probe {}", probe)))?;
        probe.trigger = expr.map(str::to_string);
        Ok(())
    }

    fn acquisition_start(&mut self, device: DeviceId, session: &Session) -> Result<()> {
        let state_rc = self.state(device)?;
        OlsAcquisition::start(state_rc, session)
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
            // Force a dispatch so the engine flushes even if the line has
            // gone quiet.
            let _ = session.source_set_timeout(key, Timeout::Poll);
        }
        Ok(())
    }
}

fn no_device() -> Error {
    Error::Arg("query needs a device instance".into())
}
