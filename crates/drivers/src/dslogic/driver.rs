//! DSLogic device bootstrap, configuration and acquisition control.

use std::cell::RefCell;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, warn};

use meas_types::{
    ConfigKey, ConfigValue, DeviceId, DeviceStatus, Error, InfoId, InfoValue, Probe, Result,
    Samplerates, ScanOption, ScanOptionKey,
};
use session::{Session, SourceKey, Timeout};
use transport::{
    ConnectionSpec, RusbEnumerator, TransportError, UsbDeviceInfo, UsbEnumerator, UsbIo,
    USB_TIMEOUT,
};

use super::acquisition::DslogicAcquisition;
use super::profile::{self, Bitstream, DslogicProfile};
use super::protocol::{self, TestMode};
use crate::types::{DeviceInfo, Driver};

const DRIVER_NAME: &str = "dslogic";
/// Input range switch point for dual-range frontends.
const THRESHOLD_3V3_MAX: f64 = 1.40;

/// Where firmware and bitstream blobs come from. The lookup policy lives
/// with the frontend; the driver only ever asks for a name and reads
/// until EOF.
pub trait FirmwareSource {
    fn open(&self, name: &str) -> Result<Box<dyn Read>>;
}

/// Looks for blobs in a fixed list of directories.
pub struct FsFirmware {
    dirs: Vec<PathBuf>,
}

impl FsFirmware {
    pub fn new(dirs: Vec<PathBuf>) -> FsFirmware {
        FsFirmware { dirs }
    }
}

impl FirmwareSource for FsFirmware {
    fn open(&self, name: &str) -> Result<Box<dyn Read>> {
        for dir in &self.dirs {
            let path = dir.join(name);
            if let Ok(file) = std::fs::File::open(&path) {
                debug!("loading {}", path.display());
                return Ok(Box::new(file));
            }
        }
        Err(Error::General(format!("firmware {:?} not found", name)))
    }
}

pub(crate) struct DslogicState {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub profile: &'static DslogicProfile,
    pub usb_info: UsbDeviceInfo,
    pub usb: Option<Box<dyn UsbIo>>,
    pub probes: Vec<Probe>,
    pub fw_updated: Option<Instant>,
    pub cur_samplerate: u64,
    pub limit_samples: u64,
    pub capture_ratio: u64,
    pub continuous: bool,
    pub rle: bool,
    pub external_clock: bool,
    pub test_mode: TestMode,
    pub voltage_threshold: f64,
    pub stop_requested: bool,
    pub source_key: Option<SourceKey>,
}

impl DslogicState {
    pub(crate) fn bitstream_name(&self) -> &'static str {
        match self.profile.bitstream {
            Bitstream::Single(name) => name,
            Bitstream::DualRange { v3v3, v5 } => {
                if self.voltage_threshold < THRESHOLD_3V3_MAX {
                    v3v3
                } else {
                    v5
                }
            }
        }
    }
}

/// Driver for DSLogic-family USB logic analyzers.
pub struct DslogicDriver {
    enumerator: Box<dyn UsbEnumerator>,
    firmware: Box<dyn FirmwareSource>,
    devices: Vec<Rc<RefCell<DslogicState>>>,
}

impl DslogicDriver {
    pub fn new(firmware_dirs: Vec<PathBuf>) -> Result<DslogicDriver> {
        Ok(DslogicDriver::with_backend(
            Box::new(RusbEnumerator::new().map_err(Error::from)?),
            Box::new(FsFirmware::new(firmware_dirs)),
        ))
    }

    /// Construct against an arbitrary USB backend and firmware source
    /// (used to run against scripted devices).
    pub fn with_backend(
        enumerator: Box<dyn UsbEnumerator>,
        firmware: Box<dyn FirmwareSource>,
    ) -> DslogicDriver {
        DslogicDriver {
            enumerator,
            firmware,
            devices: Vec::new(),
        }
    }

    fn state(&self, device: DeviceId) -> Result<Rc<RefCell<DslogicState>>> {
        if device.driver != DRIVER_NAME {
            return Err(Error::Bug(format!("{} does not belong to {}", device, DRIVER_NAME)));
        }
        self.devices
            .get(device.index)
            .cloned()
            .ok_or_else(|| Error::Bug(format!("unknown device {}", device)))
    }

    /// True when the device already runs its application firmware.
    fn firmware_present(usb: &mut dyn UsbIo) -> bool {
        usb.control_in(protocol::CMD_GET_FW_VERSION, 0, 0, 2, USB_TIMEOUT)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    /// Cypress FX2 bootstrap: hold the CPU in reset, stream the firmware
    /// image into RAM, release the CPU. The device drops off the bus and
    /// renumerates afterwards.
    fn upload_fx2_firmware(&self, usb: &mut dyn UsbIo, name: &str) -> Result<()> {
        info!("uploading firmware {}", name);
        let mut image = Vec::new();
        self.firmware.open(name)?.read_to_end(&mut image)?;
        usb.control_out(protocol::CMD_FX2_LOAD, protocol::FX2_CPUCS, 0, &[1], USB_TIMEOUT)
            .map_err(Error::from)?;
        let mut addr = 0usize;
        for chunk in image.chunks(protocol::FX2_FW_CHUNK) {
            usb.control_out(
                protocol::CMD_FX2_LOAD,
                addr as u16,
                ((addr >> 16) & 0xffff) as u16,
                chunk,
                USB_TIMEOUT,
            )
            .map_err(Error::from)?;
            addr += chunk.len();
        }
        usb.control_out(protocol::CMD_FX2_LOAD, protocol::FX2_CPUCS, 0, &[0], USB_TIMEOUT)
            .map_err(Error::from)?;
        Ok(())
    }

    /// Push the FPGA bitstream: a zeroed CONFIG request, a settle delay,
    /// then the blob over the bulk pipe. Short transfers are fatal.
    fn upload_fpga_bitstream(&self, usb: &mut dyn UsbIo, name: &str) -> Result<()> {
        info!("configuring FPGA with {}", name);
        usb.control_out(protocol::CMD_CONFIG, 0, 0, &[0, 0, 0], USB_TIMEOUT)
            .map_err(Error::from)?;
        std::thread::sleep(protocol::FPGA_UPLOAD_DELAY);
        let mut reader = self.firmware.open(name)?;
        let mut chunk = vec![0u8; protocol::FPGA_CHUNK];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            let written = usb
                .bulk_out(protocol::EP_CONFIG_OUT, &chunk[..n], USB_TIMEOUT)
                .map_err(Error::from)?;
            if written != n {
                return Err(TransportError::ShortTransfer {
                    expected: n,
                    actual: written,
                }
                .into());
            }
        }
        Ok(())
    }

    fn matches_conn(info: &UsbDeviceInfo, conn: &Option<ConnectionSpec>) -> bool {
        match conn {
            None => true,
            Some(ConnectionSpec::UsbVidPid { vid, pid }) => {
                info.vid == *vid && info.pid == *pid
            }
            Some(ConnectionSpec::UsbBusAddr { bus, address }) => {
                info.bus == *bus && info.address == *address
            }
            Some(ConnectionSpec::Path(_)) => false,
        }
    }
}

impl Driver for DslogicDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn long_name(&self) -> &'static str {
        "DreamSourceLab DSLogic"
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self) {
        self.devices.clear();
    }

    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>> {
        let mut conn = None;
        for option in options {
            match option {
                ScanOption::Connection(spec) => {
                    conn = Some(spec.parse::<ConnectionSpec>().map_err(Error::from)?)
                }
                ScanOption::SerialComm(_) | ScanOption::ModelHint(_) => {}
            }
        }
        let mut found = Vec::new();
        for info in self.enumerator.list().map_err(Error::from)? {
            let Some(profile) = profile::find(info.vid, info.pid) else {
                continue;
            };
            if !Self::matches_conn(&info, &conn) {
                continue;
            }
            if self
                .devices
                .iter()
                .any(|d| d.borrow().usb_info == info)
            {
                continue;
            }
            let mut usb = self.enumerator.open(&info).map_err(Error::from)?;
            let mut fw_updated = None;
            let status = if Self::firmware_present(usb.as_mut()) {
                DeviceStatus::Inactive
            } else {
                self.upload_fx2_firmware(usb.as_mut(), profile.firmware)?;
                fw_updated = Some(Instant::now());
                DeviceStatus::Initializing
            };
            drop(usb);

            let probe_count = if profile.wide { 16 } else { 8 };
            let mut probes = Vec::with_capacity(probe_count);
            for i in 0..probe_count {
                probes.push(Probe::logic(i, i.to_string())?);
            }
            let id = DeviceId {
                driver: DRIVER_NAME,
                index: self.devices.len(),
            };
            info!(
                "found {} {} at {}.{}",
                profile.vendor, profile.model, info.bus, info.address
            );
            self.devices.push(Rc::new(RefCell::new(DslogicState {
                id,
                status,
                profile,
                usb_info: info,
                usb: None,
                probes,
                fw_updated,
                cur_samplerate: protocol::DS_MAX_LOGIC_SAMPLERATE,
                limit_samples: 1024 * 1024,
                capture_ratio: 0,
                continuous: false,
                rle: false,
                external_clock: false,
                test_mode: TestMode::Off,
                voltage_threshold: 3.3,
                stop_requested: false,
                source_key: None,
            })));
            found.push(id);
        }
        Ok(found)
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
            vendor: state.profile.vendor.to_string(),
            model: state.profile.model.to_string(),
            version: String::new(),
            probes: state.probes.clone(),
        })
    }

    fn open(&mut self, device: DeviceId) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        if state.usb.is_some() {
            return Ok(());
        }
        if let Some(updated) = state.fw_updated {
            let elapsed = updated.elapsed();
            if elapsed < protocol::MAX_RENUM_DELAY {
                return Err(Error::General(format!(
                    "device is renumerating after firmware upload ({} ms in)",
                    elapsed.as_millis()
                )));
            }
        }
        let mut usb = self.enumerator.open(&state.usb_info).map_err(Error::from)?;
        let bitstream = state.bitstream_name();
        self.upload_fpga_bitstream(usb.as_mut(), bitstream)?;
        state.usb = Some(usb);
        state.fw_updated = None;
        state.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, device: DeviceId) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        state.usb = None;
        state.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn info_get(&self, info: InfoId, device: Option<DeviceId>) -> Result<InfoValue> {
        match info {
            InfoId::SupportedOptions => {
                Ok(InfoValue::ScanKeys(vec![ScanOptionKey::Connection]))
            }
            InfoId::SupportedCaps => Ok(InfoValue::Caps(vec![
                ConfigKey::Samplerate,
                ConfigKey::CaptureRatio,
                ConfigKey::LimitSamples,
                ConfigKey::Continuous,
                ConfigKey::Rle,
                ConfigKey::ExternalClock,
                ConfigKey::PatternMode,
                ConfigKey::VoltageThreshold,
            ])),
            InfoId::Samplerates => Ok(InfoValue::Samplerates(Samplerates::List(
                profile::SAMPLERATES.clone(),
            ))),
            InfoId::TriggerAlphabet => Ok(InfoValue::Str("01rfc".to_string())),
            InfoId::Patterns => Ok(InfoValue::Strings(vec![
                "internal".to_string(),
                "external".to_string(),
                "loopback".to_string(),
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
            InfoId::CurrentSamplerate => {
                let state = self.state(device.ok_or_else(no_device)?)?;
                let rate = state.borrow().cur_samplerate;
                Ok(InfoValue::U64(rate))
            }
            other => Err(Error::Arg(format!("dslogic does not answer {:?}", other))),
        }
    }

    fn config_set(&mut self, device: DeviceId, key: ConfigKey, value: &ConfigValue) -> Result<()> {
        let state = self.state(device)?;
        let mut state = state.borrow_mut();
        match key {
            ConfigKey::Samplerate => {
                let rate = value.as_u64()?;
                if !profile::SAMPLERATES.contains(&rate) {
                    return Err(Error::Samplerate(rate));
                }
                state.cur_samplerate = rate;
                Ok(())
            }
            ConfigKey::LimitSamples => {
                let limit = value.as_u64()?;
                if limit == 0 {
                    return Err(Error::Arg("sample limit must be positive".into()));
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
            ConfigKey::Continuous => {
                state.continuous = value.as_bool()?;
                Ok(())
            }
            ConfigKey::Rle => {
                state.rle = value.as_bool()?;
                Ok(())
            }
            ConfigKey::ExternalClock => {
                state.external_clock = value.as_bool()?;
                Ok(())
            }
            ConfigKey::PatternMode => {
                state.test_mode = match value.as_str()? {
                    "internal" => TestMode::Internal,
                    "external" => TestMode::External,
                    "loopback" => TestMode::Loopback,
                    other => {
                        return Err(Error::Arg(format!("unknown pattern mode {:?}", other)))
                    }
                };
                Ok(())
            }
            ConfigKey::VoltageThreshold => {
                let threshold = value.as_f64()?;
                if !(0.0..=5.0).contains(&threshold) {
                    return Err(Error::Arg(format!(
                        "voltage threshold {} outside 0..=5 V",
                        threshold
                    )));
                }
                if state.usb.is_some()
                    && matches!(state.profile.bitstream, Bitstream::DualRange { .. })
                {
                    // The range is baked into the loaded bitstream.
                    warn!("threshold change takes effect on next open");
                }
                state.voltage_threshold = threshold;
                Ok(())
            }
            other => Err(Error::Arg(format!("dslogic does not support {:?}", other))),
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
        DslogicAcquisition::start(state_rc, session)
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

fn no_device() -> Error {
    Error::Arg("query needs a device instance".into())
}
