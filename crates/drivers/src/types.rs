//! The driver abstraction every hardware backend implements.

use meas_types::{
    ConfigKey, ConfigValue, DeviceId, DeviceStatus, InfoId, InfoValue, Probe, Result, ScanOption,
};
use session::Session;
use transport::{SerialIo, SerialParams, TransportError};

/// Snapshot of one device instance, as reported by its driver.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub probes: Vec<Probe>,
}

/// Opens a serial transport for a device path. Drivers take one of these
/// at construction so tests can swap the OS port for a scripted mock.
pub type SerialOpener =
    Box<dyn Fn(&str, SerialParams) -> std::result::Result<Box<dyn SerialIo>, TransportError>>;

/// A hardware backend.
///
/// Drivers own their device instances; the identities handed out by `scan`
/// stay valid for the driver's lifetime. All driver-private state lives in
/// the implementing type, never behind an untyped pointer.
pub trait Driver {
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    /// One-time driver setup. Called by the registry before any scan.
    fn init(&mut self) -> Result<()>;

    /// Release driver-wide resources. Instances become invalid.
    fn cleanup(&mut self);

    /// Look for devices. Newly found instances are appended to the
    /// driver's device list and returned.
    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>>;

    fn device_list(&self) -> Vec<DeviceId>;

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;

    fn open(&mut self, device: DeviceId) -> Result<()>;

    fn close(&mut self, device: DeviceId) -> Result<()>;

    /// Query driver or device information. `device` is required for
    /// instance-specific queries such as the current samplerate.
    fn info_get(&self, info: InfoId, device: Option<DeviceId>) -> Result<InfoValue>;

    fn config_set(&mut self, device: DeviceId, key: ConfigKey, value: &ConfigValue) -> Result<()>;

    fn set_probe_enabled(&mut self, device: DeviceId, probe: usize, enabled: bool) -> Result<()>;

    /// Attach a trigger expression (or clear it with `None`). The
    /// expression length defines the stage count and must stay within the
    /// driver's stage limit.
    fn set_probe_trigger(&mut self, device: DeviceId, probe: usize, expr: Option<&str>)
        -> Result<()>;

    /// Begin acquisition: program the device, emit the session header and
    /// stream meta, and register an event source with `session`.
    fn acquisition_start(&mut self, device: DeviceId, session: &Session) -> Result<()>;

    /// Request the end of a running acquisition. Idempotent. Buffered
    /// samples are flushed and `End` is emitted before the engine's source
    /// unregisters itself.
    fn acquisition_stop(&mut self, device: DeviceId, session: &Session) -> Result<()>;
}
