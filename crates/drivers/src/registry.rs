//! Explicitly constructed driver registry.
//!
//! There is no ambient global driver list; a frontend builds a registry,
//! registers the backends it wants, and resolves devices through it.

use log::{debug, warn};

use meas_types::{DeviceId, Error, Result};

use crate::types::Driver;

#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> DriverRegistry {
        DriverRegistry::default()
    }

    /// Register and initialize a driver. Driver names must be unique.
    pub fn register(&mut self, mut driver: Box<dyn Driver>) -> Result<()> {
        if self.drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(Error::Arg(format!(
                "driver {:?} is already registered",
                driver.name()
            )));
        }
        driver.init()?;
        debug!("registered driver {} ({})", driver.name(), driver.long_name());
        self.drivers.push(driver);
        Ok(())
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Driver> {
        self.drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Driver + 'static)> {
        self.drivers
            .iter_mut()
            .find(|d| d.name() == name)
            .map(|d| d.as_mut())
    }

    /// Resolve a device id to its owning driver.
    pub fn driver_for(&mut self, device: DeviceId) -> Result<&mut (dyn Driver + 'static)> {
        self.get_mut(device.driver)
            .ok_or_else(|| Error::Bug(format!("no driver registered for {}", device)))
    }

    /// All devices across all registered drivers.
    pub fn device_list(&self) -> Vec<DeviceId> {
        self.drivers.iter().flat_map(|d| d.device_list()).collect()
    }

    /// Clean up every driver. Called automatically on drop.
    pub fn cleanup(&mut self) {
        for driver in self.drivers.iter_mut() {
            debug!("cleaning up driver {}", driver.name());
            driver.cleanup();
        }
        self.drivers.clear();
    }
}

impl Drop for DriverRegistry {
    fn drop(&mut self) {
        if !self.drivers.is_empty() {
            warn!("registry dropped with {} live drivers", self.drivers.len());
            self.cleanup();
        }
    }
}
