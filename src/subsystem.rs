//! Subsystem lifecycle: build drivers from configuration, open them, run one
//! polling task per device, and shut everything down.

use crate::config::Config;
use crate::driver::InstrumentDriver;
use crate::scheduler::{DeviceHandle, DeviceTask, HealthBoard, PowerSupplyHandle};
use crate::snapshot::Snapshot;
use dashmap::DashMap;
use futures::future::join_all;
use labctl_core::cache::StateCache;
use labctl_core::error::{ErrorClass, InstrumentError, InstrumentResult};
use labctl_core::reading::DeviceId;
use labctl_core::serial::PortOpener;
use labctl_core::transport::Transport;
use labctl_driver_bk::PowerSupply;
use labctl_driver_omega::TemperatureMonitor;
use labctl_driver_omron::InterlockController;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Device id of the temperature monitor.
pub const TEMPERATURE_MONITOR: &str = "temperature_monitor";
/// Device id of the safety controller.
pub const INTERLOCKS: &str = "interlocks";
/// Device id of the power supply.
pub const POWER_SUPPLY: &str = "power_supply";

const REQUEST_QUEUE_DEPTH: usize = 16;

struct RunningDevice {
    handle: DeviceHandle,
    task: JoinHandle<()>,
}

/// The running instrument core.
pub struct Subsystem {
    cache: Arc<StateCache>,
    board: HealthBoard,
    shutdown: watch::Sender<bool>,
    devices: BTreeMap<DeviceId, RunningDevice>,
}

impl std::fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subsystem")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Instantiate a driver for every configured device.
pub fn build_drivers(config: &Config, opener: &Arc<dyn PortOpener>) -> Vec<(DeviceId, InstrumentDriver)> {
    let retry = config.reconnect.policy();
    let transport = |name: &str, settings| {
        Transport::new(name, settings, Arc::clone(opener), retry.clone())
    };

    let mut drivers = Vec::new();
    if let Some(monitor) = &config.temperature_monitor {
        drivers.push((
            DeviceId::new(TEMPERATURE_MONITOR),
            InstrumentDriver::TemperatureMonitor(TemperatureMonitor::new(
                transport(TEMPERATURE_MONITOR, monitor.serial()),
                monitor.monitor(),
            )),
        ));
    }
    if let Some(interlocks) = &config.interlocks {
        drivers.push((
            DeviceId::new(INTERLOCKS),
            InstrumentDriver::Interlocks(InterlockController::new(
                transport(INTERLOCKS, interlocks.serial()),
                interlocks.controller(),
            )),
        ));
    }
    if let Some(psu) = &config.power_supply {
        drivers.push((
            DeviceId::new(POWER_SUPPLY),
            InstrumentDriver::PowerSupply(PowerSupply::new(
                transport(POWER_SUPPLY, psu.serial()),
                psu.supply(),
            )),
        ));
    }
    drivers
}

/// Open and initialize one device. Returns whether it is usable.
async fn bring_up(device: &DeviceId, driver: &mut InstrumentDriver) -> bool {
    match driver.transport_mut().connect().await {
        Ok(()) => {
            if let Err(e) = driver.initialize().await {
                warn!(device = %device, error = %e, "initialization incomplete, polling anyway");
            }
            true
        }
        Err(e) => {
            error!(device = %device, port = %driver.transport().settings().port, error = %e, "device could not be opened, marking closed");
            false
        }
    }
}

impl Subsystem {
    /// Open every configured device and start polling.
    ///
    /// Devices are opened concurrently. One that cannot be opened is marked
    /// `Closed`: its channels read `Disconnected` and it is not polled until
    /// its port is reassigned. No device failure aborts startup.
    pub async fn start(config: &Config, opener: Arc<dyn PortOpener>) -> Self {
        let cache = Arc::new(StateCache::new(config.polling.error_threshold));
        let board: HealthBoard = Arc::new(DashMap::new());
        let (shutdown, _) = watch::channel(false);
        let bounds = config.polling.bounds();

        let mut drivers = build_drivers(config, &opener);
        for (device, driver) in &drivers {
            for (channel, label) in driver.channels() {
                cache.register(device, channel, label);
            }
        }

        let opened = join_all(
            drivers
                .iter_mut()
                .map(|(device, driver)| bring_up(device, driver)),
        )
        .await;

        let mut devices = BTreeMap::new();
        for ((device, driver), open) in drivers.into_iter().zip(opened) {
            if !open {
                cache.declare_failure(&device, ErrorClass::LinkClosed);
            }
            let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
            let task = DeviceTask::new(
                device.clone(),
                driver,
                bounds,
                Arc::clone(&cache),
                Arc::clone(&board),
                !open,
            );
            let task = tokio::spawn(task.run(shutdown.subscribe(), requests_rx));
            devices.insert(
                device.clone(),
                RunningDevice {
                    handle: DeviceHandle::new(device, requests_tx),
                    task,
                },
            );
        }

        info!(devices = devices.len(), "subsystem started");
        Self {
            cache,
            board,
            shutdown,
            devices,
        }
    }

    /// Query handle for consumers.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(Arc::clone(&self.cache), Arc::clone(&self.board))
    }

    /// Configured devices.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.keys().cloned().collect()
    }

    /// Request handle for one device.
    pub fn device(&self, device: &DeviceId) -> Option<DeviceHandle> {
        self.devices.get(device).map(|d| d.handle.clone())
    }

    /// Operator handle for the power supply, if one is configured.
    pub fn power_supply(&self) -> Option<PowerSupplyHandle> {
        self.device(&DeviceId::new(POWER_SUPPLY))
            .map(PowerSupplyHandle::new)
    }

    /// Move a device to another serial port.
    pub async fn reassign(&self, device: &DeviceId, port: impl Into<String>) -> InstrumentResult<()> {
        let handle = self.device(device).ok_or_else(|| {
            InstrumentError::InvalidParameter(format!("no device named {}", device))
        })?;
        handle.reassign(port).await
    }

    /// Signal every task to stop, then wait for them to close their ports.
    pub async fn shutdown(self) {
        info!("subsystem shutting down");
        let _ = self.shutdown.send(true);
        for (device, running) in self.devices {
            if let Err(e) = running.task.await {
                error!(device = %device, error = %e, "polling task ended abnormally");
            }
        }
        info!("subsystem stopped");
    }
}
