//! Per-device polling tasks.
//!
//! Every device runs in its own task that owns the driver, its transport and
//! its [`PollingState`]. A task polls, records the outcome in the shared
//! [`StateCache`], publishes a [`DeviceHealth`], then waits for the adapted
//! interval. While waiting it serves requests from its [`DeviceRequest`]
//! channel (power-supply commands, port reassignment) so commands and polls
//! never touch the transport at the same time. The shutdown signal is only
//! observed between iterations, never in the middle of an exchange.

use crate::driver::{InstrumentDriver, ProtocolKind};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use labctl_core::cache::StateCache;
use labctl_core::error::{ErrorClass, InstrumentError, InstrumentResult};
use labctl_core::polling::{BackoffBounds, PollingState};
use labctl_core::reading::DeviceId;
use labctl_driver_bk::LiveReading;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not open; the device is not polled until its port is reassigned.
    Closed,
    /// Last poll succeeded.
    Open,
    /// Polls are failing; the scheduler is backing off.
    Degraded,
}

/// Health of one device as published after every poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealth {
    /// Protocol family.
    pub protocol: ProtocolKind,
    /// Serial port path.
    pub port: String,
    /// Connection state.
    pub connection_state: ConnectionState,
    /// Interval until the next poll.
    pub current_interval_ms: u64,
    /// Consecutive failed polls.
    pub consecutive_errors: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Class of the most recent failure.
    pub last_error_class: Option<ErrorClass>,
    /// Time of the most recent failure.
    pub last_error_at: Option<DateTime<Utc>>,
    /// Time of the most recent successful poll.
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Device health, shared between the tasks and the snapshot API.
pub type HealthBoard = Arc<DashMap<DeviceId, DeviceHealth>>;

// =============================================================================
// Requests
// =============================================================================

/// Operator command for a power supply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupplyCommand {
    /// Select a preset.
    SelectPreset(u8),
    /// Voltage setting of a preset.
    SetVoltage {
        /// Preset slot.
        preset: u8,
        /// Volts.
        volts: f64,
    },
    /// Current setting of a preset.
    SetCurrent {
        /// Preset slot.
        preset: u8,
        /// Amps.
        amps: f64,
    },
    /// Over-voltage protection limit.
    SetOvp(f64),
    /// Over-current protection limit.
    SetOcp(f64),
    /// Output on or off.
    SetOutput(bool),
    /// Read a preset's settings.
    GetSettings(u8),
    /// Read the OVP limit.
    GetOvp,
    /// Read the OCP limit.
    GetOcp,
    /// Read the output now, outside the polling cadence.
    LiveReading,
}

/// Result of a [`SupplyCommand`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SupplyReply {
    /// Command acknowledged.
    Done,
    /// Preset settings.
    Settings {
        /// Volts.
        volts: f64,
        /// Amps.
        amps: f64,
    },
    /// A protection limit.
    Limit(f64),
    /// Live output reading.
    Live(LiveReading),
}

/// Request served by a device task between polls.
#[derive(Debug)]
pub enum DeviceRequest {
    /// Close the port and reopen the device on another path.
    Reassign {
        /// New port path.
        port: String,
        /// Outcome.
        reply: oneshot::Sender<InstrumentResult<()>>,
    },
    /// Power-supply operator command.
    Supply {
        /// Command to run.
        command: SupplyCommand,
        /// Outcome.
        reply: oneshot::Sender<InstrumentResult<SupplyReply>>,
    },
}

fn task_stopped(device: &DeviceId) -> InstrumentError {
    InstrumentError::Disconnected(format!("{} polling task has stopped", device))
}

/// Client side of a device task's request channel.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    device: DeviceId,
    requests: mpsc::Sender<DeviceRequest>,
}

impl DeviceHandle {
    /// Wrap a request channel.
    pub fn new(device: DeviceId, requests: mpsc::Sender<DeviceRequest>) -> Self {
        Self { device, requests }
    }

    /// Device this handle addresses.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Move the device to another port.
    pub async fn reassign(&self, port: impl Into<String>) -> InstrumentResult<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DeviceRequest::Reassign {
                port: port.into(),
                reply,
            })
            .await
            .map_err(|_| task_stopped(&self.device))?;
        rx.await.map_err(|_| task_stopped(&self.device))?
    }
}

/// Operator interface to the power supply.
///
/// Commands queue behind the current poll and run before the next one.
#[derive(Debug, Clone)]
pub struct PowerSupplyHandle {
    inner: DeviceHandle,
}

impl PowerSupplyHandle {
    /// Wrap the power supply's device handle.
    pub fn new(inner: DeviceHandle) -> Self {
        Self { inner }
    }

    async fn call(&self, command: SupplyCommand) -> InstrumentResult<SupplyReply> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .requests
            .send(DeviceRequest::Supply { command, reply })
            .await
            .map_err(|_| task_stopped(&self.inner.device))?;
        rx.await.map_err(|_| task_stopped(&self.inner.device))?
    }

    async fn call_done(&self, command: SupplyCommand) -> InstrumentResult<()> {
        self.call(command).await.map(|_| ())
    }

    /// Select preset `n`.
    pub async fn set_preset(&self, n: u8) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SelectPreset(n)).await
    }

    /// Set a preset's voltage.
    pub async fn set_voltage(&self, preset: u8, volts: f64) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SetVoltage { preset, volts }).await
    }

    /// Set a preset's current.
    pub async fn set_current(&self, preset: u8, amps: f64) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SetCurrent { preset, amps }).await
    }

    /// Set the OVP limit.
    pub async fn set_ovp(&self, volts: f64) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SetOvp(volts)).await
    }

    /// Set the OCP limit.
    pub async fn set_ocp(&self, amps: f64) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SetOcp(amps)).await
    }

    /// Switch the output.
    pub async fn set_output(&self, on: bool) -> InstrumentResult<()> {
        self.call_done(SupplyCommand::SetOutput(on)).await
    }

    /// (volts, amps) settings of a preset.
    pub async fn get_settings(&self, preset: u8) -> InstrumentResult<(f64, f64)> {
        match self.call(SupplyCommand::GetSettings(preset)).await? {
            SupplyReply::Settings { volts, amps } => Ok((volts, amps)),
            other => Err(unexpected_reply(other)),
        }
    }

    /// OVP limit in volts.
    pub async fn get_ovp(&self) -> InstrumentResult<f64> {
        match self.call(SupplyCommand::GetOvp).await? {
            SupplyReply::Limit(volts) => Ok(volts),
            other => Err(unexpected_reply(other)),
        }
    }

    /// OCP limit in amps.
    pub async fn get_ocp(&self) -> InstrumentResult<f64> {
        match self.call(SupplyCommand::GetOcp).await? {
            SupplyReply::Limit(amps) => Ok(amps),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Output reading taken now.
    pub async fn get_live_reading(&self) -> InstrumentResult<LiveReading> {
        match self.call(SupplyCommand::LiveReading).await? {
            SupplyReply::Live(reading) => Ok(reading),
            other => Err(unexpected_reply(other)),
        }
    }
}

fn unexpected_reply(reply: SupplyReply) -> InstrumentError {
    InstrumentError::MalformedFrame(format!("unexpected reply {:?}", reply))
}

// =============================================================================
// Device task
// =============================================================================

/// Polling loop of one device.
#[derive(Debug)]
pub struct DeviceTask {
    device: DeviceId,
    driver: InstrumentDriver,
    polling: PollingState,
    cache: Arc<StateCache>,
    board: HealthBoard,
    health: DeviceHealth,
}

impl DeviceTask {
    /// Build a task. A `closed` device is never polled until reassigned.
    pub fn new(
        device: DeviceId,
        driver: InstrumentDriver,
        bounds: BackoffBounds,
        cache: Arc<StateCache>,
        board: HealthBoard,
        closed: bool,
    ) -> Self {
        let polling = PollingState::new(bounds, Instant::now());
        let health = DeviceHealth {
            protocol: driver.protocol(),
            port: driver.transport().settings().port.clone(),
            connection_state: if closed {
                ConnectionState::Closed
            } else {
                ConnectionState::Open
            },
            current_interval_ms: polling.current_interval().as_millis() as u64,
            consecutive_errors: 0,
            last_error: None,
            last_error_class: None,
            last_error_at: None,
            last_success_at: None,
        };
        let task = Self {
            device,
            driver,
            polling,
            cache,
            board,
            health,
        };
        task.publish();
        task
    }

    /// Current health.
    pub fn health(&self) -> &DeviceHealth {
        &self.health
    }

    /// Adaptive polling state.
    pub fn polling(&self) -> &PollingState {
        &self.polling
    }

    fn is_closed(&self) -> bool {
        self.health.connection_state == ConnectionState::Closed
    }

    fn publish(&self) {
        self.board.insert(self.device.clone(), self.health.clone());
    }

    /// Run until shutdown, then close the transport.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        mut requests: mpsc::Receiver<DeviceRequest>,
    ) {
        info!(device = %self.device, closed = self.is_closed(), "polling task started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let period = if self.is_closed() {
                None
            } else {
                self.poll_once().await;
                Some(self.polling.current_interval())
            };
            if !self.idle(period, &mut shutdown, &mut requests).await {
                break;
            }
        }
        self.driver.close().await;
        info!(device = %self.device, "polling task stopped");
    }

    /// Wait out `period` (forever when `None`) while serving requests.
    ///
    /// Returns `false` on shutdown.
    async fn idle(
        &mut self,
        period: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
        requests: &mut mpsc::Receiver<DeviceRequest>,
    ) -> bool {
        let timer = async move {
            match period {
                Some(period) => tokio::time::sleep(period).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return true,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
                Some(request) = requests.recv() => {
                    if self.serve(request).await {
                        return true;
                    }
                }
            }
        }
    }

    /// Poll once and record the outcome.
    pub async fn poll_once(&mut self) {
        let result = self.driver.poll().await;
        let now = Instant::now();
        match result {
            Ok(samples) => {
                for sample in samples {
                    self.cache.record(&self.device, sample);
                }
                let interval = self.polling.record_success(now);
                if self.health.consecutive_errors > 0 {
                    info!(device = %self.device, after = self.health.consecutive_errors, "device recovered");
                }
                self.health.connection_state = ConnectionState::Open;
                self.health.current_interval_ms = interval.as_millis() as u64;
                self.health.consecutive_errors = 0;
                self.health.last_success_at = Some(Utc::now());
            }
            Err(error) => {
                let class = error.class();
                let outcome = self.polling.record_failure(now, class);
                if outcome.declared {
                    self.cache.declare_failure(&self.device, class);
                }
                warn!(
                    device = %self.device,
                    error = %error,
                    class = %class,
                    interval_ms = outcome.next_interval.as_millis() as u64,
                    declared = outcome.declared,
                    "poll failed"
                );
                self.health.connection_state = ConnectionState::Degraded;
                self.health.current_interval_ms = outcome.next_interval.as_millis() as u64;
                self.health.consecutive_errors = self.polling.consecutive_error_count();
                self.health.last_error = Some(error.to_string());
                self.health.last_error_class = Some(class);
                self.health.last_error_at = Some(Utc::now());
            }
        }
        self.publish();
    }

    /// Serve one request. Returns `true` when the device should be polled
    /// right away.
    async fn serve(&mut self, request: DeviceRequest) -> bool {
        match request {
            DeviceRequest::Reassign { port, reply } => {
                let result = self.reassign(port).await;
                let poll_now = result.is_ok();
                let _ = reply.send(result);
                poll_now
            }
            DeviceRequest::Supply { command, reply } => {
                let result = self.supply(command).await;
                if let Err(e) = &result {
                    debug!(device = %self.device, command = ?command, error = %e, "supply command failed");
                }
                let _ = reply.send(result);
                false
            }
        }
    }

    async fn reassign(&mut self, port: String) -> InstrumentResult<()> {
        let result = self.driver.transport_mut().reassign(port.clone()).await;
        self.health.port = port;
        match result {
            Ok(()) => {
                if let Err(e) = self.driver.initialize().await {
                    warn!(device = %self.device, error = %e, "initialization after reassignment failed");
                }
                self.polling.record_success(Instant::now());
                self.health.connection_state = ConnectionState::Open;
                self.health.current_interval_ms = self.polling.current_interval().as_millis() as u64;
                self.health.consecutive_errors = 0;
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.health.connection_state = ConnectionState::Closed;
                self.health.last_error = Some(e.to_string());
                self.health.last_error_class = Some(e.class());
                self.health.last_error_at = Some(Utc::now());
                self.cache.declare_failure(&self.device, ErrorClass::LinkClosed);
                self.publish();
                Err(e)
            }
        }
    }

    async fn supply(&mut self, command: SupplyCommand) -> InstrumentResult<SupplyReply> {
        if self.is_closed() {
            return Err(InstrumentError::LinkClosed(self.device.to_string()));
        }
        let InstrumentDriver::PowerSupply(psu) = &mut self.driver else {
            return Err(InstrumentError::InvalidParameter(format!(
                "{} is not a power supply",
                self.device
            )));
        };
        let reply = match command {
            SupplyCommand::SelectPreset(n) => psu.set_preset(n).await.map(|_| SupplyReply::Done)?,
            SupplyCommand::SetVoltage { preset, volts } => {
                psu.set_voltage(preset, volts).await.map(|_| SupplyReply::Done)?
            }
            SupplyCommand::SetCurrent { preset, amps } => {
                psu.set_current(preset, amps).await.map(|_| SupplyReply::Done)?
            }
            SupplyCommand::SetOvp(volts) => psu.set_ovp(volts).await.map(|_| SupplyReply::Done)?,
            SupplyCommand::SetOcp(amps) => psu.set_ocp(amps).await.map(|_| SupplyReply::Done)?,
            SupplyCommand::SetOutput(on) => psu.set_output(on).await.map(|_| SupplyReply::Done)?,
            SupplyCommand::GetSettings(preset) => {
                let (volts, amps) = psu.get_settings(preset).await?;
                SupplyReply::Settings { volts, amps }
            }
            SupplyCommand::GetOvp => SupplyReply::Limit(psu.get_ovp().await?),
            SupplyCommand::GetOcp => SupplyReply::Limit(psu.get_ocp().await?),
            SupplyCommand::LiveReading => SupplyReply::Live(psu.get_live_reading().await?),
        };
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labctl_core::mock_serial::{self, MockDeviceHarness};
    use labctl_core::reading::{ChannelId, Quality};
    use labctl_core::serial::SerialSettings;
    use labctl_core::transport::Transport;
    use labctl_driver_bk::{PowerSupply, SupplySettings};
    use labctl_driver_omega::modbus_rtu::{encode_f32, encode_read_response, WordOrder, READ_HOLDING_REGISTERS};
    use labctl_driver_omega::{MonitorSettings, TemperatureMonitor, UnitChannel};

    fn serial() -> SerialSettings {
        SerialSettings::new("/dev/ttyUSB0", 9600)
            .with_timeout(Duration::from_millis(100))
            .with_drain_window(Duration::from_millis(1))
    }

    fn one_unit_monitor() -> (InstrumentDriver, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let transport = Transport::with_port("pmon", serial(), Box::new(port));
        let settings = MonitorSettings {
            units: vec![UnitChannel {
                unit: 1,
                label: "Chamber Top".into(),
            }],
            ..MonitorSettings::default()
        };
        (
            InstrumentDriver::TemperatureMonitor(TemperatureMonitor::new(transport, settings)),
            harness,
        )
    }

    fn build_task(
        driver: InstrumentDriver,
        closed: bool,
    ) -> (DeviceTask, Arc<StateCache>, HealthBoard) {
        let cache = Arc::new(StateCache::default());
        let board: HealthBoard = Arc::new(DashMap::new());
        let device = DeviceId::new("pmon");
        for (channel, label) in driver.channels() {
            cache.register(&device, channel, label);
        }
        let task = DeviceTask::new(
            device,
            driver,
            BackoffBounds::default(),
            Arc::clone(&cache),
            Arc::clone(&board),
            closed,
        );
        (task, cache, board)
    }

    async fn answer_unit(harness: &mut MockDeviceHarness, status: u16, celsius: f32) {
        harness
            .expect_and_respond(
                &labctl_driver_omega::modbus_rtu::Request::read_holding(1, 0x0240, 1).encode(),
                &encode_read_response(1, READ_HOLDING_REGISTERS, &[status]),
            )
            .await;
        if status == 6 {
            harness
                .expect_and_respond(
                    &labctl_driver_omega::modbus_rtu::Request::read_holding(1, 0x0210, 2).encode(),
                    &encode_read_response(
                        1,
                        READ_HOLDING_REGISTERS,
                        &encode_f32(celsius, WordOrder::LowFirst),
                    ),
                )
                .await;
        }
    }

    #[tokio::test]
    async fn successful_poll_updates_cache_and_health() {
        let (driver, mut harness) = one_unit_monitor();
        let (mut task, cache, board) = build_task(driver, false);

        let device = DeviceId::new("pmon");
        let poll = tokio::spawn(async move {
            task.poll_once().await;
            task
        });
        answer_unit(&mut harness, 6, 23.5).await;
        let task = poll.await.unwrap();

        let reading = cache.latest(&device, ChannelId::Unit(1)).unwrap();
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.value, Some(23.5));
        let health = board.get(&device).unwrap().clone();
        assert_eq!(health.connection_state, ConnectionState::Open);
        assert_eq!(health.current_interval_ms, 500);
        assert_eq!(task.health().consecutive_errors, 0);
    }

    #[tokio::test]
    async fn failed_poll_backs_off_and_leaves_cache_alone() {
        let (driver, mut harness) = one_unit_monitor();
        let (mut task, cache, board) = build_task(driver, false);
        let device = DeviceId::new("pmon");

        let first = tokio::spawn(async move {
            task.poll_once().await;
            task
        });
        answer_unit(&mut harness, 6, 23.5).await;
        let mut task = first.await.unwrap();

        // silent device: the status read times out
        task.poll_once().await;
        harness.drain_writes().await;

        let health = board.get(&device).unwrap().clone();
        assert_eq!(health.connection_state, ConnectionState::Degraded);
        assert_eq!(health.current_interval_ms, 1000);
        assert_eq!(health.last_error_class, Some(ErrorClass::Timeout));
        assert_eq!(
            cache.latest(&device, ChannelId::Unit(1)).unwrap().value,
            Some(23.5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_bridges_one_timeout_and_reports_a_persistent_one() {
        let (driver, mut harness) = one_unit_monitor();
        let (task, cache, board) = build_task(driver, false);
        let device = DeviceId::new("pmon");
        let status = labctl_driver_omega::modbus_rtu::Request::read_holding(1, 0x0240, 1).encode();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_requests_tx, requests_rx) = mpsc::channel(4);
        let run = tokio::spawn(task.run(shutdown_rx, requests_rx));

        answer_unit(&mut harness, 6, 23.5).await;

        // one silent poll after a full floor period
        harness.expect_write(&status).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reading = cache.latest(&device, ChannelId::Unit(1)).unwrap();
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.value, Some(23.5));
        let health = board.get(&device).unwrap().clone();
        assert_eq!(health.connection_state, ConnectionState::Degraded);
        assert_eq!(health.current_interval_ms, 1000);

        answer_unit(&mut harness, 6, 24.0).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            cache.latest(&device, ChannelId::Unit(1)).unwrap().value,
            Some(24.0)
        );
        assert_eq!(board.get(&device).unwrap().current_interval_ms, 500);

        // silent across two polls, the second one adapted period later
        harness.expect_write(&status).await;
        harness.expect_write(&status).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reading = cache.latest(&device, ChannelId::Unit(1)).unwrap();
        assert_eq!(reading.quality, Quality::Disconnected);
        assert_eq!(reading.value, None);
        assert_eq!(board.get(&device).unwrap().consecutive_errors, 2);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let (driver, _harness) = one_unit_monitor();
        let (task, _cache, board) = build_task(driver, true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_requests_tx, requests_rx) = mpsc::channel(4);

        let handle = tokio::spawn(task.run(shutdown_rx, requests_rx));
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            board.get(&DeviceId::new("pmon")).unwrap().connection_state,
            ConnectionState::Closed
        );
    }

    #[tokio::test]
    async fn supply_commands_rejected_for_other_devices() {
        let (driver, _harness) = one_unit_monitor();
        let (task, _cache, _board) = build_task(driver, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(4);
        let handle = PowerSupplyHandle::new(DeviceHandle::new(DeviceId::new("pmon"), requests_tx));

        let run = tokio::spawn(task.run(shutdown_rx, requests_rx));
        let err = handle.set_output(false).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Command);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    fn power_supply() -> (InstrumentDriver, MockDeviceHarness) {
        let (port, harness) = mock_serial::new();
        let transport = Transport::with_port("psu", serial(), Box::new(port));
        (
            InstrumentDriver::PowerSupply(PowerSupply::new(transport, SupplySettings::default())),
            harness,
        )
    }

    #[tokio::test]
    async fn supply_command_runs_between_polls() {
        let (driver, mut harness) = power_supply();
        let (task, _cache, _board) = build_task(driver, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(4);
        let handle = PowerSupplyHandle::new(DeviceHandle::new(DeviceId::new("psu"), requests_tx));

        let run = tokio::spawn(task.run(shutdown_rx, requests_rx));
        harness.expect_and_respond(b"GOUT\r", b"0\rOK\r").await;
        harness.expect_and_respond(b"GETD\r", b"000000000\rOK\r").await;

        let command = tokio::spawn(async move { handle.get_ovp().await });
        harness.expect_and_respond(b"GOVP\r", b"4220\rOK\r").await;
        assert_eq!(command.await.unwrap().unwrap(), 42.2);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn closed_device_refuses_supply_commands() {
        let (driver, mut harness) = power_supply();
        let (task, _cache, _board) = build_task(driver, true);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::channel(4);
        let handle = PowerSupplyHandle::new(DeviceHandle::new(DeviceId::new("psu"), requests_tx));

        tokio::spawn(task.run(shutdown_rx, requests_rx));
        let err = handle.get_ovp().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::LinkClosed);
        harness.drain_writes().await;
    }
}
