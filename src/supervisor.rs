//! Auto-polling supervisor
//!
//! Brings polling up for the whole fleet at startup without blowing the
//! caller's time budget. The strategy depends on how much of the budget
//! survives the device query:
//!
//! - a second or more per device: two sequential batches, each bounded by
//!   half the remaining budget, stragglers deferred to background;
//! - less than a second per device but a workable total: up to five
//!   devices brought up in parallel, the rest deferred;
//! - less than a second in total: two devices scheduled, the rest deferred;
//! - any failure on those paths: every enabled device goes through the
//!   background pipeline.
//!
//! Background bring-up runs as spawned micro-tasks that poll once, retry
//! every five minutes until the device answers, then install its timer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::model::{Device, DeviceId, Reading};
use crate::poller::Poller;
use crate::repository::DeviceRepository;

/// Reserved for post-startup work inside the batch budgets.
const STARTUP_RESERVE: Duration = Duration::from_secs(3);

/// Devices brought up concurrently by the parallel strategy.
const PARALLEL_LIMIT: usize = 5;

/// Devices scheduled under the emergency strategy.
const EMERGENCY_LIMIT: usize = 2;

/// Delay between background bring-up attempts.
const BACKGROUND_RETRY: Duration = Duration::from_secs(300);

/// Fleet bring-up strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStrategy {
    /// Two sequential batches within the time budget
    BatchSequential,
    /// A handful in parallel, the rest in background
    ParallelBackground,
    /// Almost no budget: schedule two, defer everything else
    Emergency,
    /// A startup path failed; everything goes through background
    GracefulDegradation,
}

/// Outcome of a `start` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    /// Strategy the supervisor picked
    pub strategy: StartupStrategy,
    /// Enabled devices found
    pub total_devices: usize,
    /// Devices whose timers were installed during `start`
    pub started_immediately: usize,
    /// Devices handed to the background pipeline
    pub deferred: usize,
}

/// Supervisor statistics for the admin surface.
#[derive(Debug, Clone)]
pub struct SupervisorStats {
    /// True between `start` and `stop`
    pub running: bool,
    /// Strategy of the last `start`
    pub strategy: Option<StartupStrategy>,
    /// Milliseconds since `start`
    pub uptime_ms: u64,
    /// Poll cycles with at least one successful read
    pub successful_polls: u64,
    /// Poll cycles where everything failed
    pub failed_polls: u64,
    /// Devices with installed timers
    pub scheduled_devices: usize,
    /// Devices still in background bring-up
    pub pending_background: usize,
    /// Last poll completion per device
    pub last_poll_times: Vec<(DeviceId, DateTime<Utc>)>,
}

/// Fleet-wide polling supervisor.
pub struct AutoPollSupervisor {
    poller: Arc<Poller>,
    devices: Arc<dyn DeviceRepository>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    strategy: Mutex<Option<StartupStrategy>>,
    last_report: Mutex<Option<StartReport>>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
    pending_background: Arc<AtomicUsize>,
    default_interval_ms: AtomicUsize,
}

impl AutoPollSupervisor {
    /// Create a supervisor over a poller and a device repository.
    pub fn new(poller: Arc<Poller>, devices: Arc<dyn DeviceRepository>) -> Arc<Self> {
        Arc::new(Self {
            poller,
            devices,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            strategy: Mutex::new(None),
            last_report: Mutex::new(None),
            background_tasks: Mutex::new(Vec::new()),
            pending_background: Arc::new(AtomicUsize::new(0)),
            default_interval_ms: AtomicUsize::new(60_000),
        })
    }

    /// Pick the bring-up strategy from the post-query budget.
    ///
    /// `available` is the wall-clock budget left after the device query.
    pub fn choose_strategy(available: Duration, device_count: usize) -> StartupStrategy {
        if device_count == 0 {
            return StartupStrategy::BatchSequential;
        }
        if available < Duration::from_secs(1) {
            return StartupStrategy::Emergency;
        }
        let per_device = available / device_count as u32;
        if per_device >= Duration::from_secs(1) {
            StartupStrategy::BatchSequential
        } else {
            StartupStrategy::ParallelBackground
        }
    }

    /// Bring polling up for every enabled device. Idempotent: a second
    /// call while running returns the previous report.
    pub async fn start(
        self: &Arc<Self>,
        interval_seconds: u64,
        timeout_ms: u64,
    ) -> GatewayResult<StartReport> {
        if interval_seconds < 10 {
            return Err(GatewayError::config(format!(
                "Polling interval {interval_seconds}s below the 10s minimum"
            )));
        }
        if timeout_ms < 1000 {
            return Err(GatewayError::config(format!(
                "Startup budget {timeout_ms}ms below the 1000ms minimum"
            )));
        }

        if self.running.swap(true, Ordering::SeqCst) {
            if let Some(report) = self.last_report.lock().expect("report lock").clone() {
                return Ok(report);
            }
        }

        self.default_interval_ms
            .store((interval_seconds * 1000) as usize, Ordering::SeqCst);
        *self.started_at.lock().expect("start lock") = Some(Instant::now());

        let query_started = Instant::now();
        let devices = match self.devices.find_enabled().await {
            Ok(devices) => devices,
            Err(e) => {
                // No device list, no plan: hand the whole fleet to the
                // background pipeline once the store answers again.
                warn!("Device query failed, degrading to background bring-up: {e}");
                let report = StartReport {
                    strategy: StartupStrategy::GracefulDegradation,
                    total_devices: 0,
                    started_immediately: 0,
                    deferred: 0,
                };
                self.remember(StartupStrategy::GracefulDegradation, report.clone());
                self.spawn_degraded_recovery();
                return Ok(report);
            }
        };
        let query_time = query_started.elapsed();

        let available = Duration::from_millis(timeout_ms).saturating_sub(query_time);
        let strategy = Self::choose_strategy(available, devices.len());
        info!(
            "Auto-polling start: {} devices, {:?} budget -> {:?}",
            devices.len(),
            available,
            strategy
        );

        let report = match strategy {
            StartupStrategy::BatchSequential => {
                match self.start_batch_sequential(&devices, available).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!("Batch bring-up failed, degrading: {e}");
                        self.start_degraded(&devices)
                    }
                }
            }
            StartupStrategy::ParallelBackground => self.start_parallel(&devices).await,
            StartupStrategy::Emergency => self.start_emergency(&devices),
            StartupStrategy::GracefulDegradation => self.start_degraded(&devices),
        };

        self.remember(report.strategy, report.clone());
        Ok(report)
    }

    fn remember(&self, strategy: StartupStrategy, report: StartReport) {
        *self.strategy.lock().expect("strategy lock") = Some(strategy);
        *self.last_report.lock().expect("report lock") = Some(report);
    }

    fn effective_interval(&self, device: &Device) -> u64 {
        device
            .polling_interval_ms
            .unwrap_or(self.default_interval_ms.load(Ordering::SeqCst) as u64)
    }

    /// Poll once and install the timer; the budget check happens between
    /// devices, not inside a cycle.
    async fn bring_up_now(&self, device: &Device) -> bool {
        let interval = self.effective_interval(device);
        match self.poller.poll_device(&device.id).await {
            Ok(_) => {
                self.poller.schedule_device(&device.id, &device.name, interval);
                true
            }
            Err(e) => {
                debug!("Initial poll of {} failed: {e}", device.id);
                false
            }
        }
    }

    async fn start_batch_sequential(
        self: &Arc<Self>,
        devices: &[Device],
        available: Duration,
    ) -> GatewayResult<StartReport> {
        let budget = available.saturating_sub(STARTUP_RESERVE);
        let per_batch = budget / 2;
        let half = devices.len().div_ceil(2);
        let mut started = 0usize;
        let mut deferred = Vec::new();

        for batch in [&devices[..half.min(devices.len())], &devices[half.min(devices.len())..]] {
            let batch_started = Instant::now();
            for device in batch {
                if batch_started.elapsed() >= per_batch {
                    deferred.push(device.clone());
                    continue;
                }
                if self.bring_up_now(device).await {
                    started += 1;
                } else {
                    deferred.push(device.clone());
                }
            }
        }

        let deferred_count = deferred.len();
        for device in deferred {
            self.spawn_background_bring_up(device);
        }

        Ok(StartReport {
            strategy: StartupStrategy::BatchSequential,
            total_devices: devices.len(),
            started_immediately: started,
            deferred: deferred_count,
        })
    }

    async fn start_parallel(self: &Arc<Self>, devices: &[Device]) -> StartReport {
        let immediate = &devices[..PARALLEL_LIMIT.min(devices.len())];
        let rest = &devices[PARALLEL_LIMIT.min(devices.len())..];

        let polls = immediate.iter().map(|device| {
            let supervisor = Arc::clone(self);
            let device = device.clone();
            async move {
                let ok = supervisor.bring_up_now(&device).await;
                (device, ok)
            }
        });

        let mut started = 0usize;
        let mut deferred = Vec::new();
        for (device, ok) in join_all(polls).await {
            if ok {
                started += 1;
            } else {
                deferred.push(device);
            }
        }
        deferred.extend(rest.iter().cloned());

        let deferred_count = deferred.len();
        for device in deferred {
            self.spawn_background_bring_up(device);
        }

        StartReport {
            strategy: StartupStrategy::ParallelBackground,
            total_devices: devices.len(),
            started_immediately: started,
            deferred: deferred_count,
        }
    }

    fn start_emergency(self: &Arc<Self>, devices: &[Device]) -> StartReport {
        let mut started = 0usize;
        for device in devices.iter().take(EMERGENCY_LIMIT) {
            // No budget for verification polls; install timers blind.
            let interval = self.effective_interval(device);
            self.poller.schedule_device(&device.id, &device.name, interval);
            started += 1;
        }

        let deferred = devices.len().saturating_sub(started);
        for device in devices.iter().skip(EMERGENCY_LIMIT) {
            self.spawn_background_bring_up(device.clone());
        }

        StartReport {
            strategy: StartupStrategy::Emergency,
            total_devices: devices.len(),
            started_immediately: started,
            deferred,
        }
    }

    fn start_degraded(self: &Arc<Self>, devices: &[Device]) -> StartReport {
        for device in devices {
            self.spawn_background_bring_up(device.clone());
        }
        StartReport {
            strategy: StartupStrategy::GracefulDegradation,
            total_devices: devices.len(),
            started_immediately: 0,
            deferred: devices.len(),
        }
    }

    /// Micro-task bring-up: poll once, retry every five minutes on
    /// failure, install the timer on first success. Definitive
    /// configuration errors abandon the device.
    fn spawn_background_bring_up(self: &Arc<Self>, device: Device) {
        let supervisor = Arc::clone(self);
        self.pending_background.fetch_add(1, Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            loop {
                match supervisor.poller.poll_device(&device.id).await {
                    Ok(_) => {
                        let interval = supervisor.effective_interval(&device);
                        supervisor
                            .poller
                            .schedule_device(&device.id, &device.name, interval);
                        break;
                    }
                    Err(e @ GatewayError::Config { .. }) => {
                        debug!("Abandoning background bring-up of {}: {e}", device.id);
                        break;
                    }
                    Err(e) => {
                        debug!(
                            "Background bring-up of {} failed, retrying in {:?}: {e}",
                            device.id, BACKGROUND_RETRY
                        );
                        tokio::time::sleep(BACKGROUND_RETRY).await;
                    }
                }
            }
            supervisor.pending_background.fetch_sub(1, Ordering::SeqCst);
        });
        self.background_tasks.lock().expect("tasks lock").push(handle);
    }

    /// Degraded-start recovery: wait out the store, then push the whole
    /// fleet through the background pipeline.
    fn spawn_degraded_recovery(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match supervisor.devices.find_enabled().await {
                    Ok(devices) => {
                        info!("Device store back, degraded bring-up of {} devices", devices.len());
                        for device in devices {
                            supervisor.spawn_background_bring_up(device);
                        }
                        break;
                    }
                    Err(e) => {
                        debug!("Device store still unavailable: {e}");
                        tokio::time::sleep(BACKGROUND_RETRY).await;
                    }
                }
            }
        });
        self.background_tasks.lock().expect("tasks lock").push(handle);
    }

    /// Stop everything: cancel timers, abort background bring-up. Cycles
    /// already in flight run to completion or their timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.poller.cancel_all();
        let mut tasks = self.background_tasks.lock().expect("tasks lock");
        for task in tasks.drain(..) {
            task.abort();
        }
        self.pending_background.store(0, Ordering::SeqCst);
        info!("Auto-polling stopped");
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True while a poll timer is installed for the device.
    pub fn is_device_being_polled(&self, device_id: &str) -> bool {
        self.poller.is_scheduled(device_id)
    }

    /// One immediate poll of one device, e.g. for a UI refresh.
    pub async fn poll_one(&self, device_id: &str) -> GatewayResult<Reading> {
        self.poller.poll_device(device_id).await
    }

    /// Poll one device right now and make sure its timer is installed,
    /// e.g. for a device created after startup.
    pub async fn schedule_immediate(self: &Arc<Self>, device_id: &str) -> GatewayResult<Reading> {
        let reading = self.poller.poll_device(device_id).await?;
        if !self.poller.is_scheduled(device_id) {
            if let Some(device) = self.devices.find_by_id(device_id).await? {
                let interval = self.effective_interval(&device);
                self.poller.schedule_device(&device.id, &device.name, interval);
            }
        }
        Ok(reading)
    }

    /// Poll every scheduled device right now, without touching timers.
    pub async fn force_refresh(&self) -> usize {
        let ids: Vec<DeviceId> = self.poller.scheduled_ids();
        let mut refreshed = 0usize;
        for id in &ids {
            if self.poller.poll_device(id).await.is_ok() {
                refreshed += 1;
            }
        }
        refreshed
    }

    /// Statistics snapshot for the admin surface.
    pub fn stats(&self) -> SupervisorStats {
        let uptime_ms = self
            .started_at
            .lock()
            .expect("start lock")
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        SupervisorStats {
            running: self.is_running(),
            strategy: *self.strategy.lock().expect("strategy lock"),
            uptime_ms,
            successful_polls: self.poller.successful_polls(),
            failed_polls: self.poller.failed_polls(),
            scheduled_devices: self.poller.scheduled_count(),
            pending_background: self.pending_background.load(Ordering::SeqCst),
            last_poll_times: self.poller.last_poll_times(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryDeviceRepository, MemoryHistorySink, MemoryPushChannel};
    use crate::state::CoreState;
    use crate::testutil::{holding_point, spawn_mock_device, test_device, test_parameter};
    use crate::value::DataType;

    fn build(
        repo: Arc<MemoryDeviceRepository>,
    ) -> (Arc<AutoPollSupervisor>, Arc<CoreState>) {
        let state = CoreState::init();
        let poller = Poller::new(
            Arc::clone(&state),
            Arc::clone(&repo) as Arc<dyn DeviceRepository>,
            Arc::new(MemoryHistorySink::new()),
            Arc::new(MemoryPushChannel::new()),
        );
        let supervisor = AutoPollSupervisor::new(poller, repo);
        (supervisor, state)
    }

    #[test]
    fn test_choose_strategy_thresholds() {
        use StartupStrategy::*;

        // A second or more per device.
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::from_secs(10), 5),
            BatchSequential
        );
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::from_secs(5), 5),
            BatchSequential
        );

        // Workable total, thin per-device slice.
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::from_secs(5), 6),
            ParallelBackground
        );

        // Fifty devices against a three-second budget: ~60ms each.
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::from_millis(3000), 50),
            ParallelBackground
        );

        // Under a second in total.
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::from_millis(900), 2),
            Emergency
        );

        // Empty fleet is trivially sequential.
        assert_eq!(
            AutoPollSupervisor::choose_strategy(Duration::ZERO, 0),
            BatchSequential
        );
    }

    #[tokio::test]
    async fn test_start_validates_arguments() {
        let repo = Arc::new(MemoryDeviceRepository::new());
        let (supervisor, _) = build(repo);

        assert!(supervisor.start(9, 5000).await.is_err());
        assert!(supervisor.start(10, 999).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_sequential_small_fleet() {
        let mock = spawn_mock_device().await;
        mock.set_register(0, 42);

        let repo = Arc::new(MemoryDeviceRepository::new());
        for i in 0..3 {
            repo.upsert(test_device(
                &format!("d{i}"),
                &mock.addr,
                vec![holding_point(0, 1, vec![test_parameter("x", DataType::Uint16, 0)])],
            ))
            .unwrap();
        }

        let (supervisor, state) = build(Arc::clone(&repo));
        let report = supervisor.start(10, 30_000).await.unwrap();

        assert_eq!(report.strategy, StartupStrategy::BatchSequential);
        assert_eq!(report.total_devices, 3);
        assert_eq!(report.started_immediately, 3);
        assert_eq!(report.deferred, 0);

        // Every device was verified with an initial poll.
        for i in 0..3 {
            assert!(state.cache.get(&format!("d{i}")).is_some());
            assert!(supervisor.is_device_being_polled(&format!("d{i}")));
        }

        let stats = supervisor.stats();
        assert!(stats.running);
        assert_eq!(stats.strategy, Some(StartupStrategy::BatchSequential));
        assert_eq!(stats.successful_polls, 3);
        assert_eq!(stats.scheduled_devices, 3);

        supervisor.stop();
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.stats().scheduled_devices, 0);
    }

    #[tokio::test]
    async fn test_parallel_background_limits_immediate_set() {
        let mock = spawn_mock_device().await;
        let repo = Arc::new(MemoryDeviceRepository::new());
        for i in 0..12 {
            repo.upsert(test_device(
                &format!("d{i}"),
                &mock.addr,
                vec![holding_point(0, 1, vec![test_parameter("x", DataType::Uint16, 0)])],
            ))
            .unwrap();
        }

        let (supervisor, _) = build(repo);
        // 12 devices against a ~6s budget: under a second each.
        let report = supervisor.start(10, 6000).await.unwrap();

        assert_eq!(report.strategy, StartupStrategy::ParallelBackground);
        assert_eq!(report.started_immediately, PARALLEL_LIMIT);
        assert_eq!(report.deferred, 12 - PARALLEL_LIMIT);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mock = spawn_mock_device().await;
        let repo = Arc::new(MemoryDeviceRepository::new());
        repo.upsert(test_device(
            "d0",
            &mock.addr,
            vec![holding_point(0, 1, vec![test_parameter("x", DataType::Uint16, 0)])],
        ))
        .unwrap();

        let (supervisor, _) = build(repo);
        let first = supervisor.start(10, 30_000).await.unwrap();
        let second = supervisor.start(10, 30_000).await.unwrap();
        assert_eq!(first, second);

        supervisor.stop();
    }

    #[tokio::test]
    async fn test_poll_one_and_schedule_immediate() {
        let mock = spawn_mock_device().await;
        mock.set_register(5, 99);
        let repo = Arc::new(MemoryDeviceRepository::new());
        repo.upsert(test_device(
            "d0",
            &mock.addr,
            vec![holding_point(5, 1, vec![test_parameter("x", DataType::Uint16, 5)])],
        ))
        .unwrap();

        let (supervisor, _) = build(repo);
        let reading = supervisor.poll_one("d0").await.unwrap();
        assert_eq!(
            reading.entries[0].value,
            Some(crate::value::PointValue::Number(99.0))
        );
        // poll_one never installs a timer.
        assert!(!supervisor.is_device_being_polled("d0"));

        // schedule_immediate polls and installs one.
        supervisor.schedule_immediate("d0").await.unwrap();
        assert!(supervisor.is_device_being_polled("d0"));
        supervisor.stop();

        assert!(supervisor.poll_one("missing").await.is_err());
    }
}
