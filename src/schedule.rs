//! Time-driven schedule engine
//!
//! A 60-second tick walks every active device schedule whose calendar
//! window covers today, merges its template rules with the device-specific
//! custom rules, and matches each enabled rule against the current
//! wall-clock minute:
//!
//! - minute equals the rule's start: a `Start` event;
//! - minute equals the rule's end and the rule returns to default: an
//!   `End` event;
//! - minute inside the window but the rule is not marked current: a
//!   corrective `Start`, which heals devices that missed their window
//!   because the service was down at the time.
//!
//! Windows crossing midnight count both the late-evening and early-morning
//! sides as in range. Emitted events feed the setpoint manager; the engine
//! itself never touches a device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDate, Timelike, Weekday};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GatewayResult;
use crate::model::{DeviceSchedule, ScheduleRule};
use crate::repository::ScheduleRepository;

/// Tick period of the engine.
pub const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// What a schedule event asks the setpoint manager to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    /// Apply the rule's setpoint
    Start,
    /// Apply the rule's default (window is over)
    End,
}

/// One rule firing for one device schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEvent {
    /// The schedule binding the rule to its device
    pub schedule: DeviceSchedule,
    /// The rule that fired
    pub rule: ScheduleRule,
    /// Start or End
    pub action: ScheduleAction,
}

/// Match one schedule's merged rules against a point in time.
///
/// At most one event is emitted per parameter per tick; when several rules
/// cover the same parameter simultaneously the earliest in the list wins,
/// so a single rule is marked current per parameter at any time.
pub fn evaluate_schedule(
    schedule: &DeviceSchedule,
    rules: &[ScheduleRule],
    weekday: Weekday,
    minute_of_day: u16,
) -> Vec<(ScheduleRule, ScheduleAction)> {
    let mut fired: Vec<(ScheduleRule, ScheduleAction)> = Vec::new();
    let mut claimed_parameters: Vec<String> = Vec::new();

    for rule in rules {
        if !rule.enabled || !rule.applies_on(weekday) {
            continue;
        }
        let parameter = rule.parameter.to_ascii_lowercase();
        if claimed_parameters.contains(&parameter) {
            continue;
        }

        let action = if minute_of_day == rule.start_time.minutes() {
            Some(ScheduleAction::Start)
        } else if rule.return_to_default && minute_of_day == rule.end_time.minutes() {
            Some(ScheduleAction::End)
        } else if rule.contains_minute(minute_of_day)
            && schedule.current_active_rule.as_deref() != Some(rule.id.as_str())
        {
            // Mid-window and nobody holds the device: the service likely
            // restarted after the start minute passed.
            Some(ScheduleAction::Start)
        } else {
            None
        };

        if let Some(action) = action {
            claimed_parameters.push(parameter);
            fired.push((rule.clone(), action));
        }
    }

    fired
}

/// Minute-tick schedule engine.
pub struct ScheduleEngine {
    schedules: Arc<dyn ScheduleRepository>,
    events: mpsc::Sender<ScheduleEvent>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    tick_task: Option<JoinHandle<()>>,
}

impl ScheduleEngine {
    /// Create an engine and the event stream it feeds.
    pub fn new(
        schedules: Arc<dyn ScheduleRepository>,
    ) -> (Self, mpsc::Receiver<ScheduleEvent>) {
        let (events, receiver) = mpsc::channel(64);
        (
            Self {
                schedules,
                events,
                shutdown: Arc::new(Notify::new()),
                running: Arc::new(AtomicBool::new(false)),
                tick_task: None,
            },
            receiver,
        )
    }

    /// Start the minute tick. Idempotent.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Schedule engine already running");
            return;
        }
        info!("Schedule engine started ({TICK_INTERVAL:?} tick)");

        let schedules = Arc::clone(&self.schedules);
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let running = Arc::clone(&self.running);

        self.tick_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::tick(&schedules, &events).await {
                            warn!("Schedule tick failed: {e}");
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Schedule engine stopped");
        }));
    }

    /// Stop the tick; an evaluation in flight completes first.
    pub fn stop(&mut self) {
        self.shutdown.notify_one();
        // The task finishes its current evaluation and exits on its own;
        // detach rather than abort it.
        self.tick_task.take();
    }

    /// True while the tick task runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One evaluation pass over every active schedule, emitting events for
    /// each matched rule. Uses local wall-clock time.
    async fn tick(
        schedules: &Arc<dyn ScheduleRepository>,
        events: &mpsc::Sender<ScheduleEvent>,
    ) -> GatewayResult<()> {
        let now = Local::now();
        let today: NaiveDate = now.date_naive();
        let weekday = today.weekday();
        let minute_of_day = (now.hour() * 60 + now.minute()) as u16;

        for schedule in schedules.find_active_schedules().await? {
            if !schedule.covers_date(today) {
                continue;
            }

            let mut rules = match schedules.find_template(&schedule.template_id).await {
                Ok(Some(template)) => template.rules,
                Ok(None) => {
                    debug!(
                        "Schedule {} references missing template {}",
                        schedule.id, schedule.template_id
                    );
                    Vec::new()
                }
                Err(e) => {
                    warn!("Template load failed for schedule {}: {e}", schedule.id);
                    continue;
                }
            };
            rules.extend(schedule.custom_rules.iter().cloned());

            for (rule, action) in evaluate_schedule(&schedule, &rules, weekday, minute_of_day) {
                debug!(
                    "Schedule {} rule {} fires {:?} at minute {}",
                    schedule.id, rule.id, action, minute_of_day
                );
                let event = ScheduleEvent {
                    schedule: schedule.clone(),
                    rule,
                    action,
                };
                if events.send(event).await.is_err() {
                    // Receiver gone; nothing left to feed.
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Run one evaluation pass immediately, outside the timer. Used by
    /// tests and by the admin surface to verify schedule wiring.
    pub async fn tick_once(&self) -> GatewayResult<()> {
        Self::tick(&self.schedules, &self.events).await
    }
}

impl Drop for ScheduleEngine {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
