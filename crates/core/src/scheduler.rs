//! Event scheduler: expands today's schedules into a time-ordered queue and
//! drives zones through a [`ZoneActuator`].
//!
//! Each enabled schedule that runs today contributes one "expand" event per
//! start time still ahead of us. When an expand event fires it becomes a
//! back-to-back run of per-zone "turn on" events followed by one terminal
//! "turn off all":
//!
//! ```text
//! 06:00 expand ──▶ 06:00 zone 0 on (10m) ─▶ 06:10 zone 2 on (5m) ─▶ 06:15 all off
//! ```
//!
//! Only one schedule runs at a time; an expand that fires while another is
//! active is pushed back a minute. Local midnight stops everything and
//! rebuilds the queue.

use time::macros::date;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::zones::ZoneRun;

pub const MAX_SCHEDULES: usize = 4;
pub const MAX_START_TIMES: usize = 4;
pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Schedule id reported for quick (manual, one-off) schedules.
pub const QUICK_SCHEDULE_ID: u8 = 100;

/// Cap applied to an adjusted duration before the per-station maximum.
pub const MAX_ADJUSTED_MINUTES: u8 = 254;

/// What the scheduler drives. Implemented by the controller.
pub trait ZoneActuator {
    fn turn_on(&mut self, run: ZoneRun) -> bool;
    /// End of a schedule: stop everything that is running.
    fn turn_off_all(&mut self);
    /// Unconditional stop, used at day rollover.
    fn stop_all(&mut self);
    fn max_run_minutes(&self) -> u8;
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// Bit n set runs on the n-th day of the week, Sunday = bit 0.
    Weekdays(u8),
    /// Every n days, counted from 1970-01-01.
    Interval(u8),
}

impl Recurrence {
    pub fn matches(self, day: Date) -> bool {
        match self {
            Recurrence::Weekdays(mask) => mask & (1 << day.weekday().number_days_from_sunday()) != 0,
            Recurrence::Interval(0) => false,
            Recurrence::Interval(n) => {
                let days = (day - date!(1970 - 01 - 01)).whole_days();
                days.rem_euclid(n as i64) == 0
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub name: String,
    pub enabled: bool,
    pub recurrence: Recurrence,
    /// Minutes since local midnight.
    pub start_times: Vec<u16>,
    /// Minutes per zone, indexed by zone; 0 skips the zone.
    pub durations: Vec<u8>,
    pub weather_adjust: bool,
}

impl Schedule {
    fn waters_anything(&self) -> bool {
        self.durations.iter().any(|d| *d > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleRef {
    Stored(u8),
    Quick,
}

impl ScheduleRef {
    /// Id carried in zone commands and notifications. Stored schedules are
    /// numbered from 1 so that 0 can mean "manual".
    pub fn id(self) -> u8 {
        match self {
            ScheduleRef::Stored(i) => i + 1,
            ScheduleRef::Quick => QUICK_SCHEDULE_ID,
        }
    }
}

/// Scale a duration by seasonal and weather percentages.
pub fn adjust(minutes: u8, seasonal: u8, weather: u8) -> u8 {
    let scale = seasonal as u32 * weather as u32 / 100;
    ((minutes as u32 * scale + 50) / 100).min(MAX_ADJUSTED_MINUTES as u32) as u8
}

pub fn minute_of_day(now: OffsetDateTime) -> u16 {
    now.hour() as u16 * 60 + now.minute() as u16
}

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TurnOn { run: ZoneRun },
    TurnOffAll { schedule: ScheduleRef },
    Expand { schedule: ScheduleRef, slot: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Minute of the day; `None` once fired or cancelled.
    pub at: Option<u16>,
    pub command: Command,
}

/// Events ordered by time; equal times keep insertion order.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Vec<Event>,
}

impl EventQueue {
    /// Queue `command` for minute `at` of today. Minutes past the end of
    /// the day are never reached and are refused.
    pub fn insert(&mut self, at: u16, command: Command) -> bool {
        if at >= MINUTES_PER_DAY {
            debug!(at, ?command, "event past end of day not queued");
            return false;
        }
        let pos = self
            .events
            .iter()
            .position(|e| e.at.is_some_and(|t| t > at))
            .unwrap_or(self.events.len());
        self.events.insert(
            pos,
            Event {
                at: Some(at),
                command,
            },
        );
        true
    }

    /// Live events in firing order.
    pub fn pending(&self) -> impl Iterator<Item = (u16, &Command)> {
        self.events.iter().filter_map(|e| e.at.map(|t| (t, &e.command)))
    }

    pub fn is_empty(&self) -> bool {
        self.pending().next().is_none()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Retire the earliest event due at `now`, returning its command.
    fn take_due(&mut self, now: u16) -> Option<Command> {
        let event = self
            .events
            .iter_mut()
            .find(|e| e.at.is_some_and(|t| t <= now))?;
        event.at = None;
        Some(event.command)
    }

    fn retire_where(&mut self, mut pred: impl FnMut(&Command) -> bool) {
        for e in self.events.iter_mut() {
            if e.at.is_some() && pred(&e.command) {
                e.at = None;
            }
        }
    }

    fn compact(&mut self) {
        self.events.retain(|e| e.at.is_some());
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    schedules: Vec<Schedule>,
    quick: Option<Vec<u8>>,
    queue: EventQueue,
    enabled: bool,
    seasonal: u8,
    weather: u8,
    active: Option<ScheduleRef>,
    day: Option<Date>,
}

impl Scheduler {
    pub fn new(schedules: Vec<Schedule>, enabled: bool, seasonal: u8) -> Self {
        if schedules.len() > MAX_SCHEDULES {
            warn!(count = schedules.len(), max = MAX_SCHEDULES, "extra schedules ignored");
        }
        Self {
            schedules: schedules.into_iter().take(MAX_SCHEDULES).collect(),
            quick: None,
            queue: EventQueue::default(),
            enabled,
            seasonal,
            weather: 100,
            active: None,
            day: None,
        }
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn active(&self) -> Option<ScheduleRef> {
        self.active
    }

    pub fn set_seasonal(&mut self, percent: u8) {
        self.seasonal = percent;
    }

    /// External weather scale, percent. Applied to weather-adjusted
    /// schedules on their next expansion.
    pub fn set_weather_scale(&mut self, percent: u8) {
        self.weather = percent;
    }

    pub fn set_enabled(&mut self, enabled: bool, now: OffsetDateTime) {
        self.enabled = enabled;
        self.reload(now);
    }

    /// Swap in edited schedules and rebuild today's queue.
    pub fn replace_schedules(&mut self, schedules: Vec<Schedule>, now: OffsetDateTime) {
        self.schedules = schedules.into_iter().take(MAX_SCHEDULES).collect();
        self.reload(now);
    }

    /// Drop every queued event and queue today's remaining start times.
    pub fn reload(&mut self, now: OffsetDateTime) {
        let today = now.date();
        let minute = minute_of_day(now);
        self.day = Some(today);
        self.queue.clear();
        self.active = None;

        if !self.enabled {
            info!("schedules disabled, queue left empty");
            return;
        }
        for (i, schedule) in self.schedules.iter().enumerate() {
            if !schedule.enabled || !schedule.waters_anything() || !schedule.recurrence.matches(today) {
                continue;
            }
            for (slot, &at) in schedule.start_times.iter().take(MAX_START_TIMES).enumerate() {
                if at >= minute && at < MINUTES_PER_DAY {
                    self.queue.insert(
                        at,
                        Command::Expand {
                            schedule: ScheduleRef::Stored(i as u8),
                            slot: slot as u8,
                        },
                    );
                }
            }
        }
        info!(%today, events = self.queue.pending().count(), "schedule queue rebuilt");
    }

    /// Fire everything due at `now`. Call at least once a minute.
    pub fn tick(&mut self, now: OffsetDateTime, actuator: &mut dyn ZoneActuator) {
        self.roll_day(now, actuator);
        self.fire_due(minute_of_day(now), actuator);
    }

    /// Water the given per-zone durations right away, cancelling whatever
    /// schedule is running.
    pub fn run_quick(&mut self, durations: Vec<u8>, now: OffsetDateTime, actuator: &mut dyn ZoneActuator) {
        self.roll_day(now, actuator);
        if let Some(active) = self.active {
            info!(schedule = active.id(), "quick run replaces active schedule");
            self.cancel_active(actuator);
        }
        self.quick = Some(durations);
        self.queue.insert(
            minute_of_day(now),
            Command::Expand {
                schedule: ScheduleRef::Quick,
                slot: 0,
            },
        );
        self.fire_due(minute_of_day(now), actuator);
    }

    /// Cancel the active schedule and stop every zone.
    pub fn stop(&mut self, actuator: &mut dyn ZoneActuator) {
        if self.active.is_some() {
            self.queue
                .retire_where(|c| !matches!(c, Command::Expand { .. }));
            self.active = None;
        }
        self.queue.compact();
        actuator.stop_all();
    }

    fn roll_day(&mut self, now: OffsetDateTime, actuator: &mut dyn ZoneActuator) {
        if self.day == Some(now.date()) {
            return;
        }
        if self.day.is_some() {
            info!(day = %now.date(), "day rollover, stopping all zones");
            actuator.stop_all();
        }
        self.reload(now);
    }

    fn cancel_active(&mut self, actuator: &mut dyn ZoneActuator) {
        self.queue
            .retire_where(|c| !matches!(c, Command::Expand { .. }));
        self.queue.compact();
        actuator.turn_off_all();
        self.active = None;
    }

    fn fire_due(&mut self, minute: u16, actuator: &mut dyn ZoneActuator) {
        while let Some(command) = self.queue.take_due(minute) {
            match command {
                Command::TurnOn { run } => {
                    if !actuator.turn_on(run) {
                        warn!(zone = run.zone, schedule = ?run.schedule, "scheduled start failed");
                    }
                }
                Command::TurnOffAll { schedule } => {
                    actuator.turn_off_all();
                    if self.active == Some(schedule) {
                        info!(schedule = schedule.id(), "schedule finished");
                        self.active = None;
                    }
                }
                Command::Expand { schedule, slot } => {
                    if let Some(active) = self.active {
                        debug!(
                            schedule = schedule.id(),
                            active = active.id(),
                            "schedule busy, retrying in a minute"
                        );
                        let retry = minute.saturating_add(1);
                        if retry < MINUTES_PER_DAY {
                            self.queue.insert(retry, Command::Expand { schedule, slot });
                        } else {
                            warn!(schedule = schedule.id(), "schedule still busy at end of day, skipped");
                        }
                    } else {
                        self.expand(schedule, minute, actuator.max_run_minutes());
                    }
                }
            }
        }
        self.queue.compact();
    }

    fn expand(&mut self, schedule: ScheduleRef, start: u16, cap: u8) {
        let (durations, weather_adjust) = match schedule {
            ScheduleRef::Stored(i) => match self.schedules.get(i as usize) {
                Some(s) if s.enabled => (s.durations.clone(), s.weather_adjust),
                _ => return,
            },
            ScheduleRef::Quick => match self.quick.take() {
                Some(d) => (d, false),
                None => return,
            },
        };
        let (seasonal, weather) = if weather_adjust {
            (self.seasonal, self.weather)
        } else {
            (100, 100)
        };

        let mut at = start;
        let mut runs = 0;
        for (zone, &minutes) in durations.iter().enumerate() {
            if at >= MINUTES_PER_DAY {
                // midnight stops everything, later zones would never start
                info!(schedule = schedule.id(), zone, "schedule truncated at end of day");
                break;
            }
            if minutes == 0 {
                continue;
            }
            let minutes = adjust(minutes, seasonal, weather).min(cap);
            if minutes == 0 {
                continue;
            }
            self.queue.insert(
                at,
                Command::TurnOn {
                    run: ZoneRun {
                        zone: zone as u8,
                        minutes,
                        schedule: Some(schedule.id()),
                        seasonal,
                        weather,
                    },
                },
            );
            at = at.saturating_add(minutes as u16);
            runs += 1;
        }

        if runs > 0 {
            // past midnight the day rollover does the final stop
            if at < MINUTES_PER_DAY {
                self.queue.insert(at, Command::TurnOffAll { schedule });
            }
            self.active = Some(schedule);
            info!(schedule = schedule.id(), runs, ends_at = at, "schedule started");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        On(u8, u8),
        OffAll,
        StopAll,
    }

    struct Recorder {
        calls: Vec<Call>,
        runs: Vec<ZoneRun>,
        cap: u8,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                runs: Vec::new(),
                cap: 99,
            }
        }

        fn take(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }
    }

    impl ZoneActuator for Recorder {
        fn turn_on(&mut self, run: ZoneRun) -> bool {
            self.calls.push(Call::On(run.zone, run.minutes));
            self.runs.push(run);
            true
        }

        fn turn_off_all(&mut self) {
            self.calls.push(Call::OffAll);
        }

        fn stop_all(&mut self) {
            self.calls.push(Call::StopAll);
        }

        fn max_run_minutes(&self) -> u8 {
            self.cap
        }
    }

    fn daily(start_times: Vec<u16>, durations: Vec<u8>) -> Schedule {
        Schedule {
            name: "lawn".into(),
            enabled: true,
            recurrence: Recurrence::Weekdays(0x7F),
            start_times,
            durations,
            weather_adjust: false,
        }
    }

    const SIX_AM: u16 = 6 * 60;

    // -- Expansion ------------------------------------------------------------

    #[test]
    fn expansion_runs_zones_back_to_back() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![10, 0, 5])], true, 100);
        let mut act = Recorder::new();

        sched.tick(datetime!(2024-06-03 05:59 UTC), &mut act);
        assert!(act.take().is_empty());

        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 10)]);
        let queued: Vec<_> = sched.queue().pending().map(|(t, c)| (t, *c)).collect();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, SIX_AM + 10);
        assert!(matches!(queued[0].1, Command::TurnOn { run } if run.zone == 2 && run.minutes == 5));
        assert_eq!(
            queued[1],
            (SIX_AM + 15, Command::TurnOffAll { schedule: ScheduleRef::Stored(0) })
        );

        sched.tick(datetime!(2024-06-03 06:10 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(2, 5)]);
        sched.tick(datetime!(2024-06-03 06:15 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::OffAll]);
        assert_eq!(sched.active(), None);
    }

    #[test]
    fn runs_carry_schedule_id() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![3])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        assert_eq!(act.runs[0].schedule, Some(1));
        assert_eq!((act.runs[0].seasonal, act.runs[0].weather), (100, 100));
    }

    #[test]
    fn late_expansion_starts_from_now() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![10, 5])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 05:00 UTC), &mut act);
        // no tick between 05:00 and 06:20
        sched.tick(datetime!(2024-06-03 06:20 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 10)]);
        let next: Vec<_> = sched.queue().pending().map(|(t, _)| t).collect();
        assert_eq!(next, vec![SIX_AM + 30, SIX_AM + 35]);
    }

    #[test]
    fn elapsed_start_times_are_not_queued() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM, 18 * 60], vec![10])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 12:00 UTC), &mut act);
        let queued: Vec<_> = sched.queue().pending().map(|(t, _)| t).collect();
        assert_eq!(queued, vec![18 * 60]);
    }

    // -- Recurrence -----------------------------------------------------------

    #[test]
    fn weekday_mask_uses_sunday_as_bit_zero() {
        // 2024-06-03 is a Monday
        assert!(Recurrence::Weekdays(0b10).matches(date!(2024 - 06 - 03)));
        assert!(!Recurrence::Weekdays(0b01).matches(date!(2024 - 06 - 03)));
        assert!(Recurrence::Weekdays(0b01).matches(date!(2024 - 06 - 02)));
    }

    #[test]
    fn interval_counts_days_since_epoch() {
        // 2024-06-04 is day 19878, a multiple of 3
        assert!(Recurrence::Interval(3).matches(date!(2024 - 06 - 04)));
        assert!(!Recurrence::Interval(3).matches(date!(2024 - 06 - 03)));
        assert!(!Recurrence::Interval(0).matches(date!(2024 - 06 - 04)));
    }

    #[test]
    fn schedule_not_running_today_queues_nothing() {
        let mut s = daily(vec![SIX_AM], vec![10]);
        s.recurrence = Recurrence::Weekdays(0b01);
        let mut sched = Scheduler::new(vec![s], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 00:00 UTC), &mut act);
        assert!(sched.queue().is_empty());
    }

    #[test]
    fn disabled_scheduling_queues_nothing() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![10])], false, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 00:00 UTC), &mut act);
        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        assert!(act.take().is_empty());
    }

    // -- Overlap --------------------------------------------------------------

    #[test]
    fn overlapping_schedule_is_deferred_not_dropped() {
        let a = daily(vec![SIX_AM], vec![10]);
        let b = daily(vec![SIX_AM + 5], vec![0, 3]);
        let mut sched = Scheduler::new(vec![a, b], true, 100);
        let mut act = Recorder::new();

        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        sched.tick(datetime!(2024-06-03 06:05 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 10)]);
        assert!(sched
            .queue()
            .pending()
            .any(|(t, c)| t == SIX_AM + 6 && matches!(c, Command::Expand { .. })));

        for m in 6..=10 {
            let now = OffsetDateTime::new_utc(
                date!(2024 - 06 - 03),
                time::Time::from_hms(6, m, 0).unwrap(),
            );
            sched.tick(now, &mut act);
        }
        // schedule A ends at 06:10 and B starts in the same minute
        assert_eq!(act.take(), vec![Call::OffAll, Call::On(1, 3)]);
        assert_eq!(sched.active(), Some(ScheduleRef::Stored(1)));
    }

    // -- Day rollover ---------------------------------------------------------

    #[test]
    fn midnight_stops_everything_and_rebuilds() {
        let mut sched = Scheduler::new(vec![daily(vec![23 * 60 + 50, SIX_AM], vec![30])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 23:50 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 30)]);

        sched.tick(datetime!(2024-06-04 00:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::StopAll]);
        assert_eq!(sched.active(), None);
        let queued: Vec<_> = sched.queue().pending().map(|(t, _)| t).collect();
        assert_eq!(queued, vec![SIX_AM, 23 * 60 + 50]);
    }

    // -- Adjustment -----------------------------------------------------------

    #[test]
    fn adjust_scales_and_rounds() {
        assert_eq!(adjust(10, 100, 100), 10);
        assert_eq!(adjust(10, 50, 100), 5);
        assert_eq!(adjust(10, 80, 50), 4);
        assert_eq!(adjust(3, 50, 100), 2);
        assert_eq!(adjust(200, 200, 100), MAX_ADJUSTED_MINUTES);
    }

    #[test]
    fn weather_adjusted_schedule_scales_then_caps() {
        let mut s = daily(vec![SIX_AM], vec![20, 60]);
        s.weather_adjust = true;
        let mut sched = Scheduler::new(vec![s], true, 150);
        sched.set_weather_scale(100);
        let mut act = Recorder::new();
        act.cap = 45;

        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 30)]);
        assert_eq!((act.runs[0].seasonal, act.runs[0].weather), (150, 100));
        let next = sched.queue().pending().next().unwrap();
        assert!(matches!(next, (t, Command::TurnOn { run }) if t == SIX_AM + 30 && run.minutes == 45));
    }

    #[test]
    fn unadjusted_schedule_ignores_seasonal() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![20])], true, 50);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 20)]);
    }

    // -- Quick schedule -------------------------------------------------------

    #[test]
    fn quick_run_starts_immediately() {
        let mut sched = Scheduler::new(vec![], true, 100);
        let mut act = Recorder::new();
        sched.run_quick(vec![0, 4], datetime!(2024-06-03 09:30 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(1, 4)]);
        assert_eq!(act.runs[0].schedule, Some(QUICK_SCHEDULE_ID));
        assert_eq!(sched.active(), Some(ScheduleRef::Quick));
    }

    #[test]
    fn quick_run_cancels_active_schedule() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM], vec![10, 10])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        act.take();

        sched.run_quick(vec![5], datetime!(2024-06-03 06:03 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::OffAll, Call::On(0, 5)]);
        sched.tick(datetime!(2024-06-03 06:08 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::OffAll]);
        // schedule A's second zone never runs
        sched.tick(datetime!(2024-06-03 06:10 UTC), &mut act);
        assert!(act.take().is_empty());
    }

    #[test]
    fn stop_cancels_and_keeps_future_starts() {
        let mut sched = Scheduler::new(vec![daily(vec![SIX_AM, 18 * 60], vec![10, 10])], true, 100);
        let mut act = Recorder::new();
        sched.tick(datetime!(2024-06-03 06:00 UTC), &mut act);
        act.take();
        sched.stop(&mut act);
        assert_eq!(act.take(), vec![Call::StopAll]);
        let queued: Vec<_> = sched.queue().pending().map(|(t, _)| t).collect();
        assert_eq!(queued, vec![18 * 60]);
    }

    #[test]
    fn late_long_schedule_stops_at_end_of_day() {
        let mut sched = Scheduler::new(vec![daily(vec![23 * 60], vec![254; 255])], true, 100);
        let mut act = Recorder::new();
        act.cap = MAX_ADJUSTED_MINUTES;

        sched.tick(datetime!(2024-06-03 23:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::On(0, 254)]);
        assert_eq!(sched.active(), Some(ScheduleRef::Stored(0)));
        assert!(sched.queue().is_empty());

        sched.tick(datetime!(2024-06-04 00:00 UTC), &mut act);
        assert_eq!(act.take(), vec![Call::StopAll]);
        assert_eq!(sched.active(), None);
    }

    #[test]
    fn busy_schedule_is_skipped_at_end_of_day() {
        let a = daily(vec![23 * 60 + 50], vec![30]);
        let b = daily(vec![23 * 60 + 55], vec![5]);
        let mut sched = Scheduler::new(vec![a, b], true, 100);
        let mut act = Recorder::new();

        for m in 50..60 {
            let now = OffsetDateTime::new_utc(
                date!(2024 - 06 - 03),
                time::Time::from_hms(23, m, 0).unwrap(),
            );
            sched.tick(now, &mut act);
            assert!(sched.queue().pending().all(|(t, _)| t < MINUTES_PER_DAY));
        }
        assert_eq!(act.take(), vec![Call::On(0, 30)]);
        assert!(sched.queue().is_empty());
    }

    #[test]
    fn queue_refuses_minutes_past_end_of_day() {
        let mut q = EventQueue::default();
        let off = Command::TurnOffAll { schedule: ScheduleRef::Quick };
        assert!(q.insert(MINUTES_PER_DAY - 1, off));
        assert!(!q.insert(MINUTES_PER_DAY, off));
        assert_eq!(q.pending().count(), 1);
    }

    #[test]
    fn insertion_is_stable_for_equal_times() {
        let mut q = EventQueue::default();
        let a = Command::TurnOffAll { schedule: ScheduleRef::Stored(0) };
        let b = Command::TurnOffAll { schedule: ScheduleRef::Stored(1) };
        q.insert(10, a);
        q.insert(5, b);
        q.insert(10, b);
        let order: Vec<_> = q.pending().map(|(t, c)| (t, *c)).collect();
        assert_eq!(order, vec![(5, b), (10, a), (10, b)]);
    }
}
