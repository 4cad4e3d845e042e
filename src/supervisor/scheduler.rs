//! Restart Scheduler
//!
//! `RestartSchedule` is the per-instance state (Idle / Armed) and is driven
//! purely by the `Instant` handed to `poll`, so alerts are consumed exactly
//! once no matter how coarse the ticks are. `RestartScheduler` is the single
//! periodic loop that polls every instance and routes due actions back
//! through the supervisor.

use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledAction {
    /// Warn that the restart happens in `seconds_remaining`.
    Alert { seconds_remaining: u64 },
    Restart,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RestartSchedule {
    #[default]
    Idle,
    Armed {
        restart_at: Instant,
        /// Alert lead times not yet fired, descending.
        pending: Vec<u64>,
    },
}

impl RestartSchedule {
    /// Arm for `now + interval`. Offsets at or beyond the interval can never
    /// fire before the restart and are dropped.
    pub fn arm(&mut self, now: Instant, interval: Duration, offsets: &[u64]) {
        let interval_secs = interval.as_secs();
        let mut pending: Vec<u64> = offsets
            .iter()
            .copied()
            .filter(|&o| o > 0 && o < interval_secs)
            .collect();
        pending.sort_unstable_by(|a, b| b.cmp(a));
        pending.dedup();

        *self = RestartSchedule::Armed {
            restart_at: now + interval,
            pending,
        };
    }

    /// Clear pending alerts and return to Idle.
    pub fn disarm(&mut self) {
        *self = RestartSchedule::Idle;
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, RestartSchedule::Armed { .. })
    }

    /// Everything due at `now`, alerts first in descending lead time,
    /// then the restart. After a restart the schedule is Idle.
    pub fn poll(&mut self, now: Instant) -> Vec<ScheduledAction> {
        let RestartSchedule::Armed { restart_at, pending } = self else {
            return Vec::new();
        };

        let mut due = Vec::new();
        while let Some(&offset) = pending.first() {
            let fire_at = restart_at.checked_sub(Duration::from_secs(offset));
            if fire_at.map_or(true, |at| now >= at) {
                pending.remove(0);
                due.push(ScheduledAction::Alert { seconds_remaining: offset });
            } else {
                break;
            }
        }

        if now >= *restart_at {
            due.push(ScheduledAction::Restart);
            *self = RestartSchedule::Idle;
        }
        due
    }

    pub fn next_restart_in(&self, now: Instant) -> Option<Duration> {
        match self {
            RestartSchedule::Armed { restart_at, .. } => Some(restart_at.saturating_duration_since(now)),
            RestartSchedule::Idle => None,
        }
    }
}

/// The periodic loop across all instances.
pub struct RestartScheduler;

impl RestartScheduler {
    /// Poll every `tick` until `cancel` fires. Due actions of one instance
    /// run in order on their own task so a slow restart never delays
    /// another instance's alerts.
    pub fn spawn(supervisor: Supervisor, tick: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!("Restart scheduler started (tick {:?})", tick);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                for (alias, actions) in supervisor.collect_due(Instant::now()) {
                    let supervisor = supervisor.clone();
                    tokio::spawn(async move {
                        supervisor.run_scheduled(&alias, actions).await;
                    });
                }
            }
            tracing::info!("Restart scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIX_HOURS: Duration = Duration::from_secs(6 * 3600);
    const OFFSETS: [u64; 4] = [3600, 1800, 300, 30];

    #[test]
    fn test_full_interval_fires_each_alert_once() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, SIX_HOURS, &OFFSETS);

        let mut fired = Vec::new();
        for second in 0..=SIX_HOURS.as_secs() + 5 {
            fired.extend(schedule.poll(start + Duration::from_secs(second)));
        }

        assert_eq!(
            fired,
            vec![
                ScheduledAction::Alert { seconds_remaining: 3600 },
                ScheduledAction::Alert { seconds_remaining: 1800 },
                ScheduledAction::Alert { seconds_remaining: 300 },
                ScheduledAction::Alert { seconds_remaining: 30 },
                ScheduledAction::Restart,
            ]
        );
        assert!(!schedule.is_armed());
    }

    #[test]
    fn test_infrequent_poll_consumes_everything_in_order() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, SIX_HOURS, &[30, 3600, 300, 1800]);

        assert!(schedule.poll(start + Duration::from_secs(60)).is_empty());

        let fired = schedule.poll(start + SIX_HOURS + Duration::from_secs(600));
        assert_eq!(fired.len(), 5);
        assert_eq!(fired[0], ScheduledAction::Alert { seconds_remaining: 3600 });
        assert_eq!(fired[3], ScheduledAction::Alert { seconds_remaining: 30 });
        assert_eq!(fired[4], ScheduledAction::Restart);
        assert!(schedule.poll(start + SIX_HOURS * 2).is_empty());
    }

    #[test]
    fn test_alert_fires_at_its_lead_time() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, Duration::from_secs(100), &[30]);

        assert!(schedule.poll(start + Duration::from_secs(69)).is_empty());
        assert_eq!(
            schedule.poll(start + Duration::from_secs(70)),
            vec![ScheduledAction::Alert { seconds_remaining: 30 }]
        );
        assert!(schedule.poll(start + Duration::from_secs(71)).is_empty());
    }

    #[test]
    fn test_offsets_beyond_interval_are_dropped() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, Duration::from_secs(600), &[3600, 600, 300, 300, 0]);

        match &schedule {
            RestartSchedule::Armed { pending, .. } => assert_eq!(pending, &vec![300]),
            RestartSchedule::Idle => panic!("expected armed"),
        }
    }

    #[test]
    fn test_rearm_with_short_delay_replaces_periodic_restart() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, SIX_HOURS, &OFFSETS);

        // 10초 뒤 재시작 요청: 지연보다 짧은 알림만 남음
        let requested = start + Duration::from_secs(120);
        schedule.arm(requested, Duration::from_secs(10), &[3600, 5, 1]);
        assert_eq!(schedule.next_restart_in(requested), Some(Duration::from_secs(10)));

        let mut fired = Vec::new();
        for second in 0..=12 {
            fired.extend(schedule.poll(requested + Duration::from_secs(second)));
        }
        assert_eq!(
            fired,
            vec![
                ScheduledAction::Alert { seconds_remaining: 5 },
                ScheduledAction::Alert { seconds_remaining: 1 },
                ScheduledAction::Restart,
            ]
        );
        assert!(schedule.poll(start + SIX_HOURS).is_empty());
    }

    #[test]
    fn test_disarm_clears_pending() {
        let start = Instant::now();
        let mut schedule = RestartSchedule::default();
        schedule.arm(start, SIX_HOURS, &OFFSETS);
        assert_eq!(schedule.next_restart_in(start), Some(SIX_HOURS));

        schedule.disarm();
        assert_eq!(schedule.next_restart_in(start), None);
        assert!(schedule.poll(start + SIX_HOURS).is_empty());

        // 다시 arm하면 전체 알림이 새로 잡힘
        schedule.arm(start, SIX_HOURS, &OFFSETS);
        assert_eq!(schedule.poll(start + SIX_HOURS).len(), 5);
    }
}
