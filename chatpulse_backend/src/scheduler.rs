use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::dice::Dice;
use crate::timers::{TimerLease, TimerTable};

/// Delay before retrying a character whose settings could not be loaded.
const RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Upper bound for any sampled or requested wake delay.
pub const MAX_WAKE_MINUTES: f64 = 7.0 * 24.0 * 60.0;

/// The scheduling-relevant part of a character, reloaded at every firing.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeProfile {
    pub interval_min: f64,
    pub interval_max: f64,
    pub is_blocked: bool,
    pub sys_proactive: bool,
    pub sys_timer: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WakeOutcome {
    /// A message was committed; carries the `[TIMER:n]` override if any.
    Delivered { next_wake_minutes: Option<f64> },
    /// The model produced nothing worth sending.
    Silent,
    /// The lease lost authority before the commit.
    Superseded,
}

#[async_trait]
pub trait WakeHandler: Send + Sync + 'static {
    /// None when the character no longer exists.
    async fn wake_profile(&self, character_id: &str) -> Result<Option<WakeProfile>>;

    /// Generates one proactive message. All persistence must go through
    /// `lease.commit` so a cancelled firing leaves no trace.
    async fn wake(&self, lease: &TimerLease<String>) -> Result<WakeOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacterTimerState {
    pub countdown: Duration,
    pub is_thinking: bool,
}

/// One randomized wake timer per character.
#[derive(Clone)]
pub struct ProactiveScheduler {
    inner: Arc<SchedulerInner>,
}

/// Non-owning handle for code the scheduler itself calls into.
#[derive(Clone)]
pub struct WeakScheduler {
    inner: Weak<SchedulerInner>,
}

impl WeakScheduler {
    pub fn upgrade(&self) -> Option<ProactiveScheduler> {
        self.inner.upgrade().map(|inner| ProactiveScheduler { inner })
    }
}

struct SchedulerInner {
    timers: Arc<TimerTable<String>>,
    handler: Arc<dyn WakeHandler>,
    dice: Arc<dyn Dice>,
}

impl ProactiveScheduler {
    pub fn new(handler: Arc<dyn WakeHandler>, dice: Arc<dyn Dice>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                timers: TimerTable::new(),
                handler,
                dice,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakScheduler {
        WeakScheduler {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Arms the character with a delay sampled from its interval,
    /// superseding any pending timer.
    pub fn schedule(&self, character_id: &str, profile: &WakeProfile) -> bool {
        let delay = self.inner.sample_delay(profile);
        self.schedule_in(character_id, delay)
    }

    /// Arms the character `minutes` from now, e.g. for a `[TIMER:n]` override.
    pub fn schedule_in_minutes(&self, character_id: &str, value: f64) -> bool {
        self.schedule_in(character_id, minutes(value))
    }

    pub fn schedule_in(&self, character_id: &str, delay: Duration) -> bool {
        let inner = self.inner.clone();
        let armed = self
            .inner
            .timers
            .arm(character_id.to_string(), delay, move |lease| fire(inner, lease));
        if armed.is_some() {
            tracing::debug!("Proactive wake for {} in {:?}", character_id, delay);
        }
        armed.is_some()
    }

    pub fn cancel(&self, character_id: &str) -> bool {
        self.inner.timers.cancel(&character_id.to_string())
    }

    pub fn cancel_all(&self) {
        self.inner.timers.cancel_all();
    }

    /// Cancels every timer; later `schedule` calls are refused.
    pub fn shutdown(&self) {
        self.inner.timers.close();
    }

    pub fn is_scheduled(&self, character_id: &str) -> bool {
        self.inner.timers.is_armed(&character_id.to_string())
    }

    pub fn pending(&self) -> usize {
        self.inner.timers.len()
    }

    pub fn state(&self, character_id: &str) -> Option<CharacterTimerState> {
        self.inner
            .timers
            .status(&character_id.to_string())
            .map(|status| CharacterTimerState {
                countdown: status.remaining,
                is_thinking: status.busy,
            })
    }

    pub fn snapshot(&self) -> Vec<(String, CharacterTimerState)> {
        self.inner
            .timers
            .snapshot()
            .into_iter()
            .map(|(id, status)| {
                (
                    id,
                    CharacterTimerState {
                        countdown: status.remaining,
                        is_thinking: status.busy,
                    },
                )
            })
            .collect()
    }
}

impl SchedulerInner {
    fn sample_delay(&self, profile: &WakeProfile) -> Duration {
        sample_minutes(self.dice.as_ref(), profile.interval_min, profile.interval_max)
    }
}

/// A uniform delay between the two bounds, each clamped to
/// `[0.1, MAX_WAKE_MINUTES]` before sampling.
pub(crate) fn sample_minutes(dice: &dyn Dice, interval_min: f64, interval_max: f64) -> Duration {
    let low = interval_min.max(0.1).min(MAX_WAKE_MINUTES);
    let high = interval_max.max(low).min(MAX_WAKE_MINUTES);
    minutes(dice.uniform(low, high))
}

/// Minutes to a delay, clamped to `[0, MAX_WAKE_MINUTES]`. NaN counts as zero.
pub(crate) fn minutes(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0).min(MAX_WAKE_MINUTES) * 60.0)
}

fn rearm(inner: Arc<SchedulerInner>, lease: TimerLease<String>, delay: Duration) {
    let next = inner.clone();
    let id = lease.key().clone();
    if lease.rearm(delay, move |lease| fire(next, lease)).is_some() {
        tracing::debug!("Next proactive wake for {} in {:?}", id, delay);
    }
}

fn fire(inner: Arc<SchedulerInner>, lease: TimerLease<String>) -> BoxFuture<'static, ()> {
    async move {
        let character_id = lease.key().clone();

        let profile = match inner.handler.wake_profile(&character_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::debug!("Character {} is gone; dropping its timer", character_id);
                lease.release();
                return;
            }
            Err(error) => {
                tracing::warn!("Failed to load {} for proactive wake: {}", character_id, error);
                rearm(inner, lease, RETRY_DELAY);
                return;
            }
        };

        if profile.is_blocked || !profile.sys_proactive {
            tracing::debug!(
                "Skipping proactive wake for {} (blocked: {}, proactive: {})",
                character_id,
                profile.is_blocked,
                profile.sys_proactive
            );
            let delay = inner.sample_delay(&profile);
            rearm(inner, lease, delay);
            return;
        }

        if !lease.set_busy(true) {
            return;
        }

        let override_minutes = match inner.handler.wake(&lease).await {
            Ok(WakeOutcome::Delivered { next_wake_minutes }) => next_wake_minutes,
            Ok(WakeOutcome::Silent) => None,
            Ok(WakeOutcome::Superseded) => {
                tracing::debug!("Proactive wake for {} was superseded", character_id);
                return;
            }
            Err(error) => {
                tracing::warn!("Proactive wake for {} failed: {}", character_id, error);
                None
            }
        };

        let delay = match override_minutes.filter(|_| profile.sys_timer) {
            Some(value) => minutes(value),
            None => inner.sample_delay(&profile),
        };
        rearm(inner, lease, delay);
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FixedDice;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeHandler {
        profiles: Mutex<HashMap<String, WakeProfile>>,
        wakes: AtomicUsize,
        commits: AtomicUsize,
        model_delay: Duration,
        next_wake_minutes: Option<f64>,
    }

    impl FakeHandler {
        fn new(model_delay: Duration, next_wake_minutes: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                profiles: Mutex::new(HashMap::new()),
                wakes: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                model_delay,
                next_wake_minutes,
            })
        }

        fn set(&self, id: &str, profile: WakeProfile) {
            self.profiles.lock().unwrap().insert(id.to_string(), profile);
        }
    }

    #[async_trait]
    impl WakeHandler for FakeHandler {
        async fn wake_profile(&self, character_id: &str) -> Result<Option<WakeProfile>> {
            Ok(self.profiles.lock().unwrap().get(character_id).cloned())
        }

        async fn wake(&self, lease: &TimerLease<String>) -> Result<WakeOutcome> {
            self.wakes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.model_delay).await;
            match lease.commit(|| self.commits.fetch_add(1, Ordering::SeqCst)) {
                Some(_) => Ok(WakeOutcome::Delivered {
                    next_wake_minutes: self.next_wake_minutes,
                }),
                None => Ok(WakeOutcome::Superseded),
            }
        }
    }

    fn profile(min: f64, max: f64) -> WakeProfile {
        WakeProfile {
            interval_min: min,
            interval_max: max,
            is_blocked: false,
            sys_proactive: true,
            sys_timer: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_or_disabled_characters_never_wake() {
        let handler = FakeHandler::new(Duration::from_secs(1), None);
        handler.set(
            "blocked",
            WakeProfile {
                is_blocked: true,
                ..profile(1.0, 1.0)
            },
        );
        handler.set(
            "quiet",
            WakeProfile {
                sys_proactive: false,
                ..profile(1.0, 1.0)
            },
        );
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));
        scheduler.schedule("blocked", &profile(1.0, 1.0));
        scheduler.schedule("quiet", &profile(1.0, 1.0));

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 0);
        // Skipped wakes still keep a timer armed
        assert!(scheduler.is_scheduled("blocked"));
        assert!(scheduler.is_scheduled("quiet"));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_timer_per_character() {
        let handler = FakeHandler::new(Duration::from_secs(1), None);
        handler.set("mika", profile(2.0, 2.0));
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));

        for _ in 0..5 {
            scheduler.schedule("mika", &profile(2.0, 2.0));
        }
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(2 * 60 + 5)).await;
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 1);
        assert_eq!(handler.commits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_override_sets_next_delay() {
        let handler = FakeHandler::new(Duration::from_secs(1), Some(45.0));
        handler.set("mika", profile(1.0, 1.0));
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));
        scheduler.schedule("mika", &profile(1.0, 1.0));

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(handler.commits.load(Ordering::SeqCst), 1);
        let state = scheduler.state("mika").expect("re-armed");
        assert!(!state.is_thinking);
        assert!(state.countdown > Duration::from_secs(40 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_firing_commits_nothing() {
        let handler = FakeHandler::new(Duration::from_secs(30), None);
        handler.set("mika", profile(1.0, 1.0));
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));
        scheduler.schedule("mika", &profile(1.0, 1.0));

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 1);
        assert!(scheduler.state("mika").expect("firing").is_thinking);

        scheduler.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handler.commits.load(Ordering::SeqCst), 0);
        assert!(!scheduler.schedule("mika", &profile(1.0, 1.0)));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_timers_but_keeps_accepting() {
        let handler = FakeHandler::new(Duration::from_secs(1), None);
        handler.set("mika", profile(1.0, 1.0));
        handler.set("ren", profile(1.0, 1.0));
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));
        scheduler.schedule("mika", &profile(1.0, 1.0));
        scheduler.schedule("ren", &profile(1.0, 1.0));

        scheduler.cancel_all();
        assert_eq!(scheduler.pending(), 0);
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 0);

        assert!(scheduler.schedule("mika", &profile(1.0, 1.0)));
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sampled_delays_stay_within_the_cap() {
        let cap = Duration::from_secs_f64(MAX_WAKE_MINUTES * 60.0);
        assert_eq!(sample_minutes(&crate::dice::ThreadDice, 1e18, f64::INFINITY), cap);
        assert_eq!(sample_minutes(&FixedDice::default(), f64::NAN, f64::NAN), minutes(0.1));
        assert_eq!(minutes(-3.0), Duration::ZERO);
        let sampled = sample_minutes(&crate::dice::ThreadDice, 2.0, 4.0);
        assert!(sampled >= minutes(2.0) && sampled <= minutes(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_character_drops_its_timer() {
        let handler = FakeHandler::new(Duration::from_secs(1), None);
        let scheduler = ProactiveScheduler::new(handler.clone(), Arc::new(FixedDice::default()));
        scheduler.schedule("ghost", &profile(1.0, 1.0));

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(handler.wakes.load(Ordering::SeqCst), 0);
    }
}
