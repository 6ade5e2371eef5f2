//! Keyed one-shot timers with generation leases.
//!
//! Each key holds at most one armed timer. Arming again supersedes the old
//! one, and every armed timer gets a fresh generation. The firing task
//! receives a [`TimerLease`] and must route each side effect through it; a
//! lease whose generation is no longer the key's current one commits nothing.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct TimerSlot {
    generation: u64,
    fire_at: Instant,
    busy: bool,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerStatus {
    pub remaining: Duration,
    pub busy: bool,
}

pub struct TimerTable<K> {
    slots: Mutex<HashMap<K, TimerSlot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl<K> Default for TimerTable<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }
}

impl<K> TimerTable<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<K, TimerSlot>> {
        // A panic inside a short critical section leaves the map consistent
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arms `key`, aborting any timer already pending for it. Returns the
    /// new generation, or None once the table is closed.
    pub fn arm<F>(self: &Arc<Self>, key: K, delay: Duration, on_fire: F) -> Option<u64>
    where
        F: FnOnce(TimerLease<K>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let mut slots = self.lock_slots();
        let (generation, previous) = self.install(&mut slots, key, delay, on_fire)?;
        drop(slots);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        Some(generation)
    }

    fn install<F>(
        self: &Arc<Self>,
        slots: &mut HashMap<K, TimerSlot>,
        key: K,
        delay: Duration,
        on_fire: F,
    ) -> Option<(u64, Option<TimerSlot>)>
    where
        F: FnOnce(TimerLease<K>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let lease = TimerLease {
            table: self.clone(),
            key: key.clone(),
            generation,
        };
        // The task cannot observe its slot before we release the lock
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(lease).await;
        });
        let previous = slots.insert(
            key,
            TimerSlot {
                generation,
                fire_at: Instant::now() + delay,
                busy: false,
                handle,
            },
        );
        Some((generation, previous))
    }

    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.lock_slots().remove(key);
        match removed {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let drained: Vec<TimerSlot> = self.lock_slots().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.handle.abort();
        }
    }

    /// Cancels everything and refuses further arming.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.lock_slots().contains_key(key)
    }

    pub fn status(&self, key: &K) -> Option<TimerStatus> {
        let now = Instant::now();
        self.lock_slots().get(key).map(|slot| TimerStatus {
            remaining: slot.fire_at.saturating_duration_since(now),
            busy: slot.busy,
        })
    }

    pub fn snapshot(&self) -> Vec<(K, TimerStatus)> {
        let now = Instant::now();
        self.lock_slots()
            .iter()
            .map(|(key, slot)| {
                (
                    key.clone(),
                    TimerStatus {
                        remaining: slot.fire_at.saturating_duration_since(now),
                        busy: slot.busy,
                    },
                )
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Authority handed to a firing timer.
pub struct TimerLease<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    table: Arc<TimerTable<K>>,
    key: K,
    generation: u64,
}

impl<K> TimerLease<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn holds(&self, slots: &HashMap<K, TimerSlot>) -> bool {
        !self.table.is_closed()
            && slots
                .get(&self.key)
                .map(|slot| slot.generation == self.generation)
                .unwrap_or(false)
    }

    pub fn is_current(&self) -> bool {
        let slots = self.table.lock_slots();
        self.holds(&slots)
    }

    /// Runs `commit` while holding the table lock, only if this lease is
    /// still authoritative. `commit` must not touch the same table.
    pub fn commit<T>(&self, commit: impl FnOnce() -> T) -> Option<T> {
        let slots = self.table.lock_slots();
        if !self.holds(&slots) {
            return None;
        }
        Some(commit())
    }

    /// Flags the slot as doing work (e.g. waiting on a model).
    pub fn set_busy(&self, busy: bool) -> bool {
        let mut slots = self.table.lock_slots();
        if !self.holds(&slots) {
            return false;
        }
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.busy = busy;
        }
        true
    }

    /// Replaces this timer with a new one for the same key. The calling task
    /// is the one being replaced, so it is not aborted.
    pub fn rearm<F>(self, delay: Duration, on_fire: F) -> Option<u64>
    where
        F: FnOnce(TimerLease<K>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let table = self.table.clone();
        let mut slots = table.lock_slots();
        if !self.holds(&slots) {
            return None;
        }
        let (generation, _own_slot) = table.install(&mut slots, self.key.clone(), delay, on_fire)?;
        Some(generation)
    }

    /// Removes the slot without re-arming.
    pub fn release(self) -> bool {
        let mut slots = self.table.lock_slots();
        if !self.holds(&slots) {
            return false;
        }
        slots.remove(&self.key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: Arc<AtomicUsize>) -> impl FnOnce(TimerLease<&'static str>) -> BoxFuture<'static, ()> {
        move |lease| {
            async move {
                lease.commit(|| counter.fetch_add(1, Ordering::SeqCst));
                lease.release();
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn arming_again_supersedes_the_pending_timer() {
        let table = TimerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = table
            .arm("mika", Duration::from_secs(10), counting(fired.clone()))
            .expect("arm");
        let second = table
            .arm("mika", Duration::from_secs(20), counting(fired.clone()))
            .expect("rearm");
        assert!(second > first);
        assert_eq!(table.len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lease_cannot_commit() {
        let table: Arc<TimerTable<&'static str>> = TimerTable::new();
        let committed = Arc::new(AtomicUsize::new(0));
        let observed = committed.clone();

        table.arm("mika", Duration::from_secs(1), move |lease| {
            async move {
                // Simulates a model call that outlives a cancel
                tokio::time::sleep(Duration::from_secs(5)).await;
                lease.commit(|| observed.fetch_add(1, Ordering::SeqCst));
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = table.status(&"mika").expect("still armed while firing");
        assert_eq!(status.remaining, Duration::ZERO);

        // Cancel aborts the in-flight task and invalidates the lease
        assert!(table.cancel(&"mika"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(committed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_from_inside_a_firing_keeps_one_slot() {
        let table: Arc<TimerTable<&'static str>> = TimerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();

        table.arm("mika", Duration::from_secs(5), move |lease| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                lease.rearm(Duration::from_secs(60), |_| async {}.boxed());
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
        let status = table.status(&"mika").expect("re-armed");
        assert!(status.remaining > Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_table_refuses_to_arm() {
        let table = TimerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        table.arm("a", Duration::from_secs(1), counting(fired.clone()));
        table.close();

        assert!(table
            .arm("b", Duration::from_secs(1), counting(fired.clone()))
            .is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
    }
}
