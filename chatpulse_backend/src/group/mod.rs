//! Turn-taking for group rooms.
//!
//! Every room walks `Idle -> Debouncing -> Replying -> Idle`. Plain messages
//! restart a short debounce; a message that mentions members skips it. Only
//! one chain of character turns runs per room. The chain owns a
//! [`ChainLease`] whose drop is the single place where the room is released,
//! so an aborted chain cleans up exactly like a finished one.

pub mod mentions;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::dice::Dice;
use crate::scheduler::sample_minutes;
use crate::timers::{TimerLease, TimerTable};

/// Longest pause a room accepts.
pub const MAX_PAUSE: Duration = Duration::from_secs(24 * 60 * 60);

pub use mentions::{parse_mentions, Mentions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Idle,
    Debouncing,
    Replying,
}

/// What an inbound user message asks of the room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageTrigger {
    pub mentions: Vec<String>,
    pub all: bool,
}

impl MessageTrigger {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn mentioning(ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            mentions: ids.into_iter().map(Into::into).collect(),
            all: false,
        }
    }

    pub fn everyone() -> Self {
        Self {
            mentions: Vec::new(),
            all: true,
        }
    }

    pub fn is_mention(&self) -> bool {
        self.all || !self.mentions.is_empty()
    }

    fn merge(&mut self, other: MessageTrigger) {
        self.all |= other.all;
        for id in other.mentions {
            if !self.mentions.contains(&id) {
                self.mentions.push(id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The debounce timer was armed or reset.
    Debouncing,
    /// A chain started right away.
    Started,
    /// A running chain was told to stop; this message takes over afterwards.
    Interrupted,
    /// A chain is running; the room debounces again once it finishes.
    Deferred,
    /// The room is paused; the debounce waits out the pause.
    Paused,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterMember {
    pub id: String,
    pub name: String,
    pub is_blocked: bool,
    pub sys_jealousy: bool,
}

/// Room membership and policy, loaded once per chain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoomRoster {
    pub members: Vec<RosterMember>,
    pub no_chain: bool,
    pub skip_rate: f64,
    pub jealousy_chance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub room_id: String,
    pub character_id: String,
    pub mentioned: bool,
    pub jealous: bool,
    pub proactive: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    /// Display text of the committed reply, if any.
    pub reply: Option<String>,
}

#[async_trait]
pub trait ChainHandler: Send + Sync + 'static {
    async fn roster(&self, room_id: &str) -> Result<RoomRoster>;

    /// Whether the user's recent attention went to someone other than
    /// `character_id`.
    async fn favors_other(&self, room_id: &str, character_id: &str) -> Result<bool>;

    /// Generates and commits one character reply.
    async fn take_turn(&self, turn: TurnRequest) -> Result<TurnOutcome>;

    /// Called with the room table locked so updates stay ordered; must not
    /// call back into the orchestrator.
    fn typing_changed(&self, room_id: &str, character_ids: &[String]);
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub debounce: Duration,
    pub default_pause: Duration,
    pub max_followups: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(3000),
            default_pause: Duration::from_secs(10),
            max_followups: 3,
        }
    }
}

struct ChainSlot {
    id: u64,
    abort: AbortHandle,
}

struct RoomState {
    phase: RoomPhase,
    interrupted: bool,
    paused_until: Option<Instant>,
    /// Trigger the next debounce firing starts with.
    queued: Option<MessageTrigger>,
    /// Messages that arrived while a chain was running.
    pending: Option<MessageTrigger>,
    /// The mention that interrupted the running chain.
    takeover: Option<MessageTrigger>,
    chain: Option<ChainSlot>,
    typing: Vec<String>,
    chains_started: u64,
}

impl Default for RoomState {
    fn default() -> Self {
        Self {
            phase: RoomPhase::Idle,
            interrupted: false,
            paused_until: None,
            queued: None,
            pending: None,
            takeover: None,
            chain: None,
            typing: Vec::new(),
            chains_started: 0,
        }
    }
}

impl RoomState {
    fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.paused_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

#[derive(Clone)]
pub struct GroupOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    rooms: Mutex<HashMap<String, RoomState>>,
    debounce: Arc<TimerTable<String>>,
    proactive: Arc<TimerTable<String>>,
    handler: Arc<dyn ChainHandler>,
    dice: Arc<dyn Dice>,
    settings: OrchestratorSettings,
    next_chain_id: AtomicU64,
    closed: AtomicBool,
}

struct ChainRequest {
    trigger: MessageTrigger,
    proactive: bool,
}

/// Held by a running chain; dropping it releases the room.
struct ChainLease {
    inner: Arc<OrchestratorInner>,
    room_id: String,
    chain_id: u64,
}

impl Drop for ChainLease {
    fn drop(&mut self) {
        self.inner.finalize(&self.room_id, self.chain_id);
    }
}

impl GroupOrchestrator {
    pub fn new(
        handler: Arc<dyn ChainHandler>,
        dice: Arc<dyn Dice>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                rooms: Mutex::new(HashMap::new()),
                debounce: TimerTable::new(),
                proactive: TimerTable::new(),
                handler,
                dice,
                settings,
                next_chain_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Feeds one user message into the room's state machine.
    pub fn on_message(&self, room_id: &str, trigger: MessageTrigger) -> TriggerOutcome {
        if self.inner.is_closed() {
            return TriggerOutcome::Closed;
        }
        let mut rooms = self.inner.lock_rooms();
        let state = rooms.entry(room_id.to_string()).or_default();

        if state.phase == RoomPhase::Replying {
            if trigger.is_mention() {
                if !state.interrupted {
                    tracing::info!("Mention in {} interrupts the running chain", room_id);
                }
                state.interrupted = true;
                match state.takeover.as_mut() {
                    Some(takeover) => takeover.merge(trigger),
                    None => state.takeover = Some(trigger),
                }
                return TriggerOutcome::Interrupted;
            }
            state
                .pending
                .get_or_insert_with(MessageTrigger::default)
                .merge(trigger);
            return TriggerOutcome::Deferred;
        }

        if let Some(remaining) = state.pause_remaining(Instant::now()) {
            state
                .queued
                .get_or_insert_with(MessageTrigger::default)
                .merge(trigger);
            state.phase = RoomPhase::Debouncing;
            let mention = state.queued.as_ref().is_some_and(MessageTrigger::is_mention);
            let delay = if mention {
                remaining
            } else {
                remaining.max(self.inner.settings.debounce)
            };
            self.inner.arm_debounce(room_id, delay);
            return TriggerOutcome::Paused;
        }

        let mut queued = state.queued.take().unwrap_or_default();
        queued.merge(trigger);

        if queued.is_mention() {
            self.inner.debounce.cancel(&room_id.to_string());
            let started = self.inner.begin_chain(
                room_id,
                state,
                ChainRequest {
                    trigger: queued,
                    proactive: false,
                },
            );
            return if started {
                TriggerOutcome::Started
            } else {
                TriggerOutcome::Closed
            };
        }

        state.queued = Some(queued);
        state.phase = RoomPhase::Debouncing;
        if self
            .inner
            .arm_debounce(room_id, self.inner.settings.debounce)
            .is_none()
        {
            state.phase = RoomPhase::Idle;
            return TriggerOutcome::Closed;
        }
        TriggerOutcome::Debouncing
    }

    /// Asks the running chain to stop before its next turn. Returns whether a
    /// chain was running.
    pub fn interrupt(&self, room_id: &str) -> bool {
        let mut rooms = self.inner.lock_rooms();
        match rooms.get_mut(room_id) {
            Some(state) if state.phase == RoomPhase::Replying => {
                state.interrupted = true;
                true
            }
            _ => false,
        }
    }

    /// Holds the room for `duration` (or the default pause, at most
    /// [`MAX_PAUSE`]) and interrupts whatever is running.
    pub fn pause(&self, room_id: &str, duration: Option<Duration>) -> Duration {
        let duration = duration
            .unwrap_or(self.inner.settings.default_pause)
            .min(MAX_PAUSE);
        let now = Instant::now();
        let mut rooms = self.inner.lock_rooms();
        let state = rooms.entry(room_id.to_string()).or_default();
        state.paused_until = Some(now.checked_add(duration).unwrap_or(now + MAX_PAUSE));
        if state.phase == RoomPhase::Replying {
            state.interrupted = true;
        }
        tracing::info!("Room {} paused for {:?}", room_id, duration);
        duration
    }

    pub fn resume(&self, room_id: &str) -> bool {
        let mut rooms = self.inner.lock_rooms();
        let Some(state) = rooms.get_mut(room_id) else {
            return false;
        };
        let was_paused = state.pause_remaining(Instant::now()).is_some();
        state.paused_until = None;
        if state.phase == RoomPhase::Debouncing {
            if state.queued.as_ref().is_some_and(MessageTrigger::is_mention) {
                self.inner.debounce.cancel(&room_id.to_string());
                let trigger = state.queued.take().unwrap_or_default();
                if !self.inner.begin_chain(
                    room_id,
                    state,
                    ChainRequest {
                        trigger,
                        proactive: false,
                    },
                ) {
                    state.phase = RoomPhase::Idle;
                }
            } else {
                self.inner.arm_debounce(room_id, self.inner.settings.debounce);
            }
        }
        was_paused
    }

    /// Arms (or re-arms) the room's proactive wake.
    pub fn arm_proactive(&self, room_id: &str, interval_min: f64, interval_max: f64) -> bool {
        self.inner
            .arm_proactive(room_id, interval_min, interval_max)
            .is_some()
    }

    pub fn cancel_proactive(&self, room_id: &str) -> bool {
        self.inner.proactive.cancel(&room_id.to_string())
    }

    pub fn phase(&self, room_id: &str) -> RoomPhase {
        self.inner
            .lock_rooms()
            .get(room_id)
            .map(|state| state.phase)
            .unwrap_or(RoomPhase::Idle)
    }

    pub fn is_paused(&self, room_id: &str) -> bool {
        self.inner
            .lock_rooms()
            .get(room_id)
            .and_then(|state| state.pause_remaining(Instant::now()))
            .is_some()
    }

    pub fn chains_started(&self, room_id: &str) -> u64 {
        self.inner
            .lock_rooms()
            .get(room_id)
            .map(|state| state.chains_started)
            .unwrap_or(0)
    }

    pub fn typing(&self, room_id: &str) -> Vec<String> {
        self.inner
            .lock_rooms()
            .get(room_id)
            .map(|state| state.typing.clone())
            .unwrap_or_default()
    }

    /// Cancels every room timer and aborts running chains.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.debounce.close();
        self.inner.proactive.close();
        let running: Vec<AbortHandle> = self
            .inner
            .lock_rooms()
            .values()
            .filter_map(|state| state.chain.as_ref().map(|chain| chain.abort.clone()))
            .collect();
        for handle in running {
            handle.abort();
        }
    }
}

impl OrchestratorInner {
    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<String, RoomState>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn arm_debounce(self: &Arc<Self>, room_id: &str, delay: Duration) -> Option<u64> {
        let inner = self.clone();
        self.debounce
            .arm(room_id.to_string(), delay, move |lease| fire_debounce(inner, lease))
    }

    fn arm_proactive(self: &Arc<Self>, room_id: &str, interval_min: f64, interval_max: f64) -> Option<u64> {
        let delay = self.sample_minutes(interval_min, interval_max);
        let inner = self.clone();
        self.proactive.arm(room_id.to_string(), delay, move |lease| {
            fire_proactive(inner, lease, interval_min, interval_max)
        })
    }

    fn sample_minutes(&self, interval_min: f64, interval_max: f64) -> Duration {
        sample_minutes(self.dice.as_ref(), interval_min, interval_max)
    }

    /// Must be called with the rooms lock held (`state` borrows from it).
    /// Sets the chain lock and clears the interrupt flag in one step.
    fn begin_chain(self: &Arc<Self>, room_id: &str, state: &mut RoomState, request: ChainRequest) -> bool {
        if self.is_closed() {
            return false;
        }
        // Finalize can run from a task being dropped outside the runtime
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let chain_id = self.next_chain_id.fetch_add(1, Ordering::SeqCst);
        state.phase = RoomPhase::Replying;
        state.interrupted = false;
        state.queued = None;
        state.chains_started += 1;

        let lease = ChainLease {
            inner: self.clone(),
            room_id: room_id.to_string(),
            chain_id,
        };
        let handle = runtime.spawn(run_chain(lease, request));
        state.chain = Some(ChainSlot {
            id: chain_id,
            abort: handle.abort_handle(),
        });
        tracing::debug!("Chain {} started in {}", chain_id, room_id);
        true
    }

    fn debounce_elapsed(self: &Arc<Self>, lease: TimerLease<String>) {
        let room_id = lease.key().clone();
        let mut rooms = self.lock_rooms();
        if !lease.release() {
            return;
        }
        let Some(state) = rooms.get_mut(&room_id) else {
            return;
        };

        if state.phase == RoomPhase::Replying {
            if let Some(queued) = state.queued.take() {
                state.pending.get_or_insert_with(MessageTrigger::default).merge(queued);
            }
            return;
        }
        if let Some(remaining) = state.pause_remaining(Instant::now()) {
            self.arm_debounce(&room_id, remaining);
            return;
        }

        let trigger = state.queued.take().unwrap_or_default();
        if !self.begin_chain(
            &room_id,
            state,
            ChainRequest {
                trigger,
                proactive: false,
            },
        ) {
            state.phase = RoomPhase::Idle;
        }
    }

    fn proactive_elapsed(self: &Arc<Self>, lease: TimerLease<String>, interval_min: f64, interval_max: f64) {
        let room_id = lease.key().clone();
        let mut rooms = self.lock_rooms();
        if !lease.is_current() {
            return;
        }
        let state = rooms.entry(room_id.clone()).or_default();
        let idle = state.phase == RoomPhase::Idle;
        let paused = state.pause_remaining(Instant::now()).is_some();

        if idle && !paused {
            tracing::info!("Group proactive wake in {}", room_id);
            self.begin_chain(
                &room_id,
                state,
                ChainRequest {
                    trigger: MessageTrigger::default(),
                    proactive: true,
                },
            );
        } else {
            tracing::debug!("Group proactive wake in {} skipped (busy or paused)", room_id);
        }

        let delay = self.sample_minutes(interval_min, interval_max);
        let inner = self.clone();
        lease.rearm(delay, move |lease| {
            fire_proactive(inner, lease, interval_min, interval_max)
        });
    }

    /// True while the chain may take another turn.
    fn should_continue(&self, chain: &ChainLease) -> bool {
        if self.is_closed() {
            return false;
        }
        let rooms = self.lock_rooms();
        rooms
            .get(&chain.room_id)
            .map(|state| {
                state.chain.as_ref().map(|c| c.id) == Some(chain.chain_id)
                    && !state.interrupted
                    && state.pause_remaining(Instant::now()).is_none()
            })
            .unwrap_or(false)
    }

    fn set_typing(&self, chain: &ChainLease, character_id: &str, typing: bool) {
        let mut rooms = self.lock_rooms();
        let Some(state) = rooms.get_mut(&chain.room_id) else {
            return;
        };
        if state.chain.as_ref().map(|c| c.id) != Some(chain.chain_id) {
            return;
        }
        let present = state.typing.iter().any(|id| id == character_id);
        match (typing, present) {
            (true, false) => state.typing.push(character_id.to_string()),
            (false, true) => state.typing.retain(|id| id != character_id),
            _ => return,
        }
        self.handler.typing_changed(&chain.room_id, &state.typing);
    }

    /// Releases the chain lock and clears the interrupt flag together. An
    /// uninterrupted chain hands pending messages back to the debounce; an
    /// interrupted one only honors the mention that interrupted it.
    fn finalize(self: &Arc<Self>, room_id: &str, chain_id: u64) {
        let mut rooms = self.lock_rooms();
        let Some(state) = rooms.get_mut(room_id) else {
            return;
        };
        if state.chain.as_ref().map(|c| c.id) != Some(chain_id) {
            return;
        }
        state.chain = None;
        state.phase = RoomPhase::Idle;
        if !state.typing.is_empty() {
            state.typing.clear();
            self.handler.typing_changed(room_id, &[]);
        }

        let interrupted = std::mem::take(&mut state.interrupted);
        let next = if interrupted {
            state.pending = None;
            state.takeover.take()
        } else {
            state.takeover = None;
            state.pending.take()
        };

        if let Some(trigger) = next {
            let remaining = state.pause_remaining(Instant::now());
            if trigger.is_mention() && remaining.is_none() {
                // Mentions never wait out the debounce
                self.debounce.cancel(&room_id.to_string());
                self.begin_chain(
                    room_id,
                    state,
                    ChainRequest {
                        trigger,
                        proactive: false,
                    },
                );
            } else {
                let delay = match remaining {
                    Some(remaining) if trigger.is_mention() => remaining,
                    Some(remaining) => remaining.max(self.settings.debounce),
                    None => self.settings.debounce,
                };
                state.queued = Some(trigger);
                state.phase = RoomPhase::Debouncing;
                if self.arm_debounce(room_id, delay).is_none() {
                    state.phase = RoomPhase::Idle;
                    state.queued = None;
                }
            }
        }

        tracing::debug!(
            "Chain {} in {} finished (interrupted: {})",
            chain_id,
            room_id,
            interrupted
        );
    }
}

fn fire_debounce(inner: Arc<OrchestratorInner>, lease: TimerLease<String>) -> BoxFuture<'static, ()> {
    async move { inner.debounce_elapsed(lease) }.boxed()
}

fn fire_proactive(
    inner: Arc<OrchestratorInner>,
    lease: TimerLease<String>,
    interval_min: f64,
    interval_max: f64,
) -> BoxFuture<'static, ()> {
    async move { inner.proactive_elapsed(lease, interval_min, interval_max) }.boxed()
}

#[derive(Debug, Clone, PartialEq)]
struct PlannedTurn {
    character_id: String,
    mentioned: bool,
}

/// Mentioned members first in mention order, then everyone else shuffled.
/// A proactive chain is a single turn for one random member.
fn plan_turns(
    roster: &RoomRoster,
    trigger: &MessageTrigger,
    proactive: bool,
    dice: &dyn Dice,
) -> Vec<PlannedTurn> {
    let eligible: Vec<&RosterMember> = roster.members.iter().filter(|m| !m.is_blocked).collect();

    if proactive {
        return dice
            .pick(eligible.len())
            .and_then(|index| eligible.get(index))
            .map(|member| {
                vec![PlannedTurn {
                    character_id: member.id.clone(),
                    mentioned: false,
                }]
            })
            .unwrap_or_default();
    }

    let mut turns: Vec<PlannedTurn> = Vec::new();
    for id in &trigger.mentions {
        if eligible.iter().any(|m| &m.id == id) && !turns.iter().any(|t| &t.character_id == id) {
            turns.push(PlannedTurn {
                character_id: id.clone(),
                mentioned: true,
            });
        }
    }

    let mut rest: Vec<String> = eligible
        .iter()
        .filter(|m| !turns.iter().any(|t| t.character_id == m.id))
        .map(|m| m.id.clone())
        .collect();
    dice.shuffle(&mut rest);
    turns.extend(rest.into_iter().map(|character_id| PlannedTurn {
        character_id,
        mentioned: trigger.all,
    }));
    turns
}

async fn run_chain(chain: ChainLease, request: ChainRequest) {
    let inner = chain.inner.clone();
    let room_id = chain.room_id.clone();

    let roster = match inner.handler.roster(&room_id).await {
        Ok(roster) => roster,
        Err(error) => {
            tracing::warn!("Could not load roster for {}: {}", room_id, error);
            return;
        }
    };

    let mut queue: VecDeque<PlannedTurn> =
        plan_turns(&roster, &request.trigger, request.proactive, inner.dice.as_ref()).into();
    let mut followups = 0usize;

    while let Some(turn) = queue.pop_front() {
        if !inner.should_continue(&chain) {
            tracing::info!("Chain in {} stopped before {}", room_id, turn.character_id);
            break;
        }
        let Some(member) = roster.members.iter().find(|m| m.id == turn.character_id) else {
            continue;
        };

        if !turn.mentioned && !request.proactive && inner.dice.chance(roster.skip_rate) {
            tracing::debug!("{} skips this round in {}", member.name, room_id);
            continue;
        }

        let jealous = member.sys_jealousy
            && roster.jealousy_chance > 0.0
            && match inner.handler.favors_other(&room_id, &member.id).await {
                Ok(favors) => favors && inner.dice.chance(roster.jealousy_chance),
                Err(error) => {
                    tracing::warn!("Jealousy check for {} failed: {}", member.id, error);
                    false
                }
            };

        inner.set_typing(&chain, &member.id, true);
        let result = inner
            .handler
            .take_turn(TurnRequest {
                room_id: room_id.clone(),
                character_id: member.id.clone(),
                mentioned: turn.mentioned,
                jealous,
                proactive: request.proactive,
            })
            .await;
        inner.set_typing(&chain, &member.id, false);

        let reply = match result {
            Ok(outcome) => outcome.reply,
            Err(error) => {
                tracing::warn!("Turn for {} in {} failed: {}", member.id, room_id, error);
                continue;
            }
        };

        if roster.no_chain || followups >= inner.settings.max_followups {
            continue;
        }
        let Some(reply) = reply else {
            continue;
        };
        let others: Vec<(String, String)> = roster
            .members
            .iter()
            .filter(|m| !m.is_blocked && m.id != member.id)
            .map(|m| (m.id.clone(), m.name.clone()))
            .collect();
        for id in parse_mentions(&reply, &others).ids {
            if followups >= inner.settings.max_followups {
                break;
            }
            // Already waiting for a turn
            if queue.iter().any(|t| t.character_id == id) {
                continue;
            }
            tracing::debug!("{} pulls {} into the conversation", member.name, id);
            queue.push_back(PlannedTurn {
                character_id: id,
                mentioned: true,
            });
            followups += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FixedDice;
    use std::sync::atomic::AtomicUsize;

    struct FakeRoom {
        roster: Mutex<RoomRoster>,
        turns: Mutex<Vec<TurnRequest>>,
        replies: Mutex<HashMap<String, String>>,
        typing_events: Mutex<Vec<Vec<String>>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        turn_time: Duration,
        favored_elsewhere: bool,
        failing: Mutex<Vec<String>>,
    }

    impl FakeRoom {
        fn new(ids: &[&str], turn_time: Duration) -> Arc<Self> {
            let members = ids
                .iter()
                .map(|id| RosterMember {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    is_blocked: false,
                    sys_jealousy: true,
                })
                .collect();
            Arc::new(Self {
                roster: Mutex::new(RoomRoster {
                    members,
                    no_chain: false,
                    skip_rate: 0.0,
                    jealousy_chance: 0.0,
                }),
                turns: Mutex::new(Vec::new()),
                replies: Mutex::new(HashMap::new()),
                typing_events: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                turn_time,
                favored_elsewhere: false,
                failing: Mutex::new(Vec::new()),
            })
        }

        fn speakers(&self) -> Vec<String> {
            self.turns
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.character_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ChainHandler for FakeRoom {
        async fn roster(&self, _room_id: &str) -> Result<RoomRoster> {
            Ok(self.roster.lock().unwrap().clone())
        }

        async fn favors_other(&self, _room_id: &str, _character_id: &str) -> Result<bool> {
            Ok(self.favored_elsewhere)
        }

        async fn take_turn(&self, turn: TurnRequest) -> Result<TurnOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.turn_time).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.failing.lock().unwrap().contains(&turn.character_id) {
                return Err(anyhow::anyhow!("model unavailable for {}", turn.character_id));
            }
            let reply = self.replies.lock().unwrap().get(&turn.character_id).cloned();
            self.turns.lock().unwrap().push(turn);
            Ok(TurnOutcome {
                reply: Some(reply.unwrap_or_else(|| "ok".to_string())),
            })
        }

        fn typing_changed(&self, _room_id: &str, character_ids: &[String]) {
            self.typing_events.lock().unwrap().push(character_ids.to_vec());
        }
    }

    fn orchestrator(room: Arc<FakeRoom>) -> GroupOrchestrator {
        GroupOrchestrator::new(room, Arc::new(FixedDice::default()), OrchestratorSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_messages_collapse_into_one_chain() {
        let room = FakeRoom::new(&["a", "b"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        for _ in 0..5 {
            assert_eq!(groups.on_message("g", MessageTrigger::plain()), TriggerOutcome::Debouncing);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(groups.phase("g"), RoomPhase::Debouncing);
        assert_eq!(groups.chains_started("g"), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(groups.chains_started("g"), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(groups.phase("g"), RoomPhase::Idle);
        assert_eq!(room.speakers(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn mention_bypasses_debounce_and_goes_first() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::plain());
        assert_eq!(
            groups.on_message("g", MessageTrigger::mentioning(["c"])),
            TriggerOutcome::Started
        );
        assert_eq!(groups.phase("g"), RoomPhase::Replying);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let turns = room.turns.lock().unwrap().clone();
        assert_eq!(turns[0].character_id, "c");
        assert!(turns[0].mentioned);
        assert!(!turns[1].mentioned);
        assert_eq!(groups.chains_started("g"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn chains_never_overlap() {
        let room = FakeRoom::new(&["a", "b"], Duration::from_secs(2));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::everyone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(groups.on_message("g", MessageTrigger::plain()), TriggerOutcome::Deferred);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(room.max_active.load(Ordering::SeqCst), 1);
        // The deferred message ran as its own chain after the first one
        assert_eq!(groups.chains_started("g"), 2);
        assert_eq!(room.speakers().len(), 4);
        assert_eq!(groups.phase("g"), RoomPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_remaining_turns_and_drops_pending() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(10));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::everyone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        groups.on_message("g", MessageTrigger::plain());
        assert!(groups.interrupt("g"));
        assert!(groups.interrupt("g"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(room.speakers(), vec!["a".to_string()]);
        assert_eq!(groups.chains_started("g"), 1);
        assert_eq!(groups.phase("g"), RoomPhase::Idle);
        assert!(!groups.interrupt("g"));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupting_mention_takes_over() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(10));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::everyone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            groups.on_message("g", MessageTrigger::mentioning(["c"])),
            TriggerOutcome::Interrupted
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        let speakers = room.speakers();
        assert_eq!(speakers[0], "a");
        assert_eq!(speakers[1], "c");
        assert_eq!(groups.chains_started("g"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_starts_as_soon_as_the_interrupted_turn_ends() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(10));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::everyone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        groups.on_message("g", MessageTrigger::mentioning(["c"]));

        // a's turn ends at +10s; the mention must not wait another debounce
        tokio::time::sleep(Duration::from_millis(9500)).await;
        assert_eq!(groups.chains_started("g"), 2);
        assert_eq!(groups.phase("g"), RoomPhase::Replying);
        assert_eq!(groups.typing("g"), vec!["c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn mention_during_short_pause_waits_only_for_the_pause() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        groups.pause("g", Some(Duration::from_secs(1)));
        assert_eq!(
            groups.on_message("g", MessageTrigger::mentioning(["a"])),
            TriggerOutcome::Paused
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(groups.chains_started("g"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_pause_is_capped() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        let paused = groups.pause("g", Some(Duration::from_secs(u64::MAX)));
        assert_eq!(paused, MAX_PAUSE);
        assert!(groups.is_paused("g"));
        assert!(groups.resume("g"));
        assert!(!groups.is_paused("g"));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_proactive_interval_is_capped() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        assert!(groups.arm_proactive("g", 1e18, f64::INFINITY));
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(room.turns.lock().unwrap().is_empty());
        assert!(groups.cancel_proactive("g"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_turn_is_skipped_and_the_chain_continues() {
        let room = FakeRoom::new(&["a", "b"], Duration::from_secs(1));
        room.failing.lock().unwrap().push("a".to_string());
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::mentioning(["a", "b"]));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(room.speakers(), vec!["b".to_string()]);
        assert_eq!(groups.phase("g"), RoomPhase::Idle);
        assert!(groups.typing("g").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_blocks_chains_until_it_expires() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        groups.pause("g", None);
        assert_eq!(
            groups.on_message("g", MessageTrigger::mentioning(["a"])),
            TriggerOutcome::Paused
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(groups.chains_started("g"), 0);
        assert!(groups.is_paused("g"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(groups.chains_started("g"), 1);
        assert!(room.turns.lock().unwrap()[0].mentioned);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_lifts_the_pause_early() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        groups.pause("g", Some(Duration::from_secs(600)));
        groups.on_message("g", MessageTrigger::plain());
        assert!(groups.resume("g"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(groups.chains_started("g"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replies_pull_in_mentioned_members_unless_no_chain() {
        let room = FakeRoom::new(&["a", "b"], Duration::from_secs(1));
        room.replies
            .lock()
            .unwrap()
            .insert("b".to_string(), "what do you think @A?".to_string());
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::mentioning(["b"]));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(
            room.speakers(),
            vec!["b".to_string(), "a".to_string()]
        );

        room.turns.lock().unwrap().clear();
        room.replies
            .lock()
            .unwrap()
            .insert("a".to_string(), "@B go on".to_string());
        groups.on_message("g", MessageTrigger::mentioning(["a"]));
        tokio::time::sleep(Duration::from_secs(20)).await;
        // b was already queued; the back-and-forth stops after three follow-ups
        assert_eq!(
            room.speakers(),
            vec!["a", "b", "a", "b", "a"]
        );

        room.turns.lock().unwrap().clear();
        room.roster.lock().unwrap().no_chain = true;
        groups.on_message("g", MessageTrigger::mentioning(["b"]));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(room.speakers(), vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_rate_never_skips_mentioned_members() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(1));
        room.roster.lock().unwrap().skip_rate = 0.5;
        let groups = GroupOrchestrator::new(
            room.clone(),
            Arc::new(FixedDice::always()),
            OrchestratorSettings::default(),
        );

        groups.on_message("g", MessageTrigger::mentioning(["b"]));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(room.speakers(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn proactive_wake_runs_one_turn_and_rearms() {
        let room = FakeRoom::new(&["a", "b"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        assert!(groups.arm_proactive("g", 1.0, 1.0));
        tokio::time::sleep(Duration::from_secs(65)).await;
        let turns = room.turns.lock().unwrap().clone();
        assert_eq!(turns.len(), 1);
        assert!(turns[0].proactive);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(room.turns.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_is_broadcast_and_cleared() {
        let room = FakeRoom::new(&["a"], Duration::from_secs(1));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::mentioning(["a"]));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(groups.typing("g"), vec!["a".to_string()]);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(groups.typing("g").is_empty());
        let events = room.typing_events.lock().unwrap().clone();
        assert_eq!(events, vec![vec!["a".to_string()], Vec::<String>::new()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_chains_and_timers() {
        let room = FakeRoom::new(&["a", "b", "c"], Duration::from_secs(10));
        let groups = orchestrator(room.clone());

        groups.on_message("g", MessageTrigger::everyone());
        groups.on_message("h", MessageTrigger::plain());
        groups.arm_proactive("g", 1.0, 1.0);
        tokio::time::sleep(Duration::from_secs(1)).await;

        groups.shutdown();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(room.turns.lock().unwrap().is_empty());
        assert_eq!(groups.phase("g"), RoomPhase::Idle);
        assert_eq!(groups.on_message("g", MessageTrigger::plain()), TriggerOutcome::Closed);
    }
}
