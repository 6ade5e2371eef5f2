//! The per-tenant engine: one database, one proactive scheduler, one group
//! orchestrator and one event bus, wired together.

pub mod prompts;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, JealousyBasis, JealousyConfig};
use crate::database::{
    self, Character, GroupRoom, MessageRole, RoomKind, StoredMessage, TenantDatabase, UserProfile,
    USER_ID,
};
use crate::dice::Dice;
use crate::events::{CharacterLiveState, CharacterStatus, EngineEvent, EventBus};
use crate::group::{
    parse_mentions, ChainHandler, GroupOrchestrator, MessageTrigger, OrchestratorSettings,
    RoomRoster, RosterMember, TriggerOutcome, TurnOutcome, TurnRequest,
};
use crate::ledger::{self, LedgerError, RedPacket, RedPacketKind, Transfer};
use crate::llm_client::{LanguageModel, Message, ModelEndpoint};
use crate::memory::{Embedder, MemoryEntry, MemoryService, ScoredMemory};
use crate::scheduler::{ProactiveScheduler, WakeHandler, WakeOutcome, WakeProfile, WeakScheduler};
use crate::tags::{self, AppliedEffects, ParsedReply, TagScope};
use crate::timers::TimerLease;

use prompts::{build_system_prompt, history_messages, render_transcript, PromptContext, PromptMode};

/// Affinity a character restarts at after being unblocked.
pub const UNBLOCK_AFFINITY: i64 = 60;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub debounce: Duration,
    pub pause: Duration,
    pub state_broadcast: Duration,
    pub llm_timeout: Duration,
    pub max_followups: usize,
    /// Extract memories after this many user messages in a room; 0 disables.
    pub memory_extract_every: u32,
    pub memory_search_k: usize,
    pub context_messages: usize,
    pub jealousy: JealousyConfig,
    pub red_packet_grab_chance: f64,
    pub event_capacity: usize,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            debounce: config.debounce(),
            pause: config.pause(),
            state_broadcast: config.state_broadcast_interval(),
            llm_timeout: config.llm_timeout(),
            max_followups: config.max_chain_followups,
            memory_extract_every: config.memory_extract_every,
            memory_search_k: config.memory_search_k,
            context_messages: config.context_messages,
            jealousy: config.jealousy.clone(),
            red_packet_grab_chance: config.red_packet_grab_chance,
            event_capacity: 512,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Everything an engine needs from the outside.
pub struct EngineParts {
    pub db: Arc<TenantDatabase>,
    pub llm: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub dice: Arc<dyn Dice>,
    pub default_endpoint: ModelEndpoint,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectExchange {
    pub user_message: StoredMessage,
    pub reply: Option<StoredMessage>,
    pub effects: AppliedEffects,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupPost {
    pub message: StoredMessage,
    pub outcome: TriggerOutcome,
}

#[derive(Debug, Clone, PartialEq)]
struct ExtractionJob {
    character_id: String,
    room_kind: RoomKind,
    room_id: String,
}

#[derive(Default)]
struct CommittedReply {
    message: Option<StoredMessage>,
    effects: AppliedEffects,
}

pub struct TenantEngine {
    core: Arc<EngineCore>,
    scheduler: ProactiveScheduler,
    groups: GroupOrchestrator,
    extraction_rx: Mutex<Option<flume::Receiver<ExtractionJob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineCore {
    tenant_id: String,
    db: Arc<TenantDatabase>,
    llm: Arc<dyn LanguageModel>,
    memory: MemoryService,
    dice: Arc<dyn Dice>,
    default_endpoint: ModelEndpoint,
    settings: EngineSettings,
    events: EventBus,
    character_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    thinking: Mutex<HashSet<String>>,
    user_messages: Mutex<HashMap<String, u32>>,
    extraction_tx: flume::Sender<ExtractionJob>,
    scheduler: OnceLock<WeakScheduler>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wake_profile(character: &Character) -> WakeProfile {
    WakeProfile {
        interval_min: character.interval_min,
        interval_max: character.interval_max,
        is_blocked: character.is_blocked,
        sys_proactive: character.sys_proactive,
        sys_timer: character.sys_timer,
    }
}

impl TenantEngine {
    pub fn new(tenant_id: &str, parts: EngineParts) -> Arc<Self> {
        let EngineParts {
            db,
            llm,
            embedder,
            dice,
            default_endpoint,
            settings,
        } = parts;
        let (extraction_tx, extraction_rx) = flume::unbounded();
        let memory = MemoryService::new(
            db.clone(),
            llm.clone(),
            embedder,
            default_endpoint.clone(),
            settings.llm_timeout,
        );
        let orchestrator_settings = OrchestratorSettings {
            debounce: settings.debounce,
            default_pause: settings.pause,
            max_followups: settings.max_followups,
        };

        let core = Arc::new(EngineCore {
            tenant_id: tenant_id.to_string(),
            db,
            llm,
            memory,
            dice: dice.clone(),
            default_endpoint,
            events: EventBus::new(settings.event_capacity),
            settings,
            character_locks: Mutex::new(HashMap::new()),
            thinking: Mutex::new(HashSet::new()),
            user_messages: Mutex::new(HashMap::new()),
            extraction_tx,
            scheduler: OnceLock::new(),
            closed: AtomicBool::new(false),
        });

        let scheduler = ProactiveScheduler::new(core.clone(), dice.clone());
        let _ = core.scheduler.set(scheduler.downgrade());
        let groups = GroupOrchestrator::new(core.clone(), dice, orchestrator_settings);

        Arc::new(Self {
            core,
            scheduler,
            groups,
            extraction_rx: Mutex::new(Some(extraction_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.core.tenant_id
    }

    pub fn database(&self) -> &Arc<TenantDatabase> {
        &self.core.db
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    /// Arms every timer and starts the state ticker and memory worker.
    pub fn start(&self) -> Result<()> {
        let characters = self.core.db.list_characters()?;
        let mut armed = 0;
        for character in &characters {
            if !character.is_blocked && self.scheduler.schedule(&character.id, &wake_profile(character)) {
                armed += 1;
            }
        }

        let profile = self.core.db.get_profile()?;
        if profile.group_proactive_enabled {
            for group in self.core.db.list_groups()? {
                self.groups.arm_proactive(
                    &group.id,
                    profile.group_interval_min,
                    profile.group_interval_max,
                );
            }
        }

        let mut tasks = lock(&self.tasks);
        tasks.push(self.spawn_state_ticker());
        if let Some(rx) = lock(&self.extraction_rx).take() {
            tasks.push(spawn_extraction_worker(self.core.clone(), rx));
        }

        tracing::info!(
            "Engine for tenant {} started ({} of {} characters scheduled)",
            self.core.tenant_id,
            armed,
            characters.len()
        );
        Ok(())
    }

    /// Cancels every timer and background task. The engine cannot be restarted.
    pub fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        self.groups.shutdown();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        tracing::info!("Engine for tenant {} shut down", self.core.tenant_id);
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }

    fn spawn_state_ticker(&self) -> JoinHandle<()> {
        let core = self.core.clone();
        let scheduler = self.scheduler.clone();
        let period = core.settings.state_broadcast;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match core.live_state(&scheduler) {
                    Ok(state) => core.events.emit(EngineEvent::EngineState(state)),
                    Err(error) => tracing::warn!("State snapshot failed: {}", error),
                }
            }
        })
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn snapshot_state(&self) -> Result<BTreeMap<String, CharacterLiveState>> {
        self.core.live_state(&self.scheduler)
    }

    // ---- conversations ----

    pub async fn send_direct_message(&self, character_id: &str, content: &str) -> Result<DirectExchange> {
        let content = content.trim();
        if content.is_empty() {
            return Err(anyhow!("message is empty"));
        }
        let character = self.core.require_character(character_id)?;

        let user_message =
            self.core
                .db
                .add_message(RoomKind::Direct, character_id, USER_ID, MessageRole::User, content)?;
        self.core.events.emit(EngineEvent::NewMessage(user_message.clone()));

        if character.pressure_level > 0 {
            self.core
                .db
                .with_transaction(|tx| database::set_pressure(tx, character_id, 0))?;
            self.core.publish_character(character_id);
        }
        self.core
            .note_user_message(RoomKind::Direct, character_id, vec![character_id.to_string()]);

        if character.is_blocked {
            tracing::debug!("{} is blocked; message stored without reply", character_id);
            return Ok(DirectExchange {
                user_message,
                reply: None,
                effects: AppliedEffects::default(),
            });
        }

        let committed = self.core.direct_reply(character_id).await?;
        Ok(DirectExchange {
            user_message,
            reply: committed.message,
            effects: committed.effects,
        })
    }

    /// Stores a user message in a group and hands it to the orchestrator.
    /// `@Name` and `@all` in the text count as mentions too.
    pub fn post_group_message(
        &self,
        room_id: &str,
        content: &str,
        mentions: &[String],
        all: bool,
    ) -> Result<GroupPost> {
        let content = content.trim();
        if content.is_empty() {
            return Err(anyhow!("message is empty"));
        }
        let group = self.core.require_group(room_id)?;
        let members = self.core.member_names(&group)?;

        let message =
            self.core
                .db
                .add_message(RoomKind::Group, room_id, USER_ID, MessageRole::User, content)?;
        self.core.events.emit(EngineEvent::NewMessage(message.clone()));

        let pairs: Vec<(String, String)> = group
            .members
            .iter()
            .filter_map(|id| members.get(id).map(|name| (id.clone(), name.clone())))
            .collect();
        let parsed = parse_mentions(content, &pairs);
        let mut trigger = MessageTrigger {
            mentions: mentions
                .iter()
                .filter(|id| group.members.contains(id))
                .cloned()
                .collect(),
            all: all || parsed.all,
        };
        for id in parsed.ids {
            if !trigger.mentions.contains(&id) {
                trigger.mentions.push(id);
            }
        }

        self.core
            .note_user_message(RoomKind::Group, room_id, group.members.clone());
        let outcome = self.groups.on_message(room_id, trigger);
        tracing::debug!("Group message in {} -> {:?}", room_id, outcome);
        Ok(GroupPost { message, outcome })
    }

    // ---- room control ----

    pub fn pause_room(&self, room_id: &str, duration: Option<Duration>) -> Result<Duration> {
        self.core.require_group(room_id)?;
        Ok(self.groups.pause(room_id, duration))
    }

    pub fn resume_room(&self, room_id: &str) -> Result<bool> {
        self.core.require_group(room_id)?;
        Ok(self.groups.resume(room_id))
    }

    pub fn interrupt_room(&self, room_id: &str) -> Result<bool> {
        self.core.require_group(room_id)?;
        Ok(self.groups.interrupt(room_id))
    }

    pub fn set_no_chain(&self, room_id: &str, no_chain: bool) -> Result<()> {
        if !self.core.db.set_group_no_chain(room_id, no_chain)? {
            return Err(anyhow!("group '{}' not found", room_id));
        }
        Ok(())
    }

    pub fn room_phase(&self, room_id: &str) -> crate::group::RoomPhase {
        self.groups.phase(room_id)
    }

    // ---- characters & groups ----

    pub fn upsert_character(&self, character: &Character) -> Result<Character> {
        let stored = self.core.db.upsert_character(character)?;
        if stored.is_blocked {
            self.scheduler.cancel(&stored.id);
        } else {
            self.scheduler.schedule(&stored.id, &wake_profile(&stored));
        }
        self.core
            .events
            .emit(EngineEvent::CharacterUpdated(CharacterStatus::from(&stored)));
        Ok(stored)
    }

    pub fn block_character(&self, character_id: &str) -> Result<()> {
        if !self.core.db.set_character_blocked(character_id, true)? {
            return Err(anyhow!("character '{}' not found", character_id));
        }
        self.scheduler.cancel(character_id);
        self.core.publish_character(character_id);
        tracing::info!("Blocked {}", character_id);
        Ok(())
    }

    pub fn unblock_character(&self, character_id: &str) -> Result<Character> {
        if !self.core.db.unblock_character(character_id, UNBLOCK_AFFINITY)? {
            return Err(anyhow!("character '{}' not found", character_id));
        }
        let character = self.core.require_character(character_id)?;
        self.scheduler.schedule(character_id, &wake_profile(&character));
        self.core
            .events
            .emit(EngineEvent::CharacterUpdated(CharacterStatus::from(&character)));
        Ok(character)
    }

    pub fn delete_character(&self, character_id: &str) -> Result<bool> {
        self.scheduler.cancel(character_id);
        let removed = self.core.db.delete_character(character_id)?;
        if removed {
            lock(&self.core.character_locks).remove(character_id);
            self.core
                .events
                .emit(EngineEvent::CharacterRemoved(character_id.to_string()));
        }
        Ok(removed)
    }

    pub fn create_group(&self, name: &str, members: &[String]) -> Result<GroupRoom> {
        for id in members {
            self.core.require_character(id)?;
        }
        let group = self.core.db.create_group(name, members)?;
        let profile = self.core.db.get_profile()?;
        if profile.group_proactive_enabled {
            self.groups
                .arm_proactive(&group.id, profile.group_interval_min, profile.group_interval_max);
        }
        Ok(group)
    }

    /// Saves the profile and re-arms or cancels group proactive wakes to match.
    pub fn update_profile(&self, profile: &UserProfile) -> Result<UserProfile> {
        let stored = self.core.db.update_profile(profile)?;
        for group in self.core.db.list_groups()? {
            if stored.group_proactive_enabled {
                self.groups.arm_proactive(
                    &group.id,
                    stored.group_interval_min,
                    stored.group_interval_max,
                );
            } else {
                self.groups.cancel_proactive(&group.id);
            }
        }
        Ok(stored)
    }

    // ---- memories ----

    /// Runs extraction over the character's direct chat right away.
    pub async fn extract_memories(&self, character_id: &str) -> Result<Vec<MemoryEntry>> {
        self.core.require_character(character_id)?;
        self.core
            .run_extraction(&ExtractionJob {
                character_id: character_id.to_string(),
                room_kind: RoomKind::Direct,
                room_id: character_id.to_string(),
            })
            .await
    }

    pub async fn search_memories(&self, character_id: &str, query: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        self.core.memory.search(character_id, query, k).await
    }

    // ---- money ----

    /// The user sends a red packet to a group; members may grab shares over
    /// the next few seconds.
    pub fn send_red_packet(
        &self,
        room_id: &str,
        kind: RedPacketKind,
        count: u32,
        amount: f64,
        note: &str,
    ) -> Result<RedPacket> {
        let group = self.core.require_group(room_id)?;
        let packet = ledger::send_red_packet(&self.core.db, room_id, USER_ID, kind, count, amount, note)?;
        let marker = self.core.db.add_message(
            RoomKind::Group,
            room_id,
            USER_ID,
            MessageRole::User,
            &ledger::red_packet_marker(packet.id),
        )?;
        self.core.events.emit(EngineEvent::NewMessage(marker));

        let mut grabbers: Vec<String> = Vec::new();
        for id in &group.members {
            if let Some(character) = self.core.db.get_character(id)? {
                if !character.is_blocked && self.core.dice.chance(self.core.settings.red_packet_grab_chance) {
                    grabbers.push(character.id);
                }
            }
        }
        self.core.dice.shuffle(&mut grabbers);
        if !grabbers.is_empty() {
            let core = self.core.clone();
            let packet_id = packet.id;
            let room = room_id.to_string();
            self.track(tokio::spawn(async move {
                core.grab_red_packet(&room, packet_id, grabbers).await;
            }));
        }
        Ok(packet)
    }

    pub fn claim_red_packet(&self, packet_id: i64) -> Result<(RedPacket, f64)> {
        let (packet, amount) =
            ledger::claim_red_packet(&self.core.db, packet_id, USER_ID, self.core.dice.as_ref())?;
        self.core.events.emit(EngineEvent::RedPacketClaimed {
            packet_id,
            claimer_id: USER_ID.to_string(),
            amount,
        });
        Ok((packet, amount))
    }

    /// The user sends money to a character in their direct chat.
    pub fn send_transfer(&self, character_id: &str, amount: f64, note: &str) -> Result<Transfer> {
        self.core.require_character(character_id)?;
        let transfer = ledger::send_transfer(
            &self.core.db,
            USER_ID,
            character_id,
            character_id,
            amount,
            note,
        )?;
        let marker = self.core.db.add_message(
            RoomKind::Direct,
            character_id,
            USER_ID,
            MessageRole::User,
            &ledger::transfer_marker(&transfer),
        )?;
        self.core.events.emit(EngineEvent::NewMessage(marker));
        Ok(transfer)
    }

    /// Accepts a character's transfer into the user's wallet.
    pub fn claim_transfer(&self, transfer_id: i64) -> Result<Transfer> {
        Ok(ledger::claim_transfer(&self.core.db, transfer_id, USER_ID)?)
    }

    pub fn refund_transfer(&self, transfer_id: i64) -> Result<Transfer> {
        let transfer = ledger::refund_transfer(&self.core.db, transfer_id)?;
        if transfer.sender_id != USER_ID {
            self.core.publish_character(&transfer.sender_id);
        }
        Ok(transfer)
    }
}

impl Drop for TenantEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_extraction_worker(core: Arc<EngineCore>, rx: flume::Receiver<ExtractionJob>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(job) = rx.recv_async().await {
            if let Err(error) = core.run_extraction(&job).await {
                tracing::warn!(
                    "Memory extraction for {} in {} failed: {}",
                    job.character_id,
                    job.room_id,
                    error
                );
            }
        }
    })
}

/// Marks a character as thinking for as long as it lives.
struct ThinkingGuard<'a> {
    core: &'a EngineCore,
    character_id: String,
}

impl<'a> ThinkingGuard<'a> {
    fn new(core: &'a EngineCore, character_id: &str) -> Self {
        lock(&core.thinking).insert(character_id.to_string());
        Self {
            core,
            character_id: character_id.to_string(),
        }
    }
}

impl Drop for ThinkingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.core.thinking).remove(&self.character_id);
    }
}

impl EngineCore {
    fn require_character(&self, id: &str) -> Result<Character> {
        self.db
            .get_character(id)?
            .ok_or_else(|| anyhow!("character '{}' not found", id))
    }

    fn require_group(&self, id: &str) -> Result<GroupRoom> {
        self.db
            .get_group(id)?
            .ok_or_else(|| anyhow!("group '{}' not found", id))
    }

    fn member_names(&self, group: &GroupRoom) -> Result<HashMap<String, String>> {
        let mut names = HashMap::new();
        for id in &group.members {
            if let Some(character) = self.db.get_character(id)? {
                names.insert(character.id, character.name);
            }
        }
        Ok(names)
    }

    fn character_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.character_locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    fn live_state(&self, scheduler: &ProactiveScheduler) -> Result<BTreeMap<String, CharacterLiveState>> {
        let thinking = lock(&self.thinking).clone();
        let state = self
            .db
            .list_characters()?
            .into_iter()
            .map(|character| {
                let timer = scheduler.state(&character.id);
                let live = CharacterLiveState {
                    countdown_ms: timer
                        .map(|t| t.countdown.as_millis().min(u128::from(u64::MAX)) as u64)
                        .unwrap_or(0),
                    is_thinking: timer.map(|t| t.is_thinking).unwrap_or(false)
                        || thinking.contains(&character.id),
                    is_blocked: character.is_blocked,
                };
                (character.id, live)
            })
            .collect();
        Ok(state)
    }

    fn publish_character(&self, id: &str) {
        match self.db.get_character(id) {
            Ok(Some(character)) => self
                .events
                .emit(EngineEvent::CharacterUpdated(CharacterStatus::from(&character))),
            Ok(None) => {}
            Err(error) => tracing::warn!("Could not reload {}: {}", id, error),
        }
    }

    fn apply_timer_override(&self, character_id: &str, minutes: f64) {
        if let Some(scheduler) = self.scheduler.get().and_then(WeakScheduler::upgrade) {
            scheduler.schedule_in_minutes(character_id, minutes);
        }
    }

    /// Counts user messages per room and queues extraction every N of them.
    fn note_user_message(&self, room_kind: RoomKind, room_id: &str, character_ids: Vec<String>) {
        let every = self.settings.memory_extract_every;
        if every == 0 {
            return;
        }
        let key = format!("{:?}:{}", room_kind, room_id);
        let due = {
            let mut counts = lock(&self.user_messages);
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count % every == 0
        };
        if !due {
            return;
        }
        for character_id in character_ids {
            let job = ExtractionJob {
                character_id,
                room_kind,
                room_id: room_id.to_string(),
            };
            if self.extraction_tx.send(job).is_err() {
                tracing::debug!("Extraction worker is gone; skipping");
                return;
            }
        }
    }

    async fn run_extraction(&self, job: &ExtractionJob) -> Result<Vec<MemoryEntry>> {
        let Some(character) = self.db.get_character(&job.character_id)? else {
            return Ok(Vec::new());
        };
        let profile = self.db.get_profile()?;
        let history = self.db.recent_messages(
            job.room_kind,
            &job.room_id,
            self.settings.context_messages,
            false,
        )?;
        let names: HashMap<String, String> = self
            .db
            .list_characters()?
            .into_iter()
            .map(|c| (c.id, c.name))
            .collect();
        let transcript = render_transcript(&history, &names, &profile.name);

        let stored = self.memory.extract(&character, &transcript).await?;
        if !stored.is_empty() {
            self.events.emit(EngineEvent::MemoriesStored {
                character_id: character.id.clone(),
                count: stored.len(),
            });
        }
        Ok(stored)
    }

    async fn recall(&self, character_id: &str, query: Option<&str>) -> Vec<ScoredMemory> {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return Vec::new();
        };
        match self
            .memory
            .search(character_id, query, self.settings.memory_search_k)
            .await
        {
            Ok(hits) => hits,
            Err(error) => {
                tracing::warn!("Memory recall for {} failed: {}", character_id, error);
                Vec::new()
            }
        }
    }

    async fn complete(&self, character: &Character, messages: Vec<Message>) -> Result<String> {
        let endpoint = character.chat_endpoint(&self.default_endpoint);
        tokio::time::timeout(self.settings.llm_timeout, self.llm.complete(&endpoint, messages))
            .await
            .map_err(|_| {
                anyhow!(
                    "model call for {} timed out after {:?}",
                    character.id,
                    self.settings.llm_timeout
                )
            })?
            .with_context(|| format!("model call for {} failed", character.id))
    }

    /// Writes the reply and applies its tags in one transaction.
    fn commit_reply(
        &self,
        character: &Character,
        room_kind: RoomKind,
        room_id: &str,
        parsed: &ParsedReply,
        bump_pressure: bool,
    ) -> Result<CommittedReply> {
        self.db.with_transaction(|tx| {
            if bump_pressure {
                database::set_pressure(tx, &character.id, character.pressure_level + 1)?;
            }
            let message = if parsed.display_text.is_empty() {
                None
            } else {
                Some(database::insert_message(
                    tx,
                    room_kind,
                    room_id,
                    &character.id,
                    MessageRole::Character,
                    &parsed.display_text,
                )?)
            };
            let effects = tags::apply(
                tx,
                TagScope {
                    character,
                    room_kind,
                    room_id,
                },
                &parsed.tags,
            )?;
            Ok(CommittedReply { message, effects })
        })
    }

    fn publish(&self, character_id: &str, committed: &CommittedReply, bumped_pressure: bool) {
        if let Some(message) = &committed.message {
            self.events.emit(EngineEvent::NewMessage(message.clone()));
        }
        for marker in &committed.effects.messages {
            self.events.emit(EngineEvent::NewMessage(marker.clone()));
        }
        for moment_id in &committed.effects.moments {
            self.events.emit(EngineEvent::MomentPosted {
                moment_id: *moment_id,
                author_id: character_id.to_string(),
            });
        }
        if bumped_pressure || committed.effects.changed_character() {
            self.publish_character(character_id);
        }
    }

    async fn direct_reply(&self, character_id: &str) -> Result<CommittedReply> {
        let guard_lock = self.character_lock(character_id);
        let _serial = guard_lock.lock().await;
        let _thinking = ThinkingGuard::new(self, character_id);

        let character = self.require_character(character_id)?;
        let profile = self.db.get_profile()?;
        let history = self.db.recent_messages(
            RoomKind::Direct,
            character_id,
            self.settings.context_messages,
            false,
        )?;
        let query = last_user_text(&history);
        let memories = self.recall(character_id, query.as_deref()).await;

        let mut messages = vec![Message::system(build_system_prompt(&PromptContext {
            character: &character,
            profile: &profile,
            memories: &memories,
            mode: PromptMode::Direct,
            now: Local::now(),
        }))];
        messages.extend(history_messages(&history, &character, &HashMap::new(), &profile.name, false));

        // The user's message is already stored; a failed model call only
        // costs the reply.
        let raw = match self.complete(&character, messages).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!("No direct reply from {}: {:#}", character_id, error);
                self.events.emit(EngineEvent::Error(format!(
                    "{} could not reply: {}",
                    character.name, error
                )));
                return Ok(CommittedReply::default());
            }
        };
        let parsed = tags::parse(&raw);
        let committed = self.commit_reply(&character, RoomKind::Direct, character_id, &parsed, false)?;
        self.publish(character_id, &committed, false);
        if let Some(minutes) = committed.effects.timer_override {
            self.apply_timer_override(character_id, minutes);
        }
        Ok(committed)
    }

    async fn proactive_message(&self, lease: &TimerLease<String>) -> Result<WakeOutcome> {
        let character_id = lease.key().clone();
        let guard_lock = self.character_lock(&character_id);
        let _serial = guard_lock.lock().await;

        let Some(character) = self.db.get_character(&character_id)? else {
            return Ok(WakeOutcome::Silent);
        };
        let awaiting_reply = self.db.awaiting_user_reply(&character_id)?;
        let bump_pressure = awaiting_reply && character.sys_pressure;

        let mut prompt_character = character.clone();
        if bump_pressure {
            prompt_character.pressure_level += 1;
        }
        let profile = self.db.get_profile()?;
        let history = self.db.recent_messages(
            RoomKind::Direct,
            &character_id,
            self.settings.context_messages,
            false,
        )?;
        let query = last_user_text(&history);
        let memories = self.recall(&character_id, query.as_deref()).await;

        let mut messages = vec![Message::system(build_system_prompt(&PromptContext {
            character: &prompt_character,
            profile: &profile,
            memories: &memories,
            mode: PromptMode::Proactive { awaiting_reply },
            now: Local::now(),
        }))];
        messages.extend(history_messages(&history, &character, &HashMap::new(), &profile.name, false));
        messages.push(Message::user(format!("({} has not written anything new.)", profile.name)));

        let raw = self.complete(&character, messages).await?;
        let parsed = tags::parse(&raw);
        if parsed.display_text.is_empty() && parsed.tags.is_empty() {
            return Ok(WakeOutcome::Silent);
        }

        let committed = match lease.commit(|| {
            self.commit_reply(&character, RoomKind::Direct, &character_id, &parsed, bump_pressure)
        }) {
            Some(result) => result?,
            None => return Ok(WakeOutcome::Superseded),
        };
        self.publish(&character_id, &committed, bump_pressure);
        tracing::info!("{} sent a proactive message", character.name);
        Ok(WakeOutcome::Delivered {
            next_wake_minutes: committed.effects.timer_override,
        })
    }

    async fn group_turn(&self, turn: TurnRequest) -> Result<TurnOutcome> {
        let guard_lock = self.character_lock(&turn.character_id);
        let _serial = guard_lock.lock().await;
        let _thinking = ThinkingGuard::new(self, &turn.character_id);

        let Some(character) = self.db.get_character(&turn.character_id)? else {
            return Ok(TurnOutcome::default());
        };
        if character.is_blocked {
            return Ok(TurnOutcome::default());
        }
        let group = self.require_group(&turn.room_id)?;
        let profile = self.db.get_profile()?;
        let names = self.member_names(&group)?;
        let history = self.db.recent_messages(
            RoomKind::Group,
            &turn.room_id,
            profile.group_msg_limit as usize,
            false,
        )?;
        let query = last_user_text(&history);
        let memories = self.recall(&character.id, query.as_deref()).await;

        let member_names: Vec<String> = group
            .members
            .iter()
            .filter(|id| **id != character.id)
            .filter_map(|id| names.get(id).cloned())
            .collect();
        let mut messages = vec![Message::system(build_system_prompt(&PromptContext {
            character: &character,
            profile: &profile,
            memories: &memories,
            mode: PromptMode::Group {
                room_name: group.name.clone(),
                member_names,
                mentioned: turn.mentioned,
                jealous: turn.jealous,
                proactive: turn.proactive,
            },
            now: Local::now(),
        }))];
        messages.extend(history_messages(&history, &character, &names, &profile.name, true));
        if messages.last().map(|m| m.role != "user").unwrap_or(true) {
            messages.push(Message::user("(The room is waiting for you to speak.)"));
        }

        let raw = self.complete(&character, messages).await?;
        let parsed = tags::parse(&raw);
        let committed = self.commit_reply(&character, RoomKind::Group, &turn.room_id, &parsed, false)?;
        self.publish(&character.id, &committed, false);
        if let Some(minutes) = committed.effects.timer_override {
            self.apply_timer_override(&character.id, minutes);
        }
        Ok(TurnOutcome {
            reply: committed.message.map(|m| m.content),
        })
    }

    /// Whether the user's attention recently went to another member.
    fn user_favors_other(&self, room_id: &str, character_id: &str) -> Result<bool> {
        let group = self.require_group(room_id)?;
        match self.settings.jealousy.basis {
            JealousyBasis::Mentions => {
                let names = self.member_names(&group)?;
                let pairs: Vec<(String, String)> = names.into_iter().collect();
                let window = self.settings.jealousy.window_messages.max(1);
                let mentioned: Vec<String> = self
                    .db
                    .recent_messages(RoomKind::Group, room_id, window, false)?
                    .iter()
                    .filter(|m| m.sender_id == USER_ID)
                    .flat_map(|m| parse_mentions(&m.content, &pairs).ids)
                    .collect();
                Ok(!mentioned.is_empty() && !mentioned.iter().any(|id| id == character_id))
            }
            JealousyBasis::DirectActivity => {
                let activity = self.db.last_direct_activity()?;
                let own = activity.get(character_id).copied().unwrap_or(i64::MIN);
                Ok(group
                    .members
                    .iter()
                    .filter(|id| id.as_str() != character_id)
                    .filter_map(|id| activity.get(id))
                    .any(|ts| *ts > own))
            }
        }
    }

    async fn grab_red_packet(&self, room_id: &str, packet_id: i64, grabbers: Vec<String>) {
        for character_id in grabbers {
            let delay = self.dice.uniform(1.0, 6.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;

            match ledger::claim_red_packet(&self.db, packet_id, &character_id, self.dice.as_ref()) {
                Ok((_, amount)) => {
                    let name = self
                        .db
                        .get_character(&character_id)
                        .ok()
                        .flatten()
                        .map(|c| c.name)
                        .unwrap_or_else(|| character_id.clone());
                    match self.db.add_message(
                        RoomKind::Group,
                        room_id,
                        &character_id,
                        MessageRole::System,
                        &format!("{} grabbed {:.2} from the red packet", name, amount),
                    ) {
                        Ok(message) => self.events.emit(EngineEvent::NewMessage(message)),
                        Err(error) => tracing::warn!("Could not announce red packet claim: {}", error),
                    }
                    self.events.emit(EngineEvent::RedPacketClaimed {
                        packet_id,
                        claimer_id: character_id.clone(),
                        amount,
                    });
                    self.publish_character(&character_id);
                }
                Err(LedgerError::Exhausted(_)) => break,
                Err(error) => tracing::debug!("{} could not grab packet {}: {}", character_id, packet_id, error),
            }
        }
    }
}

fn last_user_text(history: &[StoredMessage]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|m| m.sender_id == USER_ID && !m.content.starts_with('['))
        .map(|m| m.content.clone())
}

#[async_trait]
impl WakeHandler for EngineCore {
    async fn wake_profile(&self, character_id: &str) -> Result<Option<WakeProfile>> {
        Ok(self.db.get_character(character_id)?.map(|c| wake_profile(&c)))
    }

    async fn wake(&self, lease: &TimerLease<String>) -> Result<WakeOutcome> {
        self.proactive_message(lease).await
    }
}

#[async_trait]
impl ChainHandler for EngineCore {
    async fn roster(&self, room_id: &str) -> Result<RoomRoster> {
        let group = self.require_group(room_id)?;
        let profile = self.db.get_profile()?;
        let mut members = Vec::with_capacity(group.members.len());
        for id in &group.members {
            if let Some(character) = self.db.get_character(id)? {
                members.push(RosterMember {
                    id: character.id,
                    name: character.name,
                    is_blocked: character.is_blocked,
                    sys_jealousy: character.sys_jealousy,
                });
            }
        }
        Ok(RoomRoster {
            members,
            no_chain: group.no_chain,
            skip_rate: profile.group_skip_rate,
            jealousy_chance: profile.jealousy_chance,
        })
    }

    async fn favors_other(&self, room_id: &str, character_id: &str) -> Result<bool> {
        self.user_favors_other(room_id, character_id)
    }

    async fn take_turn(&self, turn: TurnRequest) -> Result<TurnOutcome> {
        self.group_turn(turn).await
    }

    fn typing_changed(&self, room_id: &str, character_ids: &[String]) {
        self.events.emit(EngineEvent::Typing {
            room_id: room_id.to_string(),
            character_ids: character_ids.to_vec(),
        });
    }
}
