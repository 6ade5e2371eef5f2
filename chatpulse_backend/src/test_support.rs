//! Deterministic stand-ins for the model, embedder and dice.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::database::Character;
use crate::dice::Dice;
use crate::llm_client::{LanguageModel, Message, ModelEndpoint};
use crate::memory::Embedder;

/// Replays canned replies in order. Once the script runs out it repeats the
/// fallback reply, or fails when there is none.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _endpoint: &ModelEndpoint, messages: Vec<Message>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(messages);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next.or_else(|| self.fallback.clone()) {
            Some(reply) => Ok(reply),
            None => anyhow::bail!("scripted model has no reply left"),
        }
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding backend unavailable")
    }
}

/// `chance` always answers `hit`, `uniform` returns the midpoint, `shuffle`
/// keeps order and `pick` takes the first item.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedDice {
    pub hit: bool,
}

impl FixedDice {
    pub fn always() -> Self {
        Self { hit: true }
    }
}

impl Dice for FixedDice {
    fn chance(&self, probability: f64) -> bool {
        self.hit && probability > 0.0
    }

    fn uniform(&self, low: f64, high: f64) -> f64 {
        if high > low {
            (low + high) / 2.0
        } else {
            low
        }
    }

    fn shuffle(&self, _items: &mut [String]) {}

    fn pick(&self, len: usize) -> Option<usize> {
        (len > 0).then_some(0)
    }
}

pub fn sample_character(id: &str, name: &str) -> Character {
    Character {
        id: id.to_string(),
        name: name.to_string(),
        persona: format!("{} is warm, curious and a little teasing.", name),
        ..Character::default()
    }
}
