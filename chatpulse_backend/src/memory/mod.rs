pub mod embedder;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::database::{Character, TenantDatabase};
use crate::llm_client::{parse_json_reply, LanguageModel, Message, ModelEndpoint};

pub use embedder::{Embedder, HashingEmbedder, HttpEmbedder, VECTOR_DIM};

/// Cosine similarity at or above which a new memory counts as a duplicate.
pub const DUPLICATE_SIMILARITY: f32 = 0.95;

/// A structured fact a character remembers about its conversations.
/// Entries are immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub character_id: String,
    pub event: String,
    pub time: String,
    pub location: String,
    pub people: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
}

impl MemoryEntry {
    /// One-line rendering used in prompts.
    pub fn summary_line(&self) -> String {
        let mut line = self.event.clone();
        let details: Vec<&str> = [self.time.as_str(), self.location.as_str(), self.people.as_str()]
            .into_iter()
            .filter(|d| !d.trim().is_empty())
            .collect();
        if !details.is_empty() {
            line.push_str(" (");
            line.push_str(&details.join("; "));
            line.push(')');
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub entry: MemoryEntry,
    pub score: f32,
}

/// One record as the extraction model returns it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MemoryRecord {
    #[serde(default, deserialize_with = "text_or_list")]
    pub event: String,
    #[serde(default, deserialize_with = "text_or_list")]
    pub time: String,
    #[serde(default, deserialize_with = "text_or_list")]
    pub location: String,
    #[serde(default, deserialize_with = "text_or_list")]
    pub people: String,
}

impl MemoryRecord {
    fn embedding_text(&self) -> String {
        [&self.event, &self.time, &self.location, &self.people]
            .into_iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

fn text_or_list<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordsPayload {
    List(Vec<MemoryRecord>),
    Wrapped { memories: Vec<MemoryRecord> },
}

/// Parses the extraction reply. Accepts a bare array or `{"memories": [...]}`
/// and drops records without an event.
pub fn parse_memory_records(raw: &str) -> Result<Vec<MemoryRecord>> {
    let payload: RecordsPayload = parse_json_reply(raw)?;
    let records = match payload {
        RecordsPayload::List(records) => records,
        RecordsPayload::Wrapped { memories } => memories,
    };
    Ok(records
        .into_iter()
        .filter(|r| !r.event.trim().is_empty())
        .collect())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom == 0.0 {
        return 0.0;
    }
    dot / denom
}

/// Top `k` entries by similarity to `query`; equal scores prefer the most
/// recent entry. Entries whose score is NaN are dropped.
pub fn rank_memories(query: &[f32], entries: Vec<MemoryEntry>, k: usize) -> Vec<ScoredMemory> {
    let mut scored: Vec<ScoredMemory> = entries
        .into_iter()
        .filter(|entry| entry.embedding.len() == query.len())
        .map(|entry| ScoredMemory {
            score: cosine_similarity(query, &entry.embedding),
            entry,
        })
        .filter(|scored| !scored.score.is_nan())
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
    });
    scored.truncate(k);
    scored
}

pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

const EXTRACTION_PROMPT: &str = "You maintain the long-term memory of a chat persona. \
Read the conversation and list new facts worth remembering about the user, \
shared experiences, plans and promises. Ignore small talk. \
Respond with JSON only: an array of objects with the string fields \
\"event\", \"time\", \"location\" and \"people\". Use \"\" for unknown fields \
and [] when nothing is worth remembering.";

pub struct MemoryService {
    db: Arc<TenantDatabase>,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    fallback_endpoint: ModelEndpoint,
    timeout: Duration,
}

impl MemoryService {
    pub fn new(
        db: Arc<TenantDatabase>,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        fallback_endpoint: ModelEndpoint,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            llm,
            embedder,
            fallback_endpoint,
            timeout,
        }
    }

    /// Extracts memories from a rendered transcript and stores the ones that
    /// are not near-duplicates of what the character already remembers.
    pub async fn extract(&self, character: &Character, transcript: &str) -> Result<Vec<MemoryEntry>> {
        if transcript.trim().is_empty() {
            return Ok(Vec::new());
        }

        let endpoint = character.memory_endpoint(&self.fallback_endpoint);
        let messages = vec![
            Message::system(EXTRACTION_PROMPT),
            Message::user(format!(
                "Persona: {}\n\nConversation:\n{}",
                character.name, transcript
            )),
        ];
        let raw = tokio::time::timeout(self.timeout, self.llm.complete(&endpoint, messages))
            .await
            .map_err(|_| anyhow::anyhow!("memory extraction timed out after {:?}", self.timeout))?
            .context("memory extraction call failed")?;
        let records = parse_memory_records(&raw)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut known: Vec<Vec<f32>> = self
            .db
            .list_memories(&character.id)?
            .into_iter()
            .map(|m| m.embedding)
            .collect();
        let mut stored = Vec::new();

        for record in records {
            let embedding = match self.embedder.embed(&record.embedding_text()).await {
                Ok(vector) => vector,
                Err(error) => {
                    tracing::warn!(
                        "Embedding failed for memory of {}; keeping {} stored so far: {}",
                        character.id,
                        stored.len(),
                        error
                    );
                    break;
                }
            };

            if known
                .iter()
                .any(|existing| cosine_similarity(existing, &embedding) >= DUPLICATE_SIMILARITY)
            {
                tracing::debug!("Skipping duplicate memory for {}: {}", character.id, record.event);
                continue;
            }

            let entry = MemoryEntry {
                id: uuid::Uuid::new_v4().to_string(),
                character_id: character.id.clone(),
                event: record.event,
                time: record.time,
                location: record.location,
                people: record.people,
                created_at: Utc::now(),
                embedding,
            };
            self.db.insert_memory(&entry)?;
            known.push(entry.embedding.clone());
            stored.push(entry);
        }

        tracing::info!("Stored {} new memories for {}", stored.len(), character.id);
        Ok(stored)
    }

    /// Nearest memories to `query`. An embedding failure yields an empty list.
    pub async fn search(&self, character_id: &str, query: &str, k: usize) -> Result<Vec<ScoredMemory>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(error) => {
                tracing::warn!("Memory search for {} skipped: {}", character_id, error);
                return Ok(Vec::new());
            }
        };
        let entries = self.db.list_memories(character_id)?;
        Ok(rank_memories(&query_vector, entries, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_character, FailingEmbedder, ScriptedModel};
    use chrono::Duration as ChronoDuration;

    fn entry(id: &str, embedding: Vec<f32>, age_minutes: i64) -> MemoryEntry {
        MemoryEntry {
            id: id.to_string(),
            character_id: "mika".to_string(),
            event: format!("event {}", id),
            time: String::new(),
            location: String::new(),
            people: String::new(),
            created_at: Utc::now() - ChronoDuration::minutes(age_minutes),
            embedding,
        }
    }

    fn service(db: Arc<TenantDatabase>, model: Arc<ScriptedModel>, embedder: Arc<dyn Embedder>) -> MemoryService {
        MemoryService::new(
            db,
            model,
            embedder,
            ModelEndpoint {
                api_url: "http://llm".to_string(),
                api_key: None,
                model: "test".to_string(),
                max_tokens: 800,
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn rank_orders_by_similarity_then_recency() {
        let query = vec![1.0, 0.0];
        let ranked = rank_memories(
            &query,
            vec![
                entry("orthogonal", vec![0.0, 1.0], 0),
                entry("old_match", vec![1.0, 0.0], 60),
                entry("new_match", vec![2.0, 0.0], 1),
                entry("partial", vec![1.0, 1.0], 0),
                entry("wrong_dim", vec![1.0, 0.0, 0.0], 0),
            ],
            3,
        );

        let ids: Vec<&str> = ranked.iter().map(|m| m.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["new_match", "old_match", "partial"]);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn nan_embeddings_never_outrank_real_matches() {
        let query = vec![1.0, 0.0];
        let ranked = rank_memories(
            &query,
            vec![
                entry("corrupt", vec![f32::NAN, 0.0], 0),
                entry("match", vec![1.0, 0.0], 5),
                entry("partial", vec![1.0, 1.0], 0),
            ],
            5,
        );

        let ids: Vec<&str> = ranked.iter().map(|m| m.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["match", "partial"]);
    }

    #[test]
    fn embeddings_survive_blob_encoding() {
        let vector = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&vector)), vector);
    }

    #[test]
    fn parse_records_accepts_wrapped_and_list_people() {
        let raw = r#"```json
        {"memories": [
            {"event": "Adopted a cat named Miso", "time": "last week", "people": ["user", "Miso"]},
            {"event": "   ", "time": "never"}
        ]}
        ```"#;
        let records = parse_memory_records(raw).expect("parse");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].people, "user, Miso");
        assert_eq!(records[0].location, "");
    }

    #[tokio::test]
    async fn extract_stores_records_and_drops_duplicates() {
        let db = Arc::new(TenantDatabase::in_memory().expect("db"));
        let character = db.upsert_character(&sample_character("mika", "Mika")).expect("seed");
        let model = Arc::new(ScriptedModel::new([
            r#"[{"event": "User got a job offer in Osaka", "time": "today", "location": "", "people": "user"}]"#,
            r#"[{"event": "User got a job offer in Osaka", "time": "today", "location": "", "people": "user"},
                {"event": "They plan to visit Kyoto together", "time": "next spring", "location": "Kyoto", "people": "user, Mika"}]"#,
        ]));
        let memory = service(db.clone(), model.clone(), Arc::new(HashingEmbedder));

        let first = memory
            .extract(&character, "User: I got the Osaka job!")
            .await
            .expect("first extract");
        assert_eq!(first.len(), 1);

        let second = memory
            .extract(&character, "User: let's go to Kyoto in spring")
            .await
            .expect("second extract");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].location, "Kyoto");
        assert_eq!(db.list_memories("mika").expect("list").len(), 2);
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1][1].content.contains("let's go to Kyoto in spring"));

        let hits = memory.search("mika", "Kyoto trip in spring", 1).await.expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.location, "Kyoto");
    }

    #[tokio::test]
    async fn search_degrades_to_empty_when_embedding_fails() {
        let db = Arc::new(TenantDatabase::in_memory().expect("db"));
        db.insert_memory(&entry("a", HashingEmbedder.embed_sync("anything"), 0))
            .expect("seed");
        let memory = service(db, Arc::new(ScriptedModel::new(Vec::<String>::new())), Arc::new(FailingEmbedder));

        let hits = memory.search("mika", "anything", 5).await.expect("search");
        assert!(hits.is_empty());
    }
}
