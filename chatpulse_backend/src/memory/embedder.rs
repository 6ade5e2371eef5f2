use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Length of every stored memory vector.
pub const VECTOR_DIM: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns an L2-normalized vector of exactly [`VECTOR_DIM`] entries.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        client: reqwest::Client,
        api_url: String,
        api_key: Option<String>,
        model: String,
    ) -> Self {
        Self {
            client,
            api_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.api_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send embedding request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Embedding API returned error {}: {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        let mut vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding response contained no vectors"))?;

        if vector.len() != VECTOR_DIM {
            anyhow::bail!(
                "Embedding model returned {} dimensions, expected {}",
                vector.len(),
                VECTOR_DIM
            );
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

/// Deterministic feature-hashing embedder. Works offline; similar wording
/// lands on similar vectors, which is enough for recall over a few hundred
/// memories per character.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; VECTOR_DIM];
        let lowered = text.to_lowercase();

        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            add_feature(&mut vector, word.as_bytes(), 1.0);
        }

        // Character bigrams cover scripts without word separators
        let chars: Vec<char> = lowered.chars().filter(|c| c.is_alphanumeric()).collect();
        for pair in chars.windows(2) {
            let gram: String = pair.iter().collect();
            add_feature(&mut vector, gram.as_bytes(), 0.5);
        }

        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

fn add_feature(vector: &mut [f32], feature: &[u8], weight: f32) {
    let hash = fnv1a(feature);
    let index = (hash % VECTOR_DIM as u64) as usize;
    let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
    vector[index] += sign * weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}
