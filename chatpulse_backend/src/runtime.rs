use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::dice::{Dice, ThreadDice};
use crate::http_client::build_http_client_with_timeout;
use crate::llm_client::{LanguageModel, LlmClient};
use crate::memory::{Embedder, HashingEmbedder, HttpEmbedder};
use crate::registry::TenantRegistry;

pub struct BackendRuntime {
    pub config: EngineConfig,
    pub registry: Arc<TenantRegistry>,
}

pub struct BackendRuntimeBuilder {
    config: EngineConfig,
    llm: Option<Arc<dyn LanguageModel>>,
    embedder: Option<Arc<dyn Embedder>>,
    dice: Option<Arc<dyn Dice>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            dice: None,
        }
    }

    pub fn with_language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_dice(mut self, dice: Arc<dyn Dice>) -> Self {
        self.dice = Some(dice);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let client = build_http_client_with_timeout(Some(config.llm_timeout()))
            .context("Failed to build HTTP client")?;

        let llm: Arc<dyn LanguageModel> = match self.llm {
            Some(llm) => llm,
            None => {
                tracing::info!("Default model: {} at {}", config.llm_model, config.llm_api_url);
                Arc::new(LlmClient::new(client.clone()))
            }
        };

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => build_embedder(&config, client),
        };

        let dice: Arc<dyn Dice> = match self.dice {
            Some(dice) => dice,
            None => Arc::new(ThreadDice),
        };
        let registry = TenantRegistry::new(&config, llm, embedder, dice);
        tracing::info!("Tenant data under {:?}", config.tenants_dir());

        Ok(BackendRuntime { config, registry })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: EngineConfig) -> Result<Self> {
        BackendRuntimeBuilder::new(config).build()
    }
}

fn build_embedder(config: &EngineConfig, client: reqwest::Client) -> Arc<dyn Embedder> {
    match config
        .embedding_api_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        Some(url) => {
            tracing::info!("Embeddings via {} ({})", url, config.embedding_model);
            Arc::new(HttpEmbedder::new(
                client,
                url.to_string(),
                config.embedding_api_key.clone(),
                config.embedding_model.clone(),
            ))
        }
        None => {
            tracing::info!("No embedding endpoint configured; using the offline hashing embedder");
            Arc::new(HashingEmbedder)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Character;
    use crate::test_support::{sample_character, FailingEmbedder, FixedDice, ScriptedModel};

    #[tokio::test]
    async fn builder_hands_injected_services_to_tenants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..EngineConfig::default()
        };
        let model = Arc::new(ScriptedModel::repeating("hello there"));
        let runtime = BackendRuntimeBuilder::new(config)
            .with_language_model(model.clone())
            .with_embedder(Arc::new(FailingEmbedder))
            .with_dice(Arc::new(FixedDice::default()))
            .build()
            .expect("build");

        let connection = runtime.registry.connect("alice").expect("connect");
        let engine = connection.engine();
        engine
            .upsert_character(&Character {
                sys_proactive: false,
                ..sample_character("mika", "Mika")
            })
            .expect("upsert");

        let exchange = engine.send_direct_message("mika", "hi").await.expect("send");
        assert_eq!(exchange.reply.expect("reply").content, "hello there");
        assert_eq!(model.calls(), 1);
        // The failing embedder degrades search to nothing
        let hits = engine.search_memories("mika", "hi", 3).await.expect("search");
        assert!(hits.is_empty());
    }
}
