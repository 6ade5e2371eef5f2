//! Live engines keyed by tenant. A tenant's engine exists while at least one
//! connection holds it; the last disconnect shuts it down.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::config::EngineConfig;
use crate::database::TenantDatabase;
use crate::dice::Dice;
use crate::engine::{EngineParts, EngineSettings, TenantEngine};
use crate::llm_client::{LanguageModel, ModelEndpoint};
use crate::memory::Embedder;

const MAX_TENANT_ID_LEN: usize = 64;

struct TenantSlot {
    engine: Arc<TenantEngine>,
    connections: usize,
}

pub struct TenantRegistry {
    data_dir: Option<PathBuf>,
    settings: EngineSettings,
    default_endpoint: ModelEndpoint,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    dice: Arc<dyn Dice>,
    tenants: Mutex<HashMap<String, TenantSlot>>,
}

/// Keeps a tenant's engine alive. Dropping it disconnects.
pub struct TenantConnection {
    registry: Weak<TenantRegistry>,
    tenant_id: String,
    engine: Arc<TenantEngine>,
}

impl TenantConnection {
    pub fn engine(&self) -> &Arc<TenantEngine> {
        &self.engine
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.disconnect(&self.tenant_id);
        }
    }
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(anyhow!(
            "invalid tenant id '{}': use 1-{} letters, digits, '-' or '_'",
            tenant_id,
            MAX_TENANT_ID_LEN
        ))
    }
}

impl TenantRegistry {
    pub fn new(
        config: &EngineConfig,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        dice: Arc<dyn Dice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_dir: Some(config.tenants_dir()),
            settings: EngineSettings::from_config(config),
            default_endpoint: config.default_endpoint(),
            llm,
            embedder,
            dice,
            tenants: Mutex::new(HashMap::new()),
        })
    }

    /// Keeps every tenant in memory instead of on disk.
    pub fn in_memory(
        settings: EngineSettings,
        default_endpoint: ModelEndpoint,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        dice: Arc<dyn Dice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_dir: None,
            settings,
            default_endpoint,
            llm,
            embedder,
            dice,
            tenants: Mutex::new(HashMap::new()),
        })
    }

    fn lock_tenants(&self) -> MutexGuard<'_, HashMap<String, TenantSlot>> {
        self.tenants.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_database(&self, tenant_id: &str) -> Result<TenantDatabase> {
        match &self.data_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.db", tenant_id));
                TenantDatabase::new(&path)
                    .with_context(|| format!("Failed to open database for tenant {}", tenant_id))
            }
            None => TenantDatabase::in_memory(),
        }
    }

    /// Joins an existing slot, if there is one.
    fn attach(
        self: &Arc<Self>,
        tenants: &mut HashMap<String, TenantSlot>,
        tenant_id: &str,
    ) -> Option<TenantConnection> {
        let slot = tenants.get_mut(tenant_id)?;
        slot.connections += 1;
        tracing::debug!(
            "Tenant {} now has {} connection(s)",
            tenant_id,
            slot.connections
        );
        Some(TenantConnection {
            registry: Arc::downgrade(self),
            tenant_id: tenant_id.to_string(),
            engine: slot.engine.clone(),
        })
    }

    /// Attaches to a tenant, starting its engine if nobody else holds it.
    /// The database is opened and the engine started without holding the
    /// tenant map, so one slow tenant never stalls the others.
    pub fn connect(self: &Arc<Self>, tenant_id: &str) -> Result<TenantConnection> {
        validate_tenant_id(tenant_id)?;

        if let Some(connection) = self.attach(&mut self.lock_tenants(), tenant_id) {
            return Ok(connection);
        }

        let db = Arc::new(self.open_database(tenant_id)?);
        let engine = TenantEngine::new(
            tenant_id,
            EngineParts {
                db,
                llm: self.llm.clone(),
                embedder: self.embedder.clone(),
                dice: self.dice.clone(),
                default_endpoint: self.default_endpoint.clone(),
                settings: self.settings.clone(),
            },
        );
        engine
            .start()
            .with_context(|| format!("Failed to start engine for tenant {}", tenant_id))?;

        let mut tenants = self.lock_tenants();
        if let Some(connection) = self.attach(&mut tenants, tenant_id) {
            // Another connect won the race while this engine was starting
            drop(tenants);
            engine.shutdown();
            return Ok(connection);
        }
        tenants.insert(
            tenant_id.to_string(),
            TenantSlot {
                engine: engine.clone(),
                connections: 1,
            },
        );
        tracing::info!("Tenant {} connected", tenant_id);

        Ok(TenantConnection {
            registry: Arc::downgrade(self),
            tenant_id: tenant_id.to_string(),
            engine,
        })
    }

    fn disconnect(&self, tenant_id: &str) {
        let removed = {
            let mut tenants = self.lock_tenants();
            let Some(slot) = tenants.get_mut(tenant_id) else {
                return;
            };
            slot.connections = slot.connections.saturating_sub(1);
            if slot.connections > 0 {
                return;
            }
            tenants.remove(tenant_id)
        };
        if let Some(slot) = removed {
            slot.engine.shutdown();
            tracing::info!("Tenant {} disconnected; engine stopped", tenant_id);
        }
    }

    /// The running engine, if any connection currently holds the tenant.
    pub fn engine(&self, tenant_id: &str) -> Option<Arc<TenantEngine>> {
        self.lock_tenants()
            .get(tenant_id)
            .map(|slot| slot.engine.clone())
    }

    pub fn connection_count(&self, tenant_id: &str) -> usize {
        self.lock_tenants()
            .get(tenant_id)
            .map(|slot| slot.connections)
            .unwrap_or(0)
    }

    pub fn active_tenants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_tenants().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown_all(&self) {
        let slots: Vec<TenantSlot> = self.lock_tenants().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.engine.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Character;
    use crate::memory::HashingEmbedder;
    use crate::test_support::{sample_character, FixedDice, ScriptedModel};

    fn registry_at(dir: &std::path::Path) -> Arc<TenantRegistry> {
        let config = EngineConfig {
            data_dir: dir.to_string_lossy().to_string(),
            ..EngineConfig::default()
        };
        TenantRegistry::new(
            &config,
            Arc::new(ScriptedModel::repeating("hi")),
            Arc::new(HashingEmbedder),
            Arc::new(FixedDice::default()),
        )
    }

    #[test]
    fn tenant_ids_are_validated() {
        assert!(validate_tenant_id("alice_01").is_ok());
        assert!(validate_tenant_id("team-a").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("../etc").is_err());
        assert!(validate_tenant_id("a b").is_err());
    }

    #[tokio::test]
    async fn last_disconnect_stops_the_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());

        let first = registry.connect("alice").expect("connect");
        let second = registry.connect("alice").expect("connect again");
        assert!(Arc::ptr_eq(first.engine(), second.engine()));
        assert_eq!(registry.connection_count("alice"), 2);

        let engine = first.engine().clone();
        drop(first);
        assert!(!engine.is_closed());
        drop(second);
        assert!(engine.is_closed());
        assert!(registry.engine("alice").is_none());
        assert!(registry.active_tenants().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_connects_share_one_engine() {
        let registry = TenantRegistry::in_memory(
            EngineSettings::default(),
            EngineConfig::default().default_endpoint(),
            Arc::new(ScriptedModel::repeating("hi")),
            Arc::new(HashingEmbedder),
            Arc::new(FixedDice::default()),
        );

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::task::spawn_blocking(move || registry.connect("alice"))
            })
            .collect();
        let mut connections = Vec::new();
        for attempt in attempts {
            connections.push(attempt.await.expect("join").expect("connect"));
        }

        let engine = connections[0].engine().clone();
        assert!(connections.iter().all(|c| Arc::ptr_eq(c.engine(), &engine)));
        assert!(!engine.is_closed());
        assert_eq!(registry.connection_count("alice"), 8);

        drop(connections);
        assert!(engine.is_closed());
        assert!(registry.active_tenants().is_empty());
    }

    #[tokio::test]
    async fn tenants_are_isolated_and_persist_across_reconnects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = registry_at(dir.path());

        {
            let alice = registry.connect("alice").expect("alice");
            alice
                .engine()
                .upsert_character(&Character {
                    sys_proactive: false,
                    ..sample_character("mika", "Mika")
                })
                .expect("upsert");
            let bob = registry.connect("bob").expect("bob");
            assert!(bob.engine().database().list_characters().expect("list").is_empty());
            assert_eq!(registry.active_tenants(), vec!["alice".to_string(), "bob".to_string()]);
        }

        let alice = registry.connect("alice").expect("reconnect");
        let characters = alice.engine().database().list_characters().expect("list");
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].name, "Mika");
        assert!(dir.path().join("tenants").join("alice.db").exists());
    }
}
