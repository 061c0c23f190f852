//! Process-wide lifecycle.
//!
//! One [`Engine`] per process hosts every shard the config places on
//! this host, sharing one clock, network, storage backend and message
//! pool. Start order is leaves-first (clock → network → storage →
//! shards → notifier); stop reverses it, is idempotent, and leaves the
//! engine restartable — a restart recovers term, vote and log from
//! storage.
//!
//! Role-change events are fanned out by a dedicated notifier thread so
//! a slow listener can never stall an election timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::info;

use crate::clock::{Clock, ManualClock, SystemClock};
use crate::config::Config;
use crate::error::{Result, SkiffError};
use crate::message::MessagePool;
use crate::network::{MemoryNetwork, Network};
use crate::shard::Shard;
use crate::storage::{MemoryStorage, RocksStorage, Storage};
use crate::types::RoleChangeEvent;

/// Callback invoked off the Raft hot path for every role transition.
pub type RoleListener = Arc<dyn Fn(&RoleChangeEvent) + Send + Sync>;

/// Token returned by [`Engine::register_role_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleListenerId(u64);

type StorageFactory = Box<dyn Fn(&Config, &str) -> Result<Arc<dyn Storage>> + Send + Sync>;
type NetworkFactory = Box<dyn Fn(&Config, &str) -> Result<Arc<dyn Network>> + Send + Sync>;
type ClockFactory = Box<dyn Fn(&Config, &str) -> Result<Arc<dyn Clock>> + Send + Sync>;

/// Explicit `(name → factory)` table for the pluggable substrate,
/// selected by the `*.impl` config strings.
pub struct PluginRegistry {
    storages: HashMap<String, StorageFactory>,
    networks: HashMap<String, NetworkFactory>,
    clocks: HashMap<String, ClockFactory>,
}

impl PluginRegistry {
    /// The built-in implementations: `memory`/`rocks` storage,
    /// `memory` network, `system`/`manual` clock.
    pub fn builtin() -> Self {
        let mut registry = Self {
            storages: HashMap::new(),
            networks: HashMap::new(),
            clocks: HashMap::new(),
        };
        registry.register_storage("memory", |_, _| Ok(Arc::new(MemoryStorage::new())));
        registry.register_storage("rocks", |config, host_id| {
            let path = config.storage().data_dir.join(host_id);
            Ok(Arc::new(RocksStorage::open(path)?))
        });
        registry.register_network("memory", |_, _| Ok(Arc::new(MemoryNetwork::process_shared())));
        registry.register_clock("system", |_, _| Ok(Arc::new(SystemClock::new())));
        registry.register_clock("manual", |_, _| Ok(Arc::new(ManualClock::new())));
        registry
    }

    pub fn register_storage<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config, &str) -> Result<Arc<dyn Storage>> + Send + Sync + 'static,
    {
        self.storages.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_network<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config, &str) -> Result<Arc<dyn Network>> + Send + Sync + 'static,
    {
        self.networks.insert(name.to_string(), Box::new(factory));
    }

    pub fn register_clock<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Config, &str) -> Result<Arc<dyn Clock>> + Send + Sync + 'static,
    {
        self.clocks.insert(name.to_string(), Box::new(factory));
    }

    fn storage(&self, config: &Config, host_id: &str) -> Result<Arc<dyn Storage>> {
        let name = &config.storage().impl_name;
        let factory = self.storages.get(name).ok_or_else(|| {
            SkiffError::Config(format!("unknown storage implementation: {}", name))
        })?;
        factory(config, host_id)
    }

    fn network(&self, config: &Config, host_id: &str) -> Result<Arc<dyn Network>> {
        let name = &config.network().impl_name;
        let factory = self.networks.get(name).ok_or_else(|| {
            SkiffError::Config(format!("unknown network implementation: {}", name))
        })?;
        factory(config, host_id)
    }

    fn clock(&self, config: &Config, host_id: &str) -> Result<Arc<dyn Clock>> {
        let name = &config.clock().impl_name;
        let factory = self.clocks.get(name).ok_or_else(|| {
            SkiffError::Config(format!("unknown clock implementation: {}", name))
        })?;
        factory(config, host_id)
    }
}

/// Builds an [`Engine`], optionally injecting substrate instances in
/// place of the config-selected plugins (the test harness shares one
/// storage and one network hub across several engines this way).
pub struct EngineBuilder {
    config: Arc<Config>,
    host_id: String,
    registry: PluginRegistry,
    storage: Option<Arc<dyn Storage>>,
    network: Option<Arc<dyn Network>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: Config, host_id: &str) -> Self {
        Self {
            config: Arc::new(config),
            host_id: host_id.to_string(),
            registry: PluginRegistry::builtin(),
            storage: None,
            network: None,
            clock: None,
        }
    }

    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let storage = match self.storage {
            Some(storage) => storage,
            None => self.registry.storage(&self.config, &self.host_id)?,
        };
        let network = match self.network {
            Some(network) => network,
            None => self.registry.network(&self.config, &self.host_id)?,
        };
        let clock = match self.clock {
            Some(clock) => clock,
            None => self.registry.clock(&self.config, &self.host_id)?,
        };
        let buffer_capacity = (self.config.raft().command_max_size * 2).max(16 * 1024);
        let pool = MessagePool::new(buffer_capacity, 256);

        Ok(Engine {
            config: self.config,
            host_id: self.host_id,
            storage,
            network,
            clock,
            pool,
            listeners: Arc::new(Mutex::new(Vec::new())),
            listener_seq: AtomicU64::new(1),
            state: Mutex::new(EngineState::default()),
        })
    }
}

#[derive(Default)]
struct EngineState {
    running: bool,
    shards: HashMap<String, Shard>,
    role_tx: Option<Sender<RoleChangeEvent>>,
    notifier: Option<JoinHandle<()>>,
}

/// The engine hosting this process's members. See the crate docs for a
/// usage sketch.
pub struct Engine {
    config: Arc<Config>,
    host_id: String,
    storage: Arc<dyn Storage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    pool: MessagePool,
    listeners: Arc<Mutex<Vec<(u64, RoleListener)>>>,
    listener_seq: AtomicU64,
    state: Mutex<EngineState>,
}

impl Engine {
    /// Build an engine for `host_id` with the config-selected plugins.
    pub fn new(config: Config, host_id: &str) -> Result<Self> {
        EngineBuilder::new(config, host_id).build()
    }

    pub fn builder(config: Config, host_id: &str) -> EngineBuilder {
        EngineBuilder::new(config, host_id)
    }

    /// Start every shard with a member on this host. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.running {
            return Ok(());
        }
        info!(host_id = %self.host_id, "starting engine");

        let (role_tx, role_rx) = unbounded::<RoleChangeEvent>();
        let mut shards = HashMap::new();
        for shard_id in self.config.shard_ids_for_host(&self.host_id) {
            let shard = Shard::start(
                self.config.clone(),
                &shard_id,
                &self.host_id,
                self.storage.clone(),
                self.network.clone(),
                self.clock.clone(),
                self.pool.clone(),
                role_tx.clone(),
            )?;
            shards.insert(shard_id, shard);
        }

        // Fan events out off the Raft hot path: snapshot the listener
        // list, then iterate — registration during a fire is fine.
        let listeners = self.listeners.clone();
        let notifier = std::thread::Builder::new()
            .name(format!("role-notifier-{}", self.host_id))
            .spawn(move || {
                for event in role_rx.iter() {
                    let snapshot: Vec<RoleListener> =
                        listeners.lock().iter().map(|(_, l)| l.clone()).collect();
                    for listener in snapshot {
                        listener(&event);
                    }
                }
            })
            .map_err(|e| SkiffError::Internal(format!("spawn notifier: {}", e)))?;

        state.shards = shards;
        state.role_tx = Some(role_tx);
        state.notifier = Some(notifier);
        state.running = true;
        metrics::gauge!("skiff_engines_running").increment(1.0);
        Ok(())
    }

    /// Stop everything, reverse of start order. Idempotent; the engine
    /// can be started again and recovers from storage.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        info!(host_id = %self.host_id, "stopping engine");

        for shard in state.shards.values() {
            shard.stop();
        }
        state.shards.clear();

        // Closing the channel ends the notifier.
        state.role_tx = None;
        if let Some(notifier) = state.notifier.take() {
            let _ = notifier.join();
        }

        self.network.stop();
        state.running = false;
        metrics::gauge!("skiff_engines_running").decrement(1.0);
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// The shard, if it has a member on this host and the engine is
    /// running.
    pub fn shard(&self, shard_id: &str) -> Option<Shard> {
        self.state.lock().shards.get(shard_id).cloned()
    }

    pub fn shards(&self) -> Vec<Shard> {
        self.state.lock().shards.values().cloned().collect()
    }

    /// Register for role-change events; fired from the notifier thread.
    pub fn register_role_listener<F>(&self, listener: F) -> RoleListenerId
    where
        F: Fn(&RoleChangeEvent) + Send + Sync + 'static,
    {
        let id = self.listener_seq.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        RoleListenerId(id)
    }

    pub fn unregister_role_listener(&self, id: RoleListenerId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id.0);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigFile, HostConfig, ShardConfig, ShardMemberConfig, StorageConfig};

    fn single_member_config() -> Config {
        let file = ConfigFile {
            storage: StorageConfig { impl_name: "memory".into(), ..StorageConfig::default() },
            hosts: vec![HostConfig {
                host_id: "A".into(),
                address: "local".into(),
                store_id: "store0".into(),
                site_id: "site0".into(),
            }],
            shards: vec![ShardConfig {
                shard_id: "shard1".into(),
                members: vec![ShardMemberConfig { host_id: "A".into(), member_id: 1 }],
            }],
            ..ConfigFile::default()
        };
        Config::new(file).unwrap()
    }

    #[test]
    fn unknown_plugin_name_is_rejected() {
        let file = ConfigFile {
            storage: StorageConfig { impl_name: "bogus".into(), ..StorageConfig::default() },
            ..ConfigFile::default()
        };
        let config = Config::new(file).unwrap();
        assert!(matches!(Engine::new(config, "A"), Err(SkiffError::Config(_))));
    }

    #[test]
    fn start_stop_is_idempotent_and_restartable() {
        let engine = Engine::builder(single_member_config(), "A")
            .network(Arc::new(MemoryNetwork::new()))
            .build()
            .unwrap();
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.shard("shard1").is_some());

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(engine.shard("shard1").is_none());

        // Restart recovers from the same storage.
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();
    }

    #[test]
    fn listener_registration_round_trip() {
        let engine = Engine::builder(single_member_config(), "A")
            .network(Arc::new(MemoryNetwork::new()))
            .build()
            .unwrap();
        let id = engine.register_role_listener(|_| {});
        assert_eq!(engine.listeners.lock().len(), 1);
        engine.unregister_role_listener(id);
        assert!(engine.listeners.lock().is_empty());
    }
}
