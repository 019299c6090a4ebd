use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::config::NodeConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::event::EventStream;
use crate::kv::KvStore;
use crate::machine::{self, MachineState};
use crate::registry::Registry;
use crate::supervisor::UnitManager;

/// One process of the cluster: an agent, and optionally an engine
/// contender, sharing a registry over one KV store.
pub struct Node {
    config: NodeConfig,
    registry: Registry,
    events: EventStream,
    machine: MachineState,
    manager: Arc<dyn UnitManager>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        kv: Arc<dyn KvStore>,
        manager: Arc<dyn UnitManager>,
    ) -> Result<Self> {
        config.validate()?;

        let machine_id = machine::load_machine_id(config.boot_id_path.as_deref())?;
        let mut machine = MachineState::new(&machine_id).with_metadata(config.metadata.clone());
        if let Some(ip) = &config.public_ip {
            machine = machine.with_public_ip(ip);
        }

        let registry = Registry::new(kv, &config.key_prefix);
        let events = EventStream::new(registry.clone());

        Ok(Self {
            config,
            registry,
            events,
            machine,
            manager,
        })
    }

    pub fn machine_id(&self) -> &str {
        &self.machine.boot_id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the node's subsystems until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            machine = %self.machine.boot_id,
            prefix = %self.config.key_prefix,
            engine = self.config.run_engine,
            "Starting node"
        );

        let agent = Agent::new(
            self.registry.clone(),
            self.events.clone(),
            self.manager.clone(),
            self.machine.clone(),
            self.config.clone(),
        );
        let agent_handle = tokio::spawn(agent.run(cancel.clone()));

        let engine_handle = if self.config.run_engine {
            let engine = Engine::new(
                self.registry.clone(),
                self.events.clone(),
                &self.machine.boot_id,
                self.config.clone(),
            );
            let engine_cancel = cancel.clone();
            Some(tokio::spawn(async move {
                engine.run(engine_cancel).await;
            }))
        } else {
            None
        };

        let _ = agent_handle.await;
        if let Some(handle) = engine_handle {
            let _ = handle.await;
        }
        tracing::info!(machine = %self.machine.boot_id, "Node stopped");
    }
}
