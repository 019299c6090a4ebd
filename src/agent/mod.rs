//! Per-machine reconciler between the registry and the local supervisor.
//!
//! The agent publishes its machine record under TTL, bids on offers it
//! can satisfy, and drives the supervisor toward the desired state of
//! every job targeted at this machine, reporting unit states and
//! per-job heartbeats back into the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::Result;
use crate::event::{Event, EventStream, JobCommand};
use crate::job::{Job, JobOffer, JobState};
use crate::machine::MachineState;
use crate::registry::Registry;
use crate::supervisor::UnitManager;

/// A job this agent currently hosts, with the token driving its
/// heartbeat loop.
struct HostedJob {
    job: Job,
    heartbeat: CancellationToken,
}

pub struct Agent {
    registry: Registry,
    events: EventStream,
    manager: Arc<dyn UnitManager>,
    machine: MachineState,
    config: NodeConfig,
    hosted: HashMap<String, HostedJob>,
    /// Parent of every heartbeat token, so cancellation reaches the
    /// per-job loops at any depth.
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(
        registry: Registry,
        events: EventStream,
        manager: Arc<dyn UnitManager>,
        machine: MachineState,
        config: NodeConfig,
    ) -> Self {
        Self {
            registry,
            events,
            manager,
            machine,
            config,
            hosted: HashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    fn machine_id(&self) -> &str {
        &self.machine.boot_id
    }

    /// Run until cancelled. Publishes the machine record, reconciles
    /// whatever the registry already holds for this machine, then reacts
    /// to the event stream.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.shutdown = cancel.clone();
        if let Err(e) = self
            .registry
            .set_machine_state(&self.machine, self.config.machine_ttl)
            .await
        {
            tracing::warn!(error = %e, "Initial machine-state publication failed");
        }
        tokio::spawn(machine_refresher(
            self.registry.clone(),
            self.machine.clone(),
            self.config.machine_ttl,
            cancel.clone(),
        ));

        let mut events = self.events.subscribe(cancel.clone()).await;

        if let Err(e) = self.reconcile_existing().await {
            tracing::warn!(error = %e, "Initial reconciliation failed");
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Err(e) = self.handle_event(event).await {
                tracing::warn!(machine = %self.machine_id(), error = %e, "Event handling failed");
            }
        }

        for (_, hosted) in self.hosted.drain() {
            hosted.heartbeat.cancel();
        }
    }

    /// Pick up state left over from a previous run: adopt jobs already
    /// targeted at this machine and bid on offers already open. Safe to
    /// run any number of times.
    async fn reconcile_existing(&mut self) -> Result<()> {
        let me = self.machine_id().to_string();
        for job in self.registry.jobs_by_machine(&me).await? {
            let name = job.name.clone();
            self.load_job(&name).await?;
        }
        for offer in self.registry.unresolved_job_offers().await? {
            self.maybe_bid(&offer).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::JobOffered(offer) => self.maybe_bid(&offer).await,
            Event::JobScheduled { job, machine } if machine == self.machine_id() => {
                self.load_job(&job).await
            }
            Event::JobUnscheduled { job, machine } if machine == self.machine_id() => {
                self.unload_job(&job).await
            }
            Event::JobDestroyed { job } if self.hosted.contains_key(&job) => {
                self.unload_job(&job).await
            }
            Event::JobCommand {
                job,
                command,
                machine,
            } if machine.as_deref() == Some(self.machine_id())
                || self.hosted.contains_key(&job) =>
            {
                match command {
                    JobCommand::Load => self.load_job(&job).await,
                    JobCommand::Unload => self.unload_job(&job).await,
                    JobCommand::Start => self.start_job(&job).await,
                    JobCommand::Stop => self.stop_job(&job).await,
                }
            }
            _ => Ok(()),
        }
    }

    /// Whether this machine can host the offered job: the boot-ID pin
    /// must match, every MachineOf dependency must be targeted here, and
    /// no Conflicts glob may match in either direction against a job
    /// already hosted.
    pub async fn able_to_run(&self, offer: &JobOffer) -> Result<bool> {
        if let Some(boot_id) = offer.unit.machine_boot_id() {
            if boot_id != self.machine_id() {
                return Ok(false);
            }
        }

        for dep in offer.unit.machine_of() {
            if self.registry.job_target(&dep).await?.as_deref() != Some(self.machine_id()) {
                return Ok(false);
            }
        }

        let conflicts = offer.unit.conflicts();
        for (name, hosted) in &self.hosted {
            for pattern in hosted.job.unit.conflicts() {
                if glob_match(&pattern, &offer.name) {
                    return Ok(false);
                }
            }
            for pattern in &conflicts {
                if glob_match(pattern, name) {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    async fn maybe_bid(&self, offer: &JobOffer) -> Result<()> {
        if !self.able_to_run(offer).await? {
            tracing::debug!(job = %offer.name, machine = %self.machine_id(), "Not bidding");
            return Ok(());
        }
        tracing::info!(job = %offer.name, machine = %self.machine_id(), "Bidding on offer");
        self.registry
            .submit_job_bid(&offer.name, self.machine_id())
            .await
    }

    /// Fetch the job and make the supervisor load it, then begin
    /// heartbeating. Re-applying to an already-hosted job only refreshes
    /// its published state.
    async fn load_job(&mut self, name: &str) -> Result<()> {
        let Some(job) = self.registry.job(name).await? else {
            tracing::warn!(job = name, "Scheduled job has no registry record");
            return Ok(());
        };

        if !self.hosted.contains_key(name) {
            tracing::info!(job = name, machine = %self.machine_id(), "Loading unit");
            self.manager.load(name, job.unit.clone()).await?;

            let heartbeat = self.shutdown.child_token();
            tokio::spawn(heartbeat_loop(
                self.registry.clone(),
                name.to_string(),
                self.machine_id().to_string(),
                self.config.job_heartbeat_ttl,
                heartbeat.clone(),
            ));
            self.hosted.insert(
                name.to_string(),
                HostedJob {
                    job: job.clone(),
                    heartbeat,
                },
            );
        }

        self.publish_unit_state(name).await?;

        // The desired state may already be past loaded.
        if self.registry.job_target_state(name).await? == Some(JobState::Launched) {
            self.start_job(name).await?;
        }
        Ok(())
    }

    /// Unload and erase every trace this agent published for the job.
    /// A no-op for jobs not hosted here.
    async fn unload_job(&mut self, name: &str) -> Result<()> {
        if let Some(hosted) = self.hosted.remove(name) {
            hosted.heartbeat.cancel();
        }
        tracing::info!(job = name, machine = %self.machine_id(), "Unloading unit");
        self.manager.unload(name).await?;
        self.registry.clear_job_heartbeat(name).await?;
        self.registry.remove_unit_state(name).await?;
        Ok(())
    }

    async fn start_job(&mut self, name: &str) -> Result<()> {
        self.manager.start(name).await?;
        self.publish_unit_state(name).await
    }

    async fn stop_job(&mut self, name: &str) -> Result<()> {
        self.manager.stop(name).await?;
        self.publish_unit_state(name).await
    }

    /// Mirror the supervisor's view of the unit into the registry.
    async fn publish_unit_state(&self, name: &str) -> Result<()> {
        match self.manager.unit_state(name).await? {
            Some(state) => {
                let state = state.with_machine(self.machine.clone());
                self.registry.save_unit_state(name, &state).await
            }
            None => self.registry.remove_unit_state(name).await,
        }
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

/// Keep the machine record alive, refreshing at half TTL.
async fn machine_refresher(
    registry: Registry,
    machine: MachineState,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(ttl / 2);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = registry.set_machine_state(&machine, ttl).await {
                    tracing::warn!(machine = %machine.boot_id, error = %e, "Machine-state refresh failed");
                }
            }
        }
    }
}

/// Stamp ongoing ownership of one job, refreshing at half TTL. The
/// stamp's own TTL reaps it if this loop dies with its agent.
async fn heartbeat_loop(
    registry: Registry,
    job: String,
    machine: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(ttl / 2);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = registry.job_heartbeat(&job, &machine, ttl).await {
                    tracing::warn!(job = %job, error = %e, "Job heartbeat failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*-db", "web-db"));
        assert!(glob_match("web*", "web-frontend.service"));
        assert!(!glob_match("*-db", "db-web"));
        // A malformed pattern matches nothing.
        assert!(!glob_match("[", "anything"));
    }
}
