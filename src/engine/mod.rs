//! The scheduling engine. Exactly one node leads at a time, elected
//! through the `engine` role lease; the leader opens offers for
//! unscheduled jobs, resolves them against collected bids, reclaims
//! targets from dead machines, and sweeps unreferenced units.

use std::collections::{BTreeSet, HashSet};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventStream};
use crate::job::{Job, JobOffer};
use crate::registry::{Lease, Registry, PROTOCOL_VERSION};
use crate::unit::UnitHash;

/// The role name contended for through the lease service.
const ENGINE_ROLE: &str = "engine";

/// Unit GC runs every this many reconcile passes.
const GC_SWEEP_EVERY: u32 = 15;

pub struct Engine {
    registry: Registry,
    events: EventStream,
    machine_id: String,
    config: NodeConfig,
}

impl Engine {
    pub fn new(
        registry: Registry,
        events: EventStream,
        machine_id: &str,
        config: NodeConfig,
    ) -> Self {
        Self {
            registry,
            events,
            machine_id: machine_id.to_string(),
            config,
        }
    }

    /// Contend for the engine lease until cancelled; lead while holding
    /// it. Losing a renewal drops all scheduling work on the floor and
    /// rejoins the contenders.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self
                .registry
                .lease_role(ENGINE_ROLE, &self.machine_id, self.config.lease_ttl)
                .await
            {
                Ok(Some(lease)) => {
                    tracing::info!(machine = %self.machine_id, "Acquired engine lease");
                    self.lead(lease, &cancel).await;
                    tracing::info!(machine = %self.machine_id, "Dropped engine role");
                }
                Ok(None) => {
                    tracing::debug!(machine = %self.machine_id, "Engine lease held elsewhere");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Engine lease attempt failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.lease_ttl / 2) => {}
            }
        }
    }

    /// The leader loop: renew at half TTL, reconcile on a timer, and
    /// react to offer/bid/unschedule events as they arrive.
    async fn lead(&self, mut lease: Lease, cancel: &CancellationToken) {
        if let Err(e) = self.publish_version().await {
            tracing::warn!(error = %e, "Version publication failed");
        }

        let stream_cancel = cancel.child_token();
        let mut events = self.events.subscribe(stream_cancel.clone()).await;
        let mut renew = tokio::time::interval(self.config.lease_ttl / 2);
        renew.reset();
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        let mut passes: u32 = 0;
        let mut gc_candidates: HashSet<UnitHash> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    stream_cancel.cancel();
                    if let Err(e) = lease.release().await {
                        tracing::warn!(error = %e, "Lease release failed");
                    }
                    return;
                }
                _ = renew.tick() => {
                    if let Err(e) = lease.renew(self.config.lease_ttl).await {
                        tracing::warn!(error = %e, "Engine lease renewal failed");
                        stream_cancel.cancel();
                        return;
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!(error = %e, "Reconcile pass failed");
                    }
                    passes = passes.wrapping_add(1);
                    if passes % GC_SWEEP_EVERY == 0 {
                        if let Err(e) = self.sweep_units(&mut gc_candidates).await {
                            tracing::warn!(error = %e, "Unit GC sweep failed");
                        }
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        tracing::warn!(error = %e, "Scheduling event failed");
                    }
                }
            }
        }
    }

    async fn publish_version(&self) -> Result<()> {
        if self.registry.latest_version().await?.is_none() {
            let version = PROTOCOL_VERSION
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("bad protocol version: {e}")))?;
            self.registry.set_latest_version(&version).await?;
        }
        Ok(())
    }

    async fn handle_event(&self, event: Event) -> Result<()> {
        match event {
            // A bid may complete an offer immediately.
            Event::BidSubmitted { job, .. } => self.resolve_offer(&job).await,
            Event::JobOffered(offer) => self.resolve_offer(&offer.name).await,
            Event::JobUnscheduled { job, .. } => self.offer_job(&job).await,
            Event::MachineRemoved { machine } => self.reclaim_machine(&machine).await,
            _ => Ok(()),
        }
    }

    /// One full pass over the cluster: open offers for unscheduled jobs,
    /// reclaim targets whose machine is gone, then try to resolve every
    /// open offer concurrently.
    async fn reconcile(&self) -> Result<()> {
        let jobs = self.registry.jobs().await?;
        let open: BTreeSet<String> = self
            .registry
            .unresolved_job_offers()
            .await?
            .into_iter()
            .map(|o| o.name)
            .collect();

        for job in &jobs {
            match self.registry.job_target(&job.name).await? {
                None => {
                    if !open.contains(&job.name) {
                        self.create_offer(job).await?;
                    }
                }
                Some(machine) => {
                    if self.target_is_dead(&job.name, &machine).await? {
                        tracing::info!(job = %job.name, machine = %machine, "Reclaiming target from dead machine");
                        if self.registry.clear_job_target(&job.name, &machine).await.is_ok() {
                            self.create_offer(job).await?;
                        }
                    }
                }
            }
        }

        let offers = self.registry.unresolved_job_offers().await?;
        let results = join_all(offers.iter().map(|o| self.resolve(o))).await;
        for (offer, result) in offers.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(job = %offer.name, error = %e, "Offer resolution failed");
            }
        }
        Ok(())
    }

    /// A target is dead when neither a job heartbeat nor the machine
    /// record has survived its TTL.
    async fn target_is_dead(&self, job: &str, machine: &str) -> Result<bool> {
        if self.registry.job_heartbeat_owner(job).await?.is_some() {
            return Ok(false);
        }
        Ok(self.registry.machine_state(machine).await?.is_none())
    }

    async fn create_offer(&self, job: &Job) -> Result<()> {
        tracing::info!(job = %job.name, "Opening offer");
        self.registry
            .create_job_offer(&JobOffer::new(job), None)
            .await
    }

    async fn offer_job(&self, name: &str) -> Result<()> {
        let Some(job) = self.registry.job(name).await? else {
            return Ok(());
        };
        if self.registry.job_target(name).await?.is_some() {
            return Ok(());
        }
        self.create_offer(&job).await
    }

    async fn resolve_offer(&self, name: &str) -> Result<()> {
        let Some(offer) = self.registry.job_offer(name).await? else {
            return Ok(());
        };
        self.resolve(&offer).await
    }

    /// Try to close one offer: validate collected bids, pick the winner
    /// deterministically, commit via fail-if-exists and retire the
    /// offer. Losing the target race abandons the offer.
    async fn resolve(&self, offer: &JobOffer) -> Result<()> {
        let name = &offer.name;

        if self.registry.job_target(name).await?.is_some() {
            return self.registry.resolve_job_offer(name).await;
        }

        let bids = self.registry.bids(name).await?;
        if bids.is_empty() {
            return Ok(());
        }

        let mut eligible = BTreeSet::new();
        for machine in &bids {
            if self.bid_is_valid(offer, machine).await? {
                eligible.insert(machine.clone());
            }
        }
        let Some(winner) = self.pick_winner(offer, &eligible).await? else {
            tracing::debug!(job = %name, "No eligible bids yet");
            return Ok(());
        };

        let Some(lock) = self.registry.lock_job(name, &self.machine_id).await? else {
            return Ok(());
        };

        let outcome = self.registry.schedule_job(name, &winner).await;
        let result = match outcome {
            Ok(()) => {
                tracing::info!(job = %name, machine = %winner, "Offer resolved");
                self.registry.resolve_job_offer(name).await
            }
            Err(Error::TargetContention { .. }) => {
                tracing::debug!(job = %name, "Lost target race, abandoning offer");
                self.registry.resolve_job_offer(name).await
            }
            Err(e) => Err(e),
        };
        lock.release().await?;
        result
    }

    /// Bids go stale: a machine-pinned job only accepts its machine, and
    /// every MachineOf dependency must still be targeted at the bidder.
    async fn bid_is_valid(&self, offer: &JobOffer, machine: &str) -> Result<bool> {
        if let Some(boot_id) = offer.unit.machine_boot_id() {
            if boot_id != machine {
                return Ok(false);
            }
        }
        for dep in offer.unit.machine_of() {
            if self.registry.job_target(&dep).await?.as_deref() != Some(machine) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Deterministic tie-break: machines already hosting a MachineOf
    /// dependency first, lexicographic machine ID within the group.
    async fn pick_winner(
        &self,
        offer: &JobOffer,
        eligible: &BTreeSet<String>,
    ) -> Result<Option<String>> {
        if eligible.is_empty() {
            return Ok(None);
        }

        let deps = offer.unit.machine_of();
        if !deps.is_empty() {
            for machine in eligible {
                for dep in &deps {
                    if self.registry.job_target(dep).await?.as_deref() == Some(machine) {
                        return Ok(Some(machine.clone()));
                    }
                }
            }
        }
        Ok(eligible.iter().next().cloned())
    }

    /// Put every job the dead machine held back on offer.
    async fn reclaim_machine(&self, machine: &str) -> Result<()> {
        for job in self.registry.jobs_by_machine(machine).await? {
            if self.target_is_dead(&job.name, machine).await? {
                tracing::info!(job = %job.name, machine = %machine, "Machine lost, re-offering job");
                if self.registry.clear_job_target(&job.name, machine).await.is_ok() {
                    self.create_offer(&job).await?;
                }
            }
        }
        Ok(())
    }

    /// Two-pass unit GC: a hash unreferenced by any live job on two
    /// consecutive sweeps is deleted. The second look protects a
    /// `create_job` that has stored its unit but not yet its record.
    async fn sweep_units(&self, candidates: &mut HashSet<UnitHash>) -> Result<()> {
        let referenced: HashSet<UnitHash> = self
            .registry
            .jobs()
            .await?
            .iter()
            .map(|j| j.unit.hash())
            .collect();

        let mut next = HashSet::new();
        for hash in self.registry.unit_hashes().await? {
            if referenced.contains(&hash) {
                continue;
            }
            if candidates.contains(&hash) {
                tracing::info!(unit = %hash, "Garbage-collecting unreferenced unit");
                self.registry.destroy_unit(&hash).await?;
            } else {
                next.insert(hash);
            }
        }
        *candidates = next;
        Ok(())
    }
}
