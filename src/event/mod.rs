//! Typed event stream over the KV change feed.
//!
//! Each change record is classified by total filter functions into at
//! most one [`Event`]. Subscribers get an independent stream that
//! resumes from the last-seen index, retries transient failures with
//! jittered backoff, and falls back to a full list-and-diff
//! resynchronization when its index is no longer retained.

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::{JobOffer, JobState};
use crate::kv::{KvAction, KvChange, KvError};
use crate::registry::Registry;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    Load,
    Unload,
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A target was created: the job is now assigned to the machine.
    JobScheduled { job: String, machine: String },
    /// A target was deleted; `machine` is the previous holder.
    JobUnscheduled { job: String, machine: String },
    /// The job's whole subtree was removed.
    JobDestroyed { job: String },
    /// The desired state moved away from the current one; `machine` is
    /// the job's target at classification time.
    JobCommand {
        job: String,
        command: JobCommand,
        machine: Option<String>,
    },
    /// The engine opened (or refreshed) an offer.
    JobOffered(JobOffer),
    /// An agent bid on an open offer.
    BidSubmitted { job: String, machine: String },
    /// A machine record was deleted or expired.
    MachineRemoved { machine: String },
}

/// One step of the command table: what moves a job from `current`
/// toward `target`. Equal states need nothing.
pub fn transition_command(current: JobState, target: JobState) -> Option<JobCommand> {
    match (current, target) {
        (JobState::Inactive, JobState::Loaded) => Some(JobCommand::Load),
        (JobState::Inactive, JobState::Launched) => Some(JobCommand::Load),
        (JobState::Loaded, JobState::Inactive) => Some(JobCommand::Unload),
        (JobState::Loaded, JobState::Launched) => Some(JobCommand::Start),
        (JobState::Launched, JobState::Loaded) => Some(JobCommand::Stop),
        (JobState::Launched, JobState::Inactive) => Some(JobCommand::Unload),
        _ => None,
    }
}

/// Path of a change key relative to the registry prefix, split into
/// segments. None when the key is outside the prefix.
fn relative_segments<'a>(prefix: &str, key: &'a str) -> Option<Vec<&'a str>> {
    let rest = key.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;
    Some(rest.split('/').collect())
}

fn filter_job_scheduled(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["job", name, "target"], KvAction::Create) => Some(Event::JobScheduled {
            job: name.to_string(),
            machine: change.node.value.clone(),
        }),
        _ => None,
    }
}

fn filter_job_unscheduled(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["job", name, "target"], KvAction::Delete | KvAction::CompareAndDelete) => {
            let prev = change.prev_node.as_ref()?;
            Some(Event::JobUnscheduled {
                job: name.to_string(),
                machine: prev.value.clone(),
            })
        }
        _ => None,
    }
}

fn filter_job_destroyed(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["job", name], KvAction::Delete) => Some(Event::JobDestroyed {
            job: name.to_string(),
        }),
        _ => None,
    }
}

fn filter_job_offered(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["offer", name, "object"], KvAction::Create | KvAction::Set) => {
            match serde_json::from_str::<JobOffer>(&change.node.value) {
                Ok(offer) => Some(Event::JobOffered(offer)),
                Err(e) => {
                    tracing::warn!(job = name, error = %e, "Skipping malformed offer record");
                    None
                }
            }
        }
        _ => None,
    }
}

fn filter_bid_submitted(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["offer", name, "bids", machine], KvAction::Create | KvAction::Set) => {
            Some(Event::BidSubmitted {
                job: name.to_string(),
                machine: machine.to_string(),
            })
        }
        _ => None,
    }
}

fn filter_machine_removed(segments: &[&str], change: &KvChange) -> Option<Event> {
    match (segments, change.action) {
        (["machines", machine, "object"], KvAction::Delete | KvAction::Expire) => {
            Some(Event::MachineRemoved {
                machine: machine.to_string(),
            })
        }
        _ => None,
    }
}

/// Classify one change. Target-state changes consult the registry for
/// the current derived state; everything else is a pure filter.
async fn classify(registry: &Registry, change: &KvChange) -> Option<Event> {
    let segments = relative_segments(registry.prefix(), &change.node.key)?;

    if let (["job", name, "target-state"], KvAction::Set) = (segments.as_slice(), change.action) {
        let target: JobState = match change.node.value.parse() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(job = name, error = %e, "Skipping unparseable target-state");
                return None;
            }
        };
        let current = match registry.determine_job_state(name).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(job = name, error = %e, "Cannot derive current state");
                return None;
            }
        };
        let command = transition_command(current, target)?;
        let machine = registry.job_target(name).await.ok().flatten();
        return Some(Event::JobCommand {
            job: name.to_string(),
            command,
            machine,
        });
    }

    let filters = [
        filter_job_scheduled,
        filter_job_unscheduled,
        filter_job_destroyed,
        filter_job_offered,
        filter_bid_submitted,
        filter_machine_removed,
    ];
    filters
        .iter()
        .find_map(|f| f(segments.as_slice(), change))
}

/// Fan-out of typed events to any number of subscribers, each with its
/// own watch cursor.
#[derive(Clone)]
pub struct EventStream {
    registry: Registry,
}

impl EventStream {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Spawn a watch task and return its event receiver. The snapshot is
    /// taken before returning, so every change after this call is either
    /// watched or recovered by resync. The task stops when the token is
    /// cancelled or the receiver is dropped.
    pub async fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let snapshot = match snapshot_targets(&self.registry).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "Event stream starting without snapshot");
                (0, HashMap::new())
            }
        };
        let registry = self.registry.clone();
        tokio::spawn(async move {
            run_stream(registry, snapshot, tx, cancel).await;
        });
        rx
    }
}

/// Targets currently present in the registry, with the index to resume
/// watching from.
async fn snapshot_targets(registry: &Registry) -> crate::error::Result<(u64, HashMap<String, String>)> {
    let mut targets = HashMap::new();
    for job in registry.jobs().await? {
        if let Some(machine) = registry.job_target(&job.name).await? {
            targets.insert(job.name, machine);
        }
    }
    let index = match registry.kv().get(registry.prefix(), false, true).await {
        Ok(node) => node.modified_index,
        Err(KvError::KeyNotFound(_)) => 0,
        Err(e) => return Err(e.into()),
    };
    Ok((index, targets))
}

async fn run_stream(
    registry: Registry,
    snapshot: (u64, HashMap<String, String>),
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let kv = registry.kv();
    let prefix = registry.prefix().to_string();
    let (mut after, mut targets) = snapshot;

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            res = kv.watch(&prefix, after) => res,
        };

        match change {
            Ok(change) => {
                after = change.node.modified_index;
                if let Some(event) = classify(&registry, &change).await {
                    match &event {
                        Event::JobScheduled { job, machine } => {
                            targets.insert(job.clone(), machine.clone());
                        }
                        Event::JobUnscheduled { job, .. } | Event::JobDestroyed { job } => {
                            targets.remove(job);
                        }
                        _ => {}
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            Err(KvError::IndexCleared { index, oldest }) => {
                tracing::info!(index, oldest, "Watch index cleared, resynchronizing");
                match snapshot_targets(&registry).await {
                    Ok((index, current)) => {
                        for (job, machine) in &current {
                            if targets.get(job) != Some(machine) {
                                let event = Event::JobScheduled {
                                    job: job.clone(),
                                    machine: machine.clone(),
                                };
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        for (job, machine) in &targets {
                            if !current.contains_key(job) {
                                let event = Event::JobUnscheduled {
                                    job: job.clone(),
                                    machine: machine.clone(),
                                };
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        targets = current;
                        after = index;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Resynchronization failed, retrying");
                        backoff(&cancel).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Watch failed, retrying");
                backoff(&cancel).await;
            }
        }
    }
}

async fn backoff(cancel: &CancellationToken) {
    let delay_ms = rand::thread_rng().gen_range(100..500);
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvNode;

    fn change(action: KvAction, key: &str, value: &str, prev: Option<&str>) -> KvChange {
        KvChange {
            action,
            node: KvNode {
                key: key.to_string(),
                value: value.to_string(),
                modified_index: 1,
                ..KvNode::default()
            },
            prev_node: prev.map(|v| KvNode {
                key: key.to_string(),
                value: v.to_string(),
                ..KvNode::default()
            }),
        }
    }

    #[test]
    fn test_transition_command_table() {
        use JobState::*;
        assert_eq!(transition_command(Inactive, Loaded), Some(JobCommand::Load));
        assert_eq!(transition_command(Inactive, Launched), Some(JobCommand::Load));
        assert_eq!(transition_command(Loaded, Inactive), Some(JobCommand::Unload));
        assert_eq!(transition_command(Loaded, Launched), Some(JobCommand::Start));
        assert_eq!(transition_command(Launched, Loaded), Some(JobCommand::Stop));
        assert_eq!(transition_command(Launched, Inactive), Some(JobCommand::Unload));
        for state in [Inactive, Loaded, Launched] {
            assert_eq!(transition_command(state, state), None);
        }
    }

    #[test]
    fn test_filter_job_scheduled() {
        let c = change(KvAction::Create, "/p/job/web.service/target", "m1", None);
        let segments = relative_segments("/p", &c.node.key).unwrap();
        match filter_job_scheduled(&segments, &c) {
            Some(Event::JobScheduled { job, machine }) => {
                assert_eq!(job, "web.service");
                assert_eq!(machine, "m1");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // A plain set on the target is not a scheduling event.
        let c = change(KvAction::Set, "/p/job/web.service/target", "m1", None);
        assert!(filter_job_scheduled(&segments, &c).is_none());
    }

    #[test]
    fn test_filter_job_unscheduled_requires_prev_node() {
        let key = "/p/job/web.service/target";
        let segments = relative_segments("/p", key).unwrap();

        let c = change(KvAction::CompareAndDelete, key, "", Some("m1"));
        match filter_job_unscheduled(&segments, &c) {
            Some(Event::JobUnscheduled { machine, .. }) => assert_eq!(machine, "m1"),
            other => panic!("unexpected: {other:?}"),
        }

        let c = change(KvAction::Delete, key, "", None);
        assert!(filter_job_unscheduled(&segments, &c).is_none());
    }

    #[test]
    fn test_filter_job_destroyed() {
        let c = change(KvAction::Delete, "/p/job/web.service", "", None);
        let segments = relative_segments("/p", &c.node.key).unwrap();
        assert!(matches!(
            filter_job_destroyed(&segments, &c),
            Some(Event::JobDestroyed { .. })
        ));

        // Deleting a leaf below the job root is not a destroy.
        let c = change(KvAction::Delete, "/p/job/web.service/heartbeat", "", None);
        let segments = relative_segments("/p", &c.node.key).unwrap();
        assert!(filter_job_destroyed(&segments, &c).is_none());
    }

    #[test]
    fn test_filter_bid_and_machine_removed() {
        let c = change(KvAction::Set, "/p/offer/web.service/bids/m2", "m2", None);
        let segments = relative_segments("/p", &c.node.key).unwrap();
        match filter_bid_submitted(&segments, &c) {
            Some(Event::BidSubmitted { job, machine }) => {
                assert_eq!(job, "web.service");
                assert_eq!(machine, "m2");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let c = change(KvAction::Expire, "/p/machines/m2/object", "", Some("{}"));
        let segments = relative_segments("/p", &c.node.key).unwrap();
        assert!(matches!(
            filter_machine_removed(&segments, &c),
            Some(Event::MachineRemoved { .. })
        ));
    }

    #[test]
    fn test_keys_outside_prefix_are_ignored() {
        assert!(relative_segments("/p", "/other/job/x/target").is_none());
    }
}
