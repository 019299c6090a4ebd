use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{Job, JobState};
use crate::kv::KvError;
use crate::sign;
use crate::unit::UnitHash;

use super::Registry;

/// Stored form of a job. Pre-upgrade records carry no unit hash; their
/// unit is recovered from the legacy payload key instead.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_hash: Option<UnitHash>,
}

impl Registry {
    /// Store the job's unit (idempotent on hash collision) and create the
    /// job record. Fails with `JobAlreadyExists` when the name is taken.
    pub async fn create_job(&self, job: &Job) -> Result<()> {
        self.store_or_get_unit(&job.unit).await?;

        let model = JobModel {
            name: job.name.clone(),
            unit_hash: Some(job.unit.hash()),
        };
        let raw = Self::marshal(&model)?;
        match self
            .kv
            .create(&self.job_object_path(&job.name), &raw, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(KvError::NodeExist(_)) => Err(Error::JobAlreadyExists(job.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Hydrate a job: record, unit (with legacy payload fallback), the
    /// owner-reported unit state and the derived current state.
    pub async fn job(&self, name: &str) -> Result<Option<Job>> {
        let key = self.job_object_path(name);
        let unit = match self.kv.get(&key, false, true).await {
            Ok(node) => {
                let model: JobModel = Self::unmarshal(&key, &node.value)?;
                match model.unit_hash {
                    Some(hash) => match self.unit_by_hash(&hash).await? {
                        Some(unit) => unit,
                        None => {
                            tracing::warn!(job = name, hash = %hash, "No unit stored for job");
                            return Ok(None);
                        }
                    },
                    // Record predates content addressing.
                    None => match self.unit_from_legacy_payload(name).await? {
                        Some(unit) => unit,
                        None => {
                            tracing::warn!(job = name, "No payload stored for legacy job");
                            return Ok(None);
                        }
                    },
                }
            }
            Err(KvError::KeyNotFound(_)) => match self.unit_from_legacy_payload(name).await? {
                Some(unit) => unit,
                None => return Ok(None),
            },
            Err(e) => return Err(e.into()),
        };

        let mut job = Job::new(name, unit);
        job.unit_state = self.unit_state(name).await?;
        job.state = Some(self.determine_job_state(name).await?);
        Ok(Some(job))
    }

    /// All jobs known to the registry. Malformed entries are skipped.
    pub async fn jobs(&self) -> Result<Vec<Job>> {
        let dir = match self.kv.get(&self.job_dir(), false, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::new();
        for node in &dir.nodes {
            let name = node.base_name().to_string();
            match self.job(&name).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(Error::BadRecord { key, source }) => {
                    tracing::warn!(%key, error = %source, "Skipping malformed job record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    /// Name-and-unit listing for client front-ends.
    pub async fn job_units(&self) -> Result<Vec<crate::job::JobUnit>> {
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .map(|job| crate::job::JobUnit {
                name: job.name,
                unit: job.unit,
            })
            .collect())
    }

    /// Per-job placement listing for client front-ends.
    pub async fn schedule(&self) -> Result<Vec<crate::job::ScheduledUnit>> {
        let mut schedule = Vec::new();
        for job in self.jobs().await? {
            let machine = self.job_target(&job.name).await?;
            schedule.push(crate::job::ScheduledUnit {
                name: job.name,
                state: job.state,
                machine,
            });
        }
        Ok(schedule)
    }

    /// Jobs whose target is the given machine.
    pub async fn jobs_by_machine(&self, machine: &str) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for job in self.jobs().await? {
            if self.job_target(&job.name).await?.as_deref() == Some(machine) {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Remove the job record subtree plus its signature sets and any
    /// legacy payload. The content-addressed unit stays behind for the
    /// garbage-collection sweep.
    pub async fn destroy_job(&self, name: &str) -> Result<()> {
        match self.kv.delete(&self.offer_path(name), true).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.kv.delete(&format!("{}/job/{name}", self.prefix), true).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.destroy_signature_set(&sign::tag_for_job(name)).await?;
        match self.kv.delete(&self.payload_path(name), false).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.destroy_signature_set(&sign::tag_for_payload(name))
            .await?;
        Ok(())
    }

    /// Assign the job to a machine. Fail-if-exists enforces the
    /// single-winner invariant; losing the race is `TargetContention`.
    pub async fn schedule_job(&self, name: &str, machine: &str) -> Result<()> {
        match self
            .kv
            .create(&self.job_target_path(name), machine, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(KvError::NodeExist(_)) => Err(Error::TargetContention {
                job: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the job's target, bound to the machine believed to hold
    /// it. Fails when another machine holds it or none does.
    pub async fn clear_job_target(&self, name: &str, machine: &str) -> Result<()> {
        match self
            .kv
            .compare_and_delete(&self.job_target_path(name), Some(machine), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(KvError::TestFailed(_)) | Err(KvError::KeyNotFound(_)) => {
                Err(Error::TargetContention {
                    job: name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The machine the job is scheduled to, if any.
    pub async fn job_target(&self, name: &str) -> Result<Option<String>> {
        match self.kv.get(&self.job_target_path(name), false, true).await {
            Ok(node) => Ok(Some(node.value)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_job_target_state(&self, name: &str, state: JobState) -> Result<()> {
        self.kv
            .set(&self.job_target_state_path(name), &state.to_string(), None)
            .await?;
        Ok(())
    }

    pub async fn job_target_state(&self, name: &str) -> Result<Option<JobState>> {
        match self
            .kv
            .get(&self.job_target_state_path(name), false, true)
            .await
        {
            Ok(node) => match node.value.parse() {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    tracing::warn!(job = name, error = %e, "Unparseable target-state");
                    Ok(None)
                }
            },
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stamp the agent's ongoing ownership of the job under TTL.
    pub async fn job_heartbeat(&self, name: &str, machine: &str, ttl: Duration) -> Result<()> {
        self.kv
            .set(&self.job_heartbeat_path(name), machine, Some(ttl))
            .await?;
        Ok(())
    }

    /// The machine currently heartbeating the job, if any.
    pub async fn job_heartbeat_owner(&self, name: &str) -> Result<Option<String>> {
        match self.kv.get(&self.job_heartbeat_path(name), false, true).await {
            Ok(node) => Ok(Some(node.value)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn clear_job_heartbeat(&self, name: &str) -> Result<()> {
        match self.kv.delete(&self.job_heartbeat_path(name), false).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Current state of a job, derived from what its agent has published:
    /// nothing at all means inactive; a live heartbeat plus an active
    /// unit state means launched; anything in between is loaded.
    pub async fn determine_job_state(&self, name: &str) -> Result<JobState> {
        let unit_state = self.unit_state(name).await?;
        let heartbeat = self.job_heartbeat_owner(name).await?;

        if unit_state.is_none() && heartbeat.is_none() {
            return Ok(JobState::Inactive);
        }
        if heartbeat.is_some()
            && unit_state.as_ref().map(|us| us.is_active()).unwrap_or(false)
        {
            return Ok(JobState::Launched);
        }
        Ok(JobState::Loaded)
    }

    /// Serialize registry operations on one job.
    pub async fn lock_job(
        &self,
        name: &str,
        context: &str,
    ) -> Result<Option<super::TimedResourceMutex>> {
        self.lock_resource("job", name, context).await
    }
}
