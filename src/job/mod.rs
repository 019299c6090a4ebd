use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::unit::{Unit, UnitState};

/// Lifecycle position of a job. Ordered: a job moves along
/// `inactive < loaded < launched` in either direction, one step per
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inactive,
    Loaded,
    Launched,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Inactive => write!(f, "inactive"),
            JobState::Loaded => write!(f, "loaded"),
            JobState::Launched => write!(f, "launched"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "loaded" => Ok(JobState::Loaded),
            "launched" => Ok(JobState::Launched),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A named binding of a unit into the cluster. The stored record is just
/// `{name, unitHash}`; the unit, the owner-reported unit state and the
/// derived current state are attached on read.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub unit: Unit,
    pub unit_state: Option<UnitState>,
    pub state: Option<JobState>,
}

impl Job {
    pub fn new(name: &str, unit: Unit) -> Self {
        Self {
            name: name.to_string(),
            unit,
            unit_state: None,
            state: None,
        }
    }
}

/// Engine-issued announcement that a job needs a host. Lives under the
/// offer key until resolved or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOffer {
    pub name: String,
    pub unit: Unit,
}

impl JobOffer {
    pub fn new(job: &Job) -> Self {
        Self {
            name: job.name.clone(),
            unit: job.unit.clone(),
        }
    }
}

/// An agent's claim that it can host an offered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBid {
    pub job: String,
    pub machine: String,
}

/// Client-facing listing row: a job name with its unit.
#[derive(Debug, Clone)]
pub struct JobUnit {
    pub name: String,
    pub unit: Unit,
}

/// Client-facing listing row: where a job stands in the cluster.
#[derive(Debug, Clone)]
pub struct ScheduledUnit {
    pub name: String,
    pub state: Option<JobState>,
    pub machine: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_ordering() {
        assert!(JobState::Inactive < JobState::Loaded);
        assert!(JobState::Loaded < JobState::Launched);
    }

    #[test]
    fn test_job_state_parse_and_display() {
        for state in [JobState::Inactive, JobState::Loaded, JobState::Launched] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_offer_carries_unit() {
        let job = Job::new("web.service", Unit::new("[X-Fleet]\nX-Conflicts=*-db\n"));
        let offer = JobOffer::new(&job);
        let json = serde_json::to_string(&offer).unwrap();
        let back: JobOffer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "web.service");
        assert_eq!(back.unit.conflicts(), vec!["*-db"]);
    }
}
