//! End-to-end scenarios: client-visible flows across registry, engine
//! and agents over one shared store.


use std::time::Duration;

use flotilla::job::{Job, JobState};
use flotilla::supervisor::UnitManager;

use test_harness::{unit_with_requirements, wait_for, TestCluster};

const WAIT: Duration = Duration::from_secs(5);

/// Create -> schedule -> launch, as a client would drive it.
#[tokio::test]
async fn test_create_schedule_launch() {
    let mut cluster = TestCluster::new();
    cluster.add_node("mach-a");
    let registry = cluster.registry.clone();

    let job = Job::new("hello.service", unit_with_requirements("Hello", &[]));
    registry.create_job(&job).await.unwrap();
    registry
        .set_job_target_state("hello.service", JobState::Launched)
        .await
        .unwrap();

    // The engine offers, the only machine bids and wins, the agent
    // loads and starts.
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                let Ok(Some(job)) = registry.job("hello.service").await else {
                    return false;
                };
                job.state == Some(JobState::Launched)
            }
        })
        .await,
        "job never launched"
    );

    let job = registry.job("hello.service").await.unwrap().unwrap();
    let state = job.unit_state.expect("agent should report unit state");
    assert_eq!(state.load_state, "loaded");
    assert_eq!(state.active_state, "active");
    assert_eq!(state.sub_state, "running");
    assert_eq!(
        state.machine_state.map(|ms| ms.boot_id),
        Some("mach-a".to_string())
    );

    // The supervisor on the winning machine is the one running it.
    let units = cluster.manager("mach-a").units().await.unwrap();
    assert_eq!(units, vec!["hello.service".to_string()]);
}

/// The targeted machine is the only one publishing heartbeats for the
/// job, and its ID matches the target.
#[tokio::test]
async fn test_heartbeat_ownership_matches_target() {
    let mut cluster = TestCluster::new();
    cluster.add_node("mach-a");
    cluster.add_node("mach-b");
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("owned.service", unit_with_requirements("O", &[])))
        .await
        .unwrap();

    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                let Ok(Some(target)) = registry.job_target("owned.service").await else {
                    return false;
                };
                registry
                    .job_heartbeat_owner("owned.service")
                    .await
                    .unwrap()
                    .as_deref()
                    == Some(target.as_str())
            }
        })
        .await,
        "heartbeat owner never converged on the target"
    );

    // Exactly one supervisor hosts the unit.
    let on_a = cluster.manager("mach-a").units().await.unwrap().len();
    let on_b = cluster.manager("mach-b").units().await.unwrap().len();
    assert_eq!(on_a + on_b, 1);
}

/// Several jobs settle onto a cluster and every one ends with exactly
/// one target.
#[tokio::test]
async fn test_many_jobs_all_converge() {
    let mut cluster = TestCluster::new();
    cluster.add_node("mach-a");
    cluster.add_node("mach-b");
    let registry = cluster.registry.clone();

    for i in 0..5 {
        registry
            .create_job(&Job::new(
                &format!("job-{i}.service"),
                unit_with_requirements(&format!("Job {i}"), &[]),
            ))
            .await
            .unwrap();
    }

    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                for i in 0..5 {
                    let name = format!("job-{i}.service");
                    if registry.job_target(&name).await.unwrap().is_none() {
                        return false;
                    }
                }
                true
            }
        })
        .await,
        "not every job was scheduled"
    );
}

/// Full lifecycle: launch, stop, unload, destroy.
#[tokio::test]
async fn test_lifecycle_down_transitions() {
    let mut cluster = TestCluster::new();
    cluster.add_node("mach-a");
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("cycle.service", unit_with_requirements("C", &[])))
        .await
        .unwrap();
    registry
        .set_job_target_state("cycle.service", JobState::Launched)
        .await
        .unwrap();

    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.determine_job_state("cycle.service").await.unwrap() == JobState::Launched
            }
        })
        .await
    );

    registry
        .set_job_target_state("cycle.service", JobState::Loaded)
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.determine_job_state("cycle.service").await.unwrap() == JobState::Loaded
            }
        })
        .await,
        "stop never applied"
    );

    registry
        .set_job_target_state("cycle.service", JobState::Inactive)
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || {
            let manager = cluster.manager("mach-a");
            async move { manager.units().await.unwrap().is_empty() }
        })
        .await,
        "unload never applied"
    );

    registry.destroy_job("cycle.service").await.unwrap();
    assert!(registry.job("cycle.service").await.unwrap().is_none());
}
