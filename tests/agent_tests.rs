//! Agent reconciler tests: bidding rules and supervisor-facing flows,
//! with scheduling driven by hand (no engine).


use std::sync::Arc;
use std::time::Duration;

use flotilla::agent::Agent;
use flotilla::event::EventStream;
use flotilla::job::{Job, JobOffer, JobState};
use flotilla::kv::MemoryKvStore;
use flotilla::machine::MachineState;
use flotilla::registry::Registry;
use flotilla::supervisor::{FakeUnitManager, UnitManager};

use test_harness::{test_node_config, unit_with_requirements, wait_for, TestCluster, TEST_PREFIX};

const WAIT: Duration = Duration::from_secs(5);

fn agent_only_config() -> flotilla::config::NodeConfig {
    flotilla::config::NodeConfig {
        run_engine: false,
        ..test_node_config()
    }
}

/// A detached agent for feasibility checks, never run.
fn idle_agent(registry: &Registry, machine_id: &str) -> Agent {
    Agent::new(
        registry.clone(),
        EventStream::new(registry.clone()),
        Arc::new(FakeUnitManager::new()),
        MachineState::new(machine_id),
        agent_only_config(),
    )
}

#[tokio::test]
async fn test_boot_id_condition_gates_bidding() {
    let kv = Arc::new(MemoryKvStore::new());
    let registry = Registry::new(kv, TEST_PREFIX);
    let agent = idle_agent(&registry, "mach-a");

    let pinned_here = JobOffer::new(&Job::new(
        "pinned.service",
        unit_with_requirements("P", &["X-ConditionMachineBootID=mach-a"]),
    ));
    assert!(agent.able_to_run(&pinned_here).await.unwrap());

    let pinned_elsewhere = JobOffer::new(&Job::new(
        "pinned.service",
        unit_with_requirements("P", &["X-ConditionMachineBootID=mach-b"]),
    ));
    assert!(!agent.able_to_run(&pinned_elsewhere).await.unwrap());
}

#[tokio::test]
async fn test_machine_of_condition_gates_bidding() {
    let kv = Arc::new(MemoryKvStore::new());
    let registry = Registry::new(kv, TEST_PREFIX);
    let agent = idle_agent(&registry, "mach-a");

    let offer = JobOffer::new(&Job::new(
        "follower.service",
        unit_with_requirements("F", &["X-ConditionMachineOf=hello.service"]),
    ));

    // Dependency unscheduled: not feasible anywhere.
    assert!(!agent.able_to_run(&offer).await.unwrap());

    // Dependency on another machine: still not feasible here.
    registry.schedule_job("hello.service", "mach-b").await.unwrap();
    assert!(!agent.able_to_run(&offer).await.unwrap());

    // Dependency here: feasible.
    registry.clear_job_target("hello.service", "mach-b").await.unwrap();
    registry.schedule_job("hello.service", "mach-a").await.unwrap();
    assert!(agent.able_to_run(&offer).await.unwrap());
}

#[tokio::test]
async fn test_agent_loads_scheduled_job() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("hello.service", unit_with_requirements("Hello", &[])))
        .await
        .unwrap();
    registry.schedule_job("hello.service", "mach-a").await.unwrap();

    let manager = cluster.manager("mach-a");
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { manager.units().await.unwrap().contains(&"hello.service".to_string()) }
        })
        .await,
        "unit never loaded"
    );

    // The agent publishes its heartbeat and the supervisor's report.
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                let heartbeat = registry
                    .job_heartbeat_owner("hello.service")
                    .await
                    .unwrap();
                let state = registry.unit_state("hello.service").await.unwrap();
                heartbeat.as_deref() == Some("mach-a") && state.is_some()
            }
        })
        .await,
        "heartbeat and unit state never published"
    );
    let state = registry.unit_state("hello.service").await.unwrap().unwrap();
    assert_eq!(state.load_state, "loaded");
    assert_eq!(
        state.machine_state.as_ref().map(|ms| ms.boot_id.as_str()),
        Some("mach-a")
    );
}

#[tokio::test]
async fn test_agent_drives_stop_and_start() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("svc.service", unit_with_requirements("S", &[])))
        .await
        .unwrap();
    registry.schedule_job("svc.service", "mach-a").await.unwrap();

    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.determine_job_state("svc.service").await.unwrap() == JobState::Launched
            }
        })
        .await,
        "job never reached launched"
    );

    // Stop: desired state drops to loaded.
    registry
        .set_job_target_state("svc.service", JobState::Loaded)
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.determine_job_state("svc.service").await.unwrap() == JobState::Loaded
            }
        })
        .await,
        "job never stopped"
    );
    let state = registry.unit_state("svc.service").await.unwrap().unwrap();
    assert_eq!(state.active_state, "inactive");

    // Start again.
    registry
        .set_job_target_state("svc.service", JobState::Launched)
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.determine_job_state("svc.service").await.unwrap() == JobState::Launched
            }
        })
        .await,
        "job never restarted"
    );
}

#[tokio::test]
async fn test_agent_unloads_on_unschedule() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("tmp.service", unit_with_requirements("T", &[])))
        .await
        .unwrap();
    registry.schedule_job("tmp.service", "mach-a").await.unwrap();

    let manager = cluster.manager("mach-a");
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { !manager.units().await.unwrap().is_empty() }
        })
        .await
    );

    registry.clear_job_target("tmp.service", "mach-a").await.unwrap();

    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { manager.units().await.unwrap().is_empty() }
        })
        .await,
        "unit never unloaded"
    );
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry.unit_state("tmp.service").await.unwrap().is_none()
                    && registry
                        .job_heartbeat_owner("tmp.service")
                        .await
                        .unwrap()
                        .is_none()
            }
        })
        .await,
        "agent state never erased"
    );
}

#[tokio::test]
async fn test_agent_unloads_on_destroy() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("doomed.service", unit_with_requirements("D", &[])))
        .await
        .unwrap();
    registry.schedule_job("doomed.service", "mach-a").await.unwrap();

    let manager = cluster.manager("mach-a");
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { !manager.units().await.unwrap().is_empty() }
        })
        .await
    );

    registry.destroy_job("doomed.service").await.unwrap();
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { manager.units().await.unwrap().is_empty() }
        })
        .await,
        "unit survived job destruction"
    );
}

#[tokio::test]
async fn test_agent_bids_on_feasible_offer_only() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    // Feasible offer: the agent bids.
    let plain = Job::new("plain.service", unit_with_requirements("P", &[]));
    registry.create_job(&plain).await.unwrap();
    registry
        .create_job_offer(&JobOffer::new(&plain), None)
        .await
        .unwrap();
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry
                    .bids("plain.service")
                    .await
                    .unwrap()
                    .contains("mach-a")
            }
        })
        .await,
        "agent never bid"
    );

    // Pinned to another machine: no bid.
    let pinned = Job::new(
        "pinned.service",
        unit_with_requirements("P", &["X-ConditionMachineBootID=mach-z"]),
    );
    registry.create_job(&pinned).await.unwrap();
    registry
        .create_job_offer(&JobOffer::new(&pinned), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.bids("pinned.service").await.unwrap().is_empty());
}

/// Restarting an agent over existing registry state is idempotent: the
/// job stays loaded exactly once and its published records survive.
#[tokio::test]
async fn test_agent_restart_reconciles_existing_target() {
    let mut cluster = TestCluster::new();
    cluster.add_node_with_config("mach-a", agent_only_config());
    let registry = cluster.registry.clone();

    registry
        .create_job(&Job::new("sticky.service", unit_with_requirements("S", &[])))
        .await
        .unwrap();
    registry.schedule_job("sticky.service", "mach-a").await.unwrap();

    let manager = cluster.manager("mach-a");
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { !manager.units().await.unwrap().is_empty() }
        })
        .await
    );

    // Replace the node; the new agent adopts the existing target.
    cluster.kill_node("mach-a");
    cluster.add_node_with_config("mach-a", agent_only_config());

    let manager = cluster.manager("mach-a");
    assert!(
        wait_for(WAIT, || {
            let manager = manager.clone();
            async move { manager.units().await.unwrap() == vec!["sticky.service".to_string()] }
        })
        .await,
        "restarted agent did not adopt its job"
    );
    assert!(
        wait_for(WAIT, || {
            let registry = registry.clone();
            async move {
                registry
                    .job_heartbeat_owner("sticky.service")
                    .await
                    .unwrap()
                    .as_deref()
                    == Some("mach-a")
            }
        })
        .await,
        "restarted agent never heartbeat its job"
    );
}
