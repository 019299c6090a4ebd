//! Event stream integration tests: classification of live KV changes,
//! command emission, and recovery from watch-history gaps.


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flotilla::event::{Event, EventStream, JobCommand};
use flotilla::job::{Job, JobOffer, JobState};
use flotilla::kv::{KvStore, MemoryKvStore};
use flotilla::registry::Registry;
use flotilla::unit::UnitState;

use test_harness::{unit_with_requirements, TEST_PREFIX};

fn fixture() -> (Arc<MemoryKvStore>, Registry) {
    let kv = Arc::new(MemoryKvStore::new());
    let registry = Registry::new(kv.clone(), TEST_PREFIX);
    (kv, registry)
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("stream closed")
}

#[tokio::test]
async fn test_schedule_and_unschedule_events() {
    let (_, registry) = fixture();
    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    registry.schedule_job("web.service", "m1").await.unwrap();
    match next_event(&mut rx).await {
        Event::JobScheduled { job, machine } => {
            assert_eq!(job, "web.service");
            assert_eq!(machine, "m1");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    registry.clear_job_target("web.service", "m1").await.unwrap();
    match next_event(&mut rx).await {
        Event::JobUnscheduled { job, machine } => {
            assert_eq!(job, "web.service");
            assert_eq!(machine, "m1");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_destroy_event() {
    let (_, registry) = fixture();
    registry
        .create_job(&Job::new("gone.service", unit_with_requirements("X", &[])))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    registry.destroy_job("gone.service").await.unwrap();
    match next_event(&mut rx).await {
        Event::JobDestroyed { job } => assert_eq!(job, "gone.service"),
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_target_state_change_emits_command() {
    let (_, registry) = fixture();
    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    // Current state is inactive (nothing published), so a launched
    // target needs a load first.
    registry
        .set_job_target_state("cmd.service", JobState::Launched)
        .await
        .unwrap();
    match next_event(&mut rx).await {
        Event::JobCommand { job, command, .. } => {
            assert_eq!(job, "cmd.service");
            assert_eq!(command, JobCommand::Load);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_target_state_equal_to_current_emits_nothing() {
    let (_, registry) = fixture();
    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    // inactive -> inactive is a no-op; the following schedule acts as a
    // marker proving no command was emitted in between.
    registry
        .set_job_target_state("noop.service", JobState::Inactive)
        .await
        .unwrap();
    registry.schedule_job("noop.service", "m1").await.unwrap();

    match next_event(&mut rx).await {
        Event::JobScheduled { job, .. } => assert_eq!(job, "noop.service"),
        other => panic!("expected the marker schedule, got {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_stop_command_for_launched_job() {
    let (_, registry) = fixture();

    // Make the derived state launched: heartbeat plus active unit state.
    registry
        .job_heartbeat("run.service", "m1", Duration::from_secs(5))
        .await
        .unwrap();
    registry
        .save_unit_state("run.service", &UnitState::new("loaded", "active", "running"))
        .await
        .unwrap();
    registry.schedule_job("run.service", "m1").await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    registry
        .set_job_target_state("run.service", JobState::Loaded)
        .await
        .unwrap();
    match next_event(&mut rx).await {
        Event::JobCommand {
            job,
            command,
            machine,
        } => {
            assert_eq!(job, "run.service");
            assert_eq!(command, JobCommand::Stop);
            assert_eq!(machine.as_deref(), Some("m1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_offer_and_bid_events() {
    let (_, registry) = fixture();
    let job = Job::new("offered.service", unit_with_requirements("X", &[]));
    registry.create_job(&job).await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    registry
        .create_job_offer(&JobOffer::new(&job), None)
        .await
        .unwrap();
    match next_event(&mut rx).await {
        Event::JobOffered(offer) => assert_eq!(offer.name, "offered.service"),
        other => panic!("unexpected event: {other:?}"),
    }

    registry
        .submit_job_bid("offered.service", "m1")
        .await
        .unwrap();
    match next_event(&mut rx).await {
        Event::BidSubmitted { job, machine } => {
            assert_eq!(job, "offered.service");
            assert_eq!(machine, "m1");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

#[tokio::test]
async fn test_machine_expiry_event() {
    let (_, registry) = fixture();
    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;

    registry
        .set_machine_state(
            &flotilla::machine::MachineState::new("m9"),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    // First the record appears (no event class), then it expires.
    match next_event(&mut rx).await {
        Event::MachineRemoved { machine } => assert_eq!(machine, "m9"),
        other => panic!("unexpected event: {other:?}"),
    }

    cancel.cancel();
}

/// A subscriber whose cursor falls out of the retained change window
/// must resynchronize and still converge on the true target set.
#[tokio::test]
async fn test_history_gap_triggers_resync() {
    let kv = Arc::new(MemoryKvStore::with_history_limit(4));
    let registry = Registry::new(kv.clone(), TEST_PREFIX);

    registry.schedule_job("old.service", "m1").await.unwrap();

    let cancel = CancellationToken::new();
    let mut rx = EventStream::new(registry.clone()).subscribe(cancel.clone()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Burst enough writes to evict the subscriber's cursor from the
    // four-entry history: a new target, a removed target, and filler.
    registry.schedule_job("new.service", "m2").await.unwrap();
    registry.clear_job_target("old.service", "m1").await.unwrap();
    for i in 0..8 {
        kv.set(&format!("{TEST_PREFIX}/noise/{i}"), "x", None)
            .await
            .unwrap();
    }

    // Whether each change was watched directly or recovered through the
    // list-and-diff resync, both deltas must come through.
    let mut scheduled_new = false;
    let mut unscheduled_old = false;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Event::JobScheduled { job, machine })) if job == "new.service" => {
                assert_eq!(machine, "m2");
                scheduled_new = true;
            }
            Ok(Some(Event::JobUnscheduled { job, machine })) if job == "old.service" => {
                assert_eq!(machine, "m1");
                unscheduled_old = true;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
        if scheduled_new && unscheduled_old {
            break;
        }
    }
    assert!(scheduled_new, "missed the new.service schedule");
    assert!(unscheduled_old, "missed the old.service unschedule");

    cancel.cancel();
}
