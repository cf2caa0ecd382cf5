use super::*;
use crate::common::{
    Error,
    types::{ParentRef, Payload, Persisted},
};
use crate::server::{
    search::{Indexer, MemoryIndex, SearchIndex},
    store::SqliteStore,
};
use core::time::Duration;
use std::sync::Arc;
use tally::ChildKind;
use tokio::sync::mpsc;

fn no_jitter(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(60),
        jitter: false,
    }
}

fn duplicate() -> Error {
    Error::DuplicateNumber {
        parent_id: 1,
        kind: ChildKind::Entry,
        number: 1,
        replay: false,
    }
}

#[test]
fn task_runs_through_retry_to_success() {
    let policy = no_jitter(3);
    let mut task = CreationTask::new(1, 9, 4, Payload::entry("hi"));
    assert_eq!(task.state(), TaskState::Pending);
    assert_eq!(task.attempts(), 0);
    assert_eq!(task.parent(), ParentRef::thread(9));

    assert_eq!(task.start().unwrap(), 1);
    let state = task.fail(&duplicate(), &policy).unwrap();
    assert_eq!(
        state,
        TaskState::Retrying {
            attempt: 2,
            backoff: Duration::from_millis(10)
        }
    );
    assert_eq!(task.attempts(), 1);
    assert!(task.last_error().unwrap().starts_with("Duplicate entry number 1"));

    assert_eq!(task.start().unwrap(), 2);
    task.succeed().unwrap();
    assert_eq!(task.state(), TaskState::Succeeded { attempts: 2 });
    assert!(task.state().is_terminal());
}

#[test]
fn retries_are_bounded() {
    let policy = no_jitter(2);
    let mut task = CreationTask::new(1, 9, 4, Payload::Thread);

    task.start().unwrap();
    task.fail(&duplicate(), &policy).unwrap();
    task.start().unwrap();
    let state = task.fail(&duplicate(), &policy).unwrap();

    assert_eq!(state, TaskState::Dead { attempts: 2 });
    assert!(matches!(task.start(), Err(Error::InvalidTransition { .. })));
}

#[test]
fn missing_parent_is_not_retried() {
    let mut task = CreationTask::new(1, 9, 4, Payload::Thread);
    task.start().unwrap();
    let err = Error::ParentMissing {
        parent: ParentRef::tenant(9),
    };
    let state = task.fail(&err, &no_jitter(5)).unwrap();
    assert_eq!(state, TaskState::Dead { attempts: 1 });
}

#[test]
fn invalid_transitions_are_rejected() {
    let mut task = CreationTask::new(1, 9, 4, Payload::Thread);
    assert!(task.succeed().is_err());
    assert!(task.fail(&duplicate(), &no_jitter(3)).is_err());

    task.start().unwrap();
    assert!(task.start().is_err());
    task.succeed().unwrap();
    assert!(matches!(
        task.abandon("late"),
        Err(Error::InvalidTransition {
            from: "succeeded",
            to: "dead"
        })
    ));
}

#[test]
fn abandon_keeps_the_attempt_count() {
    let mut task = CreationTask::new(1, 9, 4, Payload::Thread);
    task.start().unwrap();
    task.fail(&duplicate(), &no_jitter(3)).unwrap();

    task.abandon("shutting down").unwrap();
    assert_eq!(task.state(), TaskState::Dead { attempts: 1 });
    assert_eq!(task.last_error(), Some("shutting down"));

    // Already dead: no-op.
    task.abandon("again").unwrap();
    assert_eq!(task.last_error(), Some("shutting down"));
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = no_jitter(10);
    let delays: Vec<_> = (1..=5).map(|a| policy.backoff(a).as_millis()).collect();
    assert_eq!(delays, [10, 20, 40, 60, 60]);
    assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(60));
}

#[test]
fn jitter_stays_within_half_to_full_delay() {
    let policy = RetryPolicy {
        jitter: true,
        ..no_jitter(10)
    };
    for _ in 0..200 {
        let delay = policy.backoff(3);
        assert!(delay >= Duration::from_millis(20), "{delay:?}");
        assert!(delay <= Duration::from_millis(40), "{delay:?}");
    }
}

#[test]
fn dead_letter_captures_the_task() {
    let mut task = CreationTask::new(7, 9, 4, Payload::entry("lost"));
    task.start().unwrap();
    task.fail(&duplicate(), &no_jitter(1)).unwrap();

    let letter = DeadLetter::from_task(&task);
    assert_eq!(letter.task_id, 7);
    assert_eq!((letter.parent_id, letter.number), (9, 4));
    assert_eq!(letter.kind, ChildKind::Entry);
    assert_eq!(letter.attempts, 1);
    assert_eq!(letter.payload, Payload::entry("lost"));
}

type Fixture = (
    CreationWorker,
    SqliteStore,
    Arc<MemoryIndex>,
    i64,
    mpsc::Receiver<ParentRef>,
);

async fn worker_fixture() -> Fixture {
    let store = SqliteStore::in_memory().await.unwrap();
    let tenant = store.create_tenant("acme", "Acme").await.unwrap();
    let thread = store
        .insert_child(tenant.id, 1, &Payload::Thread)
        .await
        .unwrap();

    let index = Arc::new(MemoryIndex::new());
    let (tx, rx) = mpsc::channel(16);
    let worker = CreationWorker::new(
        store.clone(),
        Indexer::new(index.clone(), Duration::from_millis(200)),
        tx,
        no_jitter(2),
        Duration::from_secs(2),
    );
    (worker, store, index, thread.id(), rx)
}

#[tokio::test]
async fn process_persists_indexes_and_reports_the_parent() {
    let (worker, store, index, thread_id, mut increments) = worker_fixture().await;
    let mut task = CreationTask::new(1, thread_id, 1, Payload::entry("hello world"));

    let state = worker.process(&mut task).await.unwrap();
    assert_eq!(state, TaskState::Succeeded { attempts: 1 });

    let entry = store.entry(thread_id, 1).await.unwrap().unwrap();
    assert_eq!(index.get(entry.id).unwrap().body, "hello world");
    assert_eq!(index.count().await.unwrap(), 1);
    assert_eq!(increments.try_recv().unwrap(), ParentRef::thread(thread_id));
}

#[tokio::test]
async fn process_retries_then_kills_a_conflicting_number() {
    let (worker, store, _index, thread_id, mut increments) = worker_fixture().await;
    store
        .insert_child(thread_id, 1, &Payload::entry("first"))
        .await
        .unwrap();

    let mut task = CreationTask::new(1, thread_id, 1, Payload::entry("second"));
    let state = worker.process(&mut task).await.unwrap();
    assert!(matches!(state, TaskState::Retrying { attempt: 2, .. }));

    let state = worker.process(&mut task).await.unwrap();
    assert_eq!(state, TaskState::Dead { attempts: 2 });
    assert!(increments.try_recv().is_err());

    // The original row is untouched.
    let entry = store.entry(thread_id, 1).await.unwrap().unwrap();
    assert_eq!(entry.body, "first");
}

#[tokio::test]
async fn process_succeeds_once_the_conflicting_row_is_gone() {
    let (worker, store, index, thread_id, mut increments) = worker_fixture().await;
    store
        .insert_child(thread_id, 1, &Payload::entry("squatter"))
        .await
        .unwrap();

    let mut task = CreationTask::new(1, thread_id, 1, Payload::entry("rightful"));
    let state = worker.process(&mut task).await.unwrap();
    assert!(matches!(state, TaskState::Retrying { attempt: 2, .. }));
    assert!(increments.try_recv().is_err());

    sqlx::query("DELETE FROM entries WHERE parent_id = ? AND sequence_number = 1")
        .bind(thread_id)
        .execute(store.pool())
        .await
        .unwrap();

    let state = worker.process(&mut task).await.unwrap();
    assert_eq!(state, TaskState::Succeeded { attempts: 2 });

    let entry = store.entry(thread_id, 1).await.unwrap().unwrap();
    assert_eq!(entry.body, "rightful");
    assert_eq!(index.get(entry.id).unwrap().body, "rightful");
    assert_eq!(increments.try_recv().unwrap(), ParentRef::thread(thread_id));
    assert!(increments.try_recv().is_err());
}

#[tokio::test]
async fn persisting_a_requeued_task_resolves_its_dead_letter() {
    let (worker, store, _index, thread_id, _rx) = worker_fixture().await;
    let mut dead = CreationTask::new(1, thread_id, 3, Payload::entry("again"));
    dead.abandon("database is locked").unwrap();
    let id = store
        .record_dead_letter(&DeadLetter::from_task(&dead))
        .await
        .unwrap();
    let record = store.mark_requeued(id).await.unwrap();

    let mut task = CreationTask::new(2, thread_id, 3, record.letter.payload).with_dead_letter(id);
    let state = worker.process(&mut task).await.unwrap();
    assert_eq!(state, TaskState::Succeeded { attempts: 1 });
    assert_eq!(store.dead_letter_count().await.unwrap(), 0);
}

#[tokio::test]
async fn execute_reports_a_vanished_parent() {
    let (worker, _store, _index, thread_id, _rx) = worker_fixture().await;
    let err = worker
        .execute(thread_id + 100, 1, &Payload::entry("orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ParentMissing { .. }));

    let row = worker
        .execute(thread_id, 5, &Payload::entry("fine"))
        .await
        .unwrap();
    assert!(matches!(row, Persisted::Entry(ref e) if e.sequence_number == 5));
}
