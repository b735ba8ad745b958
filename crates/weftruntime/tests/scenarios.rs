use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use weftcore::{
    ExecutionRange, FnBody, Kwargs, Message, Shared, TaskContext, TaskError, TaskId,
};
use weftruntime::{SharedClient, SharedState, Task, Workflow};

/// Initialize tracing for tests
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[test]
fn checkin_twice_checkout_once() {
    init_tracing();
    let shared = SharedState::new(ExecutionRange::Thread);
    let t1 = TaskId::new_v4();

    shared.checkin(t1).unwrap();
    shared.checkin(t1).unwrap();
    assert_eq!(shared.active_tasks().unwrap().len(), 1);

    shared.checkout(t1).unwrap();
    assert!(shared.active_tasks().unwrap().is_empty());
    shared.checkout(t1).unwrap();
}

#[test]
fn workflow_runs_b_after_a() {
    init_tracing();
    let mut workflow = Workflow::builder()
        .name("scenario-b")
        .range(ExecutionRange::Thread)
        .host_shared()
        .build()
        .unwrap();

    let journal = Arc::new(Mutex::new(Vec::new()));
    let step = |label: &'static str| {
        let journal = journal.clone();
        FnBody::new("test.step", move |_ctx: &TaskContext, _kwargs: &Kwargs| {
            journal.lock().unwrap().push(label);
            Ok(())
        })
    };

    let a = workflow.new_task(step("a")).build().unwrap();
    let b = workflow.new_task(step("b")).build().unwrap();
    workflow.add_task(a.clone(), &[]).unwrap();
    workflow.add_task(b.clone(), &[a.clone()]).unwrap();

    workflow.run(Kwargs::new()).unwrap();

    assert_eq!(*journal.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(b.runs(), 1);
}

#[test]
fn two_lockers_are_serialized() {
    init_tracing();
    let shared = Arc::new(SharedState::new(ExecutionRange::Thread));
    let counter = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let shared = shared.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                let owner = TaskId::new_v4();
                assert!(shared.lock(owner, Some(Duration::from_secs(1))).unwrap());
                let seen = counter.load(Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                counter.store(seen + 1, Ordering::SeqCst);
                shared.unlock(owner).unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn thread_and_process_tasks_share_one_mailbox() {
    init_tracing();
    let workflow = Workflow::builder()
        .name("mailbox")
        .range(ExecutionRange::Process)
        .host_shared()
        .build()
        .unwrap();
    let address = workflow.manager_address().unwrap();

    // A remote task sees the same active set and mailbox as local ones
    let remote: Arc<dyn Shared> = Arc::new(SharedClient::connect(address).unwrap());
    let listener = Task::builder(FnBody::new(
        "test.listen",
        |ctx: &TaskContext, _kwargs: &Kwargs| {
            let shared = ctx.require_shared()?;
            match shared.receive_message(ctx.task_id, None)? {
                Some(message) if message.payload == "ping" => Ok(()),
                other => Err(TaskError::ExecutionFailed(format!("unexpected {:?}", other))),
            }
        },
    ))
    .range(ExecutionRange::Process)
    .shared(remote.clone())
    .build()
    .unwrap();

    let local = workflow.shared().unwrap();
    assert!(local.active_tasks().unwrap().contains(&listener.id()));

    local
        .send_message(Some(listener.id()), Message::data(Some(workflow.id()), "ping".into()))
        .unwrap();
    listener.run(Kwargs::new()).unwrap();

    drop(listener);
    assert_eq!(local.active_tasks().unwrap(), vec![workflow.id()]);
}
