use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use flowctx::location::ComponentLocation;
use flowctx::{
    CompletionGate, ContextBuilder, ContextError, ContextSnapshot, EventContext, FlowIdentity,
};
use serde_json::{Value, json};

const BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

fn flow() -> FlowIdentity {
    FlowIdentity::new("test-flow", "test-server")
}

fn root() -> EventContext<Value> {
    EventContext::create(flow(), None)
}

fn child(parent: &EventContext<Value>) -> EventContext<Value> {
    EventContext::child(parent).expect("parent accepts children")
}

fn test_event() -> Value {
    json!({ "payload": "test" })
}

fn assert_response(ctx: &EventContext<Value>, expected: Option<Value>) {
    let response = ctx
        .response_signal()
        .wait_timeout(BLOCK_TIMEOUT)
        .expect("response resolves");
    assert_eq!(response.expect("response is a success"), expected);
}

fn assert_completion_done(ctx: &EventContext<Value>) {
    assert!(ctx.is_complete(), "{ctx} should be complete");
}

fn assert_completion_not_done(ctx: &EventContext<Value>) {
    assert!(!ctx.is_complete(), "{ctx} should not be complete");
}

#[test]
fn success_with_result_completes_root() {
    let parent = root();
    let event = test_event();
    assert_completion_not_done(&parent);

    parent.success(Some(event.clone())).unwrap();

    assert_response(&parent, Some(event));
    assert!(parent.before_response_signal().is_resolved());
    assert_completion_done(&parent);
}

#[test]
fn success_without_result() {
    let parent = root();
    parent.success(None).unwrap();

    assert_response(&parent, None);
    assert_eq!(parent.completion_signal().wait_timeout(BLOCK_TIMEOUT), Ok(()));
}

#[test]
fn error_response_still_completes() {
    let parent = root();
    assert_completion_not_done(&parent);

    parent.error(anyhow!("processing failed")).unwrap();

    assert_completion_done(&parent);
    let first = parent.response_signal().wait_timeout(BLOCK_TIMEOUT).unwrap();
    let second = parent.response_signal().try_get().unwrap();
    assert_eq!(first.clone().unwrap_err().to_string(), "processing failed");
    assert_eq!(first, second);
}

#[test]
fn before_response_observers_run_first() {
    let parent = root();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = Arc::clone(&order);
    parent
        .response_signal()
        .subscribe(move |_| o.lock().unwrap().push("response"));
    let o = Arc::clone(&order);
    parent
        .before_response_signal()
        .subscribe(move |_| o.lock().unwrap().push("before"));
    let o = Arc::clone(&order);
    parent
        .completion_signal()
        .subscribe(move |_| o.lock().unwrap().push("completion"));

    parent.success(Some(test_event())).unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["before", "response", "completion"]);
}

#[test]
fn child_completion_then_parent_response() {
    let parent = root();
    let c = child(&parent);
    let event = test_event();

    c.success(Some(event.clone())).unwrap();
    assert_response(&c, Some(event.clone()));
    assert_completion_done(&c);
    assert_completion_not_done(&parent);

    parent.success(Some(event.clone())).unwrap();
    assert_response(&parent, Some(event));
    assert_completion_done(&parent);
}

#[test]
fn child_completes_after_parent_response() {
    let parent = root();
    let c = child(&parent);

    parent.success(None).unwrap();
    assert_response(&parent, None);
    assert_completion_not_done(&parent);
    assert_completion_not_done(&c);

    c.success(None).unwrap();
    assert_completion_done(&c);
    assert_completion_done(&parent);
}

#[test]
fn child_errors_do_not_reach_parent() {
    let parent = root();
    let c = child(&parent);

    parent.success(Some(test_event())).unwrap();
    assert_completion_not_done(&parent);

    c.error(anyhow!("child failed")).unwrap();
    assert_completion_done(&c);
    assert_completion_done(&parent);
    assert!(c.response_signal().try_get().unwrap().is_err());
    assert_eq!(
        parent.response_signal().try_get().unwrap().unwrap(),
        Some(test_event())
    );
}

#[test]
fn async_child_on_another_thread() {
    let parent = root();
    let c = child(&parent);
    let event = test_event();

    let worker = {
        let c = c.clone();
        let event = event.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            c.success(Some(event)).unwrap();
        })
    };

    parent.success(Some(event.clone())).unwrap();
    assert_response(&c, Some(event.clone()));
    c.completion_signal().wait_timeout(BLOCK_TIMEOUT).unwrap();
    parent.completion_signal().wait_timeout(BLOCK_TIMEOUT).unwrap();
    worker.join().unwrap();
}

#[test]
fn multiple_levels_grandchild_first() {
    let parent = root();
    let c = child(&parent);
    let grandchild = child(&c);

    grandchild.success(None).unwrap();
    assert_completion_done(&grandchild);
    assert!(!c.is_response_done());
    assert_completion_not_done(&c);
    assert_completion_not_done(&parent);

    c.success(None).unwrap();
    assert_completion_done(&c);
    assert!(!parent.is_response_done());
    assert_completion_not_done(&parent);

    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn multiple_levels_parent_first() {
    let parent = root();
    let c = child(&parent);
    let grandchild = child(&c);

    parent.success(None).unwrap();
    assert!(parent.is_response_done());
    assert_completion_not_done(&parent);
    assert!(!c.is_response_done());

    c.success(None).unwrap();
    assert!(c.is_response_done());
    assert_completion_not_done(&c);
    assert_completion_not_done(&parent);

    grandchild.success(None).unwrap();
    assert_completion_done(&grandchild);
    assert_completion_done(&c);
    assert_completion_done(&parent);
}

#[test]
fn multiple_branches() {
    let parent = root();
    let child1 = child(&parent);
    let child2 = child(&parent);
    let grandchild1 = child(&child1);
    let grandchild2 = child(&child1);
    let grandchild3 = child(&child2);
    let grandchild4 = child(&child2);

    grandchild1.success(None).unwrap();
    grandchild2.success(None).unwrap();
    assert_completion_done(&grandchild1);
    assert_completion_done(&grandchild2);
    assert_completion_not_done(&child1);
    assert_completion_not_done(&parent);

    child1.success(None).unwrap();
    assert_completion_done(&child1);
    assert_completion_not_done(&parent);

    grandchild3.success(None).unwrap();
    grandchild4.success(None).unwrap();
    child2.success(None).unwrap();
    assert_completion_done(&child2);
    assert_completion_not_done(&parent);

    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn sibling_order_does_not_matter() {
    for reversed in [false, true] {
        let parent = root();
        let c1 = child(&parent);
        let c2 = child(&parent);
        let (first, second) = if reversed { (&c2, &c1) } else { (&c1, &c2) };

        first.success(None).unwrap();
        assert_completion_not_done(&parent);
        second.success(None).unwrap();
        assert_completion_not_done(&parent);
        parent.success(None).unwrap();
        assert_completion_done(&parent);
    }
}

#[test]
fn gate_holds_completion_after_success() {
    let gate = CompletionGate::new();
    let parent: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate.clone());
    let event = test_event();
    assert!(parent.is_gated());

    parent.success(Some(event.clone())).unwrap();
    assert_response(&parent, Some(event));
    assert_completion_not_done(&parent);

    gate.fire().unwrap();
    assert_completion_done(&parent);
}

#[test]
fn gate_holds_completion_after_error() {
    let gate = CompletionGate::new();
    let parent: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate.clone());

    parent.error(anyhow!("failed")).unwrap();
    assert_completion_not_done(&parent);

    gate.fire().unwrap();
    assert_completion_done(&parent);
}

#[test]
fn gate_with_child() {
    let gate = CompletionGate::new();
    let parent: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate.clone());
    let c = child(&parent);

    c.success(Some(test_event())).unwrap();
    assert_completion_done(&c);
    assert_completion_not_done(&parent);

    parent.success(Some(test_event())).unwrap();
    assert_completion_not_done(&parent);

    gate.fire().unwrap();
    assert_completion_done(&parent);
}

#[test]
fn gate_fired_before_response() {
    let gate = CompletionGate::new();
    gate.fire().unwrap();
    let parent: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate);

    assert_completion_not_done(&parent);
    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn gate_shared_between_roots() {
    let gate = CompletionGate::new();
    let a: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate.clone());
    let b: EventContext<Value> = EventContext::create_with_gate(flow(), None, gate.clone());

    a.success(None).unwrap();
    b.success(None).unwrap();
    assert_completion_not_done(&a);
    assert_completion_not_done(&b);

    gate.fire().unwrap();
    assert_completion_done(&a);
    assert_completion_done(&b);
}

#[test]
fn detached_child_is_not_awaited() {
    let parent = root();
    let c = child(&parent);

    assert!(c.detach());
    assert!(!c.detach());
    assert_eq!(parent.child_count(), 0);

    parent.success(None).unwrap();
    assert_completion_done(&parent);

    // The detached child keeps working on its own.
    assert_completion_not_done(&c);
    c.success(Some(test_event())).unwrap();
    assert_completion_done(&c);
}

#[test]
fn detach_after_parent_response_completes_parent() {
    let parent = root();
    let c = child(&parent);
    parent.success(None).unwrap();
    assert_completion_not_done(&parent);

    assert!(c.detach());
    assert_completion_done(&parent);
}

#[test]
fn detach_after_child_completion_is_noop() {
    let parent = root();
    let c = child(&parent);
    c.success(None).unwrap();
    assert!(!c.detach());
    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn deserialized_child_is_independent() {
    let parent = root();
    let c = child(&parent);

    let bytes = serde_json::to_vec(&c).unwrap();
    let restored: EventContext<Value> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(restored.id(), c.id());
    assert!(restored.is_root());

    restored.success(Some(test_event())).unwrap();
    assert_response(&restored, Some(test_event()));
    assert_completion_done(&restored);

    // Serializing detached the original child, so the parent no longer waits on it.
    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn deserialized_parent_does_not_wait_for_children() {
    let parent = root();
    let c = child(&parent);

    let json = parent.snapshot().to_json().unwrap();
    let restored: EventContext<Value> = ContextSnapshot::from_json(&json).unwrap().restore();

    restored.success(Some(test_event())).unwrap();
    assert_completion_done(&restored);

    // The in-process parent still tracks its child.
    parent.success(None).unwrap();
    assert_completion_not_done(&parent);
    c.success(None).unwrap();
    assert_completion_done(&parent);
}

#[test]
fn originating_location_data() {
    let location = ComponentLocation::parse("test-flow/source", "http:listener").unwrap();
    let ctx: EventContext<Value> = ContextBuilder::new(flow()).location(location).build();
    assert_eq!(ctx.originating_connector_name(), Some("http"));
    assert_eq!(ctx.originating_source_name(), Some("listener"));

    let location = ComponentLocation::parse("test-flow/source", "test").unwrap();
    let ctx: EventContext<Value> = ContextBuilder::new(flow()).location(location).build();
    assert_eq!(ctx.originating_connector_name(), Some("core"));
    assert_eq!(ctx.originating_source_name(), Some("test"));
}

#[test]
fn child_after_completion_is_refused() {
    let parent = root();
    parent.success(None).unwrap();
    assert!(matches!(
        EventContext::child(&parent),
        Err(ContextError::ParentCompleted(_))
    ));
}

#[test]
fn concurrent_children_complete_parent_exactly_once() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 64;

    let parent = root();
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completions);
    parent.completion_signal().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let children: Vec<EventContext<Value>> =
        (0..THREADS * PER_THREAD).map(|_| child(&parent)).collect();
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let mut workers = Vec::new();
    for batch in children.chunks(PER_THREAD) {
        let batch = batch.to_vec();
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            barrier.wait();
            for c in batch {
                c.success(None).unwrap();
            }
        }));
    }
    let responder = {
        let parent = parent.clone();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            parent.success(Some(test_event())).unwrap();
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    responder.join().unwrap();

    parent.completion_signal().wait_timeout(BLOCK_TIMEOUT).unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert_eq!(parent.child_count(), 0);
}

#[test]
fn concurrent_registration_is_never_missed() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 100;

    let parent = root();
    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let parent = parent.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| {
                        let c = child(&parent);
                        if c.id().ends_with('0') {
                            c.detach();
                        }
                        c.success(None).unwrap();
                        c.id().to_string()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids: Vec<String> = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), total, "child ids must be unique");

    assert_eq!(parent.child_count(), 0);
    assert_completion_not_done(&parent);
    parent.success(None).unwrap();
    assert_completion_done(&parent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_fan_out_with_tokio_tasks() {
    let parent = root();
    let tasks: Vec<_> = (0..32u64)
        .map(|i| {
            let c = child(&parent);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i % 5)).await;
                c.success(Some(json!(i))).unwrap();
                c.completion_signal().wait().await;
            })
        })
        .collect();

    parent.success(Some(test_event())).unwrap();
    futures::future::join_all(tasks)
        .await
        .into_iter()
        .for_each(|r| r.unwrap());

    parent
        .completion_signal()
        .wait_for(BLOCK_TIMEOUT)
        .await
        .unwrap();
    let response = parent.response_signal().wait().await.unwrap();
    assert_eq!(response, Some(test_event()));
}

const CHAIN_DEPTH: usize = 5_000;

fn chain(depth: usize) -> Vec<EventContext<Value>> {
    let mut nodes = vec![root()];
    for _ in 0..depth {
        let next = child(nodes.last().unwrap());
        nodes.push(next);
    }
    nodes
}

#[test]
fn deep_chain_completes_from_the_leaf() {
    // Spawned threads get the default stack size.
    thread::spawn(|| {
        let nodes = chain(CHAIN_DEPTH);
        let (leaf, ancestors) = nodes.split_last().unwrap();
        for node in ancestors {
            node.success(None).unwrap();
        }
        assert_completion_not_done(&nodes[0]);

        leaf.success(None).unwrap();

        assert!(nodes.iter().all(|node| node.is_complete()));
    })
    .join()
    .unwrap();
}

#[test]
fn deep_pending_chain_drops_cleanly() {
    thread::spawn(|| {
        let nodes = chain(CHAIN_DEPTH);
        let root_completion = nodes[0].completion_signal();
        drop(nodes);
        assert!(!root_completion.is_resolved());
    })
    .join()
    .unwrap();
}

#[test]
fn detach_racing_success_completes_parent_once() {
    for _ in 0..200 {
        let parent = root();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        parent.completion_signal().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let c = child(&parent);
        parent.success(None).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let detacher = {
            let c = c.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                c.detach()
            })
        };
        let responder = {
            let c = c.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                c.success(None).unwrap();
            })
        };
        detacher.join().unwrap();
        responder.join().unwrap();

        assert_completion_done(&c);
        assert_completion_done(&parent);
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(parent.child_count(), 0);
    }
}

#[test]
fn flow_name_and_server_id() {
    let parent = root();
    let c = child(&parent);
    assert_eq!(c.flow_name(), "test-flow");
    assert_eq!(c.server_id(), "test-server");
}
