use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use slicer_lite::config::Lifecycle;
use slicer_lite::controller::ControllerEvent;
use slicer_lite::error::SlicerError;
use slicer_lite::events::EventHub;
use slicer_lite::scheduler::{Scheduler, Slice, SliceQueue};
use slicer_lite::slicer::{
    from_fn, GeneratorSlicer, ListSlicer, SliceOutput, Slicer, SlicerContext, SlicerHooks,
    StartingPoint,
};

fn context(lifecycle: Lifecycle, slicers: usize) -> SlicerContext {
    SlicerContext {
        ex_id: "ex-1".to_string(),
        job_id: "job-1".to_string(),
        lifecycle,
        slicers,
        workers: 1,
        operations: Vec::new(),
        recovered: false,
        events: EventHub::new(),
    }
}

fn scheduler(max_queue_length: usize) -> (Scheduler, EventHub<ControllerEvent>) {
    let events = EventHub::new();
    let hooks = SlicerHooks::new(Arc::new(ListSlicer::new(Vec::new())));
    let scheduler = Scheduler::new("ex-1", "job-1", hooks, events.clone(), max_queue_length);
    (scheduler, events)
}

fn slice(order: u64) -> Slice {
    Slice::new("ex-1", "job-1", 0, order, json!({ "n": order }))
}

#[test]
fn test_queue_requeue_goes_to_front() {
    let mut queue = SliceQueue::with_capacity(3);
    queue.push_back(slice(1));
    queue.push_back(slice(2));
    queue.push_front(slice(0));

    assert_eq!(queue.len(), 3);
    assert!(queue.is_full());

    let taken: Vec<u64> = queue.take(2).iter().map(|s| s.slicer_order).collect();
    assert_eq!(taken, vec![0, 1]);
    assert_eq!(queue.pop_front().map(|s| s.slicer_order), Some(2));
    assert!(queue.is_empty());
}

#[test]
fn test_queue_clear_reports_dropped() {
    let mut queue = SliceQueue::new();
    queue.push_back(slice(0));
    queue.push_back(slice(1));
    assert_eq!(queue.clear(), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_scheduler_drains_slicer_and_finishes() {
    let (scheduler, events) = scheduler(100);
    let mut finished = events.subscribe();

    let mut n = 0;
    scheduler.register_slicers(vec![from_fn(move || {
        n += 1;
        Ok(if n <= 5 {
            SliceOutput::Slice(json!({ "n": n }))
        } else {
            SliceOutput::Done
        })
    })]);

    tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler should finish")
        .unwrap();

    assert!(scheduler.slicers_done());
    assert!(!scheduler.has_failed());
    assert_eq!(scheduler.queue_length(), 5);
    assert!(!scheduler.is_finished());

    let orders: Vec<u64> = scheduler.get_slices(10).iter().map(|s| s.slicer_order).collect();
    assert_eq!(orders, vec![0, 1, 2, 3, 4]);
    assert!(scheduler.is_finished());

    match finished.recv().await {
        Some(ControllerEvent::SlicersFinished(None)) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_scheduler_respects_queue_length() {
    let (scheduler, _events) = scheduler(3);
    scheduler.register_slicers(vec![from_fn(|| Ok(SliceOutput::Slice(json!({}))))]);

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scheduler.queue_length(), 3);

    assert_eq!(scheduler.get_slices(2).len(), 2);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(scheduler.queue_length(), 3);

    scheduler.cleanup();
    handle.await.unwrap().unwrap();
    assert_eq!(scheduler.queue_length(), 0);
    assert!(scheduler.is_finished());
    assert!(!scheduler.slicers_done());
}

#[tokio::test]
async fn test_scheduler_pause_stops_production() {
    let (scheduler, _events) = scheduler(1_000);
    scheduler.pause();
    scheduler.register_slicers(vec![from_fn(|| Ok(SliceOutput::Slice(json!({}))))]);

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.is_paused());
    assert_eq!(scheduler.queue_length(), 0);

    scheduler.resume();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.queue_length() > 0);

    scheduler.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_slicer_error_fails_scheduler() {
    let (scheduler, events) = scheduler(100);
    let mut received = events.subscribe();
    scheduler.register_slicers(vec![from_fn(|| Err(SlicerError::Slicer("bad reader".into())))]);

    tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler should stop")
        .unwrap();

    assert!(scheduler.has_failed());
    assert!(!scheduler.slicers_done());
    match received.recv().await {
        Some(ControllerEvent::SlicersFinished(Some(reason))) => {
            assert!(reason.contains("bad reader"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_scheduler_runs_only_once() {
    let (scheduler, _events) = scheduler(100);
    scheduler.set_recovering(true);

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(scheduler.run().await.is_err());

    scheduler.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_recovering_scheduler_waits_for_more_slicers() {
    let (scheduler, _events) = scheduler(100);
    scheduler.set_recovering(true);
    scheduler.register_slicers(vec![from_fn(|| Ok(SliceOutput::Done))]);

    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!scheduler.slicers_done());

    let mut sent = false;
    scheduler.register_slicers(vec![from_fn(move || {
        Ok(if sent {
            SliceOutput::Done
        } else {
            sent = true;
            SliceOutput::Slice(json!({ "late": true }))
        })
    })]);
    scheduler.set_recovering(false);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should finish")
        .unwrap()
        .unwrap();
    assert!(scheduler.slicers_done());
    assert_eq!(scheduler.queue_length(), 1);
}

#[tokio::test]
async fn test_generator_splits_range_across_slicers() {
    let slicer = GeneratorSlicer::new(25, 10);
    let mut fns = slicer
        .new_slicer(&context(Lifecycle::Once, 2), &[])
        .await
        .unwrap();
    assert_eq!(fns.len(), 2);

    let mut requests = Vec::new();
    for f in fns.iter_mut() {
        while let SliceOutput::Slice(request) = f.next_slice().await.unwrap() {
            requests.push(request);
        }
    }
    assert_eq!(
        requests,
        vec![
            json!({ "offset": 0, "count": 10 }),
            json!({ "offset": 10, "count": 2 }),
            json!({ "offset": 12, "count": 10 }),
            json!({ "offset": 22, "count": 3 }),
        ]
    );
}

#[tokio::test]
async fn test_generator_resumes_after_starting_point() {
    let slicer = GeneratorSlicer::new(50, 10);
    let points = [StartingPoint {
        slicer_id: 0,
        request: json!({ "offset": 20, "count": 10 }),
    }];
    let mut fns = slicer
        .new_slicer(&context(Lifecycle::Once, 1), &points)
        .await
        .unwrap();

    let mut offsets = Vec::new();
    while let SliceOutput::Slice(request) = fns[0].next_slice().await.unwrap() {
        offsets.push(request["offset"].as_u64().unwrap());
    }
    assert_eq!(offsets, vec![30, 40]);
}

#[tokio::test]
async fn test_persistent_generator_never_finishes() {
    let slicer = GeneratorSlicer::new(5, 5);
    let mut fns = slicer
        .new_slicer(&context(Lifecycle::Persistent, 1), &[])
        .await
        .unwrap();
    for _ in 0..100 {
        assert_eq!(
            fns[0].next_slice().await.unwrap(),
            SliceOutput::Slice(json!({ "count": 5 }))
        );
    }
}

#[test]
fn test_generator_from_operation() {
    let slicer = GeneratorSlicer::from_operation(&json!({ "size": 30, "chunk": 3 })).unwrap();
    assert_eq!(slicer.size, 30);
    assert_eq!(slicer.chunk, 3);

    assert!(GeneratorSlicer::from_operation(&json!({ "chunk": 0 })).is_err());
}

#[tokio::test]
async fn test_list_slicer_skips_through_starting_point() {
    let requests: Vec<_> = (0..4).map(|n| json!({ "n": n })).collect();
    let slicer = ListSlicer::new(requests);
    let points = [StartingPoint {
        slicer_id: 0,
        request: json!({ "n": 1 }),
    }];
    let mut fns = slicer
        .new_slicer(&context(Lifecycle::Once, 1), &points)
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let SliceOutput::Slice(request) = fns[0].next_slice().await.unwrap() {
        seen.push(request["n"].as_u64().unwrap());
    }
    assert_eq!(seen, vec![2, 3]);
}
