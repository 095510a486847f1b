//! Integration tests for the block/program tree composites.

mod common;

use common::run_collect;
use rust_lab::error::LabError;
use rust_lab::eval::{EvalStack, Expr};
use rust_lab::process::mock::{MockBlock, MockObserver};
use rust_lab::process::timer::TimerBlock;
use rust_lab::process::{Event, EventSink, Point};
use rust_lab::protocol::{Block, Eta, RepeatBlock, SequenceBlock, ShorthandBlock};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn repeat_runs_three_fresh_children_in_order() {
    let observer = MockObserver::new("index");
    let child = Arc::new(MockBlock::succeeding(Duration::from_millis(10)).observed(observer.clone()));
    let block = RepeatBlock::new(Expr::Int(3), child);
    let program = block.create_program();

    let (result, events) = run_collect(program, None, EvalStack::new()).await;
    result.unwrap();

    // Each iteration saw its own index binding, in order.
    assert_eq!(observer.seen(), vec![json!(0), json!(1), json!(2)]);

    let exec_indices: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            Event::Exec {
                point: Point::Child { index, .. },
                ..
            } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(exec_indices, vec![0, 1, 2]);

    // Every child program was a fresh instance starting at step 0.
    for event in &events {
        if let Event::Exec { point, .. } = event {
            let Point::Child {
                inner: Some(inner), ..
            } = point
            else {
                panic!("unwrapped point: {point:?}");
            };
            assert_eq!(inner.as_ref(), &Point::Leaf(json!({ "step": 0 })));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn forever_repeat_stops_only_on_halt() {
    let block = Arc::new(RepeatBlock::new(
        Expr::Forever,
        Arc::new(MockBlock::succeeding(Duration::from_millis(10))),
    ));
    let program = block.create_program();
    let (sink, mut rx) = EventSink::channel(16);
    let handle = {
        let program = program.clone();
        tokio::spawn(async move {
            let stack = EvalStack::new();
            program.run(None, &stack, &sink).await
        })
    };

    let mut iterations = 0;
    while iterations < 5 {
        if let Event::Exec {
            point: Point::Child { index, .. },
            ..
        } = rx.recv().await.unwrap()
        {
            iterations = index + 1;
        }
    }

    program.halt().await.unwrap();
    while rx.recv().await.is_some() {}
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn unevaluable_count_blocks_with_diagnostics() {
    let block = Arc::new(RepeatBlock::new(
        Expr::Var("missing".into()),
        Arc::new(MockBlock::succeeding(Duration::from_millis(1))),
    ));
    assert_eq!(block.eta(), Eta::Unknown);

    let program = block.create_program();
    let (sink, mut rx) = EventSink::channel(16);
    let handle = {
        let program = program.clone();
        tokio::spawn(async move {
            let stack = EvalStack::new();
            program.run(None, &stack, &sink).await
        })
    };

    match rx.recv().await.unwrap() {
        Event::Failure { analysis, point } => {
            assert!(analysis.errors[0].message.contains("missing"));
            assert_eq!(point, Point::child(0, None));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Blocked, not crashed; only a halt releases it.
    assert!(!handle.is_finished());
    program.halt().await.unwrap();
    while rx.recv().await.is_some() {}
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shorthand_binds_argument_and_exports_transparently() {
    let observer = MockObserver::new("n");
    let inner = Arc::new(MockBlock::succeeding(Duration::from_millis(5)).observed(observer.clone()));
    let repeat = Arc::new(RepeatBlock::new(Expr::Var("n".into()), inner));
    let block = ShorthandBlock::new("n", json!(2), repeat.clone());

    // Transparent wrapping: the export is the child's own.
    assert_eq!(block.export(), repeat.export());
    assert_eq!(block.eta(), Eta::Unknown);

    let program = block.create_program();
    let (result, events) = run_collect(program, None, EvalStack::new()).await;
    result.unwrap();

    // The bound argument resolved the count; both children saw it.
    assert_eq!(observer.seen(), vec![json!(2), json!(2)]);
    let exec_indices: Vec<u64> = events
        .iter()
        .filter_map(|event| match event {
            Event::Exec {
                point: Point::Child { index, .. },
                ..
            } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(exec_indices, vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn sequence_runs_children_in_order() {
    let block = SequenceBlock::new(vec![
        Arc::new(TimerBlock::duration(Duration::from_millis(100))) as Arc<dyn Block>,
        Arc::new(TimerBlock::duration(Duration::from_millis(200))),
    ]);
    assert_eq!(block.eta(), Eta::Finite(Duration::from_millis(300)));

    let program = block.create_program();
    let (result, events) = run_collect(program, None, EvalStack::new()).await;
    result.unwrap();

    let order: Vec<u64> = events
        .iter()
        .filter_map(|event| match event.point() {
            Point::Child { index, .. } => Some(*index),
            Point::Leaf(_) => None,
        })
        .collect();
    assert_eq!(order, vec![0, 0, 1, 1]);
    match events.last().unwrap() {
        Event::Termination { point } => {
            let Point::Child {
                index: 1,
                inner: Some(inner),
            } = point
            else {
                panic!("unexpected point: {point:?}");
            };
            assert_eq!(inner.as_progress(), Some(1.0));
        }
        other => panic!("expected termination, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn pause_propagates_to_the_active_leaf() {
    let block = SequenceBlock::new(vec![
        Arc::new(TimerBlock::duration(Duration::from_secs(10))) as Arc<dyn Block>
    ]);
    let program = block.create_program();
    let (sink, mut rx) = EventSink::channel(16);
    let handle = {
        let program = program.clone();
        tokio::spawn(async move {
            let stack = EvalStack::new();
            program.run(None, &stack, &sink).await
        })
    };

    match rx.recv().await.unwrap() {
        Event::Exec { .. } => {}
        other => panic!("expected exec, got {other:?}"),
    }
    tokio::time::advance(Duration::from_secs(2)).await;
    program.pause().await.unwrap();

    match rx.recv().await.unwrap() {
        Event::Pause { point } => {
            let Point::Child {
                index: 0,
                inner: Some(inner),
            } = point
            else {
                panic!("unexpected point: {point:?}");
            };
            assert!((inner.as_progress().unwrap() - 0.2).abs() < 1e-9);
        }
        other => panic!("expected pause, got {other:?}"),
    }

    // The exported position reflects the paused leaf.
    let point = program.export_point();
    let Point::Child {
        index: 0,
        inner: Some(inner),
    } = point
    else {
        panic!("unexpected point");
    };
    assert!((inner.as_progress().unwrap() - 0.2).abs() < 1e-9);

    program.resume().await.unwrap();
    match rx.recv().await.unwrap() {
        Event::Exec { eta, .. } => {
            assert!((eta.unwrap().as_secs_f64() - 8.0).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    tokio::time::advance(Duration::from_secs(8)).await;
    while rx.recv().await.is_some() {}
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn composite_point_validation() {
    let sequence = SequenceBlock::new(vec![
        Arc::new(TimerBlock::duration(Duration::from_secs(1))) as Arc<dyn Block>,
        Arc::new(TimerBlock::duration(Duration::from_secs(2))),
    ]);
    assert!(sequence
        .import_point(&json!({ "child": { "index": 1, "inner": { "leaf": { "progress": 0.5 } } } }))
        .is_ok());
    assert!(matches!(
        sequence.import_point(&json!({ "child": { "index": 5 } })),
        Err(LabError::SegmentOutOfRange(5))
    ));
    assert!(sequence
        .import_point(&json!({ "leaf": { "progress": 0.5 } }))
        .is_err());

    let repeat = RepeatBlock::new(
        Expr::Int(2),
        Arc::new(TimerBlock::duration(Duration::from_secs(1))),
    );
    assert!(repeat
        .import_point(&json!({ "child": { "index": 1 } }))
        .is_ok());
    assert!(repeat
        .import_point(&json!({ "child": { "index": 2 } }))
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn repeat_resumes_from_iteration_point() {
    let observer = MockObserver::new("index");
    let child = Arc::new(MockBlock::succeeding(Duration::from_millis(10)).observed(observer.clone()));
    let block = RepeatBlock::new(Expr::Int(4), child);
    let point = block
        .import_point(&json!({ "child": { "index": 2 } }))
        .unwrap();
    let program = block.create_program();

    let (result, _events) = run_collect(program, Some(point), EvalStack::new()).await;
    result.unwrap();
    assert_eq!(observer.seen(), vec![json!(2), json!(3)]);
}
