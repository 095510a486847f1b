//! Integration tests for the timer leaf process, driven on virtual time.

use rust_lab::error::LabError;
use rust_lab::eval::EvalStack;
use rust_lab::process::timer::{Timer, TimerSpan};
use rust_lab::process::{Event, EventSink, Point, Process, ProcessModeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::advance;
use tokio_test::assert_ok;

fn spawn_timer(
    timer: &Arc<Timer>,
    point: Option<Point>,
) -> (
    tokio::task::JoinHandle<rust_lab::error::AppResult<()>>,
    mpsc::Receiver<Event>,
) {
    let (sink, rx) = EventSink::channel(16);
    let timer = timer.clone();
    let handle = tokio::spawn(async move {
        let stack = EvalStack::new();
        timer.run(point, &stack, &sink).await
    });
    (handle, rx)
}

#[tokio::test(start_paused = true)]
async fn pause_at_40_percent_leaves_six_seconds() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let (handle, mut rx) = spawn_timer(&timer, None);

    match rx.recv().await.unwrap() {
        Event::Exec { eta, pausable, .. } => {
            assert_eq!(eta, Some(Duration::from_secs(10)));
            assert!(pausable);
        }
        other => panic!("expected exec, got {other:?}"),
    }

    advance(Duration::from_secs(4)).await;
    assert_ok!(timer.pause().await);

    // Double pause fails fast without touching state.
    assert!(matches!(timer.pause().await, Err(LabError::AlreadyPaused)));
    assert_eq!(timer.mode(), ProcessModeKind::Paused);

    match rx.recv().await.unwrap() {
        Event::Pause { point } => {
            assert!((point.as_progress().unwrap() - 0.4).abs() < 1e-9);
        }
        other => panic!("expected pause, got {other:?}"),
    }

    timer.resume().await.unwrap();
    match rx.recv().await.unwrap() {
        Event::Exec { eta, .. } => {
            assert!((eta.unwrap().as_secs_f64() - 6.0).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }

    advance(Duration::from_secs(6)).await;
    match rx.recv().await.unwrap() {
        Event::Termination { point } => {
            assert_eq!(point.as_progress(), Some(1.0));
        }
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn repeated_pause_resume_accumulates_without_drift() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let (handle, mut rx) = spawn_timer(&timer, None);

    for cycle in 0..4u32 {
        match rx.recv().await.unwrap() {
            Event::Exec { .. } => {}
            other => panic!("expected exec, got {other:?}"),
        }
        advance(Duration::from_secs(1)).await;
        timer.pause().await.unwrap();
        match rx.recv().await.unwrap() {
            Event::Pause { point } => {
                let expected = 0.1 * f64::from(cycle + 1);
                assert!((point.as_progress().unwrap() - expected).abs() < 1e-9);
            }
            other => panic!("expected pause, got {other:?}"),
        }
        timer.resume().await.unwrap();
    }

    match rx.recv().await.unwrap() {
        Event::Exec { eta, .. } => {
            assert!((eta.unwrap().as_secs_f64() - 6.0).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(6)).await;
    match rx.recv().await.unwrap() {
        Event::Termination { point } => assert_eq!(point.as_progress(), Some(1.0)),
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resume_from_imported_point() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let point = timer
        .import_point(&serde_json::json!({ "progress": 0.75 }))
        .unwrap();
    let (handle, mut rx) = spawn_timer(&timer, Some(point));

    match rx.recv().await.unwrap() {
        Event::Exec { point, eta, .. } => {
            assert_eq!(point.as_progress(), Some(0.75));
            assert!((eta.unwrap().as_secs_f64() - 2.5).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_millis(2500)).await;
    match rx.recv().await.unwrap() {
        Event::Termination { point } => assert_eq!(point.as_progress(), Some(1.0)),
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn jump_relocates_mid_flight() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let (handle, mut rx) = spawn_timer(&timer, None);

    match rx.recv().await.unwrap() {
        Event::Exec { .. } => {}
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(2)).await;
    timer.jump(Point::progress(0.8)).await.unwrap();

    match rx.recv().await.unwrap() {
        Event::Exec { point, eta, .. } => {
            assert_eq!(point.as_progress(), Some(0.8));
            assert!((eta.unwrap().as_secs_f64() - 2.0).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(2)).await;
    match rx.recv().await.unwrap() {
        Event::Termination { point } => assert_eq!(point.as_progress(), Some(1.0)),
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn jump_while_paused_takes_effect_on_resume() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let (handle, mut rx) = spawn_timer(&timer, None);

    match rx.recv().await.unwrap() {
        Event::Exec { .. } => {}
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(3)).await;
    timer.pause().await.unwrap();
    match rx.recv().await.unwrap() {
        Event::Pause { .. } => {}
        other => panic!("expected pause, got {other:?}"),
    }

    timer.jump(Point::progress(0.5)).await.unwrap();
    // The checkpoint reflects the target a resume will use.
    assert_eq!(timer.export()["progress"].as_f64(), Some(0.5));

    timer.resume().await.unwrap();
    match rx.recv().await.unwrap() {
        Event::Exec { point, eta, .. } => {
            assert_eq!(point.as_progress(), Some(0.5));
            assert!((eta.unwrap().as_secs_f64() - 5.0).abs() < 1e-6);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(5)).await;
    match rx.recv().await.unwrap() {
        Event::Termination { .. } => {}
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn halt_terminates_with_current_progress() {
    let timer = Arc::new(Timer::new(TimerSpan::Duration(Duration::from_secs(10))));
    let (handle, mut rx) = spawn_timer(&timer, None);

    match rx.recv().await.unwrap() {
        Event::Exec { .. } => {}
        other => panic!("expected exec, got {other:?}"),
    }
    advance(Duration::from_secs(5)).await;
    timer.halt().await.unwrap();

    match rx.recv().await.unwrap() {
        Event::Termination { point } => {
            assert!((point.as_progress().unwrap() - 0.5).abs() < 1e-9);
        }
        other => panic!("expected termination, got {other:?}"),
    }
    assert_eq!(timer.mode(), ProcessModeKind::Halted);
    assert!(matches!(timer.halt().await, Err(LabError::ProcessHalted)));
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn forever_timer_terminates_only_on_halt() {
    let timer = Arc::new(Timer::new(TimerSpan::Forever));
    let (handle, mut rx) = spawn_timer(&timer, None);

    match rx.recv().await.unwrap() {
        Event::Exec { eta, pausable, .. } => {
            assert_eq!(eta, None);
            assert!(!pausable);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    assert_eq!(timer.mode(), ProcessModeKind::WaitingForever);

    advance(Duration::from_secs(3600)).await;
    assert!(rx.try_recv().is_err());

    // Pause and jump are not meaningful for an unbounded wait.
    assert!(matches!(
        timer.pause().await,
        Err(LabError::InvalidTransition { .. })
    ));
    assert!(matches!(
        timer.jump(Point::progress(0.5)).await,
        Err(LabError::InvalidTransition { .. })
    ));

    timer.halt().await.unwrap();
    match rx.recv().await.unwrap() {
        Event::Termination { .. } => {}
        other => panic!("expected termination, got {other:?}"),
    }
    handle.await.unwrap().unwrap();
}
