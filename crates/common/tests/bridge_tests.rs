//! Command bridge integration tests
//!
//! Exercise the channel bridge between a Tokio runtime and a blocking worker
//! thread: request/response over oneshot channels, event flow, backpressure
//! and shutdown on disconnect.
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::{CommandWorker, create_bridge};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Command {
    Add {
        a: u32,
        b: u32,
        response: oneshot::Sender<u32>,
    },
    Emit(u32),
    Stop,
}

#[derive(Debug, PartialEq)]
enum Event {
    Value(u32),
    Stopped,
}

/// Minimal worker loop in the style of the driver thread
fn run_worker(worker: CommandWorker<Command, Event>, handled: Arc<AtomicU32>) {
    while let Ok(cmd) = worker.recv_command() {
        handled.fetch_add(1, Ordering::SeqCst);
        match cmd {
            Command::Add { a, b, response } => {
                let _ = response.send(a + b);
            }
            Command::Emit(v) => {
                let _ = worker.send_event(Event::Value(v));
            }
            Command::Stop => {
                let _ = worker.send_event(Event::Stopped);
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_request_response() {
    let (bridge, worker) = create_bridge::<Command, Event>(8);
    let handled = Arc::new(AtomicU32::new(0));
    let counter = handled.clone();
    let handle = thread::spawn(move || run_worker(worker, counter));

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(Command::Add {
            a: 2,
            b: 40,
            response: tx,
        })
        .await
        .unwrap();
    assert_eq!(timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap(), 42);

    bridge.send_command(Command::Stop).await.unwrap();
    assert_eq!(bridge.recv_event().await.unwrap(), Event::Stopped);

    handle.join().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, worker) = create_bridge::<Command, Event>(16);
    let handle = thread::spawn(move || run_worker(worker, Arc::new(AtomicU32::new(0))));

    for v in 0..5 {
        bridge.send_command(Command::Emit(v)).await.unwrap();
    }
    for v in 0..5 {
        let event = timeout(TEST_TIMEOUT, bridge.recv_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, Event::Value(v));
    }

    bridge.send_command(Command::Stop).await.unwrap();
    handle.join().unwrap();
}

#[tokio::test]
async fn test_cloned_bridges_share_worker() {
    let (bridge, worker) = create_bridge::<Command, Event>(8);
    let handle = thread::spawn(move || run_worker(worker, Arc::new(AtomicU32::new(0))));

    let other = bridge.clone();
    let (tx, rx) = oneshot::channel();
    other
        .send_command(Command::Add {
            a: 1,
            b: 1,
            response: tx,
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), 2);

    other.send_command(Command::Stop).await.unwrap();
    handle.join().unwrap();
}

#[tokio::test]
async fn test_worker_exits_when_bridge_dropped() {
    let (bridge, worker) = create_bridge::<Command, Event>(8);
    let handled = Arc::new(AtomicU32::new(0));
    let counter = handled.clone();
    let handle = thread::spawn(move || run_worker(worker, counter));

    drop(bridge);
    handle.join().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_send_fails_after_worker_gone() {
    let (bridge, worker) = create_bridge::<Command, Event>(8);
    drop(worker);

    assert!(bridge.send_command(Command::Emit(1)).await.is_err());
    assert!(bridge.recv_event().await.is_err());
    assert!(bridge.try_recv_event().is_none());
}

#[test]
fn test_event_backpressure() {
    let (bridge, worker) = create_bridge::<Command, Event>(2);

    assert!(worker.try_send_event(Event::Value(1)).is_ok());
    assert!(worker.try_send_event(Event::Value(2)).is_ok());
    assert_eq!(
        worker.try_send_event(Event::Value(3)),
        Err(Event::Value(3))
    );

    assert_eq!(bridge.try_recv_event(), Some(Event::Value(1)));
    assert!(worker.try_send_event(Event::Value(3)).is_ok());
}
