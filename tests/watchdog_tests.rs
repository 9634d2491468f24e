use hdc::channels::{ChannelRegistry, RuntimeState};
use hdc::diagnostics::Diagnostics;
use hdc::protocol::{BusClient, Publisher, RecordingBus, Topics};
use hdc::scheduler::CheckupRunner;
use hdc::watchdog::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

const WINDOW: Duration = Duration::from_secs(7 * 60);
const CHECKUP_TOPIC: &str = "secmon00/checkup";

fn runner(bus: &RecordingBus) -> CheckupRunner {
    let client: Arc<dyn BusClient> = Arc::new(bus.clone());
    CheckupRunner::new(
        Arc::new(Mutex::new(RuntimeState::new(ChannelRegistry::default()))),
        Publisher::new(client, Topics::new("secmon00")),
        Arc::new(Diagnostics::new(Vec::new(), Duration::from_secs(5))),
        1,
        0,
    )
}

#[tokio::test(start_paused = true)]
async fn test_deadman_fires_every_window() {
    let bus = RecordingBus::new();
    let (_signal, requests) = CheckupSignal::channel();
    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();

    sleep(WINDOW - Duration::from_secs(1)).await;
    assert!(bus.published(CHECKUP_TOPIC).is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(bus.published(CHECKUP_TOPIC).len(), 1);

    // Any 7-minute stretch contains a checkup
    sleep(WINDOW * 3).await;
    assert_eq!(bus.published(CHECKUP_TOPIC).len(), 4);

    let stats = watchdog.shutdown().await.unwrap();
    assert_eq!(stats.deadman, 4);
    assert_eq!(stats.total(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_request_restarts_window() {
    let bus = RecordingBus::new();
    let (signal, requests) = CheckupSignal::channel();
    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();

    sleep(Duration::from_secs(300)).await;
    assert!(signal.request(CheckupKind::Requested));
    sleep(Duration::from_secs(1)).await;
    assert_eq!(bus.published(CHECKUP_TOPIC).len(), 1);

    // The original deadline at 420s has been pushed out to 721s
    sleep(Duration::from_secs(300)).await;
    assert_eq!(bus.published(CHECKUP_TOPIC).len(), 1);

    sleep(Duration::from_secs(130)).await;
    assert_eq!(bus.published(CHECKUP_TOPIC).len(), 2);

    let stats = watchdog.shutdown().await.unwrap();
    assert_eq!(stats.requested, 1);
    assert_eq!(stats.deadman, 1);
}

#[tokio::test(start_paused = true)]
async fn test_bootup_request_is_retained_publish() {
    let bus = RecordingBus::new();
    let (signal, requests) = CheckupSignal::channel();
    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();

    signal.request(CheckupKind::Bootup);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(bus.published("secmon00/bootup").len(), 1);
    assert!(bus.published(CHECKUP_TOPIC).is_empty());

    let stats = watchdog.shutdown().await.unwrap();
    assert_eq!(stats.bootup, 1);
}

#[tokio::test(start_paused = true)]
async fn test_requests_after_shutdown_report_closed() {
    let bus = RecordingBus::new();
    let (signal, requests) = CheckupSignal::channel();
    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();

    let stats = watchdog.shutdown().await.unwrap();
    assert_eq!(stats.total(), 0);
    assert!(!signal.request(CheckupKind::Periodic));
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_requests_coalesces() {
    let bus = RecordingBus::new();
    let (signal, requests) = CheckupSignal::channel();

    // Fill the queue before the watchdog starts draining it
    for _ in 0..10 {
        assert!(signal.request(CheckupKind::Periodic));
    }
    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();
    sleep(Duration::from_secs(1)).await;

    let published = bus.published(CHECKUP_TOPIC).len();
    assert!(published >= 1 && published < 10, "{} checkups for 10 requests", published);
    watchdog.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bootup_survives_full_queue() {
    let bus = RecordingBus::new();
    let (signal, requests) = CheckupSignal::channel();

    for _ in 0..4 {
        assert!(signal.request(CheckupKind::Requested));
    }
    assert!(signal.request(CheckupKind::Bootup));
    assert!(signal.request(CheckupKind::Bootup));

    let watchdog = Watchdog::new(runner(&bus), WINDOW, requests).spawn();
    sleep(Duration::from_secs(5)).await;

    assert_eq!(bus.published("secmon00/bootup").len(), 1);
    let stats = watchdog.shutdown().await.unwrap();
    assert_eq!(stats.bootup, 1);
    assert_eq!(stats.requested, 4);
}

#[test]
fn test_parked_bootup_served_first() {
    let (signal, mut requests) = CheckupSignal::channel();
    for _ in 0..4 {
        signal.request(CheckupKind::Periodic);
    }
    signal.request(CheckupKind::Bootup);

    assert_eq!(requests.try_recv().ok(), Some(CheckupKind::Bootup));
    assert_eq!(requests.try_recv().ok(), Some(CheckupKind::Periodic));
}
