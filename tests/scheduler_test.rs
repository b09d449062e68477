//! Both scheduler variants against the simulated wavemeter, exercised
//! through the shared `AcquisitionScheduler` interface.

use spectro_scan::acquisition::{
    AcquisitionScheduler, EventDrivenScheduler, FrequencyEvents, IntervalScheduler, ReadScalar,
};
use spectro_scan::hardware::mock::{MockVoltageSource, MockWavemeter};
use spectro_scan::hardware::VoltageOutput;
use spectro_scan::measurement::SampleStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

async fn collect_window(scheduler: &mut dyn AcquisitionScheduler, window: Duration) -> SampleStats {
    scheduler.start().await.unwrap();
    assert!(scheduler.is_running());
    sleep(window).await;
    scheduler.stop().await;
    assert!(!scheduler.is_running());
    let queue = scheduler.data();
    assert!(queue.is_closed());
    SampleStats::from_samples(&queue.snapshot())
}

#[tokio::test]
async fn interval_window_follows_the_output_voltage() {
    let output = Arc::new(MockVoltageSource::new(5.0, 1000.0));
    let wavemeter = Arc::new(MockWavemeter::tracking(Arc::clone(&output), 100.0, 10.0, 0.0));
    let mut scheduler = IntervalScheduler::new(
        wavemeter,
        Arc::new(ReadScalar::new("wavemeter")),
        Duration::from_millis(5),
    )
    .unwrap();

    output.set_output(2.0, 1000.0).await.unwrap();
    let stats = collect_window(&mut scheduler, Duration::from_millis(40)).await;
    assert!(stats.n > 0);
    assert!((stats.mean - 120.0).abs() < 1e-9);
    assert_eq!(stats.stddev, 0.0);
}

#[tokio::test]
async fn event_window_collects_pushed_frequencies() {
    let wavemeter = Arc::new(
        MockWavemeter::with_sequence(vec![9.95, 10.05]).with_event_period(Duration::from_millis(2)),
    );
    let mut scheduler = EventDrivenScheduler::new(
        Arc::clone(&wavemeter) as Arc<dyn spectro_scan::hardware::CallbackSource>,
        Arc::new(FrequencyEvents::new(vec![1], "wavemeter")),
    )
    .unwrap()
    .with_quiescence(Duration::from_millis(10));

    let stats = collect_window(&mut scheduler, Duration::from_millis(50)).await;
    assert!(stats.n > 0);
    assert!(stats.stddev <= 0.05 + 1e-9);
    assert!(!wavemeter.has_callback());
}

#[tokio::test]
async fn consecutive_windows_do_not_share_samples() {
    let wavemeter = Arc::new(MockWavemeter::new(50.0, 0.0));
    let mut scheduler = IntervalScheduler::new(
        wavemeter,
        Arc::new(ReadScalar::new("wavemeter")),
        Duration::from_millis(5),
    )
    .unwrap();

    collect_window(&mut scheduler, Duration::from_millis(20)).await;
    let first = scheduler.data();
    let first_len = first.len();
    assert!(first_len > 0);

    scheduler.start().await.unwrap();
    sleep(Duration::from_millis(20)).await;
    scheduler.stop().await;

    assert!(!scheduler.data().is_empty());
    assert_eq!(first.len(), first_len);
}
