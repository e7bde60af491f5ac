use std::sync::Arc;
use std::time::Duration;

use deltaguard_core::progress_log::ProgressLog;
use deltaguard_core::tailer::{TailerConfig, TailerRegistry};
use deltaguard_core::types::{JobId, ProgressRecord};
use parking_lot::Mutex;

type Seen = Arc<Mutex<Vec<String>>>;

fn collector() -> (Seen, Arc<dyn Fn(&ProgressRecord) + Send + Sync>) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (
        seen,
        Arc::new(move |record: &ProgressRecord| sink.lock().push(record.stage.clone())),
    )
}

async fn wait_for_len(seen: &Seen, len: usize) {
    for _ in 0..200 {
        if seen.lock().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {len} records, got {:?}", seen.lock());
}

async fn append_steps(log: &ProgressLog, job: JobId, steps: std::ops::Range<usize>) {
    for step in steps {
        log.append(job, &format!("step{step}"), None, None)
            .await
            .unwrap();
    }
}

fn stages(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|step| format!("step{step}")).collect()
}

#[tokio::test]
async fn late_subscribers_get_backlog_then_live_records_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ProgressLog::new(dir.path()));
    let tailers = TailerRegistry::new(
        Arc::clone(&log),
        TailerConfig {
            interval: Duration::from_millis(20),
            backlog: 3,
            batch: 200,
        },
    );
    let job = JobId::new();

    append_steps(&log, job, 0..5).await;
    let (first_seen, first) = collector();
    let _first = tailers.subscribe(job, first).await.unwrap();
    assert_eq!(*first_seen.lock(), stages(2..=4));

    append_steps(&log, job, 5..7).await;
    wait_for_len(&first_seen, 5).await;

    let (second_seen, second) = collector();
    let _second = tailers.subscribe(job, second).await.unwrap();
    assert_eq!(*second_seen.lock(), stages(4..=6));

    append_steps(&log, job, 7..8).await;
    wait_for_len(&first_seen, 6).await;
    wait_for_len(&second_seen, 4).await;
    // A few more ticks to surface any duplicate delivery.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*first_seen.lock(), stages(2..=7));
    assert_eq!(*second_seen.lock(), stages(4..=7));
    assert_eq!(tailers.subscriber_count(job), 2);
}

#[tokio::test]
async fn subscribing_before_the_file_exists() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ProgressLog::new(dir.path()));
    let tailers = TailerRegistry::new(
        Arc::clone(&log),
        TailerConfig {
            interval: Duration::from_millis(20),
            ..TailerConfig::default()
        },
    );
    let job = JobId::new();

    let (seen, handler) = collector();
    let _subscription = tailers.subscribe(job, handler).await.unwrap();
    assert!(seen.lock().is_empty());

    append_steps(&log, job, 0..3).await;
    wait_for_len(&seen, 3).await;
    assert_eq!(*seen.lock(), stages(0..=2));
}

#[tokio::test]
async fn panicking_subscriber_does_not_starve_others() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ProgressLog::new(dir.path()));
    let tailers = TailerRegistry::new(
        Arc::clone(&log),
        TailerConfig {
            interval: Duration::from_millis(20),
            ..TailerConfig::default()
        },
    );
    let job = JobId::new();

    let _bad = tailers
        .subscribe(job, Arc::new(|_| panic!("subscriber bug")))
        .await
        .unwrap();
    let (seen, handler) = collector();
    let _good = tailers.subscribe(job, handler).await.unwrap();

    append_steps(&log, job, 0..2).await;
    wait_for_len(&seen, 2).await;
    assert_eq!(*seen.lock(), stages(0..=1));
}

#[tokio::test]
async fn unsubscribing_everyone_stops_the_job_loop() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(ProgressLog::new(dir.path()));
    let tailers = TailerRegistry::new(Arc::clone(&log), TailerConfig::default());
    let job = JobId::new();

    let (_, first) = collector();
    let (_, second) = collector();
    let a = tailers.subscribe(job, first).await.unwrap();
    let b = tailers.subscribe(job, second).await.unwrap();
    assert_eq!(tailers.subscriber_count(job), 2);

    drop(a);
    assert_eq!(tailers.active_jobs(), vec![job]);
    drop(b);
    assert!(tailers.active_jobs().is_empty());
    assert_eq!(tailers.subscriber_count(job), 0);
}
