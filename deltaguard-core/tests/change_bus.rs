use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deltaguard_core::change_bus::{BusMode, ChangeBus, ChangeBusConfig, ChangeEvent, ChangedItem};
use deltaguard_core::store::{JobStore, JobWriteStream, MemoryJobStore, StoreResult};
use deltaguard_core::types::{Job, JobId, JobPatch, JobSource, NewJob};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn channel_handler() -> (
    mpsc::UnboundedReceiver<ChangeEvent>,
    Arc<dyn Fn(&ChangeEvent) + Send + Sync>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        rx,
        Arc::new(move |event: &ChangeEvent| {
            let _ = tx.send(event.clone());
        }),
    )
}

async fn next(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("change event")
        .expect("bus alive")
}

fn new_job() -> NewJob {
    NewJob::new(JobSource::object("firmware", "uploads/router.bin"))
}

#[tokio::test]
async fn push_mode_forwards_each_write() {
    let store = Arc::new(MemoryJobStore::new());
    let bus = ChangeBus::new(store.clone(), ChangeBusConfig::default());
    assert_eq!(bus.mode(), None);

    let (mut rx, handler) = channel_handler();
    let _subscription = bus.subscribe(handler).await;
    assert_eq!(bus.mode(), Some(BusMode::Push));

    let job = store.create(new_job()).await.unwrap();
    match next(&mut rx).await {
        ChangeEvent::Changed {
            item: ChangedItem::Job(item),
        } => assert_eq!(*item, job),
        other => panic!("unexpected event {other:?}"),
    }

    store.delete(job.id).await.unwrap();
    assert_eq!(
        next(&mut rx).await,
        ChangeEvent::Changed {
            item: ChangedItem::Deleted {
                id: job.id,
                deleted: true
            }
        }
    );
}

#[tokio::test(start_paused = true)]
async fn poll_mode_rebroadcasts_recent_rows_every_tick() {
    let store = Arc::new(MemoryJobStore::without_push());
    let job = store.create(new_job()).await.unwrap();
    let bus = ChangeBus::new(
        store.clone(),
        ChangeBusConfig {
            poll_interval: Duration::from_secs(2),
            poll_limit: 50,
        },
    );

    let (mut rx, handler) = channel_handler();
    let _subscription = bus.subscribe(handler).await;
    assert_eq!(bus.mode(), Some(BusMode::Poll));

    // Unchanged rows are still delivered on each tick.
    for _ in 0..2 {
        assert_eq!(
            next(&mut rx).await,
            ChangeEvent::ChangedBulk {
                items: vec![job.clone()]
            }
        );
    }
}

#[tokio::test]
async fn panicking_handler_does_not_block_others() {
    let store = Arc::new(MemoryJobStore::new());
    let bus = ChangeBus::new(store.clone(), ChangeBusConfig::default());

    let _bad = bus.subscribe(Arc::new(|_| panic!("handler bug"))).await;
    let (mut rx, handler) = channel_handler();
    let _good = bus.subscribe(handler).await;
    assert_eq!(bus.subscriber_count(), 2);

    let job = store.create(new_job()).await.unwrap();
    assert!(matches!(next(&mut rx).await, ChangeEvent::Changed { .. }));

    store
        .update(job.id, JobPatch::running(chrono::Utc::now()))
        .await
        .unwrap();
    match next(&mut rx).await {
        ChangeEvent::Changed {
            item: ChangedItem::Job(item),
        } => assert_eq!(item.id, job.id),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn dropped_subscription_stops_delivery() {
    let store = Arc::new(MemoryJobStore::new());
    let bus = ChangeBus::new(store.clone(), ChangeBusConfig::default());
    let (_rx, handler) = channel_handler();
    let subscription = bus.subscribe(handler).await;
    assert_eq!(bus.subscriber_count(), 1);
    drop(subscription);
    assert_eq!(bus.subscriber_count(), 0);
}

/// Offers a push stream that ends immediately.
struct ShortLivedPush(MemoryJobStore);

#[async_trait]
impl JobStore for ShortLivedPush {
    async fn create(&self, new: NewJob) -> StoreResult<Job> {
        self.0.create(new).await
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.0.get(id).await
    }

    async fn list(&self, limit: usize) -> StoreResult<Vec<Job>> {
        self.0.list(limit).await
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> StoreResult<Job> {
        self.0.update(id, patch).await
    }

    async fn delete(&self, id: JobId) -> StoreResult<bool> {
        self.0.delete(id).await
    }

    async fn subscribe_writes(&self) -> StoreResult<JobWriteStream> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[tokio::test]
async fn ended_push_stream_falls_back_to_polling() {
    let store = Arc::new(ShortLivedPush(MemoryJobStore::without_push()));
    let job = store.create(new_job()).await.unwrap();
    let bus = ChangeBus::new(
        store.clone(),
        ChangeBusConfig {
            poll_interval: Duration::from_millis(20),
            poll_limit: 10,
        },
    );

    let (mut rx, handler) = channel_handler();
    let _subscription = bus.subscribe(handler).await;

    assert_eq!(
        next(&mut rx).await,
        ChangeEvent::ChangedBulk { items: vec![job] }
    );
    assert_eq!(bus.mode(), Some(BusMode::Poll));
}
