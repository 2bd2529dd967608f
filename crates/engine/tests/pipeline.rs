//! End-to-end pipeline tests on the in-memory store.
//!
//! Channel senders are scripted, so every scenario is deterministic and
//! needs no database or provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use herald_common::config::PipelineConfig;
use herald_common::types::{
    BroadcastStatus, ChannelType, DeliveryStatus, NotificationKind, OutboundMessage, Priority,
    Recipient, Role, TargetSpec,
};
use herald_engine::broadcast::{BroadcastService, CreateBroadcastParams, ScheduleNotificationParams};
use herald_engine::directory::MemoryDirectory;
use herald_engine::dispatcher::{Dispatcher, DispatcherConfig};
use herald_engine::materializer::Materializer;
use herald_engine::retry::{RetryEngine, RetryPolicy};
use herald_engine::scheduler::Scheduler;
use herald_engine::store::{CompletionPolicy, DeliveryStore, MemoryStore};
use herald_notifier::{ChannelRegistry, ChannelSender, DeliveryReceipt, RateLimit, SendError};

// ============================================================
// Shared helpers
// ============================================================

type Script = dyn Fn(&Recipient) -> Result<DeliveryReceipt, SendError> + Send + Sync;

/// Sender whose result is decided by a closure over the recipient.
struct ScriptedSender {
    channel: ChannelType,
    limit: Option<RateLimit>,
    script: Box<Script>,
    calls: AtomicUsize,
}

impl ScriptedSender {
    fn new(
        channel: ChannelType,
        script: impl Fn(&Recipient) -> Result<DeliveryReceipt, SendError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel,
            limit: None,
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    fn ok(channel: ChannelType) -> Self {
        Self::new(channel, |_| Ok(DeliveryReceipt::with_id("msg")))
    }

    fn with_limit(mut self, limit: RateLimit) -> Self {
        self.limit = Some(limit);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn channel(&self) -> ChannelType {
        self.channel
    }

    fn recipient_limit(&self) -> Option<RateLimit> {
        self.limit
    }

    async fn send(
        &self,
        recipient: &Recipient,
        _message: &OutboundMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        (self.script)(recipient)
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        retry_base_delay_secs: 300,
        retry_backoff_multiplier: 2.0,
        max_attempts: 3,
        ..PipelineConfig::default()
    }
}

fn users(n: usize) -> (MemoryDirectory, Vec<Uuid>) {
    let ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
    let dir = ids.iter().fold(MemoryDirectory::new(), |dir, id| {
        dir.user(
            Recipient {
                user_id: *id,
                email: Some(format!("{}@school.test", id)),
                phone: Some("+447700900123".into()),
                ..Default::default()
            },
            Role::Student,
        )
    });
    (dir, ids)
}

struct Harness {
    store: Arc<MemoryStore>,
    service: BroadcastService,
    scheduler: Scheduler,
}

fn harness(dir: MemoryDirectory, senders: ChannelRegistry, policy: CompletionPolicy) -> Harness {
    let store = Arc::new(MemoryStore::new(policy));
    let config = config();
    Harness {
        service: BroadcastService::new(store.clone(), &config),
        scheduler: Scheduler::new(store.clone(), Arc::new(dir), senders, &config),
        store,
    }
}

fn custom(ids: &[Uuid], channel: ChannelType) -> CreateBroadcastParams {
    CreateBroadcastParams {
        title: "Timetable change".into(),
        message: "Tuesday lessons start at 9:30.".into(),
        target_spec: TargetSpec::Custom(ids.to_vec()),
        channels: vec![channel],
        kind: NotificationKind::Announcement,
        priority: Priority::Normal,
        related_object: None,
        scheduled_at: None,
        max_attempts: None,
    }
}

fn after_creation() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(1)
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_permanent_failure_among_successes_completes() {
    let (dir, ids) = users(3);
    let bad = ids[1];
    let sender = ScriptedSender::new(ChannelType::Email, move |r| {
        if r.user_id == bad {
            Err(SendError::Permanent("mailbox does not exist".into()))
        } else {
            Ok(DeliveryReceipt::with_id("ok"))
        }
    });
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(sender)),
        CompletionPolicy::default(),
    );

    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Email))
        .await
        .unwrap();
    let report = h.scheduler.tick(after_creation()).await;

    assert_eq!(report.promoted, 1);
    assert_eq!((report.dispatch.sent, report.dispatch.failed), (2, 1));

    let b = h.service.get(b.id).await.unwrap();
    assert_eq!((b.sent_count, b.failed_count), (2, 1));
    assert_eq!(b.recipient_count, 3);
    assert_eq!(b.status, BroadcastStatus::Completed);
    assert!(b.completed_at.is_some());
    assert_eq!(b.error_log.len(), 1);
    assert_eq!(b.error_log[0].recipient_id, Some(bad));

    let progress = h.service.get_progress(b.id).await.unwrap();
    assert_eq!(progress.progress_pct, 100);
    assert_eq!(progress.error_summary[0].message, "mailbox does not exist");
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts_with_backoff() {
    let (dir, ids) = users(1);
    let sender = ScriptedSender::new(ChannelType::Email, |_| {
        Err(SendError::Transient("503 from provider".into()))
    });
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(sender)),
        CompletionPolicy::default(),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Email))
        .await
        .unwrap();

    let mut now = after_creation();
    let mut delays = Vec::new();
    for _ in 0..3 {
        h.scheduler.tick(now).await;
        let record = h.store.records_of(b.id).await.remove(0);
        assert!(record.attempts <= record.max_attempts);
        if record.status == DeliveryStatus::Failed {
            break;
        }
        assert_eq!(record.status, DeliveryStatus::Pending);
        delays.push(record.scheduled_at - now);
        now = record.scheduled_at;
    }

    let record = h.store.records_of(b.id).await.remove(0);
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(delays, vec![Duration::minutes(10), Duration::minutes(20)]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    let b = h.service.get(b.id).await.unwrap();
    assert_eq!(b.failed_count, 1);
    assert_eq!(b.status, BroadcastStatus::Completed);
}

#[tokio::test]
async fn test_materialize_in_batches_without_duplicates() {
    let store = Arc::new(MemoryStore::default());
    let materializer = Materializer::new(store.clone(), 1000);
    let broadcast_id = Uuid::new_v4();
    let recipients: Vec<Uuid> = (0..2500).map(|_| Uuid::new_v4()).collect();
    let now = Utc::now();

    let first = materializer
        .materialize(broadcast_id, &recipients, ChannelType::InApp, 3, now)
        .await;
    assert_eq!(first.batches, 3);
    assert_eq!(first.created, 2500);
    assert_eq!(first.created + first.skipped_existing, recipients.len() as u64);

    let replay = materializer
        .materialize(broadcast_id, &recipients, ChannelType::InApp, 3, now)
        .await;
    assert_eq!(replay.created, 0);
    assert_eq!(replay.skipped_existing, 2500);
    assert_eq!(store.records_of(broadcast_id).await.len(), 2500);
}

#[tokio::test]
async fn test_recipient_rate_limit_defers_overflow() {
    let (dir, ids) = users(1);
    let user = ids[0];
    let sender = Arc::new(
        ScriptedSender::ok(ChannelType::Sms).with_limit(RateLimit::per_hour(10)),
    );
    let h = harness(
        dir,
        ChannelRegistry::new().with(sender.clone()),
        CompletionPolicy::default(),
    );

    let mut broadcast_ids = Vec::new();
    for i in 0..15 {
        let b = h
            .service
            .schedule_notification(
                Uuid::new_v4(),
                ScheduleNotificationParams {
                    recipient_id: user,
                    title: format!("Reminder {}", i),
                    body: "Homework due".into(),
                    kind: NotificationKind::Reminder,
                    priority: Priority::Normal,
                    related_object: None,
                    channels: vec![ChannelType::Sms],
                    scheduled_at: None,
                },
            )
            .await
            .unwrap();
        broadcast_ids.push(b.id);
    }

    let now = after_creation();
    let report = h.scheduler.tick(now).await;
    assert_eq!(report.dispatch.sent, 10);
    assert_eq!(report.dispatch.deferred, 5);
    assert_eq!(report.dispatch.failed, 0);
    assert_eq!(sender.calls(), 10);

    let mut deferred = 0;
    for id in &broadcast_ids {
        let record = h.store.records_of(*id).await.remove(0);
        assert_ne!(record.status, DeliveryStatus::Failed);
        if record.status == DeliveryStatus::Pending {
            deferred += 1;
            assert!(record.scheduled_at > now);
            assert_eq!(record.attempts, 0);
        }
    }
    assert_eq!(deferred, 5);

    // Nothing moves until the window frees up.
    let report = h.scheduler.tick(now + Duration::minutes(30)).await;
    assert_eq!(report.dispatch.claimed, 0);

    let report = h.scheduler.tick(now + Duration::hours(1)).await;
    assert_eq!(report.dispatch.sent, 5);
    assert_eq!(sender.calls(), 15);
}

// ============================================================
// Properties
// ============================================================

async fn open_broadcast(store: &Arc<MemoryStore>, recipients: &[Uuid], now: DateTime<Utc>) -> Uuid {
    let service = BroadcastService::new(store.clone(), &config());
    let b = service
        .create(Uuid::new_v4(), custom(recipients, ChannelType::Email))
        .await
        .unwrap();
    store.claim_due_broadcasts(now, 100).await.unwrap();
    store
        .insert_records(b.id, ChannelType::Email, recipients, 3, now)
        .await
        .unwrap();
    store.finish_materialization(b.id, now).await.unwrap();
    b.id
}

fn dispatcher(
    store: Arc<MemoryStore>,
    dir: MemoryDirectory,
    sender: Arc<ScriptedSender>,
    concurrency: usize,
) -> Dispatcher {
    Dispatcher::new(
        store,
        Arc::new(dir),
        ChannelRegistry::new().with(sender),
        RetryPolicy::from_config(&config()),
        DispatcherConfig {
            batch_size: 25,
            concurrency,
            send_timeout: StdDuration::from_secs(5),
            max_batches: 100,
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_lost_counter_updates() {
    for workers in [1, 4, 16] {
        let (dir, ids) = users(200);
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        let id = open_broadcast(&store, &ids, now).await;

        let sender = Arc::new(ScriptedSender::ok(ChannelType::Email));
        let a = Arc::new(dispatcher(store.clone(), dir.clone(), sender.clone(), workers));
        let b = Arc::new(dispatcher(store.clone(), dir, sender.clone(), workers));

        // Two dispatchers racing over the same queue.
        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let a = a.clone();
                async move { a.drain(now).await }
            }),
            tokio::spawn({
                let b = b.clone();
                async move { b.drain(now).await }
            }),
        );
        let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());

        assert_eq!(ra.sent + rb.sent, 200, "workers = {}", workers);
        assert_eq!(sender.calls(), 200, "workers = {}", workers);

        let broadcast = store.get_broadcast(id).await.unwrap().unwrap();
        assert_eq!(broadcast.sent_count, 200, "workers = {}", workers);
        assert!(broadcast.sent_count + broadcast.failed_count <= broadcast.recipient_count);
        assert_eq!(broadcast.status, BroadcastStatus::Completed);
    }
}

#[tokio::test]
async fn test_cancelled_results_are_discarded() {
    let (dir, ids) = users(4);
    let store = Arc::new(MemoryStore::default());
    let now = Utc::now();
    let id = open_broadcast(&store, &ids, now).await;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    struct GatedSender {
        gate: Arc<tokio::sync::Semaphore>,
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelSender for GatedSender {
        fn channel(&self) -> ChannelType {
            ChannelType::Email
        }

        async fn send(
            &self,
            _recipient: &Recipient,
            _message: &OutboundMessage,
        ) -> Result<DeliveryReceipt, SendError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await;
            Ok(DeliveryReceipt::default())
        }
    }

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        Arc::new(dir),
        ChannelRegistry::new().with(Arc::new(GatedSender {
            gate: gate.clone(),
            started: started.clone(),
        })),
        RetryPolicy::from_config(&config()),
        DispatcherConfig {
            batch_size: 10,
            concurrency: 4,
            send_timeout: StdDuration::from_secs(30),
            max_batches: 1,
        },
    ));

    let task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch_batch(now).await }
    });

    while started.load(Ordering::SeqCst) < 4 {
        tokio::task::yield_now().await;
    }

    let service = BroadcastService::new(store.clone(), &config());
    let summary = service.cancel(id).await.unwrap();
    assert_eq!(summary.records_cancelled, 4);

    gate.add_permits(4);
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.discarded, 4);
    assert_eq!(report.sent, 0);

    let b = store.get_broadcast(id).await.unwrap().unwrap();
    assert_eq!(b.status, BroadcastStatus::Cancelled);
    assert_eq!(b.sent_count, 0);
    assert!(
        store
            .records_of(id)
            .await
            .iter()
            .all(|r| r.status == DeliveryStatus::Cancelled)
    );
}

// ============================================================
// Edge cases
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_send_timeout_is_transient() {
    struct SlowSender;

    #[async_trait]
    impl ChannelSender for SlowSender {
        fn channel(&self) -> ChannelType {
            ChannelType::Email
        }

        async fn send(
            &self,
            _recipient: &Recipient,
            _message: &OutboundMessage,
        ) -> Result<DeliveryReceipt, SendError> {
            tokio::time::sleep(StdDuration::from_secs(120)).await;
            Ok(DeliveryReceipt::default())
        }
    }

    let (dir, ids) = users(1);
    let store = Arc::new(MemoryStore::default());
    let now = Utc::now();
    let id = open_broadcast(&store, &ids, now).await;

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(dir),
        ChannelRegistry::new().with(Arc::new(SlowSender)),
        RetryPolicy::from_config(&config()),
        DispatcherConfig {
            batch_size: 10,
            concurrency: 1,
            send_timeout: StdDuration::from_secs(1),
            max_batches: 1,
        },
    );

    let report = dispatcher.dispatch_batch(now).await.unwrap();
    assert_eq!(report.retried, 1);

    let record = store.records_of(id).await.remove(0);
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert!(record.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_provider_throttle_defers_without_attempt() {
    let (dir, ids) = users(1);
    let store = Arc::new(MemoryStore::default());
    let now = Utc::now();
    let id = open_broadcast(&store, &ids, now).await;

    let sender = Arc::new(ScriptedSender::new(ChannelType::Email, |_| {
        Err(SendError::RateLimited {
            retry_after: StdDuration::from_secs(30),
        })
    }));
    let report = dispatcher(store.clone(), dir, sender, 2)
        .dispatch_batch(now)
        .await
        .unwrap();
    assert_eq!(report.deferred, 1);

    let record = store.records_of(id).await.remove(0);
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempts, 0);
    assert_eq!(record.scheduled_at, now + Duration::seconds(30));
}

#[tokio::test]
async fn test_missing_channel_sender_fails_record() {
    let (dir, ids) = users(1);
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(ScriptedSender::ok(ChannelType::Email))),
        CompletionPolicy::default(),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Push))
        .await
        .unwrap();

    let report = h.scheduler.tick(after_creation()).await;
    assert_eq!(report.dispatch.failed, 1);
    let record = h.store.records_of(b.id).await.remove(0);
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert!(record.error_message.unwrap().contains("no sender registered"));
}

#[tokio::test]
async fn test_unknown_recipients_are_logged_once() {
    let (dir, ids) = users(1);
    let ghost = Uuid::new_v4();
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(ScriptedSender::ok(ChannelType::Email))),
        CompletionPolicy::default(),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&[ids[0], ghost], ChannelType::Email))
        .await
        .unwrap();

    h.scheduler.tick(after_creation()).await;
    let b = h.service.get(b.id).await.unwrap();
    assert_eq!(b.recipient_count, 1);
    assert_eq!(b.sent_count, 1);
    assert_eq!(b.status, BroadcastStatus::Completed);
    let logged: Vec<_> = b
        .error_log
        .iter()
        .filter(|e| e.recipient_id == Some(ghost))
        .collect();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].reason, "recipient not found");
}

#[tokio::test]
async fn test_zero_recipient_group_completes_immediately() {
    let h = harness(
        MemoryDirectory::new(),
        ChannelRegistry::new().with(Arc::new(ScriptedSender::ok(ChannelType::InApp))),
        CompletionPolicy::default(),
    );
    let mut params = custom(&[Uuid::new_v4()], ChannelType::InApp);
    params.target_spec = TargetSpec::BySubject(Uuid::new_v4());
    let b = h.service.create(Uuid::new_v4(), params).await.unwrap();

    h.scheduler.tick(after_creation()).await;
    let b = h.service.get(b.id).await.unwrap();
    assert_eq!(b.status, BroadcastStatus::Completed);
    assert_eq!(b.recipient_count, 0);
    assert_eq!(h.service.get_progress(b.id).await.unwrap().progress_pct, 0);
}

#[tokio::test]
async fn test_scheduled_broadcast_waits() {
    let (dir, ids) = users(2);
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(ScriptedSender::ok(ChannelType::Email))),
        CompletionPolicy::default(),
    );
    let at = Utc::now() + Duration::hours(2);
    let mut params = custom(&ids, ChannelType::Email);
    params.scheduled_at = Some(at);
    let b = h.service.create(Uuid::new_v4(), params).await.unwrap();

    let report = h.scheduler.tick(after_creation()).await;
    assert_eq!(report.promoted, 0);
    assert_eq!(h.service.get(b.id).await.unwrap().status, BroadcastStatus::Draft);

    let report = h.scheduler.tick(at).await;
    assert_eq!(report.promoted, 1);
    assert_eq!(report.dispatch.sent, 2);
}

#[tokio::test]
async fn test_failure_threshold_marks_broadcast_failed() {
    let (dir, ids) = users(4);
    let sender = ScriptedSender::new(ChannelType::Email, |_| {
        Err(SendError::Permanent("blocked".into()))
    });
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(sender)),
        CompletionPolicy::new(Some(0.5)),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Email))
        .await
        .unwrap();

    h.scheduler.tick(after_creation()).await;
    let b = h.service.get(b.id).await.unwrap();
    assert_eq!(b.status, BroadcastStatus::Failed);
    assert_eq!(b.failed_count, 4);
}

#[tokio::test]
async fn test_retry_failed_requeues_and_completes() {
    let (dir, ids) = users(3);
    let bad = ids[0];
    let healed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sender = ScriptedSender::new(ChannelType::Email, {
        let healed = healed.clone();
        move |r| {
            if r.user_id == bad && !healed.load(Ordering::SeqCst) {
                Err(SendError::Permanent("address suspended".into()))
            } else {
                Ok(DeliveryReceipt::default())
            }
        }
    });
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(sender)),
        CompletionPolicy::default(),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Email))
        .await
        .unwrap();

    let now = after_creation();
    h.scheduler.tick(now).await;
    assert_eq!(h.service.get(b.id).await.unwrap().failed_count, 1);

    healed.store(true, Ordering::SeqCst);
    let summary = h.service.retry_failed(b.id).await.unwrap();
    assert_eq!(summary.requeued, 1);
    let reopened = h.service.get(b.id).await.unwrap();
    assert_eq!(reopened.status, BroadcastStatus::Sending);
    assert_eq!(reopened.failed_count, 0);

    h.scheduler.tick(Utc::now() + Duration::seconds(1)).await;
    let done = h.service.get(b.id).await.unwrap();
    assert_eq!(done.status, BroadcastStatus::Completed);
    assert_eq!((done.sent_count, done.failed_count), (3, 0));
}

#[tokio::test]
async fn test_stalled_lease_is_reclaimed_with_backoff() {
    let (_, ids) = users(1);
    let store = Arc::new(MemoryStore::default());
    let now = Utc::now();
    let id = open_broadcast(&store, &ids, now).await;

    // A worker leases the record and dies.
    let dead_lease = Uuid::new_v4();
    store.claim_pending(now, 10, dead_lease).await.unwrap();

    let engine = RetryEngine::new(
        store.clone(),
        RetryPolicy::from_config(&config()),
        Duration::minutes(5),
        100,
    );

    let early = engine.run(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(early.reclaimed, 0);

    let later = now + Duration::minutes(6);
    let report = engine.run(later).await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let record = store.records_of(id).await.remove(0);
    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.scheduled_at, later + Duration::minutes(10));

    // The dead worker's late result is ignored.
    let late = store.mark_sent(record.id, dead_lease, later, None).await.unwrap();
    assert_eq!(late, herald_engine::store::Transition::StaleLease);
}

#[tokio::test]
async fn test_list_recipients_filters_by_status() {
    let (dir, ids) = users(3);
    let bad = ids[2];
    let sender = ScriptedSender::new(ChannelType::Email, move |r| {
        if r.user_id == bad {
            Err(SendError::Permanent("bounced".into()))
        } else {
            Ok(DeliveryReceipt::default())
        }
    });
    let h = harness(
        dir,
        ChannelRegistry::new().with(Arc::new(sender)),
        CompletionPolicy::default(),
    );
    let b = h
        .service
        .create(Uuid::new_v4(), custom(&ids, ChannelType::Email))
        .await
        .unwrap();
    h.scheduler.tick(after_creation()).await;

    let failed = h
        .service
        .list_recipients(b.id, Some(DeliveryStatus::Failed), None, None)
        .await
        .unwrap();
    assert_eq!(failed.total, 1);
    assert_eq!(failed.records[0].recipient_id, bad);

    let page = h
        .service
        .list_recipients(b.id, None, Some(2), Some(2))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.records.len(), 1);
}
