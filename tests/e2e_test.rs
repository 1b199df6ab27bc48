use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use sellmanager::api::{AdaptiveRateLimiter, ConnectorHandle, PaperConnector};
use sellmanager::assignments::StaticAssignments;
use sellmanager::config::{DownloadSettings, OrderSettings, Settings};
use sellmanager::download::DownloadCoordinator;
use sellmanager::execution::{ExecutionReport, Executor, LifecycleReport, OrderLifecycleManager};
use sellmanager::persistence::{BarCache, FailureJournal, JsonlLog};
use sellmanager::pipeline::EvaluationCycle;
use sellmanager::scheduler::{EvaluationWindow, TickKind};
use sellmanager::signals::{BreakEvenGate, SignalEngine};
use sellmanager::snapshot::SnapshotBuilder;
use sellmanager::*;

fn test_settings(dir: &std::path::Path) -> Settings {
    Settings {
        data_dir: dir.to_path_buf(),
        download: DownloadSettings {
            batch_delay_secs: 0.0,
            queue_poll_ms: 20,
            stop_timeout_ms: 500,
            requests_per_minute: None,
            ..DownloadSettings::default()
        },
        orders: OrderSettings {
            fill_timeout_ms: 200,
            poll_interval_ms: 10,
            cancel_verify_attempts: 3,
            cancel_verify_delay_ms: 10,
            reconcile_window_ms: 50,
        },
        ..Settings::default()
    }
}

fn fine_bars(start: DateTime<Utc>, closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| Bar::flat(start + Duration::minutes(30 * i as i64), *c, 100))
        .collect()
}

fn daily_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| Bar::flat(Utc.with_ymd_and_hms(2024, 3, 1 + i as u32, 0, 0, 0).unwrap(), *c, 1000))
        .collect()
}

fn seeded_paper() -> PaperConnector {
    let paper = PaperConnector::new();
    let start = Utc.with_ymd_and_hms(2024, 3, 5, 14, 0, 0).unwrap();
    // Hourly closes 11, 13, 9: last close drops under SMA(2) = 11
    paper.set_fine_bars("NASDAQ:AAPL", fine_bars(start, &[10.0, 11.0, 12.0, 13.0, 8.0, 9.0]));
    // Rising daily closes: no signal
    paper.set_daily_bars("NYSE:KO", daily_bars(&[101.0, 102.0, 103.0, 104.0, 105.0]));
    paper.set_position("AAPL", 10.0, Some(5.0));
    paper.set_position("KO", 20.0, Some(50.0));
    paper
}

struct Harness {
    cycle: EvaluationCycle,
    signals: Arc<JsonlLog>,
    orders: Arc<JsonlLog>,
}

async fn harness(paper: &PaperConnector, settings: &Settings, mode: ExecutionMode, approve: bool) -> Harness {
    let (handle, _task) = ConnectorHandle::spawn(paper.clone()).await.unwrap();
    let limiter = Arc::new(AdaptiveRateLimiter::new(
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(20),
    ));
    let trace = Arc::new(JsonlLog::new(settings.trace_log_path()));
    let coordinator = Arc::new(
        DownloadCoordinator::new(
            handle.clone(),
            BarCache::new(settings.cache_dir()),
            limiter,
            settings.download.clone(),
        )
        .with_trace(trace.clone()),
    );

    let assignments = StaticAssignments::new(vec![
        Assignment::new("NASDAQ:AAPL", MaType::Sma, 2, Timeframe::Hourly),
        Assignment::new("NYSE:KO", MaType::Sma, 2, Timeframe::Daily),
    ]);
    let snapshot = SnapshotBuilder::new(coordinator, Arc::new(assignments), &settings.scheduler)
        .unwrap()
        .with_log(Arc::new(JsonlLog::new(settings.snapshot_log_path())))
        .with_trace(trace);

    let signals = Arc::new(JsonlLog::new(settings.signals_log_path()));
    let engine = SignalEngine::new(signals.clone(), Arc::new(BreakEvenGate), mode);

    let orders = Arc::new(JsonlLog::new(settings.orders_log_path()));
    let manager = OrderLifecycleManager::new(handle, settings.orders.clone()).with_audit(orders.clone());
    let mut executor = Executor::new(manager, mode);
    if approve {
        let confirm = move |_: &SignalEntry, _qty: f64| true;
        executor = executor.with_confirmation(Arc::new(confirm));
    }

    Harness {
        cycle: EvaluationCycle::new(snapshot, engine).with_executor(executor),
        signals,
        orders,
    }
}

#[tokio::test]
async fn test_e2e_dry_run_then_confirmed_live_sell() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let paper = seeded_paper();
    let stop_order = paper.add_open_order("NASDAQ:AAPL", -10.0, OrderType::Stop { stop_price: 4.5 });
    // 15:00 New York
    let at = Utc.with_ymd_and_hms(2024, 3, 5, 20, 0, 0).unwrap();
    let window = EvaluationWindow::for_tick(TickKind::PreClose);

    println!("=== Starting E2E Test ===\n");

    // 1. Dry run
    println!("1. Dry-run cycle...");
    let dry = harness(&paper, &settings, ExecutionMode::Simulate, false).await;
    let summary = dry.cycle.run_cycle(at, window).await.unwrap();

    assert_eq!(summary.snapshot.rows.len(), 2);
    assert_eq!(summary.signals.len(), 2);
    assert_eq!(summary.sell_count(), 1);
    assert_eq!(summary.signals[0].ticker, "NASDAQ:AAPL");
    assert_eq!(summary.signals[0].ma_value, Some(11.0));
    assert_eq!(summary.signals[1].decision, Decision::NoSignal);
    assert_eq!(
        summary.executions,
        vec![ExecutionReport::Simulated {
            ticker: "NASDAQ:AAPL".to_string(),
            quantity: 10.0
        }]
    );
    assert!(paper.placed_orders().is_empty());
    println!("   ✓ 1 sell signal, simulated only");

    // 2. Live with confirmation
    println!("\n2. Confirmed live cycle...");
    let live = harness(&paper, &settings, ExecutionMode::Live, true).await;
    let summary = live.cycle.run_cycle(at, window).await.unwrap();

    assert_eq!(summary.executions.len(), 1);
    let ExecutionReport::Completed(report) = &summary.executions[0] else {
        panic!("expected a completed order, got {:?}", summary.executions[0]);
    };
    assert_eq!(report.status(), OrderStatus::Filled);
    assert_eq!(report.cancellations.len(), 1);
    assert_eq!(report.cancellations[0].order_id, stop_order);
    assert!(report.all_cancels_verified());
    assert_eq!(paper.placed_orders()[0].1, -10.0);
    assert_eq!(paper.position("AAPL").unwrap().quantity, 0.0);
    assert!(report.before.open_orders.iter().any(|o| o.order_id == stop_order));
    assert!(report.after.open_orders.is_empty());
    println!("   ✓ Filled and leftover stop cancelled");

    // 3. Audit logs
    println!("\n3. Audit logs...");
    let logged: Vec<SignalEntry> = live.signals.read_all().await.unwrap();
    assert_eq!(logged.len(), 4);
    assert_eq!(logged[0].action, ExecutionMode::Simulate);
    assert_eq!(logged[3].action, ExecutionMode::Live);

    let orders: Vec<LifecycleReport> = live.orders.read_all().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(dry.orders.path(), live.orders.path());

    let snapshots: Vec<serde_json::Value> = JsonlLog::new(settings.snapshot_log_path())
        .read_all()
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots[0]["rows"][0]["abv_be"].as_bool().unwrap());
    println!("   ✓ signals, orders and snapshots recorded");

    println!("\n=== E2E Test Complete ===");
}

#[tokio::test]
async fn test_e2e_top_of_hour_skips_daily_rows() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let paper = seeded_paper();
    let h = harness(&paper, &settings, ExecutionMode::Live, false).await;

    let summary = h
        .cycle
        .run_cycle(
            Utc.with_ymd_and_hms(2024, 3, 5, 19, 0, 0).unwrap(),
            EvaluationWindow::for_tick(TickKind::TopOfHour),
        )
        .await
        .unwrap();

    // Daily row is still in the snapshot but not evaluated
    assert_eq!(summary.snapshot.rows.len(), 2);
    assert_eq!(summary.signals.len(), 1);
    assert_eq!(summary.signals[0].timeframe, Timeframe::Hourly);
    // Default confirmation declines live orders
    assert!(matches!(summary.executions[0], ExecutionReport::Declined { .. }));
    assert!(paper.placed_orders().is_empty());
}

#[tokio::test]
async fn test_e2e_failed_downloads_are_journaled_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let settings = test_settings(dir.path());
    let paper = seeded_paper();
    paper.push_error("NYSE:KO", ConnectorError::Pacing("pacing violation".to_string()));

    let (handle, _task) = ConnectorHandle::spawn(paper.clone()).await.unwrap();
    let limiter = Arc::new(AdaptiveRateLimiter::new(
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(1),
        std::time::Duration::from_millis(20),
    ));
    let coordinator = Arc::new(DownloadCoordinator::new(
        handle,
        BarCache::new(settings.cache_dir()),
        limiter.clone(),
        settings.download.clone(),
    ));
    let journal = Arc::new(FailureJournal::new(settings.failures_path()));
    let queue = DownloadQueue::start(coordinator.clone(), journal.clone());

    queue.enqueue("NYSE:KO", DownloadKind::Daily).unwrap();
    queue.enqueue("NASDAQ:AAPL", DownloadKind::Fine).unwrap();
    wait_idle(&queue).await;

    let failures = journal.load().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].symbol, "NYSE:KO");
    assert_eq!(
        limiter.snapshot().current_delay,
        std::time::Duration::from_millis(2)
    );

    let stats = queue.retry_failures(5).await.unwrap();
    assert_eq!((stats.requeued, stats.kept, stats.cleared), (1, 0, 1));
    wait_idle(&queue).await;

    assert!(journal.load().await.unwrap().is_empty());
    let daily = coordinator
        .cache()
        .load(&SeriesKey::new("NYSE:KO", Granularity::Daily), None)
        .await
        .unwrap();
    assert_eq!(daily.len(), 2);

    queue.stop().await;
}

async fn wait_idle(queue: &DownloadQueue) {
    for _ in 0..200 {
        if queue.pending() == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("queue did not drain");
}
