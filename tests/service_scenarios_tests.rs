use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark::{AppMode, Application, ShutdownManager};
use bulwark_config::AppConfig;
use bulwark_core::{GatewayRequest, OutcomeSource, StaticFallback};
use bulwark_domain::{alert_types, NewTask, Store, TaskPriority};
use bulwark_errors::BulwarkError;
use bulwark_infrastructure::InMemoryStore;
use bulwark_observability::MetricsExporter;
use bulwark_testing_utils::{ManualClock, TestEnv};

fn workers_app() -> Application {
    let mut config = AppConfig::default();
    config.dead_letter.worker_poll_interval_ms = 10;
    config.dead_letter.scheduler_poll_interval_ms = 10;
    config.monitor.health_check_interval_seconds = 3600;

    let clock = Arc::new(ManualClock::new());
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));
    Application::with_store(
        config,
        AppMode::Workers,
        store,
        clock,
        MetricsExporter::detached(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_workers_complete_and_dead_letter_tasks() {
    let app = Arc::new(workers_app());
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let handled = handled.clone();
        app.processors().register_fn("send_email", move |_task| {
            let handled = handled.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    app.processors().register_fn("sync_crm", |_task| async {
        Err(BulwarkError::downstream("crm", "connection refused"))
    });

    let shutdown = ShutdownManager::new();
    let runner = {
        let app = app.clone();
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { app.run(rx).await })
    };

    app.queue()
        .enqueue(NewTask::new("send_email", json!({"to": "ops@example.com"})))
        .await
        .unwrap();
    app.queue()
        .enqueue(
            NewTask::new("sync_crm", json!({"account": 7}))
                .with_priority(TaskPriority::High)
                .with_max_retries(0),
        )
        .await
        .unwrap();

    let queue = app.queue().clone();
    let counter = handled.clone();
    assert!(
        TestEnv::wait_for(
            || {
                let queue = queue.clone();
                let counter = counter.clone();
                async move {
                    let stats = queue.get_dlq_stats().await.unwrap();
                    stats.total == 1 && counter.load(Ordering::SeqCst) == 1
                }
            },
            Duration::from_secs(3),
        )
        .await
    );

    let monitor = app.monitor().clone();
    assert!(
        TestEnv::wait_for(
            || {
                let monitor = monitor.clone();
                async move {
                    monitor
                        .recent_alerts(10)
                        .await
                        .unwrap()
                        .iter()
                        .any(|a| a.alert_type == alert_types::TASK_DEAD_LETTERED)
                }
            },
            Duration::from_secs(3),
        )
        .await
    );

    shutdown.shutdown().await;
    tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_open_breaker_degrades_and_alerts() {
    let app = Arc::new(workers_app());
    let shutdown = ShutdownManager::new();
    let runner = {
        let app = app.clone();
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { app.run(rx).await })
    };
    // 等待监控订阅建立
    tokio::time::sleep(Duration::from_millis(50)).await;

    let gateway = app.gateway().clone();
    gateway.breakers().register_fallback(
        "ai_assistant",
        Arc::new(StaticFallback::new(json!({"answer": "暂时不可用"}))),
    );

    let fail_max = app.config().circuit_breakers["ai_assistant"].fail_max;
    for _ in 0..fail_max {
        let response = gateway
            .handle(
                GatewayRequest::new("user:1", "ai_assistant").with_rate_limit("api"),
                || async { Err::<Value, _>("model overloaded") },
            )
            .await
            .unwrap();
        assert_eq!(response.outcome.source, OutcomeSource::Fallback);
    }

    let called = Arc::new(AtomicUsize::new(0));
    let response = {
        let called = called.clone();
        gateway
            .handle(GatewayRequest::new("user:1", "ai_assistant"), move || async move {
                called.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(json!({"answer": "live"}))
            })
            .await
            .unwrap()
    };
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(response.outcome.value["answer"], "暂时不可用");

    let monitor = app.monitor().clone();
    assert!(
        TestEnv::wait_for(
            || {
                let monitor = monitor.clone();
                async move {
                    monitor
                        .recent_alerts(10)
                        .await
                        .unwrap()
                        .iter()
                        .any(|a| a.alert_type == alert_types::CIRCUIT_OPENED && a.source == "ai_assistant")
                }
            },
            Duration::from_secs(3),
        )
        .await
    );

    shutdown.shutdown().await;
    tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_api_mode_requires_enabled_api() {
    let mut config = AppConfig::default();
    config.api.enabled = false;
    let clock = Arc::new(ManualClock::new());
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(clock.clone()));

    let result = Application::with_store(
        config,
        AppMode::Api,
        store,
        clock,
        MetricsExporter::detached(),
    );
    assert!(result.is_err());
    assert!("workers".parse::<AppMode>().is_ok());
    assert!("dispatcher".parse::<AppMode>().is_err());
}
