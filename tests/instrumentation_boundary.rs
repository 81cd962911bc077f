//! The instrumentation layer must record every exit path exactly once and
//! hand the caller's result back untouched.


use anyhow::anyhow;
use querywatch::{ErrorKind, OperationContext, OperationKind};
use std::time::Duration;
use test_helpers::TestMonitor;
use tracing_test::traced_test;

fn ctx(name: &str) -> OperationContext {
    OperationContext::new(name, OperationKind::Select, Some("dishes"))
}

#[tokio::test]
#[traced_test]
async fn test_success_value_passes_through() {
    let t = TestMonitor::new();

    let rows: anyhow::Result<Vec<u32>> = t
        .monitor
        .instrumentation()
        .observe(ctx("list_dishes"), async { Ok(vec![1, 2, 3]) })
        .await;
    assert_eq!(rows.unwrap(), vec![1, 2, 3]);

    let stats = t.monitor.get_query_performance_stats(Duration::from_secs(60));
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.successful_queries, 1);
    assert_eq!(t.monitor.get_error_summary(Duration::from_secs(60)).total_errors, 0);
}

#[tokio::test]
async fn test_original_error_is_returned_unchanged() {
    let t = TestMonitor::new();

    let result: Result<(), sqlx::Error> = t
        .monitor
        .instrumentation()
        .observe(ctx("find_dish"), async { Err(sqlx::Error::RowNotFound) })
        .await;
    assert!(matches!(result, Err(sqlx::Error::RowNotFound)));

    let result: anyhow::Result<()> = t
        .monitor
        .instrumentation()
        .observe(ctx("find_dish"), async {
            Err(anyhow!("server closed the connection unexpectedly"))
        })
        .await;
    assert_eq!(
        result.unwrap_err().to_string(),
        "server closed the connection unexpectedly"
    );

    let errors = t.monitor.errors().recent_errors(2);
    assert_eq!(errors[0].kind, ErrorKind::ConnectionFailure);
    assert_eq!(errors[1].kind, ErrorKind::Unknown);
    assert_eq!(errors[0].operation_name, "find_dish");
    assert!(errors[0].elapsed.is_some());
}

#[tokio::test]
async fn test_pool_timeout_from_sqlx_is_pool_exhaustion() {
    let t = TestMonitor::new();

    let _: Result<(), sqlx::Error> = t
        .monitor
        .instrumentation()
        .observe(ctx("checkout"), async { Err(sqlx::Error::PoolTimedOut) })
        .await;

    let errors = t.monitor.errors().recent_errors(1);
    assert_eq!(errors[0].kind, ErrorKind::PoolExhaustion);
}

#[tokio::test]
async fn test_timeout_is_recorded_and_surfaced() {
    let t = TestMonitor::new();

    let result: Result<Result<(), String>, _> = t
        .monitor
        .instrumentation()
        .observe_with_timeout(ctx("slow_report"), Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
    assert!(result.is_err());

    let errors = t.monitor.errors().recent_errors(10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Timeout);

    let counts = t.monitor.metrics().count_outcomes(Duration::from_secs(60));
    assert_eq!(counts.failures, 1);
    assert_eq!(counts.successes, 0);
}

#[tokio::test]
async fn test_inner_result_survives_when_within_timeout() {
    let t = TestMonitor::new();

    let result = t
        .monitor
        .instrumentation()
        .observe_with_timeout(ctx("quick"), Duration::from_secs(5), async {
            Err::<(), String>("deadlock detected".to_string())
        })
        .await;
    assert_eq!(result.unwrap(), Err("deadlock detected".to_string()));
    assert_eq!(
        t.monitor.errors().recent_errors(1)[0].kind,
        ErrorKind::Deadlock
    );
}

#[tokio::test]
async fn test_dropped_operation_is_recorded_as_cancelled() {
    let t = TestMonitor::new();

    let observed = t
        .monitor
        .instrumentation()
        .observe(ctx("abandoned"), async {
            std::future::pending::<()>().await;
            Ok::<(), String>(())
        });
    let outer = tokio::time::timeout(Duration::from_millis(10), observed).await;
    assert!(outer.is_err());

    let errors = t.monitor.errors().recent_errors(10);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Cancelled);

    let stats = t.monitor.get_query_performance_stats(Duration::from_secs(60));
    assert_eq!(stats.total_queries, 1);
    assert_eq!(stats.failed_queries, 1);
}

#[tokio::test]
async fn test_unpolled_operation_records_nothing() {
    let t = TestMonitor::new();

    let observed = t
        .monitor
        .instrumentation()
        .observe(ctx("never_started"), async { Ok::<(), String>(()) });
    drop(observed);

    let stats = t.monitor.get_query_performance_stats(Duration::from_secs(60));
    assert_eq!(stats.total_queries, 0);
}

#[test]
fn test_manual_guard_records_once() {
    let t = TestMonitor::new();

    let guard = t.monitor.instrumentation().start(ctx("batch_import"));
    guard.fail(ErrorKind::Timeout, "lock wait exceeded");

    let history = t.monitor.metrics().get_comprehensive_snapshot();
    assert_eq!(history.retained_queries, 1);
    assert_eq!(
        history.query_performance.failed_queries,
        1,
        "explicit fail must not be followed by a drop-time record"
    );
}

#[tokio::test]
async fn test_session_tags_metrics_and_errors() {
    let t = TestMonitor::new();
    let session = t.monitor.session("req-42");

    let _: Result<u64, String> = session
        .execute("count_orders", "SELECT count(*) FROM orders", async { Ok(7) })
        .await;
    let _: Result<u64, String> = session
        .execute("bump_stock", "UPDATE stock SET qty = qty - 1", async {
            Err("canceling statement due to statement timeout".to_string())
        })
        .await;

    let stats = session.stats();
    assert_eq!(stats.session_id, "req-42");
    assert_eq!(stats.query_count, 2);
    assert_eq!(stats.error_count, 1);

    let errors = t.monitor.errors().recent_errors(1);
    assert_eq!(errors[0].session_id.as_deref(), Some("req-42"));
    assert_eq!(errors[0].kind, ErrorKind::Timeout);
    assert_eq!(
        errors[0].signature.as_ref().and_then(|s| s.target.as_deref()),
        Some("stock")
    );

    let report = t.monitor.get_query_performance_stats(Duration::from_secs(60));
    assert_eq!(report.by_signature.len(), 2);
    assert!(report
        .by_signature
        .iter()
        .all(|s| s.count == 1 && s.signature.target.is_some()));
}

#[test]
fn test_outcome_is_failure_for_every_error_path() {
    let t = TestMonitor::new();
    let _: Result<(), std::io::Error> = t.monitor.instrumentation().observe_sync(ctx("io"), || {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))
    });

    let snapshot = t.monitor.metrics().get_comprehensive_snapshot();
    let aggregate = &snapshot.signatures[0];
    assert_eq!(aggregate.count, 1);
    assert_eq!(aggregate.failure_count(), 1);
    assert_eq!(
        t.monitor.errors().recent_errors(1)[0].kind,
        ErrorKind::ConnectionFailure
    );
}
