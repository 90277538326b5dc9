use dashmap::DashSet;
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use herald::database::models::{ChannelType, NotificationDbModel, NotificationStatus};
use herald::database::repositories::{NotificationStore, SqlxNotificationStore, TerminalUpdate};
use herald::database::{DbPool, run_migrations};
use herald::domain::RetryPolicy;

async fn init_stress_pool(database_url: &str) -> DbPool {
    let connect_options = SqliteConnectOptions::from_str(database_url)
        .unwrap()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Make SQLITE_BUSY surface quickly so the store's retry path runs.
        .busy_timeout(Duration::from_millis(1))
        .foreign_keys(true)
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(24)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 1")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 100")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_never_overlap() {
    const RECORDS: usize = 200;
    const WORKERS: usize = 16;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_stress_pool(&db_url).await;
    run_migrations(&pool).await.unwrap();

    let store = Arc::new(SqlxNotificationStore::new(pool.clone()));

    for i in 0..RECORDS {
        let record = NotificationDbModel::new(ChannelType::Sms, &[format!("+1555{i:07}")])
            .unwrap()
            .with_content(None, Some(format!("code {i}")));
        store.create(&record, &[]).await.unwrap();
    }

    // Background writer that briefly holds the write lock to force SQLITE_BUSY.
    let done = Arc::new(AtomicBool::new(false));
    let locker_pool = pool.clone();
    let locker_done = done.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !locker_done.load(Ordering::Relaxed) && tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE notification SET updated_at = updated_at WHERE id IN (SELECT id FROM notification LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let claimed_ids = Arc::new(DashSet::<String>::new());
    let policy = RetryPolicy::fixed(3, Duration::ZERO);

    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let store = store.clone();
        let claimed_ids = claimed_ids.clone();
        let policy = policy.clone();
        workers.spawn(async move {
            loop {
                let batch = store
                    .claim_batch(1 + random::<u32>() % 4, Duration::from_secs(300))
                    .await
                    .unwrap();

                if batch.is_empty() {
                    let counts = store.count_by_status().await.unwrap();
                    if counts.pending == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for record in batch {
                    assert_eq!(record.status, "PROCESSING");
                    let inserted = claimed_ids.insert(record.id.clone());
                    assert!(inserted, "double-claimed notification {}", record.id);

                    if random::<u8>() % 3 == 0 {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                    }

                    let status = store
                        .mark_terminal(&record.id, &TerminalUpdate::sent("stress", None), &policy)
                        .await
                        .unwrap();
                    assert_eq!(status, NotificationStatus::Sent);
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    done.store(true, Ordering::Relaxed);
    let _ = locker.await;

    assert_eq!(claimed_ids.len(), RECORDS, "not all notifications were claimed");

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.pending, 0, "pending notifications remain");
    assert_eq!(counts.processing, 0, "processing notifications remain");
    assert_eq!(counts.sent, RECORDS as u64, "not all notifications sent");

    let missing_sent_at: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM notification WHERE status = 'SENT' AND sent_at IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(missing_sent_at, 0);
}
