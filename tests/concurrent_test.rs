//! Lock manager deadlock detection under genuine concurrent contention
//! (spec §4.8 / §8's two-transaction deadlock scenario): two transactions
//! acquire locks in opposite order, one is chosen as victim, the other
//! survives and finishes its work.

use std::sync::Arc;
use std::time::Duration;

use ferrokv::{LockManager, LockMode, StorageError};
use tokio::sync::Barrier;

#[tokio::test]
async fn crossed_lock_order_detects_deadlock_and_lets_the_other_survive() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mgr = Arc::new(LockManager::new());
    let barrier = Arc::new(Barrier::new(2));
    let timeout = Duration::from_secs(2);

    let mgr_a = Arc::clone(&mgr);
    let barrier_a = Arc::clone(&barrier);
    let txn1 = tokio::spawn(async move {
        mgr_a
            .acquire("row-a", 1, LockMode::Exclusive, timeout)
            .await
            .unwrap();
        barrier_a.wait().await;
        mgr_a.acquire("row-b", 1, LockMode::Exclusive, timeout).await
    });

    let mgr_b = Arc::clone(&mgr);
    let barrier_b = Arc::clone(&barrier);
    let txn2 = tokio::spawn(async move {
        mgr_b
            .acquire("row-b", 2, LockMode::Exclusive, timeout)
            .await
            .unwrap();
        barrier_b.wait().await;
        mgr_b.acquire("row-a", 2, LockMode::Exclusive, timeout).await
    });

    let (result1, result2) = tokio::join!(txn1, txn2);
    let result1 = result1.unwrap();
    let result2 = result2.unwrap();

    // Exactly one side is picked as the deadlock victim; the other
    // completes its cross-acquire and holds both locks.
    let outcomes = [result1, result2];
    let victims = outcomes
        .iter()
        .filter(|r| matches!(r, Err(StorageError::DeadlockVictim { .. })))
        .count();
    let survivors = outcomes.iter().filter(|r| matches!(r, Ok(true))).count();
    assert_eq!(victims, 1, "exactly one transaction should be the deadlock victim");
    assert_eq!(survivors, 1, "the other transaction should acquire both locks");

    // Whichever txn lost must be free to retry and release cleanly.
    mgr.release_all(1).await;
    mgr.release_all(2).await;
    assert!(mgr
        .acquire("row-a", 3, LockMode::Exclusive, timeout)
        .await
        .unwrap());
    assert!(mgr
        .acquire("row-b", 3, LockMode::Exclusive, timeout)
        .await
        .unwrap());
}

#[tokio::test]
async fn concurrent_readers_proceed_while_a_writer_waits() {
    let mgr = Arc::new(LockManager::new());
    let timeout = Duration::from_millis(200);

    assert!(mgr
        .acquire("k", 1, LockMode::Shared, timeout)
        .await
        .unwrap());
    assert!(mgr
        .acquire("k", 2, LockMode::Shared, timeout)
        .await
        .unwrap());

    // A writer behind two readers cannot proceed within its timeout.
    let blocked = mgr.acquire("k", 3, LockMode::Exclusive, timeout).await.unwrap();
    assert!(!blocked);

    mgr.release_all(1).await;
    mgr.release_all(2).await;
    assert!(mgr
        .acquire("k", 3, LockMode::Exclusive, timeout)
        .await
        .unwrap());
}
