mod common;

use common::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use trajectory_runner::{BrowserPool, PoolConfig, PoolError};

fn pool(factory: &FakeFactory, idle_capacity: usize, max_live: usize) -> Arc<BrowserPool<FakeFactory>> {
    Arc::new(BrowserPool::new(factory.clone(), PoolConfig { idle_capacity, max_live }))
}

#[tokio::test]
async fn acquire_blocks_at_ceiling_until_release() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 1, 2);
    let a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();
    assert_eq!(pool.live(), 2);

    assert!(timeout(Duration::from_millis(50), pool.acquire()).await.is_err());

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|s| s.serial) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let serial = a.serial;
    pool.release(a).await;
    let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
    assert_eq!(got, serial);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn released_session_is_reused_without_launch() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 3, 5);
    let s = pool.acquire().await.unwrap();
    let id = s.id().to_string();
    pool.release(s).await;
    assert_eq!(pool.idle_count().await, 1);

    let again = pool.acquire().await.unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.closed(), 0);
}

#[tokio::test]
async fn release_over_idle_capacity_closes() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 1, 3);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a).await;
    pool.release(b).await;
    assert_eq!(pool.idle_count().await, 1);
    assert_eq!(factory.closed(), 1);
    assert_eq!(pool.live(), 1);
}

#[tokio::test]
async fn close_failures_are_swallowed() {
    let factory = FakeFactory::new(FakeState { fail_close: true, ..Default::default() });
    let pool = pool(&factory, 0, 2);
    let a = pool.acquire().await.unwrap();
    pool.release(a).await;
    let b = pool.acquire().await.unwrap();
    pool.discard(b).await;
    assert_eq!(factory.closed(), 2);
    assert_eq!(pool.live(), 0);
}

#[tokio::test]
async fn idle_capacity_is_clamped_to_ceiling() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 8, 2);
    assert_eq!(pool.config().idle_capacity, 2);
}

#[tokio::test]
async fn sessions_are_never_shared() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 2, 3);
    let in_use = Arc::new(Mutex::new(HashSet::new()));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..20 {
        let (pool, in_use, peak) = (pool.clone(), in_use.clone(), peak.clone());
        handles.push(tokio::spawn(async move {
            let s = pool.acquire().await.unwrap();
            assert!(in_use.lock().unwrap().insert(s.id().to_string()), "session handed out twice");
            peak.fetch_max(pool.live(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            in_use.lock().unwrap().remove(s.id());
            pool.release(s).await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    // Releases past idle capacity close, so later acquires may relaunch.
    assert!(factory.created() - factory.closed() <= 3);
    assert!(pool.idle_count().await <= 2);
}

#[tokio::test]
async fn shutdown_drains_idle_and_refuses_launches() {
    let factory = FakeFactory::default();
    let pool = pool(&factory, 2, 2);
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    pool.release(a).await;
    pool.shutdown().await;
    assert_eq!(factory.closed(), 1);

    pool.release(b).await;
    assert_eq!(factory.closed(), 2);
    assert_eq!(pool.idle_count().await, 0);
    assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
}
