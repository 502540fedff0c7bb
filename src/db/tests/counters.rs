use super::*;
use crate::counter::AtomicCounterStore;
use std::sync::Arc;

#[tokio::test]
async fn test_counter_deduplicates_by_media() {
    let (db, _file) = test_db().await;
    let package = PackageId(1);
    db.init(package, &[MediaId(1), MediaId(2)]).await.unwrap();
    assert_eq!(db.remaining(package).await.unwrap(), Some(2));

    let first = db.decrement(package, MediaId(1)).await.unwrap();
    assert_eq!(first.remaining, 1);
    assert!(first.applied);

    let again = db.decrement(package, MediaId(1)).await.unwrap();
    assert_eq!(again.remaining, 1);
    assert!(!again.applied);

    let last = db.decrement(package, MediaId(2)).await.unwrap();
    assert_eq!(last.remaining, 0);
    assert!(last.applied);
}

#[tokio::test]
async fn test_counter_missing_package() {
    let (db, _file) = test_db().await;
    assert!(matches!(
        db.decrement(PackageId(7), MediaId(1)).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(db.remaining(PackageId(7)).await.unwrap(), None);
}

#[tokio::test]
async fn test_counters_are_per_package() {
    let (db, _file) = test_db().await;
    db.init(PackageId(1), &[MediaId(1)]).await.unwrap();
    db.init(PackageId(2), &[MediaId(2), MediaId(3)]).await.unwrap();

    let a = db.decrement(PackageId(1), MediaId(1)).await.unwrap();
    assert_eq!(a.remaining, 0);
    assert_eq!(db.remaining(PackageId(2)).await.unwrap(), Some(2));

    // Media of another package does not count against this one
    let cross = db.decrement(PackageId(2), MediaId(1)).await.unwrap();
    assert!(!cross.applied);
    assert_eq!(cross.remaining, 2);
}

#[tokio::test]
async fn test_concurrent_decrements_hit_zero_once() {
    let (db, _file) = test_db().await;
    let db = Arc::new(db);
    let package = PackageId(9);
    let media: Vec<MediaId> = (1..=20).map(MediaId).collect();
    db.init(package, &media).await.unwrap();

    let mut handles = Vec::new();
    for id in media.iter().chain(media.iter()).copied() {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.decrement(package, id).await.unwrap()
        }));
    }

    let mut applied = 0;
    let mut zero_hits = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.applied {
            applied += 1;
            if result.remaining == 0 {
                zero_hits += 1;
            }
        }
    }
    assert_eq!(applied, 20);
    assert_eq!(zero_hits, 1);
    assert_eq!(db.remaining(package).await.unwrap(), Some(0));
}

#[tokio::test]
async fn test_remove_deletes_counter_and_pending_rows() {
    let (db, _file) = test_db().await;
    db.init(PackageId(5), &[MediaId(1), MediaId(2)]).await.unwrap();
    db.init(PackageId(6), &[MediaId(3)]).await.unwrap();

    db.remove(PackageId(5)).await.unwrap();
    db.remove(PackageId(5)).await.unwrap();

    assert_eq!(db.remaining(PackageId(5)).await.unwrap(), None);
    let leftover: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_media WHERE package_id = ?")
            .bind(PackageId(5))
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(leftover, 0);
    assert_eq!(db.remaining(PackageId(6)).await.unwrap(), Some(1));
}
