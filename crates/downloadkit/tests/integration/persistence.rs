use downloadkit_test as test;

use crate::setup_coordinator;

#[tokio::test]
async fn test_entries_outlive_the_coordinator() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let url = server.url("echo/persisted");

    {
        let coordinator = setup_coordinator(Some(cache_dir.path()));
        coordinator.fetch(&url, Default::default()).await.unwrap();
        coordinator.store().flush();
    }
    assert_eq!(server.accesses(), 1);

    let coordinator = setup_coordinator(Some(cache_dir.path()));
    let value = coordinator.fetch(&url, Default::default()).await.unwrap();

    assert_eq!(value.as_ref(), b"persisted");
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_clear_cache_removes_persisted_entries() {
    test::setup();
    let server = test::HitCounter::new();
    let cache_dir = test::tempdir();
    let url = server.url("echo/cleared");

    let coordinator = setup_coordinator(Some(cache_dir.path()));
    coordinator.fetch(&url, Default::default()).await.unwrap();
    coordinator.store().flush();
    coordinator.clear_cache().unwrap();

    let coordinator = setup_coordinator(Some(cache_dir.path()));
    assert!(coordinator.cached(&url).is_none());
    assert_eq!(coordinator.resumed(), 0);

    coordinator.fetch(&url, Default::default()).await.unwrap();
    assert_eq!(server.accesses(), 2);
}
