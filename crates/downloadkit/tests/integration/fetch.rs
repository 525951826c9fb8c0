use downloadkit::{CacheError, FetchOptions};
use downloadkit_test as test;
use futures::future::join_all;

use crate::setup_coordinator;

#[tokio::test]
async fn test_fetch_and_cache() {
    test::setup();
    let server = test::HitCounter::new();
    let coordinator = setup_coordinator(None);
    let url = server.url("hello.txt");

    for _ in 0..3 {
        let value = coordinator.fetch(&url, Default::default()).await.unwrap();
        assert_eq!(value.as_ref(), b"hello world\n");
    }

    assert_eq!(server.accesses(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_fetches() {
    test::setup();
    let server = test::HitCounter::new();
    let coordinator = setup_coordinator(None);

    let urls = [
        server.url("delay/100/first"),
        server.url("delay/100/second"),
    ];
    let requests = (0..20).map(|i| {
        let coordinator = coordinator.clone();
        let url = urls[i % 2].clone();
        tokio::spawn(async move { coordinator.fetch(&url, Default::default()).await })
    });

    for (i, result) in join_all(requests).await.into_iter().enumerate() {
        let expected: &[u8] = if i % 2 == 0 { b"first" } else { b"second" };
        assert_eq!(result.unwrap().unwrap().as_ref(), expected);
    }

    let mut hits = server.all_hits();
    hits.sort();
    assert_eq!(
        hits,
        [
            ("/delay/100/first".to_owned(), 1),
            ("/delay/100/second".to_owned(), 1),
        ]
    );
}

#[tokio::test]
async fn test_failed_fetches_are_retried() {
    test::setup();
    let server = test::HitCounter::new();
    let coordinator = setup_coordinator(None);
    let url = server.url("respond_statuscode/500/image.png");

    let requests = (0..3).map(|_| coordinator.fetch(&url, Default::default()));
    for result in join_all(requests).await {
        assert_eq!(
            result,
            Err(CacheError::FetchFailed("500 Internal Server Error".into()))
        );
    }
    assert_eq!(server.accesses(), 1);

    coordinator.fetch(&url, Default::default()).await.unwrap_err();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_force_refresh() {
    test::setup();
    let server = test::HitCounter::new();
    let coordinator = setup_coordinator(None);
    let url = server.url("echo/payload");

    coordinator.fetch(&url, Default::default()).await.unwrap();
    let options = FetchOptions {
        force_refresh: true,
        ..Default::default()
    };
    coordinator.fetch(&url, options).await.unwrap();

    assert_eq!(server.accesses(), 2);
}
