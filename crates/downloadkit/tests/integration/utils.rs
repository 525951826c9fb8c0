use std::path::Path;
use std::sync::Arc;

use downloadkit::{Config, FetchCoordinator, FetchSettings, HttpFetcher};

/// Creates a [`FetchCoordinator`] fetching via HTTP, persisting into `cache_dir` if given.
pub fn setup_coordinator(cache_dir: Option<&Path>) -> FetchCoordinator {
    let config = Config {
        cache_dir: cache_dir.map(Path::to_owned),
        fetch: FetchSettings {
            persist_to_disk: cache_dir.is_some(),
            ..Default::default()
        },
        ..Default::default()
    };
    let fetcher = HttpFetcher::from_config(&config).unwrap();

    FetchCoordinator::from_config(&config, Arc::new(fetcher))
}
