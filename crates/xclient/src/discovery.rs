//! Server discovery and selection.

use crate::error::{Error, Result};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default age after which [`RefreshingDiscovery`] refetches its list.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// How [`Discovery::get`] picks an address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    /// A uniformly random address on every call.
    #[default]
    Random,
    /// The next address in list order, wrapping around.
    RoundRobin,
}

/// A mutable set of candidate server addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Reload the list from its source, if it has one.
    async fn refresh(&self) -> Result<()>;

    /// Replace the list.
    async fn update(&self, servers: Vec<String>) -> Result<()>;

    /// Pick one address.
    async fn get(&self, mode: SelectMode) -> Result<String>;

    /// Copy of every address.
    async fn get_all(&self) -> Result<Vec<String>>;
}

/// An external source of server addresses, such as a registry.
#[async_trait]
pub trait ServerSource: Send + Sync {
    /// Fetch the current address list.
    async fn fetch(&self) -> Result<Vec<String>>;
}

struct Selector {
    servers: Vec<String>,
    index: usize,
    rng: StdRng,
}

/// Discovery over a fixed list of servers, without a registry.
pub struct MultiServersDiscovery {
    inner: Mutex<Selector>,
}

impl MultiServersDiscovery {
    /// Create a selector over `servers`.
    ///
    /// The round-robin cursor starts at a random position.
    #[must_use]
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        let index = rng.gen_range(0..usize::MAX);
        Self {
            inner: Mutex::new(Selector {
                servers,
                index,
                rng,
            }),
        }
    }

    /// Replace the list, keeping the cursor.
    pub fn set(&self, servers: Vec<String>) {
        self.inner.lock().servers = servers;
    }

    /// Pick one address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableServers`] if the list is empty.
    pub fn select(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.lock();
        let n = inner.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }

        match mode {
            SelectMode::Random => {
                let i = inner.rng.gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let server = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(server)
            }
        }
    }

    /// Copy of every address.
    #[must_use]
    pub fn servers(&self) -> Vec<String> {
        self.inner.lock().servers.clone()
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.set(servers);
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.servers())
    }
}

/// Discovery that reloads its list from a [`ServerSource`] once the list is
/// older than the refresh interval.
pub struct RefreshingDiscovery<S> {
    source: S,
    servers: MultiServersDiscovery,
    interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
    fetching: tokio::sync::Mutex<()>,
}

impl<S: ServerSource> RefreshingDiscovery<S> {
    /// Create a discovery that refreshes every [`DEFAULT_REFRESH_INTERVAL`].
    #[must_use]
    pub fn new(source: S) -> Self {
        Self::with_interval(source, DEFAULT_REFRESH_INTERVAL)
    }

    /// Create a discovery with a custom refresh interval.
    #[must_use]
    pub fn with_interval(source: S, interval: Duration) -> Self {
        Self {
            source,
            servers: MultiServersDiscovery::new(Vec::new()),
            interval,
            last_refresh: Mutex::new(None),
            fetching: tokio::sync::Mutex::new(()),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_refresh
            .lock()
            .is_some_and(|at| at.elapsed() < self.interval)
    }
}

#[async_trait]
impl<S: ServerSource> Discovery for RefreshingDiscovery<S> {
    async fn refresh(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }
        // One fetch at a time; callers that waited see the fresh list.
        let _fetching = self.fetching.lock().await;
        if self.is_fresh() {
            return Ok(());
        }

        let servers = self.source.fetch().await?;
        debug!("rpc discovery: refreshed {} servers", servers.len());
        self.servers.set(servers);
        *self.last_refresh.lock() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.set(servers);
        *self.last_refresh.lock() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.servers.select(mode)
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        Ok(self.servers.servers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn servers(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect()
    }

    #[test]
    fn test_round_robin_wraps() {
        let d = MultiServersDiscovery::new(servers(3));

        let first: Vec<String> = (0..3).map(|_| d.select(SelectMode::RoundRobin).unwrap()).collect();
        let second: Vec<String> = (0..3).map(|_| d.select(SelectMode::RoundRobin).unwrap()).collect();

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, servers(3));
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_list_is_an_error() {
        let d = MultiServersDiscovery::new(Vec::new());

        assert!(matches!(d.select(SelectMode::Random), Err(Error::NoAvailableServers)));
        assert!(matches!(d.select(SelectMode::RoundRobin), Err(Error::NoAvailableServers)));
    }

    #[test]
    fn test_random_stays_in_list() {
        let list = servers(4);
        let d = MultiServersDiscovery::new(list.clone());

        for _ in 0..100 {
            assert!(list.contains(&d.select(SelectMode::Random).unwrap()));
        }
    }

    #[tokio::test]
    async fn test_get_all_is_a_copy() {
        let d = MultiServersDiscovery::new(servers(2));

        let mut all = d.get_all().await.unwrap();
        all.clear();

        assert_eq!(d.get_all().await.unwrap(), servers(2));
    }

    #[tokio::test]
    async fn test_update_replaces_list() {
        let d = MultiServersDiscovery::new(servers(2));

        d.update(vec!["10.0.0.1:1".to_string()]).await.unwrap();
        d.refresh().await.unwrap();

        assert_eq!(d.get(SelectMode::RoundRobin).await.unwrap(), "10.0.0.1:1");
        assert_eq!(d.get(SelectMode::Random).await.unwrap(), "10.0.0.1:1");
    }

    struct CountingSource {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServerSource for CountingSource {
        async fn fetch(&self) -> Result<Vec<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(servers(2))
        }
    }

    struct SlowSource {
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ServerSource for SlowSource {
        async fn fetch(&self) -> Result<Vec<String>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(servers(3))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ServerSource for FailingSource {
        async fn fetch(&self) -> Result<Vec<String>> {
            Err(Error::Refresh("registry unreachable".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_only_when_stale() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let d = RefreshingDiscovery::with_interval(
            CountingSource {
                fetches: Arc::clone(&fetches),
            },
            Duration::from_secs(10),
        );

        d.get(SelectMode::RoundRobin).await.unwrap();
        d.get_all().await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(d.get_all().await.unwrap(), servers(2));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_resets_refresh_clock() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let d = RefreshingDiscovery::new(CountingSource {
            fetches: Arc::clone(&fetches),
        });

        d.update(vec!["10.0.0.1:1".to_string()]).await.unwrap();

        assert_eq!(d.get(SelectMode::Random).await.unwrap(), "10.0.0.1:1");
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_stale_gets_fetch_once() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let d = RefreshingDiscovery::new(SlowSource {
            fetches: Arc::clone(&fetches),
        });

        let (a, b, c) = tokio::join!(
            d.get(SelectMode::Random),
            d.get(SelectMode::RoundRobin),
            d.get_all(),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(c.unwrap(), servers(3));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_propagates() {
        let d = RefreshingDiscovery::new(FailingSource);

        assert!(matches!(
            d.get(SelectMode::RoundRobin).await,
            Err(Error::Refresh(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_round_robin_is_fair(k in 1usize..8, rounds in 1usize..20, extra in 0usize..8) {
            let list = servers(k);
            let d = MultiServersDiscovery::new(list.clone());
            let n = k * rounds + extra;

            let picks: Vec<String> = (0..n).map(|_| d.select(SelectMode::RoundRobin).unwrap()).collect();

            let mut counts: HashMap<&str, usize> = HashMap::new();
            for pick in &picks {
                *counts.entry(pick.as_str()).or_default() += 1;
            }
            let max = list.iter().map(|s| counts.get(s.as_str()).copied().unwrap_or(0)).max().unwrap();
            let min = list.iter().map(|s| counts.get(s.as_str()).copied().unwrap_or(0)).min().unwrap();
            prop_assert!(max - min <= 1);

            if k > 1 {
                prop_assert!(picks.windows(2).all(|w| w[0] != w[1]));
            }
        }
    }
}
