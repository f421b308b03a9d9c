use crate::{metrics::Metrics, pool::Pool, Client, Record};
use commonware_macros::select;
use commonware_runtime::{Clock, Metrics as RuntimeMetrics, Spawner};
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tracing::{debug, trace};

/// Retrieves single records from the sources tracked by a [Pool].
///
/// A fetch makes exactly one bounded request. It never retries on its own: a record that could
/// not be retrieved is reported as unavailable and the caller decides when to try again. If the
/// request fails (or times out), the source is marked down so the next attempt is routed
/// elsewhere.
#[derive(Clone)]
pub struct Fetcher<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    context: E,
    client: C,
    pool: Pool<E, C>,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Fetcher<E, C> {
    /// Create a new fetcher.
    pub fn new(
        context: E,
        client: C,
        pool: Pool<E, C>,
        request_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context,
            client,
            pool,
            request_timeout,
            metrics,
        }
    }

    /// Fetch the record at `index` from a source that has reached `min_height`.
    ///
    /// Returns `None` if no source qualifies, the selected source has not produced the record
    /// yet, or the request failed.
    pub async fn fetch(&self, index: u64, min_height: u64) -> Option<Record> {
        let Some(endpoint) = self.pool.select(min_height) else {
            trace!(index, min_height, "no eligible source");
            self.metrics.fetch_misses.inc();
            return None;
        };
        let result = select! {
            result = self.client.fetch(&endpoint, index) => {
                result.map_err(|err| format!("{err}"))
            },
            _ = self.context.sleep(self.request_timeout) => {
                Err("timeout".to_string())
            },
        };
        match result {
            Ok(Some(payload)) => {
                self.metrics.fetched.inc();
                Some(Record::new(index, payload))
            }
            Ok(None) => {
                trace!(index, endpoint, "record not produced yet");
                self.metrics.fetch_misses.inc();
                None
            }
            Err(err) => {
                debug!(index, endpoint, err, "fetch failed");
                self.metrics.fetch_misses.inc();
                self.pool.mark_down(&endpoint);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{endpoint::Endpoint, mocks, pool::Height, Config};
    use commonware_runtime::{deterministic, Runner};

    type TestFetcher = Fetcher<deterministic::Context, mocks::Client<deterministic::Context>>;

    async fn create_fetcher(
        context: deterministic::Context,
        client: mocks::Client<deterministic::Context>,
        urls: &[&str],
    ) -> (TestFetcher, Pool<deterministic::Context, mocks::Client<deterministic::Context>>) {
        let cfg = Config::default();
        let metrics = Arc::new(Metrics::default());
        let endpoints = urls.iter().map(|url| Endpoint::parse(url).unwrap()).collect();
        let pool = Pool::new(
            context.clone(),
            client.clone(),
            endpoints,
            &cfg,
            metrics.clone(),
        );
        pool.refresh().await;
        let fetcher = Fetcher::new(context, client, pool.clone(), cfg.request_timeout, metrics);
        (fetcher, pool)
    }

    #[test]
    fn test_fetch_routes_by_height() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), Duration::from_millis(10));
            client.set_height("http://a.example.com", Some(100));
            client.set_height("http://b.example.com", Some(95));
            let (fetcher, _) = create_fetcher(
                context,
                client.clone(),
                &["http://a.example.com", "http://b.example.com"],
            )
            .await;

            // Only A can serve 96..=100
            for index in 96..=100 {
                let record = fetcher.fetch(index, index).await.unwrap();
                assert_eq!(record.index, index);
                assert_eq!(record.payload, mocks::payload(index, 8));
            }
            assert!(client
                .endpoints()
                .iter()
                .all(|endpoint| endpoint == "http://a.example.com"));

            // Nobody has 101
            assert!(fetcher.fetch(101, 101).await.is_none());
            assert_eq!(client.requests(101), 0);
        });
    }

    #[test]
    fn test_fetch_not_produced() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), Duration::from_millis(10));
            client.set_height("http://a.example.com", Some(10));
            let (fetcher, pool) =
                create_fetcher(context, client.clone(), &["http://a.example.com"]).await;

            // The source claims the height but withholds the record: not an error
            client.withhold(7);
            assert!(fetcher.fetch(7, 7).await.is_none());
            assert_eq!(pool.best_height(), Some(10));

            client.release(7);
            assert_eq!(fetcher.fetch(7, 7).await.unwrap().index, 7);
        });
    }

    #[test]
    fn test_fetch_failure_marks_source_down() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), Duration::from_millis(10));
            client.set_height("http://a.example.com", Some(10));
            client.set_height("http://b.example.com", Some(10));
            let (fetcher, pool) = create_fetcher(
                context,
                client.clone(),
                &["http://a.example.com", "http://b.example.com"],
            )
            .await;

            // A goes down between probes
            client.set_height("http://a.example.com", None);
            let mut fetched = 0;
            for _ in 0..20 {
                if fetcher.fetch(5, 5).await.is_some() {
                    fetched += 1;
                }
            }

            // At most one request hits A before it is marked down
            assert!(fetched >= 19);
            let heights = pool.heights();
            assert_eq!(heights[0].1, Height::Unreachable);
            assert_eq!(heights[1].1, Height::At(10));
        });
    }

    #[test]
    fn test_fetch_timeout() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), Duration::from_millis(10));
            client.set_height("http://a.example.com", Some(10));
            let (_, pool) =
                create_fetcher(context.clone(), client.clone(), &["http://a.example.com"]).await;

            // Requests take longer than the timeout
            let fetcher = Fetcher::new(
                context.clone(),
                client,
                pool.clone(),
                Duration::from_millis(1),
                Arc::new(Metrics::default()),
            );
            let start = context.current();
            assert!(fetcher.fetch(3, 3).await.is_none());
            assert!(context.current().duration_since(start).unwrap() < Duration::from_millis(10));
            assert!(pool.all_down());
        });
    }
}
