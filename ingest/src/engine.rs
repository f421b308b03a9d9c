use crate::{
    arrange::Arranger,
    buffer::Buffer,
    cache::Cache,
    fetcher::Fetcher,
    metrics::Metrics,
    monitor::Monitor,
    persist::Persist,
    pool::Pool,
    workers::Workers,
    Client, Config, Error, Persister,
};
use commonware_runtime::{
    spawn_cell, Clock, ContextCell, Handle, Metrics as RuntimeMetrics, Spawner,
};
use futures::{channel::mpsc, future::try_join};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

/// Background tasks of a running pipeline, aborted when dropped.
struct Background<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> {
    tasks: Vec<Handle<()>>,
    workers: Workers<E, C>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client> Drop for Background<E, C> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.workers.stop();
        debug!("background tasks stopped");
    }
}

/// Runs the ingestion pipeline.
pub struct Engine<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client, P: Persister> {
    context: ContextCell<E>,
    cfg: Config,
    client: C,
    persister: P,

    pool: Pool<E, C>,
    cache: Cache,
    metrics: Arc<Metrics>,
}

impl<E: Clock + Spawner + RuntimeMetrics + Rng, C: Client, P: Persister> Engine<E, C, P> {
    /// Create a new engine, failing if `cfg` is invalid.
    pub fn new(context: E, cfg: Config, client: C, persister: P) -> Result<Self, Error> {
        cfg.validate()?;
        let metrics = Arc::new(Metrics::init(context.clone()));
        let pool = Pool::new(
            context.with_label("pool"),
            client.clone(),
            cfg.endpoints()?,
            &cfg,
            metrics.clone(),
        );
        let cache = Cache::new(cfg.cache_capacity);
        Ok(Self {
            context: ContextCell::new(context),
            cfg,
            client,
            persister,
            pool,
            cache,
            metrics,
        })
    }

    /// Returns a read-only view of the pipeline's progress.
    pub fn monitor(&self) -> Monitor<E, C> {
        Monitor::new(
            self.context.as_ref().with_label("monitor"),
            self.pool.clone(),
            self.metrics.clone(),
            self.cfg.report_interval,
        )
    }

    /// Returns the cache of recently persisted records.
    pub fn cache(&self) -> Cache {
        self.cache.clone()
    }

    /// Start the pipeline.
    ///
    /// The returned handle only resolves if the pipeline hits a fatal error. Every background
    /// task stops with the pipeline (including when the handle is aborted).
    pub fn start(mut self) -> Handle<Result<(), Error>> {
        spawn_cell!(self.context, self.run().await)
    }

    async fn run(mut self) -> Result<(), Error> {
        // Resume after the last committed record
        let committed = self
            .persister
            .committed()
            .await
            .map_err(|err| Error::Committed(Box::new(err)))?;
        let start = committed.map_or(self.cfg.genesis, |committed| committed + 1);
        self.metrics
            .committed
            .set(committed.map_or(-1, |committed| committed as i64));
        info!(?committed, start, sources = self.cfg.sources.len(), "starting ingestion");

        // Learn the heights of all sources before fetching anything
        let context = self.context.as_ref();
        let pool = self.pool.with_context(context.with_label("pool"));
        pool.refresh().await;
        let refresher = pool.clone().start();
        let reporter = Monitor::new(
            context.with_label("monitor"),
            pool.clone(),
            self.metrics.clone(),
            self.cfg.report_interval,
        )
        .start();

        let buffer = Buffer::new(start);
        let fetcher = Fetcher::new(
            context.with_label("fetcher"),
            self.client.clone(),
            pool.clone(),
            self.cfg.request_timeout,
            self.metrics.clone(),
        );
        let workers = Workers::new(
            context.with_label("workers"),
            &self.cfg,
            pool.clone(),
            fetcher.clone(),
            buffer.clone(),
            self.metrics.clone(),
        );
        let supervisor = workers.clone().start();
        let _background = Background {
            tasks: vec![refresher, reporter, supervisor],
            workers,
        };

        let (sender, receiver) = mpsc::channel(self.cfg.output_capacity);
        let arranger = Arranger::new(
            context.with_label("arranger"),
            &self.cfg,
            pool,
            fetcher,
            buffer.clone(),
            self.metrics.clone(),
            start,
        );
        let persist = Persist::new(
            self.persister,
            buffer,
            self.cache,
            self.cfg.batch_bytes,
            start,
            self.metrics,
        );
        try_join(arranger.run(sender), persist.run(receiver)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use std::time::Duration;

    const LATENCY: Duration = Duration::from_millis(10);

    fn config(sources: &[&str]) -> Config {
        Config {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            lag_per_worker: 4,
            max_workers: 4,
            scale_interval: Duration::from_millis(50),
            ..Config::default()
        }
    }

    #[test]
    fn test_invalid_config() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            let result = Engine::new(
                context.clone(),
                config(&[]),
                client.clone(),
                mocks::Persister::new(None),
            );
            assert!(matches!(result, Err(Error::NoSources)));

            let result = Engine::new(
                context,
                config(&["ftp://a.example.com"]),
                client,
                mocks::Persister::new(None),
            );
            assert!(matches!(result, Err(Error::InvalidEndpoint(_))));
        });
    }

    #[test_traced]
    fn test_catch_up_from_committed() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            client.set_height("http://a.example.com", Some(100));
            client.set_height("http://b.example.com", Some(95));
            let persister = mocks::Persister::new(Some(90));
            let engine = Engine::new(
                context.clone(),
                config(&["http://a.example.com", "http://b.example.com"]),
                client.clone(),
                persister.clone(),
            )
            .unwrap();
            let monitor = engine.monitor();
            let cache = engine.cache();
            engine.start();

            context.sleep(Duration::from_secs(5)).await;

            // 91..=100 persisted in order, the last batch ending at the head
            assert_eq!(persister.indices(), (91..=100).collect::<Vec<_>>());
            let batches = persister.batches();
            assert_eq!(batches.last().unwrap().last().unwrap().index, 100);
            for index in 91..=100 {
                assert_eq!(client.requests(index), 1, "index {index}");
            }
            assert_eq!(client.requests(90), 0);

            // Only A could serve 96..=100
            let status = monitor.status();
            assert_eq!(status.cursor, 101);
            assert_eq!(status.committed, Some(100));
            assert_eq!(status.best_height, Some(100));
            assert_eq!(status.lag, 0);
            assert!(!status.all_down);
            assert_eq!(cache.latest().unwrap().index, 100);
            assert_eq!(cache.get(91).unwrap().payload, mocks::payload(91, 8));
        });
    }

    #[test_traced]
    fn test_follows_chain() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            client.set_height("http://a.example.com", Some(200));
            let persister = mocks::Persister::new(None);
            let cfg = Config {
                genesis: 1,
                ..config(&["http://127.0.0.1:8545", "http://a.example.com"])
            };
            client.set_height("http://127.0.0.1:8545", Some(150));
            let engine = Engine::new(context.clone(), cfg, client.clone(), persister.clone())
                .unwrap();
            let monitor = engine.monitor();
            engine.start();

            // Catch up, then shrink back to one worker
            context.sleep(Duration::from_secs(10)).await;
            assert_eq!(persister.indices(), (1..=200).collect::<Vec<_>>());
            assert_eq!(monitor.status().workers, 1);

            // New records are ingested as they are produced
            client.set_height("http://a.example.com", Some(210));
            context.sleep(Duration::from_secs(20)).await;
            assert_eq!(persister.indices(), (1..=210).collect::<Vec<_>>());
            assert_eq!(monitor.status().workers, 1);
        });
    }

    #[test_traced]
    fn test_all_down_pause_and_resume() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            client.set_height("http://a.example.com", Some(20));
            let persister = mocks::Persister::new(None);
            let engine = Engine::new(
                context.clone(),
                config(&["http://a.example.com"]),
                client.clone(),
                persister.clone(),
            )
            .unwrap();
            let monitor = engine.monitor();
            engine.start();
            context.sleep(Duration::from_secs(3)).await;
            assert_eq!(persister.indices(), (0..=20).collect::<Vec<_>>());

            // Every source goes down
            client.set_height("http://a.example.com", None);
            context.sleep(Duration::from_secs(3)).await;
            let status = monitor.status();
            assert!(status.all_down);
            assert_eq!(status.best_height, None);
            assert_eq!(status.cursor, 21);

            // Recovery resumes ingestion automatically
            client.set_height("http://a.example.com", Some(30));
            context.sleep(Duration::from_secs(15)).await;
            assert_eq!(persister.indices(), (0..=30).collect::<Vec<_>>());
            assert!(!monitor.status().all_down);
        });
    }

    #[test]
    fn test_commit_failure_stops() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            client.set_height("http://a.example.com", Some(20));
            let engine = Engine::new(
                context.clone(),
                config(&["http://a.example.com"]),
                client.clone(),
                mocks::Persister::rejecting(),
            )
            .unwrap();
            let monitor = engine.monitor();
            let result = engine.start().await.unwrap();
            assert!(matches!(result, Err(Error::Persist { first: 0, .. })));

            // Nothing keeps fetching after the failure
            context.sleep(Duration::from_millis(100)).await;
            let requests = client.endpoints().len();
            client.set_height("http://a.example.com", Some(100));
            context.sleep(Duration::from_secs(5)).await;
            assert_eq!(client.endpoints().len(), requests);
            assert_eq!(monitor.status().workers, 0);
        });
    }

    #[test_traced]
    fn test_abort_stops_background_tasks() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let client = mocks::Client::new(context.clone(), LATENCY);
            client.set_height("http://a.example.com", Some(100_000));
            let persister = mocks::Persister::new(None);
            let cfg = Config {
                batch_bytes: 64,
                ..config(&["http://a.example.com"])
            };
            let engine = Engine::new(context.clone(), cfg, client.clone(), persister.clone())
                .unwrap();
            let handle = engine.start();
            context.sleep(Duration::from_secs(2)).await;
            assert!(!persister.indices().is_empty());

            // Workers, refresher and reporter stop with the engine
            handle.abort();
            context.sleep(Duration::from_millis(100)).await;
            let requests = client.endpoints().len();
            let committed = persister.indices().len();
            context.sleep(Duration::from_secs(5)).await;
            assert_eq!(client.endpoints().len(), requests);
            assert_eq!(persister.indices().len(), committed);
        });
    }
}
