//! Delivery processor orchestration

pub mod process;

use std::{collections::HashMap, sync::Arc, time::Duration};

use postern_common::{Signal, internal};
use postern_store::{MessageStore, StoreError};
use serde::Deserialize;
use tokio::{
    sync::Notify,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, warn};

pub use self::process::PassSummary;
use crate::{
    bounce::BounceConfig,
    dns::{DnsConfig, DnsResolver, MxResolver},
    error::{DeliveryError, SystemError},
    events::{EventConfig, EventSink, TracingEventSink},
    executor::{Executor, Transport},
    policy::{RetryPolicy, RouteTable, StoreRetryPolicy},
    scheduler::Scheduler,
    service::QueueControl,
};

const fn default_process_interval() -> u64 {
    10
}

fn default_max_concurrent_deliveries() -> usize {
    num_cpus::get()
}

const fn default_shutdown_timeout() -> u64 {
    30
}

/// Runs delivery attempts for due messages until shutdown
///
/// A pass runs every `process_interval_secs`, and immediately whenever
/// [`process_now`](Self::process_now) is called or a worker frees up while
/// due messages are waiting.
#[derive(Debug, Deserialize)]
pub struct DeliveryProcessor {
    /// How often to process the queue (in seconds)
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,

    /// Upper bound on attempts in flight at once
    ///
    /// Default: the number of CPUs
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,

    /// How long shutdown waits for in-flight attempts before aborting them
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub store_retry: StoreRetryPolicy,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub bounce: BounceConfig,

    #[serde(default)]
    pub events: EventConfig,

    #[serde(skip)]
    resolver: Option<Arc<dyn MxResolver>>,

    #[serde(skip)]
    event_sink: Option<Arc<dyn EventSink>>,

    /// Initialized in `init()`
    #[serde(skip)]
    pub(crate) scheduler: Option<Arc<Scheduler>>,

    /// Initialized in `init()`
    #[serde(skip)]
    pub(crate) executor: Option<Arc<Executor>>,

    #[serde(skip)]
    wake: Arc<Notify>,
}

impl Default for DeliveryProcessor {
    fn default() -> Self {
        Self {
            process_interval_secs: default_process_interval(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            retry: RetryPolicy::default(),
            store_retry: StoreRetryPolicy::default(),
            dns: DnsConfig::default(),
            bounce: BounceConfig::default(),
            events: EventConfig::default(),
            resolver: None,
            event_sink: None,
            scheduler: None,
            executor: None,
            wake: Arc::default(),
        }
    }
}

impl DeliveryProcessor {
    /// Use `resolver` for MX fallback instead of the system DNS resolver
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn MxResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Report lifecycle events to `sink` instead of the tracing sink
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Initialize the delivery processor
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the DNS resolver
    /// cannot be created
    pub fn init(
        &mut self,
        store: Arc<dyn MessageStore>,
        routes: Arc<RouteTable>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), DeliveryError> {
        internal!("Initialising Delivery Processor ...");

        if self.process_interval_secs == 0 {
            return Err(SystemError::Configuration(
                "process_interval_secs must be greater than zero".to_string(),
            )
            .into());
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(SystemError::Configuration(
                "max_concurrent_deliveries must be greater than zero".to_string(),
            )
            .into());
        }

        let resolver = match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => {
                let resolver = DnsResolver::with_dns_config(self.dns.clone())
                    .map_err(|e| SystemError::Configuration(e.to_string()))?;
                internal!(
                    "DNS resolver initialized with timeout={}s, min_ttl={}s, max_ttl={}s",
                    self.dns.timeout_secs,
                    self.dns.min_cache_ttl_secs,
                    self.dns.max_cache_ttl_secs
                );
                Arc::new(resolver)
            }
        };

        let events = self.event_sink.clone().unwrap_or_else(|| {
            Arc::new(TracingEventSink::new(self.events.clone())) as Arc<dyn EventSink>
        });

        self.scheduler = Some(Arc::new(
            Scheduler::new(store, events)
                .with_retry_policy(self.retry.clone())
                .with_store_retry(self.store_retry.clone())
                .with_bounce_config(self.bounce.clone()),
        ));
        self.executor = Some(Arc::new(Executor::new(routes, resolver, transport)));

        internal!(
            "Delivery processor ready: interval={}s, workers={}, retry window={}s",
            self.process_interval_secs,
            self.max_concurrent_deliveries,
            self.retry.max_retry_window_secs
        );

        Ok(())
    }

    fn parts(&self) -> Result<(&Arc<Scheduler>, &Arc<Executor>), DeliveryError> {
        match (&self.scheduler, &self.executor) {
            (Some(scheduler), Some(executor)) => Ok((scheduler, executor)),
            _ => Err(SystemError::NotInitialized(
                "Delivery processor not initialized. Call init() first.".to_string(),
            )
            .into()),
        }
    }

    /// # Errors
    /// Returns an error if the processor has not been initialized
    pub fn scheduler(&self) -> Result<&Arc<Scheduler>, DeliveryError> {
        self.parts().map(|(scheduler, _)| scheduler)
    }

    /// Operator control over this processor's queue
    ///
    /// # Errors
    /// Returns an error if the processor has not been initialized
    pub fn queue_control(&self) -> Result<QueueControl, DeliveryError> {
        let scheduler = self.scheduler()?;
        Ok(QueueControl::new(Arc::clone(scheduler), Arc::clone(&self.wake)))
    }

    /// Wake the processor for an immediate pass
    pub fn process_now(&self) {
        self.wake.notify_one();
    }

    /// Run a single pass and wait for every attempt it started
    ///
    /// # Errors
    /// Returns an error if the processor has not been initialized or the
    /// store failed
    pub async fn process_once(&self) -> Result<PassSummary, DeliveryError> {
        let (scheduler, executor) = self.parts()?;
        let mut workers = JoinSet::new();
        let mut in_flight = HashMap::new();

        let summary = process::process_queue(
            scheduler,
            executor,
            &mut workers,
            &mut in_flight,
            self.max_concurrent_deliveries,
        )
        .await?;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task failed: {e}");
            }
        }

        Ok(summary)
    }

    async fn run_pass(
        &self,
        workers: &mut JoinSet<postern_store::MessageId>,
        in_flight: &mut HashMap<postern_store::MessageId, tokio::task::Id>,
    ) -> Result<PassSummary, StoreError> {
        let Ok((scheduler, executor)) = self.parts() else {
            return Ok(PassSummary::default());
        };

        process::process_queue(
            scheduler,
            executor,
            workers,
            in_flight,
            self.max_concurrent_deliveries,
        )
        .await
    }

    /// Run the delivery processor
    ///
    /// Interrupted attempts from a previous run are recovered first. Then
    /// passes run until a shutdown signal is received.
    ///
    /// ## Graceful Shutdown
    ///
    /// 1. Stop starting new attempts
    /// 2. Wait up to `shutdown_timeout_secs` for in-flight attempts
    /// 3. Abort whatever is still running; those messages stay in progress
    ///    and are recovered on the next start
    ///
    /// # Errors
    ///
    /// Returns an error if the processor has not been initialized or
    /// recovery fails
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Delivery processor starting");

        let (scheduler, _) = self.parts()?;
        let recovery = scheduler.recover(std::time::SystemTime::now()).await?;
        if recovery.rescheduled > 0 || recovery.discarded > 0 {
            internal!(
                level = INFO,
                "Recovered queue: {} interrupted attempt(s) rescheduled, {} discard(s) completed",
                recovery.rescheduled,
                recovery.discarded
            );
        }

        let mut timer = time::interval(Duration::from_secs(self.process_interval_secs));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut workers = JoinSet::new();
        let mut in_flight = HashMap::new();
        let mut backlog = false;

        loop {
            let pass = tokio::select! {
                _ = timer.tick() => true,
                () = self.wake.notified() => true,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(id) => {
                            in_flight.remove(&id);
                        }
                        Err(e) => {
                            error!("Delivery task failed: {e}");
                            in_flight.retain(|_, task| *task != e.id());
                        }
                    }
                    backlog
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Delivery processor received shutdown signal");
                        }
                        Err(e) => {
                            error!("Delivery processor shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            };

            if pass {
                match self.run_pass(&mut workers, &mut in_flight).await {
                    Ok(summary) => backlog = summary.backlog > 0,
                    Err(e) => error!("Error processing delivery queue: {e}"),
                }
            }
        }

        self.drain(workers).await;
        internal!("Delivery processor shutdown complete");

        Ok(())
    }

    async fn drain(&self, mut workers: JoinSet<postern_store::MessageId>) {
        if workers.is_empty() {
            return;
        }

        debug!("Waiting for {} in-flight delivery attempt(s)", workers.len());
        let timeout = Duration::from_secs(self.shutdown_timeout_secs);
        let finished = time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "Shutdown timeout exceeded, {} in-flight delivery attempt(s) will be retried on restart",
                workers.len()
            );
            workers.shutdown().await;
        } else {
            internal!("All in-flight deliveries completed successfully");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let processor: DeliveryProcessor =
            ron::from_str("(process_interval_secs: 2, retry: (max_attempts: 3))").unwrap();

        assert_eq!(processor.process_interval_secs, 2);
        assert_eq!(processor.max_concurrent_deliveries, num_cpus::get());
        assert_eq!(processor.shutdown_timeout_secs, 30);
        assert_eq!(processor.retry.max_attempts, 3);
        assert_eq!(processor.retry.base_retry_delay_secs, 300);
        assert!(processor.bounce.enabled);
    }

    #[tokio::test]
    async fn test_serve_requires_init() {
        let processor = DeliveryProcessor::default();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);

        let err = processor.serve(rx).await.unwrap_err();
        assert!(err.is_system());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut processor = DeliveryProcessor {
            max_concurrent_deliveries: 0,
            ..DeliveryProcessor::default()
        };

        let err = processor
            .init(
                Arc::new(postern_store::MemoryMessageStore::new()),
                Arc::new(RouteTable::new()),
                Arc::new(NeverTransport),
            )
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_deliveries"));
    }

    #[derive(Debug)]
    struct NeverTransport;

    #[async_trait::async_trait]
    impl Transport for NeverTransport {
        async fn send(
            &self,
            _route: &crate::policy::ResolvedRoute,
            _message: &postern_store::QueuedMessage,
        ) -> Result<crate::executor::Reply, crate::executor::TransportError> {
            Err(crate::executor::TransportError::Closed)
        }
    }
}
