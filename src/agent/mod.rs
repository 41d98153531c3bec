use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use crate::display::{self, DisplayMode};
use crate::expr::ExprPipeline;
use crate::producer::{
    self, CommandExecutor, Executor, LineReader, Producer, ProfileExecutor, PROFILE_LABELS,
    STDIN_KEY,
};
use crate::server::QueryServer;
use crate::sink::{ElasticSink, PrometheusSink, PushgatewaySink, Sink};
use crate::store::{Persister, Store};

/// Commands a host sends to steer the consumer and the agent lifetime.
#[derive(Clone, Copy, Debug)]
pub enum Control {
    /// Rotate the consumer to the next query in the ring.
    NextQuery,
    /// Rotate the consumer to the next display mode.
    NextDisplayMode,
    /// Stop the consumer, close pause channels, and return.
    Quit,
}

/// Handle to one running consumer view. The task resolves to the view's
/// pause receiver so a successor view can take the channel over.
struct ConsumerHandle {
    interrupt: CancellationToken,
    task: tokio::task::JoinHandle<mpsc::Receiver<()>>,
}

/// The supervisor: owns the store, attached sinks, per-producer pause
/// channels, the results-ready handshake, and the consumer lifetime.
pub struct Agent {
    cfg: Config,
    store: Arc<Store>,
    control_tx: mpsc::Sender<Control>,
    /// Control receiver, taken by `run`.
    control_rx: Option<mpsc::Receiver<Control>>,
    pause_txs: HashMap<String, mpsc::Sender<()>>,
    consumer_pause_tx: mpsc::Sender<()>,
    /// Consumer pause receiver, taken by `run` and threaded through every
    /// consumer view in turn.
    consumer_pause_rx: Option<mpsc::Receiver<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Builds the store (with persistence when history is enabled) and
    /// attaches the configured external sinks. Sink construction failures
    /// are unrecoverable setup errors.
    pub fn new(cfg: Config) -> Result<Self> {
        let mut store = if cfg.history {
            let persister = Persister::at_default_path().context("locating storage path")?;
            Store::with_persistence(persister).context("loading persisted results")?
        } else {
            Store::new()
        };

        if !cfg.prometheus_addr.is_empty() {
            store.add_sink(Sink::Prometheus(PrometheusSink::new(&cfg.prometheus_addr)));
        }

        if !cfg.pushgateway_addr.is_empty() {
            store.add_sink(Sink::Pushgateway(PushgatewaySink::new(&cfg.pushgateway_addr)));
        }

        if !cfg.elasticsearch_addr.is_empty() {
            store.add_sink(Sink::Elastic(
                ElasticSink::new(
                    cfg.elasticsearch_addr.clone(),
                    cfg.elasticsearch_index.clone(),
                    cfg.elasticsearch_user.clone(),
                    cfg.elasticsearch_password.clone(),
                )
                .context("building document index sink")?,
            ));
        }

        let (control_tx, control_rx) = mpsc::channel(8);
        let (consumer_pause_tx, consumer_pause_rx) = mpsc::channel(1);

        Ok(Self {
            cfg,
            store: Arc::new(store),
            control_tx,
            control_rx: Some(control_rx),
            pause_txs: HashMap::new(),
            consumer_pause_tx,
            consumer_pause_rx: Some(consumer_pause_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Sender half of the control channel, for hosts (keyboard dispatch,
    /// signal handlers) to steer the agent.
    pub fn control(&self) -> mpsc::Sender<Control> {
        self.control_tx.clone()
    }

    /// The shared store, for embedding hosts.
    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Pause-channel senders by query. One message pauses the producer, a
    /// second resumes it.
    pub fn pause_senders(&self) -> HashMap<String, mpsc::Sender<()>> {
        self.pause_txs.clone()
    }

    /// Pause-channel sender for the consumer view, distinct from the
    /// producer pause channels. One message parks the consumer's reads
    /// (its cursor stays live), a second resumes them. The channel follows
    /// the active view across query and display-mode rotations.
    pub fn consumer_pause(&self) -> mpsc::Sender<()> {
        self.consumer_pause_tx.clone()
    }

    /// The producer keys for the configured mode. Read mode has exactly one
    /// producer under the fixed synthetic key.
    fn queries(&self) -> Vec<String> {
        match self.cfg.mode {
            Mode::Read => vec![STDIN_KEY.to_string()],
            Mode::Query | Mode::Profile => self.cfg.queries.clone(),
        }
    }

    /// The labels to assign to each series. Profile mode has canonical
    /// labels; user-provided ones are ignored there.
    fn labels(&self) -> Vec<String> {
        match self.cfg.mode {
            Mode::Profile => PROFILE_LABELS.iter().map(|s| s.to_string()).collect(),
            Mode::Query | Mode::Read => self.cfg.labels.clone(),
        }
    }

    fn executor(&self) -> Executor {
        match self.cfg.mode {
            Mode::Query => Executor::Command(CommandExecutor),
            Mode::Profile => Executor::Profile(ProfileExecutor),
            Mode::Read => Executor::Line(LineReader::stdin()),
        }
    }

    /// Runs to completion: starts sinks and the query server, waits for the
    /// results-ready handshake, starts producers, then services control
    /// commands until every producer is done or a quit arrives.
    pub async fn run(mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let mut control_rx = self.control_rx.take().expect("run called more than once");

        self.store.start_sinks(cancel.child_token()).await?;

        let server = QueryServer::new(
            format!("0.0.0.0:{}", self.cfg.port),
            Arc::clone(&self.store),
        );
        server.start(cancel.child_token()).await?;

        let queries = self.queries();
        let labels = self.labels();

        for query in &queries {
            self.store.put_labels(query, labels.clone());
        }

        // Pause channels, one per producer.
        let mut pause_rxs = HashMap::with_capacity(queries.len());
        for query in &queries {
            let (tx, rx) = mpsc::channel(1);
            self.pause_txs.insert(query.clone(), tx);
            pause_rxs.insert(query.clone(), rx);
        }

        // Results-ready handshake: producers start only once a consumer is
        // attached (or immediately when running silent).
        let (ready_tx, mut ready_rx) = mpsc::channel(1);

        let consumer_pause_rx = self
            .consumer_pause_rx
            .take()
            .expect("run called more than once");

        let mut active_query = 0usize;
        let mut display_mode = self.cfg.display_mode;
        let mut consumer = if self.cfg.silent {
            ready_tx.send(()).await.ok();
            None
        } else {
            Some(self.spawn_consumer(
                &queries[active_query],
                display_mode,
                ready_tx.clone(),
                consumer_pause_rx,
            ))
        };

        debug!("waiting for results readiness");
        ready_rx.recv().await;
        info!("results ready");

        // Start the producers.
        let (done_tx, mut done_rx) = mpsc::channel(queries.len().max(1));
        for query in &queries {
            let pause_rx = pause_rxs
                .remove(query)
                .expect("pause channel exists per query");

            let producer = Producer {
                key: query.clone(),
                executor: self.executor(),
                pipeline: ExprPipeline::new(&self.cfg.expressions),
            };

            tokio::spawn(producer::run_producer(
                Arc::clone(&self.store),
                producer,
                labels.clone(),
                self.cfg.count,
                Duration::from_secs(self.cfg.delay),
                self.cfg.history,
                pause_rx,
                done_tx.clone(),
            ));
        }
        drop(done_tx);

        info!(producers = queries.len(), mode = ?self.cfg.mode, "producers started");

        // Service completions and control commands.
        let mut remaining = queries.len();
        loop {
            tokio::select! {
                completed = done_rx.recv() => match completed {
                    Some(query) => {
                        debug!(query = %query, "producer finished");
                        remaining -= 1;
                        if remaining == 0 {
                            info!("all producers finished");
                            break;
                        }
                    }
                    None => break,
                },

                Some(command) = control_rx.recv() => match command {
                    Control::Quit => {
                        info!("quit requested");
                        break;
                    }
                    Control::NextQuery => {
                        active_query = (active_query + 1) % queries.len();
                        debug!(query = %queries[active_query], "rotating consumer to next query");
                        consumer = self
                            .restart_consumer(
                                consumer.take(),
                                &queries[active_query],
                                display_mode,
                                ready_tx.clone(),
                            )
                            .await;
                    }
                    Control::NextDisplayMode => {
                        display_mode = display_mode.next();
                        debug!(mode = ?display_mode, "rotating consumer to next display mode");
                        consumer = self
                            .restart_consumer(
                                consumer.take(),
                                &queries[active_query],
                                display_mode,
                                ready_tx.clone(),
                            )
                            .await;
                    }
                },
            }
        }

        // Teardown: interrupt the consumer, close pause channels, stop the
        // servers and sinks.
        if let Some(handle) = consumer.take() {
            handle.interrupt.cancel();
            let _ = handle.task.await;
        }
        self.pause_txs.clear();
        cancel.cancel();

        Ok(())
    }

    fn spawn_consumer(
        &self,
        query: &str,
        mode: DisplayMode,
        ready_tx: mpsc::Sender<()>,
        pause_rx: mpsc::Receiver<()>,
    ) -> ConsumerHandle {
        let interrupt = CancellationToken::new();
        let task = tokio::spawn(display::run_consumer(
            Arc::clone(&self.store),
            query.to_string(),
            mode,
            self.cfg.filters.clone(),
            interrupt.clone(),
            pause_rx,
            ready_tx,
        ));

        ConsumerHandle { interrupt, task }
    }

    async fn restart_consumer(
        &self,
        current: Option<ConsumerHandle>,
        query: &str,
        mode: DisplayMode,
        ready_tx: mpsc::Sender<()>,
    ) -> Option<ConsumerHandle> {
        let Some(handle) = current else {
            // Silent runs have no consumer to rotate.
            return None;
        };

        handle.interrupt.cancel();

        // The outgoing view hands its pause receiver back so the successor
        // stays reachable through the same pause sender.
        let pause_rx = match handle.task.await {
            Ok(pause_rx) => pause_rx,
            Err(e) => {
                warn!(error = %e, "consumer task join failed");
                mpsc::channel(1).1
            }
        };

        Some(self.spawn_consumer(query, mode, ready_tx, pause_rx))
    }
}
