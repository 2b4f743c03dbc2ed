//! Wires the engine together: one subscription task per configured
//! publisher, the change watcher, and a periodic status log. Shutdown is
//! top-down: flip the watch channel, join every task, close the sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::identity::IdentityDirectory;
use crate::service_record::ServiceRecordFetcher;
use crate::sink::LabelStore;
use crate::state::{StateError, Store};
use crate::subscription::PublisherConnection;
use crate::takedown::{DataplaneClient, TakedownDispatcher};
use crate::validator::LabelValidator;
use crate::watcher::ChangeWatcher;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("already started")]
    AlreadyStarted,
    #[error("state store: {0}")]
    State(#[from] StateError),
    #[error("dataplane client: {0}")]
    Dataplane(#[from] reqwest::Error),
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    connections: HashMap<String, Arc<AtomicBool>>,
}

/// The multi-publisher subscription engine.
pub struct Muncher<S: LabelStore> {
    config: Config,
    sink: Arc<S>,
    running: Option<Running>,
}

impl<S: LabelStore> Muncher<S> {
    pub fn new(config: Config, sink: S) -> Self {
        Self { config, sink: Arc::new(sink), running: None }
    }

    /// Open local state and subscribe to every configured publisher.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.running.is_some() {
            return Err(StartError::AlreadyStarted);
        }

        let store = Arc::new(Store::open(&self.config.state_path)?);
        let directory =
            Arc::new(IdentityDirectory::new(self.config.plc_directory_url.clone()));
        let validator = Arc::new(LabelValidator::new(
            store.clone(),
            directory.clone(),
            ServiceRecordFetcher::new(directory.clone(), store.clone()),
        ));
        let takedowns = match (&self.config.mod_service_did, &self.config.dataplane) {
            (Some(did), Some(dataplane)) => Some(Arc::new(TakedownDispatcher::new(
                DataplaneClient::new(dataplane)?,
                did.clone(),
            ))),
            _ => None,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let watcher = ChangeWatcher::new(
            store.clone(),
            self.config.change_feed_url.clone(),
            self.config.labeler_dids.clone(),
        );
        tasks.push(tokio::spawn(watcher.run(shutdown_rx.clone())));

        let mut connections = HashMap::new();
        for did in &self.config.labeler_dids {
            let connection = PublisherConnection::new(
                did.clone(),
                store.clone(),
                directory.clone(),
                validator.clone(),
                self.sink.clone(),
                takedowns.clone(),
            );
            connections.insert(did.clone(), connection.connected_flag());
            info!(did = %did, "subscribing to publisher");
            tasks.push(tokio::spawn(connection.run(shutdown_rx.clone())));
        }

        tasks.push(tokio::spawn(status_loop(connections.clone(), shutdown_rx)));

        self.running = Some(Running { shutdown, tasks, connections });
        Ok(())
    }

    /// Snapshot of per-publisher connection state.
    pub fn status(&self) -> HashMap<String, bool> {
        self.running
            .as_ref()
            .map(|running| {
                running
                    .connections
                    .iter()
                    .map(|(did, flag)| (did.clone(), flag.load(Ordering::Relaxed)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop every task and release the sink, tolerating individual errors.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "task failed during shutdown");
            }
        }
        self.sink.close().await;
    }
}

async fn status_loop(
    connections: HashMap<String, Arc<AtomicBool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick fires immediately
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let connected = connections.values().filter(|f| f.load(Ordering::Relaxed)).count();
                info!(connected, publishers = connections.len(), "publisher status");
            }
        }
    }
}
