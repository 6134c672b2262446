//! Endpoint request catalog.
//!
//! Maps endpoint names to their [`PhaseRequests`]. Readers take a cheap
//! `Arc` snapshot; after [`RequestCatalog::init`] the only writer is the task
//! started by [`RequestCatalog::subscribe`], which applies [`CatalogChange`]s
//! in arrival order until the sender is dropped or
//! [`RequestCatalog::shutdown`] is called.

use mediator_core::{PhaseRequests, SpecError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A change to apply to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogChange {
    /// Add or replace one endpoint
    Upsert {
        /// Endpoint name
        endpoint: String,
        /// Its request lists
        requests: PhaseRequests,
    },
    /// Drop one endpoint
    Remove {
        /// Endpoint name
        endpoint: String,
    },
    /// Replace the whole catalog
    Reload(HashMap<String, PhaseRequests>),
}

type Entries = HashMap<String, Arc<PhaseRequests>>;

struct Writer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Process-wide endpoint catalog.
pub struct RequestCatalog {
    entries: Arc<RwLock<Entries>>,
    writer: Mutex<Option<Writer>>,
}

impl std::fmt::Debug for RequestCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCatalog")
            .field("endpoints", &self.len())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl RequestCatalog {
    /// Catalog holding `initial`.
    #[must_use]
    pub fn init(initial: HashMap<String, PhaseRequests>) -> Self {
        tracing::info!(endpoints = initial.len(), "Request catalog initialized");
        Self {
            entries: Arc::new(RwLock::new(wrap(initial))),
            writer: Mutex::new(None),
        }
    }

    /// Catalog built from persisted `{lookup, response}` documents.
    ///
    /// # Errors
    ///
    /// Returns the first [`SpecError`] encountered.
    pub fn from_documents<I>(documents: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let initial = documents
            .into_iter()
            .map(|(endpoint, document)| Ok((endpoint, PhaseRequests::from_json(&document)?)))
            .collect::<Result<HashMap<_, _>, SpecError>>()?;
        Ok(Self::init(initial))
    }

    /// Request lists of `endpoint`.
    #[must_use]
    pub fn get(&self, endpoint: &str) -> Option<Arc<PhaseRequests>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
            .cloned()
    }

    /// Number of endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a writer task is running.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|writer| !writer.handle.is_finished())
    }

    /// Start the writer task applying changes from `changes`.
    ///
    /// Returns `false`, dropping `changes`, if a writer is already running.
    /// Must be called within a Tokio runtime.
    pub fn subscribe(&self, mut changes: mpsc::Receiver<CatalogChange>) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if writer.as_ref().is_some_and(|writer| !writer.handle.is_finished()) {
            tracing::warn!("Request catalog already subscribed");
            return false;
        }

        let (shutdown, mut stop) = watch::channel(false);
        let entries = Arc::clone(&self.entries);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Some(change) => apply(&entries, change),
                        None => {
                            tracing::info!("Catalog change channel closed");
                            break;
                        }
                    },
                    _ = stop.changed() => {
                        tracing::info!("Request catalog writer stopping");
                        break;
                    }
                }
            }
        });

        *writer = Some(Writer { shutdown, handle });
        true
    }

    /// Stop the writer task and wait for it to finish. Changes already
    /// applied stay; queued ones are dropped.
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(Writer { shutdown, handle }) = writer else {
            return;
        };
        shutdown.send(true).ok();
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Request catalog writer failed");
        }
    }
}

fn wrap(entries: HashMap<String, PhaseRequests>) -> Entries {
    entries
        .into_iter()
        .map(|(endpoint, requests)| (endpoint, Arc::new(requests)))
        .collect()
}

fn apply(entries: &RwLock<Entries>, change: CatalogChange) {
    let mut entries = entries.write().unwrap_or_else(PoisonError::into_inner);
    match change {
        CatalogChange::Upsert { endpoint, requests } => {
            tracing::debug!(endpoint = %endpoint, "Catalog endpoint updated");
            entries.insert(endpoint, Arc::new(requests));
        }
        CatalogChange::Remove { endpoint } => {
            tracing::debug!(endpoint = %endpoint, "Catalog endpoint removed");
            entries.remove(&endpoint);
        }
        CatalogChange::Reload(all) => {
            tracing::info!(endpoints = all.len(), "Catalog reloaded");
            *entries = wrap(all);
        }
    }
}
