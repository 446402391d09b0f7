//! Long-lived watchers that turn store changes into broadcasts.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    dispatch::Dispatcher,
    events::EventRouter,
    store::{Collection, DocumentStore, MutationStream},
};

pub struct ChangeObserver {
    collection: Collection,
    store: Arc<dyn DocumentStore>,
}

impl ChangeObserver {
    pub fn new(collection: Collection, store: Arc<dyn DocumentStore>) -> Self {
        Self { collection, store }
    }

    /// Opens the collection's change feed. Changes made after this call are not missed.
    pub fn start(&self) -> MutationStream {
        self.store.watch(self.collection)
    }

    /// Routes and publishes each mutation in feed order until the feed ends or fails.
    ///
    /// A failed feed is not reopened: real-time updates for this collection stop until the
    /// process restarts.
    pub async fn run(self, mut feed: MutationStream, router: Arc<EventRouter>, dispatcher: Arc<Dispatcher>) {
        let collection = self.collection;
        info!(%collection, "observer started");

        while let Some(next) = feed.next().await {
            let mutation = match next {
                Ok(mutation) => mutation,
                Err(e) => {
                    error!(%collection, error = %e, "change feed failed, observer stopping");
                    return;
                }
            };

            let Some(kind) = mutation.kind() else {
                warn!(%collection, "mutation with neither snapshot, skipping");
                continue;
            };
            debug!(%collection, ?kind, "mutation observed");

            match router.route(&mutation).await {
                Ok(events) => dispatcher.publish_all(&events),
                Err(e) => warn!(%collection, ?kind, error = %e, "could not route mutation"),
            }
        }

        warn!(%collection, "change feed closed, observer stopped");
    }

    pub fn spawn(self, router: Arc<EventRouter>, dispatcher: Arc<Dispatcher>) -> JoinHandle<()> {
        let feed = self.start();
        tokio::spawn(self.run(feed, router, dispatcher))
    }
}

/// One observer task per watched collection, feeds opened before this returns.
pub fn spawn_observers(
    store: &Arc<dyn DocumentStore>,
    router: &Arc<EventRouter>,
    dispatcher: &Arc<Dispatcher>,
) -> Vec<JoinHandle<()>> {
    Collection::WATCHED
        .into_iter()
        .map(|collection| {
            ChangeObserver::new(collection, store.clone()).spawn(router.clone(), dispatcher.clone())
        })
        .collect()
}
