//! Route publisher
//!
//! Consumes lifecycle events from the watcher, initialises each handler and
//! binds it into the route table.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::boundary::HandlerFault;
use super::routes::{Publication, RouteTable};
use super::watcher::LifecycleEvent;

#[derive(Clone)]
pub struct RoutePublisher {
    routes: Arc<RouteTable>,
}

impl RoutePublisher {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }

    /// Initialise the event's handler and bind it.
    ///
    /// If `init()` faults the event is dropped and the table is left as it was.
    pub fn publish(&self, event: LifecycleEvent) -> Result<Publication, HandlerFault> {
        let LifecycleEvent { module, action, handler } = event;

        handler.init()?;
        let publication = self.routes.install(Arc::new(handler));

        match &publication {
            Publication::Installed { path } => {
                tracing::info!(
                    module = %module,
                    ?action,
                    path = %path,
                    routes = self.routes.len(),
                    "Added route"
                );
            }
            Publication::Replaced { path, previous_module, revision } => {
                tracing::info!(
                    module = %module,
                    ?action,
                    path = %path,
                    previous = %previous_module,
                    revision,
                    "Replaced route handler"
                );
            }
        }
        Ok(publication)
    }

    /// Publish events until the watcher side of the channel closes.
    pub async fn run(self, mut events: mpsc::Receiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            let module = event.module.clone();
            let publisher = self.clone();

            // init() is module code and may block
            match tokio::task::spawn_blocking(move || publisher.publish(event)).await {
                Ok(Ok(_)) => {}
                Ok(Err(fault)) => {
                    tracing::error!(module = %module, error = %fault, "Module init failed, route left unchanged");
                }
                Err(e) => {
                    tracing::error!(module = %module, error = %e, "Publishing task failed");
                }
            }
        }
        tracing::debug!("Lifecycle event channel closed, publisher stopping");
    }
}
