//! Module runtime - loading, watching and publishing hot-swappable handlers
//!
//! Control flow:
//! - the watcher notices a module file and loads it through a `ModuleLoader`
//! - the loaded handler travels as a `LifecycleEvent` over a one-slot channel
//! - the publisher runs `init()` and binds the handler in the `RouteTable`
//! - the gateway router resolves each request against the table

pub mod boundary;
pub mod handler;
pub mod publisher;
pub mod routes;
pub mod watcher;

pub use boundary::HandlerFault;
pub use handler::{DylibLoader, ModuleLoader};
pub use publisher::RoutePublisher;
pub use routes::{RouteEntry, RouteTable};
pub use watcher::{ModuleWatcher, ReloadPolicy};
