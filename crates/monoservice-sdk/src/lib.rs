//! Monoservice SDK - the contract shared by the host and its loadable modules
//!
//! A module is a `cdylib` that depends on this crate, implements [`Handler`]
//! for one type and exports it with [`export_handler!`]. The host and every
//! module must be built against the same version of this crate with the same
//! compiler; the host refuses modules whose declaration does not match.

pub mod request;
pub mod response;
pub mod handler;
pub mod error;

pub mod prelude {
    //! Common imports for module authors
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::handler::Handler;
    pub use crate::error::HandlerError;
    pub use crate::export_handler;
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value as JsonValue};
}

// Re-export key types at crate root
pub use request::Request;
pub use response::Response;
pub use handler::{ContractLayout, Handler, PluginDeclaration, ABI_VERSION, PLUGIN_SYMBOL, SDK_VERSION};
pub use error::HandlerError;
