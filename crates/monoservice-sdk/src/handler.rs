//! The handler contract and the declaration a module exports
//!
//! Modules are compiled as shared libraries and loaded at runtime by the
//! host. Each one exports a single static named [`PLUGIN_SYMBOL`] whose
//! declaration lets the host check it was built against this exact contract
//! before any of its code is trusted.
//!
//! # Example
//!
//! ```ignore
//! use monoservice_sdk::prelude::*;
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn init(&self) {}
//!     fn path(&self) -> String { "/hello".into() }
//!     fn methods(&self) -> Vec<String> { vec!["GET".into()] }
//!     fn process(&self, _req: &Request) -> Response {
//!         Response::raw(200, r#"{"message":"hello from the plugin"}"#)
//!     }
//! }
//!
//! export_handler!(Hello);
//! ```

use std::mem::size_of;

use crate::{Request, Response};

/// Bumped whenever the shape of [`Handler`] or [`PluginDeclaration`] changes
pub const ABI_VERSION: u32 = 1;

/// Version of this SDK; host and module must agree exactly
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the exported declaration, NUL-terminated for symbol lookup
pub const PLUGIN_SYMBOL: &[u8] = b"HANDLER_PLUGIN\0";

/// Behaviour every loadable module provides.
///
/// None of these methods can fail: a handler that cannot service a request
/// reports it through the returned [`Response`]. Panicking is treated by the
/// host as a fault of the module, caught at the call boundary, but modules
/// must be built with `panic = "unwind"` for that to work.
pub trait Handler: Send + Sync {
    /// One-time setup. Called again each time the module is (re)loaded.
    fn init(&self);

    /// Route path owned by this handler. Must not change between calls.
    fn path(&self) -> String;

    /// HTTP methods answered on [`Handler::path`].
    fn methods(&self) -> Vec<String>;

    /// Turn a request into a response. Must not block indefinitely.
    fn process(&self, request: &Request) -> Response;

    /// Release resources acquired in [`Handler::init`]. Runs once, when the
    /// host lets go of the handler: after it has been replaced and its last
    /// in-flight request finished, or when it is discarded unpublished.
    fn shutdown(&self) {}
}

/// Sizes of the shared request/response shapes as compiled into a binary.
///
/// Two sides built against different definitions almost always disagree
/// here, which the host reports instead of corrupting memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractLayout {
    pub request_size: usize,
    pub response_size: usize,
}

impl ContractLayout {
    pub const fn current() -> Self {
        Self {
            request_size: size_of::<Request>(),
            response_size: size_of::<Response>(),
        }
    }
}

/// The static a module exports under [`PLUGIN_SYMBOL`]
#[derive(Debug, Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub sdk_version: &'static str,
    pub layout: ContractLayout,
    /// Constructs the module's handler
    pub create: fn() -> Box<dyn Handler>,
}

impl PluginDeclaration {
    /// Describe how this declaration differs from the host's contract, if it does.
    pub fn incompatibility(&self) -> Option<String> {
        if self.abi_version != ABI_VERSION {
            return Some(format!(
                "abi version {} does not match host abi version {}",
                self.abi_version, ABI_VERSION
            ));
        }
        if self.sdk_version != SDK_VERSION {
            return Some(format!(
                "built against sdk {} but host uses sdk {}",
                self.sdk_version, SDK_VERSION
            ));
        }
        if self.layout != ContractLayout::current() {
            return Some(format!(
                "request/response layout {:?} does not match host layout {:?}",
                self.layout,
                ContractLayout::current()
            ));
        }
        None
    }
}

/// Export a handler from a module crate.
///
/// Takes an expression constructing the handler value. Use at most once per
/// crate; the crate must be built with `crate-type = ["cdylib"]`.
#[macro_export]
macro_rules! export_handler {
    ($constructor:expr) => {
        #[no_mangle]
        pub static HANDLER_PLUGIN: $crate::PluginDeclaration = $crate::PluginDeclaration {
            abi_version: $crate::ABI_VERSION,
            sdk_version: $crate::SDK_VERSION,
            layout: $crate::ContractLayout::current(),
            create: {
                fn __monoservice_create() -> ::std::boxed::Box<dyn $crate::Handler> {
                    ::std::boxed::Box::new($constructor)
                }
                __monoservice_create
            },
        };
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Handler for Echo {
        fn init(&self) {}

        fn path(&self) -> String {
            "/echo".to_string()
        }

        fn methods(&self) -> Vec<String> {
            vec!["POST".to_string()]
        }

        fn process(&self, request: &Request) -> Response {
            Response::raw(200, String::from_utf8_lossy(&request.body))
        }
    }

    export_handler!(Echo);

    #[test]
    fn test_exported_declaration_matches_host() {
        assert_eq!(HANDLER_PLUGIN.abi_version, ABI_VERSION);
        assert!(HANDLER_PLUGIN.incompatibility().is_none());

        let handler = (HANDLER_PLUGIN.create)();
        assert_eq!(handler.path(), "/echo");
        let req = Request { body: b"{}".to_vec(), ..Default::default() };
        assert_eq!(handler.process(&req).json_content, "{}");
    }

    #[test]
    fn test_incompatibility_reasons() {
        let mut decl = HANDLER_PLUGIN;
        decl.abi_version = ABI_VERSION + 1;
        assert!(decl.incompatibility().unwrap().contains("abi version"));

        let mut decl = HANDLER_PLUGIN;
        decl.sdk_version = "0.0.0-other";
        assert!(decl.incompatibility().unwrap().contains("sdk"));

        let mut decl = HANDLER_PLUGIN;
        decl.layout.request_size += 8;
        assert!(decl.incompatibility().unwrap().contains("layout"));
    }

    #[test]
    fn test_symbol_is_nul_terminated() {
        assert_eq!(PLUGIN_SYMBOL.last(), Some(&0));
        assert_eq!(&PLUGIN_SYMBOL[..PLUGIN_SYMBOL.len() - 1], b"HANDLER_PLUGIN");
    }
}
