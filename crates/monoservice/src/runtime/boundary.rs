//! Fault boundary around calls into module code
//!
//! A panic raised inside a module must never unwind through the host. Every
//! call into a loaded handler goes through [`guard`], which turns a panic into
//! a [`HandlerFault`] value.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;

/// A module failed unexpectedly while the host was calling into it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("module {module} faulted in {operation}: {message}")]
pub struct HandlerFault {
    pub module: String,
    pub operation: &'static str,
    pub message: String,
}

/// Run `f`, converting a panic into a [`HandlerFault`].
///
/// Only effective for modules built with `panic = "unwind"`; an aborting
/// module takes the process down with it.
pub fn guard<T>(
    module: &str,
    operation: &'static str,
    f: impl FnOnce() -> T,
) -> Result<T, HandlerFault> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| HandlerFault {
        module: module.to_string(),
        operation,
        message: panic_message(payload.as_ref()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
