//! Example module answering GET /another

use monoservice_sdk::prelude::*;

pub struct AnotherHandler;

impl Handler for AnotherHandler {
    fn init(&self) {
        eprintln!("another plugin initialized");
    }

    fn path(&self) -> String {
        "/another".to_string()
    }

    fn methods(&self) -> Vec<String> {
        vec!["GET".to_string()]
    }

    fn process(&self, _request: &Request) -> Response {
        Response::ok(json!({"message": "hello from the another plugin"}))
    }
}

export_handler!(AnotherHandler);
