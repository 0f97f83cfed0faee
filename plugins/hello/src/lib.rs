//! Example module answering GET /hello

use monoservice_sdk::prelude::*;

pub struct HelloHandler;

impl Handler for HelloHandler {
    fn init(&self) {
        eprintln!("hello plugin initialized");
    }

    fn path(&self) -> String {
        "/hello".to_string()
    }

    fn methods(&self) -> Vec<String> {
        vec!["GET".to_string()]
    }

    fn process(&self, _request: &Request) -> Response {
        Response::raw(200, r#"{"message":"hello from the plugin"}"#)
    }
}

export_handler!(HelloHandler);
