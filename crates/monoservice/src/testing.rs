//! In-process handlers and loaders for tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use monoservice_sdk::{Handler, Request, Response};

use crate::runtime::handler::{LoadError, LoadedHandler, ModuleLoader};

/// Answers every request with a fixed body
#[derive(Clone)]
pub struct StaticHandler {
    path: String,
    methods: Vec<String>,
    body: String,
    delay: Option<Duration>,
    panic_on_init: bool,
    panic_on_process: bool,
    shutdown_delay: Option<Duration>,
    inits: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl StaticHandler {
    pub fn new(path: &str, body: &str) -> Self {
        Self {
            path: path.to_string(),
            methods: vec!["GET".to_string()],
            body: body.to_string(),
            delay: None,
            panic_on_init: false,
            panic_on_process: false,
            shutdown_delay: None,
            inits: Arc::new(AtomicUsize::new(0)),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = Some(delay);
        self
    }

    pub fn panicking_on_init(mut self) -> Self {
        self.panic_on_init = true;
        self
    }

    pub fn panicking_on_process(mut self) -> Self {
        self.panic_on_process = true;
        self
    }

    pub fn init_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.inits)
    }

    pub fn shutdown_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.shutdowns)
    }

    pub fn load(self, module: &str) -> LoadedHandler {
        LoadedHandler::new(module, Path::new("modules").join(module), Box::new(self)).unwrap()
    }
}

impl Handler for StaticHandler {
    fn init(&self) {
        if self.panic_on_init {
            panic!("init failed on purpose");
        }
        self.inits.fetch_add(1, Ordering::SeqCst);
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn methods(&self) -> Vec<String> {
        self.methods.clone()
    }

    fn process(&self, _request: &Request) -> Response {
        if self.panic_on_process {
            panic!("process failed on purpose");
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        Response::raw(200, self.body.clone())
    }

    fn shutdown(&self) {
        if let Some(delay) = self.shutdown_delay {
            std::thread::sleep(delay);
        }
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echoes the adapted request back as JSON
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn init(&self) {}

    fn path(&self) -> String {
        "/echo".to_string()
    }

    fn methods(&self) -> Vec<String> {
        vec!["GET".to_string(), "POST".to_string()]
    }

    fn process(&self, request: &Request) -> Response {
        Response::ok(serde_json::json!({
            "method": request.method,
            "host": request.host,
            "path": request.path,
            "body": String::from_utf8_lossy(&request.body),
            "headers": request.headers,
            "query": request.query,
            "has_request_id": !request.request_id.is_empty(),
        }))
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

/// Loader that builds handlers from registered factories instead of files
#[derive(Default)]
pub struct FakeLoader {
    factories: Mutex<HashMap<String, Factory>>,
    loads: AtomicUsize,
    /// Loads every unregistered name
    fallback: Option<Box<dyn ModuleLoader>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: impl ModuleLoader + 'static) -> Self {
        Self {
            fallback: Some(Box::new(fallback)),
            ..Self::default()
        }
    }

    pub fn register(&self, file_name: &str, handler: StaticHandler) {
        let factory: Factory = Box::new(move || Box::new(handler.clone()));
        self.factories
            .lock()
            .unwrap()
            .insert(file_name.to_string(), factory);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, folder: &Path, file_name: &str) -> Result<LoadedHandler, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let factories = self.factories.lock().unwrap();
        match (factories.get(file_name), &self.fallback) {
            (Some(factory), _) => LoadedHandler::new(file_name, folder.join(file_name), factory()),
            (None, Some(fallback)) => fallback.load(folder, file_name),
            (None, None) => Err(LoadError::Open {
                path: folder.join(file_name),
                reason: "not a loadable module".to_string(),
            }),
        }
    }
}

/// A real shared library without a handler declaration, if the host has one
pub fn system_library() -> Option<PathBuf> {
    [
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/usr/lib/x86_64-linux-gnu/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib64/libm.so.6",
        "/lib64/libm.so.6",
        "/usr/lib/libm.so.6",
    ]
    .into_iter()
    .map(PathBuf::from)
    .find(|path| path.is_file())
}
