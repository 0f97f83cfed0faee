//! Dynamic module loading
//!
//! Loads handler implementations from shared libraries (.so) at runtime.
//!
//! # Architecture
//!
//! Modules are compiled against the SDK, which defines the `Handler` trait and
//! the `PluginDeclaration` each module exports as `HANDLER_PLUGIN`. Loading a
//! module:
//! 1. Checks the file holds a complete ELF image
//! 2. Opens the library with the platform's dynamic linker
//! 3. Resolves the declaration symbol
//! 4. Checks the declaration was built against the host's contract
//! 5. Constructs the handler and inspects its path and methods
//!
//! The resulting [`LoadedHandler`] keeps the library mapped for as long as the
//! handler is alive, so a replaced handler stays callable until its last
//! in-flight request completes.

use std::fmt;
use std::fs;
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use axum::http::Method;
use goblin::elf::{program_header::PT_LOAD, Elf};
use libloading::{Library, Symbol};
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

use monoservice_sdk::{Handler, PluginDeclaration, Request, Response, PLUGIN_SYMBOL};

use super::boundary::{guard, HandlerFault};

/// Why a module could not be loaded. Never fatal to the host.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to open module {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("module {module} does not export HANDLER_PLUGIN: {reason}")]
    SymbolNotFound { module: String, reason: String },

    #[error("module {module} does not satisfy the handler contract: {reason}")]
    ContractMismatch { module: String, reason: String },

    #[error(transparent)]
    Fault(#[from] HandlerFault),
}

/// Loads a module file into a handler
///
/// The rest of the runtime only depends on this trait, never on how the
/// handler was produced.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, folder: &Path, file_name: &str) -> Result<LoadedHandler, LoadError>;
}

/// A handler and the library its code lives in
struct ModuleImage {
    module: String,

    /// Declared before `_library` so it is dropped first
    handler: Box<dyn Handler>,

    _library: Option<Library>,
}

impl Drop for ModuleImage {
    fn drop(&mut self) {
        if let Err(fault) = guard(&self.module, "shutdown", || self.handler.shutdown()) {
            tracing::error!(module = %self.module, error = %fault, "Module teardown failed");
        }
    }
}

/// A handler taken from a module, with the library backing it
pub struct LoadedHandler {
    image: ManuallyDrop<ModuleImage>,

    /// Module file name, the registry key
    module: String,

    /// File the module was loaded from
    source: PathBuf,

    /// Route path, read once at load time
    path: String,

    /// Accepted methods, read once at load time
    methods: Vec<Method>,

    loaded_at: Instant,
}

impl LoadedHandler {
    /// Wrap a handler constructed in-process
    pub fn new(
        module: impl Into<String>,
        source: PathBuf,
        handler: Box<dyn Handler>,
    ) -> Result<Self, LoadError> {
        Self::assemble(module.into(), source, handler, None)
    }

    fn assemble(
        module: String,
        source: PathBuf,
        handler: Box<dyn Handler>,
        library: Option<Library>,
    ) -> Result<Self, LoadError> {
        let (path, methods) = match inspect(&module, handler.as_ref()) {
            Ok(contract) => contract,
            Err(e) => {
                // Handler code lives in the library; drop it first.
                drop(handler);
                drop(library);
                return Err(e);
            }
        };

        Ok(Self {
            image: ManuallyDrop::new(ModuleImage {
                module: module.clone(),
                handler,
                _library: library,
            }),
            module,
            source,
            path,
            methods,
            loaded_at: Instant::now(),
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    #[cfg(test)]
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Get the age of this loaded handler
    pub fn age(&self) -> Duration {
        self.loaded_at.elapsed()
    }

    /// Run the module's one-time setup
    pub fn init(&self) -> Result<(), HandlerFault> {
        guard(&self.module, "init", || self.image.handler.init())
    }

    /// Execute the handler
    pub fn process(&self, request: &Request) -> Result<Response, HandlerFault> {
        guard(&self.module, "process", || self.image.handler.process(request))
    }
}

impl Drop for LoadedHandler {
    fn drop(&mut self) {
        // Safety: `image` is not used again after being taken here.
        let image = unsafe { ManuallyDrop::take(&mut self.image) };

        // The last reference can go away on an async worker. Module teardown
        // and unmapping the library must not stall it.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(image));
            }
            Err(_) => drop(image),
        }

        tracing::debug!(
            module = %self.module,
            path = %self.path,
            age_ms = self.age().as_millis() as u64,
            "Released module handler"
        );
    }
}

impl fmt::Debug for LoadedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedHandler")
            .field("module", &self.module)
            .field("source", &self.source)
            .field("path", &self.path)
            .field("methods", &self.methods)
            .finish()
    }
}

/// Read and validate the route a handler claims
fn inspect(module: &str, handler: &dyn Handler) -> Result<(String, Vec<Method>), LoadError> {
    let mismatch = |reason: String| LoadError::ContractMismatch {
        module: module.to_string(),
        reason,
    };

    let path = guard(module, "path", || handler.path())?;
    if !path.starts_with('/') {
        return Err(mismatch(format!("route path {:?} must start with '/'", path)));
    }
    if guard(module, "path", || handler.path())? != path {
        return Err(mismatch("route path is not stable across calls".to_string()));
    }

    let declared = guard(module, "methods", || handler.methods())?;
    let mut methods: Vec<Method> = Vec::with_capacity(declared.len());
    for name in declared {
        let method = Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| mismatch(format!("{:?} is not an HTTP method", name)))?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    if methods.is_empty() {
        return Err(mismatch("no HTTP methods declared".to_string()));
    }

    Ok((path, methods))
}

/// Check a declaration against the host's contract and construct its handler
fn instantiate(file_name: &str, declaration: &PluginDeclaration) -> Result<Box<dyn Handler>, LoadError> {
    if let Some(reason) = declaration.incompatibility() {
        return Err(LoadError::ContractMismatch {
            module: file_name.to_string(),
            reason,
        });
    }
    Ok(guard(file_name, "create", declaration.create)?)
}

/// Make sure every byte the dynamic linker maps is present in the file.
///
/// A module still being copied into the folder can carry a valid header while
/// its segments are not yet on disk. Touching a mapped page past the end of the
/// file raises SIGBUS, which no unwind boundary can contain.
fn check_image(bytes: &[u8]) -> Result<(), String> {
    let elf = Elf::parse(bytes).map_err(|e| format!("not a loadable ELF image: {e}"))?;
    let len = bytes.len() as u64;

    for segment in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let end = segment.p_offset.checked_add(segment.p_filesz);
        if end.map_or(true, |end| end > len) {
            return Err(format!(
                "loadable segment at offset {} with {} bytes runs past the end of the file ({} bytes)",
                segment.p_offset, segment.p_filesz, len
            ));
        }
    }

    let header = &elf.header;
    let table = u64::from(header.e_shnum) * u64::from(header.e_shentsize);
    if header.e_shoff.checked_add(table).map_or(true, |end| end > len) {
        return Err(format!(
            "section header table at offset {} runs past the end of the file ({} bytes)",
            header.e_shoff, len
        ));
    }

    Ok(())
}

/// Loader backed by the platform's dynamic linker
pub struct DylibLoader {
    /// Private copies of module files, see [`DylibLoader::with_shadow_copies`]
    shadow: Option<TempDir>,
}

impl DylibLoader {
    /// Open module files where they are
    pub fn new() -> Self {
        Self { shadow: None }
    }

    /// Open a private copy of each module file instead of the file itself.
    ///
    /// The dynamic linker hands back the already-mapped image when asked to
    /// open a path it still has open, so a module rewritten in place would
    /// otherwise never be reloaded.
    pub fn with_shadow_copies() -> std::io::Result<Self> {
        let shadow = tempfile::Builder::new().prefix("monoservice-modules").tempdir()?;
        Ok(Self { shadow: Some(shadow) })
    }

    pub fn shadow_dir(&self) -> Option<&Path> {
        self.shadow.as_ref().map(TempDir::path)
    }

    fn open(&self, source: &Path, file_name: &str) -> Result<Library, LoadError> {
        let open_error = |reason: String| LoadError::Open {
            path: source.to_path_buf(),
            reason,
        };

        let image = fs::read(source).map_err(|e| open_error(e.to_string()))?;
        check_image(&image).map_err(open_error)?;

        let Some(shadow) = self.shadow_dir() else {
            // Safety: running a module's initialisers is the point of loading it.
            return unsafe { Library::new(source) }.map_err(|e| open_error(e.to_string()));
        };

        // Write the bytes that were checked, not whatever the source holds now.
        let copy = shadow.join(format!("{}-{}", Uuid::new_v4().simple(), file_name));
        fs::write(&copy, &image).map_err(|e| open_error(e.to_string()))?;
        let library = unsafe { Library::new(&copy) };
        // The mapping outlives the file.
        if let Err(e) = fs::remove_file(&copy) {
            tracing::warn!(path = ?copy, error = %e, "Failed to remove module shadow copy");
        }
        library.map_err(|e| open_error(e.to_string()))
    }
}

impl Default for DylibLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleLoader for DylibLoader {
    fn load(&self, folder: &Path, file_name: &str) -> Result<LoadedHandler, LoadError> {
        let source = folder.join(file_name);
        let library = self.open(&source, file_name)?;

        // Safety: the symbol is only dereferenced after being found, and the
        // declaration is copied out while the library is still mapped.
        let declaration: PluginDeclaration = unsafe {
            let symbol: Symbol<*const PluginDeclaration> = library
                .get(PLUGIN_SYMBOL)
                .map_err(|e| LoadError::SymbolNotFound {
                    module: file_name.to_string(),
                    reason: e.to_string(),
                })?;
            let declaration = *symbol;
            if declaration.is_null() {
                return Err(LoadError::SymbolNotFound {
                    module: file_name.to_string(),
                    reason: "symbol resolves to null".to_string(),
                });
            }
            *declaration
        };

        let handler = instantiate(file_name, &declaration)?;
        let loaded = LoadedHandler::assemble(file_name.to_string(), source, handler, Some(library))?;

        tracing::info!(
            module = %loaded.module(),
            path = %loaded.path(),
            methods = ?loaded.methods(),
            "Loaded module"
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{system_library, StaticHandler};
    use monoservice_sdk::{ContractLayout, ABI_VERSION, SDK_VERSION};
    use std::sync::atomic::Ordering;

    fn create_static() -> Box<dyn Handler> {
        Box::new(StaticHandler::new("/a", "{}"))
    }

    fn create_panicking() -> Box<dyn Handler> {
        panic!("constructor failed")
    }

    fn rejection(declaration: PluginDeclaration) -> LoadError {
        match instantiate("a.so", &declaration) {
            Ok(_) => panic!("declaration was accepted"),
            Err(e) => e,
        }
    }

    fn declaration() -> PluginDeclaration {
        PluginDeclaration {
            abi_version: ABI_VERSION,
            sdk_version: SDK_VERSION,
            layout: ContractLayout::current(),
            create: create_static,
        }
    }

    #[test]
    fn test_new_reads_route_once() {
        let handler = StaticHandler::new("/hello", r#"{"message":"hi"}"#).with_methods(&["get", "POST", "GET"]);
        let loaded = LoadedHandler::new("hello.so", PathBuf::from("modules/hello.so"), Box::new(handler)).unwrap();

        assert_eq!(loaded.module(), "hello.so");
        assert_eq!(loaded.path(), "/hello");
        assert_eq!(loaded.methods(), [Method::GET, Method::POST]);
        assert_eq!(loaded.source(), Path::new("modules/hello.so"));
    }

    #[test]
    fn test_contract_mismatch() {
        let relative = StaticHandler::new("hello", "{}");
        let err = LoadedHandler::new("a.so", PathBuf::new(), Box::new(relative)).unwrap_err();
        assert!(matches!(err, LoadError::ContractMismatch { .. }), "{err}");

        let no_methods = StaticHandler::new("/a", "{}").with_methods(&[]);
        let err = LoadedHandler::new("a.so", PathBuf::new(), Box::new(no_methods)).unwrap_err();
        assert!(err.to_string().contains("no HTTP methods"), "{err}");

        let bad_method = StaticHandler::new("/a", "{}").with_methods(&["GE T"]);
        let err = LoadedHandler::new("a.so", PathBuf::new(), Box::new(bad_method)).unwrap_err();
        assert!(matches!(err, LoadError::ContractMismatch { .. }), "{err}");
    }

    #[test]
    fn test_process_fault_is_contained() {
        let handler = StaticHandler::new("/boom", "{}").panicking_on_process();
        let loaded = LoadedHandler::new("boom.so", PathBuf::new(), Box::new(handler)).unwrap();

        let fault = loaded.process(&Request::default()).unwrap_err();
        assert_eq!(fault.operation, "process");
        assert_eq!(fault.module, "boom.so");
    }

    #[test]
    fn test_shutdown_runs_on_release() {
        let handler = StaticHandler::new("/a", "{}");
        let shutdowns = handler.shutdown_count();
        let loaded = LoadedHandler::new("a.so", PathBuf::new(), Box::new(handler)).unwrap();

        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        drop(loaded);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_inside_runtime_does_not_block_caller() {
        let handler = StaticHandler::new("/a", "{}").with_shutdown_delay(Duration::from_millis(300));
        let shutdowns = handler.shutdown_count();
        let loaded = handler.load("a.so");

        let started = Instant::now();
        drop(loaded);
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while shutdowns.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("shutdown never ran");
    }

    #[test]
    fn test_instantiate_checks_declaration() {
        let handler = instantiate("a.so", &declaration()).unwrap();
        assert_eq!(handler.path(), "/a");

        let stale_abi = PluginDeclaration {
            abi_version: ABI_VERSION + 1,
            ..declaration()
        };
        let err = rejection(stale_abi);
        assert!(matches!(err, LoadError::ContractMismatch { .. }), "{err}");

        let other_sdk = PluginDeclaration {
            sdk_version: "0.0.0-other",
            ..declaration()
        };
        let err = rejection(other_sdk);
        assert!(err.to_string().contains("0.0.0-other"), "{err}");

        let other_layout = PluginDeclaration {
            layout: ContractLayout {
                request_size: 1,
                response_size: 1,
            },
            ..declaration()
        };
        let err = rejection(other_layout);
        assert!(matches!(err, LoadError::ContractMismatch { .. }), "{err}");

        let panicking = PluginDeclaration {
            create: create_panicking,
            ..declaration()
        };
        let err = rejection(panicking);
        assert!(matches!(err, LoadError::Fault(ref fault) if fault.operation == "create"), "{err}");
    }

    #[test]
    fn test_dylib_loader_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DylibLoader::new().load(dir.path(), "missing.so").unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }), "{err}");
    }

    #[test]
    fn test_dylib_loader_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.so"), b"definitely not an ELF file").unwrap();

        let err = DylibLoader::new().load(dir.path(), "bad.so").unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }), "{err}");
    }

    #[test]
    fn test_dylib_loader_requires_declaration_symbol() {
        let Some(library) = system_library() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        std::fs::copy(&library, dir.path().join("m.so")).unwrap();

        let err = DylibLoader::new().load(dir.path(), "m.so").unwrap_err();
        assert!(matches!(err, LoadError::SymbolNotFound { ref module, .. } if module == "m.so"), "{err}");

        let shadowed = DylibLoader::with_shadow_copies().unwrap();
        let err = shadowed.load(dir.path(), "m.so").unwrap_err();
        assert!(matches!(err, LoadError::SymbolNotFound { .. }), "{err}");
    }

    #[test]
    fn test_truncated_module_is_rejected_before_mapping() {
        let Some(library) = system_library() else {
            return;
        };
        let image = std::fs::read(&library).unwrap();
        assert_eq!(check_image(&image), Ok(()));

        let dir = tempfile::tempdir().unwrap();
        for percent in [5, 40, 95, 99] {
            let cut = image.len() * percent / 100;
            std::fs::write(dir.path().join("m.so"), &image[..cut]).unwrap();

            let err = DylibLoader::new().load(dir.path(), "m.so").unwrap_err();
            assert!(matches!(err, LoadError::Open { .. }), "{percent}%: {err}");
        }
    }

    #[test]
    fn test_shadow_copy_is_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.so"), b"garbage").unwrap();

        let loader = DylibLoader::with_shadow_copies().unwrap();
        assert!(loader.load(dir.path(), "bad.so").is_err());

        let leftovers = std::fs::read_dir(loader.shadow_dir().unwrap()).unwrap().count();
        assert_eq!(leftovers, 0);
        // The module file itself is untouched.
        assert!(dir.path().join("bad.so").exists());
    }
}
