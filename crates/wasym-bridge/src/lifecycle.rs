//! Module lifecycle manager
//!
//! Loads the module artifact, wires the host import surface as its import
//! table, instantiates it and finalizes the bridge state. Initialization is
//! idempotent: once a bridge exists, both paths return it unchanged.
//!
//! The asynchronous path prefers streaming compilation when the engine
//! supports it. A streaming failure caused by the artifact not being served
//! as `application/wasm` is not an error: it is logged as a warning and the
//! artifact is re-fetched and compiled from a buffer. Genuine compilation
//! errors propagate.

use crate::api::Bridge;
use crate::config::BridgeConfig;
use crate::context::{BridgeContext, Environment};
use crate::engine::{
    CompiledModule, ModuleEngine, ModuleSource, StreamingError, StreamingSource,
};
use crate::error::BridgeError;
use crate::imports::build_import_table;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};

const WASM_CONTENT_TYPE: &str = "application/wasm";

/// Owns engine, configuration and the once-initialized bridge.
pub struct ModuleLifecycle {
    engine: Arc<dyn ModuleEngine>,
    config: BridgeConfig,
    environment: Environment,
    state: Mutex<Option<Bridge>>,
}

impl ModuleLifecycle {
    pub fn new(engine: Arc<dyn ModuleEngine>, config: BridgeConfig) -> Self {
        Self {
            engine,
            config,
            environment: Environment::default(),
            state: Mutex::new(None),
        }
    }

    /// Replace the ambient environment probed by the module.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// The bridge, if initialization already completed.
    pub fn initialized(&self) -> Option<Bridge> {
        self.state.lock().expect("lifecycle lock poisoned").clone()
    }

    /// Synchronous initialization from an already-compiled module.
    pub fn init_sync(&self, module: Arc<dyn CompiledModule>) -> Result<Bridge, BridgeError> {
        if let Some(bridge) = self.initialized() {
            return Ok(bridge);
        }
        let bridge = self.finalize(&module)?;
        Ok(self.store(bridge))
    }

    /// Asynchronous initialization from a source. With `None`, the source
    /// is resolved from configuration (explicit URL, or the companion
    /// artifact derived from the base resource name).
    pub async fn init(&self, source: Option<ModuleSource>) -> Result<Bridge, BridgeError> {
        if let Some(bridge) = self.initialized() {
            return Ok(bridge);
        }
        let module = match source {
            Some(ModuleSource::Compiled(module)) => module,
            Some(ModuleSource::Bytes(bytes)) => self.engine.compile(&bytes)?,
            Some(ModuleSource::Url(url)) => self.load_url(&url).await?,
            None => {
                let url = self
                    .config
                    .resolve_module_url()
                    .ok_or(BridgeError::NoSource)?;
                self.load_url(&url).await?
            }
        };
        let bridge = self.finalize(&module)?;
        Ok(self.store(bridge))
    }

    fn store(&self, bridge: Bridge) -> Bridge {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        match state.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                tracing::debug!("bridge initialized");
                *state = Some(bridge.clone());
                bridge
            }
        }
    }

    fn finalize(&self, module: &Arc<dyn CompiledModule>) -> Result<Bridge, BridgeError> {
        let context = BridgeContext::new(self.environment.clone());
        let imports = build_import_table(&context);
        let instance = module.instantiate(&imports).map_err(BridgeError::Trap)?;
        // Fresh memory caches are installed here; anything derived from a
        // previous instantiation attempt is unreachable by construction.
        context.install_instance(instance.clone());
        Ok(Bridge::new(context, instance))
    }

    async fn load_url(&self, url: &str) -> Result<Arc<dyn CompiledModule>, BridgeError> {
        let response = reqwest::get(url).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
        });
        let source = StreamingSource {
            content_type: content_type.clone(),
            stream: Box::pin(stream),
        };

        match self.engine.compile_streaming(source).await {
            Ok(module) => Ok(module),
            Err(StreamingError::Unsupported) => self.fetch_buffered(url).await,
            Err(err) => {
                if content_type.as_deref() == Some(WASM_CONTENT_TYPE) {
                    return Err(match err {
                        StreamingError::Compile(e) => e.into(),
                        StreamingError::Transport(e) => e.into(),
                        StreamingError::Unsupported => unreachable!("handled above"),
                    });
                }
                tracing::warn!(
                    url,
                    content_type = content_type.as_deref().unwrap_or("<none>"),
                    error = %err,
                    "streaming compilation failed because the module artifact \
                     was not served as application/wasm; falling back to \
                     buffered compilation"
                );
                self.fetch_buffered(url).await
            }
        }
    }

    async fn fetch_buffered(&self, url: &str) -> Result<Arc<dyn CompiledModule>, BridgeError> {
        let bytes = reqwest::get(url).await?.bytes().await?;
        Ok(self.engine.compile(&bytes)?)
    }
}

impl std::fmt::Debug for ModuleLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLifecycle")
            .field("config", &self.config)
            .field("initialized", &self.initialized().is_some())
            .finish()
    }
}
