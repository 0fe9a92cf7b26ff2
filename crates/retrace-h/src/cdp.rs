use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use retrace_engine::backend::DriverError;
use retrace_engine::config::schema::DriverConfig;
use retrace_engine::protocol::BrowserKind;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Engines are shared by every session asking for the same kind and head mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub kind: BrowserKind,
    pub headless: bool,
}

/// One launched browser process and its CDP handler loop.
pub struct Engine {
    browser: Browser,
    handler_task: JoinHandle<()>,
    user_data_dir: PathBuf,
    cleanup_user_data_dir: bool,
}

impl Engine {
    async fn launch(key: EngineKey, config: &DriverConfig) -> Result<Self, DriverError> {
        if key.kind != BrowserKind::Chromium {
            return Err(DriverError::NotSupported(format!(
                "{} engine (only chromium is available)",
                key.kind.as_str()
            )));
        }

        let mut config_builder = BrowserConfig::builder();
        if config.no_sandbox {
            config_builder = config_builder.no_sandbox(); // Often needed in docker/CI/restricted envs
        }
        let (user_data_dir, cleanup_user_data_dir) = resolve_user_data_dir(config)?;
        config_builder = config_builder.user_data_dir(&user_data_dir);

        if key.headless {
            tracing::info!("Launching browser in headless mode");
        } else {
            tracing::info!("Launching browser in visible mode");
            config_builder = config_builder.with_head();
        }

        // Configured path wins over CHROME_BIN.
        let chrome_bin = config
            .chrome_bin
            .clone()
            .or_else(|| std::env::var("CHROME_BIN").ok().map(PathBuf::from));
        if let Some(chrome_bin) = chrome_bin {
            tracing::info!("Using custom Chrome binary: {}", chrome_bin.display());
            config_builder = config_builder.chrome_executable(chrome_bin);
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| DriverError::Launch(format!("Failed to build browser config: {}", e)))?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to launch browser: {}", e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    tracing::error!("Browser handler error (ignoring): {}", e);
                    continue;
                }
            }
            tracing::info!("Browser handler task ended");
        });

        Ok(Self {
            browser,
            handler_task,
            user_data_dir,
            cleanup_user_data_dir,
        })
    }

    /// Open an isolated browsing context with a single blank page.
    async fn open_context(&self) -> Result<(BrowserContextId, Page), DriverError> {
        let context_id = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to create browser context: {}", e)))?
            .result
            .browser_context_id;

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id.clone());
        match self.browser.new_page(target).await {
            Ok(page) => Ok((context_id, page)),
            Err(e) => {
                self.dispose_context(context_id).await;
                Err(DriverError::Launch(format!("Failed to create page: {}", e)))
            }
        }
    }

    async fn dispose_context(&self, context_id: BrowserContextId) {
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            tracing::debug!("Failed to dispose browser context: {}", e);
        }
    }

    async fn close(mut self) -> Result<(), DriverError> {
        self.browser
            .close()
            .await
            .map_err(|e| DriverError::Other(format!("Error closing browser: {}", e)))?;
        self.handler_task
            .await
            .map_err(|e| DriverError::Other(format!("Error awaiting handler: {}", e)))?;

        if self.cleanup_user_data_dir
            && let Err(e) = std::fs::remove_dir_all(&self.user_data_dir)
        {
            tracing::debug!(
                "Failed to clean up user-data-dir {}: {}",
                self.user_data_dir.display(),
                e
            );
        }
        Ok(())
    }
}

struct PoolEntry {
    engine: Arc<Engine>,
    contexts: usize,
}

/// A context leased from the pool. Hand it back with [`BrowserPool::release`].
pub struct ContextLease {
    pub key: EngineKey,
    pub context_id: BrowserContextId,
    pub page: Page,
}

/// Reference-counted engines, one per [`EngineKey`].
///
/// An engine is launched on the first lease for its key and closed when its
/// last context is released. The map lock is held across launch and close so
/// a profile directory is never used by two processes at once.
pub struct BrowserPool {
    config: DriverConfig,
    engines: Mutex<HashMap<EngineKey, PoolEntry>>,
}

impl BrowserPool {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lease(&self, key: EngineKey) -> Result<ContextLease, DriverError> {
        let engine = {
            let mut engines = self.engines.lock().await;
            let entry = match engines.remove(&key) {
                Some(entry) => entry,
                None => PoolEntry {
                    engine: Arc::new(Engine::launch(key, &self.config).await?),
                    contexts: 0,
                },
            };
            let engine = entry.engine.clone();
            engines.insert(
                key,
                PoolEntry {
                    engine: entry.engine,
                    contexts: entry.contexts + 1,
                },
            );
            engine
        };

        match engine.open_context().await {
            Ok((context_id, page)) => Ok(ContextLease {
                key,
                context_id,
                page,
            }),
            Err(e) => {
                drop(engine);
                self.release_count(key).await;
                Err(e)
            }
        }
    }

    /// Dispose a leased context, closing its engine if it was the last one.
    pub async fn release(&self, lease: ContextLease) {
        let ContextLease {
            key,
            context_id,
            page,
        } = lease;
        if let Err(e) = page.close().await {
            tracing::debug!("Failed to close page: {}", e);
        }
        {
            let engine = self
                .engines
                .lock()
                .await
                .get(&key)
                .map(|entry| entry.engine.clone());
            if let Some(engine) = engine {
                engine.dispose_context(context_id).await;
            }
        }
        self.release_count(key).await;
    }

    async fn release_count(&self, key: EngineKey) {
        let mut engines = self.engines.lock().await;
        let Some(entry) = engines.get_mut(&key) else {
            return;
        };
        entry.contexts = entry.contexts.saturating_sub(1);
        if entry.contexts > 0 {
            return;
        }
        if let Some(entry) = engines.remove(&key) {
            close_engine(key, entry.engine).await;
        }
    }

    /// Number of live contexts on the engine for `key`.
    pub async fn contexts(&self, key: EngineKey) -> usize {
        self.engines
            .lock()
            .await
            .get(&key)
            .map_or(0, |entry| entry.contexts)
    }

    /// Close every engine regardless of outstanding leases.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.engines.lock().await.drain().collect();
        for (key, entry) in drained {
            close_engine(key, entry.engine).await;
        }
    }
}

async fn close_engine(key: EngineKey, engine: Arc<Engine>) {
    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            tracing::info!("Closing {} engine", key.kind.as_str());
            if let Err(e) = engine.close().await {
                tracing::warn!("{}", e);
            }
        }
        // A binding still holds the engine; dropping the last handle kills the process.
        Err(_) => tracing::debug!("{} engine still referenced, left to drop", key.kind.as_str()),
    }
}

fn resolve_user_data_dir(config: &DriverConfig) -> Result<(PathBuf, bool), DriverError> {
    let io_error = |e: std::io::Error| DriverError::Launch(format!("user-data-dir: {}", e));

    let configured = config
        .user_data_dir
        .clone()
        .or_else(|| std::env::var("RETRACE_USER_DATA_DIR").ok().map(PathBuf::from));
    if let Some(path) = configured {
        std::fs::create_dir_all(&path).map_err(io_error)?;
        tracing::info!("Using configured user data dir: {}", path.display());
        return Ok((path, false));
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| DriverError::Launch(format!("System clock error: {}", e)))?
        .as_nanos();
    let unique = format!("retrace-chromium-profile-{}-{}", std::process::id(), nanos);
    let path = std::env::temp_dir().join(unique);
    std::fs::create_dir_all(&path).map_err(io_error)?;
    tracing::info!("Using isolated user data dir: {}", path.display());
    Ok((path, true))
}
