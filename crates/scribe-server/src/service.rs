//! The service orchestrator.
//!
//! Startup is strictly ordered and every step is fatal on failure:
//!
//! ```text
//! validate settings → EnginePool::initialize → DecodeExecutor::start (+ guard)
//!   → bind listener → [run] I/O runtime serving the router
//! ```
//!
//! Shutdown walks the same path backwards: stop accepting, drain every
//! session until the registry is empty, drop the work-guard, join the
//! decode workers, then shut the I/O runtime down.

use std::future::IntoFuture;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusHandle;
use scribe_engine::{EngineError, EngineFactory, EnginePool};
use scribe_runtime::{DecodeExecutor, ExecutorError, SessionRegistry, ShutdownReport, WorkGuard};
use scribe_settings::{ScribeSettings, SettingsError};
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::server::{AppState, router};
use crate::shutdown::ShutdownCoordinator;

/// Grace period for I/O tasks still alive after every session drained.
const IO_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Startup and serve failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Settings failed validation.
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    /// An engine could not be created.
    #[error("engine initialisation failed: {0}")]
    Engine(#[from] EngineError),
    /// The decode pool could not start.
    #[error("decode pool failed to start: {0}")]
    Executor(#[from] ExecutorError),
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The I/O runtime failed to build or serve.
    #[error("I/O runtime failed: {0}")]
    Runtime(#[source] std::io::Error),
}

/// A started service: engines loaded, decode workers running, port bound.
pub struct AsrService {
    settings: ScribeSettings,
    engines: EnginePool,
    executor: Arc<DecodeExecutor>,
    guard: WorkGuard,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl std::fmt::Debug for AsrService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsrService")
            .field("local_addr", &self.local_addr)
            .field("engines", &self.engines.capacity())
            .field("decode_workers", &self.executor.worker_count())
            .finish_non_exhaustive()
    }
}

impl AsrService {
    /// Validate `settings`, build `model_thread_num` engines with `factory`,
    /// start `decoder_thread_num` decode workers, and bind the listener.
    pub fn start(settings: ScribeSettings, factory: &dyn EngineFactory) -> Result<Self, ServiceError> {
        settings.validate()?;
        let addr = settings.listen_addr()?;
        let metrics = crate::metrics::install_recorder();
        let threads = settings.threads.clone();

        info!(engines = threads.model_thread_num, "initialising engine pool");
        let engines = EnginePool::initialize(threads.model_thread_num, factory)?;

        let (executor, guard) = DecodeExecutor::start(threads.decoder_thread_num)?;
        info!(workers = executor.worker_count(), "decode pool started");

        let bind_err = |source| ServiceError::Bind { addr, source };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(%local_addr, io_threads = threads.io_thread_num, "listener bound");

        Ok(Self {
            settings,
            engines,
            executor: Arc::new(executor),
            guard,
            listener,
            local_addr,
            registry: Arc::new(SessionRegistry::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        })
    }

    /// Bound address (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Coordinator that stops [`run`](Self::run) when fired.
    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    /// Engine pool handle.
    pub fn engines(&self) -> EnginePool {
        self.engines.clone()
    }

    /// Decode executor.
    pub fn executor(&self) -> Arc<DecodeExecutor> {
        Arc::clone(&self.executor)
    }

    /// Live sessions.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve until the shutdown coordinator fires, then shut down in order.
    ///
    /// Blocks the calling thread. With `io_thread_num == 1` all I/O runs on
    /// this thread.
    pub fn run(self) -> Result<ShutdownReport, ServiceError> {
        self.serve(false)
    }

    /// [`run`](Self::run), with SIGINT and SIGTERM wired to the coordinator.
    pub fn run_until_signal(self) -> Result<ShutdownReport, ServiceError> {
        self.serve(true)
    }

    fn serve(self, signals: bool) -> Result<ShutdownReport, ServiceError> {
        let Self {
            settings,
            engines,
            executor,
            guard,
            listener,
            local_addr: _,
            registry,
            shutdown,
            metrics,
            start_time,
        } = self;

        let runtime = io_runtime(settings.threads.io_thread_num).map_err(ServiceError::Runtime)?;
        let state = AppState {
            config: Arc::new(ServerConfig::from_settings(&settings)),
            queue: executor.queue(),
            engines,
            registry: Arc::clone(&registry),
            shutdown: Arc::clone(&shutdown),
            connections: Arc::new(AtomicUsize::new(0)),
            start_time,
            metrics,
        };

        let served = runtime.block_on(async {
            if signals {
                let _ = shutdown.listen_for_signals();
            }
            let listener = tokio::net::TcpListener::from_std(listener)?;
            let token = shutdown.token();

            let serve = async {
                let stop = token.clone();
                let result = axum::serve(listener, router(state))
                    .with_graceful_shutdown(async move { stop.cancelled().await })
                    .into_future()
                    .await;
                if let Err(e) = &result {
                    error!(error = %e, "server loop failed");
                    shutdown.shutdown();
                }
                result
            };
            let drain = async {
                token.cancelled().await;
                let sessions = registry.begin_drain_all();
                info!(sessions, "stopped accepting, draining sessions");
                registry.wait_empty().await;
                info!("all sessions closed");
            };

            let (served, ()) = tokio::join!(serve, drain);
            served
        });

        drop(guard);
        let report = executor.shutdown();
        info!(
            discarded = report.discarded,
            workers = report.workers_joined,
            "decode pool stopped"
        );
        runtime.shutdown_timeout(IO_SHUTDOWN_TIMEOUT);
        info!("I/O pool stopped");

        served.map_err(ServiceError::Runtime)?;
        Ok(report)
    }
}

/// The I/O pool: `threads` runtime workers, or the calling thread alone.
fn io_runtime(threads: usize) -> std::io::Result<Runtime> {
    if threads <= 1 {
        Builder::new_current_thread().enable_all().build()
    } else {
        Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("io")
            .enable_all()
            .build()
    }
}
