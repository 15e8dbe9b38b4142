use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionBackend, LocalExecutor, RemoteBatchBackend};
use crate::config::{BackendMode, SchedulerConfig};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::monitor::StatusMonitor;
use crate::scheduler::{JobSubmitter, RequestBuilder, ScriptRequestBuilder};
use crate::store::JobStore;

/// Long-running scheduler process: submitter, backend and status monitor
/// sharing one store.
pub struct Node {
    config: SchedulerConfig,
    store: JobStore,
    backend: Arc<dyn ExecutionBackend>,
    builder: Arc<dyn RequestBuilder>,
    /// Control loop of the local executor, if that backend is in use
    backend_task: Option<JoinHandle<()>>,
}

impl Node {
    /// Open the store and construct the configured backend.
    pub async fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let store =
            JobStore::connect(&config.database.url, config.database.max_connections).await?;
        store.migrate().await?;

        let (backend, backend_task) = match config.backend.mode {
            BackendMode::Local => {
                let executor = LocalExecutor::with_poll_interval(
                    config.local.max_workers,
                    Duration::from_millis(config.local.poll_interval_ms),
                )
                .with_store(store.clone(), config.jobs.job_name_prefix.clone());
                let task = executor.start();
                let backend: Arc<dyn ExecutionBackend> = Arc::new(executor);
                (backend, Some(task))
            }
            BackendMode::Batch => {
                let backend: Arc<dyn ExecutionBackend> = Arc::new(RemoteBatchBackend::new(
                    config.batch.clone(),
                    config.jobs.job_name_prefix.clone(),
                ));
                (backend, None)
            }
        };

        let builder = Arc::new(ScriptRequestBuilder::new(config.jobs.clone()));
        Ok(Self {
            config,
            store,
            backend,
            builder,
            backend_task,
        })
    }

    /// Assemble a node from existing parts.
    pub fn with_parts(
        config: SchedulerConfig,
        store: JobStore,
        backend: Arc<dyn ExecutionBackend>,
        builder: Arc<dyn RequestBuilder>,
    ) -> Self {
        Self {
            config,
            store,
            backend,
            builder,
            backend_task: None,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Bind the status monitor port and run until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.submitter.port));
        let listener = TcpListener::bind(addr).await?;
        let store = self.store.clone();
        self.serve(listener, shutdown).await?;
        store.close().await;
        Ok(())
    }

    /// Run every component until `shutdown` fires, then stop them in order:
    /// 1. the submitter finishes its current cycle,
    /// 2. the backend kills or cancels its jobs and resets them to `created`,
    /// 3. the status monitor and the dashboard stop listening.
    ///
    /// The monitor outlives the sweep so reports from jobs dying during it
    /// are still acknowledged.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let listeners_cancel = CancellationToken::new();

        let monitor = StatusMonitor::new(
            listener.local_addr()?,
            self.store.clone(),
            self.config.monitor.retry_policy(),
        );
        let monitor_cancel = listeners_cancel.clone();
        let monitor_task = tokio::spawn(async move {
            if let Err(e) = monitor.serve(listener, monitor_cancel).await {
                tracing::error!(error = %e, "Status monitor failed");
            }
        });

        let dashboard_task = self.config.dashboard_port.map(|port| {
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let state = DashboardState {
                store: self.store.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, listeners_cancel.clone()))
        });

        tracing::info!(
            backend = self.backend.name(),
            database = %self.config.database.url,
            dashboard_port = ?self.config.dashboard_port,
            "Starting scheduler node"
        );

        let submitter = JobSubmitter::new(
            self.store.clone(),
            self.backend.clone(),
            self.builder.clone(),
            self.config.submitter.clone(),
        );
        submitter.run(shutdown).await;

        let sweep = self
            .backend
            .terminate(&self.store, &self.config.jobs.job_name_prefix)
            .await;
        if sweep.errors > 0 {
            tracing::warn!(errors = sweep.errors, "Backend shutdown sweep had errors");
        }
        if let Some(task) = self.backend_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Executor task panicked");
            }
        }

        listeners_cancel.cancel();
        if let Err(e) = monitor_task.await {
            tracing::error!(error = %e, "Status monitor task panicked");
        }
        if let Some(task) = dashboard_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Dashboard task panicked");
            }
        }

        tracing::info!("Scheduler node stopped");
        Ok(())
    }
}
