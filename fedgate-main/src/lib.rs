//! The gateway lifecycle: wires the engine, cache, registry, pool, vfs, and
//! router together, runs them, and tears them down in order.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use fedgate_core::err::{Context, Result};
use fedgate_engine::DuckdbEngine;
use fedgate_logging::{error, info, trace, warn};
use fedgate_pool::SessionPool;
use fedgate_router::{QueryResult, QueryRouter};
use fedgate_transport::DefaultSessionFactory;
use fedgate_util_health::Health;
use fedgate_vfs::{cache::ResourceCache, registry::ResourceRegistry, Vfs};
use signal_hook::{
    consts::{SIGINT, SIGQUIT, SIGTERM},
    iterator::Signals,
};
use tokio::{runtime::Runtime, sync::broadcast};

pub mod args;
pub mod conf;

use args::Command;
use conf::*;

const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// This struct represents a running instance of the gateway and its
/// subsystems.
///
/// This is the entrypoint to build, start and manage the instance.
pub struct Gateway {
    /// The command used to start the instance
    command: Command,
    /// Running subsystems
    subsystems: Option<Subsystems>,
    /// Health status
    health: Health,
    /// Stops background health refreshes on terminate
    terminator: broadcast::Sender<()>,
    /// Whether the instance has been terminated
    term: Arc<AtomicBool>,
}

pub struct Subsystems {
    /// The tokio runtime
    runtime: Runtime,
    /// The analytical engine
    engine: Arc<DuckdbEngine>,
    /// The resource cache
    cache: ResourceCache,
    /// The resource registry
    registry: Arc<ResourceRegistry>,
    /// The session pool
    pool: SessionPool,
    /// The virtual filesystem
    vfs: Vfs,
    /// The query router
    router: QueryRouter,
}

impl Gateway {
    /// This is the entrypoint to booting the gateway
    pub fn main() {
        fedgate_logging::init_logging().unwrap();
        info!("Starting fedgate...");

        let cmd = Command::parse();

        if cmd.is_dump_config() {
            let path = Self::config_path(&cmd);
            if let Err(err) = dump_conf(&path) {
                error!("Failed to dump config: {:?}", err);
                std::process::exit(1);
            }
            return;
        }

        Self::start(cmd).unwrap().wait().unwrap()
    }

    fn config_path(command: &Command) -> PathBuf {
        command
            .args()
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Boots the gateway subsystems
    pub fn start(command: Command) -> Result<Self> {
        init_conf(&Self::config_path(&command))?;
        let conf = conf();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("fedgate-tokio-worker")
            .enable_all()
            .build()
            .context("Failed to create tokio runtime")?;

        info!("Starting analytical engine...");
        let engine = Arc::new(DuckdbEngine::new(&conf.engine)?);

        let (cache, registry, pool, vfs, router) = {
            // background tasks spawned by the constructors land on our runtime
            let _guard = runtime.enter();

            info!("Starting resource cache...");
            let cache = ResourceCache::new(conf.cache.clone())?;

            let registry = Arc::new(ResourceRegistry::new());

            info!("Starting session pool...");
            let pool = SessionPool::new(conf.pool.clone(), Arc::new(DefaultSessionFactory));

            let vfs = Vfs::new(
                conf.vfs.clone(),
                conf.providers.clone(),
                cache.clone(),
                Arc::clone(&registry),
                pool.clone(),
            );

            let router = QueryRouter::new(
                &conf.router,
                Arc::clone(&engine),
                Arc::clone(&registry),
                pool.clone(),
            )?;

            (cache, registry, pool, vfs, router)
        };

        if conf.vfs.auto_connect {
            for provider in &conf.providers {
                info!("Connecting to provider '{}'...", provider.id);
                if let Err(err) = runtime.block_on(vfs.connect_to_server(&provider.id)) {
                    warn!("Provider '{}' is not reachable yet: {:?}", provider.id, err);
                }
            }
        }

        let health = Health::new();
        let (terminator, _) = broadcast::channel(1);

        let instance = Self {
            command,
            subsystems: Some(Subsystems {
                runtime,
                engine,
                cache,
                registry,
                pool,
                vfs,
                router,
            }),
            health,
            terminator,
            term: Arc::new(AtomicBool::new(false)),
        };

        instance.spawn_health_refresh();
        instance.check_health();

        info!("Start up complete...");
        Ok(instance)
    }

    /// Gets the command used to start the instance
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Gets the running subsystems
    pub fn subsystems(&self) -> Option<&Subsystems> {
        self.subsystems.as_ref()
    }

    /// Gets the health state
    pub fn health(&self) -> &Health {
        &self.health
    }

    /// Runs a query through the router, blocking until it completes
    pub fn execute(&self, sql: &str) -> Result<QueryResult> {
        let subsystems = self
            .subsystems
            .as_ref()
            .context("Gateway is not running")?;

        subsystems
            .runtime
            .block_on(subsystems.router.execute_query(sql))
    }

    /// Preprocesses a query through the vfs, blocking until it completes
    pub fn process_query(&self, sql: &str) -> Result<String> {
        let subsystems = self
            .subsystems
            .as_ref()
            .context("Gateway is not running")?;

        subsystems
            .runtime
            .block_on(subsystems.vfs.process_query(sql))
    }

    /// Waits for the instance to terminate
    pub fn wait(mut self) -> Result<()> {
        let sig = Self::wait_for_signal()?;
        info!("Shutting down on signal {}", sig);

        self.terminate_mut()?;
        Ok(())
    }

    pub fn terminate(mut self) -> Result<()> {
        self.terminate_mut()
    }

    fn terminate_mut(&mut self) -> Result<()> {
        let subsystems = match self.subsystems.take() {
            Some(subsystems) => subsystems,
            None => return Ok(()),
        };

        self.term.store(true, Ordering::SeqCst);
        let _ = self.terminator.send(());

        info!("Terminating...");
        if let Err(err) = subsystems.runtime.block_on(subsystems.pool.close_all()) {
            warn!("Failed to close session pool: {:?}", err);
        }

        subsystems.cache.flush();

        subsystems
            .runtime
            .shutdown_timeout(Duration::from_secs(3));

        info!("Shutdown sequence complete");
        Ok(())
    }

    fn spawn_health_refresh(&self) {
        let subsystems = match &self.subsystems {
            Some(subsystems) => subsystems,
            None => return,
        };

        let health = self.health.clone();
        let engine = Arc::clone(&subsystems.engine);
        let pool = subsystems.pool.clone();
        let mut term = self.terminator.subscribe();

        subsystems.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(HEALTH_REFRESH_INTERVAL) => {}
                    _ = term.recv() => return,
                }

                trace!("Updating system health status");
                let _ = health.update("Engine", engine.healthy());
                let stats = pool.stats().await;
                let _ = health.update("Pool", stats.unhealthy_connections == 0);
            }
        });
    }

    /// Updates the health of each subsystem
    fn check_health(&self) {
        if let Some(ref subsystems) = self.subsystems {
            trace!("Updating system health status");

            let _ = self.health.update("Engine", subsystems.engine.healthy());
            let _ = self
                .health
                .update("Cache", subsystems.cache.stats().max_size > 0);

            let stats = subsystems.runtime.block_on(subsystems.pool.stats());
            let _ = self
                .health
                .update("Pool", stats.unhealthy_connections == 0);
        }
    }

    fn wait_for_signal() -> Result<i32> {
        let mut sigs = Signals::new([SIGINT, SIGQUIT, SIGTERM])
            .context("Failed to attach signal handler")?;
        let sig = sigs.forever().next().unwrap();

        info!(
            "Received {}",
            match sig {
                SIGINT => "SIGINT",
                SIGQUIT => "SIGQUIT",
                SIGTERM => "SIGTERM",
                _ => "unknown signal",
            }
        );

        Ok(sig)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Err(err) = self.terminate_mut() {
            warn!("Error occurred while shutting down: {:?}", err);
        }
    }
}

impl Subsystems {
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn engine(&self) -> &Arc<DuckdbEngine> {
        &self.engine
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }
}
