//! Thin standalone binary wiring a TCP transport to the dispatcher
//! (`SPEC_FULL.md` §1): the minimum needed to demonstrate the engine
//! end-to-end. An embedder wanting real host objects reachable by name
//! links the library directly and supplies its own
//! [`pjrmi::supervisor::ConnectionHooks`]; this binary registers none,
//! so `INSTANCE_LOOKUP` never resolves a name and arrays/class injection
//! are refused. Mirrors the teacher's thin `server::run` wrapper around
//! its own accept loop in `main.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use pjrmi::{
    config::{DispatchMode, EngineConfig},
    dispatcher::{ArrayFactory, ClassInjector, Constructible, ConstructorRegistry, Invokable, InstanceLookup},
    error::EngineError,
    ids::TypeId,
    locks::LockManager,
    registry::TypeRegistry,
    supervisor::{ConnectionHooks, ConnectionSupervisor, Engine},
};
use tokio::sync::watch;
use tracing::info;

/// Command-line flags for the standalone demo binary (`SPEC_FULL.md`
/// §2: "the binary accepts a bind address and a handful of flags via
/// `clap` and nothing more").
#[derive(Parser, Debug)]
#[command(name = "pjrmi-server", about = "Standalone pjrmi engine demo server")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7890")]
    bind: String,

    /// Number of worker units in the free list. Omit for direct dispatch.
    #[arg(long)]
    worker_pool_size: Option<usize>,

    /// Disable the global lock held around value-plane message handling.
    #[arg(long)]
    no_global_lock: bool,

    /// Per-connection synchronous recursion depth limit.
    #[arg(long, default_value_t = pjrmi::config::DEFAULT_RECURSION_DEPTH_LIMIT)]
    recursion_depth_limit: u32,

    /// Enable the shared-memory argument/return side channel.
    #[arg(long)]
    shared_memory: bool,

    /// Server name advertised during the handshake.
    #[arg(long, default_value = "pjrmi-rs")]
    server_name: String,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            tokio::signal::ctrl_c().await.ok();
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// [`ConnectionHooks`] for the demo binary: no embedder-supplied
/// collaborators, so every hook is a stub that refuses the
/// corresponding request cleanly instead of panicking.
struct NoEmbedder;

struct NoLookup;
impl InstanceLookup for NoLookup {
    fn lookup(&self, _name: &str) -> Option<Arc<dyn Invokable>> { None }
}

struct NoArrays;
impl ArrayFactory for NoArrays {
    fn new_array(&self, element_type: TypeId, _length: u32) -> Result<Arc<dyn Invokable>, EngineError> {
        Err(EngineError::AccessDenied(format!(
            "standalone demo server does not support array allocation (element type {element_type})"
        )))
    }
}

struct NoConstructors;
impl ConstructorRegistry for NoConstructors {
    fn constructible(&self, _type_id: TypeId) -> Option<Arc<dyn Constructible>> { None }
}

impl ConnectionHooks for NoEmbedder {
    fn instance_lookup(&self) -> Arc<dyn InstanceLookup> { Arc::new(NoLookup) }
    fn array_factory(&self) -> Arc<dyn ArrayFactory> { Arc::new(NoArrays) }
    fn class_injector(&self) -> Option<Arc<dyn ClassInjector>> { None }
    fn constructor_registry(&self) -> Arc<dyn ConstructorRegistry> { Arc::new(NoConstructors) }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let addr: SocketAddr = cli.bind.parse()?;

    let config = EngineConfig {
        dispatch_mode: cli
            .worker_pool_size
            .map_or(DispatchMode::Direct, |size| DispatchMode::Pooled { worker_pool_size: size }),
        global_lock_enabled: !cli.no_global_lock,
        recursion_depth_limit: cli.recursion_depth_limit,
        shared_memory_enabled: cli.shared_memory,
        server_name: cli.server_name,
    };

    let engine = Arc::new(Engine {
        registry: Arc::new(TypeRegistry::new(|_| true)),
        locks: Arc::new(LockManager::new(config.global_lock_enabled)),
        config,
        hooks: Arc::new(NoEmbedder),
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "pjrmi server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(listener, engine);
    let run = supervisor.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        () = &mut run => {}
        () = shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            run.await;
        }
    }
    Ok(())
}
