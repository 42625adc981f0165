#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use servecake::http::{FrontDoor, HttpReplicaChannel, ReplicaServer};
use servecake::router::{
    CallArgs,
    ChannelProbe,
    DeploymentConfig,
    DeploymentRegistry,
    DeploymentService,
    Dispatcher,
    DispatcherConfig,
    HealthCheckConfig,
    HealthChecker,
    LocalChannel,
    MethodRegistry,
    PolicyKind,
    Replica,
    ReplicaFailure,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args: Args = Args::parse();

    let (registry, replica_servers) =
        start_replicas(&args, LocalChannel::new(Echo::default())).await?;

    let mut config = DispatcherConfig::default();
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_default_deadline(Duration::from_millis(timeout_ms));
    }
    let dispatcher = Dispatcher::with_config(registry.clone(), config);

    let health_checker = HealthChecker::new(
        registry,
        ChannelProbe,
        HealthCheckConfig::default(),
    )
    .spawn();

    let front_door = FrontDoor::listen(args.listen_addr, dispatcher.clone()).await?;
    info!(
        listen_addr = %front_door.local_addr(),
        replicas = args.replicas,
        policy = %args.policy,
        remote = args.remote,
        "Echo cluster is ready."
    );

    tokio::signal::ctrl_c().await?;

    let stats = dispatcher.statistics();
    info!(
        dispatched = stats.num_dispatched(),
        succeeded = stats.num_succeeded(),
        timeouts = stats.num_timeouts(),
        not_found = stats.num_not_found(),
        no_replica = stats.num_no_replica(),
        replica_errors = stats.num_replica_errors(),
        abandoned = stats.num_abandoned(),
        "Shutting down."
    );

    front_door.shutdown();
    health_checker.kill();
    for server in replica_servers {
        server.shutdown();
    }

    Ok(())
}

/// Registers the echo deployment and starts its replicas.
///
/// The first replica serves `first_channel`, which also provides the
/// deployment's method table. Remote replicas each get their own replica server.
async fn start_replicas(
    args: &Args,
    first_channel: LocalChannel,
) -> Result<(DeploymentRegistry, Vec<ReplicaServer>)> {
    let registry = DeploymentRegistry::default();
    registry.register(
        DeploymentConfig::for_channel(&first_channel)
            .with_route_prefix(&args.route_prefix)
            .with_policy(args.policy),
    )?;

    let mut replica_servers = Vec::new();
    for i in 0..args.replicas {
        let replica_id = format!("echo-{i}");
        let channel = if i == 0 {
            first_channel.clone()
        } else {
            LocalChannel::new(Echo::default())
        };

        if args.remote {
            let server = ReplicaServer::listen(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
            server.add_channel(channel);
            let channel = HttpReplicaChannel::connect(server.local_addr(), Echo::deployment_name());
            registry.add_replica(Echo::deployment_name(), Replica::new(replica_id, channel))?;
            replica_servers.push(server);
        } else {
            registry.add_replica(Echo::deployment_name(), Replica::new(replica_id, channel))?;
        }
    }

    Ok((registry, replica_servers))
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1:8000")]
    /// The address for the front door to listen on.
    listen_addr: SocketAddr,

    #[arg(long, default_value = "/echo")]
    /// The route prefix the echo deployment is exposed under.
    route_prefix: String,

    #[arg(long, default_value_t = 2)]
    /// The number of echo replicas to start.
    replicas: usize,

    #[arg(long, default_value_t = PolicyKind::RoundRobin)]
    /// The load balancing policy, `round-robin` or `least-outstanding`.
    policy: PolicyKind,

    #[arg(long)]
    /// The default deadline of each call in milliseconds.
    timeout_ms: Option<u64>,

    #[arg(long)]
    /// Run every replica behind its own replica server rather than in process.
    remote: bool,
}

#[derive(Default)]
/// Replies with whatever it is given.
pub struct Echo {
    calls: AtomicU64,
}

impl DeploymentService for Echo {
    fn deployment_name() -> &'static str {
        "echo"
    }

    fn register_methods(registry: &mut MethodRegistry<Self>) {
        registry.add_method("call", |svc: Arc<Self>, args: CallArgs| async move {
            svc.calls.fetch_add(1, Ordering::Relaxed);
            Ok::<_, ReplicaFailure>(args.arg(0).cloned().unwrap_or(Value::Null))
        });
        registry.add_method("shout", |svc: Arc<Self>, args: CallArgs| async move {
            svc.calls.fetch_add(1, Ordering::Relaxed);
            match args.arg(0).and_then(Value::as_str) {
                Some(msg) => Ok(json!(msg.to_uppercase())),
                None => Err(ReplicaFailure::invalid_args("Expected a string to shout")),
            }
        });
        registry.add_method("stats", |svc: Arc<Self>, _args| async move {
            Ok::<_, ReplicaFailure>(json!({ "calls": svc.calls.load(Ordering::Relaxed) }))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn first_replica_serves_calls(args: Args) -> Result<()> {
        let first_channel = LocalChannel::new(Echo::default());
        let (registry, servers) = start_replicas(&args, first_channel.clone()).await?;

        let deployment = registry.resolve_by_name("echo")?;
        assert_eq!(deployment.replicas().len(), 1);
        assert_eq!(deployment.route_prefix(), Some("/echo"));

        let handle = Dispatcher::new(registry).async_handle();
        let value = handle.call("echo", "shout", CallArgs::positional(["hi"])).await?;
        assert_eq!(value, json!("HI"));

        let stats = first_channel.call_method("stats", CallArgs::default()).await?;
        assert_eq!(stats, json!({ "calls": 1 }));

        for server in servers {
            server.shutdown();
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_local_replica_uses_registered_channel() -> Result<()> {
        let args = Args::parse_from(["echo-cluster", "--replicas", "1"]);
        first_replica_serves_calls(args).await
    }

    #[tokio::test]
    async fn test_remote_replica_uses_registered_channel() -> Result<()> {
        let args = Args::parse_from(["echo-cluster", "--replicas", "1", "--remote"]);
        first_replica_serves_calls(args).await
    }
}
