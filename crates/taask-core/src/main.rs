//! # taask-chaos - load and correctness driver
//!
//! Spins up an in-process authority (optionally paired with a partner),
//! submits N concurrent `add` tasks through the full envelope and handshake
//! path, and checks every answer.
//!
//! ```text
//! N clients ──▶ cluster-a ══partner stream══▶ cluster-b
//! ```

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use taask_common::constants::DEFAULT_PARTNER_PORT;
use taask_common::constants::groups::{ADMIN_GROUP_UUID, PARTNER_GROUP_NAME, PARTNER_GROUP_UUID};
use taask_common::{Service, ServiceType, TaskStatus};
use taask_core::auth::generate_member_group;
use taask_core::client::{Client, TaskSpec};
use taask_core::cluster::{ADD_KIND, AddOutput, LocalCluster};
use taask_core::config::{CoreConfig, LocalAuthConfig};
use taask_core::envelope::TaskKeyCache;
use taask_core::transport::LocalConnector;

/// Taask chaos - concurrent task driver
#[derive(Parser, Debug)]
#[command(name = "taask-chaos")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Core configuration file path
    #[arg(short, long, env = "TAASK_CONFIG")]
    config: Option<String>,

    /// Number of concurrent tasks to submit
    #[arg(short = 'n', long, default_value = "100")]
    tasks: usize,

    /// Seconds to wait for each result
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Replicate to a partner cluster and check it converges
    #[arg(long, default_value = "false")]
    partner: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[derive(Debug)]
enum Outcome {
    Correct,
    Wrong { expected: i64, got: i64 },
    Failed(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs)?;

    info!("🌀 Starting taask-chaos v{}", env!("CARGO_PKG_VERSION"));

    let core = CoreConfig::load(args.config.as_deref()).context("Failed to load core config")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let cluster = LocalCluster::new("cluster-a", core.clone());
    let replica = if args.partner {
        Some(start_partner_pair(&cluster, &core, &shutdown_tx).await?)
    } else {
        None
    };

    let passphrase = taask_core::auth::generate_join_code();
    let admin_group = generate_member_group("admin", ADMIN_GROUP_UUID, &passphrase);
    cluster.add_group(admin_group.clone()).await;
    let auth_config = LocalAuthConfig::new(admin_group, &passphrase, None);

    let client = Arc::new(
        Client::connect(cluster.clone(), &auth_config, TaskKeyCache::new(), core.poll_interval())
            .await
            .context("Failed to authenticate chaos client")?,
    );

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    let operands: Vec<(i64, i64)> = {
        let mut rng = rand::rng();
        (0..args.tasks)
            .map(|_| (rng.random_range(-10_000..10_000), rng.random_range(-10_000..10_000)))
            .collect()
    };

    info!(tasks = args.tasks, "🚀 Submitting tasks");
    let started = Instant::now();
    let deadline = Duration::from_secs(args.timeout_secs);

    let handles: Vec<_> = operands
        .into_iter()
        .map(|(first, second)| {
            let client = client.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { run_one(&client, first, second, deadline, shutdown).await })
        })
        .collect();

    let (mut correct, mut wrong, mut failed) = (0usize, 0usize, 0usize);
    for handle in futures::future::join_all(handles).await {
        match handle.context("Task driver panicked")? {
            (_, Outcome::Correct) => correct += 1,
            (uuid, Outcome::Wrong { expected, got }) => {
                warn!(task = ?uuid, expected, got, "Wrong answer");
                wrong += 1;
            }
            (uuid, Outcome::Failed(reason)) => {
                warn!(task = ?uuid, reason = %reason, "Task did not complete");
                failed += 1;
            }
        }
    }

    info!(
        correct,
        wrong,
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "📊 Run complete"
    );

    if let Some(replica) = replica {
        check_convergence(&cluster, &replica, &core).await?;
    }

    let _ = shutdown_tx.send(());

    if wrong > 0 || failed > 0 {
        bail!("{} wrong and {} failed out of {} tasks", wrong, failed, args.tasks);
    }

    info!("👋 taask-chaos finished");
    Ok(())
}

async fn run_one(
    client: &Client,
    first: i64,
    second: i64,
    deadline: Duration,
    shutdown: broadcast::Receiver<()>,
) -> (Option<String>, Outcome) {
    let spec = TaskSpec::new(ADD_KIND, json!({ "First": first, "Second": second }));

    let uuid = match client.send_task(spec).await {
        Ok(uuid) => uuid,
        Err(e) => return (None, Outcome::Failed(e.to_string())),
    };

    let outcome = match client.wait_for_result(&uuid, deadline, Some(shutdown)).await {
        Ok(bytes) => match serde_json::from_slice::<AddOutput>(&bytes) {
            Ok(output) if output.answer == first + second => Outcome::Correct,
            Ok(output) => Outcome::Wrong {
                expected: first + second,
                got: output.answer,
            },
            Err(e) => Outcome::Failed(format!("unreadable result: {}", e)),
        },
        Err(e) => Outcome::Failed(e.to_string()),
    };

    (Some(uuid), outcome)
}

/// Start a second cluster and have `cluster` replicate to it
async fn start_partner_pair(
    cluster: &Arc<LocalCluster>,
    core: &CoreConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Arc<LocalCluster>> {
    let passphrase = taask_core::auth::generate_join_code();
    let group = generate_member_group(PARTNER_GROUP_NAME, PARTNER_GROUP_UUID, &passphrase);
    let connector = Arc::new(LocalConnector::new());

    let replica = LocalCluster::new("cluster-b", core.clone());
    replica
        .attach_partner(
            LocalAuthConfig::new(
                group.clone(),
                &passphrase,
                Some(Service::new(ServiceType::Partner, "cluster-a")),
            ),
            connector.clone(),
        )
        .await
        .context("Failed to configure partner on cluster-b")?;
    connector.register("cluster-b", DEFAULT_PARTNER_PORT, replica.clone());

    let manager = cluster
        .attach_partner(
            LocalAuthConfig::new(
                group,
                &passphrase,
                Some(Service::new(ServiceType::Partner, "cluster-b")),
            ),
            connector,
        )
        .await
        .context("Failed to configure partner on cluster-a")?;

    let shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { manager.start_outgoing_manager(shutdown).await });

    info!("🤝 Partner pair started");
    Ok(replica)
}

/// Wait for the replica to hold every completed task at the origin's version
async fn check_convergence(
    origin: &LocalCluster,
    replica: &LocalCluster,
    core: &CoreConfig,
) -> Result<()> {
    let wait = core.flush_interval() * 2 + Duration::from_secs(1);
    let started = Instant::now();
    let uuids = origin.store().uuids_with_status(TaskStatus::Completed).await;

    loop {
        let mut behind = 0usize;
        for uuid in &uuids {
            let expected = origin.store().get(uuid).await.map(|t| t.version());
            let actual = replica.store().get(uuid).await.map(|t| t.version());
            if expected != actual {
                behind += 1;
            }
        }

        if behind == 0 {
            info!(tasks = uuids.len(), "✅ Partner converged");
            return Ok(());
        }
        if started.elapsed() > wait {
            bail!("partner still behind on {} of {} tasks", behind, uuids.len());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
