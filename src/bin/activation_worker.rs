//! Activation worker CLI
//!
//! Usage:
//!   activation_worker run                       # poll PENDING runs and listen for new connections
//!   activation_worker activate <RUN_ID>         # activate one run and print the outcome
//!   activation_worker connection-created <ID>   # re-activate runs waiting on a connection
//!
//! Configuration comes from flags or ACTIVATION_* environment variables
//! (a `.env` file is honoured). ACTIVATION_DATABASE_URL is required.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use uuid::Uuid;

use activation_core::notify::TracingProvisioningNotifier;
use activation_core::{ActivationService, ProvisioningNotifier};
use activation_postgres::{
    ensure_schema, PgActivationStore, PgNotifyProvisioningNotifier, CONNECTION_CREATED_CHANNEL,
};
use run_activation::{ActivationWorker, ConnectionListener, DatabaseArgs, WorkerArgs};

#[derive(Parser, Debug)]
#[command(name = "activation_worker")]
#[command(about = "Resolve integration connections and queue pending runs")]
struct Cli {
    #[command(flatten)]
    database: DatabaseArgs,

    /// Where provisioning requests for missing connections go
    #[arg(long, value_enum, default_value_t = NotifierKind::PgNotify)]
    notifier: NotifierKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the poller and connection listener until ctrl-c
    Run(WorkerArgs),
    /// Activate a single run
    Activate { run_id: Uuid },
    /// Re-activate runs waiting on a newly created connection
    ConnectionCreated { connection_id: Uuid },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum NotifierKind {
    /// Publish on the provisioning channel with pg_notify
    PgNotify,
    /// Log only
    Log,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,run_activation=debug,activation_core=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    let pool = PgPoolOptions::new()
        .max_connections(cli.database.max_connections)
        .connect(&cli.database.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Connected to database");

    if cli.database.ensure_schema {
        ensure_schema(&pool).await.context("failed to apply schema")?;
        tracing::info!("Schema applied");
    }

    let notifier: Arc<dyn ProvisioningNotifier> = match cli.notifier {
        NotifierKind::PgNotify => Arc::new(PgNotifyProvisioningNotifier::with_channel(
            pool.clone(),
            cli.database.provisioning_channel.clone(),
        )),
        NotifierKind::Log => Arc::new(TracingProvisioningNotifier),
    };
    let service = Arc::new(
        ActivationService::new(Arc::new(PgActivationStore::new(pool.clone())), notifier)
            .with_config(cli.database.activation_config()),
    );

    match cli.command {
        Command::Run(args) => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let listener = ConnectionListener::new(
                pool.clone(),
                Arc::clone(&service),
                CONNECTION_CREATED_CHANNEL,
            );
            let worker = ActivationWorker::new(Arc::clone(&service), args);

            let listener_rx = shutdown_rx.clone();
            let listener_task = tokio::spawn(async move { listener.run(listener_rx).await });
            let worker_task = tokio::spawn(async move { worker.run(shutdown_rx).await });

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);

            let (listener_result, worker_result) = tokio::join!(listener_task, worker_task);
            listener_result.context("connection listener panicked")?;
            worker_result.context("activation worker panicked")?;
        }
        Command::Activate { run_id } => {
            let outcome = service.activate(run_id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::ConnectionCreated { connection_id } => {
            let outcomes = service.connection_created_by_id(connection_id).await?;
            for (run_id, outcome) in outcomes {
                match outcome {
                    Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                    Err(e) => eprintln!("{run_id}: {e}"),
                }
            }
        }
    }

    Ok(())
}
