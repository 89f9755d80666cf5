//! `stockpro-sync`: run the offline sync engine outside the UI.
//!
//! ```text
//! stockpro-sync [--json-logs] [once|watch|status]
//! ```

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use stockpro_core::EntityKind;
use stockpro_offline::{
    ConnectivityMonitor, LocalCache, RemoteService, RestRemoteService, SqliteCacheStore,
    SyncConfig, SyncEngine, SyncWorker,
};

#[derive(Debug, Parser)]
#[command(
    name = "stockpro-sync",
    version,
    about = "Sync the StockPro offline cache with the backend"
)]
struct Cli {
    /// Emit JSON logs even on a terminal
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Drain the queue and refresh the cache, then exit (default)
    Once,
    /// Run the background worker until Ctrl-C
    Watch,
    /// Print queue and cache state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs || !std::io::stderr().is_terminal() {
        stockpro_observability::init();
    } else {
        stockpro_observability::init_pretty();
    }

    let config = SyncConfig::from_env();
    let engine = Arc::new(build_engine(&config).await?);

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Once => once(&engine).await,
        Commands::Watch => watch(engine).await,
        Commands::Status => status(&engine).await,
    }
}

async fn build_engine(config: &SyncConfig) -> anyhow::Result<SyncEngine> {
    let db_url = config
        .resolved_cache_db_url()
        .context("failed to resolve cache database location")?;
    tracing::info!(%db_url, api_url = %config.api_url, "starting stockpro-sync");

    let cache = LocalCache::new(SqliteCacheStore::new(db_url));
    let remote: Arc<dyn RemoteService> = Arc::new(
        RestRemoteService::from_config(config).context("failed to build remote client")?,
    );

    let online = remote.ping().await.is_ok();
    if !online {
        tracing::warn!("backend unreachable, starting offline");
    }
    Ok(SyncEngine::new(
        cache,
        remote,
        ConnectivityMonitor::new(online),
        config.clone(),
    ))
}

async fn once(engine: &SyncEngine) -> anyhow::Result<()> {
    if !engine.cache().is_available().await {
        anyhow::bail!("local cache is unavailable");
    }
    let report = engine.full_sync().await.context("sync failed")?;
    println!(
        "synced {} mutation(s), {} failed, {} deferred; refreshed {} record(s)",
        report.drain.synced_mutations,
        report.drain.failed_mutations,
        report.drain.deferred_mutations,
        report.refresh.total()
    );
    for failure in &report.drain.errors {
        println!(
            "  {} {} {}: {}",
            failure.mutation_id, failure.operation, failure.entity_kind, failure.message
        );
    }
    for (kind, error) in &report.refresh.errors {
        println!("  {kind}: refresh failed: {error}");
    }
    Ok(())
}

async fn watch(engine: Arc<SyncEngine>) -> anyhow::Result<()> {
    let poll_interval = engine.config().sync_interval;
    engine
        .connectivity()
        .init_listeners(engine.remote().clone(), poll_interval);

    let worker = SyncWorker::new(engine.clone()).start();
    worker.sync_now();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");

    worker.shutdown().await;
    engine.connectivity().teardown().await;
    Ok(())
}

async fn status(engine: &SyncEngine) -> anyhow::Result<()> {
    let pending = engine
        .pending_mutations_count()
        .await
        .context("failed to read mutation queue")?;
    let failed = engine.failed_mutations().await?;

    println!(
        "connectivity: {}",
        if engine.connectivity().is_online() { "online" } else { "offline" }
    );
    println!("pending mutations: {pending}");
    println!("needing attention: {}", failed.len());
    for m in &failed {
        println!(
            "  {} {} {} {} (retries: {}): {}",
            m.id,
            m.operation,
            m.entity_kind,
            m.target_id,
            m.retry_count,
            m.last_error.as_deref().unwrap_or("-")
        );
    }

    println!("collections:");
    for kind in EntityKind::ALL {
        match engine.cache().sync_meta(kind).await? {
            Some(meta) => println!(
                "  {:<22} {} at {} ({} records)",
                kind.table_name(),
                meta.last_result,
                meta.last_synced_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string()),
                meta.synced_count
            ),
            None => println!("  {:<22} never synced", kind.table_name()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from(["stockpro-sync", "status"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Status));
        assert!(!cli.json_logs);

        let cli = Cli::try_parse_from(["stockpro-sync", "watch", "--json-logs"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Watch));
        assert!(cli.json_logs);

        let cli = Cli::try_parse_from(["stockpro-sync"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn unknown_input_is_rejected() {
        assert!(Cli::try_parse_from(["stockpro-sync", "sync"]).is_err());
        assert!(Cli::try_parse_from(["stockpro-sync", "once", "junk"]).is_err());

        let help = Cli::try_parse_from(["stockpro-sync", "--help"]).unwrap_err();
        assert_eq!(help.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
