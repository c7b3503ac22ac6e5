//! Command handlers and production wiring

use anyhow::{bail, Context};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::baseline::{BaselineRunner, QcPolicy};
use crate::catalog::{Ident, ShardName, Year};
use crate::config::Config;
use crate::db::Databases;
use crate::export::OgrTippecanoe;
use crate::geometry::PostgisOps;
use crate::pipeline::{Pipeline, Services};
use crate::prober::StatvfsDisk;
use crate::status::StatusReport;
use crate::storage::{ObjectKeys, S3ObjectStore};
use crate::store::{BaselineColumns, PgBaselineStore, PgCoordination, PgShardSource};
use crate::sweep::Sweeper;
use crate::tools::{ProcessRunner, ToolRunner};
use crate::Commands;

/// PostgreSQL, S3 and local processes behind every seam
pub async fn connect(config: &Config) -> anyhow::Result<Services> {
    let databases = Databases::new(config.database.clone());
    let pool = databases
        .coordination()
        .await
        .context("Coordination database unavailable")?;

    let coordination = Arc::new(PgCoordination::new(
        pool.clone(),
        config.coordination_schema()?,
        config.theme_tables()?,
        Ident::new(config.pipeline.geometry_column.clone())?,
    ));
    let tools: Arc<dyn ToolRunner> = Arc::new(ProcessRunner);

    Ok(Services {
        shards: Arc::new(PgShardSource::new(databases)),
        coordination: coordination.clone(),
        target: coordination.clone(),
        progress: coordination,
        geometry: Arc::new(PostgisOps::new(pool)),
        objects: Arc::new(S3ObjectStore::new(config.storage.clone())),
        writer: Arc::new(OgrTippecanoe::new(tools.clone(), &config.tools, &config.pipeline)),
        tools,
        disk: Arc::new(StatvfsDisk),
    })
}

pub async fn execute(command: &Commands, config: Config) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            run_id,
            year,
            sweep_from,
        } => run(config, run_id, *year, *sweep_from).await,
        Commands::Sweep { from, to, force } => sweep(config, *from, *to, *force).await,
        Commands::Status { year } => status(config, *year).await,
        Commands::Baseline { run_id, year, shards } => baseline(config, run_id, *year, shards).await,
    }
}

async fn run(config: Config, run_id: &str, year: Year, sweep_from: Option<Year>) -> anyhow::Result<()> {
    let services = connect(&config).await?;
    let pipeline = Pipeline::new(config.clone(), services.clone())?;

    let summary = pipeline.run(run_id, year).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(from) = sweep_from {
        let Ok(to) = Year::new(year.value() - 1) else {
            return Ok(());
        };
        if from > to {
            warn!(from = %from, year = %year, "Nothing to sweep before the run year");
            return Ok(());
        }
        // the run already succeeded; a sweep problem is only reported
        match Sweeper::new(&config, &services)?.sweep(from, to, false).await {
            Ok(report) => {
                info!(regenerated = report.regenerated(), failed = report.failed(), "Post-run sweep finished");
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => error!(error = %format!("{:#}", e), "Post-run sweep failed"),
        }
    }

    Ok(())
}

async fn sweep(config: Config, from: Year, to: Year, force: bool) -> anyhow::Result<()> {
    let services = connect(&config).await?;
    let report = Sweeper::new(&config, &services)?.sweep(from, to, force).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed() > 0 {
        bail!("{} sweep item(s) failed", report.failed());
    }
    Ok(())
}

async fn status(config: Config, year: Year) -> anyhow::Result<()> {
    let store = S3ObjectStore::new(config.storage.clone());
    let keys = ObjectKeys::new(config.storage.key_prefix.clone());
    let tables = config.theme_tables()?;

    let report = StatusReport::collect(&store, &keys, &tables, &config.pipeline.artifact_prefix, year).await?;
    print!("{}", report);
    Ok(())
}

async fn baseline(config: Config, run_id: &str, year: Year, only: &[ShardName]) -> anyhow::Result<()> {
    let catalog = if only.is_empty() {
        config.catalog()?
    } else {
        config.catalog()?.only(only)?
    };

    let databases = Databases::new(config.database.clone());
    let pool = databases
        .coordination()
        .await
        .context("Coordination database unavailable")?;
    let tables = config.theme_tables()?;

    let progress = PgCoordination::new(
        pool.clone(),
        config.coordination_schema()?,
        tables.clone(),
        Ident::new(config.pipeline.geometry_column.clone())?,
    );
    let store = PgBaselineStore::new(
        databases,
        pool,
        config.coordination_schema()?,
        config.shard_schema()?,
        tables,
        BaselineColumns {
            geometry: Ident::new(config.pipeline.geometry_column.clone())?,
            region: Ident::new(config.pipeline.region_column.clone())?,
            status: Ident::new(config.qc.status_column.clone())?,
        },
    );

    let runner = BaselineRunner::new(&store, &progress, QcPolicy::from_config(&config.qc));
    let (report, _) = runner.run(run_id, year, catalog.shards()).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
