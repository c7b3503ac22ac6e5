//! Baseline ratchet
//!
//! Geometries whose QC status passes are carried into per-shard and central
//! baseline tables. The tables only ever grow, and a `(geometry, region)`
//! pair is never inserted twice.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::catalog::{ShardName, Theme, Year};
use crate::config::QcConfig;
use crate::controller::{Controller, ProgressStore, RunState};
use crate::error::Result;
use crate::geometry::Wkb;

/// Which QC statuses let a record into the baseline.
///
/// A status is a JSON list of `{title, value}` items. Every item whose title
/// does not contain the ignored substring must carry a passing value. Items
/// that are not objects are skipped. Non-list and empty statuses fail.
#[derive(Debug, Clone)]
pub struct QcPolicy {
    passing: HashSet<String>,
    ignored_title: String,
}

impl QcPolicy {
    pub fn new(passing: impl IntoIterator<Item = String>, ignored_title: impl Into<String>) -> Self {
        Self {
            passing: passing.into_iter().collect(),
            ignored_title: ignored_title.into().to_lowercase(),
        }
    }

    pub fn from_config(config: &QcConfig) -> Self {
        Self::new(config.passing_values.iter().cloned(), config.ignored_title_substring.clone())
    }

    pub fn accepts(&self, status: &Value) -> bool {
        let Some(items) = status.as_array() else {
            return false;
        };
        if items.is_empty() {
            return false;
        }

        items.iter().filter_map(Value::as_object).all(|item| {
            let title = item.get("title").and_then(Value::as_str).unwrap_or("");
            if !self.ignored_title.is_empty() && title.to_lowercase().contains(&self.ignored_title) {
                return true;
            }
            match item.get("value") {
                Some(Value::String(value)) => self.passing.contains(value),
                Some(Value::Bool(value)) => self.passing.contains(&value.to_string()),
                _ => false,
            }
        })
    }
}

/// Latest QC row for one distinct geometry
#[derive(Debug, Clone)]
pub struct QcRecord {
    pub geometry: Wkb,
    pub status: Value,
}

#[async_trait]
pub trait BaselineStore: Send + Sync {
    /// Central baseline tables for both themes
    async fn prepare_central(&self, year: Year) -> Result<()>;

    async fn open_shard(&self, shard: &ShardName) -> Result<Box<dyn ShardBaseline>>;

    /// Insert into the central table, skipping geometries already present
    /// for `region`. Returns the inserted count.
    async fn insert_central(&self, theme: Theme, year: Year, region: &ShardName, geometries: &[Wkb]) -> Result<u64>;
}

#[async_trait]
pub trait ShardBaseline: Send {
    async fn qc_table_exists(&mut self, theme: Theme, year: Year) -> Result<bool>;

    async fn qc_records(&mut self, theme: Theme, year: Year) -> Result<Vec<QcRecord>>;

    async fn prepare_baseline(&mut self, theme: Theme, year: Year) -> Result<()>;

    async fn insert_baseline(&mut self, theme: Theme, year: Year, region: &ShardName, geometries: &[Wkb]) -> Result<u64>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BaselineReport {
    pub shards_processed: usize,
    pub shards_skipped: Vec<ShardName>,
    pub accepted: u64,
    pub inserted_shard: u64,
    pub inserted_central: u64,
}

#[derive(Debug, Default)]
struct ThemeCounts {
    accepted: u64,
    inserted_shard: u64,
    inserted_central: u64,
}

pub struct BaselineRunner<'a> {
    store: &'a dyn BaselineStore,
    progress: &'a dyn ProgressStore,
    policy: QcPolicy,
}

impl<'a> BaselineRunner<'a> {
    pub fn new(store: &'a dyn BaselineStore, progress: &'a dyn ProgressStore, policy: QcPolicy) -> Self {
        Self {
            store,
            progress,
            policy,
        }
    }

    /// Progress after `done` of `total` shards
    pub fn shard_percentage(done: usize, total: usize) -> u8 {
        if total == 0 {
            return 95;
        }
        (10 + (done.min(total) * 85) / total) as u8
    }

    #[instrument(skip(self, shards), fields(shards = shards.len()))]
    pub async fn run(&self, run_id: &str, year: Year, shards: &[ShardName]) -> anyhow::Result<(BaselineReport, RunState)> {
        let mut controller = Controller::new(self.progress, run_id, year);
        controller.report(5).await?;

        if let Err(e) = self.store.prepare_central(year).await {
            return Err(controller.abort(e.into()).await);
        }
        controller.report(10).await?;

        let mut report = BaselineReport::default();
        for (index, shard) in shards.iter().enumerate() {
            match self.process_shard(shard, year).await {
                Ok(Some(counts)) => {
                    report.shards_processed += 1;
                    report.accepted += counts.accepted;
                    report.inserted_shard += counts.inserted_shard;
                    report.inserted_central += counts.inserted_central;
                }
                Ok(None) => report.shards_skipped.push(shard.clone()),
                Err(e) => {
                    warn!(shard = %shard, error = %e, "Shard baseline failed, skipping");
                    report.shards_skipped.push(shard.clone());
                }
            }
            controller
                .report(Self::shard_percentage(index + 1, shards.len()))
                .await?;
        }

        info!(
            processed = report.shards_processed,
            skipped = report.shards_skipped.len(),
            accepted = report.accepted,
            inserted_shard = report.inserted_shard,
            inserted_central = report.inserted_central,
            "Baseline summary"
        );
        controller.report(95).await?;
        let state = controller.complete().await?;

        Ok((report, state))
    }

    /// `None` when the shard has no QC tables for the year
    async fn process_shard(&self, shard: &ShardName, year: Year) -> Result<Option<ThemeCounts>> {
        let mut session = self.store.open_shard(shard).await?;
        let mut totals = ThemeCounts::default();
        let mut any_table = false;

        for theme in Theme::ALL {
            match session.qc_table_exists(theme, year).await {
                Ok(true) => any_table = true,
                Ok(false) => continue,
                Err(e) => {
                    warn!(shard = %shard, theme = %theme, error = %e, "QC table check failed");
                    continue;
                }
            }

            match self.process_theme(session.as_mut(), shard, theme, year).await {
                Ok(counts) => {
                    totals.accepted += counts.accepted;
                    totals.inserted_shard += counts.inserted_shard;
                    totals.inserted_central += counts.inserted_central;
                }
                Err(e) => warn!(shard = %shard, theme = %theme, error = %e, "Theme baseline failed"),
            }
        }

        if let Err(e) = session.close().await {
            warn!(shard = %shard, error = %e, "Failed to close shard session");
        }

        if !any_table {
            warn!(shard = %shard, year = %year, "No QC tables, skipping");
            return Ok(None);
        }
        Ok(Some(totals))
    }

    async fn process_theme(
        &self,
        session: &mut dyn ShardBaseline,
        shard: &ShardName,
        theme: Theme,
        year: Year,
    ) -> Result<ThemeCounts> {
        session.prepare_baseline(theme, year).await?;

        let records = session.qc_records(theme, year).await?;
        let total = records.len();
        let accepted: Vec<Wkb> = records
            .into_iter()
            .filter(|r| self.policy.accepts(&r.status))
            .map(|r| r.geometry)
            .collect();

        info!(shard = %shard, theme = %theme, records = total, accepted = accepted.len(), "QC records filtered");
        if accepted.is_empty() {
            return Ok(ThemeCounts::default());
        }

        let inserted_shard = session.insert_baseline(theme, year, shard, &accepted).await?;
        let inserted_central = self.store.insert_central(theme, year, shard, &accepted).await?;

        Ok(ThemeCounts {
            accepted: accepted.len() as u64,
            inserted_shard,
            inserted_central,
        })
    }
}
