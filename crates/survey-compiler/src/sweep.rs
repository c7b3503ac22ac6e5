//! Maintenance sweep over prior years
//!
//! Older years may only have a tile archive in the object store. For those,
//! the features are recovered from the archive through the tile fallback
//! chain, repaired, and published as shapefile and geodatabase archives.
//! Every year/theme is independent: a failure is recorded and the sweep
//! moves on. Re-running a sweep only touches what is still missing.

use anyhow::{bail, Context};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::catalog::{Theme, ThemeTables, Year};
use crate::config::Config;
use crate::export::geojson::{read_features, write_feature_collection};
use crate::export::{tile_chain, ArtifactKind, ArtifactNames, PublishedArtifact, Publisher};
use crate::geometry::repair::to_multi;
use crate::geometry::{RepairEngine, RepairItem};
use crate::pipeline::{scratch_dir, Services};
use crate::storage::ObjectKeys;
use crate::store::DatasetRecord;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    Regenerated { features: u64, artifacts: Vec<String> },
    UpToDate,
    NoTiles,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepItem {
    pub year: Year,
    pub theme: Theme,
    pub outcome: SweepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub items: Vec<SweepItem>,
}

impl SweepReport {
    pub fn regenerated(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, SweepOutcome::Regenerated { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, SweepOutcome::Failed { .. }))
            .count()
    }
}

pub struct Sweeper<'a> {
    config: &'a Config,
    services: &'a Services,
    tables: ThemeTables,
    keys: ObjectKeys,
}

impl<'a> Sweeper<'a> {
    pub fn new(config: &'a Config, services: &'a Services) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            services,
            tables: config.theme_tables()?,
            keys: ObjectKeys::new(config.storage.key_prefix.clone()),
        })
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self, from: Year, to: Year, force: bool) -> anyhow::Result<SweepReport> {
        if from > to {
            bail!("sweep range is empty: {} > {}", from, to);
        }
        let scratch = scratch_dir(&self.config.pipeline)?;

        let mut report = SweepReport::default();
        for year in Year::range(from, to) {
            for theme in Theme::ALL {
                let outcome = match self.sweep_one(year, theme, force, scratch.path()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(year = %year, theme = %theme, error = %format!("{:#}", e), "Sweep item failed");
                        SweepOutcome::Failed {
                            error: format!("{:#}", e),
                        }
                    }
                };
                info!(year = %year, theme = %theme, outcome = ?outcome, "Sweep item done");
                report.items.push(SweepItem { year, theme, outcome });
            }
        }

        info!(
            items = report.items.len(),
            regenerated = report.regenerated(),
            failed = report.failed(),
            "Sweep finished"
        );
        Ok(report)
    }

    async fn sweep_one(&self, year: Year, theme: Theme, force: bool, scratch: &Path) -> anyhow::Result<SweepOutcome> {
        let store = &*self.services.objects;
        let label = self.tables.label(theme);
        let names = ArtifactNames::new(&self.config.pipeline.artifact_prefix, &label, year);

        let tiles_key = self.keys.tiles(&label, year);
        if !store.exists(&tiles_key).await? {
            return Ok(SweepOutcome::NoTiles);
        }

        let shp_key = self.keys.result(year, &names.shapefile_zip());
        let gdb_key = self.keys.result(year, &names.gdb_zip());
        let want_shp = force || !store.exists(&shp_key).await?;
        let want_gdb = force || !store.exists(&gdb_key).await?;
        if !want_shp && !want_gdb {
            return Ok(SweepOutcome::UpToDate);
        }

        let work = tempfile::tempdir_in(scratch)?;
        let archive = work.path().join(format!("{}{}.pmtiles", label, year));
        store
            .get_to_file(&tiles_key, &archive)
            .await
            .with_context(|| format!("Failed to download {}", tiles_key))?;

        let chain = tile_chain(
            self.services.tools.clone(),
            &self.config.tools,
            self.config.pipeline.max_zoom,
            &self.config.pipeline.likely_layer_names,
        );
        let decoded = work.path().join(format!("{}.decoded.geojson", names.base));
        if let Some(accepted) = chain.run_or_empty(&archive, &decoded).await? {
            info!(strategy = %accepted.strategy, features = accepted.features, "Features recovered from tiles");
        }

        let repaired = work.path().join(format!("{}.geojson", names.base));
        let features = self.repair_features(&decoded, &repaired, theme, year).await?;

        let publisher = Publisher::new(
            self.services.writer.clone(),
            self.services.objects.clone(),
            work.path(),
        );
        let mut published: Vec<PublishedArtifact> = Vec::new();
        let mut rejected = Vec::new();
        if want_shp {
            match publisher.shapefile(&repaired, &names, &shp_key).await {
                Ok(artifact) => published.push(artifact),
                Err(e) => rejected.push(e.to_string()),
            }
        }
        if want_gdb {
            match publisher.geodatabase(&repaired, &names, &gdb_key).await {
                Ok(artifact) => published.push(artifact),
                Err(e) => rejected.push(e.to_string()),
            }
        }
        if published.is_empty() {
            bail!("no artifact published: {}", rejected.join("; "));
        }

        self.record(theme, year, features, &published, store.public_url(&tiles_key))
            .await?;

        Ok(SweepOutcome::Regenerated {
            features,
            artifacts: published.into_iter().map(|a| a.key).collect(),
        })
    }

    /// Run the repair cascade over a decoded collection and write the
    /// survivors, as multi-polygons, to `out`
    async fn repair_features(&self, src: &Path, out: &Path, theme: Theme, year: Year) -> anyhow::Result<u64> {
        let ops = &*self.services.geometry;
        let features = read_features(src)?;

        let mut items = Vec::with_capacity(features.len());
        for (index, feature) in features.iter().enumerate() {
            let geometry = match feature.get("geometry") {
                Some(Value::Null) | None => None,
                Some(geometry) => match ops.from_geojson(geometry).await {
                    Ok(wkb) => Some(wkb),
                    Err(e) => {
                        warn!(index, error = %e, "Feature geometry unreadable, dropped");
                        None
                    }
                },
            };
            items.push(RepairItem { key: index, geometry });
        }

        let engine = RepairEngine::new(ops, self.config.pipeline.buffer_steps.clone());
        let outcome = engine.repair(items).await;
        outcome.ensure_survivors(theme, year)?;

        let mut repaired = Vec::with_capacity(outcome.kept.len());
        for kept in outcome.kept {
            let geometry = ops.to_geojson(&to_multi(kept.geometry)?).await?;
            let properties = features
                .get(kept.key)
                .and_then(|f| f.get("properties"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            repaired.push(json!({
                "type": "Feature",
                "properties": properties,
                "geometry": geometry,
            }));
        }

        Ok(write_feature_collection(out, &repaired)?)
    }

    async fn record(
        &self,
        theme: Theme,
        year: Year,
        features: u64,
        published: &[PublishedArtifact],
        map_url: String,
    ) -> anyhow::Result<()> {
        let find = |kind: ArtifactKind| published.iter().find(|a| a.kind == kind);
        let gdb = find(ArtifactKind::Geodatabase);
        let shp = find(ArtifactKind::Shapefile);

        let record = DatasetRecord {
            title: self.config.themes.title(theme, year),
            year,
            theme,
            rows: features as i64,
            md5: gdb.map(|a| a.md5.clone()),
            size: gdb.map(|a| a.size as i64),
            gdb_url: gdb.map(|a| a.url.clone()),
            shp_url: shp.map(|a| a.url.clone()),
            map_url: Some(map_url),
        };
        self.services.coordination.upsert_dataset(&record).await?;
        Ok(())
    }
}
