//! Yearly compilation run
//!
//! [`Pipeline::run`] drives every [`Step`] in order through the
//! [`Controller`]. Steps only talk to the seams held in [`Services`], so the
//! whole run can be exercised against in-memory fakes.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{info, instrument, warn};

use crate::aggregate::{AggregateOptions, AggregateReport, AggregationTarget, Aggregator, ShardSource};
use crate::catalog::{Ident, ShardCatalog, ShardName, Theme, ThemeTables, Year};
use crate::config::{Config, PipelineConfig};
use crate::controller::{Controller, ProgressStore, RunState, Step};
use crate::error::{CompilerError, Result};
use crate::export::{ArtifactNames, ArtifactWriter, BuiltTiles, PublishedArtifact, Publisher};
use crate::geometry::{GeometryOps, RepairEngine, RepairStats, Wkb};
use crate::prober::{DiskProbe, PreflightReport, Prober};
use crate::storage::{ObjectKeys, ObjectStore};
use crate::store::{CoordinationStore, DatasetRecord};
use crate::tools::ToolRunner;

/// Every external collaborator a run needs
#[derive(Clone)]
pub struct Services {
    pub shards: Arc<dyn ShardSource>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub target: Arc<dyn AggregationTarget>,
    pub progress: Arc<dyn ProgressStore>,
    pub geometry: Arc<dyn GeometryOps>,
    pub objects: Arc<dyn ObjectStore>,
    pub tools: Arc<dyn ToolRunner>,
    pub writer: Arc<dyn ArtifactWriter>,
    pub disk: Arc<dyn DiskProbe>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub unreachable: Vec<ShardName>,
    pub aggregate: AggregateReport,
    pub repair: BTreeMap<Theme, RepairStats>,
    pub artifacts: Vec<PublishedArtifact>,
    /// Artifacts that failed validation or upload, with the reason
    pub rejected: Vec<String>,
}

/// Per-theme working state between the export steps
struct ThemeExport {
    theme: Theme,
    label: String,
    names: ArtifactNames,
    geojson: PathBuf,
    shapefile: Option<PublishedArtifact>,
    geodatabase: Option<PublishedArtifact>,
    tiles: Option<BuiltTiles>,
    region_tiles: Vec<(ShardName, BuiltTiles)>,
    map: Option<PublishedArtifact>,
}

/// Scratch directory for one run or sweep, removed when dropped
pub fn scratch_dir(config: &PipelineConfig) -> anyhow::Result<TempDir> {
    let parent = config.scratch_parent();
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create scratch parent {}", parent.display()))?;
    tempfile::Builder::new()
        .prefix("survey-compiler-")
        .tempdir_in(&parent)
        .with_context(|| format!("Failed to create scratch directory in {}", parent.display()))
}

pub struct Pipeline {
    config: Config,
    services: Services,
    catalog: ShardCatalog,
    tables: ThemeTables,
    keys: ObjectKeys,
    shard_schema: Ident,
}

impl Pipeline {
    pub fn new(config: Config, services: Services) -> anyhow::Result<Self> {
        let catalog = config.catalog()?;
        let tables = config.theme_tables()?;
        let shard_schema = config.shard_schema()?;
        let keys = ObjectKeys::new(config.storage.key_prefix.clone());
        Ok(Self {
            config,
            services,
            catalog,
            tables,
            keys,
            shard_schema,
        })
    }

    /// Restrict the run to a subset of the catalog
    pub fn with_catalog(mut self, catalog: ShardCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn keys(&self) -> &ObjectKeys {
        &self.keys
    }

    pub async fn preflight(&self, year: Year, scratch: &Path) -> PreflightReport {
        let prober = Prober {
            store: &*self.services.objects,
            tools: &*self.services.tools,
            disk: &*self.services.disk,
            shards: &*self.services.shards,
            tables: &self.tables,
            shard_schema: self.shard_schema.clone(),
            required_tools: self.config.tools.required(),
            probe_timeout: self.config.tools.probe_timeout(),
            scratch_dir: scratch.to_path_buf(),
            min_free_bytes: self.config.pipeline.min_free_disk_bytes(),
        };
        prober.run(&self.catalog, year).await
    }

    #[instrument(skip(self))]
    pub async fn run(&self, run_id: &str, year: Year) -> anyhow::Result<RunSummary> {
        let mut controller = Controller::new(&*self.services.progress, run_id, year);
        controller.start().await?;

        let scratch = match scratch_dir(&self.config.pipeline) {
            Ok(dir) => dir,
            Err(e) => return Err(controller.abort(e).await),
        };

        let report = self.preflight(year, scratch.path()).await;
        let failures = report.failures();
        if !failures.is_empty() {
            controller.preflight_failed(&failures).await?;
            return Err(CompilerError::critical(format!("preflight failed: {}", failures.join("; "))).into());
        }
        controller.advance(Step::Preflight, Ok::<(), anyhow::Error>(())).await?;

        let shards = report.reachable_shards();
        let unreachable: Vec<ShardName> = report
            .shards
            .iter()
            .filter(|p| !p.reachable())
            .map(|p| p.shard.clone())
            .collect();

        let coordination = &*self.services.coordination;
        controller
            .advance(Step::SchemaValidate, coordination.prepare_tables(year).await)
            .await?;

        let cleared = controller
            .checkpoint(Step::DataClean, coordination.clear(year).await)
            .await?;
        info!(year = %year, rows = cleared, "Previous rows cleared");

        let aggregator = Aggregator::new(
            &*self.services.shards,
            &*self.services.target,
            &self.tables,
            AggregateOptions {
                batch_size: self.config.pipeline.batch_size,
                shard_schema: self.shard_schema.clone(),
                geometry_column: self.config.pipeline.geometry_column.clone(),
            },
        );
        let aggregate = controller
            .checkpoint(Step::Aggregate, aggregator.run(&shards, year).await)
            .await?;

        let repair = controller
            .checkpoint(Step::RepairGeometry, self.repair(year).await)
            .await?;

        let removed = controller
            .checkpoint(Step::CleanResultObjects, self.clean_results(year).await)
            .await?;
        info!(year = %year, objects = removed, "Old result archives removed");

        let removed = controller
            .checkpoint(Step::CleanTileObjects, self.clean_tiles(year).await)
            .await?;
        info!(year = %year, objects = removed, "Old tile archives removed");

        let mut exports = controller
            .checkpoint(Step::ExportGeoJson, self.export(year, scratch.path()).await)
            .await?;

        let publisher = Publisher::new(
            self.services.writer.clone(),
            self.services.objects.clone(),
            scratch.path(),
        );
        let mut rejected = Vec::new();

        for export in exports.iter_mut() {
            let shp_key = self.keys.result(year, &export.names.shapefile_zip());
            match publisher.shapefile(&export.geojson, &export.names, &shp_key).await {
                Ok(artifact) => export.shapefile = Some(artifact),
                Err(e) => rejected.push(e.to_string()),
            }
            let gdb_key = self.keys.result(year, &export.names.gdb_zip());
            match publisher.geodatabase(&export.geojson, &export.names, &gdb_key).await {
                Ok(artifact) => export.geodatabase = Some(artifact),
                Err(e) => rejected.push(e.to_string()),
            }
        }
        controller.advance(Step::ConvertFormats, Ok::<(), anyhow::Error>(())).await?;

        for export in exports.iter_mut() {
            let file_name = format!("{}{}.pmtiles", export.label, year);
            match publisher.build_tiles(&export.geojson, &export.names.layer, &file_name).await {
                Ok(built) => export.tiles = Some(built),
                Err(e) => rejected.push(e.to_string()),
            }
        }
        controller.advance(Step::GenerateTiles, Ok::<(), anyhow::Error>(())).await?;

        let regions = self
            .region_tiles(&publisher, &mut exports, year, scratch.path(), &mut rejected)
            .await;
        controller.advance(Step::GenerateRegionTiles, regions).await?;

        for export in exports.iter_mut() {
            if let Some(built) = &export.tiles {
                let key = self.keys.tiles(&export.label, year);
                match publisher.upload_tiles(built, &key).await {
                    Ok(artifact) => export.map = Some(artifact),
                    Err(e) => rejected.push(e.to_string()),
                }
            }
            for (region, built) in &export.region_tiles {
                let key = self.keys.region_tiles(&export.label, year, region);
                if let Err(e) = publisher.upload_tiles(built, &key).await {
                    rejected.push(e.to_string());
                }
            }
        }
        controller.advance(Step::UploadTiles, Ok::<(), anyhow::Error>(())).await?;

        let metadata = self.write_metadata(&exports, year).await;
        controller.advance(Step::MetadataWrite, metadata).await?;

        let state = controller.advance(Step::Finalize, Ok::<(), anyhow::Error>(())).await?;

        let artifacts: Vec<PublishedArtifact> = exports
            .into_iter()
            .flat_map(|e| [e.shapefile, e.geodatabase, e.map])
            .flatten()
            .collect();

        info!(
            run_id,
            year = %year,
            artifacts = artifacts.len(),
            rejected = rejected.len(),
            unreachable = unreachable.len(),
            "Run completed"
        );

        Ok(RunSummary {
            state,
            unreachable,
            aggregate,
            repair,
            artifacts,
            rejected,
        })
    }

    async fn repair(&self, year: Year) -> Result<BTreeMap<Theme, RepairStats>> {
        let coordination = &*self.services.coordination;
        let engine = RepairEngine::new(&*self.services.geometry, self.config.pipeline.buffer_steps.clone());
        let mut stats = BTreeMap::new();

        for theme in Theme::ALL {
            let items = coordination.load_geometries(theme, year).await?;
            let outcome = engine.repair(items).await;
            outcome.ensure_survivors(theme, year)?;

            let updates: Vec<(i64, Wkb)> = outcome
                .changed()
                .map(|r| (r.key, r.geometry.clone()))
                .collect();
            coordination
                .apply_repairs(theme, year, &updates, &outcome.dropped)
                .await?;

            info!(
                theme = %theme,
                updated = updates.len(),
                dropped = outcome.dropped.len(),
                survivors = outcome.stats.survivors,
                "Repairs applied"
            );
            stats.insert(theme, outcome.stats);
        }

        Ok(stats)
    }

    async fn clean_results(&self, year: Year) -> anyhow::Result<usize> {
        let objects = self.services.objects.list(&self.keys.result_prefix(year)).await?;
        for object in &objects {
            self.services.objects.delete(&object.key).await?;
        }
        Ok(objects.len())
    }

    async fn clean_tiles(&self, year: Year) -> anyhow::Result<usize> {
        let store = &*self.services.objects;
        let mut removed = 0;
        for theme in Theme::ALL {
            let label = self.tables.label(theme);
            let key = self.keys.tiles(&label, year);
            if store.exists(&key).await? {
                store.delete(&key).await?;
                removed += 1;
            }
            for object in store.list(&self.keys.region_tiles_prefix(&label, year)).await? {
                store.delete(&object.key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn export(&self, year: Year, scratch: &Path) -> Result<Vec<ThemeExport>> {
        let mut exports = Vec::with_capacity(Theme::ALL.len());
        for theme in Theme::ALL {
            let label = self.tables.label(theme);
            let names = ArtifactNames::new(&self.config.pipeline.artifact_prefix, &label, year);
            let geojson = scratch.join(format!("{}.geojson", names.base));

            let features = self
                .services
                .coordination
                .export_geojson(theme, year, None, &geojson)
                .await?;
            info!(theme = %theme, features, path = %geojson.display(), "GeoJSON exported");

            exports.push(ThemeExport {
                theme,
                label,
                names,
                geojson,
                shapefile: None,
                geodatabase: None,
                tiles: None,
                region_tiles: Vec::new(),
                map: None,
            });
        }
        Ok(exports)
    }

    /// Per-region archives when enabled. Only a failure to list regions
    /// fails the step; a bad region only loses its own archive.
    async fn region_tiles(
        &self,
        publisher: &Publisher,
        exports: &mut [ThemeExport],
        year: Year,
        scratch: &Path,
        rejected: &mut Vec<String>,
    ) -> Result<()> {
        if !self.config.pipeline.region_tiles {
            return Ok(());
        }

        for export in exports.iter_mut() {
            let regions = self.services.coordination.regions(export.theme, year).await?;
            for region in regions {
                let geojson = scratch.join(format!("{}_{}.geojson", export.names.base, region));
                let features = match self
                    .services
                    .coordination
                    .export_geojson(export.theme, year, Some(&region), &geojson)
                    .await
                {
                    Ok(features) => features,
                    Err(e) => {
                        warn!(theme = %export.theme, region = %region, error = %e, "Region export failed");
                        rejected.push(format!("{} {}: {}", export.label, region, e));
                        continue;
                    }
                };
                if features == 0 {
                    continue;
                }

                let file_name = format!("{}{}_{}.pmtiles", export.label, year, region);
                match publisher
                    .build_tiles(&geojson, &export.names.layer, &file_name)
                    .await
                {
                    Ok(built) => export.region_tiles.push((region, built)),
                    Err(e) => rejected.push(e.to_string()),
                }
            }
        }
        Ok(())
    }

    async fn write_metadata(&self, exports: &[ThemeExport], year: Year) -> Result<()> {
        let coordination = &*self.services.coordination;
        for export in exports {
            let rows = coordination.count_rows(export.theme, year).await?;
            let record = DatasetRecord {
                title: self.config.themes.title(export.theme, year),
                year,
                theme: export.theme,
                rows: rows as i64,
                md5: export.geodatabase.as_ref().map(|a| a.md5.clone()),
                size: export.geodatabase.as_ref().map(|a| a.size as i64),
                gdb_url: export.geodatabase.as_ref().map(|a| a.url.clone()),
                shp_url: export.shapefile.as_ref().map(|a| a.url.clone()),
                map_url: export.map.as_ref().map(|a| a.url.clone()),
            };
            coordination.upsert_dataset(&record).await?;
            info!(title = %record.title, rows, "Dataset metadata written");
        }
        Ok(())
    }
}
