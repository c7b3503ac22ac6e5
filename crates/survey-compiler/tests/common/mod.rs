//! In-memory doubles for every pipeline seam
//!
//! Integration tests drive the real [`Pipeline`](survey_compiler::Pipeline),
//! [`Sweeper`](survey_compiler::sweep::Sweeper) and baseline runner against
//! these fakes, so a full run needs neither PostgreSQL, S3 nor the conversion
//! tools.
//!
//! Geometries are stored the way the shard query ships them: hex-encoded WKB
//! strings inside JSON rows.

#![allow(dead_code)]

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use survey_compiler::aggregate::{AggregationTarget, ShardSession, ShardSource, TargetWriter};
use survey_compiler::catalog::{Ident, ShardName, Theme, Year};
use survey_compiler::controller::{ProgressStore, RunState};
use survey_compiler::export::geojson::{read_features, write_feature_collection};
use survey_compiler::export::publish::{zip_dir, zip_files};
use survey_compiler::export::validate::PMTILES_HEADER_LEN;
use survey_compiler::export::{ArtifactWriter, Reason};
use survey_compiler::geometry::repair::to_multi;
use survey_compiler::geometry::{GeometryKind, GeometryOps, RepairItem, Wkb};
use survey_compiler::prober::DiskProbe;
use survey_compiler::reconcile::{ColumnDef, CopyPlan, SOURCE_SHARD_COLUMN};
use survey_compiler::storage::{ObjectInfo, ObjectStore, UploadResult};
use survey_compiler::store::{CoordinationStore, DatasetRecord};
use survey_compiler::tools::{ToolOutput, ToolRunner};
use survey_compiler::{CompilerError, Config, Result, Services};

pub const GEOMETRY: &str = "geometry";

pub fn year(value: i32) -> Year {
    Year::new(value).unwrap()
}

pub fn ident(value: &str) -> Ident {
    Ident::new(value).unwrap()
}

pub fn hex_wkb(geometry: &Wkb) -> String {
    hex::encode(geometry.as_bytes())
}

pub fn decode_wkb(value: &Value) -> Option<Wkb> {
    value
        .as_str()
        .and_then(|s| hex::decode(s).ok())
        .map(Wkb::from_bytes)
}

// ============================================================================
// Shard rows and columns
// ============================================================================

pub fn text_column(name: &str) -> ColumnDef {
    ColumnDef::new(name, "character varying", "varchar")
}

pub fn numeric_column(name: &str) -> ColumnDef {
    ColumnDef::new(name, "numeric", "numeric")
}

pub fn geometry_column(name: &str) -> ColumnDef {
    ColumnDef::new(name, "USER-DEFINED", "geometry")
}

/// Columns of a surveyed feature table as found on the shards
pub fn survey_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("ogc_fid", "integer", "int4").generated(),
        geometry_column(GEOMETRY),
        text_column("nama"),
        numeric_column("luas"),
    ]
}

/// Aggregation table layout: survey columns plus provenance
pub fn target_columns() -> Vec<ColumnDef> {
    let mut columns = survey_columns();
    columns.push(text_column(SOURCE_SHARD_COLUMN));
    columns
}

pub fn survey_row(id: i64, name: &str, geometry: Option<&Wkb>) -> Value {
    json!({
        "ogc_fid": id,
        GEOMETRY: geometry.map(hex_wkb),
        "nama": name,
        "luas": 1.25,
    })
}

/// `squares` polygons followed by `points` points
pub fn survey_rows(prefix: &str, squares: usize, points: usize) -> Vec<Value> {
    let mut rows = Vec::with_capacity(squares + points);
    for i in 0..squares {
        let geometry = Wkb::square(106.0 + i as f64, -6.0, 0.01);
        rows.push(survey_row(i as i64 + 1, &format!("{}-{}", prefix, i), Some(&geometry)));
    }
    for i in 0..points {
        let geometry = Wkb::point(107.0 + i as f64, -7.0);
        rows.push(survey_row((squares + i) as i64 + 1, &format!("{}-pt-{}", prefix, i), Some(&geometry)));
    }
    rows
}

#[derive(Debug, Clone)]
pub struct ShardTable {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Value>,
}

impl ShardTable {
    pub fn survey(rows: Vec<Value>) -> Self {
        Self {
            columns: survey_columns(),
            rows,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShardData {
    pub tables: HashMap<String, ShardTable>,
    /// Fail the batch read after this many successful batches
    pub fail_after_batches: Option<usize>,
}

impl ShardData {
    pub fn table(mut self, name: &str, table: ShardTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    pub fn failing_after(mut self, batches: usize) -> Self {
        self.fail_after_batches = Some(batches);
        self
    }
}

/// Shards by name; `None` and unknown names are unreachable
#[derive(Debug, Clone, Default)]
pub struct MemoryShards {
    shards: HashMap<String, Option<ShardData>>,
}

impl MemoryShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shard(mut self, name: &str, data: ShardData) -> Self {
        self.shards.insert(name.to_string(), Some(data));
        self
    }

    pub fn unreachable(mut self, name: &str) -> Self {
        self.shards.insert(name.to_string(), None);
        self
    }
}

#[async_trait]
impl ShardSource for MemoryShards {
    async fn open(&self, shard: &ShardName) -> Result<Box<dyn ShardSession>> {
        match self.shards.get(shard.as_str()) {
            Some(Some(data)) => Ok(Box::new(MemorySession {
                shard: shard.to_string(),
                data: data.clone(),
                cursor: VecDeque::new(),
                batches: 0,
            })),
            _ => Err(CompilerError::shard(shard.as_str(), "connection refused")),
        }
    }
}

struct MemorySession {
    shard: String,
    data: ShardData,
    cursor: VecDeque<Value>,
    batches: usize,
}

#[async_trait]
impl ShardSession for MemorySession {
    async fn table_exists(&mut self, _schema: &Ident, table: &Ident) -> Result<bool> {
        Ok(self.data.tables.contains_key(table.as_str()))
    }

    async fn columns(&mut self, _schema: &Ident, table: &Ident) -> Result<Vec<ColumnDef>> {
        Ok(self
            .data
            .tables
            .get(table.as_str())
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn open_cursor(&mut self, plan: &CopyPlan) -> Result<()> {
        let table = self
            .data
            .tables
            .get(plan.source.table.as_str())
            .ok_or_else(|| CompilerError::shard(self.shard.as_str(), "no such table"))?;
        let columns = plan.column_names();

        self.cursor = table
            .rows
            .iter()
            .filter(|row| match &plan.geometry_filter {
                Some(geom) => !row.get(geom.as_str()).unwrap_or(&Value::Null).is_null(),
                None => true,
            })
            .map(|row| {
                let projected: Map<String, Value> = columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect();
                Value::Object(projected)
            })
            .collect();
        self.batches = 0;
        Ok(())
    }

    async fn next_batch(&mut self, size: usize) -> Result<Vec<Value>> {
        if let Some(limit) = self.data.fail_after_batches {
            if self.batches >= limit {
                return Err(CompilerError::shard(self.shard.as_str(), "connection reset mid-stream"));
            }
        }
        let take = size.min(self.cursor.len());
        let batch: Vec<Value> = self.cursor.drain(..take).collect();
        if !batch.is_empty() {
            self.batches += 1;
        }
        Ok(batch)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Coordination database
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub values: Map<String, Value>,
    pub shard: String,
}

impl StoredRow {
    pub fn geometry(&self) -> Option<Wkb> {
        self.values.get(GEOMETRY).and_then(decode_wkb)
    }
}

#[derive(Debug, Default)]
pub struct CoordinationState {
    pub tables: HashMap<(Theme, Year), Vec<StoredRow>>,
    pub next_id: i64,
    pub states: Vec<RunState>,
    pub datasets: Vec<DatasetRecord>,
    pub prepare_calls: usize,
}

/// Aggregation tables, run state and dataset metadata in one place, like the
/// coordination database
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordination {
    state: Arc<Mutex<CoordinationState>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, theme: Theme, year: Year) -> Vec<StoredRow> {
        let state = self.state.lock().unwrap();
        state.tables.get(&(theme, year)).cloned().unwrap_or_default()
    }

    pub fn states(&self) -> Vec<RunState> {
        self.state.lock().unwrap().states.clone()
    }

    pub fn last_state(&self) -> RunState {
        self.states().last().cloned().expect("no state saved")
    }

    pub fn datasets(&self) -> Vec<DatasetRecord> {
        self.state.lock().unwrap().datasets.clone()
    }

    pub fn prepare_calls(&self) -> usize {
        self.state.lock().unwrap().prepare_calls
    }

    /// Theme/year aggregation tables created so far
    pub fn table_count(&self) -> usize {
        self.state.lock().unwrap().tables.len()
    }

    /// Provenance of every row, per shard
    pub fn rows_by_shard(&self, theme: Theme, year: Year) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for row in self.rows(theme, year) {
            *counts.entry(row.shard).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordination {
    async fn prepare_tables(&self, year: Year) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for theme in Theme::ALL {
            state.tables.entry((theme, year)).or_default();
        }
        Ok(())
    }

    async fn clear(&self, year: Year) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for theme in Theme::ALL {
            if let Some(rows) = state.tables.get_mut(&(theme, year)) {
                removed += rows.len() as u64;
                rows.clear();
            }
        }
        Ok(removed)
    }

    async fn load_geometries(&self, theme: Theme, year: Year) -> Result<Vec<RepairItem<i64>>> {
        Ok(self
            .rows(theme, year)
            .iter()
            .map(|row| RepairItem {
                key: row.id,
                geometry: row.geometry(),
            })
            .collect())
    }

    async fn apply_repairs(&self, theme: Theme, year: Year, updates: &[(i64, Wkb)], drops: &[i64]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let rows = state.tables.entry((theme, year)).or_default();

        rows.retain(|row| !drops.contains(&row.id));
        for row in rows.iter_mut() {
            let geometry = match updates.iter().find(|(id, _)| *id == row.id) {
                Some((_, repaired)) => Some(repaired.clone()),
                None => row.geometry(),
            };
            if let Some(geometry) = geometry {
                let multi = to_multi(geometry)?;
                row.values.insert(GEOMETRY.to_string(), Value::String(hex_wkb(&multi)));
            }
        }
        Ok(())
    }

    async fn count_rows(&self, theme: Theme, year: Year) -> Result<u64> {
        Ok(self.rows(theme, year).len() as u64)
    }

    async fn regions(&self, theme: Theme, year: Year) -> Result<Vec<ShardName>> {
        let shards: BTreeSet<String> = self.rows(theme, year).into_iter().map(|r| r.shard).collect();
        shards.into_iter().map(ShardName::new).collect()
    }

    async fn export_geojson(&self, theme: Theme, year: Year, region: Option<&ShardName>, out: &Path) -> Result<u64> {
        let features: Vec<Value> = self
            .rows(theme, year)
            .into_iter()
            .filter(|row| region.map_or(true, |r| row.shard == r.as_str()))
            .map(|row| {
                let mut properties = row.values.clone();
                properties.remove(GEOMETRY);
                properties.insert(SOURCE_SHARD_COLUMN.to_string(), Value::String(row.shard.clone()));
                json!({
                    "type": "Feature",
                    "properties": properties,
                    "geometry": multipolygon_json(),
                })
            })
            .collect();
        write_feature_collection(out, &features).map_err(|e| CompilerError::critical(e.to_string()))
    }

    async fn upsert_dataset(&self, record: &DatasetRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .datasets
            .retain(|d| !(d.year == record.year && d.theme == record.theme));
        state.datasets.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for MemoryCoordination {
    async fn prepare(&self) -> Result<()> {
        self.state.lock().unwrap().prepare_calls += 1;
        Ok(())
    }

    /// Fails before `prepare`, like a status table that does not exist yet
    async fn save(&self, state: &RunState) -> Result<()> {
        let mut inner = self.state.lock().unwrap();
        if inner.prepare_calls == 0 {
            return Err(CompilerError::critical("relation \"compiler_status\" does not exist"));
        }
        inner.states.push(state.clone());
        Ok(())
    }
}

#[async_trait]
impl AggregationTarget for MemoryCoordination {
    async fn target_columns(&self, _theme: Theme, _year: Year) -> Result<Vec<ColumnDef>> {
        Ok(target_columns())
    }

    async fn begin(&self, theme: Theme, year: Year, shard: &ShardName) -> Result<Box<dyn TargetWriter>> {
        Ok(Box::new(MemoryWriter {
            state: self.state.clone(),
            key: (theme, year),
            shard: shard.to_string(),
            pending: Vec::new(),
        }))
    }
}

/// Rows stay invisible until commit
struct MemoryWriter {
    state: Arc<Mutex<CoordinationState>>,
    key: (Theme, Year),
    shard: String,
    pending: Vec<Map<String, Value>>,
}

#[async_trait]
impl TargetWriter for MemoryWriter {
    async fn insert(&mut self, columns: &[String], rows: Vec<Value>) -> Result<u64> {
        let count = rows.len() as u64;
        for row in rows {
            let values: Map<String, Value> = columns
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect();
            self.pending.push(values);
        }
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut ids = state.next_id;
        let committed: Vec<StoredRow> = self
            .pending
            .into_iter()
            .map(|values| {
                ids += 1;
                StoredRow {
                    id: ids,
                    values,
                    shard: self.shard.clone(),
                }
            })
            .collect();
        state.next_id = ids;
        state.tables.entry(self.key).or_default().extend(committed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Geometry
// ============================================================================

pub fn multipolygon_json() -> Value {
    json!({
        "type": "MultiPolygon",
        "coordinates": [[[[106.0, -6.0], [106.1, -6.0], [106.1, -6.1], [106.0, -6.0]]]],
    })
}

/// Points and multi-points buffer into squares for any positive distance;
/// a zero buffer returns the input; nothing polygonizes.
#[derive(Debug, Default)]
pub struct FakeOps;

#[async_trait]
impl GeometryOps for FakeOps {
    async fn buffer(&self, geometry: &Wkb, distance: f64) -> Result<Wkb> {
        if distance == 0.0 {
            return Ok(geometry.clone());
        }
        match geometry.kind()? {
            GeometryKind::Point | GeometryKind::MultiPoint => Ok(Wkb::square(0.0, 0.0, distance)),
            _ => Ok(Wkb::empty(GeometryKind::Polygon)),
        }
    }

    async fn polygonize(&self, _geometry: &Wkb) -> Result<Wkb> {
        Ok(Wkb::empty(GeometryKind::MultiPolygon))
    }

    async fn is_valid(&self, _geometry: &Wkb) -> Result<bool> {
        Ok(true)
    }

    async fn from_geojson(&self, geometry: &Value) -> Result<Wkb> {
        match geometry.get("type").and_then(Value::as_str) {
            Some("Point") => {
                let coords = geometry.get("coordinates").and_then(Value::as_array);
                let x = coords.and_then(|c| c.first()).and_then(Value::as_f64).unwrap_or(0.0);
                let y = coords.and_then(|c| c.get(1)).and_then(Value::as_f64).unwrap_or(0.0);
                Ok(Wkb::point(x, y))
            }
            Some("Polygon") | Some("MultiPolygon") => Ok(Wkb::square(0.0, 0.0, 1.0)),
            other => Err(CompilerError::Geometry(format!("unsupported GeoJSON type {:?}", other))),
        }
    }

    async fn to_geojson(&self, geometry: &Wkb) -> Result<Value> {
        if !geometry.kind()?.is_polygonal() {
            return Err(CompilerError::Geometry("expected a polygonal geometry".to_string()));
        }
        Ok(multipolygon_json())
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryObjects {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    deny_access: bool,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny_access: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> anyhow::Result<UploadResult> {
        let bytes = tokio::fs::read(path).await?;
        let size = bytes.len() as u64;
        self.insert(key, bytes);
        Ok(UploadResult {
            key: key.to_string(),
            size,
            url: self.public_url(key),
        })
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> anyhow::Result<u64> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such key: {}", key))?;
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, bytes)| ObjectInfo {
                key: key.clone(),
                size: bytes.len() as i64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> anyhow::Result<Option<ObjectInfo>> {
        Ok(self.objects.lock().unwrap().get(key).map(|bytes| ObjectInfo {
            key: key.to_string(),
            size: bytes.len() as i64,
        }))
    }

    async fn check_access(&self) -> anyhow::Result<()> {
        if self.deny_access {
            bail!("access denied");
        }
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("http://test/{}", key)
    }
}

// ============================================================================
// Tools, conversion and disk
// ============================================================================

/// Every tool answers `--version` unless listed as missing; the tile
/// decoder prints a fixed document.
#[derive(Debug, Default)]
pub struct ScriptedTools {
    missing: Vec<String>,
    decoder_stdout: String,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }

    pub fn decoder_output(mut self, stdout: impl Into<String>) -> Self {
        self.decoder_stdout = stdout.into();
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRunner for ScriptedTools {
    async fn run(&self, program: &str, args: &[String], _timeout: Option<Duration>) -> io::Result<ToolOutput> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().cloned());
        self.calls.lock().unwrap().push(call);

        if self.missing.iter().any(|m| m == program) {
            return Err(io::Error::new(io::ErrorKind::NotFound, format!("{} not found", program)));
        }

        let stdout = if program == "tippecanoe-decode" {
            self.decoder_stdout.clone()
        } else {
            String::new()
        };
        Ok(ToolOutput {
            success: true,
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Tile decoder document holding `count` polygon features in one layer
pub fn decoder_document(layer: &str, count: usize) -> String {
    let features: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "type": "Feature",
                "properties": {"nama": format!("tile-{}", i), "luas": 2.5},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[106.0, -6.0], [106.1, -6.0], [106.1, -6.1], [106.0, -6.0]]],
                },
            })
        })
        .collect();
    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "FeatureCollection",
            "properties": {"layer": layer, "zoom": 14},
            "features": features,
        }],
    })
    .to_string()
}

/// Minimal PMTiles v3 header with `tiles` stored tiles
pub fn pmtiles_bytes(tiles: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; PMTILES_HEADER_LEN];
    bytes[0..7].copy_from_slice(b"PMTiles");
    bytes[7] = 3;
    bytes[72..80].copy_from_slice(&tiles.to_le_bytes());
    bytes[80..88].copy_from_slice(&tiles.to_le_bytes());
    bytes[88..96].copy_from_slice(&tiles.to_le_bytes());
    bytes[100] = 0;
    bytes[101] = 14;
    bytes
}

/// Writes structurally valid archives sized by the input feature count
#[derive(Debug, Clone, Default)]
pub struct FakeWriter {
    /// Geodatabases whose name contains this come out without any table
    tableless_gdb: Option<String>,
}

impl FakeWriter {
    pub fn tableless_gdb(label: &str) -> Self {
        Self {
            tableless_gdb: Some(label.to_string()),
        }
    }
}

fn feature_count(src: &Path) -> std::result::Result<usize, Reason> {
    Ok(read_features(src)?.len())
}

#[async_trait]
impl ArtifactWriter for FakeWriter {
    async fn shapefile(&self, src: &Path, layer: &str, out: &Path) -> std::result::Result<(), Reason> {
        let count = feature_count(src)?;
        let work = tempfile::tempdir()?;

        let mut dbf = vec![0u8; 32];
        dbf[0] = 0x03;
        dbf[4..8].copy_from_slice(&(count as u32).to_le_bytes());

        let members: Vec<PathBuf> = [("shp", vec![0u8; 100]), ("shx", vec![0u8; 100]), ("dbf", dbf)]
            .into_iter()
            .map(|(ext, bytes)| {
                let path = work.path().join(format!("{}.{}", layer, ext));
                std::fs::write(&path, bytes).map(|_| path)
            })
            .collect::<io::Result<_>>()?;
        zip_files(&members, out)?;
        Ok(())
    }

    async fn geodatabase(&self, _src: &Path, gdb_name: &str, _layer: &str, out: &Path) -> std::result::Result<(), Reason> {
        let work = tempfile::tempdir()?;
        let gdb = work.path().join(gdb_name);
        std::fs::create_dir_all(&gdb)?;
        std::fs::write(gdb.join("gdb"), b"marker")?;
        let broken = self
            .tableless_gdb
            .as_deref()
            .is_some_and(|label| gdb_name.contains(label));
        if !broken {
            std::fs::write(gdb.join("a00000001.gdbtable"), b"table")?;
            std::fs::write(gdb.join("a00000001.gdbtablx"), b"index")?;
        }
        zip_dir(&gdb, out)?;
        Ok(())
    }

    async fn tiles(&self, src: &Path, _layer: &str, out: &Path) -> std::result::Result<(), Reason> {
        let count = feature_count(src)?;
        std::fs::write(out, pmtiles_bytes(count as u64))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDisk(pub u64);

impl DiskProbe for FixedDisk {
    fn free_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Config plus the fakes a test inspects after a run
pub struct Harness {
    pub config: Config,
    pub coordination: Arc<MemoryCoordination>,
    pub objects: Arc<MemoryObjects>,
    pub tools: Arc<ScriptedTools>,
    pub disk: FixedDisk,
    pub writer: FakeWriter,
    pub scratch: TempDir,
}

impl Harness {
    pub fn new(shards: &[&str]) -> Self {
        let scratch = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.shards.names = shards.iter().map(|s| s.to_string()).collect();
        config.pipeline.scratch_dir = Some(scratch.path().to_path_buf());
        config.pipeline.batch_size = 4;
        config.validate().unwrap();

        Self {
            config,
            coordination: Arc::new(MemoryCoordination::new()),
            objects: Arc::new(MemoryObjects::new()),
            tools: Arc::new(ScriptedTools::new()),
            disk: FixedDisk(u64::MAX),
            writer: FakeWriter::default(),
            scratch,
        }
    }

    pub fn with_tools(mut self, tools: ScriptedTools) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_objects(mut self, objects: MemoryObjects) -> Self {
        self.objects = Arc::new(objects);
        self
    }

    pub fn with_writer(mut self, writer: FakeWriter) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_disk(mut self, free_bytes: u64) -> Self {
        self.disk = FixedDisk(free_bytes);
        self
    }

    pub fn services(&self, shards: MemoryShards) -> Services {
        Services {
            shards: Arc::new(shards),
            coordination: self.coordination.clone(),
            target: self.coordination.clone(),
            progress: self.coordination.clone(),
            geometry: Arc::new(FakeOps),
            objects: self.objects.clone(),
            tools: self.tools.clone(),
            writer: Arc::new(self.writer.clone()),
            disk: Arc::new(self.disk),
        }
    }
}
