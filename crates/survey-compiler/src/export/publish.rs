//! Publishable artifacts
//!
//! Each artifact goes through one deterministic path: prepare the input,
//! convert, validate, upload. A failure affects that artifact only.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument};
use zip::write::SimpleFileOptions;

use super::geojson::{
    property_names, read_features, rewrite_properties, truncate_names, write_feature_collection,
    GDB_STRIPPED_COLUMNS, SHAPEFILE_NAME_LIMIT,
};
use super::validate::{validate_gdb_zip, validate_pmtiles, validate_shapefile_zip, Reason};
use crate::config::{PipelineConfig, ToolsConfig};
use crate::error::CompilerError;
use crate::storage::ObjectStore;
use crate::tools::ToolRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Shapefile,
    Geodatabase,
    Tiles,
}

impl ArtifactKind {
    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::Shapefile | ArtifactKind::Geodatabase => "application/zip",
            ArtifactKind::Tiles => "application/vnd.pmtiles",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedArtifact {
    pub kind: ArtifactKind,
    pub key: String,
    pub url: String,
    pub size: u64,
    pub md5: String,
    pub features: u64,
}

/// Conversion seam over the external tools
///
/// `out` is always inside the run's scratch directory; writers keep their
/// intermediate files beside it so the preflight disk check covers them.
#[async_trait]
pub trait ArtifactWriter: Send + Sync {
    /// Shapefile set for `src` zipped into `out`
    async fn shapefile(&self, src: &Path, layer: &str, out: &Path) -> Result<(), Reason>;

    /// `<layer>.gdb` directory for `src` zipped into `out`
    async fn geodatabase(&self, src: &Path, gdb_name: &str, layer: &str, out: &Path) -> Result<(), Reason>;

    async fn tiles(&self, src: &Path, layer: &str, out: &Path) -> Result<(), Reason>;
}

/// ogr2ogr for vector formats, tippecanoe for tiles
pub struct OgrTippecanoe {
    runner: Arc<dyn ToolRunner>,
    ogr2ogr: String,
    tippecanoe: String,
    min_zoom: u8,
    max_zoom: u8,
}

impl OgrTippecanoe {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: &ToolsConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            runner,
            ogr2ogr: tools.ogr2ogr.clone(),
            tippecanoe: tools.tippecanoe.clone(),
            min_zoom: pipeline.min_zoom,
            max_zoom: pipeline.max_zoom,
        }
    }

    /// Temporary directory next to `out`, removed when dropped
    fn work_dir(out: &Path) -> Result<tempfile::TempDir, Reason> {
        let parent = out
            .parent()
            .ok_or_else(|| Reason::new(format!("{} has no parent directory", out.display())))?;
        Ok(tempfile::Builder::new().prefix(".ogr-").tempdir_in(parent)?)
    }

    async fn ogr2ogr(&self, driver: &str, dst: &Path, src: &Path, layer: &str) -> Result<(), Reason> {
        let args: Vec<String> = vec![
            "-f".into(),
            driver.into(),
            dst.to_string_lossy().into_owned(),
            src.to_string_lossy().into_owned(),
            "-nln".into(),
            layer.into(),
            "-dim".into(),
            "XY".into(),
            "-nlt".into(),
            "MULTIPOLYGON".into(),
        ];
        let output = self.runner.run(&self.ogr2ogr, &args, None).await?;
        if !output.success {
            return Err(Reason::new(format!(
                "ogr2ogr {} failed: {}",
                driver,
                output.stderr_tail()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactWriter for OgrTippecanoe {
    async fn shapefile(&self, src: &Path, layer: &str, out: &Path) -> Result<(), Reason> {
        let work = Self::work_dir(out)?;
        self.ogr2ogr("ESRI Shapefile", work.path(), src, layer).await?;

        let members: Vec<PathBuf> = ["shp", "shx", "dbf", "prj", "cpg"]
            .iter()
            .map(|ext| work.path().join(format!("{}.{}", layer, ext)))
            .filter(|p| p.exists())
            .collect();
        zip_files(&members, out)?;
        Ok(())
    }

    async fn geodatabase(&self, src: &Path, gdb_name: &str, layer: &str, out: &Path) -> Result<(), Reason> {
        let work = Self::work_dir(out)?;
        let gdb = work.path().join(gdb_name);
        self.ogr2ogr("OpenFileGDB", &gdb, src, layer).await?;
        zip_dir(&gdb, out)?;
        Ok(())
    }

    async fn tiles(&self, src: &Path, layer: &str, out: &Path) -> Result<(), Reason> {
        let args = vec![
            "-o".to_string(),
            out.to_string_lossy().into_owned(),
            "--force".to_string(),
            format!("--minimum-zoom={}", self.min_zoom),
            format!("--maximum-zoom={}", self.max_zoom),
            "-l".to_string(),
            layer.to_string(),
            src.to_string_lossy().into_owned(),
        ];
        let output = self.runner.run(&self.tippecanoe, &args, None).await?;
        if !output.success {
            return Err(Reason::new(format!("tippecanoe failed: {}", output.stderr_tail())));
        }
        Ok(())
    }
}

/// Zip `files` flat into `out`
pub fn zip_files(files: &[PathBuf], out: &Path) -> anyhow::Result<()> {
    let mut zip = zip::ZipWriter::new(BufWriter::new(File::create(out)?));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for path in files {
        let name = path
            .file_name()
            .context("archive member has no file name")?
            .to_string_lossy();
        zip.start_file(name.as_ref(), options)?;
        std::io::copy(&mut BufReader::new(File::open(path)?), &mut zip)?;
    }

    zip.finish()?;
    Ok(())
}

/// Zip the directory `dir` into `out`, members prefixed with the directory name
pub fn zip_dir(dir: &Path, out: &Path) -> anyhow::Result<()> {
    let root = dir
        .file_name()
        .context("directory has no name")?
        .to_string_lossy()
        .into_owned();
    let mut zip = zip::ZipWriter::new(BufWriter::new(File::create(out)?));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut pending = vec![(dir.to_path_buf(), root)];
    while let Some((path, name)) = pending.pop() {
        zip.add_directory(format!("{}/", name), options)?;
        let mut entries: Vec<_> = std::fs::read_dir(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let member = format!("{}/{}", name, entry.file_name().to_string_lossy());
            if entry.file_type()?.is_dir() {
                pending.push((entry.path(), member));
            } else {
                zip.start_file(member, options)?;
                std::io::copy(&mut BufReader::new(File::open(entry.path())?), &mut zip)?;
            }
        }
    }

    zip.finish()?;
    Ok(())
}

/// What to publish for one theme/year
#[derive(Debug, Clone)]
pub struct ArtifactNames {
    /// e.g. `AR_25K_PETAMANGROVE_EXISTING_2025`
    pub base: String,
    /// e.g. `EXISTING_2025`
    pub layer: String,
}

impl ArtifactNames {
    pub fn new(prefix: &str, label: &str, year: crate::catalog::Year) -> Self {
        Self {
            base: format!("{}_{}_{}", prefix, label, year),
            layer: format!("{}_{}", label, year),
        }
    }

    pub fn shapefile_zip(&self) -> String {
        format!("{}.zip", self.base)
    }

    pub fn gdb_dir(&self) -> String {
        format!("{}.gdb", self.base)
    }

    pub fn gdb_zip(&self) -> String {
        format!("{}.gdb.zip", self.base)
    }
}

pub struct Publisher {
    writer: Arc<dyn ArtifactWriter>,
    store: Arc<dyn ObjectStore>,
    scratch: PathBuf,
}

impl Publisher {
    pub fn new(writer: Arc<dyn ArtifactWriter>, store: Arc<dyn ObjectStore>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            writer,
            store,
            scratch: scratch.into(),
        }
    }

    async fn upload(&self, kind: ArtifactKind, path: &Path, key: &str, features: u64) -> anyhow::Result<PublishedArtifact> {
        let md5 = survey_common::checksum::file_md5(path)?;
        let uploaded = self.store.put_file(key, path, kind.content_type()).await?;
        info!(kind = ?kind, key, size = uploaded.size, features, "Artifact published");
        Ok(PublishedArtifact {
            kind,
            key: uploaded.key,
            url: uploaded.url,
            size: uploaded.size,
            md5,
            features,
        })
    }

    /// Shapefile zip from a GeoJSON export, with property names cut to the
    /// dBASE limit
    #[instrument(skip(self, geojson))]
    pub async fn shapefile(&self, geojson: &Path, names: &ArtifactNames, key: &str) -> Result<PublishedArtifact, CompilerError> {
        let artifact = names.shapefile_zip();
        self.shapefile_inner(geojson, names, key)
            .await
            .map_err(|e| artifact_failure(&artifact, e))
    }

    async fn shapefile_inner(&self, geojson: &Path, names: &ArtifactNames, key: &str) -> anyhow::Result<PublishedArtifact> {
        let mut features = read_features(geojson)?;
        let mapping = truncate_names(&property_names(&features), SHAPEFILE_NAME_LIMIT);
        rewrite_properties(&mut features, &mapping, &[]);

        let prepared = self.scratch.join(format!("{}.shp.geojson", names.base));
        write_feature_collection(&prepared, &features)?;

        let out = self.scratch.join(names.shapefile_zip());
        self.writer.shapefile(&prepared, &names.layer, &out).await?;
        let count = validate_shapefile_zip(&out)?;
        self.upload(ArtifactKind::Shapefile, &out, key, count).await
    }

    /// Geodatabase zip from a GeoJSON export stripped of identifier columns
    #[instrument(skip(self, geojson))]
    pub async fn geodatabase(&self, geojson: &Path, names: &ArtifactNames, key: &str) -> Result<PublishedArtifact, CompilerError> {
        let artifact = names.gdb_zip();
        self.geodatabase_inner(geojson, names, key)
            .await
            .map_err(|e| artifact_failure(&artifact, e))
    }

    async fn geodatabase_inner(&self, geojson: &Path, names: &ArtifactNames, key: &str) -> anyhow::Result<PublishedArtifact> {
        let mut features = read_features(geojson)?;
        rewrite_properties(&mut features, &Default::default(), GDB_STRIPPED_COLUMNS);

        let prepared = self.scratch.join(format!("{}.gdb.geojson", names.base));
        let count = write_feature_collection(&prepared, &features)?;

        let out = self.scratch.join(names.gdb_zip());
        self.writer
            .geodatabase(&prepared, &names.gdb_dir(), &names.layer, &out)
            .await?;
        let count = validate_gdb_zip(&out, count)?;
        self.upload(ArtifactKind::Geodatabase, &out, key, count).await
    }

    /// Build and validate a tile archive; `file_name` distinguishes
    /// per-region archives. Uploading happens separately.
    #[instrument(skip(self, geojson))]
    pub async fn build_tiles(&self, geojson: &Path, layer: &str, file_name: &str) -> Result<BuiltTiles, CompilerError> {
        let out = self.scratch.join(file_name);
        let built: anyhow::Result<BuiltTiles> = async {
            self.writer.tiles(geojson, layer, &out).await?;
            let header = validate_pmtiles(&out)?;
            Ok(BuiltTiles {
                path: out.clone(),
                tile_contents: header.tile_contents,
            })
        }
        .await;
        built.map_err(|e| artifact_failure(file_name, e))
    }

    pub async fn upload_tiles(&self, built: &BuiltTiles, key: &str) -> Result<PublishedArtifact, CompilerError> {
        self.upload(ArtifactKind::Tiles, &built.path, key, built.tile_contents)
            .await
            .map_err(|e| artifact_failure(key, e))
    }
}

/// A validated tile archive waiting in scratch
#[derive(Debug, Clone)]
pub struct BuiltTiles {
    pub path: PathBuf,
    pub tile_contents: u64,
}

fn artifact_failure(artifact: &str, e: anyhow::Error) -> CompilerError {
    error!(artifact, error = %format!("{:#}", e), "Artifact failed, skipping");
    CompilerError::artifact(artifact, format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Year;
    use crate::tools::ToolOutput;
    use std::sync::Mutex;
    use std::time::Duration;

    /// ogr2ogr stand-in that writes a minimal shapefile set into its
    /// destination and remembers where that was
    #[derive(Default)]
    struct ShapefileTool {
        destinations: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ToolRunner for ShapefileTool {
        async fn run(&self, _program: &str, args: &[String], _timeout: Option<Duration>) -> std::io::Result<ToolOutput> {
            let dst = PathBuf::from(&args[2]);
            let layer = &args[5];
            for ext in ["shp", "shx", "dbf"] {
                let mut data = vec![0u8; 32];
                data[4] = 1;
                std::fs::write(dst.join(format!("{}.{}", layer, ext)), data)?;
            }
            self.destinations.lock().unwrap().push(dst);
            Ok(ToolOutput {
                success: true,
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_intermediates_stay_in_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let tool = Arc::new(ShapefileTool::default());
        let writer = OgrTippecanoe::new(tool.clone(), &ToolsConfig::default(), &PipelineConfig::default());

        let src = scratch.path().join("in.geojson");
        std::fs::write(&src, br#"{"type":"FeatureCollection","features":[]}"#).unwrap();
        let out = scratch.path().join("L.zip");
        writer.shapefile(&src, "L", &out).await.unwrap();

        let destinations = tool.destinations.lock().unwrap();
        assert_eq!(destinations.len(), 1);
        assert!(destinations[0].starts_with(scratch.path()));
        // the work directory is gone, only input and archive remain
        assert!(!destinations[0].exists());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 2);
        assert_eq!(validate_shapefile_zip(&out).unwrap(), 1);
    }

    #[test]
    fn test_artifact_names() {
        let names = ArtifactNames::new("AR_25K_PETAMANGROVE", "EXISTING", Year::new(2025).unwrap());
        assert_eq!(names.shapefile_zip(), "AR_25K_PETAMANGROVE_EXISTING_2025.zip");
        assert_eq!(names.gdb_zip(), "AR_25K_PETAMANGROVE_EXISTING_2025.gdb.zip");
        assert_eq!(names.gdb_dir(), "AR_25K_PETAMANGROVE_EXISTING_2025.gdb");
        assert_eq!(names.layer, "EXISTING_2025");
    }

    #[test]
    fn test_zip_dir_keeps_directory_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let gdb = dir.path().join("X.gdb");
        std::fs::create_dir(&gdb).unwrap();
        std::fs::write(gdb.join("a00000001.gdbtable"), b"table").unwrap();
        std::fs::write(gdb.join("gdb"), b"marker").unwrap();

        let out = dir.path().join("x.gdb.zip");
        zip_dir(&gdb, &out).unwrap();

        assert_eq!(validate_gdb_zip(&out, 3).unwrap(), 3);
        let archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"X.gdb/a00000001.gdbtable"));
    }

    #[test]
    fn test_zip_files_flat() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for ext in ["shp", "shx", "dbf"] {
            let path = dir.path().join(format!("L.{}", ext));
            let mut data = vec![0u8; 32];
            data[4] = 2;
            std::fs::write(&path, data).unwrap();
            files.push(path);
        }
        let out = dir.path().join("l.zip");
        zip_files(&files, &out).unwrap();
        assert_eq!(validate_shapefile_zip(&out).unwrap(), 2);
    }
}
