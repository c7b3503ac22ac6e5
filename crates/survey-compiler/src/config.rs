//! Configuration management
//!
//! One [`Config`] value is built at startup and handed to every component.
//! Sources, later ones winning:
//!
//! 1. compiled-in defaults
//! 2. `survey-compiler.toml` in the working directory, or the file passed with `--config`
//! 3. `SURVEY_*` environment variables, nested with `__`
//!    (e.g. `SURVEY_DATABASE__HOST`, `SURVEY_STORAGE__BUCKET`)

use anyhow::{bail, Context};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{Ident, ShardCatalog, ShardName, ThemeTables, Theme, Year};
use crate::storage::StorageConfig;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "survey-compiler.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SURVEY_";

/// Default rows per insert batch.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Default minimum free scratch space in GiB.
pub const DEFAULT_MIN_FREE_DISK_GIB: u64 = 10;

/// Default timeout for tool presence probes in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

const DEFAULT_SHARDS: &[&str] = &[
    "agamkuantan",
    "akemalamo",
    "asahanbarumun",
    "barito",
    "batanghari",
    "baturusacerucuk",
    "benainnoelmina",
    "bonelimboto",
    "brantassampean",
    "cimanukcitanduy",
    "citarumciliwung",
    "dodokanmoyosari",
    "indragirirokan",
    "jeneberangsaddang",
    "kahayan",
    "kapuas",
    "karama",
    "ketahun",
    "konaweha",
    "kruengaceh",
    "mahakamberau",
    "memberamo",
    "musi",
    "paluposo",
    "pemalijratun",
    "remuransiki",
    "seijangduriangkang",
    "serayuopakprogo",
    "solo",
    "tondano",
    "undaanyar",
    "waehapubatumerah",
    "wampuseiular",
    "wayseputihwaysekampung",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub pipeline: PipelineConfig,
    pub themes: ThemesConfig,
    pub qc: QcConfig,
    pub shards: ShardsConfig,
}

/// Connection parameters shared by the coordination database and every shard;
/// only the database name varies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub coordination_database: String,
    pub coordination_schema: String,
    pub shard_schema: String,
    pub connect_timeout_secs: u64,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            coordination_database: "postgres".to_string(),
            coordination_schema: "pmn".to_string(),
            shard_schema: "public".to_string(),
            connect_timeout_secs: 10,
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ogr2ogr: String,
    pub tippecanoe: String,
    pub tippecanoe_decode: String,
    /// Optional dedicated tile extractor, invoked as `<tool> <archive> <output.geojson>`
    pub tile_extractor: Option<String>,
    pub probe_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ogr2ogr: "ogr2ogr".to_string(),
            tippecanoe: "tippecanoe".to_string(),
            tippecanoe_decode: "tippecanoe-decode".to_string(),
            tile_extractor: None,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl ToolsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Tools whose absence fails preflight
    pub fn required(&self) -> Vec<String> {
        vec![self.ogr2ogr.clone(), self.tippecanoe.clone()]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub min_free_disk_gib: u64,
    /// Parent for per-run scratch directories; system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub region_tiles: bool,
    /// Buffer distances tried, in order, on non-polygonal geometries
    pub buffer_steps: Vec<f64>,
    pub likely_layer_names: Vec<String>,
    pub artifact_prefix: String,
    pub geometry_column: String,
    pub region_column: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            min_free_disk_gib: DEFAULT_MIN_FREE_DISK_GIB,
            scratch_dir: None,
            min_zoom: 0,
            max_zoom: 14,
            region_tiles: false,
            buffer_steps: vec![0.000_001, 0.000_01, 0.000_1],
            likely_layer_names: vec![
                "existing".to_string(),
                "potensi".to_string(),
                "mangrove".to_string(),
                "layer".to_string(),
                "default".to_string(),
            ],
            artifact_prefix: "AR_25K_PETAMANGROVE".to_string(),
            geometry_column: "geometry".to_string(),
            region_column: "bpdas".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_gib.saturating_mul(1024 * 1024 * 1024)
    }

    pub fn scratch_parent(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeConfig {
    /// Table stem, e.g. `existing` for `existing_2025`
    pub stem: String,
    /// Dataset title; `{year}` is replaced with the reporting year
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThemesConfig {
    pub current: ThemeConfig,
    pub potential: ThemeConfig,
}

impl Default for ThemesConfig {
    fn default() -> Self {
        Self {
            current: ThemeConfig {
                stem: "existing".to_string(),
                title: "Peta Eksisting Mangrove {year}".to_string(),
            },
            potential: ThemeConfig {
                stem: "potensi".to_string(),
                title: "Peta Potensi Mangrove {year}".to_string(),
            },
        }
    }
}

impl ThemesConfig {
    pub fn get(&self, theme: Theme) -> &ThemeConfig {
        match theme {
            Theme::Current => &self.current,
            Theme::Potential => &self.potential,
        }
    }

    pub fn title(&self, theme: Theme, year: Year) -> String {
        self.get(theme).title.replace("{year}", &year.to_string())
    }
}

/// QC acceptance policy inputs for the baseline ratchet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    pub status_column: String,
    pub passing_values: Vec<String>,
    /// Items whose title contains this (case-insensitive) are not checked
    pub ignored_title_substring: String,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            status_column: "qcstatus".to_string(),
            passing_values: vec![
                "true".to_string(),
                "sesuai".to_string(),
                "lengkap".to_string(),
                "sudah sesuai semua".to_string(),
                "sudah sesuai Sebagian".to_string(),
                "tidak terdapat gap/overlap poligon".to_string(),
            ],
            ignored_title_substring: "remark".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    pub names: Vec<String>,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            names: DEFAULT_SHARDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, TOML file and environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        figment = match path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                figment.merge(Toml::file(path))
            }
            None => figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        };

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.bucket.trim().is_empty() {
            bail!("Storage bucket cannot be empty");
        }

        if self.pipeline.batch_size == 0 {
            bail!("Pipeline batch_size must be greater than 0");
        }

        if self.pipeline.min_zoom > self.pipeline.max_zoom {
            bail!(
                "Pipeline min_zoom ({}) cannot be greater than max_zoom ({})",
                self.pipeline.min_zoom,
                self.pipeline.max_zoom
            );
        }

        if self.pipeline.buffer_steps.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            bail!("Pipeline buffer_steps must be positive distances");
        }

        if self.database.max_connections == 0 {
            bail!("Database max_connections must be greater than 0");
        }

        self.catalog()?;
        self.theme_tables()?;
        Ident::new(self.database.coordination_schema.clone())?;
        Ident::new(self.database.shard_schema.clone())?;
        Ident::new(self.pipeline.geometry_column.clone())?;
        Ident::new(self.pipeline.region_column.clone())?;
        Ident::new(self.qc.status_column.clone())?;

        if self.qc.passing_values.is_empty() {
            tracing::warn!("No QC passing values configured - no record can enter the baseline");
        }

        Ok(())
    }

    pub fn catalog(&self) -> anyhow::Result<ShardCatalog> {
        let shards = self
            .shards
            .names
            .iter()
            .map(|name| ShardName::new(name.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        let coordination = Ident::new(self.database.coordination_database.clone())?;
        Ok(ShardCatalog::new(coordination, shards)?)
    }

    pub fn theme_tables(&self) -> anyhow::Result<ThemeTables> {
        Ok(ThemeTables::new(
            Ident::new(self.themes.current.stem.clone())?,
            Ident::new(self.themes.potential.stem.clone())?,
        ))
    }

    /// Identifiers resolved once validation has passed
    pub fn coordination_schema(&self) -> anyhow::Result<Ident> {
        Ok(Ident::new(self.database.coordination_schema.clone())?)
    }

    pub fn shard_schema(&self) -> anyhow::Result<Ident> {
        Ok(Ident::new(self.database.shard_schema.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.catalog().unwrap().shards().len(), 34);
        assert_eq!(config.pipeline.min_free_disk_bytes(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.min_zoom = 15;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.shards.names = vec!["musi; drop table".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.shards.names.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.bucket = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_title_template() {
        let config = Config::default();
        let year = Year::new(2025).unwrap();
        assert_eq!(
            config.themes.title(Theme::Current, year),
            "Peta Eksisting Mangrove 2025"
        );
    }

    #[test]
    #[serial]
    fn test_load_toml_and_env() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[pipeline]\nbatch_size = 500\n\n[shards]\nnames = [\"musi\", \"solo\"]"
        )
        .unwrap();

        std::env::set_var("SURVEY_STORAGE__BUCKET", "from-env");
        let config = Config::load(Some(file.path())).unwrap();
        std::env::remove_var("SURVEY_STORAGE__BUCKET");

        assert_eq!(config.pipeline.batch_size, 500);
        assert_eq!(config.storage.bucket, "from-env");
        assert_eq!(config.catalog().unwrap().shards().len(), 2);
        assert_eq!(config.pipeline.max_zoom, 14);
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        assert!(Config::load(Some(Path::new("/nonexistent/survey.toml"))).is_err());
    }
}
