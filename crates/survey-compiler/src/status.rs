//! Read-only artifact report for one year

use serde::Serialize;
use std::fmt;

use crate::catalog::{Theme, ThemeTables, Year};
use crate::export::ArtifactNames;
use crate::storage::{ObjectInfo, ObjectKeys, ObjectStore};

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPresence {
    pub key: String,
    pub size: Option<i64>,
}

impl ArtifactPresence {
    fn from_head(key: String, head: Option<ObjectInfo>) -> Self {
        Self {
            key,
            size: head.map(|info| info.size),
        }
    }

    pub fn exists(&self) -> bool {
        self.size.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThemeStatus {
    pub theme: Theme,
    pub label: String,
    pub tiles: ArtifactPresence,
    pub shapefile: ArtifactPresence,
    pub geodatabase: ArtifactPresence,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub year: Year,
    pub themes: Vec<ThemeStatus>,
}

impl StatusReport {
    pub async fn collect(
        store: &dyn ObjectStore,
        keys: &ObjectKeys,
        tables: &ThemeTables,
        artifact_prefix: &str,
        year: Year,
    ) -> anyhow::Result<Self> {
        let mut themes = Vec::with_capacity(Theme::ALL.len());
        for theme in Theme::ALL {
            let label = tables.label(theme);
            let names = ArtifactNames::new(artifact_prefix, &label, year);

            let tiles = keys.tiles(&label, year);
            let shapefile = keys.result(year, &names.shapefile_zip());
            let geodatabase = keys.result(year, &names.gdb_zip());

            themes.push(ThemeStatus {
                theme,
                tiles: ArtifactPresence::from_head(tiles.clone(), store.head(&tiles).await?),
                shapefile: ArtifactPresence::from_head(shapefile.clone(), store.head(&shapefile).await?),
                geodatabase: ArtifactPresence::from_head(geodatabase.clone(), store.head(&geodatabase).await?),
                label,
            });
        }
        Ok(Self { year, themes })
    }

    /// Every artifact of every theme is present
    pub fn complete(&self) -> bool {
        self.themes
            .iter()
            .all(|t| t.tiles.exists() && t.shapefile.exists() && t.geodatabase.exists())
    }
}

impl fmt::Display for ArtifactPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.size {
            Some(size) => write!(f, "present ({} bytes)  {}", size, self.key),
            None => write!(f, "missing  {}", self.key),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Artifacts for {}", self.year)?;
        for theme in &self.themes {
            writeln!(f, "  {} ({})", theme.label, theme.theme)?;
            writeln!(f, "    tiles:       {}", theme.tiles)?;
            writeln!(f, "    shapefile:   {}", theme.shapefile)?;
            writeln!(f, "    geodatabase: {}", theme.geodatabase)?;
        }
        Ok(())
    }
}
