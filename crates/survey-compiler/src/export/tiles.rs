//! Tile archive to feature collection
//!
//! Used when only a tile archive survives for a year. Each strategy writes a
//! GeoJSON feature collection; decoder output is decoded at the archive's
//! maximum zoom only and exact duplicate features are dropped.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::chain::{ExportStrategy, FallbackChain};
use super::geojson::{dedup_features, flatten_features, scrape_features, write_feature_collection};
use super::validate::{validate_geojson, Reason};
use crate::config::ToolsConfig;
use crate::tools::{ToolOutput, ToolRunner};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn require_success(program: &str, output: ToolOutput) -> Result<ToolOutput, Reason> {
    if output.success {
        Ok(output)
    } else {
        Err(Reason::new(format!(
            "{} exited with {:?}: {}",
            program,
            output.code,
            output.stderr_tail()
        )))
    }
}

fn write_features(out: &Path, features: Vec<Value>) -> Result<PathBuf, Reason> {
    let features = dedup_features(features);
    if features.is_empty() {
        return Err(Reason::new("no features decoded"));
    }
    write_feature_collection(out, &features)?;
    Ok(out.to_path_buf())
}

/// Dedicated extractor, invoked as `<tool> <archive> <output>`
pub struct ExtractorStrategy {
    runner: Arc<dyn ToolRunner>,
    program: Option<String>,
}

#[async_trait]
impl ExportStrategy for ExtractorStrategy {
    fn name(&self) -> &str {
        "tile-extractor"
    }

    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason> {
        let program = self
            .program
            .as_deref()
            .ok_or_else(|| Reason::new("no tile extractor configured"))?;
        let output = self
            .runner
            .run(program, &[path_arg(input), path_arg(out)], None)
            .await?;
        require_success(program, output)?;
        Ok(out.to_path_buf())
    }
}

/// Tile decoder, optionally restricted to one layer
struct Decoder {
    runner: Arc<dyn ToolRunner>,
    program: String,
    zoom: u8,
}

impl Decoder {
    async fn decode(&self, archive: &Path, layer: Option<&str>) -> Result<ToolOutput, Reason> {
        let zoom = self.zoom.to_string();
        let mut args = vec![
            path_arg(archive),
            "-Z".to_string(),
            zoom.clone(),
            "-z".to_string(),
            zoom,
        ];
        if let Some(layer) = layer {
            args.push(format!("--layer={}", layer));
        }
        let output = self.runner.run(&self.program, &args, None).await?;
        require_success(&self.program, output)
    }

    async fn decode_features(&self, archive: &Path, layer: Option<&str>) -> Result<Vec<Value>, Reason> {
        let output = self.decode(archive, layer).await?;
        let value: Value = serde_json::from_str(&output.stdout)
            .map_err(|e| Reason::new(format!("decoder output is not JSON: {}", e)))?;
        Ok(flatten_features(value))
    }
}

pub struct DecodeAllLayers(Decoder);

#[async_trait]
impl ExportStrategy for DecodeAllLayers {
    fn name(&self) -> &str {
        "decode-all-layers"
    }

    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason> {
        let features = self.0.decode_features(input, None).await?;
        write_features(out, features)
    }
}

pub struct DecodeLikelyLayers {
    decoder: Decoder,
    layers: Vec<String>,
}

#[async_trait]
impl ExportStrategy for DecodeLikelyLayers {
    fn name(&self) -> &str {
        "decode-likely-layers"
    }

    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason> {
        for layer in &self.layers {
            match self.decoder.decode_features(input, Some(layer)).await {
                Ok(features) if !features.is_empty() => {
                    debug!(layer = %layer, features = features.len(), "Layer decoded");
                    return write_features(out, features);
                }
                Ok(_) => debug!(layer = %layer, "Layer empty"),
                Err(reason) => debug!(layer = %layer, reason = %reason, "Layer not decodable"),
            }
        }
        Err(Reason::new(format!("none of {:?} decoded", self.layers)))
    }
}

/// Generic conversion tool pointed at the archive
pub struct ConvertArchive {
    runner: Arc<dyn ToolRunner>,
    program: String,
}

#[async_trait]
impl ExportStrategy for ConvertArchive {
    fn name(&self) -> &str {
        "convert-archive"
    }

    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason> {
        let args = vec![
            "-f".to_string(),
            "GeoJSON".to_string(),
            path_arg(out),
            path_arg(input),
        ];
        let output = self.runner.run(&self.program, &args, None).await?;
        require_success(&self.program, output)?;
        Ok(out.to_path_buf())
    }
}

/// Last resort: decoder output scraped one feature object per line
pub struct ScrapeDecoderOutput(Decoder);

#[async_trait]
impl ExportStrategy for ScrapeDecoderOutput {
    fn name(&self) -> &str {
        "scrape-decoder-output"
    }

    async fn attempt(&self, input: &Path, out: &Path) -> Result<PathBuf, Reason> {
        let runner = &self.0.runner;
        // a failing exit still leaves usable lines on stdout
        let output = runner
            .run(&self.0.program, &[path_arg(input)], None)
            .await?;
        write_features(out, scrape_features(&output.stdout))
    }
}

/// The five extraction strategies in order, validated as GeoJSON
pub fn tile_chain(runner: Arc<dyn ToolRunner>, tools: &ToolsConfig, zoom: u8, layers: &[String]) -> FallbackChain {
    let decoder = || Decoder {
        runner: runner.clone(),
        program: tools.tippecanoe_decode.clone(),
        zoom,
    };

    FallbackChain::new(
        vec![
            Box::new(ExtractorStrategy {
                runner: runner.clone(),
                program: tools.tile_extractor.clone(),
            }),
            Box::new(DecodeAllLayers(decoder())),
            Box::new(DecodeLikelyLayers {
                decoder: decoder(),
                layers: layers.to_vec(),
            }),
            Box::new(ConvertArchive {
                runner: runner.clone(),
                program: tools.ogr2ogr.clone(),
            }),
            Box::new(ScrapeDecoderOutput(decoder())),
        ],
        validate_geojson,
    )
}
