//! Export fallback chains and artifact publishing

pub mod chain;
pub mod geojson;
pub mod publish;
pub mod tiles;
pub mod validate;

pub use chain::{Accepted, ExportStrategy, FallbackChain};
pub use publish::{
    ArtifactKind, ArtifactNames, ArtifactWriter, BuiltTiles, OgrTippecanoe, PublishedArtifact, Publisher,
};
pub use tiles::tile_chain;
pub use validate::Reason;
