//! I/O modules for vector files, rasters and the remote services

pub mod vector;
pub mod raster;
pub mod service;
pub mod http_service;
pub mod memory;
pub mod sidra;

pub use vector::{VectorCodec, VectorFormat};
pub use raster::{RasterIo, RasterLayer};
pub use service::{ImageInfo, ImageSource, ImageryService, TemporalReducer};
pub use http_service::{HttpImageryService, ServiceConfig};
pub use memory::{InMemoryImageryService, MemoryImage};
pub use sidra::{SidraClient, SidraConfig};
