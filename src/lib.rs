//! roitools: region-of-interest extraction from cloud imagery services
//!
//! This library turns a vector region into tables and rasters: it reads and
//! writes region files, describes a region's size, queries an imagery
//! service for per-image or per-period statistics, and exports yearly
//! rasters clipped to the region as a time stack.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, ErrorKind, GeoTransform, PropertyValue, RoiError, RoiResult, Statistic,
};

pub use crate::core::{
    QueryAdapter, RasterStack, RasterStackExporter, Region, RegionDescriptor, TimeSeriesExtractor,
    TimeSeriesTable,
};
pub use io::{HttpImageryService, ImageryService, InMemoryImageryService, SidraClient, VectorCodec};
