//! Region extraction modules

pub mod region;
pub mod descriptor;
pub mod sensor;
pub mod query;
pub mod table;
pub mod timeseries;
pub mod stack;
pub mod exporter;
pub mod workdir;

// Re-export main types
pub use region::{Region, RegionFeature};
pub use descriptor::{RegionDescription, RegionDescriptor, Resolutions};
pub use sensor::{CloudMask, SensorFamily, SensorMetadata, SpectralIndex};
pub use query::{ImageMetadata, QueryAdapter};
pub use table::{TableRow, TimeSeriesTable};
pub use timeseries::{Cadence, ClimateCollection, ImageRef, TimeBucket, TimeSeriesExtractor, VariableSeriesRequest};
pub use stack::{AuxiliaryLayer, RasterSlice, RasterStack, StackMetadata};
pub use exporter::{RasterStackExporter, StackExport, StackRequest, StackSource};
pub use workdir::{CleanupOutcome, RetryPolicy, WorkingDir};
