//! Imagery service collaborator
//!
//! The remote imagery service is consumed through the [`ImageryService`]
//! trait: reduce an image expression over a region, enumerate images, read
//! image metadata and export a clipped raster to a local file.

use crate::core::region::Region;
use crate::core::sensor::CloudMask;
use crate::types::{RoiResult, Statistic};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Pixel-wise aggregation applied across the images of a composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalReducer {
    Sum,
    Mean,
}

/// Image expression evaluated by the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ImageSource {
    /// One band of a single image or asset
    #[serde(rename_all = "camelCase")]
    Band { image_id: String, band: String },
    /// Normalized-difference spectral index computed on a single image
    #[serde(rename_all = "camelCase")]
    SpectralIndex { image_id: String, index: String },
    /// Binary clear-sky mask (1 = clear, 0 = cloud) of a single image
    #[serde(rename_all = "camelCase")]
    ClearSkyMask { image_id: String, mask: CloudMask },
    /// Temporal composite of one band over a half-open date range
    #[serde(rename_all = "camelCase")]
    Composite {
        collection_id: String,
        band: String,
        start: NaiveDate,
        end: NaiveDate,
        reducer: TemporalReducer,
    },
}

/// One spatial reduction: statistics of `variable` over `region`
#[derive(Debug, Clone)]
pub struct ReductionRequest<'a> {
    pub source: ImageSource,
    /// Name used as the prefix of result keys
    pub variable: String,
    pub region: &'a Region,
    /// Ground sampling distance in meters
    pub scale: f64,
    pub statistics: Vec<Statistic>,
    pub max_pixels: u64,
}

impl<'a> ReductionRequest<'a> {
    /// Result key for one statistic, `"{variable}_{statistic}"`
    pub fn key(&self, statistic: Statistic) -> String {
        format!("{}_{}", self.variable, statistic.key())
    }
}

/// Bounds and date filter over a collection
#[derive(Debug, Clone)]
pub struct CollectionQuery<'a> {
    pub collection_id: String,
    pub region: &'a Region,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

/// Raster export clipped to a region
#[derive(Debug, Clone)]
pub struct ExportRequest<'a> {
    pub source: ImageSource,
    pub region: &'a Region,
    pub scale: f64,
    pub epsg: u32,
}

/// Band catalog and raw properties of an image or asset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    #[serde(default)]
    pub bands: Vec<String>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Values returned by a reduction, keyed `"{variable}_{statistic}"`
pub type ReductionValues = BTreeMap<String, Option<f64>>;

/// Narrow interface to the remote imagery service.
///
/// Every call is a blocking round trip; implementations must enforce their
/// own timeouts.
pub trait ImageryService {
    /// Reduce an image expression over a region
    fn reduce_region(&self, request: &ReductionRequest<'_>) -> RoiResult<ReductionValues>;

    /// Identifiers of images intersecting the query, in service order
    fn list_image_ids(&self, query: &CollectionQuery<'_>) -> RoiResult<Vec<String>>;

    /// Band names and properties of an image or asset
    fn image_info(&self, image_id: &str) -> RoiResult<ImageInfo>;

    /// Area in square meters of the intersection between an image footprint and a region
    fn intersection_area(&self, image_id: &str, region: &Region) -> RoiResult<f64>;

    /// Export a single-band GeoTIFF clipped to the region into `destination`
    fn export_image(&self, request: &ExportRequest<'_>, destination: &Path) -> RoiResult<()>;
}
