//! Cloud-collection query adapter
//!
//! Builds reductions and collection listings against an [`ImageryService`]
//! and normalizes per-image sensor metadata.

use crate::core::region::Region;
use crate::core::sensor::{infer_scale, CloudMask, SensorFamily, SensorMetadata};
use crate::io::service::{
    CollectionQuery, ImageSource, ImageryService, ReductionRequest, ReductionValues,
};
use crate::types::{RoiResult, Statistic};
use chrono::{DateTime, NaiveDate, Utc};
use geo::GeodesicArea;
use serde::{Deserialize, Serialize};

/// Default cap on the number of images returned by a listing
pub const DEFAULT_MAX_IMAGES: usize = 500;
/// Default pixel budget for a single reduction
pub const DEFAULT_MAX_PIXELS: u64 = 1_000_000_000;

/// Normalized description of one image in a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub id: String,
    pub acquired: Option<DateTime<Utc>>,
    pub satellite: Option<String>,
    pub cloud_cover: Option<f64>,
    pub solar_elevation: Option<f64>,
    pub solar_azimuth: Option<f64>,
    /// Share of the region covered by the image footprint, in percent
    pub region_coverage: f64,
    /// Share of clear pixels over the region, in percent
    pub clear_sky: Option<f64>,
}

/// Acquisition time from the `system:time_start` property (epoch milliseconds)
pub fn acquisition_time(properties: &serde_json::Map<String, serde_json::Value>) -> Option<DateTime<Utc>> {
    properties
        .get("system:time_start")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Region area in square meters on the WGS84 ellipsoid
pub fn region_area_m2(region: &Region) -> RoiResult<f64> {
    Ok(region.combined_geometry()?.geodesic_area_unsigned())
}

/// Thin orchestration layer over an imagery service
pub struct QueryAdapter<'s> {
    service: &'s dyn ImageryService,
}

impl<'s> QueryAdapter<'s> {
    pub fn new(service: &'s dyn ImageryService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &'s dyn ImageryService {
        self.service
    }

    /// One reduction call; keys are `"{variable}_{statistic}"`
    pub fn reduce(
        &self,
        source: ImageSource,
        variable: &str,
        region: &Region,
        scale: f64,
        statistics: &[Statistic],
    ) -> RoiResult<ReductionValues> {
        self.reduce_with_budget(source, variable, region, scale, statistics, DEFAULT_MAX_PIXELS)
    }

    pub fn reduce_with_budget(
        &self,
        source: ImageSource,
        variable: &str,
        region: &Region,
        scale: f64,
        statistics: &[Statistic],
        max_pixels: u64,
    ) -> RoiResult<ReductionValues> {
        let request = ReductionRequest {
            source,
            variable: variable.to_string(),
            region,
            scale,
            statistics: statistics.to_vec(),
            max_pixels,
        };
        log::debug!("Reducing {} at {} m over region", variable, scale);
        let mut values = self.service.reduce_region(&request)?;

        // Keep the key set complete even if the service omits masked statistics
        for statistic in statistics {
            values.entry(request.key(*statistic)).or_insert(None);
        }
        Ok(values)
    }

    /// Up to `max_count` image ids intersecting the region and date range
    pub fn list_images(
        &self,
        collection_id: &str,
        region: &Region,
        date_range: Option<(NaiveDate, NaiveDate)>,
        max_count: usize,
    ) -> RoiResult<Vec<String>> {
        let query = CollectionQuery {
            collection_id: collection_id.to_string(),
            region,
            date_range,
        };
        let mut ids = self.service.list_image_ids(&query)?;
        if ids.len() > max_count {
            log::info!(
                "Collection {} has {} matching images, keeping the first {}",
                collection_id,
                ids.len(),
                max_count
            );
            ids.truncate(max_count);
        }
        Ok(ids)
    }

    /// Listing with normalized sensor metadata per image.
    ///
    /// A failed metadata read leaves that image's fields empty and a failed
    /// footprint intersection records 0 % coverage; the listing continues.
    /// Failures reading the collection itself are returned.
    pub fn image_catalog(
        &self,
        collection_id: &str,
        region: &Region,
        max_count: usize,
        date_range: Option<(NaiveDate, NaiveDate)>,
        compute_clear_sky: bool,
    ) -> RoiResult<Vec<ImageMetadata>> {
        let family = SensorFamily::from_collection_id(collection_id)?;
        let region_area = region_area_m2(region)?;
        let ids = self.list_images(collection_id, region, date_range, max_count)?;

        log::info!("Building catalog of {} images from {}", ids.len(), collection_id);

        let mut catalog = Vec::with_capacity(ids.len());
        for id in ids {
            let info = match self.service.image_info(&id) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::debug!("Metadata unavailable for {}: {}", id, e);
                    None
                }
            };
            let metadata = info
                .as_ref()
                .map(|info| SensorMetadata::from_properties(family, &info.properties));

            let region_coverage = match self.service.intersection_area(&id, region) {
                Ok(area) if region_area > 0.0 => area / region_area * 100.0,
                Ok(_) => 0.0,
                Err(e) => {
                    log::debug!("Intersection area failed for {}: {}", id, e);
                    0.0
                }
            };

            let clear_sky = match &info {
                Some(info) if compute_clear_sky => self.clear_sky_for_bands(&id, &info.bands, region),
                _ => None,
            };

            catalog.push(ImageMetadata {
                acquired: info.as_ref().and_then(|info| acquisition_time(&info.properties)),
                satellite: metadata.as_ref().and_then(|m| m.satellite().map(str::to_string)),
                cloud_cover: metadata.as_ref().and_then(|m| m.cloud_cover()),
                solar_elevation: metadata.as_ref().and_then(|m| m.solar_elevation()),
                solar_azimuth: metadata.as_ref().and_then(|m| m.solar_azimuth()),
                region_coverage,
                clear_sky,
                id,
            });
        }

        Ok(catalog)
    }

    /// Percentage of clear pixels over the region; `None` if it cannot be computed
    pub fn clear_sky_percentage(&self, image_id: &str, region: &Region) -> Option<f64> {
        match self.service.image_info(image_id) {
            Ok(info) => self.clear_sky_for_bands(image_id, &info.bands, region),
            Err(e) => {
                log::debug!("Could not read bands of {}: {}", image_id, e);
                None
            }
        }
    }

    fn clear_sky_for_bands(&self, image_id: &str, bands: &[String], region: &Region) -> Option<f64> {
        let mask = CloudMask::for_bands(bands)?;
        let scale = infer_scale(bands);

        let mut fraction = self.clear_fraction(image_id, mask, region, scale)?;

        // SCL can be unpopulated on older scenes; the probability band still works there
        if mask == CloudMask::SceneClassification
            && fraction == 0.0
            && bands.iter().any(|b| b == CloudMask::CloudProbability.band())
        {
            log::debug!("SCL left no clear pixel on {}, retrying with cloud probability", image_id);
            fraction = self.clear_fraction(image_id, CloudMask::CloudProbability, region, scale)?;
        }

        Some(round_to_tenth(fraction * 100.0))
    }

    fn clear_fraction(&self, image_id: &str, mask: CloudMask, region: &Region, scale: f64) -> Option<f64> {
        let source = ImageSource::ClearSkyMask {
            image_id: image_id.to_string(),
            mask,
        };
        match self.reduce(source, "clear", region, scale, &[Statistic::Mean]) {
            Ok(values) => values.get("clear_mean").copied().flatten(),
            Err(e) => {
                log::debug!("Clear-sky reduction failed for {}: {}", image_id, e);
                None
            }
        }
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_acquisition_time_from_millis() {
        let props = json!({"system:time_start": 1577836800000i64});
        let t = acquisition_time(props.as_object().unwrap()).unwrap();
        assert_eq!(t.to_rfc3339(), "2020-01-01T00:00:00+00:00");
        assert!(acquisition_time(&serde_json::Map::new()).is_none());
    }

    #[test]
    fn test_round_to_tenth() {
        assert_eq!(round_to_tenth(42.46), 42.5);
        assert_eq!(round_to_tenth(99.94), 99.9);
    }
}
