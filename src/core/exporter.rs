//! Raster stack exporter
//!
//! Runs `ValidateRegion -> ExportYears -> Elevation -> Terrain -> Finalize ->
//! Cleanup` for one request. Each retained year is exported into a private
//! working directory, read back, clipped to the region polygon and stacked.
//! Auxiliary layers are best effort: a failure is recorded as an omitted
//! layer. The working directory is removed on every path, success or not.

use crate::core::region::Region;
use crate::core::stack::{clip_to_region, slope_aspect, AuxiliaryLayer, RasterSlice, RasterStack};
use crate::core::workdir::{CleanupOutcome, RetryPolicy, WorkingDir};
use crate::io::raster::{RasterIo, RasterLayer};
use crate::io::service::{ExportRequest, ImageSource, ImageryService};
use crate::types::{RoiError, RoiResult, WGS84_EPSG};
use chrono::{TimeZone, Utc};
use geo::MultiPolygon;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Annual land-cover asset with one `classification_<YEAR>` band per year
pub const LAND_COVER_ASSET: &str =
    "projects/mapbiomas-public/assets/brazil/lulc/collection9/mapbiomas_collection90_integration_v1";
pub const LAND_COVER_URL: &str = "https://brasil.mapbiomas.org";
/// SRTM 1 arc-second elevation
pub const ELEVATION_ASSET: &str = "USGS/SRTMGL1_003";
pub const ELEVATION_BAND: &str = "elevation";

const LAND_COVER_CLASSES: [(i32, &str); 37] = [
    (1, "Forest"),
    (3, "Forest Formation"),
    (4, "Savanna Formation"),
    (5, "Mangrove"),
    (6, "Floodable Forest"),
    (49, "Wooded Sandbank Vegetation"),
    (10, "Herbaceous and Shrubby Vegetation"),
    (11, "Wetland"),
    (12, "Grassland"),
    (32, "Hypersaline Tidal Flat"),
    (29, "Rocky Outcrop"),
    (50, "Herbaceous Sandbank Vegetation"),
    (14, "Farming"),
    (15, "Pasture"),
    (18, "Agriculture"),
    (19, "Temporary Crop"),
    (39, "Soybean"),
    (20, "Sugar cane"),
    (40, "Rice"),
    (62, "Cotton"),
    (41, "Other Temporary Crops"),
    (36, "Perennial Crop"),
    (46, "Coffee"),
    (47, "Citrus"),
    (35, "Palm Oil"),
    (48, "Other Perennial Crops"),
    (9, "Forest Plantation"),
    (21, "Mosaic of Uses"),
    (22, "Non vegetated area"),
    (23, "Beach, Dune and Sand Spot"),
    (24, "Urban Area"),
    (30, "Mining"),
    (25, "Other non Vegetated Areas"),
    (26, "Water"),
    (33, "River, Lake and Ocean"),
    (31, "Aquaculture"),
    (27, "Not Observed"),
];

/// Class code -> name for the land-cover preset
pub fn land_cover_legend() -> BTreeMap<i32, String> {
    LAND_COVER_CLASSES
        .iter()
        .map(|(code, name)| (*code, name.to_string()))
        .collect()
}

/// Asset exported year by year
#[derive(Debug, Clone, PartialEq)]
pub struct StackSource {
    pub asset_id: String,
    /// Band for year Y is named `<band_prefix><Y>`
    pub band_prefix: String,
    pub title: String,
    pub source_url: String,
    pub legend: Option<BTreeMap<i32, String>>,
}

impl StackSource {
    pub fn new(asset_id: &str, band_prefix: &str) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            band_prefix: band_prefix.to_string(),
            title: asset_id.to_string(),
            source_url: String::new(),
            legend: None,
        }
    }

    /// Annual land-cover classification with its class legend
    pub fn land_cover() -> Self {
        Self {
            asset_id: LAND_COVER_ASSET.to_string(),
            band_prefix: "classification_".to_string(),
            title: "MapBiomas land use and land cover".to_string(),
            source_url: LAND_COVER_URL.to_string(),
            legend: Some(land_cover_legend()),
        }
    }

    pub fn band_for_year(&self, year: i32) -> String {
        format!("{}{}", self.band_prefix, year)
    }

    /// Years that have a band in the asset's catalog
    pub fn available_years<S: AsRef<str>>(&self, bands: &[S]) -> RoiResult<BTreeSet<i32>> {
        let pattern = format!(r"^{}(\d{{4}})$", regex::escape(&self.band_prefix));
        let re = Regex::new(&pattern)
            .map_err(|e| RoiError::Processing(format!("Invalid band pattern: {}", e)))?;

        Ok(bands
            .iter()
            .filter_map(|band| re.captures(band.as_ref()))
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| m.as_str().parse::<i32>().ok())
            .collect())
    }
}

/// Parameters of one stack export
#[derive(Debug, Clone)]
pub struct StackRequest<'a> {
    pub source: StackSource,
    pub region: &'a Region,
    pub years: Vec<i32>,
    /// Export resolution in meters
    pub scale: f64,
    pub epsg: u32,
    pub include_elevation: bool,
    pub include_terrain: bool,
    pub comment: String,
    /// Parent of the working directory; the system temp dir when `None`
    pub workdir_parent: Option<PathBuf>,
    pub cleanup_policy: RetryPolicy,
}

impl<'a> StackRequest<'a> {
    pub fn new(source: StackSource, region: &'a Region, years: Vec<i32>) -> Self {
        Self {
            source,
            region,
            years,
            scale: 30.0,
            epsg: WGS84_EPSG,
            include_elevation: false,
            include_terrain: false,
            comment: String::new(),
            workdir_parent: None,
            cleanup_policy: RetryPolicy::cleanup(),
        }
    }
}

/// Exported stack plus what happened along the way
#[derive(Debug)]
pub struct StackExport {
    pub stack: RasterStack,
    /// Requested years missing from the asset's band catalog
    pub dropped_years: Vec<i32>,
    pub cleanup: CleanupOutcome,
}

pub struct RasterStackExporter<'s> {
    service: &'s dyn ImageryService,
}

impl<'s> RasterStackExporter<'s> {
    pub fn new(service: &'s dyn ImageryService) -> Self {
        Self { service }
    }

    pub fn export(&self, request: &StackRequest<'_>) -> RoiResult<StackExport> {
        log::info!("Exporting {} for {} year(s)", request.source.asset_id, request.years.len());

        // ValidateRegion
        if request.region.bounds().is_none() {
            return Err(RoiError::EmptyOrInvalidGeometry("region has no bounds".to_string()));
        }
        let geometry = request.region.combined_geometry()?;
        if request.years.is_empty() {
            return Err(RoiError::InvalidInput("No years requested".to_string()));
        }

        let workdir = match &request.workdir_parent {
            Some(parent) => WorkingDir::create_in(parent, "roi_stack")?,
            None => WorkingDir::create("roi_stack")?,
        };

        let result = self.run(request, &geometry, &workdir);

        // Cleanup runs whatever happened above and is never fatal
        let cleanup = workdir.cleanup(&request.cleanup_policy);

        let (stack, dropped_years) = result?;
        Ok(StackExport {
            stack,
            dropped_years,
            cleanup,
        })
    }

    fn run(
        &self,
        request: &StackRequest<'_>,
        geometry: &MultiPolygon<f64>,
        workdir: &WorkingDir,
    ) -> RoiResult<(RasterStack, Vec<i32>)> {
        let source = &request.source;

        // ExportYears
        let catalog = self.service.image_info(&source.asset_id)?;
        let available = source.available_years(&catalog.bands)?;

        let mut retained = Vec::new();
        let mut dropped = Vec::new();
        for &year in &request.years {
            if available.contains(&year) {
                retained.push(year);
            } else {
                log::warn!("Year {} not available in {}, skipping", year, source.asset_id);
                dropped.push(year);
            }
        }

        if retained.is_empty() {
            return Err(RoiError::InvalidInput(format!(
                "None of the requested years are available in {}",
                source.asset_id
            )));
        }

        let mut slices = Vec::with_capacity(retained.len());
        for year in retained {
            let band = source.band_for_year(year);
            let layer = self.export_layer(request, &source.asset_id, &band, workdir)?;
            let mut data = layer.data;
            clip_to_region(&mut data, &layer.transform, geometry);

            let timestamp = Utc
                .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| RoiError::InvalidInput(format!("Invalid year {}", year)))?;

            log::debug!("Year {} exported with shape {:?}", year, data.dim());
            slices.push(RasterSlice {
                label: year.to_string(),
                timestamp,
                data,
                transform: layer.transform,
            });
        }

        let mut stack = RasterStack::from_slices(slices, request.epsg)?;

        // Elevation and Terrain share one export
        if request.include_elevation || request.include_terrain {
            self.add_auxiliary_layers(request, geometry, workdir, &mut stack)?;
        }

        // Finalize
        stack.metadata.title = source.title.clone();
        stack.metadata.created_at = Utc::now();
        stack.metadata.resolution_m = request.scale;
        stack.metadata.source_url = source.source_url.clone();
        stack.metadata.comment = request.comment.clone();
        stack.metadata.legend = source.legend.clone();

        Ok((stack, dropped))
    }

    fn export_layer(
        &self,
        request: &StackRequest<'_>,
        asset_id: &str,
        band: &str,
        workdir: &WorkingDir,
    ) -> RoiResult<RasterLayer> {
        let path = workdir.file(&format!("{}.tif", band));
        let export = ExportRequest {
            source: ImageSource::Band {
                image_id: asset_id.to_string(),
                band: band.to_string(),
            },
            region: request.region,
            scale: request.scale,
            epsg: request.epsg,
        };
        self.service.export_image(&export, &path)?;
        RasterIo::read_band(&path)
    }

    fn add_auxiliary_layers(
        &self,
        request: &StackRequest<'_>,
        geometry: &MultiPolygon<f64>,
        workdir: &WorkingDir,
        stack: &mut RasterStack,
    ) -> RoiResult<()> {
        let dem = match self.export_layer(request, ELEVATION_ASSET, ELEVATION_BAND, workdir) {
            Ok(dem) => dem,
            Err(e) => {
                log::warn!("Elevation layer omitted: {}", e);
                let reason = e.to_string();
                if request.include_elevation {
                    stack.push_auxiliary(omitted("elevation", &reason))?;
                }
                if request.include_terrain {
                    stack.push_auxiliary(omitted("slope", &reason))?;
                    stack.push_auxiliary(omitted("aspect", &reason))?;
                }
                return Ok(());
            }
        };

        let stack_transform = stack.transform;

        if request.include_elevation {
            let mut elevation = dem.data.clone();
            clip_to_region(&mut elevation, &dem.transform, geometry);
            let mut resampled = stack.resample_onto(&elevation, &dem.transform);
            clip_to_region(&mut resampled, &stack_transform, geometry);
            stack.push_auxiliary(AuxiliaryLayer::Loaded {
                name: "elevation".to_string(),
                unit: "m".to_string(),
                data: resampled,
            })?;
        }

        if request.include_terrain {
            // Derived on the native elevation grid, then brought onto the stack grid
            match slope_aspect(&dem.data, &dem.transform, dem.epsg) {
                Ok((slope, aspect)) => {
                    for (name, layer) in [("slope", slope), ("aspect", aspect)] {
                        let mut resampled = stack.resample_onto(&layer, &dem.transform);
                        clip_to_region(&mut resampled, &stack_transform, geometry);
                        stack.push_auxiliary(AuxiliaryLayer::Loaded {
                            name: name.to_string(),
                            unit: "degrees".to_string(),
                            data: resampled,
                        })?;
                    }
                }
                Err(e) => {
                    log::warn!("Terrain layers omitted: {}", e);
                    let reason = e.to_string();
                    stack.push_auxiliary(omitted("slope", &reason))?;
                    stack.push_auxiliary(omitted("aspect", &reason))?;
                }
            }
        }

        Ok(())
    }
}

fn omitted(name: &str, reason: &str) -> AuxiliaryLayer {
    AuxiliaryLayer::Omitted {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}
