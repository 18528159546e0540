//! In-process imagery service evaluated over in-memory grids.
//!
//! Images live on north-up EPSG:4326 grids. Reductions visit the pixels whose
//! centers fall inside the region and ignore NaN, which mirrors how the remote
//! service treats masked pixels. Used for offline runs and tests.

use crate::core::region::Region;
use crate::core::sensor::{SensorFamily, SpectralIndex};
use crate::io::raster::RasterIo;
use crate::io::service::{
    CollectionQuery, ExportRequest, ImageInfo, ImageSource, ImageryService, ReductionRequest,
    ReductionValues, TemporalReducer,
};
use crate::types::{GeoTransform, RoiError, RoiResult, WGS84_EPSG};
use chrono::{DateTime, Utc};
use geo::{BooleanOps, Contains, GeodesicArea, MultiPolygon, Point, Rect};
use ndarray::{s, Array2};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// One image or static asset held by [`InMemoryImageryService`]
#[derive(Debug, Clone)]
pub struct MemoryImage {
    pub id: String,
    pub collection_id: String,
    pub acquired: Option<DateTime<Utc>>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub transform: GeoTransform,
    pub bands: BTreeMap<String, Array2<f32>>,
}

impl MemoryImage {
    pub fn new(id: &str, collection_id: &str, transform: GeoTransform) -> Self {
        Self {
            id: id.to_string(),
            collection_id: collection_id.to_string(),
            acquired: None,
            properties: serde_json::Map::new(),
            transform,
            bands: BTreeMap::new(),
        }
    }

    pub fn acquired_at(mut self, acquired: DateTime<Utc>) -> Self {
        self.acquired = Some(acquired);
        self
    }

    pub fn with_band(mut self, name: &str, data: Array2<f32>) -> Self {
        self.bands.insert(name.to_string(), data);
        self
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    fn shape(&self) -> Option<(usize, usize)> {
        self.bands.values().next().map(|b| b.dim())
    }

    fn band(&self, name: &str) -> RoiResult<&Array2<f32>> {
        self.bands.get(name).ok_or_else(|| {
            RoiError::Service(format!("Image {} has no band '{}'", self.id, name))
        })
    }

    fn footprint(&self) -> Option<Rect<f64>> {
        let bbox = self.transform.extent(self.shape()?);
        Some(Rect::new(
            geo::coord! { x: bbox.min_lon, y: bbox.min_lat },
            geo::coord! { x: bbox.max_lon, y: bbox.max_lat },
        ))
    }
}

/// Imagery service backed by grids held in memory
#[derive(Debug, Default)]
pub struct InMemoryImageryService {
    images: Vec<MemoryImage>,
    failing_reductions: HashSet<String>,
    failing_intersections: HashSet<String>,
    failing_exports: HashSet<String>,
    failing_info: HashSet<String>,
}

impl InMemoryImageryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&mut self, image: MemoryImage) -> &mut Self {
        self.images.push(image);
        self
    }

    /// Make every reduction touching `image_id` fail
    pub fn fail_reductions_for(&mut self, image_id: &str) -> &mut Self {
        self.failing_reductions.insert(image_id.to_string());
        self
    }

    pub fn fail_intersection_for(&mut self, image_id: &str) -> &mut Self {
        self.failing_intersections.insert(image_id.to_string());
        self
    }

    pub fn fail_info_for(&mut self, image_id: &str) -> &mut Self {
        self.failing_info.insert(image_id.to_string());
        self
    }

    pub fn fail_exports_for(&mut self, image_id: &str) -> &mut Self {
        self.failing_exports.insert(image_id.to_string());
        self
    }

    fn image(&self, image_id: &str) -> RoiResult<&MemoryImage> {
        self.images
            .iter()
            .find(|image| image.id == image_id)
            .ok_or_else(|| RoiError::Service(format!("Image not found: {}", image_id)))
    }

    /// Evaluate an image expression to a grid and its transform
    fn evaluate(&self, source: &ImageSource) -> RoiResult<(Array2<f32>, GeoTransform)> {
        match source {
            ImageSource::Band { image_id, band } => {
                let image = self.image(image_id)?;
                Ok((image.band(band)?.clone(), image.transform))
            }
            ImageSource::SpectralIndex { image_id, index } => {
                let image = self.image(image_id)?;
                let index = SpectralIndex::from_name(index)?;
                let band_names: Vec<&String> = image.bands.keys().collect();
                let family = SensorFamily::from_bands(&band_names).ok_or_else(|| {
                    RoiError::Service(format!("Cannot tell the sensor of image {}", image_id))
                })?;
                let (positive, negative) = index.bands(family);
                let a = image.band(positive)?;
                let b = image.band(negative)?;
                let mut out = Array2::from_elem(a.dim(), f32::NAN);
                ndarray::Zip::from(&mut out)
                    .and(a)
                    .and(b)
                    .for_each(|o, &p, &n| *o = index.evaluate(p, n));
                Ok((out, image.transform))
            }
            ImageSource::ClearSkyMask { image_id, mask } => {
                let image = self.image(image_id)?;
                let band = image.band(mask.band())?;
                Ok((band.mapv(|v| mask.classify(v)), image.transform))
            }
            ImageSource::Composite {
                collection_id,
                band,
                start,
                end,
                reducer,
            } => {
                let members: Vec<&MemoryImage> = self
                    .images
                    .iter()
                    .filter(|image| &image.collection_id == collection_id)
                    .filter(|image| match image.acquired {
                        Some(t) => t.date_naive() >= *start && t.date_naive() < *end,
                        None => false,
                    })
                    .collect();

                let first = members.first().ok_or_else(|| {
                    RoiError::Service(format!(
                        "No images in {} between {} and {}",
                        collection_id, start, end
                    ))
                })?;

                let mut total = first.band(band)?.mapv(|v| v as f64);
                let mut count = Array2::<f64>::zeros(total.dim());
                count.zip_mut_with(&total, |c, v| *c = if v.is_nan() { 0.0 } else { 1.0 });
                total.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });

                for image in members.iter().skip(1) {
                    let data = image.band(band)?;
                    if data.dim() != total.dim() {
                        return Err(RoiError::Service(format!(
                            "Image {} does not share the collection grid",
                            image.id
                        )));
                    }
                    ndarray::Zip::from(&mut total)
                        .and(&mut count)
                        .and(data)
                        .for_each(|t, c, &v| {
                            if !v.is_nan() {
                                *t += v as f64;
                                *c += 1.0;
                            }
                        });
                }

                let mut out = Array2::from_elem(total.dim(), f32::NAN);
                ndarray::Zip::from(&mut out)
                    .and(&total)
                    .and(&count)
                    .for_each(|o, &t, &c| {
                        if c > 0.0 {
                            *o = match reducer {
                                TemporalReducer::Sum => t as f32,
                                TemporalReducer::Mean => (t / c) as f32,
                            };
                        }
                    });
                Ok((out, first.transform))
            }
        }
    }

    fn source_image_id(source: &ImageSource) -> Option<&str> {
        match source {
            ImageSource::Band { image_id, .. }
            | ImageSource::SpectralIndex { image_id, .. }
            | ImageSource::ClearSkyMask { image_id, .. } => Some(image_id),
            ImageSource::Composite { .. } => None,
        }
    }
}

/// Pixel values whose centers fall inside the region
fn values_in_region(data: &Array2<f32>, transform: &GeoTransform, region: &MultiPolygon<f64>) -> Vec<f64> {
    let (rows, cols) = data.dim();
    let mut values = Vec::new();
    for row in 0..rows {
        for col in 0..cols {
            let v = data[[row, col]];
            if v.is_nan() {
                continue;
            }
            let (x, y) = transform.pixel_center(row, col);
            if region.contains(&Point::new(x, y)) {
                values.push(v as f64);
            }
        }
    }
    values
}

impl ImageryService for InMemoryImageryService {
    fn reduce_region(&self, request: &ReductionRequest<'_>) -> RoiResult<ReductionValues> {
        if let Some(id) = Self::source_image_id(&request.source) {
            if self.failing_reductions.contains(id) {
                return Err(RoiError::Service(format!("Reduction failed for {}", id)));
            }
        }

        let (data, transform) = self.evaluate(&request.source)?;
        if data.len() as u64 > request.max_pixels {
            return Err(RoiError::Service(format!(
                "Too many pixels in the region: {} > maxPixels {}",
                data.len(),
                request.max_pixels
            )));
        }

        let region = request.region.combined_geometry()?;
        let values = values_in_region(&data, &transform, &region);

        let mut result = ReductionValues::new();
        for statistic in &request.statistics {
            result.insert(request.key(*statistic), statistic.compute(&values));
        }
        Ok(result)
    }

    fn list_image_ids(&self, query: &CollectionQuery<'_>) -> RoiResult<Vec<String>> {
        let bounds = query.region.bounds().ok_or_else(|| {
            RoiError::EmptyOrInvalidGeometry("region has no bounds".to_string())
        })?;

        Ok(self
            .images
            .iter()
            .filter(|image| image.collection_id == query.collection_id)
            .filter(|image| match image.shape() {
                Some(shape) => image.transform.extent(shape).intersects(&bounds),
                None => false,
            })
            .filter(|image| match (query.date_range, image.acquired) {
                (None, _) => true,
                (Some((start, end)), Some(t)) => t.date_naive() >= start && t.date_naive() < end,
                (Some(_), None) => false,
            })
            .map(|image| image.id.clone())
            .collect())
    }

    fn image_info(&self, image_id: &str) -> RoiResult<ImageInfo> {
        if self.failing_info.contains(image_id) {
            return Err(RoiError::Service(format!("Metadata unavailable for {}", image_id)));
        }
        let image = self.image(image_id)?;
        let mut properties = image.properties.clone();
        if let Some(t) = image.acquired {
            properties.insert("system:time_start".to_string(), t.timestamp_millis().into());
        }
        Ok(ImageInfo {
            id: image.id.clone(),
            bands: image.bands.keys().cloned().collect(),
            properties,
        })
    }

    fn intersection_area(&self, image_id: &str, region: &Region) -> RoiResult<f64> {
        if self.failing_intersections.contains(image_id) {
            return Err(RoiError::Service(format!("Intersection failed for {}", image_id)));
        }
        let image = self.image(image_id)?;
        let footprint = match image.footprint() {
            Some(rect) => MultiPolygon(vec![rect.to_polygon()]),
            None => return Ok(0.0),
        };
        let overlap = footprint.intersection(&region.combined_geometry()?);
        Ok(overlap.geodesic_area_unsigned())
    }

    fn export_image(&self, request: &ExportRequest<'_>, destination: &Path) -> RoiResult<()> {
        if let Some(id) = Self::source_image_id(&request.source) {
            if self.failing_exports.contains(id) {
                return Err(RoiError::Service(format!("Export failed for {}", id)));
            }
        }

        let (data, transform) = self.evaluate(&request.source)?;
        let bounds = request.region.bounds().ok_or_else(|| {
            RoiError::EmptyOrInvalidGeometry("region has no bounds".to_string())
        })?;
        let (rows, cols) = data.dim();

        // Window of pixels touching the region's bounding box
        let clamp = |v: f64, max: usize| v.max(0.0).min(max as f64) as usize;
        let col0 = clamp(((bounds.min_lon - transform.top_left_x) / transform.pixel_width).floor(), cols);
        let col1 = clamp(((bounds.max_lon - transform.top_left_x) / transform.pixel_width).ceil(), cols);
        let row0 = clamp(((bounds.max_lat - transform.top_left_y) / transform.pixel_height).floor(), rows);
        let row1 = clamp(((bounds.min_lat - transform.top_left_y) / transform.pixel_height).ceil(), rows);

        if col1 <= col0 || row1 <= row0 {
            return Err(RoiError::Service("Region does not overlap the image".to_string()));
        }

        let mut window = data.slice(s![row0..row1, col0..col1]).to_owned();
        let window_transform = GeoTransform {
            top_left_x: transform.top_left_x + col0 as f64 * transform.pixel_width,
            top_left_y: transform.top_left_y + row0 as f64 * transform.pixel_height,
            ..transform
        };

        let region = request.region.combined_geometry()?;
        for ((row, col), value) in window.indexed_iter_mut() {
            let (x, y) = window_transform.pixel_center(row, col);
            if !region.contains(&Point::new(x, y)) {
                *value = f32::NAN;
            }
        }

        if request.epsg != WGS84_EPSG {
            log::debug!("In-memory export ignores EPSG:{}, grids stay in EPSG:4326", request.epsg);
        }
        RasterIo::write_band(&window, &window_transform, WGS84_EPSG, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Statistic};
    use chrono::{NaiveDate, TimeZone};

    fn grid() -> GeoTransform {
        GeoTransform::north_up(0.0, 1.0, 0.1, 0.1)
    }

    fn region() -> Region {
        Region::from_bbox(&BoundingBox {
            min_lon: 0.0,
            max_lon: 1.0,
            min_lat: 0.0,
            max_lat: 1.0,
        })
    }

    #[test]
    fn test_mean_ignores_nan_pixels() {
        let mut data = Array2::from_elem((10, 10), 2.0f32);
        data[[0, 0]] = f32::NAN;
        let mut service = InMemoryImageryService::new();
        service.add_image(MemoryImage::new("img", "C", grid()).with_band("b", data));

        let region = region();
        let request = ReductionRequest {
            source: ImageSource::Band {
                image_id: "img".into(),
                band: "b".into(),
            },
            variable: "b".into(),
            region: &region,
            scale: 10.0,
            statistics: vec![Statistic::Mean, Statistic::StdDev],
            max_pixels: 1_000,
        };
        let values = service.reduce_region(&request).unwrap();
        assert_eq!(values["b_mean"], Some(2.0));
        assert_eq!(values["b_stdDev"], Some(0.0));
    }

    #[test]
    fn test_composite_sum_over_date_range() {
        let mut service = InMemoryImageryService::new();
        for day in 1..=3 {
            let t = Utc.with_ymd_and_hms(2021, 5, day, 0, 0, 0).unwrap();
            service.add_image(
                MemoryImage::new(&format!("d{}", day), "DAILY", grid())
                    .acquired_at(t)
                    .with_band("p", Array2::from_elem((10, 10), 1.5)),
            );
        }
        let source = ImageSource::Composite {
            collection_id: "DAILY".into(),
            band: "p".into(),
            start: NaiveDate::from_ymd_opt(2021, 5, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2021, 5, 3).unwrap(),
            reducer: TemporalReducer::Sum,
        };
        let (data, _) = service.evaluate(&source).unwrap();
        assert_eq!(data[[4, 4]], 3.0);
    }
}
