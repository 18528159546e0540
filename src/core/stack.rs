//! Raster stack model: time slices on one grid plus static auxiliary layers

use crate::io::raster::RasterIo;
use crate::types::{GeoTransform, RoiError, RoiResult, WGS84_EPSG};
use chrono::{DateTime, Utc};
use geo::{Contains, MultiPolygon, Point};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Meters per degree of longitude at the equator
const METERS_PER_DEGREE_LON: f64 = 111_320.0;
/// Meters per degree of latitude
const METERS_PER_DEGREE_LAT: f64 = 110_540.0;

/// One time step read back from an export
#[derive(Debug, Clone)]
pub struct RasterSlice {
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub data: Array2<f32>,
    pub transform: GeoTransform,
}

/// Static layer merged onto the stack grid, or the reason it is missing
#[derive(Debug, Clone, PartialEq)]
pub enum AuxiliaryLayer {
    Loaded {
        name: String,
        unit: String,
        data: Array2<f32>,
    },
    Omitted {
        name: String,
        reason: String,
    },
}

impl AuxiliaryLayer {
    pub fn name(&self) -> &str {
        match self {
            AuxiliaryLayer::Loaded { name, .. } | AuxiliaryLayer::Omitted { name, .. } => name,
        }
    }

    pub fn data(&self) -> Option<&Array2<f32>> {
        match self {
            AuxiliaryLayer::Loaded { data, .. } => Some(data),
            AuxiliaryLayer::Omitted { .. } => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, AuxiliaryLayer::Loaded { .. })
    }
}

/// Descriptive metadata attached when an export is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub resolution_m: f64,
    pub source_url: String,
    pub comment: String,
    /// Class code -> class name, for categorical sources
    pub legend: Option<BTreeMap<i32, String>>,
    /// Layer name -> "loaded" or "omitted: <reason>"
    pub auxiliary_status: BTreeMap<String, String>,
}

impl Default for StackMetadata {
    fn default() -> Self {
        Self {
            title: String::new(),
            created_at: Utc::now(),
            resolution_m: 0.0,
            source_url: String::new(),
            comment: String::new(),
            legend: None,
            auxiliary_status: BTreeMap::new(),
        }
    }
}

/// (time, row, col) cube sharing a single geotransform
#[derive(Debug, Clone)]
pub struct RasterStack {
    pub data: Array3<f32>,
    pub timestamps: Vec<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub transform: GeoTransform,
    pub epsg: u32,
    pub auxiliary: Vec<AuxiliaryLayer>,
    pub metadata: StackMetadata,
}

impl RasterStack {
    /// Concatenate slices along time. Every slice must have the first slice's
    /// shape and geotransform.
    pub fn from_slices(slices: Vec<RasterSlice>, epsg: u32) -> RoiResult<Self> {
        let first = slices
            .first()
            .ok_or_else(|| RoiError::InvalidInput("No raster slices to stack".to_string()))?;
        let expected = first.data.dim();
        let transform = first.transform;

        for slice in &slices {
            let found = slice.data.dim();
            if found != expected {
                return Err(RoiError::InconsistentGridShape {
                    label: slice.label.clone(),
                    expected,
                    found,
                });
            }
            if !slice.transform.approx_eq(&transform, 1e-9) {
                return Err(RoiError::InconsistentGridTransform {
                    label: slice.label.clone(),
                });
            }
        }

        let (rows, cols) = expected;
        let mut data = Array3::<f32>::from_elem((slices.len(), rows, cols), f32::NAN);
        let mut timestamps = Vec::with_capacity(slices.len());
        let mut labels = Vec::with_capacity(slices.len());

        for (i, slice) in slices.into_iter().enumerate() {
            data.index_axis_mut(Axis(0), i).assign(&slice.data);
            timestamps.push(slice.timestamp);
            labels.push(slice.label);
        }

        log::debug!("Stacked {} slices of {}x{}", labels.len(), rows, cols);

        Ok(Self {
            data,
            timestamps,
            labels,
            transform,
            epsg,
            auxiliary: Vec::new(),
            metadata: StackMetadata::default(),
        })
    }

    /// (rows, cols) of every slice
    pub fn grid_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.data.dim();
        (rows, cols)
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn slice(&self, index: usize) -> Option<Array2<f32>> {
        if index < self.len() {
            Some(self.data.index_axis(Axis(0), index).to_owned())
        } else {
            None
        }
    }

    pub fn auxiliary_layer(&self, name: &str) -> Option<&AuxiliaryLayer> {
        self.auxiliary.iter().find(|layer| layer.name() == name)
    }

    /// Resample a raster onto this stack's grid
    pub fn resample_onto(&self, data: &Array2<f32>, transform: &GeoTransform) -> Array2<f32> {
        resample_to_grid(data, transform, &self.transform, self.grid_shape())
    }

    /// Record an auxiliary layer; loaded layers must already sit on the stack grid
    pub fn push_auxiliary(&mut self, layer: AuxiliaryLayer) -> RoiResult<()> {
        if let AuxiliaryLayer::Loaded { name, data, .. } = &layer {
            if data.dim() != self.grid_shape() {
                return Err(RoiError::InconsistentGridShape {
                    label: name.clone(),
                    expected: self.grid_shape(),
                    found: data.dim(),
                });
            }
        }

        let status = match &layer {
            AuxiliaryLayer::Loaded { .. } => "loaded".to_string(),
            AuxiliaryLayer::Omitted { reason, .. } => format!("omitted: {}", reason),
        };
        self.metadata.auxiliary_status.insert(layer.name().to_string(), status);
        self.auxiliary.push(layer);
        Ok(())
    }

    /// Write one band per time slice
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> RoiResult<()> {
        log::info!("Writing {} slices to {}", self.len(), path.as_ref().display());
        RasterIo::write_bands(&self.data, &self.transform, self.epsg, path)
    }
}

/// Set pixels whose centers fall outside the region to NaN
pub fn clip_to_region(data: &mut Array2<f32>, transform: &GeoTransform, region: &MultiPolygon<f64>) {
    for ((row, col), value) in data.indexed_iter_mut() {
        let (x, y) = transform.pixel_center(row, col);
        if !region.contains(&Point::new(x, y)) {
            *value = f32::NAN;
        }
    }
}

/// Resample onto a target grid using bilinear interpolation on pixel centers.
///
/// Falls back to the nearest source pixel where a bilinear neighbour is NaN or
/// at the last row/column; targets outside the source extent are NaN.
pub fn resample_to_grid(
    source: &Array2<f32>,
    source_transform: &GeoTransform,
    target_transform: &GeoTransform,
    target_shape: (usize, usize),
) -> Array2<f32> {
    log::debug!("Resampling to target grid {:?}", target_shape);

    let (target_height, target_width) = target_shape;
    let (source_height, source_width) = source.dim();
    let mut resampled = Array2::from_elem(target_shape, f32::NAN);

    if source_height == 0 || source_width == 0 {
        return resampled;
    }

    for i in 0..target_height {
        for j in 0..target_width {
            let (x, y) = target_transform.pixel_center(i, j);
            let (source_row, source_col) = source_transform.to_pixel(x, y);

            if source_row < -0.5
                || source_col < -0.5
                || source_row > source_height as f64 - 0.5
                || source_col > source_width as f64 - 0.5
            {
                continue;
            }

            let r = source_row.max(0.0);
            let c = source_col.max(0.0);
            let y1 = (r.floor() as usize).min(source_height - 1);
            let x1 = (c.floor() as usize).min(source_width - 1);
            let y2 = (y1 + 1).min(source_height - 1);
            let x2 = (x1 + 1).min(source_width - 1);

            let v11 = source[[y1, x1]];
            let v12 = source[[y2, x1]];
            let v21 = source[[y1, x2]];
            let v22 = source[[y2, x2]];

            if [v11, v12, v21, v22].iter().all(|v| !v.is_nan()) {
                let dx = (c - x1 as f64).clamp(0.0, 1.0);
                let dy = (r - y1 as f64).clamp(0.0, 1.0);
                let interpolated = v11 as f64 * (1.0 - dx) * (1.0 - dy)
                    + v21 as f64 * dx * (1.0 - dy)
                    + v12 as f64 * (1.0 - dx) * dy
                    + v22 as f64 * dx * dy;
                resampled[[i, j]] = interpolated as f32;
            } else {
                let nearest_row = (source_row.round().max(0.0) as usize).min(source_height - 1);
                let nearest_col = (source_col.round().max(0.0) as usize).min(source_width - 1);
                resampled[[i, j]] = source[[nearest_row, nearest_col]];
            }
        }
    }

    resampled
}

/// Ground pixel spacing (dx, dy) in meters
fn pixel_spacing_m(transform: &GeoTransform, shape: (usize, usize), epsg: u32) -> (f64, f64) {
    let dx = transform.pixel_width.abs();
    let dy = transform.pixel_height.abs();
    if epsg != WGS84_EPSG {
        return (dx, dy);
    }
    let lat = transform.extent(shape).center_lat().to_radians();
    (dx * METERS_PER_DEGREE_LON * lat.cos(), dy * METERS_PER_DEGREE_LAT)
}

/// Slope and aspect in degrees from an elevation grid using central differences.
///
/// Aspect is the compass direction of steepest descent, clockwise from north;
/// flat cells have NaN aspect.
pub fn slope_aspect(
    dem: &Array2<f32>,
    transform: &GeoTransform,
    epsg: u32,
) -> RoiResult<(Array2<f32>, Array2<f32>)> {
    log::debug!("Calculating slope and aspect from elevation");

    let (height, width) = dem.dim();
    if height < 3 || width < 3 {
        return Err(RoiError::Processing(format!(
            "Elevation grid {}x{} too small for terrain derivation",
            height, width
        )));
    }

    let (dx, dy) = pixel_spacing_m(transform, (height, width), epsg);
    let mut slope = Array2::from_elem((height, width), f32::NAN);
    let mut aspect = Array2::from_elem((height, width), f32::NAN);

    for i in 1..height - 1 {
        for j in 1..width - 1 {
            let dz_east = (dem[[i, j + 1]] as f64 - dem[[i, j - 1]] as f64) / (2.0 * dx);
            // Row index grows southward
            let dz_north = (dem[[i - 1, j]] as f64 - dem[[i + 1, j]] as f64) / (2.0 * dy);

            if dz_east.is_nan() || dz_north.is_nan() {
                continue;
            }

            slope[[i, j]] = (dz_east * dz_east + dz_north * dz_north).sqrt().atan().to_degrees() as f32;

            if dz_east != 0.0 || dz_north != 0.0 {
                let bearing = (-dz_east).atan2(-dz_north).to_degrees();
                aspect[[i, j]] = bearing.rem_euclid(360.0) as f32;
            }
        }
    }

    fill_edge_values(&mut slope);
    fill_edge_values(&mut aspect);

    Ok((slope, aspect))
}

/// Copy the nearest interior row/column onto the border
fn fill_edge_values(array: &mut Array2<f32>) {
    let (height, width) = array.dim();

    for j in 0..width {
        array[[0, j]] = array[[1, j]];
        array[[height - 1, j]] = array[[height - 2, j]];
    }

    for i in 0..height {
        array[[i, 0]] = array[[i, 1]];
        array[[i, width - 1]] = array[[i, width - 2]];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn slice(label: &str, shape: (usize, usize)) -> RasterSlice {
        RasterSlice {
            label: label.to_string(),
            timestamp: Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap(),
            data: Array2::from_elem(shape, 1.0),
            transform: GeoTransform::north_up(0.0, 0.0, 1.0, 1.0),
        }
    }

    #[test]
    fn test_stack_keeps_slice_order() {
        let stack = RasterStack::from_slices(vec![slice("2000", (2, 3)), slice("2001", (2, 3))], 4326).unwrap();
        assert_eq!(stack.data.dim(), (2, 2, 3));
        assert_eq!(stack.labels, vec!["2000", "2001"]);
    }

    #[test]
    fn test_auxiliary_layer_must_match_grid() {
        let mut stack = RasterStack::from_slices(vec![slice("2000", (2, 3))], 4326).unwrap();
        let bad = AuxiliaryLayer::Loaded {
            name: "elevation".into(),
            unit: "m".into(),
            data: Array2::zeros((3, 3)),
        };
        assert!(matches!(
            stack.push_auxiliary(bad),
            Err(RoiError::InconsistentGridShape { .. })
        ));
        stack
            .push_auxiliary(AuxiliaryLayer::Omitted {
                name: "slope".into(),
                reason: "service down".into(),
            })
            .unwrap();
        assert_eq!(stack.metadata.auxiliary_status["slope"], "omitted: service down");
    }

    #[test]
    fn test_resample_identity_grid() {
        let transform = GeoTransform::north_up(10.0, 20.0, 0.5, 0.5);
        let source = Array2::from_shape_fn((4, 5), |(r, c)| (r * 10 + c) as f32);
        let out = resample_to_grid(&source, &transform, &transform, (4, 5));
        for ((r, c), v) in out.indexed_iter() {
            assert_relative_eq!(*v, source[[r, c]], epsilon = 1e-5);
        }
    }

    #[test]
    fn test_resample_upsampling_interpolates() {
        let coarse = GeoTransform::north_up(0.0, 2.0, 1.0, 1.0);
        let fine = GeoTransform::north_up(0.0, 2.0, 0.5, 0.5);
        let source = Array2::from_shape_vec((2, 2), vec![0.0, 2.0, 0.0, 2.0]).unwrap();
        let out = resample_to_grid(&source, &coarse, &fine, (4, 4));
        // Fine pixel centers at x = 0.75 and 1.25 sit between the coarse centers 0.5 and 1.5
        assert_relative_eq!(out[[1, 1]], 0.5, epsilon = 1e-5);
        assert_relative_eq!(out[[1, 2]], 1.5, epsilon = 1e-5);
    }

    #[test]
    fn test_slope_of_eastward_ramp() {
        let transform = GeoTransform::north_up(0.0, 0.0, 30.0, 30.0);
        let dem = Array2::from_shape_fn((5, 5), |(_, c)| (c as f32) * 30.0);
        let (slope, aspect) = slope_aspect(&dem, &transform, 32723).unwrap();
        assert_relative_eq!(slope[[2, 2]], 45.0, epsilon = 1e-4);
        assert_relative_eq!(slope[[0, 0]], 45.0, epsilon = 1e-4);
        // Terrain rises to the east, so it faces west
        assert_relative_eq!(aspect[[2, 2]], 270.0, epsilon = 1e-4);
    }

    #[test]
    fn test_slope_needs_three_by_three() {
        let transform = GeoTransform::north_up(0.0, 0.0, 30.0, 30.0);
        assert!(slope_aspect(&Array2::zeros((2, 5)), &transform, 32723).is_err());
    }
}
