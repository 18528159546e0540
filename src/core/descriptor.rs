//! Region descriptor: area, perimeter and pixel estimates without raster data

use crate::core::region::Region;
use crate::types::{RoiError, RoiResult};
use geo::{GeodesicArea, Simplify};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Linear simplification tolerance used before measuring
pub const SIMPLIFY_TOLERANCE_M: f64 = 1.0;
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Resolutions in meters at which pixel counts are estimated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolutions(Vec<f64>);

impl Default for Resolutions {
    fn default() -> Self {
        Self(vec![10.0, 30.0, 60.0])
    }
}

impl Resolutions {
    pub fn new(values: Vec<f64>) -> RoiResult<Self> {
        if values.is_empty() {
            return Err(RoiError::InvalidResolutionType(
                "expected at least one resolution".to_string(),
            ));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v <= 0.0) {
            return Err(RoiError::InvalidResolutionType(format!(
                "resolution must be a positive number, got {}",
                bad
            )));
        }
        Ok(Self(values))
    }

    /// Accept a JSON number or an array of numbers
    pub fn from_json(value: &serde_json::Value) -> RoiResult<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) => Self::new(vec![v]),
                None => Err(RoiError::InvalidResolutionType(n.to_string())),
            },
            serde_json::Value::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| {
                        item.as_f64()
                            .ok_or_else(|| RoiError::InvalidResolutionType(item.to_string()))
                    })
                    .collect::<RoiResult<Vec<f64>>>()?;
                Self::new(values)
            }
            other => Err(RoiError::InvalidResolutionType(format!(
                "expected a number or a list of numbers, got {}",
                other
            ))),
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }
}

impl TryFrom<f64> for Resolutions {
    type Error = RoiError;

    fn try_from(value: f64) -> RoiResult<Self> {
        Self::new(vec![value])
    }
}

impl TryFrom<Vec<f64>> for Resolutions {
    type Error = RoiError;

    fn try_from(values: Vec<f64>) -> RoiResult<Self> {
        Self::new(values)
    }
}

impl TryFrom<&serde_json::Value> for Resolutions {
    type Error = RoiError;

    fn try_from(value: &serde_json::Value) -> RoiResult<Self> {
        Self::from_json(value)
    }
}

/// Estimated pixel count at one resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelEstimate {
    pub resolution_m: f64,
    pub pixels: u64,
}

impl PixelEstimate {
    pub fn label(&self) -> String {
        format!("{}m", self.resolution_m)
    }
}

/// Descriptive statistics of a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDescription {
    pub area_km2: f64,
    pub perimeter_km: f64,
    pub pixel_estimates: Vec<PixelEstimate>,
}

impl RegionDescription {
    pub fn area_m2(&self) -> f64 {
        self.area_km2 * 1e6
    }

    pub fn pixel_count(&self, resolution_m: f64) -> Option<u64> {
        self.pixel_estimates
            .iter()
            .find(|e| e.resolution_m == resolution_m)
            .map(|e| e.pixels)
    }

    /// Plain-text table, one row per measure
    pub fn to_table(&self) -> String {
        let mut rows: Vec<(String, String)> = vec![
            ("Area (km²)".to_string(), format!("{:.4}", self.area_km2)),
            ("Perimeter (km)".to_string(), format!("{:.4}", self.perimeter_km)),
        ];
        for estimate in &self.pixel_estimates {
            rows.push((format!("Pixels @ {}", estimate.label()), estimate.pixels.to_string()));
        }

        let width = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
        let mut out = String::new();
        for (key, value) in rows {
            let pad = width - key.chars().count();
            let _ = writeln!(out, "{}{}  {}", key, " ".repeat(pad), value);
        }
        out
    }
}

pub struct RegionDescriptor;

impl RegionDescriptor {
    /// Measure a region and estimate its pixel count at each resolution
    pub fn describe(region: &Region, resolutions: &Resolutions) -> RoiResult<RegionDescription> {
        let geometry = region.combined_geometry()?;

        let tolerance = SIMPLIFY_TOLERANCE_M / METERS_PER_DEGREE;
        let simplified = geometry.simplify(&tolerance);
        let measured = if simplified.0.is_empty() || simplified.geodesic_area_unsigned() == 0.0 {
            // Slivers can collapse under simplification
            geometry
        } else {
            simplified
        };

        let area_m2 = measured.geodesic_area_unsigned();
        let perimeter_m = measured.geodesic_perimeter();

        log::debug!("Region area {:.1} m², perimeter {:.1} m", area_m2, perimeter_m);

        let pixel_estimates = resolutions
            .values()
            .iter()
            .map(|&resolution_m| PixelEstimate {
                resolution_m,
                pixels: (area_m2 / (resolution_m * resolution_m)).round() as u64,
            })
            .collect();

        Ok(RegionDescription {
            area_km2: area_m2 / 1e6,
            perimeter_km: perimeter_m / 1e3,
            pixel_estimates,
        })
    }
}
