//! Region of interest model
//!
//! A region is always expressed in geographic WGS84 (EPSG:4326, lon/lat order).
//! Callers hold one of three shapes: a bare geometry, a single feature with
//! properties, or a collection of features.

use crate::types::{BoundingBox, PropertyValue, RoiError, RoiResult, WGS84_EPSG};
use geo::{BooleanOps, BoundingRect, Contains, Geometry, MultiPolygon, Point, Polygon};
use std::collections::BTreeMap;

/// One geometry with its named properties
#[derive(Debug, Clone, PartialEq)]
pub struct RegionFeature {
    pub geometry: Geometry<f64>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl RegionFeature {
    pub fn new(geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            geometry: geometry.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Region of interest in EPSG:4326
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    /// Bare geometry without properties
    Geometry(Geometry<f64>),
    /// Single feature
    Feature(RegionFeature),
    /// Multi-feature collection
    Collection(Vec<RegionFeature>),
}

impl Region {
    /// Region from a bare polygon
    pub fn from_polygon(polygon: Polygon<f64>) -> Self {
        Region::Geometry(Geometry::Polygon(polygon))
    }

    /// Axis-aligned rectangle, handy for quick regions
    pub fn from_bbox(bbox: &BoundingBox) -> Self {
        let rect = geo::Rect::new(
            geo::coord! { x: bbox.min_lon, y: bbox.min_lat },
            geo::coord! { x: bbox.max_lon, y: bbox.max_lat },
        );
        Region::Geometry(Geometry::Polygon(rect.to_polygon()))
    }

    /// Regions are normalized to WGS84 before they enter the crate
    pub fn epsg(&self) -> u32 {
        WGS84_EPSG
    }

    /// View every shape as a list of features
    pub fn features(&self) -> Vec<RegionFeature> {
        match self {
            Region::Geometry(geometry) => vec![RegionFeature::new(geometry.clone())],
            Region::Feature(feature) => vec![feature.clone()],
            Region::Collection(features) => features.clone(),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Region::Collection(_))
    }

    /// Polygonal parts of every feature, merged into one multipolygon
    pub fn combined_geometry(&self) -> RoiResult<MultiPolygon<f64>> {
        let mut polygons = Vec::new();
        for feature in self.features() {
            collect_polygons(&feature.geometry, &mut polygons);
        }

        if polygons.is_empty() {
            return Err(RoiError::EmptyOrInvalidGeometry(
                "region has no polygonal geometry".to_string(),
            ));
        }

        if polygons.len() == 1 {
            return Ok(MultiPolygon(polygons));
        }

        // Dissolve overlaps so shared area is not counted twice
        let mut combined = MultiPolygon(vec![polygons[0].clone()]);
        for polygon in polygons.iter().skip(1) {
            combined = combined.union(&MultiPolygon(vec![polygon.clone()]));
        }
        Ok(combined)
    }

    /// Bounding box over all features; `None` for empty regions
    pub fn bounds(&self) -> Option<BoundingBox> {
        let mut bbox: Option<BoundingBox> = None;
        for feature in self.features() {
            if let Some(rect) = feature.geometry.bounding_rect() {
                let next = BoundingBox {
                    min_lon: rect.min().x,
                    max_lon: rect.max().x,
                    min_lat: rect.min().y,
                    max_lat: rect.max().y,
                };
                bbox = Some(match bbox {
                    None => next,
                    Some(b) => BoundingBox {
                        min_lon: b.min_lon.min(next.min_lon),
                        max_lon: b.max_lon.max(next.max_lon),
                        min_lat: b.min_lat.min(next.min_lat),
                        max_lat: b.max_lat.max(next.max_lat),
                    },
                });
            }
        }
        bbox
    }

    /// Point-in-region test on the combined polygonal geometry
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        match self.combined_geometry() {
            Ok(geometry) => geometry.contains(&Point::new(lon, lat)),
            Err(_) => false,
        }
    }
}

impl From<Polygon<f64>> for Region {
    fn from(polygon: Polygon<f64>) -> Self {
        Region::from_polygon(polygon)
    }
}

fn collect_polygons(geometry: &Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geometry {
        Geometry::Polygon(p) => out.push(p.clone()),
        Geometry::MultiPolygon(mp) => out.extend(mp.0.iter().cloned()),
        Geometry::Rect(r) => out.push(r.to_polygon()),
        Geometry::Triangle(t) => out.push(t.to_polygon()),
        Geometry::GeometryCollection(gc) => {
            for g in gc.iter() {
                collect_polygons(g, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    #[test]
    fn test_bounds_over_collection() {
        let region = Region::Collection(vec![
            RegionFeature::new(square(-46.0, -21.0, 0.5)),
            RegionFeature::new(square(-45.0, -20.0, 0.5)),
        ]);
        let bbox = region.bounds().unwrap();
        assert_eq!(bbox.min_lon, -46.0);
        assert_eq!(bbox.max_lon, -44.5);
        assert_eq!(bbox.min_lat, -21.0);
        assert_eq!(bbox.max_lat, -19.5);
    }

    #[test]
    fn test_combined_geometry_rejects_points() {
        let region = Region::Geometry(Geometry::Point(Point::new(0.0, 0.0)));
        assert!(matches!(
            region.combined_geometry(),
            Err(RoiError::EmptyOrInvalidGeometry(_))
        ));
    }

    #[test]
    fn test_contains() {
        let region = Region::from_polygon(square(10.0, 10.0, 1.0));
        assert!(region.contains(10.5, 10.5));
        assert!(!region.contains(12.0, 10.5));
    }
}
