//! Geometry codec: regions to and from vector files and the cloud geometry model

use crate::core::region::{Region, RegionFeature};
use crate::types::{PropertyValue, RoiError, RoiResult, WGS84_EPSG};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::{FieldValue, Geometry as GdalGeometry, LayerAccess, ToGdal};
use gdal::LayerOptions;
use gdal::{Dataset, DriverManager};
use gdal_sys::{OGRFieldType, OGRwkbGeometryType};
use geo::Geometry;
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Component files bundled into a zipped Shapefile, in archive order
pub const SHAPEFILE_COMPONENTS: [&str; 5] = ["shp", "shx", "dbf", "prj", "cpg"];

/// Output formats supported by [`VectorCodec::export`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorFormat {
    GeoJson,
    /// Zipped Shapefile bundle
    Shapefile,
}

impl FromStr for VectorFormat {
    type Err = RoiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "geojson" => Ok(VectorFormat::GeoJson),
            "shp" => Ok(VectorFormat::Shapefile),
            _ => Err(RoiError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Reads and writes regions as GeoJSON, Shapefile and KML
pub struct VectorCodec;

impl VectorCodec {
    /// Write a region to disk and return the absolute output path.
    ///
    /// `path` is a base name; any extension is replaced by `.geojson` or
    /// `.zip`. Parent directories are created as needed.
    pub fn export<P: AsRef<Path>>(
        region: &Region,
        path: P,
        format: VectorFormat,
        wrap_geometry: bool,
    ) -> RoiResult<PathBuf> {
        let features = Self::exportable_features(region, wrap_geometry)?;
        let base = path.as_ref().with_extension("");

        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let output = match format {
            VectorFormat::GeoJson => {
                let output = base.with_extension("geojson");
                if output.exists() {
                    fs::remove_file(&output)?;
                }
                Self::write_layer(&output, "GeoJSON", &features)?;
                output
            }
            VectorFormat::Shapefile => Self::write_zipped_shapefile(&base, &features)?,
        };

        let absolute = fs::canonicalize(&output)?;
        log::info!("Exported region ({} features) to {}", features.len(), absolute.display());
        Ok(absolute)
    }

    /// Read a GeoJSON, Shapefile, zipped Shapefile, KML or KMZ file.
    ///
    /// Geometries are reprojected to EPSG:4326; files without a CRS are
    /// assumed to already be in EPSG:4326.
    pub fn import<P: AsRef<Path>>(path: P) -> RoiResult<Region> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RoiError::FileNotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let features = match extension.as_str() {
            "zip" | "kmz" => {
                // Extracted members live only as long as this scope
                let scratch = tempfile::Builder::new().prefix("roi_import_").tempdir()?;
                let member = if extension == "zip" {
                    Self::extract_archive(path, scratch.path(), "shp")?
                        .ok_or_else(|| RoiError::MissingShapefileInArchive(path.to_path_buf()))?
                } else {
                    Self::extract_archive(path, scratch.path(), "kml")?
                        .ok_or_else(|| RoiError::MissingKmlInArchive(path.to_path_buf()))?
                };
                Self::read_layers(&member)?
            }
            _ => Self::read_layers(path)?,
        };

        log::info!("Imported {} features from {}", features.len(), path.display());
        Ok(Region::Collection(features))
    }

    /// GeoJSON value handed to the imagery service for a region
    pub fn to_cloud_geometry(region: &Region) -> RoiResult<serde_json::Value> {
        let value = match region {
            Region::Geometry(geometry) => Self::geometry_to_json(geometry)?,
            Region::Feature(feature) => Self::feature_to_json(feature)?,
            Region::Collection(features) => {
                let features = features
                    .iter()
                    .map(Self::feature_to_json)
                    .collect::<RoiResult<Vec<_>>>()?;
                serde_json::json!({ "type": "FeatureCollection", "features": features })
            }
        };
        Ok(value)
    }

    /// Parse a GeoJSON geometry, feature or feature collection into a region
    pub fn from_cloud_geometry(value: &serde_json::Value) -> RoiResult<Region> {
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| RoiError::InvalidInput("GeoJSON object without 'type'".to_string()))?;

        match kind {
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .and_then(|f| f.as_array())
                    .ok_or_else(|| {
                        RoiError::InvalidInput("FeatureCollection without 'features'".to_string())
                    })?;
                let features = features
                    .iter()
                    .map(Self::feature_from_json)
                    .collect::<RoiResult<Vec<_>>>()?;
                Ok(Region::Collection(features))
            }
            "Feature" => Ok(Region::Feature(Self::feature_from_json(value)?)),
            _ => Ok(Region::Geometry(Self::geometry_from_json(value)?)),
        }
    }

    fn exportable_features(region: &Region, wrap_geometry: bool) -> RoiResult<Vec<RegionFeature>> {
        match region {
            Region::Geometry(geometry) => {
                if !matches!(geometry, Geometry::Polygon(_) | Geometry::MultiPolygon(_)) {
                    return Err(RoiError::InvalidGeometryKind(
                        "bare geometries must be Polygon or MultiPolygon".to_string(),
                    ));
                }
                if !wrap_geometry {
                    return Err(RoiError::InvalidGeometryKind(
                        "bare geometry must be wrapped as a feature for export".to_string(),
                    ));
                }
                Ok(vec![RegionFeature::new(geometry.clone())])
            }
            Region::Feature(feature) => Ok(vec![feature.clone()]),
            Region::Collection(features) => {
                if features.is_empty() {
                    return Err(RoiError::EmptyOrInvalidGeometry(
                        "feature collection is empty".to_string(),
                    ));
                }
                Ok(features.clone())
            }
        }
    }

    fn write_zipped_shapefile(base: &Path, features: &[RegionFeature]) -> RoiResult<PathBuf> {
        let stem = base
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RoiError::InvalidInput(format!("invalid output path {}", base.display())))?
            .to_string();

        // Component files are assembled in a scoped directory removed on drop
        let scratch = tempfile::Builder::new().prefix("roi_shp_").tempdir()?;
        let shp_path = scratch.path().join(format!("{}.shp", stem));
        Self::write_layer(&shp_path, "ESRI Shapefile", features)?;

        let zip_path = base.with_extension("zip");
        let file = fs::File::create(&zip_path)?;
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for ext in SHAPEFILE_COMPONENTS {
            let component = scratch.path().join(format!("{}.{}", stem, ext));
            if !component.exists() {
                log::debug!("Shapefile component .{} not produced, skipping", ext);
                continue;
            }
            writer.start_file(format!("{}.{}", stem, ext), options)?;
            let bytes = fs::read(&component)?;
            writer.write_all(&bytes)?;
        }
        writer.finish()?;

        Ok(zip_path)
    }

    /// Unpack every member into `target_dir`; returns the first with extension `wanted`
    fn extract_archive(zip_path: &Path, target_dir: &Path, wanted: &str) -> RoiResult<Option<PathBuf>> {
        let file = fs::File::open(zip_path)?;
        let mut archive = ZipArchive::new(file)?;
        let mut found: Option<PathBuf> = None;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(name) = entry.enclosed_name().and_then(|n| n.file_name()).map(PathBuf::from) else {
                continue;
            };
            if entry.is_dir() {
                continue;
            }
            let out_path = target_dir.join(&name);
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            fs::write(&out_path, buffer)?;

            let matches = name
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(wanted))
                .unwrap_or(false);
            if matches && found.is_none() {
                found = Some(out_path);
            }
        }

        Ok(found)
    }

    fn write_layer(path: &Path, driver_name: &str, features: &[RegionFeature]) -> RoiResult<()> {
        let driver = DriverManager::get_driver_by_name(driver_name)?;
        let mut dataset = driver.create_vector_only(path)?;
        let srs = wgs84()?;

        let layer_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("roi")
            .to_string();
        let geometry_type = if driver_name == "ESRI Shapefile" {
            shapefile_geometry_type(features)?
        } else {
            OGRwkbGeometryType::wkbUnknown
        };

        let mut layer = dataset.create_layer(LayerOptions {
            name: &layer_name,
            srs: Some(&srs),
            ty: geometry_type,
            ..Default::default()
        })?;

        let schema = field_schema(features);
        let definitions: Vec<(&str, OGRFieldType::Type)> =
            schema.iter().map(|(name, ty)| (name.as_str(), *ty)).collect();
        if !definitions.is_empty() {
            layer.create_defn_fields(&definitions)?;
        }

        for feature in features {
            let geometry = feature.geometry.to_gdal()?;
            let names: Vec<&str> = feature.properties.keys().map(|k| k.as_str()).collect();
            let values: Vec<FieldValue> = feature
                .properties
                .values()
                .map(property_to_field)
                .collect();
            layer.create_feature_fields(geometry, &names, &values)?;
        }

        log::debug!("Wrote {} features with {} driver to {}", features.len(), driver_name, path.display());
        Ok(())
    }

    fn read_layers(path: &Path) -> RoiResult<Vec<RegionFeature>> {
        let dataset = Dataset::open(path)?;
        let target = wgs84()?;
        let mut features = Vec::new();

        for mut layer in dataset.layers() {
            let transform = match layer.spatial_ref() {
                Some(source) if !is_wgs84(&source) => {
                    set_traditional_axis_order(&source);
                    log::debug!("Reprojecting layer '{}' to EPSG:{}", layer.name(), WGS84_EPSG);
                    Some(CoordTransform::new(&source, &target)?)
                }
                Some(_) => None,
                None => {
                    log::debug!("Layer '{}' has no CRS, assuming EPSG:{}", layer.name(), WGS84_EPSG);
                    None
                }
            };

            for feature in layer.features() {
                let Some(geometry) = feature.geometry() else {
                    continue;
                };
                let geometry = match &transform {
                    Some(t) => geometry.transform(t)?,
                    None => geometry.clone(),
                };
                // KML coordinates carry an altitude; regions are planar
                unsafe {
                    gdal_sys::OGR_G_FlattenTo2D(geometry.c_geometry());
                }

                let mut properties = BTreeMap::new();
                for (name, value) in feature.fields() {
                    if let Some(value) = value.and_then(field_to_property) {
                        properties.insert(name, value);
                    }
                }

                features.push(RegionFeature {
                    geometry: geometry.to_geo()?,
                    properties,
                });
            }
        }

        Ok(features)
    }

    fn geometry_to_json(geometry: &Geometry<f64>) -> RoiResult<serde_json::Value> {
        let json = geometry.to_gdal()?.json()?;
        Ok(serde_json::from_str(&json)?)
    }

    fn geometry_from_json(value: &serde_json::Value) -> RoiResult<Geometry<f64>> {
        let geometry = GdalGeometry::from_geojson(&value.to_string())?;
        Ok(geometry.to_geo()?)
    }

    fn feature_to_json(feature: &RegionFeature) -> RoiResult<serde_json::Value> {
        let properties: serde_json::Map<String, serde_json::Value> = feature
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Ok(serde_json::json!({
            "type": "Feature",
            "geometry": Self::geometry_to_json(&feature.geometry)?,
            "properties": properties,
        }))
    }

    fn feature_from_json(value: &serde_json::Value) -> RoiResult<RegionFeature> {
        let geometry = value
            .get("geometry")
            .filter(|g| !g.is_null())
            .ok_or_else(|| RoiError::EmptyOrInvalidGeometry("feature without geometry".to_string()))?;

        let mut properties = BTreeMap::new();
        if let Some(map) = value.get("properties").and_then(|p| p.as_object()) {
            for (key, v) in map {
                if let Some(v) = PropertyValue::from_json(v) {
                    properties.insert(key.clone(), v);
                }
            }
        }

        Ok(RegionFeature {
            geometry: Self::geometry_from_json(geometry)?,
            properties,
        })
    }
}

/// EPSG:4326 with lon/lat axis order
fn wgs84() -> RoiResult<SpatialRef> {
    let srs = SpatialRef::from_epsg(WGS84_EPSG)?;
    set_traditional_axis_order(&srs);
    Ok(srs)
}

fn is_wgs84(srs: &SpatialRef) -> bool {
    matches!(srs.auth_code(), Ok(code) if code as u32 == WGS84_EPSG)
}

/// GDAL 3 defaults EPSG:4326 to lat/lon; regions are always lon/lat
fn set_traditional_axis_order(srs: &SpatialRef) {
    unsafe {
        gdal_sys::OSRSetAxisMappingStrategy(
            srs.to_c_hsrs(),
            gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER,
        );
    }
}

/// A Shapefile layer holds a single geometry family
fn shapefile_geometry_type(features: &[RegionFeature]) -> RoiResult<OGRwkbGeometryType::Type> {
    let mut layer_type = None;
    for feature in features {
        let ty = match &feature.geometry {
            Geometry::Point(_) => OGRwkbGeometryType::wkbPoint,
            Geometry::MultiPoint(_) => OGRwkbGeometryType::wkbMultiPoint,
            Geometry::LineString(_) | Geometry::MultiLineString(_) => OGRwkbGeometryType::wkbLineString,
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) => OGRwkbGeometryType::wkbPolygon,
            _ => {
                return Err(RoiError::InvalidGeometryKind(
                    "Shapefiles hold only points, lines or polygons".to_string(),
                ))
            }
        };
        match layer_type {
            None => layer_type = Some(ty),
            Some(existing) if existing == ty => {}
            Some(_) => {
                return Err(RoiError::InvalidGeometryKind(
                    "a Shapefile cannot mix geometry types in one layer".to_string(),
                ))
            }
        }
    }
    Ok(layer_type.unwrap_or(OGRwkbGeometryType::wkbPolygon))
}

fn field_schema(features: &[RegionFeature]) -> Vec<(String, OGRFieldType::Type)> {
    let mut schema: BTreeMap<String, OGRFieldType::Type> = BTreeMap::new();
    for feature in features {
        for (name, value) in &feature.properties {
            let ty = match value {
                PropertyValue::Bool(_) => OGRFieldType::OFTInteger,
                PropertyValue::Int(_) => OGRFieldType::OFTInteger64,
                PropertyValue::Float(_) => OGRFieldType::OFTReal,
                PropertyValue::Text(_) => OGRFieldType::OFTString,
            };
            // Mixed types in one column degrade to text
            schema
                .entry(name.clone())
                .and_modify(|existing| {
                    if *existing != ty {
                        *existing = OGRFieldType::OFTString;
                    }
                })
                .or_insert(ty);
        }
    }
    schema.into_iter().collect()
}

fn property_to_field(value: &PropertyValue) -> FieldValue {
    match value {
        PropertyValue::Bool(b) => FieldValue::IntegerValue(i32::from(*b)),
        PropertyValue::Int(i) => FieldValue::Integer64Value(*i),
        PropertyValue::Float(f) => FieldValue::RealValue(*f),
        PropertyValue::Text(s) => FieldValue::StringValue(s.clone()),
    }
}

fn field_to_property(value: FieldValue) -> Option<PropertyValue> {
    match value {
        FieldValue::IntegerValue(i) => Some(PropertyValue::Int(i64::from(i))),
        FieldValue::Integer64Value(i) => Some(PropertyValue::Int(i)),
        FieldValue::RealValue(f) => Some(PropertyValue::Float(f)),
        FieldValue::StringValue(s) => Some(PropertyValue::Text(s)),
        FieldValue::DateValue(d) => Some(PropertyValue::Text(d.to_string())),
        FieldValue::DateTimeValue(dt) => Some(PropertyValue::Text(dt.to_rfc3339())),
        _ => None,
    }
}
