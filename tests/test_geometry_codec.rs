use geo::{Coord, Geometry, LineString, Point, Polygon};
use roitools::core::region::{Region, RegionFeature};
use roitools::io::vector::{VectorCodec, VectorFormat, SHAPEFILE_COMPONENTS};
use roitools::types::{PropertyValue, RoiError};
use std::collections::BTreeSet;
use std::str::FromStr;

const EPSILON: f64 = 1e-9;

fn test_polygon() -> Polygon<f64> {
    Polygon::new(
        LineString::from(vec![
            (-45.123456789, -20.987654321),
            (-45.012345678, -20.987654321),
            (-45.012345678, -20.876543219),
            (-45.067891234, -20.812345678),
            (-45.123456789, -20.876543219),
            (-45.123456789, -20.987654321),
        ]),
        vec![],
    )
}

fn polygon_coords(geometry: &Geometry<f64>) -> Vec<Coord<f64>> {
    match geometry {
        Geometry::Polygon(p) => p.exterior().0.clone(),
        Geometry::MultiPolygon(mp) => mp.0.iter().flat_map(|p| p.exterior().0.clone()).collect(),
        other => panic!("Expected polygonal geometry, got {:?}", other),
    }
}

/// Same vertices within EPSILON; ring orientation may differ between formats
fn assert_same_ring(expected: &[Coord<f64>], actual: &[Coord<f64>]) {
    assert_eq!(expected.len(), actual.len(), "vertex count differs");
    for e in expected {
        assert!(
            actual
                .iter()
                .any(|a| (a.x - e.x).abs() < EPSILON && (a.y - e.y).abs() < EPSILON),
            "vertex {:?} missing after round trip",
            e
        );
    }
}

fn sample_region() -> Region {
    Region::Feature(
        RegionFeature::new(test_polygon())
            .with_property("name", PropertyValue::Text("Fazenda Boa Vista".to_string()))
            .with_property("plot", PropertyValue::Int(7)),
    )
}

#[test]
fn test_geojson_roundtrip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();

    let written = VectorCodec::export(&sample_region(), dir.path().join("roi"), VectorFormat::GeoJson, false)
        .expect("GeoJSON export failed");
    assert!(written.is_absolute());
    assert_eq!(written.extension().unwrap(), "geojson");

    let region = VectorCodec::import(&written).expect("GeoJSON import failed");
    assert_eq!(region.epsg(), 4326);

    let features = region.features();
    assert_eq!(features.len(), 1);
    assert_same_ring(&test_polygon().exterior().0, &polygon_coords(&features[0].geometry));
    assert_eq!(
        features[0].properties.get("name"),
        Some(&PropertyValue::Text("Fazenda Boa Vista".to_string()))
    );
}

#[test]
fn test_shapefile_roundtrip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();

    let written = VectorCodec::export(
        &sample_region(),
        dir.path().join("nested/out/roi.shp"),
        VectorFormat::Shapefile,
        false,
    )
    .expect("Shapefile export failed");
    assert_eq!(written.extension().unwrap(), "zip");

    // Only the component files, named after the base
    let file = std::fs::File::open(&written).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut extensions = BTreeSet::new();
    for i in 0..archive.len() {
        let member = archive.by_index(i).unwrap();
        let name = member.name().to_string();
        assert!(name.starts_with("roi."), "unexpected member {}", name);
        extensions.insert(name.rsplit('.').next().unwrap().to_string());
    }
    let allowed: BTreeSet<String> = SHAPEFILE_COMPONENTS.iter().map(|s| s.to_string()).collect();
    assert!(extensions.is_subset(&allowed), "extensions {:?}", extensions);
    for required in ["shp", "shx", "dbf", "prj"] {
        assert!(extensions.contains(required), "missing .{}", required);
    }

    // No scratch directory left next to the output
    let siblings: Vec<_> = std::fs::read_dir(written.parent().unwrap()).unwrap().collect();
    assert_eq!(siblings.len(), 1);

    let region = VectorCodec::import(&written).expect("Zip import failed");
    assert_eq!(region.epsg(), 4326);
    let features = region.features();
    assert_eq!(features.len(), 1);
    assert_same_ring(&test_polygon().exterior().0, &polygon_coords(&features[0].geometry));
}

#[test]
fn test_format_and_path_errors() {
    assert!(matches!(
        VectorFormat::from_str("kml"),
        Err(RoiError::UnsupportedFormat(_))
    ));

    let missing = VectorCodec::import("/definitely/not/here.geojson");
    assert!(matches!(missing, Err(RoiError::FileNotFound(_))));
}

#[test]
fn test_zip_without_shapefile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.zip");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("readme.txt", zip::write::FileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut writer, b"no layers here").unwrap();
        writer.finish().unwrap();
    }

    assert!(matches!(
        VectorCodec::import(&path),
        Err(RoiError::MissingShapefileInArchive(_))
    ));
}

#[test]
fn test_bare_point_cannot_be_exported() {
    let dir = tempfile::tempdir().unwrap();
    let region = Region::Geometry(Geometry::Point(Point::new(-45.0, -20.0)));
    let result = VectorCodec::export(&region, dir.path().join("pt"), VectorFormat::GeoJson, true);
    assert!(matches!(result, Err(RoiError::InvalidGeometryKind(_))));
}

#[test]
fn test_cloud_geometry_roundtrip_keeps_shape() {
    let collection = Region::Collection(vec![
        RegionFeature::new(test_polygon()).with_property("id", PropertyValue::Int(1)),
        RegionFeature::new(test_polygon()).with_property("id", PropertyValue::Int(2)),
    ]);
    let value = VectorCodec::to_cloud_geometry(&collection).unwrap();
    assert_eq!(value["type"], "FeatureCollection");

    let back = VectorCodec::from_cloud_geometry(&value).unwrap();
    assert!(back.is_collection());
    let features = back.features();
    assert_eq!(features.len(), 2);
    assert_eq!(features[1].properties.get("id"), Some(&PropertyValue::Int(2)));
    assert_same_ring(&test_polygon().exterior().0, &polygon_coords(&features[0].geometry));

    let bare = Region::from_polygon(test_polygon());
    let value = VectorCodec::to_cloud_geometry(&bare).unwrap();
    assert_eq!(value["type"], "Polygon");
    assert!(matches!(VectorCodec::from_cloud_geometry(&value).unwrap(), Region::Geometry(_)));
}

const PLOT_KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Placemark>
      <name>Talhao 3</name>
      <Polygon>
        <outerBoundaryIs>
          <LinearRing>
            <coordinates>
              -45.123456789,-20.987654321,0 -45.012345678,-20.987654321,0 -45.012345678,-20.876543219,0 -45.067891234,-20.812345678,0 -45.123456789,-20.876543219,0 -45.123456789,-20.987654321,0
            </coordinates>
          </LinearRing>
        </outerBoundaryIs>
      </Polygon>
    </Placemark>
  </Document>
</kml>
"#;

fn assert_plot_region(region: &Region) {
    assert_eq!(region.epsg(), 4326);
    let features = region.features();
    assert_eq!(features.len(), 1);
    assert_same_ring(&test_polygon().exterior().0, &polygon_coords(&features[0].geometry));
    assert_eq!(
        features[0].properties.get("Name"),
        Some(&PropertyValue::Text("Talhao 3".to_string()))
    );
}

#[test]
fn test_kml_import() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plot.kml");
    std::fs::write(&path, PLOT_KML).unwrap();

    let region = VectorCodec::import(&path).expect("KML import failed");
    assert_plot_region(&region);
}

#[test]
fn test_kmz_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plot.kmz");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("doc.kml", zip::write::FileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut writer, PLOT_KML.as_bytes()).unwrap();
        writer.finish().unwrap();
    }

    let region = VectorCodec::import(&path).expect("KMZ import failed");
    assert_plot_region(&region);
}

#[test]
fn test_kmz_without_kml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("images.kmz");
    {
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("files/overlay.png", zip::write::FileOptions::default())
            .unwrap();
        std::io::Write::write_all(&mut writer, b"not a layer").unwrap();
        writer.finish().unwrap();
    }

    assert!(matches!(
        VectorCodec::import(&path),
        Err(RoiError::MissingKmlInArchive(_))
    ));
}

#[test]
fn test_point_collection_exports_as_shapefile() {
    let dir = tempfile::tempdir().unwrap();
    let wells = Region::Collection(vec![
        RegionFeature::new(Point::new(-45.1, -20.9)).with_property("well", PropertyValue::Int(1)),
        RegionFeature::new(Point::new(-45.0, -20.8)).with_property("well", PropertyValue::Int(2)),
    ]);
    let written = VectorCodec::export(&wells, dir.path().join("wells"), VectorFormat::Shapefile, false)
        .expect("point Shapefile export failed");

    let features = VectorCodec::import(&written).unwrap().features();
    assert_eq!(features.len(), 2);
    assert!(matches!(features[0].geometry, Geometry::Point(_)));

    let mixed = Region::Collection(vec![
        RegionFeature::new(Point::new(-45.1, -20.9)),
        RegionFeature::new(test_polygon()),
    ]);
    let result = VectorCodec::export(&mixed, dir.path().join("mixed"), VectorFormat::Shapefile, false);
    assert!(matches!(result, Err(RoiError::InvalidGeometryKind(_))));
}
