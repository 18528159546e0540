use approx::assert_relative_eq;
use chrono::{TimeZone, Utc};
use ndarray::Array2;
use roitools::core::query::QueryAdapter;
use roitools::core::region::Region;
use roitools::io::memory::{InMemoryImageryService, MemoryImage};
use roitools::io::service::ImageSource;
use roitools::types::{BoundingBox, GeoTransform, RoiError, Statistic};
use serde_json::json;

const SENTINEL: &str = "COPERNICUS/S2_SR_HARMONIZED";
const LANDSAT: &str = "LANDSAT/LC09/C02/T1_L2";

fn region() -> Region {
    Region::from_bbox(&BoundingBox {
        min_lon: -45.95,
        max_lon: -45.85,
        min_lat: -20.15,
        max_lat: -20.05,
    })
}

fn grid() -> GeoTransform {
    GeoTransform::north_up(-46.0, -20.0, 0.01, 0.01)
}

fn sentinel(id: &str, day: u32, scl: Array2<f32>) -> MemoryImage {
    MemoryImage::new(id, SENTINEL, grid())
        .acquired_at(Utc.with_ymd_and_hms(2022, 8, day, 13, 20, 0).unwrap())
        .with_band("B4", Array2::from_elem((20, 20), 0.1))
        .with_band("SCL", scl)
        .with_property("SPACECRAFT_NAME", json!("Sentinel-2B"))
        .with_property("CLOUDY_PIXEL_PERCENTAGE", json!(3.25))
        .with_property("MEAN_SOLAR_ZENITH_ANGLE", json!(38.5))
        .with_property("MEAN_SOLAR_AZIMUTH_ANGLE", json!(41.0))
}

#[test]
fn test_sentinel_catalog_with_partial_failure() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut service = InMemoryImageryService::new();
    for day in 1..=3 {
        let clear = Array2::from_elem((20, 20), 4.0);
        service.add_image(sentinel(&format!("S2_{}", day), day, clear));
    }
    service.fail_intersection_for("S2_2");

    let region = region();
    let adapter = QueryAdapter::new(&service);
    let catalog = adapter
        .image_catalog(SENTINEL, &region, 500, None, false)
        .expect("intersection failures must not abort the listing");

    assert_eq!(catalog.len(), 3);
    assert_eq!(catalog[0].satellite.as_deref(), Some("Sentinel-2B"));
    assert_eq!(catalog[0].cloud_cover, Some(3.25));
    assert_eq!(catalog[0].solar_elevation, Some(51.5));
    assert_eq!(catalog[0].solar_azimuth, Some(41.0));
    assert_eq!(
        catalog[0].acquired,
        Some(Utc.with_ymd_and_hms(2022, 8, 1, 13, 20, 0).unwrap())
    );
    assert_relative_eq!(catalog[0].region_coverage, 100.0, epsilon = 1e-6);
    assert_eq!(catalog[1].region_coverage, 0.0);
    assert_relative_eq!(catalog[2].region_coverage, 100.0, epsilon = 1e-6);
    assert!(catalog.iter().all(|m| m.clear_sky.is_none()));
}

#[test]
fn test_metadata_failure_keeps_listing() {
    let mut service = InMemoryImageryService::new();
    for day in 1..=3 {
        service.add_image(sentinel(&format!("S2_{}", day), day, Array2::from_elem((20, 20), 4.0)));
    }
    service.fail_info_for("S2_2");

    let region = region();
    let adapter = QueryAdapter::new(&service);
    let catalog = adapter
        .image_catalog(SENTINEL, &region, 500, None, true)
        .expect("metadata failures must not abort the listing");

    let ids: Vec<&str> = catalog.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["S2_1", "S2_2", "S2_3"]);

    let failed = &catalog[1];
    assert_eq!(failed.acquired, None);
    assert_eq!(failed.satellite, None);
    assert_eq!(failed.cloud_cover, None);
    assert_eq!(failed.solar_elevation, None);
    assert_eq!(failed.clear_sky, None);
    // Footprint intersection does not need the metadata
    assert_relative_eq!(failed.region_coverage, 100.0, epsilon = 1e-6);

    assert_eq!(catalog[2].satellite.as_deref(), Some("Sentinel-2B"));
    assert_eq!(catalog[2].clear_sky, Some(100.0));
}

#[test]
fn test_sliver_overlap_is_not_reported_as_zero() {
    let mut service = InMemoryImageryService::new();
    service.add_image(sentinel("S2_edge", 1, Array2::from_elem((20, 20), 4.0)));

    // Footprint ends at -45.8; only a 0.00004 degree strip overlaps
    let region = Region::from_bbox(&BoundingBox {
        min_lon: -45.80004,
        max_lon: -45.7,
        min_lat: -20.15,
        max_lat: -20.05,
    });
    let adapter = QueryAdapter::new(&service);
    let catalog = adapter.image_catalog(SENTINEL, &region, 10, None, false).unwrap();

    assert_eq!(catalog.len(), 1);
    assert!(catalog[0].region_coverage > 0.0);
    assert!(catalog[0].region_coverage < 0.05);
}

#[test]
fn test_listing_is_truncated_and_date_filtered() {
    let mut service = InMemoryImageryService::new();
    for day in 1..=6 {
        service.add_image(sentinel(&format!("S2_{}", day), day, Array2::from_elem((20, 20), 4.0)));
    }
    let region = region();
    let adapter = QueryAdapter::new(&service);

    let ids = adapter.list_images(SENTINEL, &region, None, 4).unwrap();
    assert_eq!(ids, vec!["S2_1", "S2_2", "S2_3", "S2_4"]);

    let range = (
        chrono::NaiveDate::from_ymd_opt(2022, 8, 3).unwrap(),
        chrono::NaiveDate::from_ymd_opt(2022, 8, 5).unwrap(),
    );
    let ids = adapter.list_images(SENTINEL, &region, Some(range), 500).unwrap();
    assert_eq!(ids, vec!["S2_3", "S2_4"]);

    let far_away = Region::from_bbox(&BoundingBox {
        min_lon: 10.0,
        max_lon: 11.0,
        min_lat: 10.0,
        max_lat: 11.0,
    });
    assert!(adapter.list_images(SENTINEL, &far_away, None, 500).unwrap().is_empty());
}

#[test]
fn test_clear_sky_percentage() {
    let mut scl = Array2::from_elem((20, 20), 4.0f32);
    // Cloud over the top half of the region (rows 5..10 of rows 5..15)
    for row in 5..10 {
        for col in 0..20 {
            scl[[row, col]] = 9.0;
        }
    }
    let mut service = InMemoryImageryService::new();
    service.add_image(sentinel("S2_cloudy", 1, scl));

    let region = region();
    let adapter = QueryAdapter::new(&service);
    assert_eq!(adapter.clear_sky_percentage("S2_cloudy", &region), Some(50.0));

    let catalog = adapter.image_catalog(SENTINEL, &region, 10, None, true).unwrap();
    assert_eq!(catalog[0].clear_sky, Some(50.0));

    assert_eq!(adapter.clear_sky_percentage("missing", &region), None);
}

#[test]
fn test_scl_falls_back_to_cloud_probability() {
    let overcast = Array2::from_elem((20, 20), 8.0f32);
    let probability = Array2::from_shape_fn((20, 20), |(_, col)| if col < 10 { 10.0 } else { 90.0 });
    let mut service = InMemoryImageryService::new();
    service.add_image(sentinel("S2_old", 1, overcast).with_band("MSK_CLDPRB", probability));

    let region = region();
    let adapter = QueryAdapter::new(&service);
    // Region columns 5..15: half below the 50 % threshold
    assert_eq!(adapter.clear_sky_percentage("S2_old", &region), Some(50.0));
}

#[test]
fn test_landsat_metadata_and_unsupported_collection() {
    let mut service = InMemoryImageryService::new();
    service.add_image(
        MemoryImage::new("LC09_001", LANDSAT, grid())
            .with_band("QA_PIXEL", Array2::from_elem((20, 20), 21824.0))
            .with_property("SPACECRAFT_ID", json!("LANDSAT_9"))
            .with_property("CLOUD_COVER", json!(12.0))
            .with_property("SUN_ELEVATION", json!(44.2))
            .with_property("SUN_AZIMUTH", json!(52.7)),
    );

    let region = region();
    let adapter = QueryAdapter::new(&service);
    let catalog = adapter.image_catalog(LANDSAT, &region, 10, None, true).unwrap();
    assert_eq!(catalog[0].satellite.as_deref(), Some("LANDSAT_9"));
    assert_eq!(catalog[0].solar_elevation, Some(44.2));
    assert_eq!(catalog[0].clear_sky, Some(100.0));
    assert_eq!(catalog[0].acquired, None);

    assert!(matches!(
        adapter.image_catalog("MODIS/061/MOD09GA", &region, 10, None, false),
        Err(RoiError::UnsupportedCollection(_))
    ));
}

#[test]
fn test_reduce_reports_every_requested_key() {
    let mut service = InMemoryImageryService::new();
    let mut band = Array2::from_elem((20, 20), f32::NAN);
    band[[0, 0]] = 1.0;
    service.add_image(MemoryImage::new("img", SENTINEL, grid()).with_band("B4", band));

    let region = region();
    let adapter = QueryAdapter::new(&service);
    let values = adapter
        .reduce(
            ImageSource::Band {
                image_id: "img".to_string(),
                band: "B4".to_string(),
            },
            "B4",
            &region,
            10.0,
            &Statistic::ALL,
        )
        .unwrap();

    // Fully masked over the region: keys present, values absent
    assert_eq!(values.len(), 5);
    assert!(values.values().all(|v| v.is_none()));
    assert!(values.contains_key("B4_stdDev"));
}
