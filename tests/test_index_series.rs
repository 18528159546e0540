use approx::assert_relative_eq;
use chrono::{TimeZone, Utc};
use ndarray::Array2;
use roitools::core::region::Region;
use roitools::core::timeseries::{ImageRef, TimeSeriesExtractor};
use roitools::io::memory::{InMemoryImageryService, MemoryImage};
use roitools::types::{BoundingBox, GeoTransform, RoiError};

const COLLECTION: &str = "COPERNICUS/S2_SR_HARMONIZED";

fn region() -> Region {
    Region::from_bbox(&BoundingBox {
        min_lon: -45.95,
        max_lon: -45.85,
        min_lat: -20.15,
        max_lat: -20.05,
    })
}

fn sentinel_image(id: &str, day: u32, nir: f32, red: f32) -> MemoryImage {
    MemoryImage::new(id, COLLECTION, GeoTransform::north_up(-46.0, -20.0, 0.01, 0.01))
        .acquired_at(Utc.with_ymd_and_hms(2023, 3, day, 13, 0, 0).unwrap())
        .with_band("B4", Array2::from_elem((20, 20), red))
        .with_band("B8", Array2::from_elem((20, 20), nir))
        .with_band("SCL", Array2::from_elem((20, 20), 4.0))
}

fn service_with_five_images() -> (InMemoryImageryService, Vec<ImageRef>) {
    let mut service = InMemoryImageryService::new();
    let mut images = Vec::new();
    for i in 0..5u32 {
        let id = format!("S2_2023030{}", i + 1);
        service.add_image(sentinel_image(&id, i + 1, 0.5, 0.1));
        images.push(ImageRef::new(id).acquired_at(Utc.with_ymd_and_hms(2023, 3, i + 1, 13, 0, 0).unwrap()));
    }
    (service, images)
}

#[test]
fn test_failed_image_leaves_missing_row() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut service, images) = service_with_five_images();
    service.fail_reductions_for(&images[2].id);

    let extractor = TimeSeriesExtractor::new(&service);
    let table = extractor
        .extract_index_series(&images, &region(), "NDVI", None)
        .expect("a per-image failure must not abort the series");

    assert_eq!(table.columns(), &["NDVI_mean".to_string(), "NDVI_std".to_string()]);
    assert_eq!(table.len(), 5);

    for (row, image) in images.iter().enumerate() {
        assert_eq!(table.rows()[row].label, image.id);
        if row == 2 {
            assert_eq!(table.value(row, "NDVI_mean"), None);
            assert_eq!(table.value(row, "NDVI_std"), None);
        } else {
            assert_relative_eq!(table.value(row, "NDVI_mean").unwrap(), 0.4 / 0.6, epsilon = 1e-6);
            assert_relative_eq!(table.value(row, "NDVI_std").unwrap(), 0.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_metadata_failure_keeps_row_position() {
    let (mut service, dated) = service_with_five_images();
    // No acquisition times given, so each timestamp comes from the image metadata
    let images: Vec<ImageRef> = dated.iter().map(|image| ImageRef::new(image.id.clone())).collect();
    service.fail_info_for(&images[2].id);

    let extractor = TimeSeriesExtractor::new(&service);
    let table = extractor
        .extract_index_series(&images, &region(), "NDVI", None)
        .expect("a metadata failure must not abort the series");

    assert_eq!(table.len(), 5);
    for (row, image) in images.iter().enumerate() {
        assert_eq!(table.rows()[row].label, image.id);
        if row == 2 {
            assert_eq!(table.rows()[row].timestamp, None);
            assert_eq!(table.value(row, "NDVI_mean"), None);
            assert_eq!(table.value(row, "NDVI_std"), None);
        } else {
            assert_eq!(table.rows()[row].timestamp, dated[row].acquired);
            assert_relative_eq!(table.value(row, "NDVI_mean").unwrap(), 0.4 / 0.6, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_unknown_image_is_missing_not_fatal() {
    let (service, mut images) = service_with_five_images();
    images.push(ImageRef::new("S2_does_not_exist"));

    let extractor = TimeSeriesExtractor::new(&service);
    let table = extractor.extract_index_series(&images, &region(), "ndvi", Some(10.0)).unwrap();

    assert_eq!(table.len(), 6);
    // Undated rows keep the input order
    assert_eq!(table.rows()[5].label, "S2_does_not_exist");
    assert_eq!(table.value(5, "NDVI_mean"), None);
}

#[test]
fn test_timestamp_taken_from_image_when_not_given() {
    let (service, _) = service_with_five_images();
    let extractor = TimeSeriesExtractor::new(&service);
    let table = extractor
        .extract_index_series(&[ImageRef::new("S2_20230304")], &region(), "NDWI", None)
        .unwrap();

    let expected = Utc.with_ymd_and_hms(2023, 3, 4, 13, 0, 0).unwrap();
    assert_eq!(table.rows()[0].timestamp, Some(expected));
    // NDWI = (green - nir) / (green + nir); the fixture has no green band
    assert_eq!(table.value(0, "NDWI_mean"), None);
}

#[test]
fn test_unknown_index_is_rejected_up_front() {
    let (service, images) = service_with_five_images();
    let extractor = TimeSeriesExtractor::new(&service);
    let result = extractor.extract_index_series(&images, &region(), "NOT_AN_INDEX", None);
    assert!(matches!(result, Err(RoiError::InvalidInput(_))));
}
