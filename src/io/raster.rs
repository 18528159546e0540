use crate::types::{GeoTransform, RoiError, RoiResult, WGS84_EPSG};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use ndarray::{Array2, Array3};
use std::path::Path;

/// Single-band raster read back from disk
#[derive(Debug, Clone)]
pub struct RasterLayer {
    pub data: Array2<f32>,
    pub transform: GeoTransform,
    pub epsg: u32,
}

/// GeoTIFF reader/writer for exported rasters
pub struct RasterIo;

impl RasterIo {
    /// Read the first band of a raster; no-data pixels become NaN
    pub fn read_band<P: AsRef<Path>>(path: P) -> RoiResult<RasterLayer> {
        log::debug!("Reading raster from: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let geo_transform = dataset.geo_transform()?;
        let (width, height) = dataset.raster_size();

        if dataset.raster_count() < 1 {
            return Err(RoiError::Processing(format!(
                "Raster {} has no bands",
                path.as_ref().display()
            )));
        }

        // Extra bands are ignored: exports are single-band by construction
        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband.no_data_value();
        let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

        let mut data = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| RoiError::Processing(format!("Failed to reshape raster data: {}", e)))?;

        if let Some(nodata) = nodata {
            let nodata = nodata as f32;
            if !nodata.is_nan() {
                data.mapv_inplace(|v| if v == nodata { f32::NAN } else { v });
            }
        }

        let epsg = dataset
            .spatial_ref()
            .ok()
            .and_then(|srs| srs.auth_code().ok())
            .map(|code| code as u32)
            .unwrap_or(WGS84_EPSG);

        log::debug!("Raster size: {}x{}, EPSG:{}", width, height, epsg);

        Ok(RasterLayer {
            data,
            transform: GeoTransform::from_gdal(geo_transform),
            epsg,
        })
    }

    /// Save a 2-D grid as a single-band float GeoTIFF with NaN no-data
    pub fn write_band<P: AsRef<Path>>(
        layer: &Array2<f32>,
        transform: &GeoTransform,
        epsg: u32,
        output_path: P,
    ) -> RoiResult<()> {
        let (height, width) = layer.dim();
        let stack = layer
            .view()
            .into_shape((1, height, width))
            .map_err(|e| RoiError::Processing(format!("Failed to reshape raster: {}", e)))?;
        Self::write_bands(&stack.to_owned(), transform, epsg, output_path)
    }

    /// Save a (band, row, col) cube as a multi-band float GeoTIFF
    pub fn write_bands<P: AsRef<Path>>(
        cube: &Array3<f32>,
        transform: &GeoTransform,
        epsg: u32,
        output_path: P,
    ) -> RoiResult<()> {
        log::debug!("Saving GeoTIFF: {}", output_path.as_ref().display());

        let (bands, height, width) = cube.dim();
        if bands == 0 || height == 0 || width == 0 {
            return Err(RoiError::Processing(format!(
                "Refusing to write empty raster of shape {:?}",
                cube.dim()
            )));
        }

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<f32, _>(
            output_path.as_ref(),
            width as isize,
            height as isize,
            bands as isize,
        )?;

        dataset.set_geo_transform(&transform.to_gdal())?;
        dataset.set_spatial_ref(&SpatialRef::from_epsg(epsg)?)?;

        for (index, slice) in cube.outer_iter().enumerate() {
            let mut rasterband = dataset.rasterband(index as isize + 1)?;
            let flat_data: Vec<f32> = slice.iter().cloned().collect();
            let buffer = Buffer::new((width, height), flat_data);
            rasterband.write((0, 0), (width, height), &buffer)?;
            rasterband.set_no_data_value(Some(f32::NAN as f64))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geotiff_roundtrip_keeps_nan_and_transform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.tif");
        let mut data = Array2::from_elem((3, 4), 2.5f32);
        data[[1, 2]] = f32::NAN;
        let transform = GeoTransform::north_up(-45.0, -20.0, 0.001, 0.001);

        RasterIo::write_band(&data, &transform, 4326, &path).unwrap();
        let layer = RasterIo::read_band(&path).unwrap();

        assert_eq!(layer.data.dim(), (3, 4));
        assert!(layer.data[[1, 2]].is_nan());
        assert_eq!(layer.data[[0, 0]], 2.5);
        assert!(layer.transform.approx_eq(&transform, 1e-12));
        assert_eq!(layer.epsg, 4326);
    }
}
