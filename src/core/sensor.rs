//! Sensor-family knowledge: nominal scales, metadata normalization,
//! cloud masks and spectral indices.

use crate::types::{RoiError, RoiResult};
use serde::{Deserialize, Serialize};

/// Landsat Collection 2 pixel quality band
pub const LANDSAT_QA_BAND: &str = "QA_PIXEL";
/// Sentinel-2 scene classification band
pub const SENTINEL_SCL_BAND: &str = "SCL";
/// Sentinel-2 cloud probability band
pub const SENTINEL_CLOUD_PROB_BAND: &str = "MSK_CLDPRB";
/// Scale used when no sensor-specific band is present
pub const DEFAULT_SCALE_M: f64 = 10.0;

/// Reflectance roles used by spectral indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandRole {
    Blue,
    Green,
    Red,
    Nir,
    Swir1,
    Swir2,
}

/// Supported optical sensor families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorFamily {
    Landsat,
    Sentinel2,
}

/// Static description of what a sensor family provides
struct SensorCapabilities {
    family: SensorFamily,
    collection_prefixes: &'static [&'static str],
    quality_band: &'static str,
    nominal_scale: f64,
    satellite_property: &'static str,
    cloud_cover_property: &'static str,
    bands: [(BandRole, &'static str); 6],
}

const CAPABILITIES: [SensorCapabilities; 2] = [
    SensorCapabilities {
        family: SensorFamily::Landsat,
        collection_prefixes: &["LANDSAT/"],
        quality_band: LANDSAT_QA_BAND,
        nominal_scale: 30.0,
        satellite_property: "SPACECRAFT_ID",
        cloud_cover_property: "CLOUD_COVER",
        bands: [
            (BandRole::Blue, "SR_B2"),
            (BandRole::Green, "SR_B3"),
            (BandRole::Red, "SR_B4"),
            (BandRole::Nir, "SR_B5"),
            (BandRole::Swir1, "SR_B6"),
            (BandRole::Swir2, "SR_B7"),
        ],
    },
    SensorCapabilities {
        family: SensorFamily::Sentinel2,
        collection_prefixes: &["COPERNICUS/S2"],
        quality_band: SENTINEL_SCL_BAND,
        nominal_scale: 20.0,
        satellite_property: "SPACECRAFT_NAME",
        cloud_cover_property: "CLOUDY_PIXEL_PERCENTAGE",
        bands: [
            (BandRole::Blue, "B2"),
            (BandRole::Green, "B3"),
            (BandRole::Red, "B4"),
            (BandRole::Nir, "B8"),
            (BandRole::Swir1, "B11"),
            (BandRole::Swir2, "B12"),
        ],
    },
];

impl SensorFamily {
    fn capabilities(&self) -> &'static SensorCapabilities {
        match self {
            SensorFamily::Landsat => &CAPABILITIES[0],
            SensorFamily::Sentinel2 => &CAPABILITIES[1],
        }
    }

    /// Family of a collection identifier such as `LANDSAT/LC08/C02/T1_L2`
    pub fn from_collection_id(collection_id: &str) -> RoiResult<Self> {
        CAPABILITIES
            .iter()
            .find(|cap| {
                cap.collection_prefixes
                    .iter()
                    .any(|prefix| collection_id.starts_with(prefix))
            })
            .map(|cap| cap.family)
            .ok_or_else(|| RoiError::UnsupportedCollection(collection_id.to_string()))
    }

    /// Family identified by its quality band
    pub fn from_bands<S: AsRef<str>>(bands: &[S]) -> Option<Self> {
        CAPABILITIES
            .iter()
            .find(|cap| bands.iter().any(|b| b.as_ref() == cap.quality_band))
            .map(|cap| cap.family)
    }

    /// Family identified by the property naming its satellite
    pub fn from_properties(properties: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        CAPABILITIES
            .iter()
            .find(|cap| properties.contains_key(cap.satellite_property))
            .map(|cap| cap.family)
    }

    pub fn nominal_scale(&self) -> f64 {
        self.capabilities().nominal_scale
    }

    /// Band name carrying a reflectance role
    pub fn band_for(&self, role: BandRole) -> &'static str {
        self.capabilities()
            .bands
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, name)| *name)
            .unwrap_or("")
    }
}

/// Scale in meters for an image given its band names
pub fn infer_scale<S: AsRef<str>>(bands: &[S]) -> f64 {
    SensorFamily::from_bands(bands)
        .map(|family| family.nominal_scale())
        .unwrap_or(DEFAULT_SCALE_M)
}

/// Acquisition metadata mapped onto a common schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SensorMetadata {
    Landsat {
        satellite: Option<String>,
        cloud_cover: Option<f64>,
        sun_elevation: Option<f64>,
        sun_azimuth: Option<f64>,
    },
    Sentinel {
        satellite: Option<String>,
        cloudy_pixel_percentage: Option<f64>,
        mean_solar_zenith: Option<f64>,
        mean_solar_azimuth: Option<f64>,
    },
}

impl SensorMetadata {
    /// Build the variant for `family` from raw image properties
    pub fn from_properties(
        family: SensorFamily,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let text = |key: &str| properties.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let number = |key: &str| properties.get(key).and_then(|v| v.as_f64());

        match family {
            SensorFamily::Landsat => SensorMetadata::Landsat {
                satellite: text("SPACECRAFT_ID"),
                cloud_cover: number("CLOUD_COVER"),
                sun_elevation: number("SUN_ELEVATION"),
                sun_azimuth: number("SUN_AZIMUTH"),
            },
            SensorFamily::Sentinel2 => SensorMetadata::Sentinel {
                satellite: text("SPACECRAFT_NAME"),
                cloudy_pixel_percentage: number("CLOUDY_PIXEL_PERCENTAGE"),
                mean_solar_zenith: number("MEAN_SOLAR_ZENITH_ANGLE"),
                mean_solar_azimuth: number("MEAN_SOLAR_AZIMUTH_ANGLE"),
            },
        }
    }

    pub fn satellite(&self) -> Option<&str> {
        match self {
            SensorMetadata::Landsat { satellite, .. } | SensorMetadata::Sentinel { satellite, .. } => {
                satellite.as_deref()
            }
        }
    }

    pub fn cloud_cover(&self) -> Option<f64> {
        match self {
            SensorMetadata::Landsat { cloud_cover, .. } => *cloud_cover,
            SensorMetadata::Sentinel { cloudy_pixel_percentage, .. } => *cloudy_pixel_percentage,
        }
    }

    /// Solar elevation in degrees; Sentinel-2 reports zenith instead
    pub fn solar_elevation(&self) -> Option<f64> {
        match self {
            SensorMetadata::Landsat { sun_elevation, .. } => *sun_elevation,
            SensorMetadata::Sentinel { mean_solar_zenith, .. } => mean_solar_zenith.map(|z| 90.0 - z),
        }
    }

    pub fn solar_azimuth(&self) -> Option<f64> {
        match self {
            SensorMetadata::Landsat { sun_azimuth, .. } => *sun_azimuth,
            SensorMetadata::Sentinel { mean_solar_azimuth, .. } => *mean_solar_azimuth,
        }
    }
}

/// Cloud mask applied before counting clear pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloudMask {
    /// Landsat QA_PIXEL, cloud flag on bit 3
    LandsatQa,
    /// Sentinel-2 SCL, classes 3, 8, 9 and 10 are cloud or shadow
    SceneClassification,
    /// Sentinel-2 MSK_CLDPRB, clear below 50 %
    CloudProbability,
}

impl CloudMask {
    /// QA_PIXEL bit flagging cloud
    pub const LANDSAT_CLOUD_BIT: u32 = 3;
    /// SCL classes removed: cloud shadow, medium and high probability cloud, cirrus
    pub const SCL_CLOUD_CLASSES: [u8; 4] = [3, 8, 9, 10];
    /// Cloud probability at and above which a pixel is cloudy
    pub const CLOUD_PROBABILITY_THRESHOLD: f32 = 50.0;

    /// Preferred mask for an image given its bands
    pub fn for_bands<S: AsRef<str>>(bands: &[S]) -> Option<Self> {
        let has = |name: &str| bands.iter().any(|b| b.as_ref() == name);
        if has(LANDSAT_QA_BAND) {
            Some(CloudMask::LandsatQa)
        } else if has(SENTINEL_SCL_BAND) {
            Some(CloudMask::SceneClassification)
        } else if has(SENTINEL_CLOUD_PROB_BAND) {
            Some(CloudMask::CloudProbability)
        } else {
            None
        }
    }

    /// Band the mask reads
    pub fn band(&self) -> &'static str {
        match self {
            CloudMask::LandsatQa => LANDSAT_QA_BAND,
            CloudMask::SceneClassification => SENTINEL_SCL_BAND,
            CloudMask::CloudProbability => SENTINEL_CLOUD_PROB_BAND,
        }
    }

    /// 1.0 for clear, 0.0 for cloud, NaN where the quality band is missing
    pub fn classify(&self, value: f32) -> f32 {
        if value.is_nan() {
            return f32::NAN;
        }
        let clear = match self {
            CloudMask::LandsatQa => (value as u32) & (1 << Self::LANDSAT_CLOUD_BIT) == 0,
            CloudMask::SceneClassification => {
                !Self::SCL_CLOUD_CLASSES.contains(&(value.round() as u8))
            }
            CloudMask::CloudProbability => value < Self::CLOUD_PROBABILITY_THRESHOLD,
        };
        if clear {
            1.0
        } else {
            0.0
        }
    }
}

/// Normalized-difference spectral index `(a - b) / (a + b)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectralIndex {
    pub name: &'static str,
    pub positive: BandRole,
    pub negative: BandRole,
}

const SPECTRAL_INDICES: [SpectralIndex; 6] = [
    SpectralIndex { name: "NDVI", positive: BandRole::Nir, negative: BandRole::Red },
    SpectralIndex { name: "NDWI", positive: BandRole::Green, negative: BandRole::Nir },
    SpectralIndex { name: "MNDWI", positive: BandRole::Green, negative: BandRole::Swir1 },
    SpectralIndex { name: "NDMI", positive: BandRole::Nir, negative: BandRole::Swir1 },
    SpectralIndex { name: "NBR", positive: BandRole::Nir, negative: BandRole::Swir2 },
    SpectralIndex { name: "NDBI", positive: BandRole::Swir1, negative: BandRole::Nir },
];

impl SpectralIndex {
    /// Look up an index by name, case-insensitively
    pub fn from_name(name: &str) -> RoiResult<Self> {
        SPECTRAL_INDICES
            .iter()
            .find(|index| index.name.eq_ignore_ascii_case(name))
            .copied()
            .ok_or_else(|| {
                let known: Vec<&str> = SPECTRAL_INDICES.iter().map(|i| i.name).collect();
                RoiError::InvalidInput(format!(
                    "Unknown spectral index '{}'. Supported: {}",
                    name,
                    known.join(", ")
                ))
            })
    }

    pub fn all() -> &'static [SpectralIndex] {
        &SPECTRAL_INDICES
    }

    /// Band names feeding the index for a sensor family
    pub fn bands(&self, family: SensorFamily) -> (&'static str, &'static str) {
        (family.band_for(self.positive), family.band_for(self.negative))
    }

    pub fn evaluate(&self, positive: f32, negative: f32) -> f32 {
        let sum = positive + negative;
        if sum == 0.0 || sum.is_nan() {
            f32::NAN
        } else {
            (positive - negative) / sum
        }
    }
}
