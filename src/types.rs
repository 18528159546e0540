use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// EPSG code every region is normalized to at the crate boundary
pub const WGS84_EPSG: u32 = 4326;

/// Geospatial bounding box (degrees, EPSG:4326)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// Whether two boxes share any area
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon < other.max_lon
            && other.min_lon < self.max_lon
            && self.min_lat < other.max_lat
            && other.min_lat < self.max_lat
    }

    /// Latitude of the box center, used for degree-to-meter conversions
    pub fn center_lat(&self) -> f64 {
        (self.min_lat + self.max_lat) / 2.0
    }
}

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square-ish pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Map coordinates of the center of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let x = self.top_left_x + (col as f64 + 0.5) * self.pixel_width;
        let y = self.top_left_y + (row as f64 + 0.5) * self.pixel_height;
        (x, y)
    }

    /// Fractional (row, col) position of a map coordinate, pixel centers at .0
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.top_left_x) / self.pixel_width - 0.5;
        let row = (y - self.top_left_y) / self.pixel_height - 0.5;
        (row, col)
    }

    /// Extent covered by a grid of the given shape
    pub fn extent(&self, shape: (usize, usize)) -> BoundingBox {
        let (rows, cols) = shape;
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + cols as f64 * self.pixel_width;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + rows as f64 * self.pixel_height;
        BoundingBox {
            min_lon: x0.min(x1),
            max_lon: x0.max(x1),
            min_lat: y0.min(y1),
            max_lat: y0.max(y1),
        }
    }

    /// Same grid origin and pixel size within `tolerance`
    pub fn approx_eq(&self, other: &GeoTransform, tolerance: f64) -> bool {
        self.to_gdal()
            .iter()
            .zip(other.to_gdal().iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }
}

/// Scalar feature property carried alongside a region geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Convert a JSON scalar, ignoring nulls, arrays and objects
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(PropertyValue::Int)
                .or_else(|| n.as_f64().map(PropertyValue::Float)),
            serde_json::Value::String(s) => Some(PropertyValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Bool(b) => serde_json::Value::from(*b),
            PropertyValue::Int(i) => serde_json::Value::from(*i),
            PropertyValue::Float(f) => serde_json::Value::from(*f),
            PropertyValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// Spatial reducers supported by the imagery service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Statistic {
    #[serde(rename = "mean")]
    Mean,
    #[serde(rename = "median")]
    Median,
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "stdDev")]
    StdDev,
}

impl Statistic {
    pub const ALL: [Statistic; 5] = [
        Statistic::Mean,
        Statistic::Median,
        Statistic::Min,
        Statistic::Max,
        Statistic::StdDev,
    ];

    /// Name used by the service in `"{variable}_{statistic}"` result keys
    pub fn key(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Median => "median",
            Statistic::Min => "min",
            Statistic::Max => "max",
            Statistic::StdDev => "stdDev",
        }
    }

    /// Suffix used for table columns
    pub fn column_suffix(&self) -> &'static str {
        match self {
            Statistic::StdDev => "std",
            other => other.key(),
        }
    }

    pub fn from_name(name: &str) -> RoiResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mean" => Ok(Statistic::Mean),
            "median" => Ok(Statistic::Median),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "stddev" | "std" => Ok(Statistic::StdDev),
            _ => Err(RoiError::InvalidInput(format!(
                "Unknown statistic '{}'. Expected one of mean, median, min, max, stdDev",
                name
            ))),
        }
    }

    /// Evaluate over a set of finite pixel values (population std dev)
    pub fn compute(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        match self {
            Statistic::Mean => Some(values.iter().sum::<f64>() / n),
            Statistic::Min => values.iter().cloned().reduce(f64::min),
            Statistic::Max => values.iter().cloned().reduce(f64::max),
            Statistic::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Some(sorted[mid])
                }
            }
            Statistic::StdDev => {
                let mean = values.iter().sum::<f64>() / n;
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                Some(var.sqrt())
            }
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Coarse error classes used to decide what a caller may recover from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InputValidation,
    ExternalService,
    ResourceCleanup,
    DataConsistency,
    Io,
}

/// Error types for region extraction
#[derive(Debug, thiserror::Error)]
pub enum RoiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid geometry kind: {0}")]
    InvalidGeometryKind(String),

    #[error("Unsupported format '{0}'. Use 'geojson' or 'shp'")]
    UnsupportedFormat(String),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("No .shp member found in archive {}", .0.display())]
    MissingShapefileInArchive(PathBuf),

    #[error("No .kml member found in archive {}", .0.display())]
    MissingKmlInArchive(PathBuf),

    #[error("Invalid resolution value: {0}")]
    InvalidResolutionType(String),

    #[error("Unsupported collection: {0}")]
    UnsupportedCollection(String),

    #[error("Empty or invalid geometry: {0}")]
    EmptyOrInvalidGeometry(String),

    #[error("Inconsistent grid shape for {label}: expected {expected:?}, found {found:?}")]
    InconsistentGridShape {
        label: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Inconsistent grid transform for {label}: slices must share one georeferencing")]
    InconsistentGridTransform { label: String },

    #[error("Imagery service error: {0}")]
    Service(String),

    #[error("Working directory cleanup failed after {attempts} attempts: {message}")]
    Cleanup { attempts: usize, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl RoiError {
    /// Place the error in the recoverability taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoiError::InvalidInput(_)
            | RoiError::InvalidGeometryKind(_)
            | RoiError::UnsupportedFormat(_)
            | RoiError::FileNotFound(_)
            | RoiError::MissingShapefileInArchive(_)
            | RoiError::MissingKmlInArchive(_)
            | RoiError::InvalidResolutionType(_)
            | RoiError::UnsupportedCollection(_)
            | RoiError::EmptyOrInvalidGeometry(_) => ErrorKind::InputValidation,
            RoiError::Service(_) | RoiError::Http(_) | RoiError::Spreadsheet(_) => {
                ErrorKind::ExternalService
            }
            RoiError::Cleanup { .. } => ErrorKind::ResourceCleanup,
            RoiError::InconsistentGridShape { .. } | RoiError::InconsistentGridTransform { .. } => {
                ErrorKind::DataConsistency
            }
            RoiError::Io(_)
            | RoiError::Gdal(_)
            | RoiError::Zip(_)
            | RoiError::Json(_)
            | RoiError::Csv(_)
            | RoiError::Processing(_) => ErrorKind::Io,
        }
    }
}

/// Result type for region extraction operations
pub type RoiResult<T> = Result<T, RoiError>;
