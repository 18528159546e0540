//! Time-series extraction over a region
//!
//! Two flavours share one table model:
//!
//! * per-image spectral-index statistics for an ordered list of images, and
//! * per-bucket statistics of climate variables, where each bucket is a
//!   temporal composite (sum or mean) of the collection's native images.
//!
//! Per-item failures never abort a series: the row (or the variable's columns
//! in that row) is recorded as missing and the loop moves on.

use crate::core::query::{acquisition_time, QueryAdapter, DEFAULT_MAX_PIXELS};
use crate::core::region::Region;
use crate::core::sensor::{infer_scale, SpectralIndex};
use crate::core::table::TimeSeriesTable;
use crate::io::service::{ImageSource, ImageryService, TemporalReducer};
use crate::types::{RoiError, RoiResult, Statistic};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Image identifier with an optional known acquisition time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub acquired: Option<DateTime<Utc>>,
}

impl ImageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            acquired: None,
        }
    }

    pub fn acquired_at(mut self, acquired: DateTime<Utc>) -> Self {
        self.acquired = Some(acquired);
        self
    }
}

impl From<&str> for ImageRef {
    fn from(id: &str) -> Self {
        ImageRef::new(id)
    }
}

/// Length of a time bucket, ordered from finest to coarsest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Daily,
    Monthly,
    Yearly,
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cadence::Daily => "daily",
            Cadence::Monthly => "monthly",
            Cadence::Yearly => "yearly",
        };
        write!(f, "{}", name)
    }
}

/// Half-open date interval `[start, end)` reduced to one table row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub label: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeBucket {
    pub fn new(label: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            label: label.into(),
            start,
            end,
        }
    }

    /// Row timestamp: midnight UTC on the first day of the bucket
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.start.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

fn next_bucket_start(date: NaiveDate, cadence: Cadence) -> Option<NaiveDate> {
    match cadence {
        Cadence::Daily => date.succ_opt(),
        Cadence::Monthly => {
            if date.month() == 12 {
                NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
            }
        }
        Cadence::Yearly => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
    }
}

fn bucket_label(date: NaiveDate, cadence: Cadence) -> String {
    match cadence {
        Cadence::Daily => date.format("%Y-%m-%d").to_string(),
        Cadence::Monthly => date.format("%Y-%m").to_string(),
        Cadence::Yearly => date.format("%Y").to_string(),
    }
}

/// Calendar-aligned buckets covering `[start, end)`, clipped at both ends
pub fn buckets(cadence: Cadence, start: NaiveDate, end: NaiveDate) -> RoiResult<Vec<TimeBucket>> {
    if start >= end {
        return Err(RoiError::InvalidInput(format!(
            "Empty date range: {} is not before {}",
            start, end
        )));
    }

    let mut out = Vec::new();
    let mut current = start;
    while current < end {
        let next = next_bucket_start(current, cadence)
            .ok_or_else(|| RoiError::InvalidInput(format!("Date out of range after {}", current)))?;
        let bucket_end = next.min(end);
        out.push(TimeBucket::new(bucket_label(current, cadence), current, bucket_end));
        current = next;
    }
    Ok(out)
}

/// Per-variable decoding rule of a climate collection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateVariable {
    pub name: &'static str,
    /// Raw integer-encoded value times this gives physical units
    pub multiplier: f64,
    pub unit: &'static str,
    /// How native images combine inside one bucket
    pub aggregation: TemporalReducer,
}

const fn var(name: &'static str, multiplier: f64, unit: &'static str, aggregation: TemporalReducer) -> ClimateVariable {
    ClimateVariable {
        name,
        multiplier,
        unit,
        aggregation,
    }
}

const CHIRPS_VARIABLES: [ClimateVariable; 1] = [var("precipitation", 1.0, "mm", TemporalReducer::Sum)];

const TERRACLIMATE_VARIABLES: [ClimateVariable; 14] = [
    var("aet", 0.1, "mm", TemporalReducer::Sum),
    var("def", 0.1, "mm", TemporalReducer::Sum),
    var("pdsi", 0.01, "", TemporalReducer::Mean),
    var("pet", 0.1, "mm", TemporalReducer::Sum),
    var("pr", 1.0, "mm", TemporalReducer::Sum),
    var("ro", 1.0, "mm", TemporalReducer::Sum),
    var("soil", 0.1, "mm", TemporalReducer::Mean),
    var("srad", 0.1, "W/m²", TemporalReducer::Mean),
    var("swe", 1.0, "mm", TemporalReducer::Mean),
    var("tmmn", 0.1, "°C", TemporalReducer::Mean),
    var("tmmx", 0.1, "°C", TemporalReducer::Mean),
    var("vap", 0.001, "kPa", TemporalReducer::Mean),
    var("vpd", 0.01, "kPa", TemporalReducer::Mean),
    var("vs", 0.01, "m/s", TemporalReducer::Mean),
];

/// Climate or precipitation collection profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateCollection {
    pub id: &'static str,
    pub native_cadence: Cadence,
    pub native_scale_m: f64,
    pub variables: &'static [ClimateVariable],
}

impl ClimateCollection {
    pub const CHIRPS_ID: &'static str = "UCSB-CHG/CHIRPS/DAILY";
    pub const TERRACLIMATE_ID: &'static str = "IDAHO_EPSCOR/TERRACLIMATE";

    /// CHIRPS daily precipitation
    pub fn chirps() -> Self {
        Self {
            id: Self::CHIRPS_ID,
            native_cadence: Cadence::Daily,
            native_scale_m: 5566.0,
            variables: &CHIRPS_VARIABLES,
        }
    }

    /// TerraClimate monthly water balance and climate
    pub fn terraclimate() -> Self {
        Self {
            id: Self::TERRACLIMATE_ID,
            native_cadence: Cadence::Monthly,
            native_scale_m: 4638.3,
            variables: &TERRACLIMATE_VARIABLES,
        }
    }

    pub fn from_id(collection_id: &str) -> RoiResult<Self> {
        match collection_id {
            Self::CHIRPS_ID => Ok(Self::chirps()),
            Self::TERRACLIMATE_ID => Ok(Self::terraclimate()),
            other => Err(RoiError::UnsupportedCollection(other.to_string())),
        }
    }

    pub fn variable(&self, name: &str) -> RoiResult<&'static ClimateVariable> {
        self.variables.iter().find(|v| v.name == name).ok_or_else(|| {
            let known: Vec<&str> = self.variables.iter().map(|v| v.name).collect();
            RoiError::InvalidInput(format!(
                "Variable '{}' is not in {}. Available: {}",
                name,
                self.id,
                known.join(", ")
            ))
        })
    }
}

/// Parameters of a climate-variable series
#[derive(Debug, Clone)]
pub struct VariableSeriesRequest<'a> {
    pub collection_id: String,
    pub region: &'a Region,
    /// Half-open `[start, end)`
    pub date_range: (NaiveDate, NaiveDate),
    pub cadence: Cadence,
    pub variables: Vec<String>,
    pub statistics: Vec<Statistic>,
    /// Defaults to the collection's native resolution
    pub scale: Option<f64>,
    pub max_pixels: u64,
}

impl<'a> VariableSeriesRequest<'a> {
    /// Monthly mean of every variable over the range
    pub fn new(collection_id: &str, region: &'a Region, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            region,
            date_range: (start, end),
            cadence: Cadence::Monthly,
            variables: Vec::new(),
            statistics: vec![Statistic::Mean],
            scale: None,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

/// Assembles time-indexed tables from per-item reductions
pub struct TimeSeriesExtractor<'s> {
    adapter: QueryAdapter<'s>,
}

impl<'s> TimeSeriesExtractor<'s> {
    pub fn new(service: &'s dyn ImageryService) -> Self {
        Self {
            adapter: QueryAdapter::new(service),
        }
    }

    /// Mean and standard deviation of a spectral index for each image.
    ///
    /// Columns are `<INDEX>_mean` and `<INDEX>_std`. When `scale` is `None`
    /// it is inferred per image from its bands. Rows follow the input order,
    /// sorted by time only when every row is dated.
    pub fn extract_index_series(
        &self,
        images: &[ImageRef],
        region: &Region,
        index_name: &str,
        scale: Option<f64>,
    ) -> RoiResult<TimeSeriesTable> {
        let index = SpectralIndex::from_name(index_name)?;
        let mean_column = format!("{}_mean", index.name);
        let std_column = format!("{}_std", index.name);
        let mut table = TimeSeriesTable::new(vec![mean_column, std_column]);
        table.attributes.insert("index".to_string(), index.name.to_string());

        log::info!("Extracting {} for {} images", index.name, images.len());

        for image in images {
            let mut timestamp = image.acquired;
            match self.index_row(image, region, &index, scale, &mut timestamp) {
                Ok((mean, std)) => {
                    table.push_row(image.id.clone(), timestamp, vec![mean, std])?;
                }
                Err(e) => {
                    log::debug!("Skipping {}: {}", image.id, e);
                    table.push_missing(image.id.clone(), timestamp);
                }
            }
        }

        // An undated row has no place on the time axis, so input order stands
        if table.is_fully_dated() {
            table.sort_by_time();
        } else {
            log::debug!("Some images have no acquisition time, keeping input order");
        }
        Ok(table)
    }

    fn index_row(
        &self,
        image: &ImageRef,
        region: &Region,
        index: &SpectralIndex,
        scale: Option<f64>,
        timestamp: &mut Option<DateTime<Utc>>,
    ) -> RoiResult<(Option<f64>, Option<f64>)> {
        let scale = match scale {
            Some(scale) => scale,
            None => {
                let info = self.adapter.service().image_info(&image.id)?;
                if timestamp.is_none() {
                    *timestamp = acquisition_time(&info.properties);
                }
                infer_scale(&info.bands)
            }
        };

        let source = ImageSource::SpectralIndex {
            image_id: image.id.clone(),
            index: index.name.to_string(),
        };
        let values = self.adapter.reduce(
            source,
            index.name,
            region,
            scale,
            &[Statistic::Mean, Statistic::StdDev],
        )?;

        let mean = values.get(&format!("{}_mean", index.name)).copied().flatten();
        let std = values.get(&format!("{}_stdDev", index.name)).copied().flatten();
        Ok((mean, std))
    }

    /// Climate-variable statistics per calendar bucket over the request's range
    pub fn extract_variable_series(&self, request: &VariableSeriesRequest<'_>) -> RoiResult<TimeSeriesTable> {
        let collection = ClimateCollection::from_id(&request.collection_id)?;
        if request.cadence < collection.native_cadence {
            return Err(RoiError::InvalidInput(format!(
                "{} is {}, cannot aggregate to {} buckets",
                collection.id, collection.native_cadence, request.cadence
            )));
        }

        let (start, end) = request.date_range;
        let buckets = buckets(request.cadence, start, end)?;
        let mut table = self.extract_bucket_series(request, &buckets)?;
        table.attributes.insert("cadence".to_string(), request.cadence.to_string());
        Ok(table)
    }

    /// Same as [`Self::extract_variable_series`] over caller-supplied buckets,
    /// in any order; the result is sorted by time.
    pub fn extract_bucket_series(
        &self,
        request: &VariableSeriesRequest<'_>,
        buckets: &[TimeBucket],
    ) -> RoiResult<TimeSeriesTable> {
        let collection = ClimateCollection::from_id(&request.collection_id)?;
        if request.statistics.is_empty() {
            return Err(RoiError::InvalidInput("No statistics requested".to_string()));
        }

        let variables: Vec<&ClimateVariable> = if request.variables.is_empty() {
            collection.variables.iter().collect()
        } else {
            request
                .variables
                .iter()
                .map(|name| collection.variable(name))
                .collect::<RoiResult<Vec<_>>>()?
        };

        // Column set is fixed here, before any reduction runs
        let mut columns = Vec::with_capacity(variables.len() * request.statistics.len());
        for variable in &variables {
            for statistic in &request.statistics {
                columns.push(format!("{}_{}", variable.name, statistic.column_suffix()));
            }
        }

        let mut table = TimeSeriesTable::new(columns);
        for variable in &variables {
            table.units.insert(variable.name.to_string(), variable.unit.to_string());
        }
        table.attributes.insert("collection".to_string(), collection.id.to_string());

        let scale = request.scale.unwrap_or(collection.native_scale_m);
        log::info!(
            "Extracting {} variable(s) from {} over {} bucket(s) at {} m",
            variables.len(),
            collection.id,
            buckets.len(),
            scale
        );

        for bucket in buckets {
            let mut row = Vec::with_capacity(table.columns().len());
            for variable in &variables {
                let source = ImageSource::Composite {
                    collection_id: collection.id.to_string(),
                    band: variable.name.to_string(),
                    start: bucket.start,
                    end: bucket.end,
                    reducer: variable.aggregation,
                };
                let result = self.adapter.reduce_with_budget(
                    source,
                    variable.name,
                    request.region,
                    scale,
                    &request.statistics,
                    request.max_pixels,
                );

                match result {
                    Ok(values) => {
                        for statistic in &request.statistics {
                            let key = format!("{}_{}", variable.name, statistic.key());
                            let value = values.get(&key).copied().flatten();
                            row.push(value.map(|v| v * variable.multiplier));
                        }
                    }
                    Err(e) => {
                        log::debug!("{} failed for bucket {}: {}", variable.name, bucket.label, e);
                        row.extend(std::iter::repeat(None).take(request.statistics.len()));
                    }
                }
            }
            table.push_row(bucket.label.clone(), Some(bucket.timestamp()), row)?;
        }

        table.sort_by_time();
        Ok(table)
    }
}
