//! Client for IBGE SIDRA table 5457 (municipal agricultural production)

use crate::core::table::TimeSeriesTable;
use crate::types::{RoiError, RoiResult};
use calamine::{open_workbook_from_rs, Data, Range, Reader, Xlsx};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::time::Duration;

/// (variable code, column name, unit) in table 5457
pub const CROP_VARIABLES: [(&str, &str, &str); 4] = [
    ("8331", "A.plantada", "ha"),
    ("216", "A.colhida", "ha"),
    ("214", "Q.colhida", "kg"),
    ("112", "Rendimento", "kg/ha"),
];

/// Header rows preceding the data in a SIDRA workbook
const HEADER_ROWS: usize = 4;
const YEAR_COLUMN: usize = 0;
const VALUE_COLUMN: usize = 2;
/// Coffee codes reported as beans only from 2002
const COFFEE_CROPS: [u32; 2] = [40139, 40140];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidraConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    /// SIDRA serves an incomplete certificate chain; scoped to this client
    pub accept_invalid_certs: bool,
}

impl Default for SidraConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sidra.ibge.gov.br".to_string(),
            timeout: Duration::from_secs(120),
            user_agent: format!("roitools/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: true,
        }
    }
}

pub struct SidraClient {
    config: SidraConfig,
    client: reqwest::blocking::Client,
}

impl SidraClient {
    pub fn new(config: SidraConfig) -> RoiResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| RoiError::Service(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    /// Workbook URL for one variable of one crop in one municipality
    pub fn table_url(&self, municipality: &str, variable: &str, crop: &str) -> String {
        format!(
            "{}/geratabela?format=xlsx&name=tabela5457.xlsx&terr=N&rank=-\
             &query=t/5457/n6/{}/v/{}/p/all/c782/{}/l/c782%2Bt,,p%2Bv",
            self.config.base_url.trim_end_matches('/'),
            municipality,
            variable,
            crop
        )
    }

    /// Planted area, harvested area, quantity and yield per year, joined on the year
    pub fn crop_production(&self, municipality: &str, crop: &str) -> RoiResult<TimeSeriesTable> {
        if municipality.trim().is_empty() || crop.trim().is_empty() {
            return Err(RoiError::InvalidInput(
                "Both a municipality code and a crop code are required".to_string(),
            ));
        }

        let mut series = Vec::with_capacity(CROP_VARIABLES.len());
        for (code, name, _) in CROP_VARIABLES {
            let url = self.table_url(municipality, code, crop);
            log::debug!("Downloading {} from {}", name, url);
            let bytes = self.download(&url)?;
            let range = read_first_sheet(&bytes)?;
            series.push(extract_year_values(&range)?);
        }

        let rows = merge_by_year(&series);
        let mut table = TimeSeriesTable::new(CROP_VARIABLES.iter().map(|(_, n, _)| n.to_string()).collect());
        for (year, values) in rows {
            let timestamp = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single();
            table.push_row(year.to_string(), timestamp, values)?;
        }

        for (_, name, unit) in CROP_VARIABLES {
            table.units.insert(name.to_string(), unit.to_string());
        }
        table.attributes.insert("source".to_string(), "IBGE - SIDRA (Tabela 5457)".to_string());
        table.attributes.insert("municipality".to_string(), municipality.to_string());
        table.attributes.insert("crop".to_string(), crop.to_string());

        warn_on_known_gaps(&table, crop);

        log::debug!("SIDRA table with {} years for crop {}", table.len(), crop);
        Ok(table)
    }

    fn download(&self, url: &str) -> RoiResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| RoiError::Spreadsheet(format!("Failed to download SIDRA table: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RoiError::Spreadsheet(format!(
                "HTTP {} {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                url
            )));
        }

        let content = response
            .bytes()
            .map_err(|e| RoiError::Spreadsheet(format!("Failed to read response body: {}", e)))?;
        Ok(content.to_vec())
    }
}

/// First worksheet of an xlsx workbook held in memory
pub fn read_first_sheet(bytes: &[u8]) -> RoiResult<Range<Data>> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))
        .map_err(|e| RoiError::Spreadsheet(format!("Not a valid workbook: {}", e)))?;
    workbook
        .worksheet_range_at(0)
        .ok_or_else(|| RoiError::Spreadsheet("Workbook has no sheets".to_string()))?
        .map_err(|e| RoiError::Spreadsheet(format!("Failed to read sheet: {}", e)))
}

fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(i) => Some(*i as f64),
        Data::Float(f) => Some(*f),
        // SIDRA marks suppressed or unavailable values with "-", "..", "..." or "X"
        Data::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// `(year, value)` pairs from a SIDRA sheet, header and footer rows removed
pub fn extract_year_values(range: &Range<Data>) -> RoiResult<Vec<(i32, Option<f64>)>> {
    let (_, width) = range.get_size();
    if width <= VALUE_COLUMN {
        return Err(RoiError::Spreadsheet(
            "SIDRA sheet has fewer than 3 columns".to_string(),
        ));
    }

    let rows: Vec<&[Data]> = range.rows().skip(HEADER_ROWS).collect();
    if rows.is_empty() {
        return Err(RoiError::Spreadsheet("SIDRA sheet has no data rows".to_string()));
    }

    // Last row is the source footer
    let data_rows = &rows[..rows.len() - 1];

    Ok(data_rows
        .iter()
        .filter_map(|row| {
            let year = cell_number(row.get(YEAR_COLUMN)?)? as i32;
            let value = row.get(VALUE_COLUMN).and_then(cell_number);
            Some((year, value))
        })
        .collect())
}

/// Join per-variable series on the year; missing years become `None`
pub fn merge_by_year(series: &[Vec<(i32, Option<f64>)>]) -> Vec<(i32, Vec<Option<f64>>)> {
    let counts: Vec<usize> = series.iter().map(|s| s.len()).collect();
    if counts.windows(2).any(|w| w[0] != w[1]) {
        log::warn!("SIDRA downloads returned different row counts {:?}, joining on year", counts);
    }

    let lookups: Vec<BTreeMap<i32, Option<f64>>> =
        series.iter().map(|s| s.iter().cloned().collect()).collect();
    let years: BTreeSet<i32> = series.iter().flat_map(|s| s.iter().map(|(y, _)| *y)).collect();

    years
        .into_iter()
        .map(|year| {
            let values = lookups
                .iter()
                .map(|lookup| lookup.get(&year).copied().flatten())
                .collect();
            (year, values)
        })
        .collect()
}

fn warn_on_known_gaps(table: &TimeSeriesTable, crop: &str) {
    if let Some(planted) = table.column(CROP_VARIABLES[0].1) {
        if planted.iter().all(|v| v.is_none()) {
            log::warn!("Planted area is only reported from 1988 onward");
        }
    }

    let is_coffee = crop
        .trim()
        .parse::<u32>()
        .map(|code| COFFEE_CROPS.contains(&code))
        .unwrap_or(false);
    let first_year = table.rows().iter().filter_map(|r| r.label.parse::<i32>().ok()).min();
    if is_coffee && first_year.map_or(false, |y| y < 2002) {
        log::warn!("Coffee is reported as beans only from 2002 onward");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(rows: &[(&str, Data)]) -> Range<Data> {
        let height = (HEADER_ROWS + rows.len() + 1) as u32;
        let mut range = Range::new((0, 0), (height - 1, 2));
        range.set_value((0, 0), Data::String("Tabela 5457".into()));
        for (i, (year, value)) in rows.iter().enumerate() {
            let r = (HEADER_ROWS + i) as u32;
            range.set_value((r, 0), Data::String(year.to_string()));
            range.set_value((r, 1), Data::String("Café (em grão) Total".into()));
            range.set_value((r, 2), value.clone());
        }
        range.set_value((height - 1, 0), Data::String("Fonte: IBGE".into()));
        range
    }

    #[test]
    fn test_extract_skips_header_and_footer() {
        let range = sheet(&[
            ("2019", Data::Float(1200.0)),
            ("2020", Data::String("...".into())),
            ("2021", Data::Int(1350)),
        ]);
        let values = extract_year_values(&range).unwrap();
        assert_eq!(values, vec![(2019, Some(1200.0)), (2020, None), (2021, Some(1350.0))]);
    }

    #[test]
    fn test_merge_joins_on_year() {
        let planted = vec![(2019, Some(10.0)), (2020, Some(11.0))];
        let harvested = vec![(2020, Some(9.0))];
        let merged = merge_by_year(&[planted, harvested]);
        assert_eq!(
            merged,
            vec![(2019, vec![Some(10.0), None]), (2020, vec![Some(11.0), Some(9.0)])]
        );
    }

    #[test]
    fn test_url_layout() {
        let client = SidraClient::new(SidraConfig::default()).unwrap();
        let url = client.table_url("3169406", "8331", "40139");
        assert_eq!(
            url,
            "https://sidra.ibge.gov.br/geratabela?format=xlsx&name=tabela5457.xlsx&terr=N&rank=-\
             &query=t/5457/n6/3169406/v/8331/p/all/c782/40139/l/c782%2Bt,,p%2Bv"
        );
    }

    #[test]
    fn test_empty_codes_are_rejected() {
        let client = SidraClient::new(SidraConfig::default()).unwrap();
        assert!(matches!(
            client.crop_production("", "40139"),
            Err(RoiError::InvalidInput(_))
        ));
    }
}
