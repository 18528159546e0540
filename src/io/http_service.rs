use crate::core::region::Region;
use crate::core::workdir::RetryPolicy;
use crate::io::service::{
    CollectionQuery, ExportRequest, ImageInfo, ImageryService, ReductionRequest, ReductionValues,
};
use crate::io::vector::VectorCodec;
use crate::types::{RoiError, RoiResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Connection settings for the remote imagery service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Applied to every request
    pub timeout: Duration,
    pub user_agent: String,
    /// Bearer token; session setup happens outside this crate
    pub token: Option<String>,
    /// Skip TLS verification for this client only
    pub accept_invalid_certs: bool,
    /// Retries for raster downloads
    pub download_retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(300),
            user_agent: format!("roitools/{}", env!("CARGO_PKG_VERSION")),
            token: None,
            accept_invalid_certs: false,
            download_retry: RetryPolicy::download(),
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by `ROITOOLS_SERVICE_URL`, `ROITOOLS_SERVICE_TOKEN`
    /// and `ROITOOLS_TIMEOUT_SECS`
    pub fn from_env() -> RoiResult<Self> {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("ROITOOLS_SERVICE_URL") {
            config.base_url = url;
        }
        if let Ok(token) = std::env::var("ROITOOLS_SERVICE_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
        if let Ok(secs) = std::env::var("ROITOOLS_TIMEOUT_SECS") {
            let secs: u64 = secs.trim().parse().map_err(|_| {
                RoiError::InvalidInput(format!("ROITOOLS_TIMEOUT_SECS is not a number: '{}'", secs))
            })?;
            config.timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct ReductionResponse {
    values: ReductionValues,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListImagesResponse {
    image_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntersectionResponse {
    area_m2: f64,
}

/// Blocking HTTP client for the imagery service
pub struct HttpImageryService {
    config: ServiceConfig,
    client: reqwest::blocking::Client,
}

impl HttpImageryService {
    pub fn new(config: ServiceConfig) -> RoiResult<Self> {
        if config.accept_invalid_certs {
            log::warn!("TLS certificate verification disabled for {}", config.base_url);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| RoiError::Service(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    pub fn from_env() -> RoiResult<Self> {
        Self::new(ServiceConfig::from_env()?)
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: reqwest::blocking::Response, url: &str) -> RoiResult<reqwest::blocking::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(RoiError::Service(format!(
            "HTTP {} {}: {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            url,
            body.trim()
        )))
    }

    fn post_json<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> RoiResult<T> {
        let url = self.url(path);
        log::debug!("POST {}", url);
        let response = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .map_err(|e| RoiError::Service(format!("HTTP request failed: {}", e)))?;
        let response = Self::check(response, &url)?;
        response
            .json::<T>()
            .map_err(|e| RoiError::Service(format!("Malformed response from {}: {}", url, e)))
    }

    fn download_once(&self, url: &str, body: &serde_json::Value, destination: &Path) -> RoiResult<()> {
        let response = self
            .authorize(self.client.post(url).json(body))
            .send()
            .map_err(|e| RoiError::Service(format!("HTTP request failed: {}", e)))?;
        let response = Self::check(response, url)?;

        let content = response
            .bytes()
            .map_err(|e| RoiError::Service(format!("Failed to read response body: {}", e)))?;
        if content.is_empty() {
            return Err(RoiError::Service(format!("Empty raster returned by {}", url)));
        }

        log::debug!("Downloaded {} bytes", content.len());
        std::fs::write(destination, &content)?;
        Ok(())
    }
}

impl ImageryService for HttpImageryService {
    fn reduce_region(&self, request: &ReductionRequest<'_>) -> RoiResult<ReductionValues> {
        let reducers: Vec<&str> = request.statistics.iter().map(|s| s.key()).collect();
        let body = json!({
            "source": request.source,
            "variable": request.variable,
            "region": VectorCodec::to_cloud_geometry(request.region)?,
            "scale": request.scale,
            "reducers": reducers,
            "maxPixels": request.max_pixels,
        });
        let response: ReductionResponse = self.post_json("v1/reductions", &body)?;
        Ok(response.values)
    }

    fn list_image_ids(&self, query: &CollectionQuery<'_>) -> RoiResult<Vec<String>> {
        let (start, end) = match query.date_range {
            Some((start, end)) => (Some(start.to_string()), Some(end.to_string())),
            None => (None, None),
        };
        let body = json!({
            "collectionId": query.collection_id,
            "region": VectorCodec::to_cloud_geometry(query.region)?,
            "start": start,
            "end": end,
        });
        let response: ListImagesResponse = self.post_json("v1/collections:listImages", &body)?;
        Ok(response.image_ids)
    }

    fn image_info(&self, image_id: &str) -> RoiResult<ImageInfo> {
        let url = self.url("v1/images");
        log::debug!("GET {} ({})", url, image_id);
        let response = self
            .authorize(self.client.get(&url).query(&[("id", image_id)]))
            .send()
            .map_err(|e| RoiError::Service(format!("HTTP request failed: {}", e)))?;
        let response = Self::check(response, &url)?;
        response
            .json::<ImageInfo>()
            .map_err(|e| RoiError::Service(format!("Malformed image info for {}: {}", image_id, e)))
    }

    fn intersection_area(&self, image_id: &str, region: &Region) -> RoiResult<f64> {
        let body = json!({
            "imageId": image_id,
            "region": VectorCodec::to_cloud_geometry(region)?,
        });
        let response: IntersectionResponse = self.post_json("v1/images:intersectionArea", &body)?;
        Ok(response.area_m2)
    }

    fn export_image(&self, request: &ExportRequest<'_>, destination: &Path) -> RoiResult<()> {
        let url = self.url("v1/exports");
        let body = json!({
            "source": request.source,
            "region": VectorCodec::to_cloud_geometry(request.region)?,
            "scale": request.scale,
            "crs": format!("EPSG:{}", request.epsg),
            "format": "GeoTIFF",
        });

        log::info!("Exporting raster to: {}", destination.display());
        let (attempts, result) = self
            .config
            .download_retry
            .run("Raster download", |_| self.download_once(&url, &body, destination));

        result?;
        log::debug!("Raster written after {} attempt(s)", attempts);
        Ok(())
    }
}
