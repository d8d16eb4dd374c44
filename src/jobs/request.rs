//! Submission payloads and their validation.
//!
//! `JobRequest` is a tagged union on `job_type`. Payloads arrive as raw JSON
//! at the admission boundary; [`JobRequest::parse`] is the only constructor
//! there and rejects unknown fields before semantic validation runs.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::aoi::{self, AoiError};
use super::sandbox;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("missing or invalid job_type")]
    MissingJobType,
    #[error("unsupported job_type: {0}")]
    UnsupportedJobType(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("collection must match [A-Za-z0-9_-]+")]
    InvalidCollection,
    #[error("product_type must not be empty")]
    EmptyProductType,
    #[error("end_date must not precede start_date")]
    InvertedDateRange,
    #[error("aoi must contain exactly one of wkt or geojson")]
    AmbiguousAoi,
    #[error("invalid aoi geometry: {0}")]
    InvalidAoi(#[from] AoiError),
    #[error("product_ids must contain between 1 and 1000 non-empty entries")]
    InvalidProductIds,
    #[error("invalid output_dir: {0}")]
    InvalidOutputDir(String),
}

/// Supported acquisition providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Copernicus,
    Usgs,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::Copernicus, ProviderKind::Usgs];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Copernicus => "copernicus",
            ProviderKind::Usgs => "usgs",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copernicus" => Ok(ProviderKind::Copernicus),
            "usgs" => Ok(ProviderKind::Usgs),
            other => Err(format!("unsupported provider: {other}")),
        }
    }
}

/// Area of interest: exactly one of `wkt` or `geojson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aoi {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wkt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geojson: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchDownloadRequest {
    pub provider: ProviderKind,
    pub collection: String,
    pub product_type: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub aoi: Aoi,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProductsRequest {
    pub provider: ProviderKind,
    pub collection: String,
    pub product_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

/// Validated submission, tagged on `job_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum JobRequest {
    SearchDownload(SearchDownloadRequest),
    DownloadProducts(DownloadProductsRequest),
}

const SEARCH_DOWNLOAD_FIELDS: &[&str] = &[
    "job_type",
    "provider",
    "collection",
    "product_type",
    "start_date",
    "end_date",
    "aoi",
    "tile_id",
    "output_dir",
];

const DOWNLOAD_PRODUCTS_FIELDS: &[&str] =
    &["job_type", "provider", "collection", "product_ids", "output_dir"];

const AOI_FIELDS: &[&str] = &["wkt", "geojson"];

const MAX_PRODUCT_IDS: usize = 1000;

impl JobRequest {
    /// Parse and validate a raw submission payload. This is the admission
    /// boundary's only constructor: unknown fields are rejected, then the
    /// typed representation is checked semantically.
    pub fn parse(value: &Value) -> Result<Self, RequestError> {
        let object = value.as_object().ok_or(RequestError::NotAnObject)?;

        let job_type = object
            .get("job_type")
            .and_then(Value::as_str)
            .ok_or(RequestError::MissingJobType)?;

        let allowed = match job_type {
            "search_download" => SEARCH_DOWNLOAD_FIELDS,
            "download_products" => DOWNLOAD_PRODUCTS_FIELDS,
            other => return Err(RequestError::UnsupportedJobType(other.to_string())),
        };

        for key in object.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(RequestError::UnknownField(key.clone()));
            }
        }

        if let Some(aoi) = object.get("aoi").and_then(Value::as_object) {
            for key in aoi.keys() {
                if !AOI_FIELDS.contains(&key.as_str()) {
                    return Err(RequestError::UnknownField(format!("aoi.{key}")));
                }
            }
        }

        let request: JobRequest = serde_json::from_value(value.clone())
            .map_err(|e| map_deserialize_error(value, e))?;
        request.validate()?;
        Ok(request)
    }

    fn validate(&self) -> Result<(), RequestError> {
        match self {
            JobRequest::SearchDownload(req) => {
                validate_collection(&req.collection)?;
                if req.product_type.trim().is_empty() {
                    return Err(RequestError::EmptyProductType);
                }
                if req.end_date < req.start_date {
                    return Err(RequestError::InvertedDateRange);
                }
                validate_aoi(&req.aoi)?;
                validate_output_dir(req.output_dir.as_deref())?;
            }
            JobRequest::DownloadProducts(req) => {
                validate_collection(&req.collection)?;
                if req.product_ids.is_empty()
                    || req.product_ids.len() > MAX_PRODUCT_IDS
                    || req.product_ids.iter().any(|id| id.trim().is_empty())
                {
                    return Err(RequestError::InvalidProductIds);
                }
                validate_output_dir(req.output_dir.as_deref())?;
            }
        }
        Ok(())
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            JobRequest::SearchDownload(req) => req.provider,
            JobRequest::DownloadProducts(req) => req.provider,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            JobRequest::SearchDownload(req) => &req.collection,
            JobRequest::DownloadProducts(req) => &req.collection,
        }
    }

    pub fn output_dir(&self) -> Option<&str> {
        match self {
            JobRequest::SearchDownload(req) => req.output_dir.as_deref(),
            JobRequest::DownloadProducts(req) => req.output_dir.as_deref(),
        }
    }

    pub fn job_type(&self) -> &'static str {
        match self {
            JobRequest::SearchDownload(_) => "search_download",
            JobRequest::DownloadProducts(_) => "download_products",
        }
    }
}

fn map_deserialize_error(value: &Value, err: serde_json::Error) -> RequestError {
    // Surface the one error serde buries in a generic message.
    if let Some(provider) = value.get("provider").and_then(Value::as_str) {
        if ProviderKind::from_str_checked(provider).is_none() {
            return RequestError::UnsupportedProvider(provider.to_string());
        }
    }
    RequestError::Malformed(err.to_string())
}

impl ProviderKind {
    fn from_str_checked(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

fn validate_collection(collection: &str) -> Result<(), RequestError> {
    let ok = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok { Ok(()) } else { Err(RequestError::InvalidCollection) }
}

fn validate_aoi(aoi: &Aoi) -> Result<(), RequestError> {
    match (&aoi.wkt, &aoi.geojson) {
        (Some(wkt), None) => {
            aoi::parse_wkt(wkt)?;
            Ok(())
        }
        (None, Some(geojson)) => {
            aoi::parse_geojson(geojson)?;
            Ok(())
        }
        _ => Err(RequestError::AmbiguousAoi),
    }
}

fn validate_output_dir(output_dir: Option<&str>) -> Result<(), RequestError> {
    if let Some(dir) = output_dir {
        sandbox::validate_relative(dir)
            .map_err(|e| RequestError::InvalidOutputDir(e.to_string()))?;
    }
    Ok(())
}
