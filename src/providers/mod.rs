//! Provider abstraction.
//!
//! A provider knows how to authenticate against an external catalog, search
//! it for products matching a validated request, and resolve a product into
//! downloadable URLs. Concrete implementations (Copernicus OData, USGS M2M)
//! live outside this crate; the registry maps provider keys to instances
//! wired in at startup. The worker treats everything behind this trait as an
//! external collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::jobs::{JobRequest, ProviderKind};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("resolve failed for product {product_id}: {message}")]
    Resolve { product_id: String, message: String },
    #[error("transient provider error: {0}")]
    Transient(String),
}

/// One provider-defined acquisition unit.
#[derive(Debug, Clone)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub metadata: Value,
}

/// A downloadable file belonging to a product.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub url: String,
    /// Suggested filename; sanitized by the download manager before use.
    pub filename: String,
    /// Authorization header value, when the provider requires one.
    pub auth: Option<String>,
}

/// Capability set of an acquisition provider.
#[async_trait]
pub trait Provider: Send + Sync {
    fn key(&self) -> ProviderKind;

    /// Establish or verify credentials. Called once per job before search.
    async fn authenticate(&self) -> Result<(), ProviderError>;

    /// Search for products matching the request. For `download_products`
    /// requests this resolves the listed product ids; the request carries
    /// the collection, so no provider state is mutated.
    async fn search(&self, request: &JobRequest) -> Result<Vec<Product>, ProviderError>;

    /// Resolve a product into download URLs with filename hints.
    async fn resolve(&self, product: &Product) -> Result<Vec<DownloadSource>, ProviderError>;

    /// Obtain a fresh Authorization value after a 401. Providers without
    /// refreshable tokens keep the default.
    async fn refresh_token(&self) -> Option<String> {
        None
    }
}

/// Registry mapping provider keys to instances.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.key(), provider);
    }

    pub fn get(&self, key: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.get(&key).cloned()
    }

    pub fn keys(&self) -> Vec<ProviderKind> {
        self.providers.keys().copied().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.keys())
            .finish()
    }
}
