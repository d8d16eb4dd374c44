use std::sync::Arc;

use crate::config::Settings;
use crate::observability::Metrics;
use crate::store::JobStore;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn JobStore>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn JobStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            settings,
            store,
            metrics,
        }
    }
}
