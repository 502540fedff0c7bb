//! Application state for the API server

use crate::Config;
use crate::service::PackageService;
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned for each request (cheap Arc clones).
#[derive(Clone)]
pub struct AppState {
    /// Package submissions and queries
    pub service: Arc<PackageService>,

    /// Configuration (read-only)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(service: Arc<PackageService>, config: Arc<Config>) -> Self {
        Self { service, config }
    }
}
