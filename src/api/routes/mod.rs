//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`packages`] - Package submission and queries
//! - [`files`] - Downloaded file serving
//! - [`system`] - Health and OpenAPI

use serde::{Deserialize, Serialize};

mod files;
mod packages;
mod system;

pub use files::*;
pub use packages::*;
pub use system::*;

/// Query parameters for paginated listings
#[derive(Debug, Default, Deserialize, Serialize, utoipa::IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// 1-based page number (default: 1)
    pub page: Option<u32>,
    /// Items per page (default: 10, max: 100)
    pub size: Option<u32>,
}
