//! OpenAPI documentation and schema generation
//!
//! The specification is generated at compile time with utoipa and served at
//! `/api/v1/openapi.json`.

use utoipa::OpenApi;

/// OpenAPI documentation for the media-dl REST API
#[derive(OpenApi)]
#[openapi(
    info(
        title = "media-dl REST API",
        version = "0.1.0",
        description = "Submit packages of remote media for download and follow their progress",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:8000", description = "Local development server")
    ),
    paths(
        // Packages
        crate::api::routes::create_package,
        crate::api::routes::list_packages,
        crate::api::routes::get_package,
        crate::api::routes::list_package_media,

        // Files
        crate::api::routes::serve_file,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
    ),
    components(schemas(
        crate::types::MediaKind,
        crate::types::MediaStatus,
        crate::types::PackageStatus,
        crate::types::MediaItem,
        crate::types::NewPackage,
        crate::types::Media,
        crate::types::Package,
        crate::types::PackagePage,
        crate::types::MediaPage,
        crate::types::PackageId,
        crate::types::MediaId,

        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "packages", description = "Package submission and progress"),
        (name = "files", description = "Downloaded file serving"),
        (name = "system", description = "Health and API documentation"),
    )
)]
pub struct ApiDoc;
