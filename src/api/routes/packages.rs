//! Package handlers: submit, list, inspect.

use super::PageQuery;
use crate::api::AppState;
use crate::error::Result;
use crate::types::{MediaPage, NewPackage, Package, PackageId, PackagePage};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// POST /api/v1/packages - Submit a package for download
#[utoipa::path(
    post,
    path = "/api/v1/packages",
    tag = "packages",
    request_body = NewPackage,
    responses(
        (status = 201, description = "Package created and jobs queued", body = Package),
        (status = 400, description = "Invalid submission", body = crate::error::ApiError),
        (status = 503, description = "Broker unavailable; package marked failed", body = crate::error::ApiError)
    )
)]
pub async fn create_package(
    State(state): State<AppState>,
    Json(package): Json<NewPackage>,
) -> Result<(StatusCode, Json<Package>)> {
    let package = state.service.create_package(package).await?;
    Ok((StatusCode::CREATED, Json(package)))
}

/// GET /api/v1/packages - List packages, newest first
#[utoipa::path(
    get,
    path = "/api/v1/packages",
    tag = "packages",
    params(PageQuery),
    responses(
        (status = 200, description = "A page of packages", body = PackagePage)
    )
)]
pub async fn list_packages(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<PackagePage>> {
    let page = state.service.list_packages(query.page, query.size).await?;
    Ok(Json(page))
}

/// GET /api/v1/packages/:id - Get a package with its media
#[utoipa::path(
    get,
    path = "/api/v1/packages/{id}",
    tag = "packages",
    params(
        ("id" = i64, Path, description = "Package ID")
    ),
    responses(
        (status = 200, description = "Package details", body = Package),
        (status = 404, description = "Package not found", body = crate::error::ApiError)
    )
)]
pub async fn get_package(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Package>> {
    let package = state.service.get_package(PackageId(id)).await?;
    Ok(Json(package))
}

/// GET /api/v1/packages/:id/media - Page through a package's media
#[utoipa::path(
    get,
    path = "/api/v1/packages/{id}/media",
    tag = "packages",
    params(
        ("id" = i64, Path, description = "Package ID"),
        PageQuery
    ),
    responses(
        (status = 200, description = "A page of media", body = MediaPage),
        (status = 404, description = "Package not found", body = crate::error::ApiError)
    )
)]
pub async fn list_package_media(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<MediaPage>> {
    let page = state
        .service
        .list_media(PackageId(id), query.page, query.size)
        .await?;
    Ok(Json(page))
}
