//! HTTP surface of the errata pipeline. The serving layer proper lives
//! elsewhere; this router exposes only the route whose correctness
//! depends on matcher invariants: per-slice `updateinfo.xml`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

mod error;

pub use error::ApiError;

/// Shared state of the API router.
pub struct App {
    pub pool: sqlx::PgPool,
    pub meta: updateinfo::UpdateinfoMeta,
    pub dist: nevra::DistConfig,
}

/// Build the API router.
pub fn build_router(app: Arc<App>) -> axum::Router<()> {
    axum::Router::new()
        .route(
            "/api/v3/updateinfo/:product_slug/:major_version/:repo/updateinfo.xml",
            get(get_updateinfo),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

#[derive(Debug, serde::Deserialize)]
struct UpdateinfoQuery {
    arch: Option<String>,
    minor_version: Option<i32>,
}

async fn get_updateinfo(
    State(app): State<Arc<App>>,
    Path((product_slug, major_version, repo)): Path<(String, i32, String)>,
    Query(query): Query<UpdateinfoQuery>,
) -> Result<Response, ApiError> {
    let product_name = updateinfo::resolve_product_slug(&product_slug).ok_or_else(|| {
        ApiError::NotFound(format!(
            "Unknown product: {product_slug}. Valid products: {}",
            updateinfo::known_product_slugs().join(", "),
        ))
    })?;

    let arch = query.arch.ok_or_else(|| {
        ApiError::BadRequest("Missing required query parameter: arch".to_string())
    })?;
    if !app.dist.known_arches.iter().any(|known| known == &arch) {
        return Err(ApiError::BadRequest(format!(
            "Invalid architecture: {arch}. Must be one of {}",
            app.dist.known_arches.join(", "),
        )));
    }

    let product = errata_sql::products::fetch_product_by_name(product_name, &app.pool)
        .await
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| {
            ApiError::NotFound(format!("Product not found in database: {product_name}"))
        })?;

    let contexts = updateinfo::load_slice(
        product.id,
        major_version,
        query.minor_version,
        &arch,
        &repo,
        &app.pool,
    )
    .await?;
    if contexts.is_empty() {
        return Err(ApiError::NotFound(format!(
            "No advisories found for {product_name} {major_version} {repo} {arch}",
        )));
    }

    let xml = updateinfo::assemble(&contexts, &repo, &app.meta).map_err(anyhow::Error::from)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        xml,
    )
        .into_response())
}
