//! Read-only HTTP API over the captured images in blob storage.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use timelapse_common::catalog::group_images;
use timelapse_common::config::GalleryConfig;
use timelapse_common::naming::DATE_FORMAT;
use timelapse_common::{BlobStore, CaptureTimestamp, ExposureLevels, ExposureSet};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BlobStore>,
    /// `{timelapse_name}/images`
    pub images_prefix: String,
    pub levels: ExposureLevels,
    pub presigned_url_expiry: Duration,
}

/// One capture day
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DaySummary {
    pub day: String,
    pub series_count: usize,
}

#[derive(Debug, Serialize)]
pub struct DayListResponse {
    pub days: Vec<DaySummary>,
}

/// One series within a day
#[derive(Debug, Serialize)]
pub struct SeriesSummary {
    pub series: String,
    pub captured_at: DateTime<Utc>,
    pub image_count: usize,
    pub is_full: bool,
}

#[derive(Debug, Serialize)]
pub struct DayResponse {
    pub day: String,
    pub series: Vec<SeriesSummary>,
}

/// One image of a series
#[derive(Debug, Serialize)]
pub struct ImageEntry {
    pub key: String,
    pub shutter_speed_percent: u32,
    /// Presigned URL (if requested and supported by the store)
    pub url: Option<String>,
    pub url_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub day: String,
    pub series: String,
    pub captured_at: DateTime<Utc>,
    pub is_full: bool,
    pub images: Vec<ImageEntry>,
}

/// Query parameters for series endpoints
#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    /// Include presigned URLs
    #[serde(default)]
    pub include_urls: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn storage_error(e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "Storage request failed");
    api_error(
        StatusCode::BAD_GATEWAY,
        "STORAGE_ERROR",
        "Failed to query blob storage",
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &GalleryConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/days", get(list_days))
        .route("/api/v1/days/:day", get(get_day))
        .route("/api/v1/days/:day/:series", get(get_series))
        .route("/api/v1/latest", get(get_latest))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "timelapse-gallery",
        "store": state.store.describe(),
    }))
}

impl AppState {
    async fn list_keys(&self, relative: &str) -> Result<Vec<String>, ApiError> {
        let prefix = format!("{}/{}", self.images_prefix.trim_end_matches('/'), relative);
        self.store.list(&prefix).await.map_err(storage_error)
    }

    /// Group keys into sets, skipping names that do not follow the layout.
    /// Exposure sets among `keys`, grouped one series directory at a time so
    /// an inconsistent series only hides itself.
    fn group(&self, keys: &[String]) -> Vec<ExposureSet> {
        let mut by_series: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for key in keys {
            let series = key.rsplit_once('/').map_or("", |(dir, _)| dir);
            by_series.entry(series).or_default().push(key);
        }

        let mut sets = Vec::new();
        for (series, keys) in by_series {
            match group_images(keys, &self.levels, false) {
                Ok(catalog) => sets.extend(catalog.into_sets()),
                Err(e) => warn!(series, error = %e, "Ignoring inconsistent series"),
            }
        }
        sets.sort_by_key(ExposureSet::id);
        sets
    }

    /// Day component of a key below the images prefix.
    fn day_of<'k>(&self, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(self.images_prefix.trim_end_matches('/'))?
            .strip_prefix('/')?
            .split('/')
            .next()
    }

    async fn series_response(&self, set: &ExposureSet, include_urls: bool) -> SeriesResponse {
        let mut images = Vec::with_capacity(set.len());
        for image in set.images() {
            let key = image.path.to_string_lossy().into_owned();
            let (url, url_expires_at) = if include_urls {
                match self.store.presigned_url(&key, self.presigned_url_expiry).await {
                    Ok(Some(url)) => (
                        Some(url),
                        chrono::Duration::from_std(self.presigned_url_expiry)
                            .ok()
                            .map(|d| Utc::now() + d),
                    ),
                    Ok(None) => (None, None),
                    Err(e) => {
                        error!(error = %e, key = %key, "Failed to generate presigned URL");
                        (None, None)
                    }
                }
            } else {
                (None, None)
            };
            images.push(ImageEntry {
                key,
                shutter_speed_percent: image.level.percent(),
                url,
                url_expires_at,
            });
        }

        SeriesResponse {
            day: set.id().date_str(),
            series: set.name(),
            captured_at: set.id().utc(),
            is_full: set.is_full(),
            images,
        }
    }
}

fn parse_day(day: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(day, DATE_FORMAT).map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_DAY",
            format!("{day:?} is not a YYYY-MM-DD date"),
        )
    })
}

/// All capture days, newest first
#[instrument(skip(state))]
async fn list_days(State(state): State<AppState>) -> Result<Json<DayListResponse>, ApiError> {
    let keys = state.list_keys("").await?;

    let mut days: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in &keys {
        if let Some(day) = state.day_of(key) {
            if parse_day(day).is_ok() {
                days.entry(day.to_string()).or_default().push(key.clone());
            }
        }
    }

    let days = days
        .into_iter()
        .rev()
        .map(|(day, keys)| DaySummary {
            series_count: state.group(&keys).len(),
            day,
        })
        .collect();

    Ok(Json(DayListResponse { days }))
}

/// Series captured on one day, oldest first
#[instrument(skip(state))]
async fn get_day(
    State(state): State<AppState>,
    Path(day): Path<String>,
) -> Result<Json<DayResponse>, ApiError> {
    parse_day(&day)?;
    let keys = state.list_keys(&format!("{day}/")).await?;
    let sets = state.group(&keys);
    if sets.is_empty() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("No images on {day}"),
        ));
    }

    let series = sets
        .iter()
        .map(|set| SeriesSummary {
            series: set.name(),
            captured_at: set.id().utc(),
            image_count: set.len(),
            is_full: set.is_full(),
        })
        .collect();

    Ok(Json(DayResponse { day, series }))
}

/// Images of one series
#[instrument(skip(state))]
async fn get_series(
    State(state): State<AppState>,
    Path((day, series)): Path<(String, String)>,
    Query(params): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, ApiError> {
    parse_day(&day)?;
    let id = CaptureTimestamp::parse(&series)
        .ok()
        .filter(|id| id.date_str() == day)
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_SERIES",
                format!("{series:?} is not a series of {day}"),
            )
        })?;

    let keys = state.list_keys(&format!("{day}/{series}/")).await?;
    let set = state
        .group(&keys)
        .into_iter()
        .find(|s| s.id() == id)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Series {series} not found"),
            )
        })?;

    Ok(Json(state.series_response(&set, params.include_urls).await))
}

/// Most recent series
#[instrument(skip(state))]
async fn get_latest(
    State(state): State<AppState>,
    Query(params): Query<SeriesQuery>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let keys = state.list_keys("").await?;
    let Some(newest_day) = keys
        .iter()
        .filter_map(|k| state.day_of(k))
        .filter(|d| parse_day(d).is_ok())
        .max()
    else {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "No images captured yet",
        ));
    };

    let day_keys: Vec<String> = keys
        .iter()
        .filter(|k| state.day_of(k) == Some(newest_day))
        .cloned()
        .collect();
    let set = state
        .group(&day_keys)
        .pop()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "No images captured yet"))?;

    Ok(Json(state.series_response(&set, params.include_urls).await))
}

/// Start the gallery API server
pub async fn start_api_server(
    state: AppState,
    config: &GalleryConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use timelapse_common::LocalBlobStore;

    const PREFIX: &str = "annolapse1/images";

    async fn state_with(keys: &[&str]) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        for key in keys {
            store.upload(key, Bytes::from_static(b"jpeg")).await.unwrap();
        }
        let state = AppState {
            store: Arc::new(store),
            images_prefix: PREFIX.to_string(),
            levels: ExposureLevels::new(&[50, 100]).unwrap(),
            presigned_url_expiry: Duration::from_secs(60),
        };
        (dir, state)
    }

    fn key(series: &str, percent: u32) -> String {
        format!("{PREFIX}/{}/{series}/{series}--shutter_{percent:03}.jpg", &series[..10])
    }

    async fn sample_state() -> (tempfile::TempDir, AppState) {
        let keys = [
            key("2022-03-26T10-30-00", 50),
            key("2022-03-26T10-30-00", 100),
            key("2022-03-26T10-40-00", 50),
            key("2022-03-27T09-00-00", 50),
            key("2022-03-27T09-00-00", 100),
            key("2022-03-27T09-10-00", 50),
            key("2022-03-27T09-10-00", 100),
        ];
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        state_with(&keys).await
    }

    #[tokio::test]
    async fn test_days_newest_first() {
        let (_dir, state) = sample_state().await;

        let Json(response) = list_days(State(state)).await.unwrap();

        assert_eq!(
            response.days,
            vec![
                DaySummary {
                    day: "2022-03-27".to_string(),
                    series_count: 2
                },
                DaySummary {
                    day: "2022-03-26".to_string(),
                    series_count: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_day_lists_series_with_fullness() {
        let (_dir, state) = sample_state().await;

        let Json(response) = get_day(State(state), Path("2022-03-26".to_string()))
            .await
            .unwrap();

        assert_eq!(response.series.len(), 2);
        assert_eq!(response.series[0].series, "2022-03-26T10-30-00");
        assert_eq!(response.series[0].image_count, 2);
        assert!(response.series[0].is_full);
        assert_eq!(response.series[1].image_count, 1);
        assert!(!response.series[1].is_full);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_days() {
        let (_dir, state) = sample_state().await;

        let (status, _) = get_day(State(state.clone()), Path("2022-04-01".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(body)) = get_day(State(state), Path("yesterday".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "INVALID_DAY");
    }

    #[tokio::test]
    async fn test_series_images_ordered_by_level() {
        let (_dir, state) = sample_state().await;

        let Json(response) = get_series(
            State(state),
            Path(("2022-03-27".to_string(), "2022-03-27T09-00-00".to_string())),
            Query(SeriesQuery { include_urls: true }),
        )
        .await
        .unwrap();

        assert!(response.is_full);
        let levels: Vec<_> = response.images.iter().map(|i| i.shutter_speed_percent).collect();
        assert_eq!(levels, vec![50, 100]);
        assert_eq!(response.images[1].key, key("2022-03-27T09-00-00", 100));
        // The local store cannot presign
        assert!(response.images.iter().all(|i| i.url.is_none()));
    }

    #[tokio::test]
    async fn test_series_must_belong_to_day() {
        let (_dir, state) = sample_state().await;

        let (status, Json(body)) = get_series(
            State(state),
            Path(("2022-03-26".to_string(), "2022-03-27T09-00-00".to_string())),
            Query(SeriesQuery::default()),
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "INVALID_SERIES");
    }

    #[tokio::test]
    async fn test_latest_series() {
        let (_dir, state) = sample_state().await;

        let Json(response) = get_latest(State(state), Query(SeriesQuery::default()))
            .await
            .unwrap();

        assert_eq!(response.series, "2022-03-27T09-10-00");
        assert_eq!(response.day, "2022-03-27");
    }

    #[tokio::test]
    async fn test_inconsistent_series_hides_only_itself() {
        let good = "2022-03-28T10-00-00";
        let bad = "2022-03-28T10-10-00";
        let keys = [
            key(good, 50),
            key(good, 100),
            key(bad, 50),
            format!("{PREFIX}/2022-03-28/{bad}/{bad}--shutter_50.jpg"),
        ];
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (_dir, state) = state_with(&keys).await;

        let Json(day) = get_day(State(state.clone()), Path("2022-03-28".to_string()))
            .await
            .unwrap();
        assert_eq!(day.series.len(), 1);
        assert_eq!(day.series[0].series, good);

        let Json(days) = list_days(State(state.clone())).await.unwrap();
        assert_eq!(days.days[0].series_count, 1);

        let Json(latest) = get_latest(State(state), Query(SeriesQuery::default()))
            .await
            .unwrap();
        assert_eq!(latest.series, good);
    }

    #[tokio::test]
    async fn test_latest_on_empty_store() {
        let (_dir, state) = state_with(&[]).await;

        let (status, _) = get_latest(State(state), Query(SeriesQuery::default()))
            .await
            .unwrap_err();

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_day_of_key() {
        let state = AppState {
            store: Arc::new(LocalBlobStore::new("/nonexistent")),
            images_prefix: PREFIX.to_string(),
            levels: ExposureLevels::new(&[100]).unwrap(),
            presigned_url_expiry: Duration::from_secs(60),
        };
        assert_eq!(state.day_of(&key("2022-03-26T10-30-00", 50)), Some("2022-03-26"));
        assert_eq!(state.day_of("other/images/2022-03-26/x.jpg"), None);
    }
}
