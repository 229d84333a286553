//! HTTP and websocket entropy server.
//!
//! Serves raw hardware TRNG output over plain-text routes, a JSON batch API
//! and a websocket streaming protocol. Every route takes an optional
//! `deviceId` query parameter; a deployment with a single device may omit it.

pub mod session;
mod ws;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use quanttp_core::{
    Batch, BatchData, BatchRequest, Dispatcher, DrawKind, Error, Format, Limits, SourceRegistry,
    SourceStatus, format,
};

/// Server settings supplied by the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name reported in every envelope as `server`.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "quanttp".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            limits: Limits::default(),
        }
    }
}

/// Shared server state.
struct AppState {
    name: String,
    dispatcher: Dispatcher,
}

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    // Kept as text so that non-numeric input reaches `parse_count` and gets
    // its message instead of a generic extractor rejection.
    length: Option<String>,
    size: Option<String>,
}

#[derive(Serialize)]
struct BatchResponse<'a> {
    server: &'a str,
    device: String,
    status: SourceStatus,
    #[serde(rename = "type")]
    data_type: &'static str,
    format: Format,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    data: BatchData,
    success: bool,
}

impl<'a> BatchResponse<'a> {
    fn new(server: &'a str, batch: Batch) -> Self {
        Self {
            server,
            device: batch.device,
            status: batch.status,
            data_type: "string",
            format: batch.format,
            length: batch.length,
            size: batch.size,
            data: batch.data,
            success: true,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,
    success: bool,
}

#[derive(Serialize)]
struct DeviceStatus {
    device: String,
    status: SourceStatus,
}

#[derive(Serialize)]
struct StatusResponse<'a> {
    server: &'a str,
    devices: Vec<DeviceStatus>,
}

#[derive(Serialize)]
struct DevicesResponse<'a> {
    server: &'a str,
    devices: Vec<&'a str>,
}

fn status_of(err: &Error) -> StatusCode {
    if err.is_caller_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Plain-text failure for the original API routes.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if !self.0.is_caller_error() {
            log::warn!("request failed: {}", self.0);
        }
        (status_of(&self.0), self.0.to_string()).into_response()
    }
}

/// JSON failure envelope for the `/api/json/*` routes.
struct JsonError {
    error: Error,
    device: Option<String>,
}

impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        if !self.error.is_caller_error() {
            log::warn!("request failed: {}", self.error);
        }
        let device = match &self.error {
            Error::DeviceFault { device, .. } => Some(device.clone()),
            _ => self.device,
        };
        let body = ErrorResponse {
            error: self.error.to_string(),
            device,
            success: false,
        };
        (status_of(&self.error), Json(body)).into_response()
    }
}

/// Run a dispatcher call on the blocking pool. Device draws never execute
/// on the task that accepts connections or reads requests.
async fn blocking<T, F>(state: &Arc<AppState>, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&Dispatcher) -> Result<T, Error> + Send + 'static,
{
    let state = Arc::clone(state);
    match tokio::task::spawn_blocking(move || f(&state.dispatcher)).await {
        Ok(result) => result,
        Err(e) => Err(Error::DeviceFault {
            device: "unknown".to_string(),
            reason: format!("draw task failed: {e}"),
        }),
    }
}

fn text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

// ---------------------------------------------------------------------------
// Original API
// ---------------------------------------------------------------------------

async fn draw_text(
    state: &Arc<AppState>,
    params: Params,
    kind: DrawKind,
) -> Result<Response, ApiError> {
    let value = blocking(state, move |d| d.one_shot(params.device_id.as_deref(), kind)).await?;
    Ok(text(value.to_text()))
}

async fn handle_randint32(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    draw_text(&state, params, DrawKind::Int32).await
}

async fn handle_randuniform(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    draw_text(&state, params, DrawKind::Uniform).await
}

async fn handle_randnormal(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    draw_text(&state, params, DrawKind::Normal).await
}

async fn draw_bytes(state: &Arc<AppState>, params: Params) -> Result<Vec<u8>, ApiError> {
    let bytes = blocking(state, move |d| {
        d.bytes(params.device_id.as_deref(), params.length.as_deref())
    })
    .await?;
    Ok(bytes)
}

async fn handle_randhex(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    Ok(text(format::hex(&draw_bytes(&state, params).await?)))
}

async fn handle_randbase64(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    Ok(text(format::base64(&draw_bytes(&state, params).await?)))
}

async fn handle_randbytes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let bytes = draw_bytes(&state, params).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes).into_response())
}

async fn handle_clear(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<StatusCode, ApiError> {
    blocking(&state, move |d| d.clear(params.device_id.as_deref())).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_reset(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<StatusCode, ApiError> {
    blocking(&state, move |d| d.reset(params.device_id.as_deref())).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    let statuses = blocking(&state, move |d| d.status(params.device_id.as_deref())).await?;
    let devices = statuses
        .into_iter()
        .map(|(device, status)| DeviceStatus { device, status })
        .collect();
    Ok(Json(StatusResponse {
        server: &state.name,
        devices,
    })
    .into_response())
}

async fn handle_devices(State(state): State<Arc<AppState>>) -> Response {
    Json(DevicesResponse {
        server: &state.name,
        devices: state.dispatcher.registry().list_ids(),
    })
    .into_response()
}

// ---------------------------------------------------------------------------
// JSON API
// ---------------------------------------------------------------------------

async fn json_batch(state: &Arc<AppState>, params: Params, format: Format) -> Response {
    let device = params.device_id.clone();
    let result = blocking(state, move |d| {
        d.batch(
            format,
            BatchRequest {
                device_id: params.device_id.as_deref(),
                length: params.length.as_deref(),
                size: params.size.as_deref(),
            },
        )
    })
    .await;
    match result {
        Ok(batch) => Json(BatchResponse::new(&state.name, batch)).into_response(),
        Err(error) => JsonError { error, device }.into_response(),
    }
}

async fn handle_json_randint32(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    json_batch(&state, params, Format::Int32).await
}

async fn handle_json_randuniform(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    json_batch(&state, params, Format::Uniform).await
}

async fn handle_json_randnormal(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    json_batch(&state, params, Format::Normal).await
}

async fn handle_json_randhex(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    json_batch(&state, params, Format::Hex).await
}

async fn handle_json_randbase64(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
) -> Response {
    json_batch(&state, params, Format::Base64).await
}

// ---------------------------------------------------------------------------
// Websocket, index, fallback
// ---------------------------------------------------------------------------

async fn handle_ws(
    State(state): State<Arc<AppState>>,
    Query(params): Query<Params>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let registry = Arc::clone(state.dispatcher.registry());
    let limits = state.dispatcher.limits();
    upgrade.on_upgrade(move |socket| ws::serve_socket(socket, registry, limits, params.device_id))
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let ids = state.dispatcher.registry().list_ids();
    let limits = state.dispatcher.limits();

    Json(serde_json::json!({
        "name": state.name,
        "version": quanttp_core::VERSION,
        "devices": ids,
        "endpoints": {
            "/": "This API index",
            "/api/devices": "List device ids",
            "/api/status": "Status of every device, or of ?deviceId=",
            "/api/randint32": "One 32-bit integer as text",
            "/api/randuniform": "One uniform double as text",
            "/api/randnormal": "One normal double as text",
            "/api/randhex": format!("?length=N (1-{}) random bytes as lowercase hex", limits.max_length),
            "/api/randbase64": format!("?length=N (1-{}) random bytes as base64", limits.max_length),
            "/api/randbytes": format!("?length=N (1-{}) raw random bytes", limits.max_length),
            "/api/clear": "Discard buffered device entropy",
            "/api/reset": "Reinitialize the device",
            "/api/json/randint32": "?length=N independent integers",
            "/api/json/randuniform": "?length=N independent uniform doubles",
            "/api/json/randnormal": "?length=N independent normal doubles",
            "/api/json/randhex": format!("?length=N&size=M (1-{}) hex strings", limits.max_size),
            "/api/json/randbase64": format!("?length=N&size=M (1-{}) base64 strings", limits.max_size),
            "/ws": "Websocket stream: RANDINT32, RANDBYTES n, SUBSCRIBEINT32, SUBSCRIBEHEX n, UNSUBSCRIBE, CLEAR, ...",
        },
        "params": {
            "deviceId": format!("{}-character device serial; optional with a single device", quanttp_core::DEVICE_ID_LEN),
        },
    }))
}

async fn handle_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain")],
        "Not Found",
    )
}

/// Build the axum router.
pub fn build_router(registry: Arc<SourceRegistry>, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        name: config.name.clone(),
        dispatcher: Dispatcher::new(registry, config.limits),
    });

    Router::new()
        .route("/", get(handle_index))
        .route("/api/devices", get(handle_devices))
        .route("/api/status", get(handle_status))
        .route("/api/randint32", get(handle_randint32))
        .route("/api/randuniform", get(handle_randuniform))
        .route("/api/randnormal", get(handle_randnormal))
        .route("/api/randhex", get(handle_randhex))
        .route("/api/randbase64", get(handle_randbase64))
        .route("/api/randbytes", get(handle_randbytes))
        .route("/api/clear", get(handle_clear))
        .route("/api/reset", get(handle_reset))
        .route("/api/json/randint32", get(handle_json_randint32))
        .route("/api/json/randuniform", get(handle_json_randuniform))
        .route("/api/json/randnormal", get(handle_json_randnormal))
        .route("/api/json/randhex", get(handle_json_randhex))
        .route("/api/json/randbase64", get(handle_json_randbase64))
        .route("/ws", get(handle_ws))
        .fallback(handle_not_found)
        .with_state(state)
}

/// Run the entropy server until Ctrl-C.
pub async fn run_server(registry: Arc<SourceRegistry>, config: ServerConfig) -> std::io::Result<()> {
    let app = build_router(registry, &config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutting down"),
        Err(e) => {
            log::error!("unable to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::base64::Engine as _;
    use ::base64::engine::general_purpose::STANDARD;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use quanttp_core::EntropyDevice;
    use quanttp_core::sources::{FaultPlan, SimulatedDevice};
    use tower::ServiceExt;

    fn router(n: usize) -> (Router, Vec<FaultPlan>) {
        let mut plans = Vec::new();
        let devices: Vec<Box<dyn EntropyDevice>> = (0..n)
            .map(|i| {
                let dev = SimulatedDevice::new(format!("SIM{:05}", i + 1), 40 + i as u64);
                plans.push(dev.fault_plan());
                Box::new(dev) as Box<dyn EntropyDevice>
            })
            .collect();
        let registry = Arc::new(SourceRegistry::new(devices).unwrap());
        let config = ServerConfig {
            name: "pod-a".to_string(),
            ..Default::default()
        };
        (build_router(registry, &config), plans)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let resp = app
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec();
        (status, content_type, body)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, _, body) = get(app, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    // -----------------------------------------------------------------------
    // Original API
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_scalar_routes_return_text() {
        let (app, _) = router(1);
        let (status, ct, body) = get(&app, "/api/randint32").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct.as_deref(), Some("text/plain"));
        String::from_utf8(body).unwrap().parse::<i32>().unwrap();

        for uri in ["/api/randuniform", "/api/randnormal"] {
            let (status, _, body) = get(&app, uri).await;
            assert_eq!(status, StatusCode::OK);
            String::from_utf8(body).unwrap().parse::<f64>().unwrap();
        }
    }

    #[tokio::test]
    async fn test_randhex_length() {
        let (app, _) = router(1);
        let (status, _, body) = get(&app, "/api/randhex?length=4").await;
        assert_eq!(status, StatusCode::OK);
        let hex = String::from_utf8(body).unwrap();
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn test_randbase64_decodes_to_length() {
        let (app, _) = router(1);
        let (_, _, body) = get(&app, "/api/randbase64?length=4").await;
        let decoded = STANDARD.decode(body).unwrap();
        assert_eq!(decoded.len(), 4);
    }

    #[tokio::test]
    async fn test_randbytes_octet_stream() {
        let (app, _) = router(1);
        let (status, ct, body) = get(&app, "/api/randbytes?length=33").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ct.as_deref(), Some("application/octet-stream"));
        assert_eq!(body.len(), 33);
    }

    #[tokio::test]
    async fn test_invalid_length_is_400_without_device_access() {
        let (app, plans) = router(1);
        for uri in [
            "/api/randhex?length=0",
            "/api/randbase64?length=-2",
            "/api/randbytes?length=abc",
            "/api/randbytes",
        ] {
            let (status, _, _) = get(&app, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
        let (_, _, body) = get(&app, "/api/randhex?length=0").await;
        assert_eq!(body, b"length must be greater than 0");
        assert_eq!(plans[0].draw_attempts(), 0);
    }

    #[tokio::test]
    async fn test_clear_and_reset_no_content() {
        let (app, plans) = router(1);
        assert_eq!(get(&app, "/api/clear").await.0, StatusCode::NO_CONTENT);
        assert_eq!(get(&app, "/api/reset").await.0, StatusCode::NO_CONTENT);
        assert_eq!(plans[0].resets(), 1);
    }

    #[tokio::test]
    async fn test_device_fault_is_500() {
        let (app, plans) = router(1);
        plans[0].fail_draws(2);
        let (status, _, body) = get(&app, "/api/randint32").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8(body).unwrap().contains("SIM00001"));
    }

    #[tokio::test]
    async fn test_status_reports_each_device() {
        let (app, _) = router(2);
        let (status, json) = get_json(&app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["server"], "pod-a");
        assert_eq!(json["devices"].as_array().unwrap().len(), 2);
        assert_eq!(json["devices"][0]["status"], "ONLINE");

        let (_, json) = get_json(&app, "/api/status?deviceId=SIM00002").await;
        assert_eq!(json["devices"].as_array().unwrap().len(), 1);
        assert_eq!(json["devices"][0]["device"], "SIM00002");
    }

    #[tokio::test]
    async fn test_devices_lists_ids() {
        let (app, _) = router(3);
        let (_, json) = get_json(&app, "/api/devices").await;
        assert_eq!(json["devices"], serde_json::json!(["SIM00001", "SIM00002", "SIM00003"]));
    }

    // -----------------------------------------------------------------------
    // Device addressing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_multi_device_routes_by_id() {
        let (app, plans) = router(2);
        let (status, _, _) = get(&app, "/api/randint32?deviceId=SIM00002").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plans[1].draw_attempts(), 1);
        assert_eq!(plans[0].draw_attempts(), 0);

        let (status, _, body) = get(&app, "/api/randint32").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, b"deviceId is required");
    }

    #[tokio::test]
    async fn test_bad_device_same_message_everywhere() {
        let (app, _) = router(2);
        for id in ["SIM1", "SIM00077"] {
            let mut messages = Vec::new();
            for route in ["/api/randint32", "/api/randhex?length=2", "/api/clear", "/api/status"] {
                let sep = if route.contains('?') { '&' } else { '?' };
                let (status, _, body) = get(&app, &format!("{route}{sep}deviceId={id}")).await;
                assert_eq!(status, StatusCode::BAD_REQUEST);
                messages.push(String::from_utf8(body).unwrap());
            }
            let (status, json) =
                get_json(&app, &format!("/api/json/randint32?length=2&deviceId={id}")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            messages.push(json["error"].as_str().unwrap().to_string());
            assert!(messages.iter().all(|m| *m == messages[0]), "{messages:?}");
        }
    }

    // -----------------------------------------------------------------------
    // JSON API
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_json_int32_envelope() {
        let (app, _) = router(1);
        let (status, json) = get_json(&app, "/api/json/randint32?length=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["server"], "pod-a");
        assert_eq!(json["device"], "SIM00001");
        assert_eq!(json["status"], "ONLINE");
        assert_eq!(json["type"], "string");
        assert_eq!(json["format"], "int32");
        assert_eq!(json["length"], 5);
        assert_eq!(json["success"], true);
        assert!(json.get("size").is_none());
        assert_eq!(json["data"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_json_hex_envelope_has_size() {
        let (app, _) = router(1);
        let (_, json) = get_json(&app, "/api/json/randhex?length=3&size=4").await;
        assert_eq!(json["format"], "hex");
        assert_eq!(json["size"], 4);
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert!(data.iter().all(|h| h.as_str().unwrap().len() == 8));
    }

    #[tokio::test]
    async fn test_json_base64_round_trip() {
        let (app, _) = router(1);
        let (_, json) = get_json(&app, "/api/json/randbase64?length=2&size=4").await;
        for item in json["data"].as_array().unwrap() {
            assert_eq!(STANDARD.decode(item.as_str().unwrap()).unwrap().len(), 4);
        }
    }

    #[tokio::test]
    async fn test_json_validation_errors() {
        let (app, _) = router(1);
        let (status, json) = get_json(&app, "/api/json/randuniform?length=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "length must be greater than 0");
        assert_eq!(json["success"], false);

        let (_, json) = get_json(&app, "/api/json/randhex?length=2&size=0").await;
        assert_eq!(json["error"], "size must be greater than 0");
    }

    #[tokio::test]
    async fn test_json_fault_has_no_partial_data() {
        let (app, plans) = router(1);
        plans[0].fail_draws(2);
        let (status, json) = get_json(&app, "/api/json/randnormal?length=10").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["success"], false);
        assert_eq!(json["device"], "SIM00001");
        assert!(json.get("data").is_none());
    }

    // -----------------------------------------------------------------------
    // Misc
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_index_lists_endpoints() {
        let (app, _) = router(1);
        let (status, json) = get_json(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["name"], "pod-a");
        assert!(json["endpoints"]["/ws"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let (app, _) = router(1);
        let (status, _, body) = get(&app, "/api/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, b"Not Found");
    }
}
