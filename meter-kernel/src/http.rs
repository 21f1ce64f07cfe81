/**
 * HTTP API - REST + WebSocket surface of the meter bridge
 *
 * ROLE :
 * Thin layer for the dashboard: meter listing, naming, deletion, power
 * commands, unnamed-meter scan, broker self-test and the live event stream.
 *
 * HOW IT WORKS :
 * - Axum router, every route under /api plus /ws
 * - Optional x-api-key guard on everything except /api/health
 * - Errors always come back as {error, mac}
 * - Power commands go through CommandDispatcher; BrokerUnavailable -> 503,
 *   PublishRejected / TransportError -> 500
 */

use crate::broker::ConnectionManager;
use crate::config::BridgeConfig;
use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::fanout::{BridgeEvent, FanOut};
use crate::health::{BridgeHealth, HealthTracker};
use crate::models::{MeterId, MeterInfo, PowerState};
use crate::reconcile::{status_report, StatusReport};
use crate::router::EventRouter;
use crate::store::{DailyReading, MeterDetail, MeterStore, MeterSummary, StoreError};
use crate::topics::TopicCodec;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

const DEFAULT_READINGS_LIMIT: usize = 200;
const DEFAULT_DAILY_DAYS: usize = 30;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<BridgeConfig>,
    pub store: Arc<dyn MeterStore>,
    pub broker: Arc<ConnectionManager>,
    pub router: Arc<EventRouter>,
    pub dispatcher: CommandDispatcher,
    pub fanout: FanOut,
    pub codec: TopicCodec,
    pub health_tracker: HealthTracker,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    mac: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, mac: Option<&str>) -> Self {
        Self {
            status,
            message: message.into(),
            mac: mac.map(String::from),
        }
    }

    fn store(e: StoreError, mac: Option<&str>) -> Self {
        match e {
            StoreError::NotFound(id) => Self::new(StatusCode::NOT_FOUND, "meter not found", Some(id.as_str())),
            StoreError::NumberTaken { number, owner } => Self::new(
                StatusCode::CONFLICT,
                format!("number {number:03} already used by {owner}"),
                mac,
            ),
            other => {
                error!("store error: {other}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string(), mac)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message, "mac": self.mac }))).into_response()
    }
}

/// `Json` body whose rejections come back as `{error, mac}`.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| ApiJson(value))
            .map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text(), None))
    }
}

pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| ApiQuery(value))
            .map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text(), None))
    }
}

fn dispatch_error(e: DispatchError, mac: &MeterId) -> ApiError {
    let status = match e {
        DispatchError::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::PublishRejected { .. } | DispatchError::TransportError { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    ApiError::new(status, e.to_string(), Some(mac.as_str()))
}

fn parse_mac(raw: &str) -> Result<MeterId, ApiError> {
    MeterId::parse(raw)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid meter id: {e}"), Some(raw)))
}

/// Meter numbers are exactly three digits (`007`).
fn parse_number(raw: &str, mac: &str) -> Result<u16, ApiError> {
    if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_digit()) {
        raw.parse()
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "number must be three digits", Some(mac)))
    } else {
        Err(ApiError::new(StatusCode::BAD_REQUEST, "number must be three digits", Some(mac)))
    }
}

fn check_api_key(expected: Option<&str>, path: &str, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if path.starts_with("/api/health") {
        return Ok(());
    }

    let ok = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("rejected request to {path} without valid api key");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing or invalid api key", None));
    }
    Ok(())
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    check_api_key(app.cfg.http.api_key.as_deref(), req.uri().path(), req.headers())?;
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/meters", get(list_meters))
        .route("/api/meters/{mac}", get(get_meter).delete(delete_meter))
        .route("/api/meters/{mac}/readings", get(get_readings))
        .route("/api/meters/{mac}/daily", get(get_daily))
        .route("/api/meters/{mac}/name", post(set_name))
        .route("/api/meters/{mac}/on", post(turn_on))
        .route("/api/meters/{mac}/off", post(turn_off))
        .route("/api/meter/update", post(update_meter))
        .route("/api/scan", post(scan))
        .route("/api/mqtt/test", get(mqtt_test))
        .route("/api/report", get(get_report))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /api/health
async fn get_health(State(app): State<AppState>) -> Json<BridgeHealth> {
    Json(app.health_tracker.get_health(app.store.as_ref(), &app.broker, &app.router))
}

// GET /api/meters
async fn list_meters(State(app): State<AppState>) -> Result<Json<Vec<MeterSummary>>, ApiError> {
    app.store.list_meters().map(Json).map_err(|e| ApiError::store(e, None))
}

// GET /api/meters/{mac}
async fn get_meter(State(app): State<AppState>, Path(raw): Path<String>) -> Result<Json<MeterDetail>, ApiError> {
    let mac = parse_mac(&raw)?;
    match app.store.meter_detail(&mac) {
        Ok(Some(detail)) => Ok(Json(detail)),
        Ok(None) => Err(ApiError::new(StatusCode::NOT_FOUND, "meter not found", Some(mac.as_str()))),
        Err(e) => Err(ApiError::store(e, Some(mac.as_str()))),
    }
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

// GET /api/meters/{mac}/readings?limit=
async fn get_readings(
    State(app): State<AppState>,
    Path(raw): Path<String>,
    ApiQuery(params): ApiQuery<LimitParams>,
) -> Result<Json<Vec<crate::models::Reading>>, ApiError> {
    let mac = parse_mac(&raw)?;
    app.store
        .readings(&mac, params.limit.unwrap_or(DEFAULT_READINGS_LIMIT))
        .map(Json)
        .map_err(|e| ApiError::store(e, Some(mac.as_str())))
}

#[derive(Debug, Deserialize)]
struct DaysParams {
    days: Option<usize>,
}

// GET /api/meters/{mac}/daily?days=
async fn get_daily(
    State(app): State<AppState>,
    Path(raw): Path<String>,
    ApiQuery(params): ApiQuery<DaysParams>,
) -> Result<Json<Vec<DailyReading>>, ApiError> {
    let mac = parse_mac(&raw)?;
    app.store
        .daily_readings(&mac, params.days.unwrap_or(DEFAULT_DAILY_DAYS))
        .map(Json)
        .map_err(|e| ApiError::store(e, Some(mac.as_str())))
}

#[derive(Debug, Deserialize)]
struct UpdateMeter {
    mac: String,
    name: String,
    number: String,
}

// POST /api/meter/update
async fn update_meter(
    State(app): State<AppState>,
    ApiJson(body): ApiJson<UpdateMeter>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mac = parse_mac(&body.mac)?;
    let number = parse_number(&body.number, mac.as_str())?;
    let name = body.name.trim().to_string();

    app.store
        .upsert_meter_info(MeterInfo {
            mac: mac.clone(),
            name: Some(name.clone()),
            number: Some(number),
        })
        .map_err(|e| ApiError::store(e, Some(mac.as_str())))?;

    info!("meter {mac} is now {number:03} {name:?}");
    app.fanout.emit(BridgeEvent::meter_updated(mac.clone(), name.clone(), number));
    Ok(Json(json!({ "status": "success", "mac": mac, "name": name, "number": format!("{number:03}") })))
}

#[derive(Debug, Deserialize)]
struct SetName {
    name: String,
    number: Option<String>,
}

// POST /api/meters/{mac}/name
async fn set_name(
    State(app): State<AppState>,
    Path(raw): Path<String>,
    ApiJson(body): ApiJson<SetName>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mac = parse_mac(&raw)?;
    let number = match body.number.as_deref() {
        Some(n) if !n.is_empty() => Some(parse_number(n, mac.as_str())?),
        _ => None,
    };
    let name = body.name.trim().to_string();

    app.store
        .upsert_meter_info(MeterInfo {
            mac: mac.clone(),
            name: Some(name.clone()),
            number,
        })
        .map_err(|e| ApiError::store(e, Some(mac.as_str())))?;

    if let Some(number) = number {
        app.fanout.emit(BridgeEvent::meter_updated(mac.clone(), name.clone(), number));
    }
    Ok(Json(json!({ "status": "success", "mac": mac, "name": name })))
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    code: String,
}

// DELETE /api/meters/{mac}
async fn delete_meter(
    State(app): State<AppState>,
    Path(raw): Path<String>,
    ApiJson(body): ApiJson<DeleteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mac = parse_mac(&raw)?;
    if body.code != app.cfg.fleet.delete_code {
        warn!("delete of {mac} refused: wrong code");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "wrong delete code", Some(mac.as_str())));
    }
    match app.store.delete_meter(&mac) {
        Ok(true) => Ok(Json(json!({ "status": "deleted", "mac": mac }))),
        Ok(false) => Err(ApiError::new(StatusCode::NOT_FOUND, "meter not found", Some(mac.as_str()))),
        Err(e) => Err(ApiError::store(e, Some(mac.as_str()))),
    }
}

async fn power(app: &AppState, raw: &str, desired: PowerState) -> Result<Json<serde_json::Value>, ApiError> {
    let mac = parse_mac(raw)?;
    let ack = match desired {
        PowerState::On => app.dispatcher.turn_on(&mac).await,
        PowerState::Off => app.dispatcher.turn_off(&mac).await,
    }
    .map_err(|e| dispatch_error(e, &mac))?;

    Ok(Json(json!({
        "status": "success",
        "message": format!("{} command sent to {mac}", ack.payload),
        "topic": ack.topic,
        "payload": ack.payload,
    })))
}

// POST /api/meters/{mac}/on
async fn turn_on(State(app): State<AppState>, Path(raw): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    power(&app, &raw, PowerState::On).await
}

// POST /api/meters/{mac}/off
async fn turn_off(State(app): State<AppState>, Path(raw): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    power(&app, &raw, PowerState::Off).await
}

// POST /api/scan
async fn scan(State(app): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let meters = app
        .store
        .unnamed_meters(app.cfg.fleet.freshness())
        .map_err(|e| ApiError::store(e, None))?;

    if !meters.is_empty() {
        info!("scan found {} unnamed meters", meters.len());
        app.fanout.emit(BridgeEvent::NewUnnamedMeters {
            count: meters.len(),
            meters: meters.clone(),
        });
    }
    Ok(Json(json!({ "count": meters.len(), "meters": meters })))
}

// GET /api/mqtt/test
async fn mqtt_test(State(app): State<AppState>) -> Response {
    let mqtt = &app.cfg.mqtt;
    if !app.broker.ensure_connected().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": "broker unavailable",
                "mac": null,
                "broker": format!("{}:{}", mqtt.host, mqtt.port),
                "user_set": mqtt.user.is_some(),
                "password_set": mqtt.password.is_some(),
            })),
        )
            .into_response();
    }

    let topic = app.codec.test_topic();
    let payload = json!({
        "message": "connection test",
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
    })
    .to_string();

    match app.broker.publish(&topic, payload.as_bytes()).await {
        Ok(()) => Json(json!({ "status": "success", "topic": topic, "state": app.broker.state() })).into_response(),
        Err(e) => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), None).into_response(),
    }
}

// GET /api/report
async fn get_report(State(app): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    status_report(app.store.as_ref(), app.cfg.fleet.freshness())
        .map(Json)
        .map_err(|e| ApiError::store(e, None))
}

// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, app.fanout))
}

async fn stream_events(mut socket: WebSocket, fanout: FanOut) {
    let mut events = fanout.subscribe();
    debug!("websocket subscriber joined ({} total)", fanout.subscriber_count());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => debug!("websocket subscriber missed {n} events"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("websocket subscriber left");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::mock::MockDialer;
    use crate::broker::{ConnectError, RetryPolicy};
    use crate::models::Reading;
    use crate::store::JsonFileStore;
    use std::time::Duration;
    use time::macros::datetime;

    struct Harness {
        _dir: tempfile::TempDir,
        dialer: MockDialer,
        app: AppState,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path().join("m.json")).unwrap());
        let dialer = MockDialer::new();
        let codec = TopicCodec::default();
        let broker = ConnectionManager::new(
            Box::new(dialer.clone()),
            codec.subscription_patterns(),
            RetryPolicy {
                retries: 2,
                delay: Duration::from_millis(5),
            },
        );
        let fanout = FanOut::new(16);
        let router = Arc::new(EventRouter::new(codec.clone(), fanout.clone(), store.clone()));
        let app = AppState {
            cfg: Arc::new(BridgeConfig::default()),
            store,
            broker: broker.clone(),
            router,
            dispatcher: CommandDispatcher::new(broker, codec.clone()),
            fanout,
            codec,
            health_tracker: HealthTracker::new(),
        };
        Harness { _dir: dir, dialer, app }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_turn_on_success() {
        let h = harness();
        let Json(body) = turn_on(State(h.app.clone()), Path("08:84:DD:9F".into())).await.unwrap();
        assert_eq!(body["topic"], "cmnd/obk0884dd9f/Power");
        assert_eq!(body["payload"], "ON");
        assert_eq!(h.dialer.publishes().len(), 1);
    }

    #[tokio::test]
    async fn test_turn_off_broker_down_is_503() {
        let h = harness();
        h.dialer.fail_always(ConnectError::BrokerUnreachable("down".into()));

        let resp = turn_off(State(h.app.clone()), Path("08:84:dd:9f".into()))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["mac"], "08:84:dd:9f");
        assert!(body["error"].is_string());
        assert!(h.dialer.publishes().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_command_is_500() {
        let h = harness();
        h.dialer.reject_publishes(128);
        let resp = turn_on(State(h.app.clone()), Path("08:84:dd:9f".into()))
            .await
            .unwrap_err()
            .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_mac_is_400() {
        let h = harness();
        let err = turn_on(State(h.app.clone()), Path("test_mac".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.mac.as_deref(), Some("test_mac"));
    }

    #[tokio::test]
    async fn test_unknown_meter_is_404() {
        let h = harness();
        let err = get_meter(State(h.app.clone()), Path("00:11".into())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.mac.as_deref(), Some("00:11"));
    }

    #[tokio::test]
    async fn test_update_meter_validates_and_emits() {
        let h = harness();
        let mut events = h.app.fanout.subscribe();

        let bad = update_meter(
            State(h.app.clone()),
            ApiJson(UpdateMeter { mac: "00:01".into(), name: "Kontor".into(), number: "12".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let Json(ok) = update_meter(
            State(h.app.clone()),
            ApiJson(UpdateMeter { mac: "00:01".into(), name: "Kontor".into(), number: "012".into() }),
        )
        .await
        .unwrap();
        assert_eq!(ok["number"], "012");
        assert_eq!(
            events.try_recv().unwrap(),
            BridgeEvent::meter_updated(MeterId::parse("00:01").unwrap(), "Kontor", 12)
        );

        let taken = update_meter(
            State(h.app.clone()),
            ApiJson(UpdateMeter { mac: "00:02".into(), name: "Pumpe".into(), number: "012".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(taken.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_delete_requires_code() {
        let h = harness();
        h.app
            .store
            .record_reading(Reading {
                mac: MeterId::parse("00:01").unwrap(),
                timestamp: datetime!(2024-05-01 12:00 UTC),
                total_kwh: 1.0,
            })
            .unwrap();

        let err = delete_meter(State(h.app.clone()), Path("00:01".into()), ApiJson(DeleteBody { code: "0000".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        delete_meter(State(h.app.clone()), Path("00:01".into()), ApiJson(DeleteBody { code: "2012".into() }))
            .await
            .unwrap();
        let again = delete_meter(State(h.app.clone()), Path("00:01".into()), ApiJson(DeleteBody { code: "2012".into() }))
            .await
            .unwrap_err();
        assert_eq!(again.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_scan_emits_unnamed_meters() {
        let h = harness();
        let mut events = h.app.fanout.subscribe();

        let Json(empty) = scan(State(h.app.clone())).await.unwrap();
        assert_eq!(empty["count"], 0);
        assert!(events.try_recv().is_err());

        h.app
            .store
            .record_reading(Reading {
                mac: MeterId::parse("00:01").unwrap(),
                timestamp: datetime!(2024-05-01 12:00 UTC),
                total_kwh: 1.0,
            })
            .unwrap();
        let Json(found) = scan(State(h.app.clone())).await.unwrap();
        assert_eq!(found["count"], 1);
        assert!(matches!(events.try_recv(), Ok(BridgeEvent::NewUnnamedMeters { count: 1, .. })));
    }

    #[tokio::test]
    async fn test_mqtt_test_endpoint() {
        let h = harness();
        let resp = mqtt_test(State(h.app.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.dialer.publishes()[0].0, "maaler/test/connection");

        let down = harness();
        down.dialer.fail_always(ConnectError::BadCredentials);
        let resp = mqtt_test(State(down.app.clone())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["broker"], "localhost:1883");
        assert_eq!(body["password_set"], false);
    }

    #[tokio::test]
    async fn test_readings_default_limit() {
        let h = harness();
        let mac = MeterId::parse("00:01").unwrap();
        for i in 0..(DEFAULT_READINGS_LIMIT as i64 + 5) {
            h.app
                .store
                .record_reading(Reading {
                    mac: mac.clone(),
                    timestamp: datetime!(2024-05-01 00:00 UTC) + time::Duration::minutes(i),
                    total_kwh: i as f64,
                })
                .unwrap();
        }
        let Json(readings) = get_readings(State(h.app.clone()), Path("00:01".into()), ApiQuery(LimitParams { limit: None }))
            .await
            .unwrap();
        assert_eq!(readings.len(), DEFAULT_READINGS_LIMIT);
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_shape() {
        let req = |body: &'static str, content_type: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/meter/update")
                .header("content-type", content_type)
                .body(axum::body::Body::from(body))
                .unwrap()
        };

        for (body, content_type, status) in [
            (r#"{"mac": "00:01"}"#, "application/json", StatusCode::UNPROCESSABLE_ENTITY),
            ("{not json", "application/json", StatusCode::BAD_REQUEST),
            (r#"{"mac": "00:01", "name": "x", "number": "001"}"#, "text/plain", StatusCode::UNSUPPORTED_MEDIA_TYPE),
        ] {
            let Err(err) = ApiJson::<UpdateMeter>::from_request(req(body, content_type), &()).await else {
                panic!("{body:?} should be rejected");
            };
            assert_eq!(err.status, status);
            let resp = body_json(err.into_response()).await;
            assert!(resp["error"].is_string());
            assert!(resp["mac"].is_null());
        }
    }

    #[tokio::test]
    async fn test_bad_query_uses_error_shape() {
        let req = Request::builder()
            .uri("/api/meters/00:01/readings?limit=abc")
            .body(axum::body::Body::empty())
            .unwrap();
        let (mut parts, _) = req.into_parts();
        let Err(err) = ApiQuery::<LimitParams>::from_request_parts(&mut parts, &()).await else {
            panic!("limit=abc should be rejected");
        };
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(body_json(err.into_response()).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_api_key_guard() {
        let mut headers = HeaderMap::new();
        assert!(check_api_key(None, "/api/meters", &headers).is_ok());
        assert!(check_api_key(Some("k"), "/api/health", &headers).is_ok());

        let err = check_api_key(Some("k"), "/api/meters", &headers).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        let resp = body_json(err.into_response()).await;
        assert_eq!(resp["error"], "missing or invalid api key");
        assert!(resp["mac"].is_null());

        headers.insert("x-api-key", "wrong".parse().unwrap());
        assert!(check_api_key(Some("k"), "/ws", &headers).is_err());
        headers.insert("x-api-key", "k".parse().unwrap());
        assert!(check_api_key(Some("k"), "/ws", &headers).is_ok());
    }
}
