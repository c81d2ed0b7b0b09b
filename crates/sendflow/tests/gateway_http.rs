mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use common::serve;
use sendflow::config::{OrangeConfig, WhatsAppConfig};
use sendflow::gateway::{
    GatewayError, MessageGateway, OrangeSmsGateway, OutboundMessage, WhatsAppCloudGateway,
};

fn message(phone_number: &str) -> OutboundMessage {
    OutboundMessage {
        entry_id: Uuid::new_v4(),
        phone_number: phone_number.into(),
        body: "Your order has shipped".into(),
        sender_name: None,
    }
}

// ---------- Orange ----------

#[derive(Clone, Default)]
struct OrangeStub {
    token_requests: Arc<AtomicUsize>,
    token_auth: Arc<Mutex<Vec<String>>>,
    bearer: Arc<Mutex<Vec<String>>>,
    senders: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    // status to answer sends with; 201 when unset
    send_status: Arc<Mutex<Option<(StatusCode, Option<&'static str>)>>>,
}

async fn orange_token(State(stub): State<OrangeStub>, headers: HeaderMap) -> Json<Value> {
    let n = stub.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        stub.token_auth
            .lock()
            .push(auth.to_str().unwrap_or_default().to_string());
    }
    Json(json!({ "token_type": "Bearer", "access_token": format!("tok-{n}"), "expires_in": 3600 }))
}

async fn orange_send(
    State(stub): State<OrangeStub>,
    Path(sender): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        stub.bearer
            .lock()
            .push(auth.to_str().unwrap_or_default().to_string());
    }
    stub.senders.lock().push(sender.clone());
    stub.bodies.lock().push(body);

    let scripted = *stub.send_status.lock();
    match scripted {
        Some((status, retry_after)) => {
            let mut resp = (status, "{\"requestError\":\"scripted\"}").into_response();
            if let Some(secs) = retry_after {
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, secs.parse().unwrap());
            }
            resp
        }
        None => (
            StatusCode::CREATED,
            Json(json!({
                "outboundSMSMessageRequest": {
                    "resourceURL": format!("https://api.orange.com/smsmessaging/v1/outbound/{sender}/requests/req-42")
                }
            })),
        )
            .into_response(),
    }
}

async fn orange_gateway() -> (OrangeSmsGateway, OrangeStub) {
    let stub = OrangeStub::default();
    let app = Router::new()
        .route("/oauth/v3/token", post(orange_token))
        .route("/smsmessaging/v1/outbound/:sender/requests", post(orange_send))
        .with_state(stub.clone());
    let base_url = serve(app).await;

    let gateway = OrangeSmsGateway::new(OrangeConfig {
        base_url,
        authorization_header: "Basic Y2xpZW50OnNlY3JldA==".into(),
        sender_address: "tel:+2250000".into(),
        sender_name: Some("ACME".into()),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    (gateway, stub)
}

#[tokio::test]
async fn orange_reuses_its_access_token() {
    let (gateway, stub) = orange_gateway().await;

    let first = gateway.send(&message("+2250700000001")).await.unwrap();
    let second = gateway.send(&message("2250700000002")).await.unwrap();

    assert_eq!(stub.token_requests.load(Ordering::SeqCst), 1);
    assert_eq!(
        stub.token_auth.lock().as_slice(),
        ["Basic Y2xpZW50OnNlY3JldA=="]
    );
    assert_eq!(
        stub.bearer.lock().as_slice(),
        ["Bearer tok-1", "Bearer tok-1"]
    );

    assert_eq!(first.external_message_id, "req-42");
    assert_eq!(first.provider, "orange-sms");
    assert_eq!(second.external_message_id, "req-42");
}

#[tokio::test]
async fn orange_request_uses_tel_uris_and_sender_name() {
    let (gateway, stub) = orange_gateway().await;

    gateway.send(&message("2250700000002")).await.unwrap();

    assert_eq!(stub.senders.lock().as_slice(), ["tel:+2250000"]);
    let body = stub.bodies.lock()[0].clone();
    let req = &body["outboundSMSMessageRequest"];
    assert_eq!(req["address"], "tel:+2250700000002");
    assert_eq!(req["senderAddress"], "tel:+2250000");
    assert_eq!(req["senderName"], "ACME");
    assert_eq!(req["outboundSMSTextMessage"]["message"], "Your order has shipped");
}

#[tokio::test]
async fn orange_rate_limit_carries_retry_after() {
    let (gateway, stub) = orange_gateway().await;
    *stub.send_status.lock() = Some((StatusCode::TOO_MANY_REQUESTS, Some("7")));

    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    match err {
        GatewayError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn orange_status_codes_are_classified() {
    let (gateway, stub) = orange_gateway().await;

    *stub.send_status.lock() = Some((StatusCode::BAD_REQUEST, None));
    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)), "{err:?}");

    *stub.send_status.lock() = Some((StatusCode::SERVICE_UNAVAILABLE, None));
    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Server { status: 503, .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn orange_rejected_token_is_refreshed() {
    let (gateway, stub) = orange_gateway().await;

    *stub.send_status.lock() = Some((StatusCode::UNAUTHORIZED, None));
    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    // counts as a provider problem, so the entry is retried later
    assert!(matches!(err, GatewayError::Server { status: 401, .. }));

    *stub.send_status.lock() = None;
    gateway.send(&message("+2250700000001")).await.unwrap();

    assert_eq!(stub.token_requests.load(Ordering::SeqCst), 2);
    assert_eq!(stub.bearer.lock().last().map(String::as_str), Some("Bearer tok-2"));
}

#[tokio::test]
async fn unreachable_provider_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let gateway = OrangeSmsGateway::new(OrangeConfig {
        base_url: format!("http://{addr}"),
        authorization_header: "Basic x".into(),
        sender_address: "2250000".into(),
        sender_name: None,
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(matches!(err, GatewayError::TransientNetwork(_)), "{err:?}");
}

// ---------- WhatsApp ----------

#[derive(Clone, Default)]
struct GraphStub {
    phone_ids: Arc<Mutex<Vec<String>>>,
    bearer: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<Value>>>,
    error: Arc<Mutex<Option<(StatusCode, Value)>>>,
}

async fn graph_messages(
    State(stub): State<GraphStub>,
    Path((_version, phone_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    stub.phone_ids.lock().push(phone_id);
    if let Some(auth) = headers.get(header::AUTHORIZATION) {
        stub.bearer
            .lock()
            .push(auth.to_str().unwrap_or_default().to_string());
    }
    stub.bodies.lock().push(body);

    let scripted = stub.error.lock().clone();
    match scripted {
        Some((status, err)) => (status, Json(err)).into_response(),
        None => Json(json!({
            "messaging_product": "whatsapp",
            "contacts": [{ "input": "2250700000001", "wa_id": "2250700000001" }],
            "messages": [{ "id": "wamid.HBgM" }]
        }))
        .into_response(),
    }
}

async fn whatsapp_gateway() -> (WhatsAppCloudGateway, GraphStub) {
    let stub = GraphStub::default();
    let app = Router::new()
        .route("/:version/:phone_id/messages", post(graph_messages))
        .with_state(stub.clone());
    let base_url = serve(app).await;

    let gateway = WhatsAppCloudGateway::new(WhatsAppConfig {
        base_url,
        api_version: "v19.0".into(),
        phone_number_id: "1098765".into(),
        access_token: "EAAG-test".into(),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    (gateway, stub)
}

#[tokio::test]
async fn whatsapp_sends_text_messages() {
    let (gateway, stub) = whatsapp_gateway().await;

    let receipt = gateway.send(&message("+2250700000001")).await.unwrap();
    assert_eq!(receipt.external_message_id, "wamid.HBgM");
    assert_eq!(receipt.provider, "whatsapp-cloud");

    assert_eq!(stub.phone_ids.lock().as_slice(), ["1098765"]);
    assert_eq!(stub.bearer.lock().as_slice(), ["Bearer EAAG-test"]);

    let body = stub.bodies.lock()[0].clone();
    assert_eq!(body["messaging_product"], "whatsapp");
    assert_eq!(body["to"], "2250700000001");
    assert_eq!(body["type"], "text");
    assert_eq!(body["text"]["body"], "Your order has shipped");
}

#[tokio::test]
async fn whatsapp_throttling_codes_are_rate_limits() {
    let (gateway, stub) = whatsapp_gateway().await;
    *stub.error.lock() = Some((
        StatusCode::BAD_REQUEST,
        json!({ "error": { "code": 131056, "message": "pair rate limit hit" } }),
    ));

    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::RateLimited { .. }),
        "{err:?}"
    );
    assert!(err.to_string().contains("131056"));
}

#[tokio::test]
async fn whatsapp_invalid_recipient_is_fatal() {
    let (gateway, stub) = whatsapp_gateway().await;
    *stub.error.lock() = Some((
        StatusCode::BAD_REQUEST,
        json!({ "error": { "code": 131026, "message": "message undeliverable" } }),
    ));

    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Validation(_)), "{err:?}");
    assert!(!err.counts_against_circuit());
}

#[tokio::test]
async fn whatsapp_expired_token_is_retryable() {
    let (gateway, stub) = whatsapp_gateway().await;
    *stub.error.lock() = Some((
        StatusCode::UNAUTHORIZED,
        json!({ "error": { "code": 190, "message": "access token has expired" } }),
    ));

    let err = gateway.send(&message("+2250700000001")).await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Server { status: 401, .. }),
        "{err:?}"
    );
}
