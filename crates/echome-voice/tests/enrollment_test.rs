use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use echome_http::{RetryPolicy, RetryingClient};
use echome_voice::{EnrollmentConfig, VoiceEnrollment, VoiceError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Recorded {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

async fn customization(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    if let Some(auth) = headers.get("authorization") {
        recorded
            .auth
            .lock()
            .unwrap()
            .push(auth.to_str().unwrap().to_string());
    }
    recorded.bodies.lock().unwrap().push(body.clone());

    match body["input"]["action"].as_str() {
        Some("create_voice") => Json(json!({
            "output": {"voice_id": "echome-prefix-123"},
            "usage": {"count": 1},
            "request_id": "r1"
        })),
        Some("query_voice") if body["input"]["voice_id"] == "ready" => {
            Json(json!({"output": {"status": "OK"}}))
        }
        Some("query_voice") => Json(json!({"output": {"status": "DEPLOYING"}})),
        _ => Json(json!({})),
    }
}

async fn spawn_upstream() -> (VoiceEnrollment, Recorded) {
    let recorded = Recorded::default();
    let app = Router::new()
        .route("/api/v1/services/audio/tts/customization", post(customization))
        .with_state(recorded.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = EnrollmentConfig {
        url: format!("http://{}/api/v1/services/audio/tts/customization", addr),
        ..EnrollmentConfig::default()
    };
    let http = RetryingClient::new(
        reqwest::Client::new(),
        RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
    );
    (VoiceEnrollment::new(http, config, "sk-test"), recorded)
}

#[tokio::test]
async fn create_voice_returns_the_new_id() {
    let (enrollment, recorded) = spawn_upstream().await;

    let voice_id = enrollment
        .create_voice("https://cdn.example/sample.wav")
        .await
        .unwrap();
    assert_eq!(voice_id, "echome-prefix-123");

    let body = recorded.bodies.lock().unwrap()[0].clone();
    assert_eq!(
        body,
        json!({
            "model": "voice-enrollment",
            "input": {
                "action": "create_voice",
                "target_model": "cosyvoice-v2",
                "prefix": "echome",
                "url": "https://cdn.example/sample.wav"
            }
        })
    );
    assert_eq!(recorded.auth.lock().unwrap()[0], "Bearer sk-test");
}

#[tokio::test]
async fn query_voice_reports_readiness() {
    let (enrollment, _) = spawn_upstream().await;
    assert!(enrollment.query_voice("ready").await.unwrap());
    assert!(!enrollment.query_voice("pending").await.unwrap());
}

#[tokio::test]
async fn empty_inputs_are_rejected_locally() {
    let (enrollment, recorded) = spawn_upstream().await;
    assert!(matches!(
        enrollment.create_voice("  ").await,
        Err(VoiceError::Enrollment(_))
    ));
    assert!(matches!(
        enrollment.query_voice("").await,
        Err(VoiceError::Enrollment(_))
    ));
    assert!(recorded.bodies.lock().unwrap().is_empty());
}
