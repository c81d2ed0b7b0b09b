mod common;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use uuid::Uuid;

use common::{phone, serve, Pipeline};
use sendflow::api::{router, ApiState};
use sendflow::queue::{QueueEnqueuer, RecipientDirectory};

struct Directory {
    segment: Uuid,
}

#[async_trait]
impl RecipientDirectory for Directory {
    async fn segment_numbers(&self, segment_id: Uuid) -> anyhow::Result<Vec<String>> {
        if segment_id == self.segment {
            Ok(vec![phone(1), phone(2), "not-a-number".into()])
        } else {
            Ok(vec![])
        }
    }

    async fn user_contact_numbers(&self, _user_id: Uuid) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("contacts service timed out")
    }
}

async fn start(p: &Pipeline) -> String {
    serve(router(ApiState {
        enqueuer: p.enqueuer.clone(),
        processor: p.processor.clone(),
        tracker: p.tracker.clone(),
    }))
    .await
}

#[tokio::test]
async fn health_is_ok() {
    let p = Pipeline::healthy();
    let base = start(&p).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn single_message_is_enqueued() {
    let p = Pipeline::healthy();
    let base = start(&p).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/messages"))
        .json(&json!({
            "phone_number": "+225 07 00 00 00 01",
            "message": "Your code is 4242",
            "priority": "urgent",
            "sender_name": "ACME"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    let entry: Value = resp.json().await.unwrap();
    assert_eq!(entry["phone_number"], "+2250700000001");
    assert_eq!(entry["priority"], "urgent");
    assert_eq!(entry["status"], "pending");
    assert_eq!(entry["attempts"], 0);
    assert_eq!(entry["max_attempts"], 3);
    assert_eq!(p.store.snapshot().len(), 1);
}

#[tokio::test]
async fn bad_requests_are_unprocessable() {
    let p = Pipeline::healthy();
    let base = start(&p).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/messages"))
        .json(&json!({ "phone_number": "12", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(resp.text().await.unwrap().contains("not a valid phone number"));

    let resp = http
        .post(format!("{base}/batches"))
        .json(&json!({ "phone_numbers": [phone(1)], "message": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    assert!(p.store.snapshot().is_empty());
}

#[tokio::test]
async fn batch_lifecycle_over_http() {
    let p = Pipeline::healthy();
    let base = start(&p).await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/batches"))
        .json(&json!({
            "phone_numbers": [phone(1), phone(2), phone(1), "garbage"],
            "recipients": [{ "phone_number": phone(3), "priority": "high" }],
            "message": "Store closes early today"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["accepted"], 3);
    assert_eq!(receipt["skipped"], 1);
    assert_eq!(receipt["duplicates"], 1);
    let batch_id = receipt["batch_id"].as_str().unwrap().to_string();

    let status: Value = http
        .get(format!("{base}/batches/{batch_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["counts"]["pending"], 3);
    assert_eq!(status["settled"], false);

    p.processor.process_next_batch(10).await.unwrap();

    let status: Value = http
        .get(format!("{base}/batches/{batch_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["counts"]["sent"], 3);
    assert_eq!(status["settled"], true);

    let entries: Vec<Value> = http
        .get(format!("{base}/batches/{batch_id}/entries"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e["status"] == "sent"));
}

#[tokio::test]
async fn unknown_batch_is_not_found() {
    let p = Pipeline::healthy();
    let base = start(&p).await;

    let resp = reqwest::get(format!("{base}/batches/{}", Uuid::new_v4()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_accepts_an_optional_reason() {
    let p = Pipeline::healthy();
    let base = start(&p).await;
    let http = reqwest::Client::new();

    let receipt: Value = http
        .post(format!("{base}/batches"))
        .json(&json!({ "phone_numbers": [phone(1), phone(2)], "message": "hello" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let batch_id = receipt["batch_id"].as_str().unwrap().to_string();

    let resp = http
        .post(format!("{base}/batches/{batch_id}/cancel"))
        .json(&json!({ "reason": "sent by mistake" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cancelled"], 2);

    // nothing left to cancel; no body at all is fine too
    let body: Value = http
        .post(format!("{base}/batches/{batch_id}/cancel"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancelled"], 0);

    let entries = p
        .tracker
        .batch_entries(batch_id.parse().unwrap())
        .await
        .unwrap();
    assert!(entries
        .iter()
        .all(|e| e.error_message.as_deref() == Some("sent by mistake")));
}

#[tokio::test]
async fn audience_sends_need_a_directory() {
    let p = Pipeline::healthy();
    let base = start(&p).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/segments/{}/messages", Uuid::new_v4()))
        .json(&json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn audience_sends_resolve_recipients() {
    let p = Pipeline::healthy();
    let segment = Uuid::new_v4();
    let enqueuer = QueueEnqueuer::new(p.store.clone(), p.clock.clone(), 3)
        .with_directory(Arc::new(Directory { segment }));
    let base = serve(router(ApiState {
        enqueuer: Arc::new(enqueuer),
        processor: p.processor.clone(),
        tracker: p.tracker.clone(),
    }))
    .await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{base}/segments/{segment}/messages"))
        .json(&json!({ "message": "Members-only sale", "priority": "low" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["accepted"], 2);
    assert_eq!(receipt["skipped"], 1);

    assert!(p
        .store
        .snapshot()
        .iter()
        .all(|e| e.segment_id == Some(segment)));

    let resp = http
        .post(format!("{base}/users/{}/messages", Uuid::new_v4()))
        .json(&json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let resp = http
        .post(format!("{base}/segments/{segment}/cancel"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cancelled"], 2);
}

#[tokio::test]
async fn stats_report_queue_and_circuit() {
    let p = Pipeline::healthy();
    let base = start(&p).await;

    p.enqueuer
        .enqueue_bulk(
            vec![phone(1), phone(2)],
            "hello",
            sendflow::queue::EnqueueOptions::default(),
        )
        .await
        .unwrap();
    p.processor.process_next_batch(1).await.unwrap();

    let stats: Value = reqwest::get(format!("{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["queue"]["total"], 2);
    assert_eq!(stats["queue"]["sent"], 1);
    assert_eq!(stats["queue"]["pending"], 1);
    assert_eq!(stats["provider"], "scripted");
    assert_eq!(stats["circuit"]["name"], "scripted");
    assert_eq!(stats["circuit"]["state"], "closed");
    assert_eq!(stats["circuit"]["failure_count"], 0);
}
