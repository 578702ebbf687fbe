//! HTTP surface tests on the in-process stack

use actix_web::{test, web, App};
use serde_json::{json, Value};
use smsgate_api::{configure_routes, json_config};
use smsgate_cache::MemoryReservationCache;
use smsgate_core::config::{AdmissionConfig, QueueConfig};
use smsgate_core::models::{Lane, User};
use smsgate_core::traits::LedgerStore;
use smsgate_db::MemoryLedger;
use smsgate_queue::MemoryQueue;
use smsgate_services::{build_strategy, AdmissionService, DispatchRouter, Gateway};
use std::sync::Arc;
use uuid::Uuid;

struct Stack {
    ledger: Arc<MemoryLedger>,
    queue: Arc<MemoryQueue>,
    gateway: web::Data<Gateway>,
}

fn stack() -> Stack {
    let ledger = Arc::new(MemoryLedger::new());
    let cache = Arc::new(MemoryReservationCache::new());
    let queue = Arc::new(MemoryQueue::new(4));

    let config = AdmissionConfig::default();
    let strategy = build_strategy(&config, ledger.clone(), cache.clone());
    let admission = AdmissionService::new(ledger.clone(), cache.clone(), strategy, config);
    let queue_config = QueueConfig {
        publish_backoff_ms: 1,
        ..QueueConfig::default()
    };
    let router = DispatchRouter::new(queue.clone(), ledger.clone(), cache, &queue_config);

    Stack {
        gateway: web::Data::new(Gateway::new(admission, router, ledger.clone())),
        ledger,
        queue,
    }
}

fn add_user(stack: &Stack, balance: i64, is_privileged: bool) -> Uuid {
    let user = User::new(Uuid::new_v4(), balance, is_privileged);
    let id = user.id;
    stack.ledger.insert_user(user);
    id
}

fn sms(user_id: Uuid, message_id: Uuid) -> Value {
    json!({
        "user_id": user_id,
        "message_id": message_id,
        "phone_number": "5551234567",
        "message": "hello"
    })
}

#[actix_web::test]
async fn test_health() {
    let stack = stack();
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "healthy");
}

#[actix_web::test]
async fn test_send_sms_queues_and_debits() {
    let stack = stack();
    let user_id = add_user(&stack, 2, false);
    let message_id = Uuid::new_v4();
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .app_data(json_config())
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/send-sms")
        .set_json(sms(user_id, message_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 202);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["lane"], "standard");
    assert_eq!(stack.queue.uncommitted(Lane::Standard), 1);

    let req = test::TestRequest::get()
        .uri(&format!("/balance/{}", user_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["balance"], 1);

    let req = test::TestRequest::get()
        .uri(&format!("/message-status/{}", message_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["status"], "queued");
}

#[actix_web::test]
async fn test_insufficient_balance_is_402() {
    let stack = stack();
    let user_id = add_user(&stack, 0, false);
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/send-sms")
        .set_json(sms(user_id, Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 402);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "rejected");
}

#[actix_web::test]
async fn test_duplicate_returns_current_status() {
    let stack = stack();
    let user_id = add_user(&stack, 5, true);
    let message_id = Uuid::new_v4();
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .configure(configure_routes),
    )
    .await;

    // Still queued: admitted again and republished
    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri("/send-sms")
            .set_json(sms(user_id, message_id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 202);
    }
    assert_eq!(stack.queue.uncommitted(Lane::Privileged), 2);

    stack.ledger.settle_privileged(message_id).await.unwrap();
    let req = test::TestRequest::post()
        .uri("/send-sms")
        .set_json(sms(user_id, message_id))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "sent");
    assert_eq!(stack.queue.uncommitted(Lane::Privileged), 2);
}

#[actix_web::test]
async fn test_validation_errors_are_400() {
    let stack = stack();
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .app_data(json_config())
            .configure(configure_routes),
    )
    .await;

    let bad_phone = json!({
        "user_id": Uuid::new_v4(),
        "message_id": Uuid::new_v4(),
        "phone_number": "123",
        "message": "hello"
    });
    let req = test::TestRequest::post()
        .uri("/send-sms")
        .set_json(bad_phone)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "validation_error");

    let req = test::TestRequest::post()
        .uri("/send-sms")
        .insert_header(("content-type", "application/json"))
        .set_payload("{not json")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let req = test::TestRequest::get()
        .uri("/balance/not-a-uuid")
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);
}

#[actix_web::test]
async fn test_unknown_resources_are_404() {
    let stack = stack();
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::get()
        .uri(&format!("/balance/{}", Uuid::new_v4()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 404);

    let req = test::TestRequest::get()
        .uri(&format!("/message-status/{}", Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "message_not_found");
}

#[actix_web::test]
async fn test_broker_outage_is_503() {
    let stack = stack();
    let user_id = add_user(&stack, 1, false);
    stack.queue.set_unavailable(true);
    let app = test::init_service(
        App::new()
            .app_data(stack.gateway.clone())
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/send-sms")
        .set_json(sms(user_id, Uuid::new_v4()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 503);
    assert_eq!(stack.ledger.get_balance(user_id).await.unwrap(), 1);
}
