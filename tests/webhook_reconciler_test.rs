mod common;

use hmac::{Hmac, Mac};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use sha2::Sha256;
use uuid::Uuid;

use common::TestApp;
use storefront_core::entities::order::{self, OrderStatus, PaymentStatus};
use storefront_core::errors::ServiceError;
use storefront_core::services::{CreateOrderRequest, GatewayEvent, GatewayEventKind};

async fn place_order(app: &TestApp) -> (Uuid, Uuid, Uuid) {
    let user_id = Uuid::new_v4();
    let product_id = app.seed_product("Kaffee 500g", dec!(20.00), 2).await;
    app.state
        .cart_service
        .add_item(user_id, product_id, 2)
        .await
        .unwrap();
    let order = app
        .state
        .order_service
        .create_order(
            user_id,
            CreateOrderRequest {
                shipping_address: "Musterstrasse 1, 10115 Berlin".to_string(),
                billing_address: "Musterstrasse 1, 10115 Berlin".to_string(),
                discount_code: None,
                customer_note: None,
            },
        )
        .await
        .unwrap();
    (user_id, order.id, product_id)
}

async fn fetch_order(app: &TestApp, order_id: Uuid) -> order::Model {
    order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
}

fn succeeded(order_id: Uuid) -> GatewayEvent {
    GatewayEvent {
        id: format!("evt_{}", Uuid::new_v4().simple()),
        kind: GatewayEventKind::PaymentSucceeded,
        payment_intent_id: Some("pi_test_123".to_string()),
        order_id: Some(order_id),
        amount_refunded: None,
        failure_reason: None,
    }
}

#[tokio::test]
async fn payment_succeeded_confirms_order() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    app.state
        .webhook_reconciler
        .handle(succeeded(order_id))
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert_eq!(order.payment_intent_id.as_deref(), Some("pi_test_123"));
}

#[tokio::test]
async fn duplicate_event_is_processed_once() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    let event = succeeded(order_id);
    app.state
        .webhook_reconciler
        .handle(event.clone())
        .await
        .unwrap();
    // Gateways redeliver; a replay of the same event id must be inert.
    app.state.webhook_reconciler.handle(event).await.unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
}

#[tokio::test]
async fn reconciliation_bumps_the_order_version() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;
    assert_eq!(fetch_order(&app, order_id).await.version, 1);

    // One bump for the payment-status write, one for Pending -> Confirmed.
    app.state
        .webhook_reconciler
        .handle(succeeded(order_id))
        .await
        .unwrap();
    assert_eq!(fetch_order(&app, order_id).await.version, 3);

    // The refund path bumps for the transition and the payment write.
    app.state
        .webhook_reconciler
        .handle(GatewayEvent {
            id: "evt_refund_version".to_string(),
            kind: GatewayEventKind::ChargeRefunded,
            payment_intent_id: Some("pi_test_123".to_string()),
            order_id: Some(order_id),
            amount_refunded: Some(dec!(52.59)),
            failure_reason: None,
        })
        .await
        .unwrap();
    assert_eq!(fetch_order(&app, order_id).await.version, 5);
}

#[tokio::test]
async fn payment_failed_cancels_and_releases_stock() {
    let app = TestApp::new().await;
    let (_, order_id, product_id) = place_order(&app).await;
    assert_eq!(app.fetch_product(product_id).await.stock_quantity, 0);

    let event = GatewayEvent {
        id: "evt_fail_1".to_string(),
        kind: GatewayEventKind::PaymentFailed,
        payment_intent_id: Some("pi_test_123".to_string()),
        order_id: Some(order_id),
        amount_refunded: None,
        failure_reason: Some("card_declined".to_string()),
    };
    app.state
        .webhook_reconciler
        .handle(event.clone())
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(order.failure_reason.as_deref(), Some("card_declined"));
    assert_eq!(app.fetch_product(product_id).await.stock_quantity, 2);

    // Redelivery must not release stock a second time.
    app.state.webhook_reconciler.handle(event).await.unwrap();
    assert_eq!(app.fetch_product(product_id).await.stock_quantity, 2);
}

#[tokio::test]
async fn refund_moves_order_and_payment_to_refunded() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    app.state
        .webhook_reconciler
        .handle(succeeded(order_id))
        .await
        .unwrap();

    app.state
        .webhook_reconciler
        .handle(GatewayEvent {
            id: "evt_refund_1".to_string(),
            kind: GatewayEventKind::ChargeRefunded,
            payment_intent_id: Some("pi_test_123".to_string()),
            order_id: Some(order_id),
            amount_refunded: Some(dec!(52.59)),
            failure_reason: None,
        })
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert_eq!(order.refunded_amount, Some(dec!(52.59)));
}

#[tokio::test]
async fn refund_without_completed_payment_is_ignored() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    // No successful payment has been recorded for this order.
    app.state
        .webhook_reconciler
        .handle(GatewayEvent {
            id: "evt_refund_early".to_string(),
            kind: GatewayEventKind::ChargeRefunded,
            payment_intent_id: Some("pi_test_123".to_string()),
            order_id: Some(order_id),
            amount_refunded: Some(dec!(10.00)),
            failure_reason: None,
        })
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Pending);
    assert_eq!(order.refunded_amount, None);
}

#[tokio::test]
async fn late_success_after_refund_changes_nothing() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    app.state
        .webhook_reconciler
        .handle(succeeded(order_id))
        .await
        .unwrap();
    app.state
        .webhook_reconciler
        .handle(GatewayEvent {
            id: "evt_refund_2".to_string(),
            kind: GatewayEventKind::ChargeRefunded,
            payment_intent_id: Some("pi_test_123".to_string()),
            order_id: Some(order_id),
            amount_refunded: Some(dec!(52.59)),
            failure_reason: None,
        })
        .await
        .unwrap();

    // A straggling success event with a fresh id arrives after the refund.
    app.state
        .webhook_reconciler
        .handle(succeeded(order_id))
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn event_for_unknown_order_is_acknowledged() {
    let app = TestApp::new().await;

    let result = app
        .state
        .webhook_reconciler
        .handle(succeeded(Uuid::new_v4()))
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn unknown_event_kind_is_acknowledged() {
    let app = TestApp::new().await;

    let result = app
        .state
        .webhook_reconciler
        .handle(GatewayEvent {
            id: "evt_other".to_string(),
            kind: GatewayEventKind::Unknown("invoice.paid".to_string()),
            payment_intent_id: None,
            order_id: None,
            amount_refunded: None,
            failure_reason: None,
        })
        .await;

    assert!(result.is_ok());
}

#[tokio::test]
async fn raw_payload_with_valid_signature_is_processed() {
    let app = TestApp::new().await;
    let (_, order_id, _) = place_order(&app).await;

    let body = format!(
        r#"{{"id":"evt_raw_1","type":"payment_intent.succeeded","data":{{"object":{{"id":"pi_raw_1","object":"payment_intent","metadata":{{"order_id":"{order_id}"}}}}}}}}"#
    );
    let timestamp = chrono::Utc::now().timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"whsec_test_secret").unwrap();
    mac.update(format!("{timestamp}.{body}").as_bytes());
    let header = format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()));

    app.state
        .webhook_reconciler
        .handle_raw(body.as_bytes(), &header)
        .await
        .unwrap();

    let order = fetch_order(&app, order_id).await;
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Completed);
    assert_eq!(order.payment_intent_id.as_deref(), Some("pi_raw_1"));
}

#[tokio::test]
async fn raw_payload_with_bad_signature_is_rejected() {
    let app = TestApp::new().await;

    let body = br#"{"id":"evt_raw_2","type":"payment_intent.succeeded","data":{"object":{}}}"#;
    let timestamp = chrono::Utc::now().timestamp();
    let header = format!("t={timestamp},v1=deadbeef");

    let err = app
        .state
        .webhook_reconciler
        .handle_raw(body, &header)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::InvalidSignature));
}
