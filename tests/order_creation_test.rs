mod common;

use axum::http::{Method, StatusCode};
use common::{assert_status, ScriptedIds, TestApp};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::json;
use storefront_api::entities::{order, order_item, product_variant};
use uuid::Uuid;

/// Decimal fields serialize as strings; compare numerically so the
/// database's scale (`30000` vs `30000.0000`) does not matter.
fn decimal_field(value: &serde_json::Value) -> f64 {
    value
        .as_str()
        .expect("decimal serializes as string")
        .parse()
        .expect("decimal string parses")
}

fn guest_order_body(variant_id: Uuid, quantity: i32) -> serde_json::Value {
    json!({
        "items": [{ "variant_id": variant_id, "quantity": quantity }],
        "customer_name": "Budi Santoso",
        "customer_email": "budi@example.com",
        "customer_phone": "+6281234567890",
        "shipping_address": { "street": "Jl. Sudirman 1", "city": "Jakarta" },
        "payment_method": "bank_transfer"
    })
}

#[tokio::test]
async fn guest_checkout_creates_pending_order_without_gateway() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-001", dec!(15000), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 2)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;

    let data = &body["data"];
    assert_eq!(data["status"], "pending");
    assert_eq!(decimal_field(&data["total_price"]), 30000.0);
    assert!(data["payment_token"].is_null());
    // guests pay offline; the gateway is never contacted
    assert_eq!(app.gateway.call_count(), 0);

    // stock was reserved
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 8);
}

#[tokio::test]
async fn member_checkout_gets_payment_session() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-002", dec!(20000), 5).await;
    let user_id = Uuid::new_v4();
    let token = app.member_token(user_id, "member@example.com");

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1 }],
                "payment_method": "snap"
            })),
            Some(&token),
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;

    let data = &body["data"];
    let order_id = data["id"].as_str().unwrap();
    assert_eq!(data["status"], "pending");
    assert_eq!(
        data["payment_token"].as_str().unwrap(),
        format!("snap-token-{}", order_id)
    );
    assert!(data["payment_redirect_url"]
        .as_str()
        .unwrap()
        .contains(order_id));

    let call = app.gateway.last_call().expect("gateway was called");
    assert_eq!(call.order_id, order_id);
    assert_eq!(call.gross_amount, dec!(20000));

    // the persisted header belongs to the member, not a guest
    let stored = order::Entity::find_by_id(order_id.to_string())
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.user_id, Some(user_id));
    assert_eq!(stored.customer_email, None);
}

#[tokio::test]
async fn order_id_is_letters_dash_minute_timestamp() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-003", dec!(1000), 3).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;

    let id = body["data"]["id"].as_str().unwrap();
    let (prefix, suffix) = id.split_once('-').expect("id contains a dash");
    assert_eq!(prefix.len(), 3);
    assert!(prefix.chars().all(|c| c.is_ascii_uppercase()));
    assert_eq!(suffix.len(), 12);
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn client_supplied_prices_are_ignored() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-004", dec!(50000), 10).await;

    // a hostile client claims the item costs 1
    let mut body = guest_order_body(variant.id, 1);
    body["items"][0]["price"] = json!("1");
    body["total_price"] = json!("1");

    let response = app
        .request(Method::POST, "/api/v1/orders", Some(body), None)
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;

    assert_eq!(decimal_field(&body["data"]["total_price"]), 50000.0);
    assert_eq!(decimal_field(&body["data"]["items"][0]["price"]), 50000.0);
}

#[tokio::test]
async fn unknown_variant_rejects_whole_order() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-005", dec!(1000), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [
                    { "variant_id": variant.id, "quantity": 1 },
                    { "variant_id": Uuid::new_v4(), "quantity": 1 }
                ],
                "customer_name": "Budi",
                "customer_email": "budi@example.com",
                "customer_phone": "+62812",
                "shipping_address": { "street": "Jl. Sudirman 1" }
            })),
            None,
        )
        .await;
    assert_status(response, StatusCode::BAD_REQUEST).await;

    // nothing was written, stock untouched
    assert_eq!(
        order::Entity::find().all(&*app.state.db).await.unwrap().len(),
        0
    );
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 10);
}

#[tokio::test]
async fn insufficient_stock_rejects_whole_order() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-006", dec!(1000), 2).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 3)),
            None,
        )
        .await;
    assert_status(response, StatusCode::UNPROCESSABLE_ENTITY).await;

    assert_eq!(
        order::Entity::find().all(&*app.state.db).await.unwrap().len(),
        0
    );
}

#[tokio::test]
async fn duplicate_lines_cannot_oversell() {
    let app = TestApp::new().await;
    // each line passes the snapshot check alone, but together they exceed stock
    let variant = app.seed_variant("SKU-007", dec!(1000), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [
                    { "variant_id": variant.id, "quantity": 3 },
                    { "variant_id": variant.id, "quantity": 3 }
                ],
                "customer_name": "Budi",
                "customer_email": "budi@example.com",
                "customer_phone": "+62812",
                "shipping_address": { "street": "Jl. Sudirman 1" }
            })),
            None,
        )
        .await;
    assert_status(response, StatusCode::UNPROCESSABLE_ENTITY).await;

    // the aborted transaction left stock and tables untouched
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 5);
    assert_eq!(
        order_item::Entity::find()
            .all(&*app.state.db)
            .await
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn guest_without_contact_is_rejected() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-008", dec!(1000), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1 }]
            })),
            None,
        )
        .await;
    assert_status(response, StatusCode::BAD_REQUEST).await;
}

#[tokio::test]
async fn gateway_failure_rolls_back_order_and_stock() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-009", dec!(10000), 4).await;
    let token = app.member_token(Uuid::new_v4(), "member@example.com");
    app.gateway.set_fail(true);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 2 }]
            })),
            Some(&token),
        )
        .await;
    assert_status(response, StatusCode::BAD_GATEWAY).await;

    // the committed order was compensated away and stock restored
    assert_eq!(
        order::Entity::find().all(&*app.state.db).await.unwrap().len(),
        0
    );
    assert_eq!(
        order_item::Entity::find()
            .all(&*app.state.db)
            .await
            .unwrap()
            .len(),
        0
    );
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 4);
}

#[tokio::test]
async fn members_cannot_read_each_others_orders() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-010", dec!(1000), 5).await;
    let owner_token = app.member_token(Uuid::new_v4(), "owner@example.com");
    let other_token = app.member_token(Uuid::new_v4(), "other@example.com");

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1 }]
            })),
            Some(&owner_token),
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;
    let order_id = body["data"]["id"].as_str().unwrap().to_string();

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&other_token),
        )
        .await;
    assert_status(response, StatusCode::FORBIDDEN).await;

    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            Some(&owner_token),
        )
        .await;
    assert_status(response, StatusCode::OK).await;
}

#[tokio::test]
async fn guest_lookup_requires_matching_contact() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-011", dec!(1000), 5).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;
    let order_id = body["data"]["id"].as_str().unwrap().to_string();

    // no credentials at all
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            None,
            None,
        )
        .await;
    assert_status(response, StatusCode::BAD_REQUEST).await;

    // wrong email masks the order's existence
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}?email=wrong@example.com", order_id),
            None,
            None,
        )
        .await;
    assert_status(response, StatusCode::NOT_FOUND).await;

    // matching email succeeds
    let response = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}?email=budi@example.com", order_id),
            None,
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["id"], order_id);
    assert_eq!(body["data"]["status_label"], "Menunggu Pembayaran");
}

#[tokio::test]
async fn listing_filters_by_owner_and_status() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-012", dec!(1000), 50).await;
    let user_id = Uuid::new_v4();
    let token = app.member_token(user_id, "lister@example.com");

    for _ in 0..3 {
        let response = app
            .request(
                Method::POST,
                "/api/v1/orders",
                Some(json!({
                    "items": [{ "variant_id": variant.id, "quantity": 1 }]
                })),
                Some(&token),
            )
            .await;
        assert_status(response, StatusCode::CREATED).await;
    }
    // one guest order that must not appear in the member's list
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    assert_status(response, StatusCode::CREATED).await;

    let response = app
        .request(Method::GET, "/api/v1/orders", None, Some(&token))
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 3);

    // pagination
    let response = app
        .request(
            Method::GET,
            "/api/v1/orders?page=2&limit=2",
            None,
            Some(&token),
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["total_pages"], 2);

    // status filter with no matches
    let response = app
        .request(
            Method::GET,
            "/api/v1/orders?status=paid",
            None,
            Some(&token),
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["total"], 0);

    // guest listing by email sees only the guest order
    let response = app
        .request(
            Method::GET,
            "/api/v1/orders?email=budi@example.com",
            None,
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["total"], 1);

    // anonymous listing without credentials is rejected
    let response = app.request(Method::GET, "/api/v1/orders", None, None).await;
    assert_status(response, StatusCode::UNAUTHORIZED).await;
}

#[tokio::test]
async fn id_collision_retries_with_a_fresh_id() {
    // first order claims AAA; the second draws AAA again, hits the primary
    // key, and must retry with the next id instead of failing
    let ids = ScriptedIds::new([
        "AAA-202401010000",
        "AAA-202401010000",
        "BBB-202401010001",
    ]);
    let app = TestApp::with_scripted_ids(&ids).await;
    let variant = app.seed_variant("SKU-014", dec!(1000), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;
    assert_eq!(body["data"]["id"], "AAA-202401010000");

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;
    assert_eq!(body["data"]["id"], "BBB-202401010001");
    assert_eq!(ids.draw_count(), 3);

    // the collided attempt's transaction rolled back, so exactly two
    // orders exist and stock dropped by two
    assert_eq!(
        order::Entity::find().all(&*app.state.db).await.unwrap().len(),
        2
    );
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 8);
}

#[tokio::test]
async fn exhausted_id_retries_surface_a_masked_failure() {
    // every draw collides with the first order's id
    let ids = ScriptedIds::new([
        "CCC-202401010000",
        "CCC-202401010000",
        "CCC-202401010000",
        "CCC-202401010000",
    ]);
    let app = TestApp::with_scripted_ids(&ids).await;
    let variant = app.seed_variant("SKU-015", dec!(1000), 10).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    assert_status(response, StatusCode::CREATED).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 1)),
            None,
        )
        .await;
    let body = assert_status(response, StatusCode::INTERNAL_SERVER_ERROR).await;
    // persistence details stay out of the response
    assert_eq!(body["message"], "Failed to create order");

    // one draw for the first order, then exactly three bounded attempts
    assert_eq!(ids.draw_count(), 4);

    // nothing from the failed order survived
    assert_eq!(
        order::Entity::find().all(&*app.state.db).await.unwrap().len(),
        1
    );
    let reloaded = product_variant::Entity::find_by_id(variant.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.quantity, 9);
}

#[tokio::test]
async fn non_collision_failures_are_not_retried() {
    let ids = ScriptedIds::new(["DDD-202401010000"]);
    let app = TestApp::with_scripted_ids(&ids).await;
    let variant = app.seed_variant("SKU-016", dec!(1000), 1).await;

    // fails inside the transaction, but not on the id
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(guest_order_body(variant.id, 5)),
            None,
        )
        .await;
    assert_status(response, StatusCode::UNPROCESSABLE_ENTITY).await;

    // a single draw: the failure did not loop through fresh ids
    assert_eq!(ids.draw_count(), 1);
}

#[tokio::test]
async fn admin_status_updates_follow_the_state_machine() {
    let app = TestApp::new().await;
    let variant = app.seed_variant("SKU-013", dec!(1000), 5).await;
    let member_token = app.member_token(Uuid::new_v4(), "member@example.com");
    let admin_token = app.admin_token();

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(json!({
                "items": [{ "variant_id": variant.id, "quantity": 1 }]
            })),
            Some(&member_token),
        )
        .await;
    let body = assert_status(response, StatusCode::CREATED).await;
    let order_id = body["data"]["id"].as_str().unwrap().to_string();
    let status_uri = format!("/api/v1/orders/{}/status", order_id);

    // members cannot touch fulfillment status
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "paid" })),
            Some(&member_token),
        )
        .await;
    assert_status(response, StatusCode::FORBIDDEN).await;

    // pending cannot jump straight to delivered
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "delivered" })),
            Some(&admin_token),
        )
        .await;
    assert_status(response, StatusCode::BAD_REQUEST).await;

    // pending -> paid stamps paid_at
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "paid" })),
            Some(&admin_token),
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["status"], "paid");
    assert!(body["data"]["paid_at"].is_string());

    // paid -> processing -> shipping -> delivered
    for status in ["processing", "shipping", "delivered"] {
        let response = app
            .request(
                Method::PUT,
                &status_uri,
                Some(json!({ "status": status })),
                Some(&admin_token),
            )
            .await;
        let body = assert_status(response, StatusCode::OK).await;
        assert_eq!(body["data"]["status"], status);
    }

    // repeating the current status is a no-op, not an error
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "delivered" })),
            Some(&admin_token),
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert_eq!(body["data"]["status"], "delivered");

    // delivered -> completed stamps completed_at and becomes terminal
    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "completed" })),
            Some(&admin_token),
        )
        .await;
    let body = assert_status(response, StatusCode::OK).await;
    assert!(body["data"]["completed_at"].is_string());

    let response = app
        .request(
            Method::PUT,
            &status_uri,
            Some(json!({ "status": "cancelled" })),
            Some(&admin_token),
        )
        .await;
    assert_status(response, StatusCode::BAD_REQUEST).await;
}
