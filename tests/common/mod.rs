use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::{Digest, Sha512};
use storefront_api::{
    auth::Claims,
    config::AppConfig,
    db,
    entities::product_variant,
    errors::ServiceError,
    events::{self, EventSender},
    services::{
        catalog::CatalogService,
        order_id,
        orders::{OrderIdSource, OrderService},
        payments::{GatewaySession, PaymentGateway, TransactionRequest},
    },
    AppServices, AppState,
};
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_SERVER_KEY: &str = "test-gateway-server-key";

/// Scripted gateway double. Records every transaction request and can be
/// flipped into failure mode to exercise the rollback path.
pub struct MockGateway {
    fail: AtomicBool,
    calls: Mutex<Vec<TransactionRequest>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<TransactionRequest> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_transaction(
        &self,
        request: &TransactionRequest,
    ) -> Result<GatewaySession, ServiceError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentGateway(
                "gateway unavailable".to_string(),
            ));
        }
        Ok(GatewaySession {
            token: format!("snap-token-{}", request.order_id),
            redirect_url: format!("https://gateway.test/redirect/{}", request.order_id),
        })
    }
}

/// Order-id source that hands out a scripted sequence of ids, falling
/// back to freshly generated ones once the script runs dry. Counts every
/// draw so tests can assert how many attempts the service made.
pub struct ScriptedIds {
    queue: Mutex<VecDeque<String>>,
    draws: AtomicUsize,
}

impl ScriptedIds {
    pub fn new<I, S>(ids: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            queue: Mutex::new(ids.into_iter().map(Into::into).collect()),
            draws: AtomicUsize::new(0),
        })
    }

    pub fn draw_count(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }

    fn next(&self) -> String {
        self.draws.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| order_id::generate(Utc::now()))
    }

    pub fn as_source(self: &Arc<Self>) -> OrderIdSource {
        let ids = self.clone();
        Arc::new(move || ids.next())
    }
}

/// Test application over a throwaway SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<MockGateway>,
    db_file: String,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Like `new`, but the order service draws ids from the given script.
    pub async fn with_scripted_ids(ids: &Arc<ScriptedIds>) -> Self {
        Self::build(Some(ids.as_source())).await
    }

    async fn build(id_source: Option<OrderIdSource>) -> Self {
        let db_file = format!("storefront_test_{}.db", Uuid::new_v4().simple());
        let _ = std::fs::remove_file(&db_file);

        let mut cfg = AppConfig::new(
            format!("sqlite://{db_file}?mode=rwc"),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.midtrans_server_key = TEST_SERVER_KEY.to_string();

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = MockGateway::new();
        let catalog = Arc::new(CatalogService::new(db_arc.clone()));
        let mut order_service = OrderService::new(
            db_arc.clone(),
            catalog.clone(),
            gateway.clone(),
            Arc::new(event_sender.clone()),
        );
        if let Some(source) = id_source {
            order_service = order_service.with_id_source(source);
        }
        let orders = Arc::new(order_service);

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services: AppServices { catalog, orders },
        };

        let router = Router::new()
            .nest("/api/v1", storefront_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            gateway,
            db_file,
            _event_task: event_task,
        }
    }

    fn encode_token(&self, claims: &Claims) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(self.state.config.jwt_secret.as_bytes()),
        )
        .expect("encode test token")
    }

    /// Bearer token for an ordinary member account.
    pub fn member_token(&self, user_id: Uuid, email: &str) -> String {
        let now = Utc::now().timestamp();
        self.encode_token(&Claims {
            sub: user_id.to_string(),
            email: Some(email.to_string()),
            role: Some("customer".to_string()),
            iat: now,
            exp: now + 3600,
        })
    }

    /// Bearer token carrying the admin role.
    pub fn admin_token(&self) -> String {
        let now = Utc::now().timestamp();
        self.encode_token(&Claims {
            sub: Uuid::new_v4().to_string(),
            email: Some("admin@example.com".to_string()),
            role: Some("admin".to_string()),
            iat: now,
            exp: now + 3600,
        })
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn seed_variant(
        &self,
        sku: &str,
        price: Decimal,
        quantity: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Variant {}", sku)),
            price: Set(price),
            quantity: Set(quantity),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product variant for tests")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
        let _ = std::fs::remove_file(&self.db_file);
    }
}

/// Read a response body into JSON.
pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}

pub async fn assert_status(response: axum::response::Response, expected: StatusCode) -> Value {
    let status = response.status();
    let body = body_json(response).await;
    assert_eq!(status, expected, "unexpected status, body: {body}");
    body
}

/// Signature the gateway attaches to webhook notifications:
/// `sha512(order_id + status_code + gross_amount + server_key)`.
pub fn webhook_signature(order_id: &str, status_code: &str, gross_amount: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(TEST_SERVER_KEY.as_bytes());
    hex::encode(hasher.finalize())
}
