//! HTTP listeners (management, views, query, search, analytics).
//!
//! Every listener is an axum router with a single fallback handler that
//! converts the request into an [`HttpRequest`] and runs it through the hook
//! chain for its service type. An unhandled request is a 404.

mod error;
mod request;

use std::sync::{Arc, Weak};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ErrorResponse};
pub use request::{HttpBody, HttpRequest, HttpResponse};

use super::{Service, ServiceError, ServiceType};
use crate::auth::Permission;
use crate::cluster::ClusterNode;
use crate::hooks::{CancelSource, HookResult};
use crate::logging::{debug, info, warn};

/// Largest request body accepted.
const MAX_REQUEST_BODY: usize = 20 * 1024 * 1024;

/// One HTTP listener of a node.
pub struct HttpService {
    service_type: ServiceType,
    node: Weak<ClusterNode>,
    hostname: String,
    port: u16,
    shutdown: CancelSource,
}

impl std::fmt::Debug for HttpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpService")
            .field("service_type", &self.service_type)
            .field("port", &self.port)
            .finish()
    }
}

impl HttpService {
    pub async fn bind(service_type: ServiceType, hostname: &str) -> Result<TcpListener, ServiceError> {
        TcpListener::bind((hostname, 0))
            .await
            .map_err(|source| ServiceError::Bind {
                service: service_type,
                source,
            })
    }

    /// A service that is not attached to a socket. Requests reach it through
    /// [`router`](Self::router) only.
    pub fn detached(service_type: ServiceType, hostname: &str, node: Weak<ClusterNode>) -> Arc<Self> {
        Arc::new(Self {
            service_type,
            node,
            hostname: hostname.to_string(),
            port: 0,
            shutdown: CancelSource::new(),
        })
    }

    /// Serve on an already bound listener until closed.
    pub fn start(
        service_type: ServiceType,
        listener: TcpListener,
        hostname: &str,
        node: Weak<ClusterNode>,
    ) -> Arc<Self> {
        let port = listener.local_addr().map(|addr| addr.port()).unwrap_or_default();
        let service = Arc::new(Self {
            service_type,
            node,
            hostname: hostname.to_string(),
            port,
            shutdown: CancelSource::new(),
        });
        info!(service = %service_type, port, "http service listening");

        let app = Arc::clone(&service).router();
        let mut shutdown = service.shutdown.token();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = served {
                warn!(service = %service_type, error = %err, "http service stopped");
            }
        });
        service
    }

    /// Router dispatching every request through this service's hooks.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }

    /// Run a request through the hook chain for this service type.
    pub fn dispatch(self: &Arc<Self>, req: &HttpRequest) -> HttpResponse {
        let Some(cluster) = self.node_handle().and_then(|node| node.cluster()) else {
            return HttpResponse::empty(StatusCode::SERVICE_UNAVAILABLE);
        };
        debug!(service = %self.service_type, method = %req.method, path = %req.path, "received http request");
        let handled = match cluster.hooks().http(self.service_type) {
            Some(hooks) => hooks.invoke_request(self, req),
            None => HookResult::Pass,
        };
        match handled {
            HookResult::Handled(res) => res,
            HookResult::Pass => HttpResponse::empty(StatusCode::NOT_FOUND),
        }
    }

    fn node_handle(&self) -> Option<Arc<ClusterNode>> {
        self.node.upgrade()
    }

    /// Whether the request's Basic credentials are valid and grant `permission`.
    pub fn check_authenticated(
        &self,
        req: &HttpRequest,
        permission: Permission,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> bool {
        let Some((username, password)) = &req.credentials else {
            return false;
        };
        let Some(cluster) = self.node_handle().and_then(|node| node.cluster()) else {
            return false;
        };
        cluster
            .auth()
            .check_user_pass(username, password, permission, bucket, scope, collection)
    }

    /// Like [`check_authenticated`](Self::check_authenticated) but produces
    /// the matching error: 401 for bad credentials, 403 for a missing permission.
    pub fn require(
        &self,
        req: &HttpRequest,
        permission: Permission,
        bucket: &str,
        scope: &str,
        collection: &str,
    ) -> Result<(), ApiError> {
        let Some((username, password)) = &req.credentials else {
            return Err(ApiError::unauthorized());
        };
        let cluster = self
            .node_handle()
            .and_then(|node| node.cluster())
            .ok_or_else(|| ApiError::internal("cluster is gone"))?;
        let auth = cluster.auth();
        if !auth.check_password(username, password) {
            return Err(ApiError::unauthorized());
        }
        if !auth.has_permission(username, permission, bucket, scope, collection) {
            return Err(ApiError::forbidden(permission));
        }
        Ok(())
    }
}

impl Service for HttpService {
    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn node(&self) -> Option<Arc<ClusterNode>> {
        self.node_handle()
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn listen_port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn handle(State(service): State<Arc<HttpService>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(err) => return (StatusCode::PAYLOAD_TOO_LARGE, err.to_string()).into_response(),
    };

    let credentials = parts
        .headers
        .typed_get::<Authorization<Basic>>()
        .map(|auth| (auth.username().to_string(), auth.password().to_string()));

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let mut request = HttpRequest::new(parts.method, path_and_query).with_body(body);
    request.headers = parts.headers;
    request.credentials = credentials;

    service.dispatch(&request).into_response()
}
