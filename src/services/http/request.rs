//! Protocol-neutral HTTP request and response types passed through hooks.

use std::collections::HashMap;

use axum::body::{Body, Bytes};
use axum::http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// A request as seen by HTTP hooks.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Basic credentials, when supplied.
    pub credentials: Option<(String, String)>,
    pub is_tls: bool,
}

impl HttpRequest {
    pub fn new(method: Method, path: &str) -> Self {
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            credentials: None,
            is_tls: false,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        parse_pairs(&self.query)
    }

    /// Fields of an `application/x-www-form-urlencoded` body.
    pub fn form(&self) -> HashMap<String, String> {
        parse_pairs(&String::from_utf8_lossy(&self.body))
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

fn parse_pairs(text: &str) -> HashMap<String, String> {
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

/// Response body: buffered, or streamed chunk by chunk until the sender drops.
#[derive(Debug)]
pub enum HttpBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

/// A response produced by an HTTP hook.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HttpBody,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: HttpBody::Full(body.into()),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, Bytes::new())
    }

    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::new(status, text.into()).with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status, body).with_header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn stream(status: StatusCode, chunks: mpsc::Receiver<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: HttpBody::Stream(chunks),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// The buffered body, or `None` for streams.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            HttpBody::Full(bytes) => Some(bytes),
            HttpBody::Stream(_) => None,
        }
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            HttpBody::Full(bytes) => Body::from(bytes),
            HttpBody::Stream(rx) => {
                Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>))
            }
        };
        (self.status, self.headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_query_from_path() {
        let req = HttpRequest::new(Method::GET, "/pools/default/b/default?bucket_uuid=abc&x=a%20b");
        assert_eq!(req.path, "/pools/default/b/default");
        let params = req.query_params();
        assert_eq!(params.get("bucket_uuid").map(String::as_str), Some("abc"));
        assert_eq!(params.get("x").map(String::as_str), Some("a b"));
    }

    #[test]
    fn decodes_form_bodies() {
        let req = HttpRequest::new(Method::POST, "/pools/default/buckets")
            .with_body("name=travel+sample&ramQuotaMB=100&roles=ro_admin%2Cadmin");
        let form = req.form();
        assert_eq!(form.get("name").map(String::as_str), Some("travel sample"));
        assert_eq!(form.get("ramQuotaMB").map(String::as_str), Some("100"));
        assert_eq!(form.get("roles").map(String::as_str), Some("ro_admin,admin"));
    }

    #[test]
    fn json_response_sets_content_type() {
        let res = HttpResponse::json(StatusCode::OK, &serde_json::json!({"a": 1})).unwrap();
        assert_eq!(res.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(res.body_bytes().unwrap().as_ref(), br#"{"a":1}"#);
    }
}
