#![allow(dead_code)]

use std::sync::Arc;

use axum::{body::Body, Router};
use coursegen_runtime::{
    routes,
    state::{AppState, Settings},
    storage::ObjectStore,
    store::MemoryStore,
    testing::{HashEmbedder, MemoryObjectStore, StaticIdentity, TutorModel},
};
use http::{header, Method, Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

pub const PROFESSOR: &str = "professor-token";
pub const STUDENT: &str = "student-token";
pub const OTHER_STUDENT: &str = "other-student-token";

pub const BOUNDARY: &str = "coursegen-boundary";
const MAX_UPLOAD: usize = 10 * 1024 * 1024;

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub model: Arc<TutorModel>,
}

pub fn app() -> (TestApp, Arc<MemoryObjectStore>) {
    let objects = Arc::new(MemoryObjectStore::default());
    (app_with_objects(objects.clone()), objects)
}

pub fn app_with_objects(objects: Arc<dyn ObjectStore>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let model = Arc::new(TutorModel::new(5, 72));
    let identity = StaticIdentity::default()
        .with(PROFESSOR, Uuid::new_v4())
        .with(STUDENT, Uuid::new_v4())
        .with(OTHER_STUDENT, Uuid::new_v4());
    let state = AppState {
        store: store.clone(),
        model: model.clone(),
        embedder: Arc::new(HashEmbedder),
        objects,
        identity: Arc::new(identity),
        settings: Settings::default(),
    };
    TestApp {
        router: routes::app(state, MAX_UPLOAD),
        store,
        model,
    }
}

impl TestApp {
    pub async fn send(&self, req: Request<Body>) -> (StatusCode, http::HeaderMap, Vec<u8>) {
        let res = self.router.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    pub async fn json(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(v) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let (status, _, bytes) = self.send(req).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.json(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::POST, uri, Some(token), Some(body)).await
    }

    /// Creates the sample course as the professor; returns (course id, enrollment code).
    pub async fn create_course(&self) -> (String, String) {
        let req = serde_json::to_value(coursegen_runtime::testing::create_course_req()).unwrap();
        let (status, body) = self.post("/api/courses", PROFESSOR, req).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        (
            body["course"]["id"].as_str().unwrap().to_string(),
            body["course"]["unique_code"].as_str().unwrap().to_string(),
        )
    }

    pub async fn create_module(&self, course_id: &str, token: &str, file: Option<(&str, Vec<u8>)>) -> (StatusCode, Value) {
        let mut fields = vec![
            ("title", None, b"Cell structure".to_vec()),
            ("description", None, b"Organelles and their functions".to_vec()),
        ];
        if let Some((name, bytes)) = file {
            fields.push(("file", Some(name), bytes));
        }
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/courses/{}/modules", course_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(multipart(&fields)))
            .unwrap();
        let (status, _, bytes) = self.send(req).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

/// Encodes `(name, file name, content)` parts as multipart/form-data.
pub fn multipart(fields: &[(&str, Option<&str>, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, file_name, content) in fields {
        out.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match file_name {
            Some(f) => out.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    name, f
                )
                .as_bytes(),
            ),
            None => out.extend_from_slice(format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes()),
        }
        out.extend_from_slice(content);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    out
}

/// One answer per question, always picking option `option`.
pub fn answers(count: usize, option: usize) -> Value {
    let responses: Vec<Value> = (0..count)
        .map(|i| serde_json::json!({ "questionIndex": i, "selectedOptionIndex": option }))
        .collect();
    serde_json::json!({ "responses": responses })
}
