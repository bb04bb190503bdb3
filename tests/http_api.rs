//! End-to-end tests of the HTTP API.
//!
//! Each test starts two in-process servers on ephemeral ports: a mock
//! upstream (document host plus an OpenAI-compatible `/v1/embeddings` and
//! `/v1/completions`) and the docqa router configured against it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use docqa::config::{Config, ContextOverflow};
use docqa::llm::OpenAiProvider;

const BAD_KEY: &str = "sk-revoked";

// ============ Fixtures ============

/// Minimal one-page PDF whose only text is `phrase`.
fn minimal_pdf_with_phrase(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

fn minimal_docx_with_text(text: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            text
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

// ============ Mock upstream ============

#[derive(Default)]
struct Upstream {
    documents: HashMap<String, Vec<u8>>,
    embedding_calls: AtomicUsize,
    completion_calls: AtomicUsize,
    downloads: AtomicUsize,
}

/// Deterministic bag-of-words vector so related texts rank close together.
fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 128];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
    {
        let mut h: u32 = 2166136261;
        for b in word.to_lowercase().bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(16777619);
        }
        v[(h % 128) as usize] += 1.0;
    }
    v
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Bearer ") && v != format!("Bearer {}", BAD_KEY))
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": { "message": "Incorrect API key provided", "type": "invalid_request_error" } })),
    )
        .into_response()
}

async fn mock_embeddings(
    State(up): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    up.embedding_calls.fetch_add(1, Ordering::SeqCst);
    let data: Vec<Value> = body["input"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(i, t)| json!({ "index": i, "embedding": embed_text(t.as_str().unwrap_or("")) }))
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// Echoes the prompt as the completion so tests can see what was sent.
async fn mock_completions(
    State(up): State<Arc<Upstream>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    up.completion_calls.fetch_add(1, Ordering::SeqCst);
    let prompt = body["prompt"].as_str().unwrap_or("");
    Json(json!({
        "id": "cmpl-test",
        "object": "text_completion",
        "model": body["model"],
        "choices": [{ "text": format!(" {}", prompt), "index": 0, "finish_reason": "stop" }],
    }))
    .into_response()
}

async fn mock_document(State(up): State<Arc<Upstream>>, UrlPath(name): UrlPath<String>) -> Response {
    up.downloads.fetch_add(1, Ordering::SeqCst);
    match up.documents.get(&name) {
        Some(bytes) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// ============ Harness ============

struct Harness {
    base: String,
    upstream_addr: SocketAddr,
    upstream: Arc<Upstream>,
    client: reqwest::Client,
    download_dir: std::path::PathBuf,
    _tmp: tempfile::TempDir,
}

impl Harness {
    async fn start(documents: Vec<(&str, Vec<u8>)>) -> Self {
        Self::start_with(documents, |_| {}).await
    }

    async fn start_with(documents: Vec<(&str, Vec<u8>)>, tweak: impl FnOnce(&mut Config)) -> Self {
        let upstream = Arc::new(Upstream {
            documents: documents
                .into_iter()
                .map(|(name, bytes)| (name.to_string(), bytes))
                .collect(),
            ..Upstream::default()
        });
        let mock = Router::new()
            .route("/docs/{name}", get(mock_document))
            .route("/v1/embeddings", post(mock_embeddings))
            .route("/v1/completions", post(mock_completions))
            .with_state(upstream.clone());
        let upstream_addr = serve(mock).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.root = tmp.path().join("storage");
        config.storage.download_dir = tmp.path().join("downloads");
        config.fetch.scheme = "http:".to_string();
        config.fetch.max_retries = 0;
        config.llm.base_url = format!("http://{}/v1", upstream_addr);
        config.llm.max_retries = 0;
        tweak(&mut config);
        config.validate().unwrap();

        let provider =
            OpenAiProvider::new(&config.llm, config.chunking.max_input_size).unwrap();
        let download_dir = config.storage.download_dir.clone();
        let app = docqa::server::router(config, Arc::new(provider)).unwrap();
        let addr = serve(app).await;

        Harness {
            base: format!("http://{}", addr),
            upstream_addr,
            upstream,
            client: reqwest::Client::new(),
            download_dir,
            _tmp: tmp,
        }
    }

    /// Scheme-less locator of a mock document, as clients send them.
    fn locator(&self, name: &str) -> String {
        format!("//{}/docs/{}", self.upstream_addr, name)
    }

    fn locators(&self, names: &[&str]) -> String {
        names
            .iter()
            .map(|n| self.locator(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> (StatusCode, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .query(params)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn post(&self, path: &str, params: &[(&str, &str)]) -> (StatusCode, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .query(params)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
        let body = resp.json().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn construct(&self, session: &str, names: &[&str]) -> (StatusCode, Value) {
        let urls = self.locators(names);
        self.get(
            "/construct_index/",
            &[("api_key", "sk-test"), ("fileurls", &urls), ("session_id", session)],
        )
        .await
    }

    async fn ask(&self, session: &str, question: &str) -> (StatusCode, Value) {
        self.get(
            "/query_index/",
            &[("api_key", "sk-test"), ("session_id", session), ("question", question)],
        )
        .await
    }

    fn completions(&self) -> usize {
        self.upstream.completion_calls.load(Ordering::SeqCst)
    }
}

fn leftover_downloads(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or("")
}

// ============ Tests ============

#[tokio::test]
async fn home_and_health() {
    let h = Harness::start(vec![]).await;

    let text = h
        .client
        .get(format!("{}/", h.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "<h1>Welcome to our server !!</h1>");

    let (status, body) = h.get("/health", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn missing_parameters_are_rejected_on_every_endpoint() {
    let h = Harness::start(vec![]).await;

    let cases: Vec<(&str, Vec<(&str, &str)>)> = vec![
        ("/construct_index/", vec![("fileurls", "//x/a.pdf"), ("session_id", "S1")]),
        ("/construct_index/", vec![("api_key", "k"), ("session_id", "S1")]),
        ("/construct_index/", vec![("api_key", "k"), ("fileurls", "//x/a.pdf"), ("session_id", "")]),
        ("/query_index/", vec![("api_key", "k"), ("session_id", "S1")]),
        ("/query_index/", vec![("session_id", "S1"), ("question", "Q?")]),
        ("/query/", vec![("api_key", "k"), ("question", "Q?")]),
        ("/query/", vec![("api_key", "k"), ("fileurls", "//x/a.pdf")]),
    ];
    for (path, params) in cases {
        let (status, body) = h.get(path, &params).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} {:?}", path, params);
        assert_eq!(error_code(&body), "invalid_input");
        assert!(body["error"]["message"].is_string());
    }
    assert_eq!(h.upstream.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(h.completions(), 0);
}

#[tokio::test]
async fn build_then_query_answers_from_the_document() {
    let h = Harness::start(vec![(
        "facts.pdf",
        minimal_pdf_with_phrase("The lighthouse keeper is named Marguerite"),
    )])
    .await;

    let (status, body) = h.construct("S1", &["facts.pdf"]).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["session_id"], "S1");
    assert_eq!(body["documents"], 1);
    assert!(body["nodes"].as_u64().unwrap() >= 1);
    assert_eq!(leftover_downloads(&h.download_dir), 0);

    let (status, body) = h.ask("S1", "What is the lighthouse keeper named?").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let answer = body["message"].as_str().unwrap();
    assert!(answer.contains("Marguerite"), "answer: {}", answer);
    assert!(answer.starts_with("Context information is below."));
    assert_eq!(h.completions(), 1);
}

#[tokio::test]
async fn post_is_accepted_like_get() {
    let h = Harness::start(vec![("notes.txt", b"Copper conducts electricity".to_vec())]).await;
    let urls = h.locators(&["notes.txt"]);

    let (status, _) = h
        .post(
            "/construct_index/",
            &[("api_key", "sk-test"), ("fileurls", &urls), ("session_id", "P1")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h
        .post(
            "/query_index/",
            &[("api_key", "sk-test"), ("session_id", "P1"), ("question", "What conducts?")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].as_str().unwrap().contains("Copper"));
}

#[tokio::test]
async fn sessions_are_isolated() {
    let h = Harness::start(vec![("a.txt", b"Session one secret is walrus".to_vec())]).await;

    let (status, _) = h.construct("S1", &["a.txt"]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h.ask("S2", "What is the secret?").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&body), "index_not_found");
    assert_eq!(h.completions(), 0);
}

#[tokio::test]
async fn rebuild_overwrites_previous_documents() {
    let h = Harness::start(vec![
        ("old.txt", b"Obsolete fact about pelicans".to_vec()),
        ("new.docx", minimal_docx_with_text("Current fact about flamingos")),
    ])
    .await;

    assert_eq!(h.construct("S1", &["old.txt"]).await.0, StatusCode::OK);
    let (status, body) = h.construct("S1", &["new.docx"]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["documents"], 1);

    let (_, body) = h.ask("S1", "Tell me about pelicans and flamingos").await;
    let answer = body["message"].as_str().unwrap();
    assert!(answer.contains("flamingos"));
    assert!(!answer.contains("Obsolete"));
}

#[tokio::test]
async fn failed_fetch_is_bad_gateway_and_leaves_no_files() {
    let h = Harness::start(vec![("ok.txt", b"present".to_vec())]).await;

    let (status, body) = h.construct("S1", &["ok.txt", "missing.pdf"]).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error_code(&body), "fetch_failed");
    assert_eq!(leftover_downloads(&h.download_dir), 0);

    let (status, _) = h.ask("S1", "anything?").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unparseable_pdf_is_unprocessable() {
    let h = Harness::start(vec![("broken.pdf", b"%PDF-1.4 not really".to_vec())]).await;

    let (status, body) = h.construct("S1", &["broken.pdf"]).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_code(&body), "parse_failed");
    assert_eq!(leftover_downloads(&h.download_dir), 0);
}

#[tokio::test]
async fn upstream_auth_failure_is_unauthorized() {
    let h = Harness::start(vec![("a.txt", b"some text".to_vec())]).await;
    let urls = h.locators(&["a.txt"]);

    let (status, body) = h
        .get(
            "/construct_index/",
            &[("api_key", BAD_KEY), ("fileurls", &urls), ("session_id", "S1")],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "upstream_auth");
    assert_eq!(leftover_downloads(&h.download_dir), 0);

    let (status, body) = h
        .get(
            "/query/",
            &[("api_key", BAD_KEY), ("fileurls", &urls), ("question", "Q?")],
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(&body), "upstream_auth");
}

#[tokio::test]
async fn raw_query_returns_completion_response() {
    let h = Harness::start(vec![
        ("one.txt", b"First document".to_vec()),
        ("two.pdf", minimal_pdf_with_phrase("Second document")),
    ])
    .await;
    let urls = h.locators(&["one.txt", "two.pdf"]);

    let (status, body) = h
        .get(
            "/query/",
            &[("api_key", "sk-test"), ("fileurls", &urls), ("question", "Which documents?")],
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["message"]["id"], "cmpl-test");
    let prompt = body["message"]["choices"][0]["text"].as_str().unwrap();
    assert!(prompt.starts_with(
        " Which documents?Only use the context given after the word 'CONTEXT:' to answer the question in the text before this sentence.: CONTEXT: First document\n\n"
    ));
    assert!(prompt.contains("Second document"));
    assert_eq!(h.upstream.embedding_calls.load(Ordering::SeqCst), 0);
    assert_eq!(leftover_downloads(&h.download_dir), 0);
}

#[tokio::test]
async fn raw_query_with_empty_list_is_empty_object() {
    let h = Harness::start(vec![]).await;

    let (status, body) = h
        .get(
            "/query/",
            &[("api_key", "sk-test"), ("fileurls", "[]"), ("question", "Q?")],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
    assert_eq!(h.upstream.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(h.completions(), 0);
}

#[tokio::test]
async fn oversized_raw_context_is_rejected_without_completion() {
    let big = "lorem ipsum dolor sit amet ".repeat(1000).into_bytes();
    let h = Harness::start_with(vec![("big.txt", big)], |c| {
        c.query.context_overflow = ContextOverflow::Reject;
    })
    .await;
    let urls = h.locators(&["big.txt"]);

    let (status, body) = h
        .get(
            "/query/",
            &[("api_key", "sk-test"), ("fileurls", &urls), ("question", "Q?")],
        )
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(error_code(&body), "context_too_large");
    assert_eq!(h.completions(), 0);
    assert_eq!(leftover_downloads(&h.download_dir), 0);
}

#[tokio::test]
async fn cors_allows_any_origin() {
    let h = Harness::start(vec![]).await;
    let resp = h
        .client
        .get(format!("{}/health", h.base))
        .header("Origin", "https://example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn malformed_query_string_uses_json_error_body() {
    let h = Harness::start(vec![]).await;

    let resp = h
        .client
        .get(format!(
            "{}/query_index/?api_key=k&session_id=S1&session_id=S2&question=q",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert!(resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .starts_with("application/json"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(error_code(&body), "invalid_input");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("session_id"));
}
