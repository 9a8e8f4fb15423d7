//! Generative extraction of funding calls from fetched pages.
//!
//! Pages are cleaned of non-content markup, truncated, and handed to a chat-completion
//! backend that answers with JSON. The service owns the retry/escalation policy:
//!
//! - a baseline-tier answer with zero records on a page that mentions one of the
//!   relevance keywords is retried once on the escalated tier;
//! - a failed call waits a fixed backoff and is retried once on the escalated tier;
//! - a second failure yields an empty list.
//!
//! Callers therefore never see an error, only a (possibly empty) list.

use std::time::Duration;

use async_trait::async_trait;
use nabory_core::ExtractedRecord;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "nabory-extract";

pub const MAX_CONTENT_CHARS: usize = 100_000;

/// Topical terms whose presence means funding calls are plausibly on the page.
pub const RELEVANCE_KEYWORDS: &[&str] = &["nabór", "konkurs", "dofinansowanie"];

pub const ERROR_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Keys under which the record list may appear when the answer is an object.
pub const RESULT_LIST_KEYS: &[&str] = &["nabory", "opportunities", "data", "items", "records"];

pub const DEFAULT_BASELINE_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_ESCALATED_MODEL: &str = "gpt-4o";

/// Upper bound on one completion call, response body included.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Baseline,
    Escalated,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("empty response from extraction backend")]
    EmptyResponse,
    #[error("parse error: {0}")]
    Parse(String),
}

/// Prompt pair sent to the backend for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
}

const SYSTEM_PROMPT: &str = "You extract public funding calls (grant competitions, calls for \
proposals, recruitment rounds for subsidies) from HTML pages of Polish institutions. You answer \
with JSON only. You list every call present on the page and never invent data.";

impl ExtractionRequest {
    pub fn for_page(content: &str, source_url: &str) -> Self {
        let user_prompt = format!(
            r#"Extract ALL funding calls from the HTML below.

Answer with a JSON object of the form:
{{
  "nabory": [
    {{
      "title": "full name of the call (required)",
      "institution": "organising institution, e.g. PARP, WUP Warszawa (required)",
      "description": "1-3 sentences: purpose and what is financed, or null",
      "beneficiaries": "who may apply, or null",
      "dateFrom": "YYYY-MM-DD start of application intake, or null",
      "dateTo": "YYYY-MM-DD end of application intake, or null",
      "deadline": "YYYY-MM-DD final submission deadline, or null",
      "amount": "funding available per project, or null",
      "budget": "total budget of the call, or null",
      "type": "kind of call, e.g. konkurs, nabór ciągły, or null",
      "link": "absolute URL of the call details, or null"
    }}
  ]
}}

Rules:
- title and institution are required; if the institution is not named, derive it from the site.
- every other field must be null when the page does not state it; never guess.
- convert every date to ISO-8601 (YYYY-MM-DD).
- resolve relative links against {source_url}.
- include calls even when some details are missing.

Source URL: {source_url}

HTML:
{content}"#
        );
        Self {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt,
        }
    }
}

/// A chat-completion capability with two model tiers.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        tier: ModelTier,
        request: &ExtractionRequest,
    ) -> Result<String, ExtractError>;
}

/// Narrow seam the orchestrator depends on.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, content: &str, source_url: &str) -> Vec<ExtractedRecord>;
}

/// OpenAI-compatible chat completions backend.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    baseline_model: String,
    escalated_model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            baseline_model: DEFAULT_BASELINE_MODEL.to_string(),
            escalated_model: DEFAULT_ESCALATED_MODEL.to_string(),
            max_tokens: 8000,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_models(mut self, baseline: impl Into<String>, escalated: impl Into<String>) -> Self {
        self.baseline_model = baseline.into();
        self.escalated_model = escalated.into();
        self
    }

    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Baseline => &self.baseline_model,
            ModelTier::Escalated => &self.escalated_model,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    async fn complete(
        &self,
        tier: ModelTier,
        request: &ExtractionRequest,
    ) -> Result<String, ExtractError> {
        let model = self.model_for(tier);
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        debug!(model, prompt_chars = request.user_prompt.len(), "sending extraction request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Parse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ExtractError::EmptyResponse)
    }
}

#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub max_content_chars: usize,
    pub keywords: Vec<String>,
    pub error_backoff: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            max_content_chars: MAX_CONTENT_CHARS,
            keywords: RELEVANCE_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            error_backoff: ERROR_RETRY_BACKOFF,
        }
    }
}

impl EscalationPolicy {
    pub fn mentions_keywords(&self, content: &str) -> bool {
        let lowered = content.to_lowercase();
        self.keywords
            .iter()
            .any(|k| lowered.contains(&k.to_lowercase()))
    }
}

pub struct ExtractionService<B> {
    backend: B,
    policy: EscalationPolicy,
}

impl<B: CompletionBackend> ExtractionService<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            policy: EscalationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Cleans and truncates a page exactly as it will be submitted.
    pub fn prepare_content(&self, raw: &str) -> String {
        let cleaned = strip_non_content(raw);
        truncate_chars(&cleaned, self.policy.max_content_chars).to_string()
    }

    async fn attempt(
        &self,
        tier: ModelTier,
        request: &ExtractionRequest,
    ) -> Result<Vec<ExtractedRecord>, ExtractError> {
        let answer = self.backend.complete(tier, request).await?;
        debug!(?tier, preview = %truncate_chars(&answer, 500), "extraction answer");
        parse_records(&answer)
    }

    async fn escalated_attempt(
        &self,
        request: &ExtractionRequest,
        source_url: &str,
    ) -> Vec<ExtractedRecord> {
        match self.attempt(ModelTier::Escalated, request).await {
            Ok(records) => records,
            Err(err) => {
                warn!(url = source_url, error = %err, "escalated extraction failed; reporting no records");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl<B: CompletionBackend> Extractor for ExtractionService<B> {
    async fn extract(&self, content: &str, source_url: &str) -> Vec<ExtractedRecord> {
        let prepared = self.prepare_content(content);
        let has_keywords = self.policy.mentions_keywords(&prepared);
        let request = ExtractionRequest::for_page(&prepared, source_url);

        let records = match self.attempt(ModelTier::Baseline, &request).await {
            Ok(records) if records.is_empty() && has_keywords => {
                warn!(url = source_url, "no records on a page with relevant keywords; escalating");
                self.escalated_attempt(&request, source_url).await
            }
            Ok(records) => records,
            Err(err) => {
                warn!(url = source_url, error = %err, "extraction failed; retrying on escalated tier");
                tokio::time::sleep(self.policy.error_backoff).await;
                self.escalated_attempt(&request, source_url).await
            }
        };

        info!(url = source_url, items = records.len(), "extraction complete");
        records
    }
}

/// Serializes the document without `script`, `style` and `noscript` subtrees.
pub fn strip_non_content(raw: &str) -> String {
    let mut document = Html::parse_document(raw);
    let Ok(selector) = Selector::parse("script, style, noscript") else {
        return document.html();
    };
    let ids = document.select(&selector).map(|el| el.id()).collect::<Vec<_>>();
    for id in ids {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    document.html()
}

/// Longest prefix of at most `max_chars` characters.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

fn strip_code_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn record_from_value(value: &JsonValue) -> Option<ExtractedRecord> {
    let title = json_text(value, "title");
    let institution = json_text(value, "institution");
    let (Some(title), Some(institution)) = (title, institution) else {
        debug!(record = %value, "dropping record without title or institution");
        return None;
    };
    Some(ExtractedRecord {
        title,
        institution,
        description: json_text(value, "description"),
        beneficiaries: json_text(value, "beneficiaries"),
        date_from: json_text(value, "dateFrom"),
        date_to: json_text(value, "dateTo"),
        deadline: json_text(value, "deadline"),
        amount: json_text(value, "amount"),
        budget: json_text(value, "budget"),
        opportunity_type: json_text(value, "type"),
        link: json_text(value, "link"),
    })
}

/// Reads a bare list or an object carrying the list under one of [`RESULT_LIST_KEYS`].
///
/// Unrecognised shapes yield an empty list; text that is not JSON is an error.
pub fn parse_records(answer: &str) -> Result<Vec<ExtractedRecord>, ExtractError> {
    let value: JsonValue = serde_json::from_str(strip_code_fence(answer))
        .map_err(|e| ExtractError::Parse(e.to_string()))?;

    let items = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => {
            match RESULT_LIST_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            {
                Some(items) => items,
                None => {
                    warn!(keys = ?map.keys().collect::<Vec<_>>(), "unexpected extraction envelope");
                    return Ok(Vec::new());
                }
            }
        }
        other => {
            warn!(kind = %other, "extraction answer is neither list nor object");
            return Ok(Vec::new());
        }
    };

    Ok(items.iter().filter_map(record_from_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct ScriptedBackend {
        answers: Mutex<VecDeque<Result<String, ExtractError>>>,
        calls: Mutex<Vec<ModelTier>>,
    }

    impl ScriptedBackend {
        fn new(answers: Vec<Result<String, ExtractError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ModelTier> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            tier: ModelTier,
            _request: &ExtractionRequest,
        ) -> Result<String, ExtractError> {
            self.calls.lock().unwrap().push(tier);
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExtractError::EmptyResponse))
        }
    }

    const ONE_RECORD: &str =
        r#"{"nabory":[{"title":"Konkurs A","institution":"PARP","dateFrom":"2024-01-01"}]}"#;
    const NO_RECORDS: &str = r#"{"nabory":[]}"#;
    const RELEVANT_PAGE: &str = "<html><body><h1>Aktualny nabór wniosków</h1></body></html>";
    const IRRELEVANT_PAGE: &str = "<html><body><h1>Kontakt</h1></body></html>";

    fn service(answers: Vec<Result<String, ExtractError>>) -> ExtractionService<ScriptedBackend> {
        ExtractionService::new(ScriptedBackend::new(answers))
    }

    #[tokio::test]
    async fn baseline_records_are_returned_without_escalation() {
        let svc = service(vec![Ok(ONE_RECORD.into())]);
        let records = svc.extract(RELEVANT_PAGE, "https://parp.example/").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Konkurs A");
        assert_eq!(svc.backend().calls(), vec![ModelTier::Baseline]);
    }

    #[tokio::test]
    async fn empty_baseline_on_relevant_page_escalates_exactly_once() {
        let svc = service(vec![Ok(NO_RECORDS.into()), Ok(NO_RECORDS.into())]);
        let records = svc.extract(RELEVANT_PAGE, "https://parp.example/").await;
        assert!(records.is_empty());
        assert_eq!(
            svc.backend().calls(),
            vec![ModelTier::Baseline, ModelTier::Escalated]
        );
    }

    #[tokio::test]
    async fn escalated_tier_result_is_used() {
        let svc = service(vec![Ok(NO_RECORDS.into()), Ok(ONE_RECORD.into())]);
        let records = svc.extract(RELEVANT_PAGE, "https://parp.example/").await;
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn empty_baseline_on_irrelevant_page_does_not_escalate() {
        let svc = service(vec![Ok(NO_RECORDS.into())]);
        let records = svc.extract(IRRELEVANT_PAGE, "https://parp.example/").await;
        assert!(records.is_empty());
        assert_eq!(svc.backend().calls(), vec![ModelTier::Baseline]);
    }

    #[tokio::test]
    async fn keywords_inside_scripts_do_not_count() {
        let page = "<html><head><script>var konkurs = 1;</script></head><body>Kontakt</body></html>";
        let svc = service(vec![Ok(NO_RECORDS.into())]);
        svc.extract(page, "https://parp.example/").await;
        assert_eq!(svc.backend().calls(), vec![ModelTier::Baseline]);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_error_waits_then_retries_on_escalated_tier() {
        let svc = service(vec![
            Err(ExtractError::Network("connection reset".into())),
            Ok(ONE_RECORD.into()),
        ]);
        let started = tokio::time::Instant::now();
        let records = svc.extract(IRRELEVANT_PAGE, "https://parp.example/").await;
        assert!(started.elapsed() >= ERROR_RETRY_BACKOFF);
        assert_eq!(records.len(), 1);
        assert_eq!(
            svc.backend().calls(),
            vec![ModelTier::Baseline, ModelTier::Escalated]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn two_failures_degrade_to_empty_list() {
        let svc = service(vec![
            Err(ExtractError::Api {
                status: 500,
                message: "boom".into(),
            }),
            Err(ExtractError::EmptyResponse),
        ]);
        let records = svc.extract(RELEVANT_PAGE, "https://parp.example/").await;
        assert!(records.is_empty());
        assert_eq!(svc.backend().calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_answer_counts_as_failure() {
        let svc = service(vec![Ok("not json at all".into()), Ok(ONE_RECORD.into())]);
        let records = svc.extract(IRRELEVANT_PAGE, "https://parp.example/").await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            svc.backend().calls(),
            vec![ModelTier::Baseline, ModelTier::Escalated]
        );
    }

    #[test]
    fn parse_records_accepts_known_envelopes() {
        let item = r#"{"title":"T","institution":"I"}"#;
        for answer in [
            format!("[{item}]"),
            format!(r#"{{"nabory":[{item}]}}"#),
            format!(r#"{{"data":[{item}]}}"#),
            format!(r#"{{"items":[{item}]}}"#),
            format!("```json\n{{\"nabory\":[{item}]}}\n```"),
        ] {
            let records = parse_records(&answer).unwrap();
            assert_eq!(records.len(), 1, "answer: {answer}");
        }
        assert!(parse_records(r#"{"unexpected":[{"title":"T"}]}"#)
            .unwrap()
            .is_empty());
        assert!(parse_records(r#""just a string""#).unwrap().is_empty());
        assert!(parse_records("<html>").is_err());
    }

    #[test]
    fn parse_records_drops_incomplete_and_keeps_nulls() {
        let answer = r#"{"nabory":[
            {"title":"Konkurs A","institution":"PARP","description":null,"amount":150000,"link":"  "},
            {"title":"","institution":"NCBR"},
            {"institution":"BGK"}
        ]}"#;
        let records = parse_records(answer).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description, None);
        assert_eq!(records[0].amount.as_deref(), Some("150000"));
        assert_eq!(records[0].link, None);
    }

    #[test]
    fn prepare_content_strips_markup_and_truncates() {
        let svc = service(vec![]);
        let page = "<html><head><style>.a{}</style><script>alert(1)</script></head>\
                    <body><noscript>enable js</noscript><p>Nabór 1/2024</p></body></html>";
        let prepared = svc.prepare_content(page);
        assert!(prepared.contains("Nabór 1/2024"));
        assert!(!prepared.contains("alert"));
        assert!(!prepared.contains(".a{}"));
        assert!(!prepared.contains("enable js"));

        let long = format!("<p>{}</p>", "ż".repeat(MAX_CONTENT_CHARS * 2));
        assert_eq!(svc.prepare_content(&long).chars().count(), MAX_CONTENT_CHARS);
    }

    #[test]
    fn request_embeds_contract_url_and_content() {
        let req = ExtractionRequest::for_page("<p>Nabór</p>", "https://wup.example/nabory");
        assert!(req.user_prompt.contains("https://wup.example/nabory"));
        assert!(req.user_prompt.contains("<p>Nabór</p>"));
        assert!(req.user_prompt.contains("\"dateFrom\""));
        assert!(req.system_prompt.contains("JSON"));
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let lower = l.to_ascii_lowercase();
                        lower
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    #[tokio::test]
    async fn openai_backend_sends_tier_model_and_reads_content() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let body = r#"{"choices":[{"message":{"role":"assistant","content":"{\"nabory\":[]}"}}]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });

        let backend = OpenAiBackend::new("sk-test", DEFAULT_COMPLETION_TIMEOUT)
            .unwrap()
            .with_base_url(format!("http://{addr}/v1/"))
            .with_models("small-model", "large-model");
        let answer = backend
            .complete(
                ModelTier::Escalated,
                &ExtractionRequest::for_page("<p>x</p>", "https://parp.example/"),
            )
            .await
            .unwrap();
        assert_eq!(answer, r#"{"nabory":[]}"#);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains("\"model\":\"large-model\""));
        assert!(request.contains("\"json_object\""));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
    }

    #[tokio::test]
    async fn openai_backend_maps_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let body = r#"{"error":"rate limited"}"#;
            let response = format!(
                "HTTP/1.1 429 Too Many Requests\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let backend = OpenAiBackend::new("sk-test", DEFAULT_COMPLETION_TIMEOUT)
            .unwrap()
            .with_base_url(format!("http://{addr}/v1"));
        let err = backend
            .complete(
                ModelTier::Baseline,
                &ExtractionRequest::for_page("<p>x</p>", "https://parp.example/"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Api { status: 429, .. }));
    }

    #[tokio::test]
    async fn stalled_completion_gives_up_after_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let backend = OpenAiBackend::new("sk-test", Duration::from_millis(200))
            .unwrap()
            .with_base_url(format!("http://{addr}/v1"));
        let started = std::time::Instant::now();
        let err = backend
            .complete(
                ModelTier::Baseline,
                &ExtractionRequest::for_page("<p>x</p>", "https://parp.example/"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Network(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
