//! Context Manager Integration Tests
//!
//! Full converse cycles against a scripted model backend.

use async_trait::async_trait;
use ollamabot::attachment::{Attachment, AttachmentIngestor, MAX_ATTACHMENT_BYTES};
use ollamabot::backend::{BackendError, ChatMessage, ModelBackend};
use ollamabot::consent::ConsentGate;
use ollamabot::context::{ContextConfig, ContextManager, ConverseRequest};
use ollamabot::conversation::ConversationStore;
use ollamabot::error::BotError;
use ollamabot::registry::{InMemoryModelRegistry, ModelRegistry};
use ollamabot::transcript::{ChannelKey, Role, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Backend that answers from a queue and records every request
#[derive(Default)]
struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    delay: Duration,
}

impl ScriptedBackend {
    fn replying(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            ..Default::default()
        }
    }

    fn failing(err: BackendError) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(err)])),
            ..Default::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> Result<String, BackendError> {
        self.calls.lock().push((model.to_string(), messages.to_vec()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok("ok".to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["llama3".to_string()])
    }
}

struct Harness {
    manager: ContextManager,
    store: Arc<ConversationStore>,
    backend: Arc<ScriptedBackend>,
}

fn harness(backend: ScriptedBackend) -> Harness {
    let store = Arc::new(ConversationStore::open_in_memory().unwrap());
    let consent = Arc::new(ConsentGate::open_in_memory().unwrap());
    let registry: Arc<dyn ModelRegistry> = Arc::new(InMemoryModelRegistry::new());
    let backend = Arc::new(backend);

    consent.record_agreement("42", "max").unwrap();
    registry.set("g1", "llama3").unwrap();

    let manager = ContextManager::new(
        store.clone(),
        consent,
        registry,
        backend.clone(),
        AttachmentIngestor::default(),
        ContextConfig::default(),
    );

    Harness {
        manager,
        store,
        backend,
    }
}

fn key() -> ChannelKey {
    ChannelKey::new("g1", "c1")
}

fn max() -> Sender {
    Sender::new("42", "max")
}

fn request(prompt: &str) -> ConverseRequest {
    ConverseRequest::new(key(), max(), prompt)
}

#[tokio::test]
async fn test_hello_hi_there() {
    let h = harness(ScriptedBackend::replying(&["hi there"]));

    let reply = h.manager.converse(request("hello")).await.unwrap();
    assert_eq!(reply, "hi there");

    let transcript = h.store.load(&key()).unwrap();
    assert_eq!(transcript.len(), 2);

    let user = &transcript.turns()[0];
    assert_eq!(user.role, Role::User);
    assert_eq!(user.content, "hello");
    assert_eq!(user.sender, max());

    let assistant = &transcript.turns()[1];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.content, "hi there");
    assert_eq!(assistant.sender, Sender::assistant());

    // Default model from the registry
    assert_eq!(h.backend.calls()[0].0, "llama3");
}

#[tokio::test]
async fn test_turns_follow_call_order() {
    let h = harness(ScriptedBackend::replying(&["one", "two", "three"]));

    for prompt in ["a", "b", "c"] {
        h.manager.converse(request(prompt)).await.unwrap();
    }

    let contents: Vec<(Role, String)> = h
        .store
        .load(&key())
        .unwrap()
        .iter()
        .map(|t| (t.role, t.content.clone()))
        .collect();

    assert_eq!(
        contents,
        vec![
            (Role::User, "a".to_string()),
            (Role::Assistant, "one".to_string()),
            (Role::User, "b".to_string()),
            (Role::Assistant, "two".to_string()),
            (Role::User, "c".to_string()),
            (Role::Assistant, "three".to_string()),
        ]
    );

    // The third call saw the whole history
    let (_, messages) = &h.backend.calls()[2];
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[4].content, "c");
}

#[tokio::test]
async fn test_consent_required() {
    let h = harness(ScriptedBackend::replying(&["never"]));
    let stranger = Sender::new("7", "eve");

    let err = h
        .manager
        .converse(ConverseRequest::new(key(), stranger, "hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::ConsentRequired(ref id) if id == "7"));
    assert!(h.store.load_raw(&key()).unwrap().is_none());
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_explicit_model_wins() {
    let h = harness(ScriptedBackend::replying(&["ok"]));
    h.manager
        .converse(request("hello").with_model("mistral"))
        .await
        .unwrap();
    assert_eq!(h.backend.calls()[0].0, "mistral");
}

#[tokio::test]
async fn test_no_default_model() {
    let h = harness(ScriptedBackend::replying(&["never"]));
    let elsewhere = ChannelKey::new("g2", "c1");

    let err = h
        .manager
        .converse(ConverseRequest::new(elsewhere.clone(), max(), "hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::NoDefaultModel(ref g) if g == "g2"));
    assert!(h.store.load(&elsewhere).unwrap().is_empty());
}

#[tokio::test]
async fn test_backend_failure_leaves_transcript_unchanged() {
    let h = harness(ScriptedBackend::replying(&["hi there"]));
    h.manager.converse(request("hello")).await.unwrap();
    let before = h.store.load_raw(&key()).unwrap();

    *h.backend.replies.lock() = VecDeque::from([Err(BackendError::Response("boom".into()))]);
    let err = h.manager.converse(request("again")).await.unwrap_err();

    assert!(matches!(err, BotError::BackendError(_)));
    assert_eq!(h.store.load_raw(&key()).unwrap(), before);
}

#[tokio::test]
async fn test_backend_unavailable() {
    let h = harness(ScriptedBackend::failing(BackendError::Unavailable("connection refused".into())));
    let err = h.manager.converse(request("hello")).await.unwrap_err();
    assert!(matches!(err, BotError::BackendUnavailable(_)));
    assert!(h.store.load(&key()).unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_reply_is_not_persisted() {
    let h = harness(ScriptedBackend::replying(&["   "]));
    let err = h.manager.converse(request("hello")).await.unwrap_err();
    assert!(matches!(err, BotError::BackendError(_)));
    assert!(h.store.load(&key()).unwrap().is_empty());
}

#[tokio::test]
async fn test_timeout_persists_nothing() {
    let h = harness(ScriptedBackend::replying(&["too late"]).with_delay(Duration::from_millis(500)));

    let err = h
        .manager
        .converse(request("hello").with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::BackendTimeout(d) if d == Duration::from_millis(50)));
    assert!(h.store.load_raw(&key()).unwrap().is_none());
}

#[tokio::test]
async fn test_empty_prompt_rejected() {
    let h = harness(ScriptedBackend::default());
    let err = h.manager.converse(request("   ")).await.unwrap_err();
    assert!(matches!(err, BotError::EmptyPrompt));
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_clear_then_load_is_empty() {
    let h = harness(ScriptedBackend::replying(&["hi there"]));
    h.manager.converse(request("hello")).await.unwrap();

    assert!(h.manager.clear(&key()).await.unwrap());
    assert!(h.store.load(&key()).unwrap().is_empty());
    assert!(h.manager.export(&key(), "42").unwrap().is_none());
}

#[tokio::test]
async fn test_export_requires_consent_and_is_verbatim() {
    let h = harness(ScriptedBackend::replying(&["hi there"]));
    h.manager.converse(request("hello")).await.unwrap();

    assert!(matches!(
        h.manager.export(&key(), "7"),
        Err(BotError::ConsentRequired(_))
    ));

    let exported = h.manager.export(&key(), "42").unwrap().unwrap();
    assert_eq!(Some(exported), h.store.load_raw(&key()).unwrap());
}

#[tokio::test]
async fn test_concurrent_same_channel_calls_keep_all_turns() {
    let h = harness(ScriptedBackend::replying(&["first", "second"]).with_delay(Duration::from_millis(50)));

    let (a, b) = tokio::join!(
        h.manager.converse(request("one")),
        h.manager.converse(request("two")),
    );
    a.unwrap();
    b.unwrap();

    let transcript = h.store.load(&key()).unwrap();
    assert_eq!(transcript.len(), 4);

    let roles: Vec<Role> = transcript.iter().map(|t| t.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant, Role::User, Role::Assistant]);

    // The second call saw the first exchange
    let calls = h.backend.calls();
    assert_eq!(calls[0].1.len(), 1);
    assert_eq!(calls[1].1.len(), 3);
}

#[tokio::test]
async fn test_timeout_covers_wait_for_busy_channel() {
    let h = Arc::new(harness(
        ScriptedBackend::replying(&["slow", "never"]).with_delay(Duration::from_millis(800)),
    ));

    let holder = {
        let h = h.clone();
        tokio::spawn(async move { h.manager.converse(request("one")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    let err = h
        .manager
        .converse(request("two").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BotError::BackendTimeout(d) if d == Duration::from_millis(100)));
    assert!(elapsed < Duration::from_millis(500), "waited {:?}", elapsed);

    // The holder finishes and only its exchange is kept
    assert_eq!(holder.await.unwrap().unwrap(), "slow");
    let transcript = h.store.load(&key()).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(h.backend.calls().len(), 1);
}

async fn serve_file(server: &MockServer, name: &str, body: &[u8]) -> String {
    Mock::given(method("GET"))
        .and(path(format!("/attachments/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
    format!("{}/attachments/{}", server.uri(), name)
}

#[tokio::test]
async fn test_attachment_size_boundary() {
    let server = MockServer::start().await;
    let url = serve_file(&server, "big.bin", b"hi").await;
    let h = harness(ScriptedBackend::replying(&["got it"]));

    let at_limit = Attachment {
        url: url.clone(),
        filename: "big.bin".into(),
        content_type: None,
        size: MAX_ATTACHMENT_BYTES,
    };
    h.manager
        .converse(request("look").with_attachment(at_limit))
        .await
        .unwrap();
    let before = h.store.load_raw(&key()).unwrap();
    assert_eq!(h.store.load(&key()).unwrap().len(), 3);

    let over_limit = Attachment {
        url,
        filename: "big.bin".into(),
        content_type: None,
        size: 1_073_741_825,
    };
    let err = h
        .manager
        .converse(request("look again").with_attachment(over_limit))
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::AttachmentTooLarge { size: 1_073_741_825, .. }));
    assert_eq!(h.store.load_raw(&key()).unwrap(), before);
}

#[tokio::test]
async fn test_image_attachment_reaches_backend() {
    let server = MockServer::start().await;
    let url = serve_file(&server, "cat.png", b"hi").await;
    let h = harness(ScriptedBackend::replying(&["a cat"]));

    let attachment = Attachment {
        url,
        filename: "cat.png".into(),
        content_type: Some("image/png".into()),
        size: 2,
    };
    h.manager
        .converse(request("what is this?").with_attachment(attachment))
        .await
        .unwrap();

    let (_, messages) = &h.backend.calls()[0];
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "what is this?");
    assert_eq!(messages[1].content, "Attached file: cat.png");
    assert_eq!(messages[1].images, Some(vec!["aGk=".to_string()]));

    let transcript = h.store.load(&key()).unwrap();
    let roles: Vec<Role> = transcript.iter().map(|t| t.role).collect();
    assert_eq!(roles, [Role::User, Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_attachment_only_request() {
    let server = MockServer::start().await;
    let url = serve_file(&server, "notes.txt", b"buy milk").await;
    let h = harness(ScriptedBackend::replying(&["noted"]));

    let attachment = Attachment {
        url,
        filename: "notes.txt".into(),
        content_type: Some("text/plain".into()),
        size: 8,
    };
    h.manager
        .converse(request("").with_attachment(attachment))
        .await
        .unwrap();

    let transcript = h.store.load(&key()).unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(
        transcript.turns()[0].content,
        "Attached file: notes.txt\nFile contents:\nbuy milk"
    );
}

#[tokio::test]
async fn test_attachment_failure_persists_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let h = harness(ScriptedBackend::replying(&["never"]));

    let attachment = Attachment {
        url: format!("{}/attachments/broken.txt", server.uri()),
        filename: "broken.txt".into(),
        content_type: Some("text/plain".into()),
        size: 10,
    };
    let err = h
        .manager
        .converse(request("read this").with_attachment(attachment))
        .await
        .unwrap_err();

    assert!(matches!(err, BotError::AttachmentProcessingFailed(_)));
    assert!(h.store.load_raw(&key()).unwrap().is_none());
    assert!(h.backend.calls().is_empty());
}
