use easyprompt::config::{ApiConfig, ApiType};
use easyprompt::conversation::{ConfirmOutcome, ConversationEvent, ConversationHandler, TurnOutcome};
use easyprompt::evaluation::Evaluation;
use easyprompt::evaluator::EvaluatorService;
use easyprompt::llm::LlmClient;
use easyprompt::locale::{Language, Locale};
use easyprompt::session::{MessageKind, SessionStatus};
use easyprompt::state::ConversationState;
use easyprompt::store::FileSessionStore;
use easyprompt::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const THRESHOLD: f32 = 8.0;

struct Harness {
    _dir: TempDir,
    server: MockServer,
    store: FileSessionStore,
    evaluator: Arc<EvaluatorService>,
    locale: Arc<Locale>,
    client: LlmClient,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let store = FileSessionStore::open(dir.path()).await.unwrap();
        let locale = Arc::new(Locale::new(Language::En));
        let evaluator = Arc::new(EvaluatorService::start(store.clone(), locale.clone(), 2));

        let mut config = ApiConfig::defaults_for(ApiType::OpenAi);
        config.api_key = Some("sk-test".to_string());
        config.base_url = server.uri();
        config.model = "test-model".to_string();
        let client = LlmClient::from_config(&config).unwrap();

        Self {
            _dir: dir,
            server,
            store,
            evaluator,
            locale,
            client,
        }
    }

    async fn handler(&self) -> ConversationHandler {
        ConversationHandler::create(
            Some("Test character".to_string()),
            None,
            self.store.clone(),
            self.client.clone(),
            self.evaluator.clone(),
            self.locale.clone(),
            THRESHOLD,
        )
        .await
        .unwrap()
    }

    async fn mock_conversation(&self, parts: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .and(body_string_contains("character interviewer"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(parts), "text/event-stream"))
            .mount(&self.server)
            .await;
    }

    async fn mock_evaluator(&self, verdict: serde_json::Value) {
        let content = format!("```json\n{verdict}\n```");
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("strict evaluator"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": content}}]
            })))
            .mount(&self.server)
            .await;
    }

    async fn mock_writer(&self, parts: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("master prompt writer"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(parts), "text/event-stream"))
            .expect(1)
            .mount(&self.server)
            .await;
    }
}

fn sse(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        body.push_str(&format!("data: {}\n\n", json!({"choices": [{"delta": {"content": part}}]})));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn drain(rx: &mut mpsc::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn chunks(events: &[ConversationEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::AiResponseChunk { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn test_full_interview_to_final_prompt() {
    let h = Harness::new().await;
    // The separator arrives split across two chunks
    h.mock_conversation(&["Nice to meet you! -", "-- A knight named Aria"]).await;
    h.mock_evaluator(json!({
        "score": 9,
        "critique": "Rich enough to write",
        "is_ready_for_writing": true,
        "extracted_traits": ["knight"]
    }))
    .await;
    h.mock_writer(&["# Aria\n", "A proud knight."]).await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;

    let outcome = handler.greet(&tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { trait_added: true });
    assert_eq!(handler.revision(), 1);
    let events = drain(&mut rx);
    assert_eq!(chunks(&events).trim(), "Nice to meet you!");
    assert!(!chunks(&events).contains("knight"));
    let session_ref = handler.session_ref();
    assert_eq!(h.store.load_profile(&session_ref).await.unwrap(), "A knight named Aria\n");

    // Waits for the verdict on revision 1, which says ready
    let outcome = handler.handle_message("She is brave", &tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::ConfirmationRequested);
    assert_eq!(handler.state(), ConversationState::AwaitingConfirmation);
    assert_eq!(handler.critique(), "Rich enough to write");
    let events = drain(&mut rx);
    assert!(events.contains(&ConversationEvent::ConfirmationRequest {
        reason: "Rich enough to write".to_string()
    }));

    let (path, prompt) = match handler.confirm(true, &tx).await.unwrap() {
        ConfirmOutcome::Completed { path, prompt } => (path, prompt),
        other => panic!("expected a completed session, got {other:?}"),
    };
    assert_eq!(prompt, "# Aria\nA proud knight.");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), prompt);
    assert_eq!(handler.state(), ConversationState::Completed);

    let events = drain(&mut rx);
    let final_text: String = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::FinalPromptChunk { chunk } => Some(chunk.as_str()),
            _ => None,
        })
        .collect();
    assert!(final_text.contains("===== Final Character Prompt ====="));
    assert!(final_text.ends_with("A proud knight."));
    assert!(matches!(events.last(), Some(ConversationEvent::SessionEnd { .. })));

    let session = h.store.get_session(&session_ref).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.messages.iter().any(|m| m.kind == MessageKind::FinalPrompt));
    assert_eq!(h.store.load_evaluation(&session_ref).await.unwrap().unwrap().score, Some(9.0));

    // No more messages once completed
    assert!(matches!(
        handler.handle_message("more", &tx).await,
        Err(Error::InvalidTransition { .. })
    ));
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_decline_keeps_chatting_until_profile_changes() {
    let h = Harness::new().await;
    h.mock_conversation(&["Tell me more.", "---", "Has a silver sword"]).await;
    h.mock_evaluator(json!({"score": 8.5, "critique": "", "is_ready_for_writing": false})).await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    handler.greet(&tx).await.unwrap();

    assert_eq!(
        handler.handle_message("ok", &tx).await.unwrap(),
        TurnOutcome::ConfirmationRequested
    );
    let events = drain(&mut rx);
    // Empty critique falls back to the default reason
    assert!(events.contains(&ConversationEvent::ConfirmationRequest {
        reason: "The character profile looks complete enough.".to_string()
    }));

    assert_eq!(handler.confirm(false, &tx).await.unwrap(), ConfirmOutcome::Continue);
    assert_eq!(handler.state(), ConversationState::Chatting);
    let events = drain(&mut rx);
    assert!(chunks(&events).contains("keep refining"));

    // Same revision: the model answers instead of asking again
    let outcome = handler.handle_message("She has a sister", &tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { trait_added: true });
    assert_eq!(handler.revision(), 2);

    // The profile changed, so readiness is asked again
    assert_eq!(
        handler.handle_message("anything else?", &tx).await.unwrap(),
        TurnOutcome::ConfirmationRequested
    );
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_reply_without_trait_skips_evaluation() {
    let h = Harness::new().await;
    h.mock_conversation(&["What is their name?\n---\nNone"]).await;
    Mock::given(method("POST"))
        .and(body_string_contains("strict evaluator"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    let outcome = handler.greet(&tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { trait_added: false });

    // Empty profile, so no readiness check either
    let outcome = handler.handle_message("Aria", &tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { trait_added: false });
    assert_eq!(handler.revision(), 0);
    assert_eq!(chunks(&drain(&mut rx)), "What is their name?\nWhat is their name?\n");
    assert_eq!(handler.handle_message("   ", &tx).await.unwrap(), TurnOutcome::Ignored);
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_llm_failure_is_reported_not_fatal() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})))
        .mount(&h.server)
        .await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    assert_eq!(handler.greet(&tx).await.unwrap(), TurnOutcome::Failed);
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::Error { message } if message.starts_with("Conversation model error") && message.contains("overloaded")
    )));
    assert_eq!(handler.state(), ConversationState::Chatting);
    assert_eq!(handler.handle_message("hello?", &tx).await.unwrap(), TurnOutcome::Failed);
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_evaluation_update_event_arrives() {
    let h = Harness::new().await;
    h.mock_conversation(&["Hello!---Wears a red cloak"]).await;
    h.mock_evaluator(json!({"score": 3, "critique": "Needs a name"})).await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    handler.greet(&tx).await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(ConversationEvent::EvaluationUpdate { message, is_ready, evaluation_score, .. }) => {
                    return (message, is_ready, evaluation_score)
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(update.0, "[Evaluation complete] Needs a name");
    assert!(!update.1);
    assert_eq!(update.2, Some(3.0));
    assert_eq!(handler.latest_evaluation().unwrap().critique, "Needs a name");
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_resume_restores_revision_and_history() {
    let h = Harness::new().await;
    h.mock_conversation(&["Hi!---Is a retired pirate"]).await;
    h.mock_evaluator(json!({"score": 4, "critique": "Describe their crew"})).await;

    let (tx, _rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    handler.greet(&tx).await.unwrap();
    // Wait for the verdict to be persisted
    let session_ref = handler.session_ref();
    for _ in 0..100 {
        if h.store.load_evaluation(&session_ref).await.unwrap().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handler.close();
    drop(handler);

    let resumed = ConversationHandler::resume(
        &session_ref,
        h.store.clone(),
        h.client.clone(),
        h.evaluator.clone(),
        h.locale.clone(),
        THRESHOLD,
    )
    .await
    .unwrap();
    assert_eq!(resumed.revision(), 1);
    assert_eq!(resumed.critique(), "Describe their crew");
    assert_eq!(resumed.state(), ConversationState::Chatting);
    assert_eq!(resumed.session().message_count, 1);
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_resume_reevaluates_profile_newer_than_stored_verdict() {
    let h = Harness::new().await;
    h.mock_conversation(&["And their weapon?"]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("strict evaluator"))
        .and(body_string_contains("Rides a dragon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"score\": 4, \"critique\": \"Explain the dragon\"}"}}]
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let handler = h.handler().await;
    let session_ref = handler.session_ref();
    drop(handler);

    // Revision 1 was judged ready, then a second trait landed before the process stopped
    h.store.append_trait(&session_ref, "A knight named Aria").await.unwrap();
    let mut ready = Evaluation::parse(r#"{"score": 9, "critique": "Ready", "is_ready_for_writing": true}"#).unwrap();
    ready.revision = 1;
    h.store.record_evaluation(&session_ref, &ready).await.unwrap();
    h.store.append_trait(&session_ref, "Rides a dragon").await.unwrap();

    let (tx, _rx) = mpsc::channel(256);
    let mut resumed = ConversationHandler::resume(
        &session_ref,
        h.store.clone(),
        h.client.clone(),
        h.evaluator.clone(),
        h.locale.clone(),
        THRESHOLD,
    )
    .await
    .unwrap();
    assert_eq!(resumed.revision(), 2);

    let outcome = resumed.handle_message("She is brave", &tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Replied { trait_added: false });
    assert_eq!(resumed.state(), ConversationState::Chatting);
    assert_eq!(resumed.critique(), "Explain the dragon");

    let stored = h.store.load_evaluation(&session_ref).await.unwrap().unwrap();
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.score, Some(4.0));
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_failed_evaluation_is_retried_on_next_turn() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("character interviewer"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&["Hello!---A knight named Aria"]), "text/event-stream"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&h.server)
        .await;
    h.mock_conversation(&["Go on."]).await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("strict evaluator"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&h.server)
        .await;
    h.mock_evaluator(json!({"score": 9, "critique": "Ready now", "is_ready_for_writing": true}))
        .await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    assert_eq!(
        handler.greet(&tx).await.unwrap(),
        TurnOutcome::Replied { trait_added: true }
    );

    // The verdict on revision 1 failed; this turn asks the evaluator again
    let outcome = handler.handle_message("She is brave", &tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::ConfirmationRequested);
    assert_eq!(handler.revision(), 1);
    assert_eq!(handler.critique(), "Ready now");

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::EvaluationUpdate { message, is_ready: false, .. } if message.contains("overloaded")
    )));
    assert!(events.contains(&ConversationEvent::ConfirmationRequest {
        reason: "Ready now".to_string()
    }));
    h.evaluator.stop().await;
}

#[tokio::test]
async fn test_writer_failure_asks_again_then_succeeds() {
    let h = Harness::new().await;
    h.mock_conversation(&["Welcome!---A bard with a lute"]).await;
    h.mock_evaluator(json!({"score": 9, "critique": "Good to go", "is_ready_for_writing": true}))
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("master prompt writer"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": {"message": "writer down"}})))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&h.server)
        .await;
    h.mock_writer(&["# Bard\n", "Sings of old wars."]).await;

    let (tx, mut rx) = mpsc::channel(256);
    let mut handler = h.handler().await;
    handler.greet(&tx).await.unwrap();
    assert_eq!(
        handler.handle_message("ok", &tx).await.unwrap(),
        TurnOutcome::ConfirmationRequested
    );
    drain(&mut rx);

    assert_eq!(handler.confirm(true, &tx).await.unwrap(), ConfirmOutcome::WriterFailed);
    assert_eq!(handler.state(), ConversationState::AwaitingConfirmation);
    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, ConversationEvent::Error { message } if message.contains("writer down"))));
    assert!(matches!(events.last(), Some(ConversationEvent::ConfirmationRequest { .. })));
    let session_ref = handler.session_ref();
    assert_eq!(h.store.load_final_prompt(&session_ref).await.unwrap(), None);

    match handler.confirm(true, &tx).await.unwrap() {
        ConfirmOutcome::Completed { prompt, .. } => assert_eq!(prompt, "# Bard\nSings of old wars."),
        other => panic!("expected a completed session, got {other:?}"),
    }
    assert_eq!(handler.state(), ConversationState::Completed);
    assert_eq!(
        h.store.load_final_prompt(&session_ref).await.unwrap().as_deref(),
        Some("# Bard\nSings of old wars.")
    );
    h.evaluator.stop().await;
}
