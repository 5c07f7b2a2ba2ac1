use std::time::Duration;

use futures::StreamExt;
use plower_rag::{
    config::LlmEndpoints,
    llm::LlmManager,
    locale::Locale,
    models::Document,
    rag::{AnswerEvent, Question, RagPipeline},
    store::{CredentialStore, KvStore},
};
use wiremock::{
    matchers::{body_string_contains, method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

fn pipeline(server: &MockServer, locale: Locale) -> (RagPipeline, CredentialStore) {
    let llm = LlmManager::new(LlmEndpoints {
        gemini_base_url: server.uri(),
        sarasina_proxy_url: format!("{}/api/sarasina", server.uri()),
        ollama_generate_url: format!("{}/api/generate", server.uri()),
        request_timeout: Duration::from_secs(5),
    })
    .unwrap();
    let credentials = CredentialStore::new(KvStore::in_memory());
    (RagPipeline::new(llm, credentials.clone(), locale), credentials)
}

fn question(text: &str, model: &str) -> Question {
    Question {
        text: text.to_string(),
        model_id: model.to_string(),
        api_key: None,
    }
}

fn library() -> Vec<Document> {
    vec![
        Document::new("cats.txt", "The cat sleeps all day. A cat is a pet."),
        Document::new("rust.md", "Rust has ownership and borrowing."),
        Document::new("dogs.txt", "Dogs bark."),
    ]
}

#[tokio::test]
async fn relevant_documents_reach_the_prompt_and_snapshots_stream_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_string_contains("【cats.txt】"))
        .and(body_string_contains("[Question]\\nwhat does the cat do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"response\":\"It \"}\n{\"response\":\"sleeps.\"}\n{\"done\":true}\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let (rag, _) = pipeline(&server, Locale::En);
    let events: Vec<_> = rag
        .answer(question("what does the cat do", "llama3"), library())
        .collect()
        .await;
    assert_eq!(
        events,
        vec![
            AnswerEvent::Snapshot { text: "It ".into() },
            AnswerEvent::Snapshot { text: "It sleeps.".into() },
            AnswerEvent::Done,
        ]
    );
}

#[tokio::test]
async fn unmatched_question_falls_back_to_recent_documents() {
    let server = MockServer::start().await;
    // Los tres documentos, del más reciente al más antiguo.
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_string_contains(
            "【dogs.txt】\\nDogs bark.\\n\\n【rust.md】\\nRust has ownership and borrowing.\\n\\n【cats.txt】",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"response\":\"?\"}\n"))
        .expect(1)
        .mount(&server)
        .await;

    let (rag, _) = pipeline(&server, Locale::En);
    let events: Vec<_> = rag
        .answer(question("zzz qqq", "llama3"), library())
        .collect()
        .await;
    assert_eq!(events.last(), Some(&AnswerEvent::Done));
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn rejected_key_is_evicted_and_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/v1beta/models/.*"))
        .respond_with(ResponseTemplate::new(400).set_body_string("API_KEY_INVALID"))
        .expect(1)
        .mount(&server)
        .await;

    let (rag, credentials) = pipeline(&server, Locale::En);
    credentials.save("guardada").unwrap();

    let events: Vec<_> = rag
        .answer(question("cat", "gemini-flash"), library())
        .collect()
        .await;
    match &events[..] {
        [AnswerEvent::Failed { message, credential_evicted: true }, AnswerEvent::Done] => {
            assert!(message.starts_with("❌ Error occurred: The API key is invalid"));
            assert!(message.contains("Status: 400"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(credentials.get().is_none());
}

#[tokio::test]
async fn explicit_key_overrides_saved_one() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-2.5-pro:generateContent"))
        .and(wiremock::matchers::query_param("key", "nueva"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (rag, credentials) = pipeline(&server, Locale::Ja);
    credentials.save("vieja").unwrap();
    let mut q = question("cat", "gemini-pro");
    q.api_key = Some("nueva".into());

    let events: Vec<_> = rag.answer(q, library()).collect().await;
    assert_eq!(
        events,
        vec![AnswerEvent::Snapshot { text: "ok".into() }, AnswerEvent::Done]
    );
}
