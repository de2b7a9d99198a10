mod common;

use async_trait::async_trait;
use common::*;
use duet::collaborators::{AbortClient, AbortOutcome, AbortRequest, Collaborators, MemoryStore, SideEffects};
use duet::panel::{CancelOutcome, PanelOutcome, PanelRegistry};
use duet::types::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn answer_stream(text: &str) -> Vec<duet::transport::TransportEvent> {
    let delta = serde_json::json!({
        "event": "on_message_delta",
        "data": {"id": "s1", "delta": {"content": [{"type": "text", "text": text}]}}
    });
    let mut events = frames(&[
        r#"{"message":{"messageId":"m1"}}"#,
        r#"{"event":"on_run_step","data":{"id":"s1","runId":"r1","index":0}}"#,
    ]);
    events.push(frame(&delta.to_string()));
    events.push(frame(r#"{"final":true,"responseMessage":{"messageId":"m1","text":""}}"#));
    events
}

fn response_text(outcome: &PanelOutcome) -> String {
    match outcome.messages().last() {
        Some(m) => m.text.clone(),
        None => panic!("outcome has no messages: {:?}", outcome),
    }
}

fn texts(store: &MemoryStore, panel: PanelId) -> Vec<String> {
    store
        .emissions(panel)
        .into_iter()
        .filter_map(|snapshot| snapshot.last().map(|m| m.text.clone()))
        .collect()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn comparison_panels_with_identical_ids_stay_separate() {
    tokio::time::pause();
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("alpha", vec![Script::Stream(answer_stream("alpha"))]);
    transport.script(
        "beta",
        vec![Script::Fail(http_error(503)), Script::Stream(answer_stream("beta"))],
    );
    let store = Arc::new(MemoryStore::new());
    let registry = registry(transport.clone(), store.clone());

    let (a, b) = registry.submit_comparison(submission("2+2?", "alpha"), submission("2+2?", "beta"));
    let (a_id, b_id) = (a.id(), b.id());
    assert_eq!(a_id.side, Side::Primary);
    assert_eq!(b_id.side, Side::Secondary);

    let (a_out, b_out) = tokio::join!(a.join(), b.join());
    assert_eq!(response_text(&a_out), "alpha");
    assert_eq!(response_text(&b_out), "beta");
    assert_eq!(transport.opens("alpha"), 1);
    assert_eq!(transport.opens("beta"), 2);

    assert!(texts(&store, a_id).iter().all(|t| !t.contains("beta")));
    assert!(texts(&store, b_id).iter().all(|t| !t.contains("alpha")));
    assert!(store
        .statuses(b_id)
        .contains(&PanelStatus::Reconnecting { attempt: 1, max: 3 }));
    assert!(!store
        .statuses(a_id)
        .iter()
        .any(|s| matches!(s, PanelStatus::Reconnecting { .. })));

    let added: Vec<(String, bool)> = transport
        .requests()
        .iter()
        .map(|r| {
            (
                r.body["model"].as_str().unwrap_or_default().to_string(),
                r.body["isAddedRequest"].as_bool().unwrap_or_default(),
            )
        })
        .collect();
    assert!(added.contains(&("alpha".to_string(), false)));
    assert!(added.contains(&("beta".to_string(), true)));
    assert!(added.iter().all(|(model, flag)| (model == "beta") == *flag));
}

#[tokio::test]
async fn failure_on_one_side_leaves_the_other_alone() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script("alpha", vec![Script::Stream(answer_stream("alpha"))]);
    transport.script("beta", vec![Script::Fail(http_error(400))]);
    let store = Arc::new(MemoryStore::new());
    let registry = registry(transport.clone(), store.clone());

    let (a, b) = registry.submit_comparison(submission("hi", "alpha"), submission("hi", "beta"));
    let (a_out, b_out) = tokio::join!(a.join(), b.join());

    assert!(a_out.is_completed());
    assert!(matches!(b_out, PanelOutcome::Failed { .. }));
    assert_eq!(response_text(&a_out), "alpha");
}

#[tokio::test]
async fn superseded_panel_never_writes_again() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        "slow",
        vec![Script::StreamThenHang(frames(&[
            r#"{"message":{"messageId":"m0"}}"#,
            r#"{"event":"on_run_step","data":{"id":"s1","runId":"r1","index":0}}"#,
            r#"{"event":"on_message_delta","data":{"id":"s1","delta":{"content":[{"type":"text","text":"old"}]}}}"#,
        ]))],
    );
    transport.script("fast", vec![Script::Stream(answer_stream("new"))]);
    let store = Arc::new(MemoryStore::new());
    let registry = registry(transport.clone(), store.clone());

    let first = registry.submit(Side::Primary, submission("hi", "slow"));
    let first_id = first.id();
    wait_until(|| texts(&store, first_id).iter().any(|t| t == "old")).await;
    let old_emissions = store.emissions(first_id).len();

    let second = registry.submit(Side::Primary, submission("hi", "fast"));
    let second_id = second.id();
    assert_ne!(first_id, second_id);
    assert!(!registry.assert_panel_active(first_id));

    let first_out = first.join().await;
    let second_out = second.join().await;
    assert!(matches!(first_out, PanelOutcome::Cancelled));
    assert_eq!(response_text(&second_out), "new");

    assert_eq!(store.emissions(first_id).len(), old_emissions);
    assert!(!store.is_submitting(first_id));
    assert_eq!(store.statuses(first_id).last(), Some(&PanelStatus::Cancelled));
    assert!(texts(&store, second_id).iter().all(|t| !t.contains("old")));
    match store.latest_for_side(Side::Primary) {
        Some(messages) => assert_eq!(messages[messages.len() - 1].text, "new"),
        None => panic!("nothing emitted on the primary side"),
    }
    // The finished panel removed itself; the superseded one never did.
    assert_eq!(registry.active_panel(Side::Primary), None);
}

#[derive(Default)]
struct RecordingAborter {
    requests: Mutex<Vec<(String, AbortRequest)>>,
}

#[async_trait]
impl AbortClient for RecordingAborter {
    async fn abort(
        &self,
        url: &str,
        request: &AbortRequest,
        _token: Option<String>,
    ) -> duet::types::Result<AbortOutcome> {
        if let Ok(mut r) = self.requests.lock() {
            r.push((url.to_string(), request.clone()));
        }
        let event: FinalEvent = serde_json::from_str(
            r#"{"final":true,"responseMessage":{"messageId":"m1","text":"partial answer"}}"#,
        )?;
        Ok(AbortOutcome::Final(event))
    }
}

#[tokio::test]
async fn cancel_after_creation_aborts_and_finalizes() {
    let transport = ScriptedTransport::single(vec![Script::StreamThenHang(frames(&[
        r#"{"message":{"messageId":"m1"}}"#,
        r#"{"event":"on_run_step","data":{"id":"s1","runId":"r1","index":0}}"#,
        r#"{"event":"on_message_delta","data":{"id":"s1","delta":{"content":[{"type":"text","text":"partial"}]}}}"#,
    ]))]);
    let store = Arc::new(MemoryStore::new());
    let aborter = Arc::new(RecordingAborter::default());
    let registry = PanelRegistry::new(
        transport.clone(),
        Collaborators::new(store.clone()).with_aborter(aborter.clone()),
        fast_config(),
    );

    let handle = registry.submit(Side::Primary, submission("hi", MODEL));
    let panel = handle.id();
    wait_until(|| texts(&store, panel).iter().any(|t| t == "partial")).await;

    let cancel = registry.cancel(Side::Primary).await;
    assert!(matches!(
        cancel,
        Some(CancelOutcome::Aborted(AbortOutcome::Final(_)))
    ));
    assert!(matches!(handle.join().await, PanelOutcome::Cancelled));

    let requests = match aborter.requests.lock() {
        Ok(r) => r.clone(),
        Err(_) => panic!("abort log poisoned"),
    };
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "http://backend.test/api/ask/abort");
    assert_eq!(requests[0].1.abort_key, "c1");
    assert_eq!(requests[0].1.endpoint, "openAI");

    match store.latest(panel) {
        Some(messages) => assert_eq!(messages[messages.len() - 1].text, "partial answer"),
        None => panic!("abort final was not emitted"),
    }
    assert_eq!(store.statuses(panel).last(), Some(&PanelStatus::Cancelled));
    // A second cancel finds nothing.
    assert!(registry.cancel(Side::Primary).await.is_none());
}

#[tokio::test]
async fn abort_final_keeps_the_server_request_copy() {
    let transport = ScriptedTransport::single(vec![Script::StreamThenHang(frames(&[
        r#"{"message":{"messageId":"u-server","conversationId":"c1","isCreatedByUser":true}}"#,
    ]))]);
    let store = Arc::new(MemoryStore::new());
    let registry = PanelRegistry::new(
        transport.clone(),
        Collaborators::new(store.clone()).with_aborter(Arc::new(RecordingAborter::default())),
        fast_config(),
    );

    let handle = registry.submit(Side::Primary, submission("hi", MODEL));
    let panel = handle.id();
    wait_until(|| !store.emissions(panel).is_empty()).await;

    let cancel = registry.cancel(Side::Primary).await;
    assert!(matches!(cancel, Some(CancelOutcome::Aborted(_))));
    assert!(matches!(handle.join().await, PanelOutcome::Cancelled));

    let messages = match store.latest(panel) {
        Some(m) => m,
        None => panic!("abort final was not emitted"),
    };
    assert_eq!(messages[0].message_id, "u-server");
    assert_eq!(messages[0].text, "hi");
    let response = &messages[messages.len() - 1];
    assert_eq!(response.text, "partial answer");
    assert_eq!(response.text, response.text_from_parts());
}

#[derive(Default)]
struct RecordingSideEffects {
    titles: Mutex<Vec<String>>,
    balance_refreshes: AtomicUsize,
}

#[async_trait]
impl SideEffects for RecordingSideEffects {
    async fn generate_title(&self, conversation_id: &str) {
        if let Ok(mut t) = self.titles.lock() {
            t.push(conversation_id.to_string());
        }
    }

    async fn refresh_balance(&self) {
        self.balance_refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn new_conversation_triggers_title_generation() {
    let transport = ScriptedTransport::single(vec![Script::Stream(frames(&[
        r#"{"message":{"messageId":"u-new","conversationId":"c9","isCreatedByUser":true}}"#,
        r#"{"final":true,"responseMessage":{"messageId":"m1","conversationId":"c9","text":"hello"}}"#,
    ]))]);
    let store = Arc::new(MemoryStore::new());
    let effects = Arc::new(RecordingSideEffects::default());
    let registry = PanelRegistry::new(
        transport.clone(),
        Collaborators::new(store.clone()).with_side_effects(effects.clone()),
        fast_config(),
    );

    let mut fresh = submission("hi", MODEL);
    fresh.conversation_id = Some("new".into());
    let outcome = registry.submit(Side::Primary, fresh).join().await;
    assert!(outcome.is_completed());
    assert_eq!(transport.requests()[0].body["conversationId"], serde_json::Value::Null);

    let titles = match effects.titles.lock() {
        Ok(t) => t.clone(),
        Err(_) => panic!("title log poisoned"),
    };
    assert_eq!(titles, vec!["c9".to_string()]);
    assert_eq!(effects.balance_refreshes.load(Ordering::SeqCst), 1);

    // The created payload was the server's copy of the user message.
    assert_eq!(outcome.messages()[0].message_id, "u-new");
}

#[tokio::test]
async fn existing_conversation_skips_title_generation() {
    let transport = ScriptedTransport::single(vec![Script::Stream(two_plus_two())]);
    let store = Arc::new(MemoryStore::new());
    let effects = Arc::new(RecordingSideEffects::default());
    let registry = PanelRegistry::new(
        transport,
        Collaborators::new(store).with_side_effects(effects.clone()),
        fast_config(),
    );

    let outcome = registry.submit(Side::Primary, submission("2+2?", MODEL)).join().await;
    assert!(outcome.is_completed());
    match effects.titles.lock() {
        Ok(t) => assert!(t.is_empty()),
        Err(_) => panic!("title log poisoned"),
    }
    assert_eq!(effects.balance_refreshes.load(Ordering::SeqCst), 1);
}
