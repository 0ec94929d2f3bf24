mod common;

use bytes::Bytes;
use chatbi_reasoner::agent::ToolOutcome;
use chatbi_reasoner::stream::{consume_stream, encode_done, encode_event, event_stream, Completion, EventHandler, StreamEvent};
use common::*;
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Events of a real turn framed the way the server writes them.
async fn wire_turn() -> (Vec<StreamEvent>, Vec<u8>) {
    let harness = Harness::new(
        ScriptedModel::new()
            .query("SELECT region, SUM(total_amount) FROM orders GROUP BY region")
            .answer("华东 700，华北 500。"),
        ScriptedExecutor::new(vec![rows(
            &["region", "total_revenue"],
            vec![vec![json!("华东"), json!(700)], vec![json!("华北"), json!(500)]],
        )]),
    );
    let (_, events) = harness.ask("各区域总收入").await;

    let mut wire = String::new();
    for event in &events {
        wire.push_str(&encode_event(event).unwrap());
    }
    wire.push_str(&encode_done());
    (events, wire.into_bytes())
}

fn chunked(wire: &[u8], size: usize) -> Vec<Result<Bytes, std::io::Error>> {
    wire.chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))).collect()
}

#[tokio::test]
async fn test_fragmented_wire_yields_identical_events() {
    let (events, wire) = wire_turn().await;
    assert!(events.len() > 5);

    for size in [1, 2, 3, 7, 64, wire.len()] {
        let source = futures_util::stream::iter(chunked(&wire, size));
        let decoded: Vec<StreamEvent> = event_stream(source, CancellationToken::new())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(decoded, events, "chunk size {}", size);
    }
}

#[derive(Default)]
struct Recorder {
    events: Vec<StreamEvent>,
    completions: Vec<Completion>,
}

impl EventHandler for Recorder {
    fn on_event(&mut self, event: StreamEvent) {
        self.events.push(event);
    }

    fn on_complete(&mut self, completion: Completion) {
        self.completions.push(completion);
    }
}

#[tokio::test]
async fn test_callback_consumer_sees_same_events() {
    let (events, wire) = wire_turn().await;
    let mut recorder = Recorder::default();

    let summary = consume_stream(
        futures_util::stream::iter(chunked(&wire, 5)),
        &mut recorder,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.completion, Completion::Finished);
    assert_eq!(summary.skipped, 0);
    assert_eq!(recorder.events, events);
    assert_eq!(recorder.completions, vec![Completion::Finished]);
}

#[tokio::test]
async fn test_failed_turn_wire_has_single_error() {
    let harness = Harness::new(
        ScriptedModel::new().query("SELECT SUM(total_amount) FROM orders"),
        ScriptedExecutor::new(vec![ToolOutcome::from_raw("SYSTEM ERROR: warehouse offline")]),
    );
    let (_, events) = harness.ask("总收入").await;
    let wire: String = events.iter().map(|e| encode_event(e).unwrap()).collect();

    let decoded: Vec<StreamEvent> = event_stream(
        futures_util::stream::iter(chunked(wire.as_bytes(), 4)),
        CancellationToken::new(),
    )
    .map(|e| e.unwrap())
    .collect()
    .await;

    let kinds: Vec<&str> = decoded.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds.iter().filter(|k| **k == "error").count(), 1);
    assert_eq!(kinds.last(), Some(&"done"));
}
