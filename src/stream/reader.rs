//! Stream Reader
//!
//! Drives a byte stream through the [`FrameDecoder`] and hands events out,
//! either through callbacks ([`consume_stream`]) or as a lazy stream
//! ([`event_stream`]).

use crate::error::ChatBiError;
use crate::stream::codec::{DecodedFrame, FrameDecoder};
use crate::stream::event::StreamEvent;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the terminal callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Source exhausted or an end-of-stream signal was read.
    Finished,
    /// The cancellation token fired; the reader was dropped.
    Aborted,
    /// The transport failed; `on_error` was called first.
    Failed,
}

/// Callbacks for [`consume_stream`].
pub trait EventHandler: Send {
    fn on_event(&mut self, event: StreamEvent);

    fn on_error(&mut self, _error: &ChatBiError) {}

    /// Called exactly once, whatever the reason the stream stopped.
    fn on_complete(&mut self, _completion: Completion) {}
}

/// Counters returned by [`consume_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub completion: Completion,
    pub events: usize,
    pub skipped: usize,
}

/// Read `source` until it ends, a done signal arrives, the transport fails,
/// or `cancel` fires.
pub async fn consume_stream<S, E, H>(
    mut source: S,
    handler: &mut H,
    cancel: &CancellationToken,
) -> ConsumeSummary
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
    H: EventHandler + ?Sized,
{
    let mut decoder = FrameDecoder::new();
    let mut events = 0usize;

    let completion = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = source.next() => Some(item),
        };

        let exhausted = matches!(next, Some(None));
        let frames = match next {
            None => {
                debug!("Stream consumer cancelled");
                break Completion::Aborted;
            }
            Some(None) => decoder.finish(),
            Some(Some(Ok(chunk))) => decoder.push(&chunk),
            Some(Some(Err(e))) => {
                let error = ChatBiError::Stream(e.to_string());
                warn!("Stream transport error: {}", error);
                handler.on_error(&error);
                break Completion::Failed;
            }
        };

        match dispatch(frames, handler, cancel, &mut events) {
            Dispatch::Continue if exhausted => break Completion::Finished,
            Dispatch::Continue => {}
            Dispatch::Done => break Completion::Finished,
            Dispatch::Cancelled => break Completion::Aborted,
        }
    };

    // Release the reader before signalling completion.
    drop(source);
    handler.on_complete(completion);

    ConsumeSummary {
        completion,
        events,
        skipped: decoder.skipped(),
    }
}

enum Dispatch {
    Continue,
    Done,
    Cancelled,
}

fn dispatch<H: EventHandler + ?Sized>(
    frames: Vec<DecodedFrame>,
    handler: &mut H,
    cancel: &CancellationToken,
    events: &mut usize,
) -> Dispatch {
    for frame in frames {
        if cancel.is_cancelled() {
            return Dispatch::Cancelled;
        }
        match frame {
            DecodedFrame::Done => return Dispatch::Done,
            DecodedFrame::Event(event) => {
                let done = event.is_done();
                handler.on_event(event);
                *events += 1;
                if done {
                    return Dispatch::Done;
                }
            }
        }
    }
    Dispatch::Continue
}

struct LazyState<S> {
    source: Option<S>,
    decoder: FrameDecoder,
    queue: VecDeque<StreamEvent>,
    cancel: CancellationToken,
}

/// Lazy, finite sequence of events. Ends after a done signal, at end of
/// input, after yielding a single transport error, or on cancellation.
pub fn event_stream<S, E>(
    source: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent, ChatBiError>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let state = LazyState {
        source: Some(source),
        decoder: FrameDecoder::new(),
        queue: VecDeque::new(),
        cancel,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                state.source = None;
                state.queue.clear();
                return None;
            }
            if let Some(event) = state.queue.pop_front() {
                if event.is_done() {
                    state.source = None;
                    state.queue.clear();
                }
                return Some((Ok(event), state));
            }
            let source = state.source.as_mut()?;

            let next = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => None,
                item = source.next() => Some(item),
            };
            let Some(next) = next else {
                state.source = None;
                return None;
            };

            let frames = match next {
                Some(Ok(chunk)) => state.decoder.push(&chunk),
                Some(Err(e)) => {
                    state.source = None;
                    return Some((Err(ChatBiError::Stream(e.to_string())), state));
                }
                None => {
                    state.source = None;
                    state.decoder.finish()
                }
            };

            for frame in frames {
                match frame {
                    DecodedFrame::Event(event) => {
                        let done = event.is_done();
                        state.queue.push_back(event);
                        if done {
                            break;
                        }
                    }
                    DecodedFrame::Done => {
                        state.queue.push_back(StreamEvent::Done { outcome: None });
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::codec::{encode_done, encode_event};

    #[derive(Default)]
    struct Recorder {
        events: Vec<StreamEvent>,
        errors: usize,
        completions: Vec<Completion>,
    }

    impl EventHandler for Recorder {
        fn on_event(&mut self, event: StreamEvent) {
            self.events.push(event);
        }

        fn on_error(&mut self, _error: &ChatBiError) {
            self.errors += 1;
        }

        fn on_complete(&mut self, completion: Completion) {
            self.completions.push(completion);
        }
    }

    fn chunks(wire: &str, size: usize) -> Vec<Result<Bytes, std::io::Error>> {
        wire.as_bytes()
            .chunks(size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    fn wire() -> String {
        let mut wire = String::new();
        wire.push_str(&encode_event(&StreamEvent::step("planning")).unwrap());
        wire.push_str(&encode_event(&StreamEvent::content("hello")).unwrap());
        wire.push_str(&encode_done());
        wire.push_str(&encode_event(&StreamEvent::content("after done")).unwrap());
        wire
    }

    #[tokio::test]
    async fn test_consume_stops_at_done_and_completes_once() {
        let mut recorder = Recorder::default();
        let source = stream::iter(chunks(&wire(), 3));
        let summary = consume_stream(source, &mut recorder, &CancellationToken::new()).await;

        assert_eq!(summary.completion, Completion::Finished);
        assert_eq!(recorder.events.len(), 2);
        assert_eq!(recorder.completions, vec![Completion::Finished]);
    }

    #[tokio::test]
    async fn test_consume_cancelled_dispatches_nothing() {
        let mut recorder = Recorder::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let source = stream::iter(chunks(&wire(), 5));
        let summary = consume_stream(source, &mut recorder, &cancel).await;

        assert_eq!(summary.completion, Completion::Aborted);
        assert!(recorder.events.is_empty());
        assert_eq!(recorder.completions, vec![Completion::Aborted]);
    }

    #[tokio::test]
    async fn test_transport_error_reported_once() {
        let mut items = chunks(&encode_event(&StreamEvent::content("a")).unwrap(), 64);
        items.push(Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")));
        items.extend(chunks(&encode_event(&StreamEvent::content("b")).unwrap(), 64));

        let mut recorder = Recorder::default();
        let summary =
            consume_stream(stream::iter(items), &mut recorder, &CancellationToken::new()).await;

        assert_eq!(summary.completion, Completion::Failed);
        assert_eq!(recorder.errors, 1);
        assert_eq!(recorder.events, vec![StreamEvent::content("a")]);
        assert_eq!(recorder.completions.len(), 1);
    }

    #[tokio::test]
    async fn test_lazy_stream_matches_callbacks() {
        let source = stream::iter(chunks(&wire(), 2));
        let events: Vec<StreamEvent> = event_stream(source, CancellationToken::new())
            .filter_map(|r| async move { r.ok() })
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::step("planning"),
                StreamEvent::content("hello"),
                StreamEvent::Done { outcome: None },
            ]
        );
    }
}
