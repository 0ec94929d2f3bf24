pub mod codec;
pub mod event;
pub mod reader;

pub use codec::{decode_payload, encode_done, encode_event, DecodedFrame, FrameDecoder, FrameSplitter};
pub use event::{ChartPayload, StreamEvent};
pub use reader::{consume_stream, event_stream, Completion, ConsumeSummary, EventHandler};
