//! parley-wire: event-stream framing and streaming reply sessions
//!
//! This crate turns a chunked `data:`-framed response body into reply events
//! and owns the outbound request to the reply-generation service.

pub mod error;
pub mod frame;
pub mod session;

pub use error::{Error, Result};
pub use frame::{FrameDecoder, decode_stream, encode_frame};
pub use session::{
    ContextMessage, HttpReplyService, ReplyEvent, ReplyEventStream, ReplyRequest, ReplyService,
    SessionConfig,
};
