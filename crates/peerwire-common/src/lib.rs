//! Wire-level types shared by every peerwire node.
//!
//! This crate provides:
//! - Length-prefixed binary framing with an incremental decoder ([`frame`])
//! - Reserved message codes and disconnect reasons ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod frame;
pub mod types;

pub use frame::{FrameDecoder, FrameError, Message};
pub use types::DisconnectReason;
