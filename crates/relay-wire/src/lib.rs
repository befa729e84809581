//! # relay-wire
//!
//! The relay wire protocol: a closed set of JSON message kinds tagged by
//! `name`, a structural `{__type__, data}` envelope for non-JSON-native
//! values, and the accumulator that reassembles messages sent as ordered
//! chunk sequences.

#![deny(unsafe_code)]

pub mod envelope;
pub mod error;
pub mod message;
pub mod split;
pub mod upload;

pub use error::WireError;
pub use message::{decode_frame, encode_frame, ErrorBody, ResponseState, WireMessage};
pub use split::{SplitAccumulator, SplitProgress, split_request_frames, split_response_frames};
pub use upload::{UploadFrameHeader, encode_upload_frame, parse_upload_frame};
