//! Wire protocol: frame types and their binary encoding.
//!
//! - **Frame**: request/response types exchanged between peers
//! - **Codec**: length-prefixed binary encoding and async stream framing

pub mod codec;
pub mod frame;

pub use codec::{
    body_len, decode, decode_body, encode, read_frame, write_frame, LENGTH_PREFIX_SIZE,
};
pub use frame::{Frame, RequestFrame, ResponseBody, ResponseFrame, REQUEST_TAG, RESPONSE_TAG};
