//! Newline-delimited JSON framing for the RPC transport.
//!
//! One frame per line. The codec is generic over the inbound and outbound
//! types so the same implementation frames `Request`s on the server side
//! and `Response`s on the client side.
//!
//! A frame longer than [`MAX_FRAME_LENGTH`] is a protocol error and fatal
//! for the connection: unlike a chat stream there is no recoverable
//! position after an overflow, and session teardown is the failure policy
//! anyway.

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame length in bytes, newline excluded.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Codec error: an oversized or malformed frame, or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({MAX_FRAME_LENGTH} bytes)")]
    FrameTooLong,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames `\n`-terminated JSON: decodes `In`, encodes `Out`.
#[derive(Debug)]
pub struct JsonLines<In, Out> {
    _marker: PhantomData<fn() -> (In, Out)>,
}

impl<In, Out> Default for JsonLines<In, Out> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In: DeserializeOwned, Out> Decoder for JsonLines<In, Out> {
    type Item = In;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, CodecError> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) if pos > MAX_FRAME_LENGTH => Err(CodecError::FrameTooLong),
            Some(pos) => {
                let line = src.split_to(pos);
                src.advance(1); // the newline
                Ok(Some(serde_json::from_slice(&line)?))
            }
            None if src.len() > MAX_FRAME_LENGTH => Err(CodecError::FrameTooLong),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for JsonLines<In, Out> {
    type Error = CodecError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Request, Response};

    type ServerSide = JsonLines<Request, Response>;

    #[test]
    fn decode_complete_frame() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::from(&br#"{"op":"ping"}
"#[..]);
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, Request::Ping);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_then_complete() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::from(&br#"{"op":"ge"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"t_id\"}\n");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req, Request::GetId);
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::from(
            &b"{\"op\":\"ping\"}\n{\"op\":\"receive_token\"}\n"[..],
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Request::Ping));
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Request::ReceiveToken)
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_garbage_is_an_error() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_LENGTH + 10].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLong)
        ));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = ServerSide::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Response::Bool { value: true }, &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"result\":\"bool\",\"value\":true}\n");
    }

    #[test]
    fn round_trip_through_both_directions() {
        let mut server = ServerSide::default();
        let mut client = JsonLines::<Response, Request>::default();

        let mut wire = BytesMut::new();
        client
            .encode(
                Request::ProposeMatch {
                    proposer_id: "10.0.0.7:5001".into(),
                },
                &mut wire,
            )
            .unwrap();
        let req = server.decode(&mut wire).unwrap().unwrap();
        assert_eq!(
            req,
            Request::ProposeMatch {
                proposer_id: "10.0.0.7:5001".into()
            }
        );

        let mut wire = BytesMut::new();
        server
            .encode(Response::Bool { value: false }, &mut wire)
            .unwrap();
        let resp = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(resp, Response::Bool { value: false });
    }
}
