//! Encoder and decoder for framed messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{Request, Response};
use bytes::BytesMut;
use serde::de::DeserializeOwned;

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    pub fn encode_request(request: &Request) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(request)?.encode()
    }

    pub fn encode_response(response: &Response) -> Result<BytesMut, ProtocolError> {
        Frame::from_json(response)?.encode()
    }
}

/// Accumulates bytes from a stream and yields complete messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    pub fn decode_request(&mut self) -> Result<Option<Request>, ProtocolError> {
        self.decode_json()
    }

    pub fn decode_response(&mut self) -> Result<Option<Response>, ProtocolError> {
        self.decode_json()
    }

    fn decode_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => {
                let payload =
                    std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(serde_json::from_str(payload)?))
            }
            None => Ok(None),
        }
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Operation;
    use crate::ErrorCode;
    use crate::ResponseError;
    use serde_json::json;

    #[test]
    fn test_request_through_decoder() {
        let request = Request::new("7", Operation::GetInstance).with_params(json!({
            "external_name": "document",
            "external_id": "42",
            "machine": "approval"
        }));
        let encoded = Encoder::encode_request(&request).unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&encoded[..5]);
        assert!(decoder.decode_request().unwrap().is_none());
        decoder.extend(&encoded[5..]);

        let decoded = decoder.decode_request().unwrap().unwrap();
        assert_eq!(decoded.id, "7");
        assert_eq!(decoded.op, Operation::GetInstance);
        assert_eq!(decoded.params["external_id"], "42");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_response_through_decoder() {
        let failed = Response::fail(
            "9",
            ResponseError::new(ErrorCode::TransitionNotAllowed, "no"),
        );
        let mut decoder = Decoder::new();
        decoder.extend(&Encoder::encode_response(&failed).unwrap());
        decoder.extend(&Encoder::encode_response(&Response::ok("10", json!({}))).unwrap());

        let first = decoder.decode_response().unwrap().unwrap();
        assert!(first.is_fail());
        assert_eq!(
            first.error.unwrap().code,
            ErrorCode::TransitionNotAllowed
        );
        assert!(decoder.decode_response().unwrap().unwrap().is_ok());
    }

    #[test]
    fn test_non_json_payload() {
        let mut decoder = Decoder::new();
        let frame = Frame::new(bytes::Bytes::from_static(b"not json"));
        decoder.extend(&frame.encode().unwrap());

        assert!(matches!(
            decoder.decode_request(),
            Err(ProtocolError::Json(_))
        ));
    }
}
