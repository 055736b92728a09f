//! Length-prefixed binary frames for the TCP transport
//!
//! Every frame is a little-endian `u32` body length followed by the body:
//!
//! ```text
//! request:  u8 kind=1 | u16 name_len | name | u32 batch | batch x (u64 id | u32 n | n x f32)
//! response: u8 kind=2 | u8 status    | u32 batch       | batch x (u64 id | u32 n | n x f32)
//! ```
//!
//! An unavailable response carries `n = 0` for every id.

use bytes::{Buf, BufMut, BytesMut};

use crate::protocol::{Payload, RequestFrame, ResponseFrame, ResponseStatus};

/// Upper bound on a single frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const STATUS_OK: u8 = 0;
const STATUS_UNAVAILABLE: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown response status: {0}")]
    UnknownStatus(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
}

pub fn encode_request(frame: &RequestFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
    if frame.ids.len() != frame.inputs.len() {
        return Err(CodecError::Malformed(format!(
            "{} ids for {} inputs",
            frame.ids.len(),
            frame.inputs.len()
        )));
    }
    let name = frame.service.as_bytes();
    let name_len = u16::try_from(name.len())
        .map_err(|_| CodecError::Malformed("service name longer than 65535 bytes".into()))?;

    let start = begin_frame(dst);
    dst.put_u8(KIND_REQUEST);
    dst.put_u16_le(name_len);
    dst.put_slice(name);
    if let Err(e) = put_entries(dst, &frame.ids, |i| frame.inputs.get(i)) {
        dst.truncate(start);
        return Err(e);
    }
    finish_frame(dst, start)
}

pub fn encode_response(frame: &ResponseFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
    let status = match frame.status {
        ResponseStatus::Ok => {
            if frame.ids.len() != frame.outputs.len() {
                return Err(CodecError::Malformed(format!(
                    "{} ids for {} outputs",
                    frame.ids.len(),
                    frame.outputs.len()
                )));
            }
            STATUS_OK
        }
        ResponseStatus::Unavailable => STATUS_UNAVAILABLE,
    };

    let start = begin_frame(dst);
    dst.put_u8(KIND_RESPONSE);
    dst.put_u8(status);
    if let Err(e) = put_entries(dst, &frame.ids, |i| frame.outputs.get(i)) {
        dst.truncate(start);
        return Err(e);
    }
    finish_frame(dst, start)
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until a whole frame is buffered. Consumed bytes are
/// removed from `src`; a partial frame is left untouched.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let mut prefix = &src[..4];
    let len = prefix.get_u32_le() as usize;
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if src.len() < 4 + len {
        src.reserve(4 + len - src.len());
        return Ok(None);
    }

    src.advance(4);
    let mut body = src.split_to(len);
    let frame = decode_body(&mut body)?;
    if body.has_remaining() {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes",
            body.remaining()
        )));
    }
    Ok(Some(frame))
}

fn decode_body(body: &mut BytesMut) -> Result<Frame, CodecError> {
    need(body, 1)?;
    match body.get_u8() {
        KIND_REQUEST => {
            need(body, 2)?;
            let name_len = body.get_u16_le() as usize;
            need(body, name_len)?;
            let name = body.split_to(name_len);
            let service = String::from_utf8(name.to_vec())
                .map_err(|_| CodecError::Malformed("service name is not utf-8".into()))?;
            let (ids, inputs) = get_entries(body)?;
            Ok(Frame::Request(RequestFrame {
                service,
                ids,
                inputs,
            }))
        }
        KIND_RESPONSE => {
            need(body, 1)?;
            let status = match body.get_u8() {
                STATUS_OK => ResponseStatus::Ok,
                STATUS_UNAVAILABLE => ResponseStatus::Unavailable,
                other => return Err(CodecError::UnknownStatus(other)),
            };
            let (ids, outputs) = get_entries(body)?;
            let outputs = match status {
                ResponseStatus::Ok => outputs,
                ResponseStatus::Unavailable => Vec::new(),
            };
            Ok(Frame::Response(ResponseFrame {
                status,
                ids,
                outputs,
            }))
        }
        other => Err(CodecError::UnknownKind(other)),
    }
}

fn begin_frame(dst: &mut BytesMut) -> usize {
    let start = dst.len();
    dst.put_u32_le(0);
    start
}

fn finish_frame(dst: &mut BytesMut, start: usize) -> Result<(), CodecError> {
    let len = dst.len() - start - 4;
    if len > MAX_FRAME_LEN {
        dst.truncate(start);
        return Err(CodecError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    dst[start..start + 4].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(())
}

fn put_entries<'a>(
    dst: &mut BytesMut,
    ids: &[u64],
    values: impl Fn(usize) -> Option<&'a Payload>,
) -> Result<(), CodecError> {
    let batch = u32::try_from(ids.len())
        .map_err(|_| CodecError::Malformed("batch larger than u32::MAX".into()))?;
    dst.put_u32_le(batch);
    for (i, id) in ids.iter().enumerate() {
        dst.put_u64_le(*id);
        match values(i) {
            Some(values) => {
                let n = u32::try_from(values.len())
                    .map_err(|_| CodecError::Malformed("tensor larger than u32::MAX".into()))?;
                dst.put_u32_le(n);
                for v in values {
                    dst.put_f32_le(*v);
                }
            }
            None => dst.put_u32_le(0),
        }
    }
    Ok(())
}

fn get_entries(body: &mut BytesMut) -> Result<(Vec<u64>, Vec<Payload>), CodecError> {
    need(body, 4)?;
    let batch = body.get_u32_le() as usize;
    // Each entry takes at least 12 bytes, which bounds the allocation below.
    need(body, batch.saturating_mul(12))?;
    let mut ids = Vec::with_capacity(batch);
    let mut values = Vec::with_capacity(batch);
    for _ in 0..batch {
        need(body, 12)?;
        ids.push(body.get_u64_le());
        let n = body.get_u32_le() as usize;
        need(body, n.saturating_mul(4))?;
        let mut tensor = Vec::with_capacity(n);
        for _ in 0..n {
            tensor.push(body.get_f32_le());
        }
        values.push(tensor);
    }
    Ok((ids, values))
}

fn need(buf: &BytesMut, n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Malformed(format!(
            "expected {} more bytes, {} left",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_survives_the_wire() {
        let frame = RequestFrame {
            service: "kernel-svm".to_string(),
            ids: vec![41, 42],
            inputs: vec![vec![1.0, -2.5], vec![]],
        };
        let mut buf = BytesMut::new();
        encode_request(&frame, &mut buf).unwrap();

        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Frame::Request(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut full = BytesMut::new();
        encode_response(&ResponseFrame::ok(vec![9], vec![vec![3.0; 16]]), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 5]);
        assert!(decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 5);

        partial.extend_from_slice(&full[full.len() - 5..]);
        let frame = decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, Frame::Response(ResponseFrame::ok(vec![9], vec![vec![3.0; 16]])));
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        encode_response(&ResponseFrame::ok(vec![2], vec![vec![0.5]]), &mut buf).unwrap();
        encode_response(&ResponseFrame::unavailable(vec![1]), &mut buf).unwrap();

        let first = decode(&mut buf).unwrap().unwrap();
        let second = decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Frame::Response(ref r) if r.ids == vec![2]));
        match second {
            Frame::Response(r) => {
                assert_eq!(r.status, ResponseStatus::Unavailable);
                assert!(r.outputs.is_empty());
            }
            other => panic!("expected response, got {:?}", other),
        }
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        buf.put_u8(7);
        assert!(matches!(decode(&mut buf), Err(CodecError::UnknownKind(7))));
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(6);
        buf.put_u8(KIND_RESPONSE);
        buf.put_u8(STATUS_OK);
        buf.put_u32_le(3);
        assert!(matches!(decode(&mut buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_mismatched_request_batch_is_not_encoded() {
        let frame = RequestFrame {
            service: "lgbm".to_string(),
            ids: vec![1, 2],
            inputs: vec![vec![1.0]],
        };
        let mut buf = BytesMut::new();
        assert!(encode_request(&frame, &mut buf).is_err());
    }
}
