//! Length-prefixed binary frame codec for buffered events.
//!
//! Each frame consists of:
//!
//! ```text
//! +------------------------+---------------------------------------+
//! | Length (4 bytes, BE)   | Body                                  |
//! +------------------------+---------------------------------------+
//! ```
//!
//! with a fixed-layout body:
//!
//! ```text
//! ts_ns (8) | type (2) | thread_id (4) | process_id (4)
//! | container_len (2) | params_len (4) | container | params
//! ```
//!
//! The frame length is validated against [`MAX_EVENT_FRAME`] before any
//! allocation occurs, on both the encode and decode paths.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Event, EventType};

/// Length of the frame length prefix.
pub(crate) const PREFIX_LEN: usize = 4;

/// Fixed portion of the frame body, before the two variable fields.
const FIXED_LEN: usize = 8 + 2 + 4 + 4 + 2 + 4;

/// Maximum encoded frame size, including the length prefix.
pub const MAX_EVENT_FRAME: usize = 64 * 1024;

/// Errors produced by the event frame codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame larger than the protocol cap.
    #[error("event frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Offending frame size.
        size: usize,
        /// The cap that was exceeded.
        max: usize,
    },

    /// Body shorter than its declared length.
    #[error("truncated event frame: need {need} bytes, have {have}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// Unknown event type tag.
    #[error("unknown event type tag {0}")]
    UnknownType(u16),
}

/// Encoded length of `event`, including the length prefix.
#[must_use]
pub fn encoded_len(event: &Event) -> usize {
    let container_len = event.container_id.as_ref().map_or(0, String::len);
    PREFIX_LEN + FIXED_LEN + container_len + event.params.len()
}

/// Encodes `event` into `dst` as one length-prefixed frame.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] if the encoded frame would
/// exceed [`MAX_EVENT_FRAME`].
pub fn encode_frame(event: &Event, dst: &mut BytesMut) -> Result<(), CodecError> {
    let total = encoded_len(event);
    if total > MAX_EVENT_FRAME {
        return Err(CodecError::FrameTooLarge {
            size: total,
            max: MAX_EVENT_FRAME,
        });
    }

    let container = event.container_id.as_deref().unwrap_or("");

    dst.reserve(total);
    dst.put_u32(u32::try_from(total - PREFIX_LEN).expect("frame bounded by MAX_EVENT_FRAME"));
    dst.put_u64(event.ts_ns);
    dst.put_u16(event.event_type.tag());
    dst.put_u32(event.thread_id);
    dst.put_u32(event.process_id);
    dst.put_u16(u16::try_from(container.len()).expect("container id bounded by frame cap"));
    dst.put_u32(u32::try_from(event.params.len()).expect("params bounded by frame cap"));
    dst.put_slice(container.as_bytes());
    dst.put_slice(&event.params);
    Ok(())
}

/// Decodes one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame; the
/// buffer is left untouched in that case.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] for a length prefix above the
/// cap (validated before allocation), [`CodecError::Truncated`] for a
/// body that ends early, and [`CodecError::UnknownType`] for a tag
/// outside the closed set.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Event>, CodecError> {
    if src.len() < PREFIX_LEN {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if PREFIX_LEN + body_len > MAX_EVENT_FRAME {
        return Err(CodecError::FrameTooLarge {
            size: PREFIX_LEN + body_len,
            max: MAX_EVENT_FRAME,
        });
    }
    if body_len < FIXED_LEN {
        return Err(CodecError::Truncated {
            need: FIXED_LEN,
            have: body_len,
        });
    }
    if src.len() < PREFIX_LEN + body_len {
        return Ok(None);
    }

    src.advance(PREFIX_LEN);
    let mut body = src.split_to(body_len);

    let ts_ns = body.get_u64();
    let tag = body.get_u16();
    let thread_id = body.get_u32();
    let process_id = body.get_u32();
    let container_len = body.get_u16() as usize;
    let params_len = body.get_u32() as usize;

    let event_type = EventType::from_tag(tag).ok_or(CodecError::UnknownType(tag))?;

    if body.len() != container_len + params_len {
        return Err(CodecError::Truncated {
            need: container_len + params_len,
            have: body.len(),
        });
    }

    let container = body.split_to(container_len);
    let container_id = if container.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&container).into_owned())
    };

    Ok(Some(Event {
        ts_ns,
        event_type,
        thread_id,
        process_id,
        container_id,
        params: Bytes::from(body.to_vec()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(container: Option<&str>) -> Event {
        Event {
            ts_ns: 123_456_789,
            event_type: EventType::Exec,
            thread_id: 41,
            process_id: 40,
            container_id: container.map(str::to_string),
            params: Bytes::from_static(b"/usr/bin/id"),
        }
    }

    #[test]
    fn test_round_trip() {
        for container in [None, Some("abcdef012345")] {
            let event = sample(container);
            let mut buf = BytesMut::new();
            encode_frame(&event, &mut buf).unwrap();
            assert_eq!(buf.len(), encoded_len(&event));

            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, event);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let event = sample(None);
        let mut buf = BytesMut::new();
        encode_frame(&event, &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        let before = partial.len();
        assert!(decode_frame(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let event = Event {
            params: Bytes::from(vec![0u8; MAX_EVENT_FRAME]),
            ..sample(None)
        };
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_frame(&event, &mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let event = sample(None);
        let mut buf = BytesMut::new();
        encode_frame(&event, &mut buf).unwrap();
        // Corrupt the type tag (offset 4 prefix + 8 ts).
        buf[12] = 0xff;
        buf[13] = 0xff;
        assert!(matches!(
            decode_frame(&mut buf),
            Err(CodecError::UnknownType(_))
        ));
    }
}
