//! Wire messages exchanged by code fetchers.
//!
//! Every message starts with one type byte. Multi-byte integers are
//! big-endian, and there is no padding.
//!
//! REQUEST:
//! - 1 byte message type (0)
//! - 2 bytes content key
//! - 1 byte bitmap length
//! - the bitmap bytes
//!
//! FRAGMENT:
//! - 1 byte message type (1)
//! - 2 bytes fragment index
//! - 2 bytes content key
//! - [FRAGMENT_SIZE] bytes of payload

use crate::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of a REQUEST header, before the bitmap bytes.
pub const REQUEST_HEADER_LEN: usize = 4;

/// Length of an encoded FRAGMENT message.
pub const FRAGMENT_MSG_LEN: usize = 5 + FRAGMENT_SIZE;

/// The payload of a single fragment.
pub type FragmentBuf = [u8; FRAGMENT_SIZE];

/// Fetcher message type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Ask a node for the fragments set in a bitmap.
    Request = 0,
    /// One fragment of content.
    Fragment = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = FetchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::Fragment),
            _ => Err(FetchError::other(format!(
                "unknown fetcher message type: {value}"
            ))),
        }
    }
}

/// A request for the fragments set in `bitmap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMsg {
    /// The fragments the requester is missing. Carries the content key.
    pub bitmap: Bitmap,
}

/// One fragment of a content object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMsg {
    /// The content key.
    pub key: ContentKey,
    /// Index of the fragment, the byte offset is `index * FRAGMENT_SIZE`.
    pub index: u16,
    /// Fragment bytes. The final fragment of an object is zero-padded.
    pub payload: FragmentBuf,
}

impl FragmentMsg {
    /// Byte offset of this fragment within its content object.
    pub fn offset(&self) -> u32 {
        self.index as u32 * FRAGMENT_SIZE as u32
    }
}

/// A decoded fetcher message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMessage {
    /// See [RequestMsg].
    Request(RequestMsg),
    /// See [FragmentMsg].
    Fragment(FragmentMsg),
}

impl FetchMessage {
    /// The message type tag.
    pub fn message_type(&self) -> MessageType {
        match self {
            FetchMessage::Request(_) => MessageType::Request,
            FetchMessage::Fragment(_) => MessageType::Fragment,
        }
    }

    /// The content key the message refers to.
    pub fn key(&self) -> ContentKey {
        match self {
            FetchMessage::Request(r) => r.bitmap.key(),
            FetchMessage::Fragment(f) => f.key,
        }
    }

    /// Encode this message for transmission.
    pub fn encode(&self) -> Bytes {
        match self {
            FetchMessage::Request(RequestMsg { bitmap }) => {
                let map = bitmap.as_bytes();
                let mut out =
                    BytesMut::with_capacity(REQUEST_HEADER_LEN + map.len());
                out.put_u8(MessageType::Request as u8);
                out.put_u16(*bitmap.key());
                // Bitmap::new and Bitmap::from_wire bound this to u8.
                out.put_u8(map.len() as u8);
                out.put_slice(map);
                out.freeze()
            }
            FetchMessage::Fragment(FragmentMsg {
                key,
                index,
                payload,
            }) => {
                let mut out = BytesMut::with_capacity(FRAGMENT_MSG_LEN);
                out.put_u8(MessageType::Fragment as u8);
                out.put_u16(*index);
                out.put_u16(**key);
                out.put_slice(payload);
                out.freeze()
            }
        }
    }

    /// Decode a received message.
    ///
    /// # Errors
    ///
    /// Returns an error if the type byte is unknown or the data is
    /// shorter (or, for a request, longer) than the encoded form.
    pub fn decode(mut data: &[u8]) -> FetchResult<Self> {
        if data.is_empty() {
            return Err(FetchError::other("empty fetcher message"));
        }
        match MessageType::try_from(data.get_u8())? {
            MessageType::Request => {
                if data.len() < REQUEST_HEADER_LEN - 1 {
                    return Err(FetchError::other(
                        "request shorter than header",
                    ));
                }
                let key = ContentKey(data.get_u16());
                let map_len = data.get_u8() as usize;
                if data.len() != map_len {
                    return Err(FetchError::other(format!(
                        "request bitmap length {map_len} does not match {} remaining bytes",
                        data.len()
                    )));
                }
                let bitmap = Bitmap::from_wire(key, data.to_vec())?;
                Ok(FetchMessage::Request(RequestMsg { bitmap }))
            }
            MessageType::Fragment => {
                if data.len() < FRAGMENT_MSG_LEN - 1 {
                    return Err(FetchError::other("fragment too short"));
                }
                let index = data.get_u16();
                let key = ContentKey(data.get_u16());
                let mut payload = [0; FRAGMENT_SIZE];
                data.copy_to_slice(&mut payload);
                Ok(FetchMessage::Fragment(FragmentMsg {
                    key,
                    index,
                    payload,
                }))
            }
        }
    }
}

impl From<RequestMsg> for FetchMessage {
    fn from(value: RequestMsg) -> Self {
        FetchMessage::Request(value)
    }
}

impl From<FragmentMsg> for FetchMessage {
    fn from(value: FragmentMsg) -> Self {
        FetchMessage::Fragment(value)
    }
}
