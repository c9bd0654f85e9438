use std::fmt;

use crate::errors::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::{Buf, Bytes, BytesMut};

// Frame layout
// kind(u8) + id(u32) + len(u32) + payload([u8; len])
//
// kind: 0 = data, 1 = query, 2 = query response
// id: correlation id of a query/response pair, always 0 for data

/// size of the fixed frame head
pub const HEADER_LEN: usize = 9;

/// default max payload length, one buffer of the source
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 16;

/// what a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// payload for the buffer consumer
    Data = 0,
    /// a request the other side must answer
    Query = 1,
    /// the answer to a previous query
    QueryResponse = 2,
}

impl Kind {
    fn from_u8(ty: u8) -> Option<Self> {
        match ty {
            0 => Some(Kind::Data),
            1 => Some(Kind::Query),
            2 => Some(Kind::QueryResponse),
            _ => None,
        }
    }
}

/// one logical unit exchanged over the connection
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// data payload, never correlated
    Data(Bytes),
    /// control request
    Query {
        /// correlation id
        id: u32,
        /// marshalled query
        payload: Bytes,
    },
    /// control response, `id` is the id of the query it answers
    QueryResponse {
        /// correlation id
        id: u32,
        /// marshalled answer
        payload: Bytes,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind())
            .field("id", &self.correlation_id())
            .field("len", &self.payload().len())
            .finish()
    }
}

#[derive(Debug)]
struct Header {
    kind: Kind,
    id: u32,
    len: usize,
}

/// parse the frame head, `None` if not enough bytes yet
fn parse_header(mut src: &[u8], max_payload: usize) -> Result<Option<Header>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let ty = src.read_u8()?;
    let id = src.read_u32::<BigEndian>()?;
    let len = src.read_u32::<BigEndian>()? as usize;

    if len > max_payload {
        error!("decode too big frame length. len={len}, max={max_payload}");
        return Err(Error::FrameTooLarge {
            len,
            max: max_payload,
        });
    }

    let kind = Kind::from_u8(ty)
        .ok_or_else(|| Error::ProtocolViolation(format!("invalid frame kind. ty={ty}")))?;
    if kind == Kind::Data && id != 0 {
        return Err(Error::ProtocolViolation(format!(
            "data frame carries correlation id {id}"
        )));
    }

    Ok(Some(Header { kind, id, len }))
}

impl Message {
    fn from_parts(kind: Kind, id: u32, payload: Bytes) -> Self {
        match kind {
            Kind::Data => Message::Data(payload),
            Kind::Query => Message::Query { id, payload },
            Kind::QueryResponse => Message::QueryResponse { id, payload },
        }
    }

    /// the frame kind of this message
    pub fn kind(&self) -> Kind {
        match self {
            Message::Data(_) => Kind::Data,
            Message::Query { .. } => Kind::Query,
            Message::QueryResponse { .. } => Kind::QueryResponse,
        }
    }

    /// correlation id, `None` for data
    pub fn correlation_id(&self) -> Option<u32> {
        match self {
            Message::Data(_) => None,
            Message::Query { id, .. } | Message::QueryResponse { id, .. } => Some(*id),
        }
    }

    /// the raw payload
    pub fn payload(&self) -> &Bytes {
        match self {
            Message::Data(payload)
            | Message::Query { payload, .. }
            | Message::QueryResponse { payload, .. } => payload,
        }
    }

    /// encode the message into a frame that can be sent as is
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>> {
        let payload = self.payload();
        if payload.len() > max_payload {
            return Err(Error::FrameTooLarge {
                len: payload.len(),
                max: max_payload,
            });
        }

        let id = self.correlation_id().unwrap_or(0);
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.write_u8(self.kind() as u8)?;
        buf.write_u32::<BigEndian>(id)?;
        buf.write_u32::<BigEndian>(payload.len() as u32)?;
        buf.extend_from_slice(payload);
        debug!("encode kind={:?} id={} len={}", self.kind(), id, payload.len());

        Ok(buf)
    }

    /// decode one message from the head of `src`
    ///
    /// returns the message and the number of bytes it used,
    /// or `None` if `src` doesn't hold a complete frame yet
    pub fn decode(src: &[u8], max_payload: usize) -> Result<Option<(Message, usize)>> {
        let header = match parse_header(src, max_payload)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total = HEADER_LEN + header.len;
        if src.len() < total {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&src[HEADER_LEN..total]);
        Ok(Some((
            Message::from_parts(header.kind, header.id, payload),
            total,
        )))
    }
}

/// residual receive buffer
///
/// bytes from successive reads are appended here and complete
/// messages are split off the front without copying the payload
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameBuffer {
    /// create an empty buffer for frames of at most `max_payload` bytes payload
    pub fn new(max_payload: usize) -> Self {
        FrameBuffer {
            buf: BytesMut::with_capacity(HEADER_LEN + max_payload),
            max_payload,
        }
    }

    /// append freshly received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// number of buffered bytes not yet consumed by a message
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// true if no residual bytes are held
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// split the next complete message off the buffer
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let header = match parse_header(&self.buf, self.max_payload)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total = HEADER_LEN + header.len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        let mut frame = self.buf.split_to(total).freeze();
        frame.advance(HEADER_LEN);
        debug!("decode kind={:?} id={} len={}", header.kind, header.id, header.len);
        Ok(Some(Message::from_parts(header.kind, header.id, frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let msg = Message::Data(Bytes::from_static(b"hello"));
        let buf = msg.encode(DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 5);
        assert_eq!(&buf[..HEADER_LEN], &[0, 0, 0, 0, 0, 0, 0, 0, 5]);

        let (decoded, used) = Message::decode(&buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn query_header_layout() {
        let msg = Message::Query {
            id: 0x0102_0304,
            payload: Bytes::from_static(b"ping"),
        };
        let buf = msg.encode(DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(&buf[..HEADER_LEN], &[1, 1, 2, 3, 4, 0, 0, 0, 4]);
        assert_eq!(&buf[HEADER_LEN..], b"ping");
    }

    #[test]
    fn partial_frame_needs_more_data() {
        let buf = Message::Data(Bytes::from_static(b"partial"))
            .encode(DEFAULT_MAX_PAYLOAD)
            .unwrap();
        for cut in 0..buf.len() {
            assert!(Message::decode(&buf[..cut], DEFAULT_MAX_PAYLOAD)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn empty_payload_is_a_message() {
        let buf = Message::QueryResponse {
            id: 3,
            payload: Bytes::new(),
        }
        .encode(16)
        .unwrap();
        let (msg, used) = Message::decode(&buf, 16).unwrap().unwrap();
        assert_eq!(used, HEADER_LEN);
        assert_eq!(msg.correlation_id(), Some(3));
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn too_large_payload_is_rejected_both_ways() {
        let big = Message::Data(Bytes::from(vec![7u8; 17]));
        match big.encode(16) {
            Err(Error::FrameTooLarge { len: 17, max: 16 }) => {}
            other => panic!("unexpected {other:?}"),
        }

        let buf = big.encode(32).unwrap();
        assert!(matches!(
            Message::decode(&buf, 16),
            Err(Error::FrameTooLarge { .. })
        ));

        // a failed encode doesn't disturb the next one
        let ok = Message::Data(Bytes::from_static(b"ok")).encode(16).unwrap();
        let (msg, _) = Message::decode(&ok, 16).unwrap().unwrap();
        assert_eq!(msg.payload().as_ref(), b"ok");
    }

    #[test]
    fn unknown_kind_is_a_violation() {
        let mut buf = Message::Data(Bytes::from_static(b"x"))
            .encode(DEFAULT_MAX_PAYLOAD)
            .unwrap();
        buf[0] = 9;
        assert!(matches!(
            Message::decode(&buf, DEFAULT_MAX_PAYLOAD),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn correlated_data_is_a_violation() {
        let mut buf = Message::Data(Bytes::from_static(b"x"))
            .encode(DEFAULT_MAX_PAYLOAD)
            .unwrap();
        buf[4] = 1;
        assert!(matches!(
            Message::decode(&buf, DEFAULT_MAX_PAYLOAD),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[test]
    fn frame_buffer_reassembles_split_reads() {
        let mut wire = Vec::new();
        wire.extend(
            Message::Data(Bytes::from_static(b"first"))
                .encode(DEFAULT_MAX_PAYLOAD)
                .unwrap(),
        );
        wire.extend(
            Message::Query {
                id: 42,
                payload: Bytes::from_static(b"caps?"),
            }
            .encode(DEFAULT_MAX_PAYLOAD)
            .unwrap(),
        );
        wire.extend(
            Message::Data(Bytes::from_static(b"second"))
                .encode(DEFAULT_MAX_PAYLOAD)
                .unwrap(),
        );

        let mut fb = FrameBuffer::new(DEFAULT_MAX_PAYLOAD);
        let mut got = Vec::new();
        for chunk in wire.chunks(4) {
            fb.extend(chunk);
            while let Some(msg) = fb.next_message().unwrap() {
                got.push(msg);
            }
        }

        assert!(fb.is_empty());
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], Message::Data(Bytes::from_static(b"first")));
        assert_eq!(got[1].correlation_id(), Some(42));
        assert_eq!(got[1].payload().as_ref(), b"caps?");
        assert_eq!(got[2].payload().as_ref(), b"second");
    }

    #[test]
    fn frame_buffer_payload_boundaries() {
        const MAX: usize = 64;
        let mut fb = FrameBuffer::new(MAX);

        let empty = Message::Data(Bytes::new());
        let full = Message::Query {
            id: 9,
            payload: Bytes::from(vec![0xabu8; MAX]),
        };
        fb.extend(&empty.encode(MAX).unwrap());
        fb.extend(&full.encode(MAX).unwrap());
        assert_eq!(fb.next_message().unwrap(), Some(empty));
        assert_eq!(fb.next_message().unwrap(), Some(full));

        // one byte over the limit is refused, the next frame still lines up
        let over = Message::Data(Bytes::from(vec![1u8; MAX + 1]));
        assert!(matches!(
            over.encode(MAX),
            Err(Error::FrameTooLarge { len, max: MAX }) if len == MAX + 1
        ));
        let after = Message::QueryResponse {
            id: 9,
            payload: Bytes::from_static(b"after"),
        };
        fb.extend(&after.encode(MAX).unwrap());
        assert_eq!(fb.next_message().unwrap(), Some(after));
        assert_eq!(fb.next_message().unwrap(), None);
        assert!(fb.is_empty());
    }
}
