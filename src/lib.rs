//! sctp_rpc_src is a single-client SCTP server source, based on coroutines.
//!
//! The source listens on an SCTP (or TCP) socket, accepts exactly one client
//! and turns the byte stream into a sequence of messages. DATA messages are
//! handed to whoever pulls buffers from the source, while QUERY messages form
//! a tiny bidirectional RPC: the peer asks, a local `QueryHandler` answers,
//! and the source can ask the peer questions of its own through `send_query`.
//!
//! Every frame on the wire looks like this, integers are big endian:
//!
//! ```text
//! +------+----------------+------------+-----------------+
//! | kind | correlation id |   length   |     payload     |
//! |  u8  |      u32       |    u32     |  `length` bytes |
//! +------+----------------+------------+-----------------+
//! ```
//!
//! Example usage:
//!
//! ```rust,no_run
//! use sctp_rpc_src::{Flow, PushSrc, ServerSrc, Settings};
//!
//! let settings: Settings = "bind-address=127.0.0.1 port=0 transport=tcp".parse().unwrap();
//! let src = ServerSrc::new(settings);
//!
//! // blocks until a client connected
//! src.start().unwrap();
//! loop {
//!     match src.create() {
//!         Flow::Buffer(data) => println!("recv {} bytes", data.len()),
//!         Flow::Eos => break,
//!         Flow::Flushing => continue,
//!         Flow::Error(e) => panic!("{e}"),
//!     }
//! }
//! src.stop();
//! ```

#[macro_use]
extern crate log;

mod cancel;
mod errors;
mod frame;
mod handoff;
mod pending;
mod query;
mod queued_writer;
mod server_src;
mod session;
mod settings;
mod socket;

use bytes::Bytes;

pub use cancel::CancelToken;
pub use errors::{Error, Result};
pub use frame::{FrameBuffer, Kind, Message, DEFAULT_MAX_PAYLOAD, HEADER_LEN};
pub use query::{BincodeMarshaller, Query, QueryMarshaller};
pub use server_src::{Flow, PeerQuery, PushSrc, ServerSrc};
pub use session::{Session, SessionState};
pub use settings::{Settings, DEFAULT_HOST, DEFAULT_PORT, MAX_BUFFER_SIZE, PROPERTIES};
pub use socket::{Connection, Listener, SocketOptions, Transport, BACKLOG};

/// answer the queries the remote peer sends us
///
/// it runs on the receive loop, so a slow answer holds back all incoming traffic
pub trait QueryHandler: Send + Sync + 'static {
    /// turn a query payload into the response payload
    fn answer_query(&self, query: Bytes) -> Bytes;
}

impl<F> QueryHandler for F
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    fn answer_query(&self, query: Bytes) -> Bytes {
        self(query)
    }
}
