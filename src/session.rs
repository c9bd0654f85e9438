use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use may::sync::Mutex;
use may::{coroutine, go};
use may_waiter::TokenWaiter;

use crate::cancel::CancelToken;
use crate::errors::{Error, Result};
use crate::frame::{FrameBuffer, Message, DEFAULT_MAX_PAYLOAD, HEADER_LEN};
use crate::handoff::Handoff;
use crate::pending::{PendingQueries, QueryOutcome};
use crate::queued_writer::QueuedWriter;
use crate::settings::Settings;
use crate::socket::{Connection, Listener, BACKLOG};
use crate::QueryHandler;

/// lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// constructed, nothing bound
    Idle,
    /// bound and waiting for the single client
    Listening,
    /// a client is connected and the receive loop runs
    Connected,
    /// the connection is gone or being torn down
    Closing,
    /// all sockets released, can be started again
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct RunConfig {
    max_payload: usize,
    query_timeout: Option<Duration>,
}

struct Peer {
    // handle used to shut the association down
    conn: Connection,
    // write half shared by the receive loop and query callers
    writer: Arc<QueuedWriter<Connection>>,
}

struct Inner {
    state: Mutex<SessionState>,
    config: Mutex<RunConfig>,
    bound_port: AtomicU16,
    listener: Mutex<Option<Listener>>,
    peer: Mutex<Option<Peer>>,
    handoff: Handoff,
    pending: PendingQueries,
    handler: Mutex<Option<Arc<dyn QueryHandler>>>,
    // torn down by `stop`, observed by the receive loop
    shutdown: CancelToken,
    // child of `shutdown`, flipped by `unlock`/`unlock_stop`
    cancel: CancelToken,
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    // move from `from` to `to`, leave any other state alone
    fn transit(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == from {
            debug!("session state {from:?} -> {to:?}");
            *state = to;
            true
        } else {
            false
        }
    }

    fn config(&self) -> RunConfig {
        *self.config.lock().unwrap()
    }

    // why a blocking call has to give up, if it has to
    fn interrupted(&self) -> Option<Error> {
        if self.shutdown.is_cancelled() {
            Some(Error::SessionClosed)
        } else if self.cancel.is_cancelled() {
            Some(Error::Cancelled)
        } else {
            None
        }
    }

    fn release_listener(&self) {
        if self.listener.lock().unwrap().take().is_some() {
            debug!("listener released");
        }
        self.bound_port.store(0, Ordering::Release);
    }

    fn release_peer(&self) {
        if let Some(peer) = self.peer.lock().unwrap().take() {
            peer.conn.close();
            debug!("peer connection released");
        }
    }

    // the receive loop is over, for whatever reason
    fn connection_lost(&self, err: Option<Error>) {
        self.handoff.finish(err);
        self.pending.resolve_all(|| Error::SessionClosed);
        self.release_peer();
        self.transit(SessionState::Connected, SessionState::Closing);
    }

    fn answer_query(&self, id: u32, payload: Bytes) -> Bytes {
        let handler = self.handler.lock().unwrap().clone();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("no query handler, return query id={id} unanswered");
                return payload;
            }
        };

        let query = payload.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| handler.answer_query(query))) {
            Ok(answer) => answer,
            Err(_) => {
                error!("query handler panicked, return query id={id} unanswered");
                payload
            }
        }
    }
}

/// write a frame from a coroutine context, the socket belongs to the runtime
fn write_frame(writer: &Arc<QueuedWriter<Connection>>, frame: Vec<u8>) -> Result<()> {
    if coroutine::is_coroutine() {
        return Ok(writer.write(frame)?);
    }

    let writer = writer.clone();
    match go!(move || writer.write(frame)).join() {
        Ok(ret) => Ok(ret?),
        Err(_) => Err(Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "writer coroutine panicked",
        ))),
    }
}

// demultiplex every complete message in the buffer
//
// return false once the data handoff refuses more payloads
fn dispatch(
    inner: &Inner,
    frames: &mut FrameBuffer,
    writer: &Arc<QueuedWriter<Connection>>,
    max_payload: usize,
) -> Result<bool> {
    while let Some(msg) = frames.next_message()? {
        match msg {
            Message::Data(data) => {
                debug!("receive data, len={}", data.len());
                if !inner.handoff.put(data) {
                    return Ok(false);
                }
            }
            Message::Query { id, payload } => {
                info!("receive query, id={id}");
                let answer = inner.answer_query(id, payload);
                let rsp = Message::QueryResponse {
                    id,
                    payload: answer,
                };
                match rsp.encode(max_payload) {
                    Ok(frame) => {
                        writer.write(frame)?;
                        info!("send query response, id={id}");
                    }
                    // our own answer is at fault, the connection is fine
                    Err(e) => error!("can't send query response id={id}: {e}"),
                }
            }
            Message::QueryResponse { id, payload } => {
                info!("receive query response, id={id}");
                if !inner.pending.resolve(id, Ok(payload)) {
                    warn!("discard unmatched query response, id={id}");
                }
            }
        }
    }
    Ok(true)
}

fn receive_loop(inner: Arc<Inner>, mut conn: Connection, writer: Arc<QueuedWriter<Connection>>) {
    let max_payload = inner.config().max_payload;
    let mut frames = FrameBuffer::new(max_payload);
    let mut buf = vec![0u8; HEADER_LEN + max_payload];

    let err = loop {
        let n = match conn.receive_cancellable(&mut buf, &inner.shutdown) {
            Ok(0) => {
                info!("connection closed by peer");
                if !frames.is_empty() {
                    break Some(Error::ProtocolViolation(format!(
                        "connection closed inside a frame, {} bytes left",
                        frames.len()
                    )));
                }
                break None;
            }
            Ok(n) => n,
            Err(Error::Cancelled) => {
                info!("receive loop cancelled");
                break None;
            }
            Err(e) => {
                error!("receive failed, err={e}");
                break Some(e);
            }
        };

        frames.extend(&buf[..n]);
        match dispatch(&inner, &mut frames, &writer, max_payload) {
            Ok(true) => {}
            Ok(false) => break None,
            Err(e) => {
                error!("connection dropped, err={e}");
                break Some(e);
            }
        }
    };

    inner.connection_lost(err);
    info!("receive loop exit");
}

/// the server side of one single-client association
///
/// DATA messages flow to `get_buffer`, QUERY messages are answered by the
/// registered `QueryHandler` and `send_query` asks the peer a question of
/// its own. all blocking calls are released by `unlock` and `stop`.
pub struct Session {
    inner: Arc<Inner>,
    receiver: Mutex<Option<coroutine::JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("bound_port", &self.bound_port())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Session {
    /// create an idle session
    pub fn new() -> Self {
        let shutdown = CancelToken::new();
        let cancel = shutdown.child();
        let handoff = Handoff::new();
        // nothing to read before the first start
        handoff.close();

        let inner = Inner {
            state: Mutex::new(SessionState::Idle),
            config: Mutex::new(RunConfig {
                max_payload: DEFAULT_MAX_PAYLOAD,
                query_timeout: None,
            }),
            bound_port: AtomicU16::new(0),
            listener: Mutex::new(None),
            peer: Mutex::new(None),
            handoff,
            pending: PendingQueries::new(),
            handler: Mutex::new(None),
            shutdown,
            cancel,
        };

        Session {
            inner: Arc::new(inner),
            receiver: Mutex::new(None),
        }
    }

    /// create an idle session that answers remote queries with `handler`
    pub fn with_handler(handler: Arc<dyn QueryHandler>) -> Self {
        let session = Session::new();
        session.set_query_handler(handler);
        session
    }

    /// replace the handler of incoming queries, set it before `start`
    pub fn set_query_handler(&self, handler: Arc<dyn QueryHandler>) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }

    /// current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// the port actually bound, 0 if not bound
    pub fn bound_port(&self) -> u16 {
        self.inner.bound_port.load(Ordering::Acquire)
    }

    /// bind, listen and wait for exactly one client
    ///
    /// blocks until a client connected, the accept was cancelled by
    /// `unlock`/`stop`, or binding failed. a closed session is restarted.
    pub fn start(&self, settings: &Settings) -> Result<()> {
        self.enter_listening(settings)?;
        self.listen_and_accept(settings)
    }

    // take over the run configuration and leave Idle/Closed
    pub(crate) fn enter_listening(&self, settings: &Settings) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        match *state {
            SessionState::Idle => {}
            SessionState::Closed => {
                debug!("session state Closed -> Idle");
                *state = SessionState::Idle;
            }
            s => {
                return Err(Error::InvalidState(format!(
                    "can't start a session in {s:?} state"
                )))
            }
        }

        inner.shutdown.reset();
        inner.handoff.reset();
        *inner.config.lock().unwrap() = RunConfig {
            max_payload: settings.buffer_size(),
            query_timeout: settings.query_timeout(),
        };
        debug!("session state Idle -> Listening");
        *state = SessionState::Listening;
        Ok(())
    }

    // bind and wait for the client, the session is already Listening
    pub(crate) fn listen_and_accept(&self, settings: &Settings) -> Result<()> {
        let inner = &self.inner;
        let bound = Listener::bind(settings.host(), settings.port(), &settings.socket_options())
            .and_then(|listener| {
                listener.listen(BACKLOG)?;
                Ok(listener)
            });
        let listener = match bound {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to listen on {}:{}, err={e}", settings.host(), settings.port());
                inner.handoff.close();
                inner.transit(SessionState::Listening, SessionState::Closed);
                return Err(e);
            }
        };
        inner.bound_port.store(listener.local_port(), Ordering::Release);

        // keep the listener locked while accepting, `stop` waits on it
        let accepted = {
            let mut slot = inner.listener.lock().unwrap();
            let listener = slot.insert(listener);
            listener.accept_cancellable(&inner.cancel)
        };

        let ret = accepted.and_then(|conn| self.connect(conn));
        if let Err(ref e) = ret {
            info!("session start aborted, err={e}");
            inner.release_listener();
            inner.handoff.close();
            inner.transit(SessionState::Listening, SessionState::Closed);
        }
        ret
    }

    // hand the accepted connection to a fresh receive loop
    fn connect(&self, conn: Connection) -> Result<()> {
        let inner = &self.inner;
        let closer = conn.try_clone()?;
        let writer = Arc::new(QueuedWriter::new(conn.try_clone()?));

        let mut state = inner.state.lock().unwrap();
        if *state != SessionState::Listening {
            // stopped while we were accepting
            closer.close();
            return Err(Error::Cancelled);
        }

        *inner.peer.lock().unwrap() = Some(Peer {
            conn: closer,
            writer: writer.clone(),
        });

        let loop_inner = inner.clone();
        let spawned = go!(
            coroutine::Builder::new()
                .name("SessionReceiver".to_owned())
                .stack_size(0x10000),
            move || receive_loop(loop_inner, conn, writer)
        );
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                drop(state);
                inner.release_peer();
                return Err(e.into());
            }
        };
        *self.receiver.lock().unwrap() = Some(handle);

        debug!("session state Listening -> Connected");
        *state = SessionState::Connected;
        Ok(())
    }

    /// tear the session down, any state ends up Closed
    ///
    /// pending queries resolve with `SessionClosed`, the receive loop is joined
    /// and both sockets are released
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().unwrap();
            match *state {
                SessionState::Idle | SessionState::Closed => return,
                s => {
                    debug!("session state {s:?} -> Closing");
                    *state = SessionState::Closing;
                }
            }
        }

        info!("stopping session");
        inner.shutdown.cancel();
        inner.handoff.close();
        if !inner.pending.is_empty() {
            info!("abort {} pending queries", inner.pending.len());
        }
        inner.pending.resolve_all(|| Error::SessionClosed);
        inner.release_peer();

        let receiver = self.receiver.lock().unwrap().take();
        if let Some(handle) = receiver {
            if handle.join().is_err() {
                error!("receive loop panicked");
            }
        }

        inner.release_listener();
        // anything registered while we were tearing down
        inner.pending.resolve_all(|| Error::SessionClosed);

        debug!("session state Closing -> Closed");
        *inner.state.lock().unwrap() = SessionState::Closed;
    }

    /// interrupt blocked `get_buffer`, `send_query` and accept calls
    ///
    /// the connection itself stays up
    pub fn unlock(&self) {
        debug!("unlock");
        self.inner.cancel.cancel();
        self.inner.handoff.wake();
        self.inner.pending.resolve_all(|| Error::Cancelled);
    }

    /// let blocking calls block again after an `unlock`
    pub fn unlock_stop(&self) {
        debug!("unlock_stop");
        self.inner.cancel.reset();
    }

    /// wait for the next data payload, `None` means the peer closed the stream
    ///
    /// a payload longer than `max_len` is returned over several calls
    pub fn get_buffer(&self, max_len: usize) -> Result<Option<Bytes>> {
        let ret = self.inner.handoff.get(max_len, &self.inner.cancel);
        match ret {
            Ok(Some(ref data)) => debug!("got buffer, len={}", data.len()),
            Ok(None) => debug!("end of stream"),
            Err(ref e) => debug!("get buffer failed, err={e}"),
        }
        ret
    }

    /// send a query to the peer and wait for its response
    pub fn send_query(&self, payload: Bytes) -> Result<Bytes> {
        let inner = &self.inner;
        if let Some(e) = inner.interrupted() {
            return Err(e);
        }

        let writer = match inner.peer.lock().unwrap().as_ref() {
            Some(peer) => peer.writer.clone(),
            None => return Err(Error::SessionClosed),
        };
        let config = inner.config();

        let waiter: TokenWaiter<QueryOutcome> = TokenWaiter::new();
        let id = inner.pending.register(&waiter)?;

        let ret = (|| {
            // an unlock or stop that raced the registration
            if let Some(e) = inner.interrupted() {
                return Err(e);
            }

            let frame = Message::Query { id, payload }.encode(config.max_payload)?;
            write_frame(&writer, frame)?;
            info!("send query, id={id}");

            match waiter.wait_rsp(config.query_timeout) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("query id={id} not answered, err={e}");
                    Err(Error::Timeout)
                }
            }
        })();

        // the entry must be gone before the waiter is dropped
        inner.pending.remove(id);
        ret
    }
}
