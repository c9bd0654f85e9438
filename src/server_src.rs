use std::sync::Arc;

use bytes::Bytes;
use may::sync::Mutex;

use crate::errors::{Error, Result};
use crate::query::{BincodeMarshaller, Query, QueryMarshaller};
use crate::session::{Session, SessionState};
use crate::settings::Settings;

/// outcome of one `create` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// the next payload, exactly as the peer sent it
    Buffer(Bytes),
    /// the peer closed the stream
    Eos,
    /// the call was unlocked, try again after `unlock_stop`
    Flushing,
    /// fatal, the source has to be stopped
    Error(String),
}

/// what a scheduler drives a push source with
pub trait PushSrc {
    /// open the socket and wait for the client
    fn start(&self) -> Result<()>;
    /// release everything, wake up all blocked calls
    fn stop(&self);
    /// wake up all blocked calls, keep the connection
    fn unlock(&self);
    /// undo `unlock`
    fn unlock_stop(&self);
    /// produce the next buffer
    fn create(&self) -> Flow;
}

/// the local downstream element caps queries of the peer are forwarded to
pub trait PeerQuery: Send + Sync + 'static {
    /// answer the query in place, return false if it couldn't be answered
    fn query(&self, query: &mut Query) -> bool;
}

type PeerSlot = Arc<Mutex<Option<Arc<dyn PeerQuery>>>>;

// the handler of incoming queries, runs on the receive loop
fn answer_remote_query(
    marshaller: &dyn QueryMarshaller,
    peer: &PeerSlot,
    payload: Bytes,
) -> Bytes {
    let mut query = match marshaller.unmarshal(&payload) {
        Ok(query) => query,
        Err(e) => {
            warn!("can't decode remote query: {e}");
            return payload;
        }
    };

    if !matches!(query, Query::Caps { .. }) {
        warn!("unsupported remote query `{}`", query.name());
        return payload;
    }

    let peer = peer.lock().unwrap().clone();
    let answered = match peer {
        Some(peer) => peer.query(&mut query),
        None => {
            debug!("no downstream peer for the caps query");
            false
        }
    };
    if !answered {
        return payload;
    }

    match marshaller.marshal(&query) {
        Ok(data) => Bytes::from(data),
        Err(e) => {
            error!("can't encode caps answer: {e}");
            payload
        }
    }
}

/// server source: a `Session` driven through the `PushSrc` interface
pub struct ServerSrc {
    settings: Mutex<Settings>,
    session: Session,
    marshaller: Arc<dyn QueryMarshaller>,
    peer: PeerSlot,
}

impl ServerSrc {
    /// create a source that marshals queries with bincode
    pub fn new(settings: Settings) -> Self {
        ServerSrc::with_marshaller(settings, Arc::new(BincodeMarshaller))
    }

    pub fn with_marshaller(settings: Settings, marshaller: Arc<dyn QueryMarshaller>) -> Self {
        let peer: PeerSlot = Arc::new(Mutex::new(None));
        let session = Session::new();
        {
            let marshaller = marshaller.clone();
            let peer = peer.clone();
            session.set_query_handler(Arc::new(move |payload: Bytes| {
                answer_remote_query(&*marshaller, &peer, payload)
            }));
        }

        ServerSrc {
            settings: Mutex::new(settings),
            session,
            marshaller,
            peer,
        }
    }

    /// set the element remote caps queries are forwarded to
    pub fn set_peer(&self, peer: Arc<dyn PeerQuery>) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    /// a snapshot of the current settings
    pub fn settings(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    fn check_mutable(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Idle | SessionState::Closed => Ok(()),
            s => Err(Error::InvalidState(format!(
                "settings can't change in {s:?} state"
            ))),
        }
    }

    /// replace all settings, only while not running
    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        let mut current = self.settings.lock().unwrap();
        self.check_mutable()?;
        *current = settings;
        Ok(())
    }

    /// set one property by name, only while not running
    pub fn set_property(&self, name: &str, value: &str) -> Result<()> {
        let mut settings = self.settings.lock().unwrap();
        if name != "current-port" {
            self.check_mutable()?;
        }
        settings.set_property(name, value)
    }

    /// read one property by name, `current-port` is the live bound port
    pub fn property(&self, name: &str) -> Result<String> {
        if name == "current-port" {
            return Ok(self.session.bound_port().to_string());
        }
        self.settings.lock().unwrap().property(name)
    }

    /// the underlying session
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// ask the remote peer, the answer replaces `query`
    pub fn query(&self, query: &mut Query) -> Result<()> {
        let data = self.marshaller.marshal(query)?;
        info!("send `{}` query to the peer", query.name());
        let rsp = self.session.send_query(Bytes::from(data))?;
        *query = self.marshaller.unmarshal(&rsp)?;
        Ok(())
    }
}

impl PushSrc for ServerSrc {
    fn start(&self) -> Result<()> {
        // settings are frozen once the session left Idle
        let settings = {
            let settings = self.settings.lock().unwrap();
            self.session.enter_listening(&settings)?;
            settings.clone()
        };
        self.session.listen_and_accept(&settings)
    }

    fn stop(&self) {
        self.session.stop();
    }

    fn unlock(&self) {
        self.session.unlock();
    }

    fn unlock_stop(&self) {
        self.session.unlock_stop();
    }

    fn create(&self) -> Flow {
        let max_len = self.settings.lock().unwrap().buffer_size();
        match self.session.get_buffer(max_len) {
            Ok(Some(data)) => Flow::Buffer(data),
            Ok(None) => Flow::Eos,
            Err(e) if e.is_cancelled() => Flow::Flushing,
            Err(e) => {
                error!("create failed: {e}");
                Flow::Error(e.to_string())
            }
        }
    }
}
