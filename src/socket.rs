//! thin cancellable wrapper over a stream style SCTP (or TCP) socket
//!
//! blocking calls wake up every poll interval to check their cancel token,
//! so a cancellation is observed within one interval.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::str::FromStr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::cancel::CancelToken;
use crate::errors::{Error, Result};

#[cfg(target_os = "linux")]
const SCTP_INITMSG: libc::c_int = 2;

/// the only client connection queue length we ever use
pub const BACKLOG: i32 = 1;

/// which transport protocol backs the association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// one-to-one style SCTP socket
    #[default]
    Sctp,
    /// plain TCP, for hosts without SCTP support
    Tcp,
}

impl Transport {
    fn protocol(self) -> Protocol {
        match self {
            Transport::Sctp => Protocol::from(libc::IPPROTO_SCTP),
            Transport::Tcp => Protocol::TCP,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Sctp => f.write_str("sctp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sctp" => Ok(Transport::Sctp),
            "tcp" => Ok(Transport::Tcp),
            _ => Err(Error::InvalidProperty(format!("unknown transport `{s}`"))),
        }
    }
}

/// socket level knobs applied before listening
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub transport: Transport,
    /// number of streams we wish to be able to send to
    pub num_ostreams: u16,
    /// max number of inbound streams we are prepared to support
    pub max_instreams: u16,
    /// how often blocking calls check their cancel token
    pub poll_interval: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            transport: Transport::Sctp,
            num_ostreams: 1,
            max_instreams: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(target_os = "linux")]
#[repr(C)]
struct SctpInitMsg {
    sinit_num_ostreams: u16,
    sinit_max_instreams: u16,
    sinit_max_attempts: u16,
    sinit_max_init_timeo: u16,
}

#[cfg(target_os = "linux")]
fn set_init_msg(socket: &Socket, num_ostreams: u16, max_instreams: u16) -> io::Result<()> {
    let msg = SctpInitMsg {
        sinit_num_ostreams: num_ostreams,
        sinit_max_instreams: max_instreams,
        sinit_max_attempts: 0,
        sinit_max_init_timeo: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_SCTP,
            SCTP_INITMSG,
            &msg as *const SctpInitMsg as *const libc::c_void,
            std::mem::size_of::<SctpInitMsg>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_init_msg(_socket: &Socket, num_ostreams: u16, max_instreams: u16) -> io::Result<()> {
    warn!("SCTP_INITMSG not supported here, ostreams={num_ostreams} instreams={max_instreams} ignored");
    Ok(())
}

// a timed out wait of a blocking call, time to check the cancel token
fn is_poll_tick(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// resolve the bind address, ipv4 is preferred when a name maps to both
fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() {
        return Err(Error::InvalidAddress("empty host".to_owned()));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::InvalidAddress(format!("{host}: no address")))
}

/// a bound server socket
#[derive(Debug)]
pub struct Listener {
    socket: Socket,
    port: u16,
    poll_interval: Duration,
}

impl Listener {
    /// bind to `host:port`, port 0 asks for an ephemeral port
    pub fn bind(host: &str, port: u16, opts: &SocketOptions) -> Result<Listener> {
        let addr = resolve(host, port)?;
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(opts.transport.protocol()),
        )?;
        socket.set_reuse_address(true)?;
        if opts.transport == Transport::Sctp {
            set_init_msg(&socket, opts.num_ostreams, opts.max_instreams)?;
        }

        socket
            .bind(&SockAddr::from(addr))
            .map_err(|e| Error::from_bind(e, &addr.to_string()))?;

        let port = socket
            .local_addr()?
            .as_socket()
            .map(|a| a.port())
            .unwrap_or(port);
        info!("{} socket bound to {}:{}", opts.transport, addr.ip(), port);

        Ok(Listener {
            socket,
            port,
            poll_interval: opts.poll_interval,
        })
    }

    /// start listening, exactly one pending client is queued
    pub fn listen(&self, backlog: i32) -> Result<()> {
        self.socket.listen(backlog)?;
        Ok(())
    }

    /// the actual bound port
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// wait for one client, or until `cancel` fires
    ///
    /// the listener stays usable after a cancelled accept
    pub fn accept_cancellable(&self, cancel: &CancelToken) -> Result<Connection> {
        self.socket.set_read_timeout(Some(self.poll_interval))?;
        loop {
            if cancel.is_cancelled() {
                info!("accept cancelled");
                return Err(Error::Cancelled);
            }

            match self.socket.accept() {
                Ok((socket, addr)) => {
                    info!("client connected from {:?}", addr.as_socket());
                    return Connection::new(socket, self.poll_interval);
                }
                Err(ref e) if is_poll_tick(e) => continue,
                Err(e) => {
                    error!("accept failed, err={e}");
                    return Err(e.into());
                }
            }
        }
    }
}

/// an accepted association, reads and writes go through the coroutine runtime
pub struct Connection {
    stream: may::net::TcpStream,
    poll_interval: Duration,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.stream.peer_addr().ok())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Connection {
    fn new(socket: Socket, poll_interval: Duration) -> Result<Connection> {
        // the runtime does its own timeout handling
        socket.set_read_timeout(None)?;
        let stream = unsafe { may::net::TcpStream::from_raw_fd(socket.into_raw_fd()) };
        stream.set_read_timeout(Some(poll_interval))?;
        Ok(Connection {
            stream,
            poll_interval,
        })
    }

    /// another handle to the same association, used as the write half
    pub fn try_clone(&self) -> Result<Connection> {
        let stream = self.stream.try_clone()?;
        stream.set_read_timeout(Some(self.poll_interval))?;
        Ok(Connection {
            stream,
            poll_interval: self.poll_interval,
        })
    }

    /// address of the remote end
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// read at least one byte, return 0 on orderly shutdown of the peer
    pub fn receive_cancellable(&mut self, buf: &mut [u8], cancel: &CancelToken) -> Result<usize> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if is_poll_tick(e) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// write some of `buf`, the caller has to loop
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.stream.write(buf)?)
    }

    /// write the whole of `buf`
    pub fn send_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.send(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => buf = &buf[n..],
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// release the association, calling it again is harmless
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown connection: {e}");
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
