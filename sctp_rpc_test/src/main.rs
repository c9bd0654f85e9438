#[macro_use]
extern crate log;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use sctp_rpc_src::{
    BincodeMarshaller, Flow, FrameBuffer, Message, PeerQuery, PushSrc, Query, QueryMarshaller,
    ServerSrc, Settings, DEFAULT_MAX_PAYLOAD,
};

struct RawCaps;

impl PeerQuery for RawCaps {
    fn query(&self, query: &mut Query) -> bool {
        match query {
            Query::Caps { result, .. } => {
                *result = Some("audio/x-raw,rate=48000".to_owned());
                true
            }
            _ => false,
        }
    }
}

fn send(stream: &mut TcpStream, msg: &Message) {
    let frame = msg.encode(DEFAULT_MAX_PAYLOAD).unwrap();
    stream.write_all(&frame).unwrap();
}

fn recv(stream: &mut TcpStream, frames: &mut FrameBuffer) -> Message {
    let mut buf = [0u8; 1024];
    loop {
        if let Some(msg) = frames.next_message().unwrap() {
            return msg;
        }
        let n = stream.read(&mut buf).unwrap();
        assert_ne!(n, 0, "server closed the connection");
        frames.extend(&buf[..n]);
    }
}

// the remote end of the association
fn client(port: u16) {
    let m = BincodeMarshaller;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut frames = FrameBuffer::new(DEFAULT_MAX_PAYLOAD);

    for i in 0..5 {
        let data = format!("Hello World! id={i}");
        send(&mut stream, &Message::Data(Bytes::from(data)));
    }

    let caps = m.marshal(&Query::caps(Some("audio/x-raw"))).unwrap();
    send(
        &mut stream,
        &Message::Query {
            id: 1,
            payload: Bytes::from(caps),
        },
    );

    // the response to our caps query and the server's own query, in any order
    for _ in 0..2 {
        match recv(&mut stream, &mut frames) {
            Message::QueryResponse { id, payload } => {
                println!("caps answer id={id}: {:?}", m.unmarshal(&payload).unwrap());
            }
            Message::Query { id, payload } => {
                let mut query = m.unmarshal(&payload).unwrap();
                println!("server asks id={id}: {query:?}");
                if let Query::Caps { result, .. } = &mut query {
                    *result = Some("video/x-raw,width=640".to_owned());
                }
                let payload = Bytes::from(m.marshal(&query).unwrap());
                send(&mut stream, &Message::QueryResponse { id, payload });
            }
            Message::Data(_) => unreachable!("server never sends data"),
        }
    }

    stream.shutdown(std::net::Shutdown::Both).ok();
}

fn main() {
    env_logger::init();

    let settings: Settings = "bind-address=127.0.0.1 port=0 transport=tcp"
        .parse()
        .unwrap();
    let src = Arc::new(ServerSrc::new(settings));
    src.set_peer(Arc::new(RawCaps));

    let starter = {
        let src = src.clone();
        thread::spawn(move || src.start())
    };
    while src.property("current-port").unwrap() == "0" {
        thread::sleep(Duration::from_millis(10));
    }
    let port: u16 = src.property("current-port").unwrap().parse().unwrap();
    info!("server source listening on port {port}");

    let client = thread::spawn(move || client(port));
    starter.join().unwrap().unwrap();

    // data only moves while someone pulls, so ask from another thread
    let asker = {
        let src = src.clone();
        thread::spawn(move || {
            let mut query = Query::caps(None);
            src.query(&mut query).unwrap();
            println!("peer answered: {query:?}");
        })
    };

    loop {
        match src.create() {
            Flow::Buffer(data) => println!("recv = {:?}", String::from_utf8_lossy(&data)),
            Flow::Eos => break,
            Flow::Flushing => continue,
            Flow::Error(e) => panic!("source failed: {e}"),
        }
    }

    asker.join().unwrap();
    client.join().unwrap();
    src.stop();
}
