use bytes::Bytes;
use may::sync::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::errors::{Error, Result};

#[derive(Debug)]
enum End {
    // peer closed the connection, sticky
    Eos,
    // the connection failed, reported once then turns into Eos
    Failed(Error),
    // the session was stopped
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    data: Option<Bytes>,
    end: Option<End>,
}

/// single slot hand over of data payloads from the receive loop to the consumer
///
/// the producer can't get more than one payload ahead of the consumer
pub struct Handoff {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Handoff {
    pub fn new() -> Self {
        Handoff {
            slot: Mutex::new(Slot::default()),
            cond: Condvar::new(),
        }
    }

    /// put one payload, blocks while the previous one is not consumed
    ///
    /// return false if the handoff is already terminated
    pub fn put(&self, data: Bytes) -> bool {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if slot.end.is_some() {
                return false;
            }
            if slot.data.is_none() {
                slot.data = Some(data);
                self.cond.notify_all();
                return true;
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }

    /// take the next payload, `None` means end of stream
    ///
    /// payloads longer than `max_len` are handed out in pieces. a caller that
    /// was already waiting when the handoff got closed sees `Cancelled`, later
    /// callers see `SessionClosed`
    pub fn get(&self, max_len: usize, cancel: &CancelToken) -> Result<Option<Bytes>> {
        if max_len == 0 {
            return Err(Error::InvalidState("can't get a buffer of 0 bytes".to_owned()));
        }

        let mut waited = false;
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(End::Closed) = slot.end {
                return Err(if waited {
                    Error::Cancelled
                } else {
                    Error::SessionClosed
                });
            }

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(mut data) = slot.data.take() {
                if data.len() > max_len {
                    let head = data.split_to(max_len);
                    slot.data = Some(data);
                    return Ok(Some(head));
                }
                self.cond.notify_all();
                return Ok(Some(data));
            }

            match slot.end.take() {
                Some(End::Failed(err)) => {
                    slot.end = Some(End::Eos);
                    return Err(err);
                }
                Some(End::Eos) => {
                    slot.end = Some(End::Eos);
                    return Ok(None);
                }
                end => slot.end = end,
            }

            slot = self.cond.wait(slot).unwrap();
            waited = true;
        }
    }

    /// mark the end of the stream, an error is reported once before eos
    pub fn finish(&self, err: Option<Error>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.end.is_none() {
            slot.end = Some(match err {
                Some(err) => End::Failed(err),
                None => End::Eos,
            });
        }
        self.cond.notify_all();
    }

    /// wake up all waiters so that they can check their cancel token
    pub fn wake(&self) {
        let _slot = self.slot.lock().unwrap();
        self.cond.notify_all();
    }

    /// terminate the handoff for good, pending data is dropped
    pub fn close(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.data = None;
        slot.end = Some(End::Closed);
        self.cond.notify_all();
    }

    /// make the handoff usable again for a new connection
    pub fn reset(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.data = None;
        slot.end = None;
        self.cond.notify_all();
    }
}
