use std::collections::HashMap;

use bytes::Bytes;
use may::sync::Mutex;
use may_waiter::{TokenWaiter, ID};

use crate::errors::Error;

/// what a waiting query finally gets
pub type QueryOutcome = Result<Bytes, Error>;

#[derive(Debug)]
struct Table {
    // last correlation id handed out
    last_id: u32,
    // correlation id -> raw waiter token
    waiters: HashMap<u32, usize>,
}

/// bookkeeping for the outbound queries that wait for a response
///
/// an entry only lives while its waiter is alive. the waiter removes its own
/// entry under the table lock before it is dropped and all responses are set
/// under the same lock, so a token is never used after its waiter is gone.
#[derive(Debug)]
pub struct PendingQueries {
    table: Mutex<Table>,
}

impl Default for PendingQueries {
    fn default() -> Self {
        PendingQueries::new()
    }
}

impl PendingQueries {
    pub fn new() -> Self {
        PendingQueries {
            table: Mutex::new(Table {
                last_id: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    /// register a waiter and allocate a correlation id for it
    ///
    /// ids are never 0 and never shared between live entries
    pub fn register(&self, waiter: &TokenWaiter<QueryOutcome>) -> Result<u32, Error> {
        let token: usize = waiter
            .id()
            .map_err(|_| Error::InvalidState("query waiter has no token".to_owned()))?
            .into();

        let mut table = self.table.lock().unwrap();
        let mut id = table.last_id;
        loop {
            id = id.wrapping_add(1);
            if id != 0 && !table.waiters.contains_key(&id) {
                break;
            }
        }
        table.last_id = id;
        table.waiters.insert(id, token);
        debug!("register query, id={id}");
        Ok(id)
    }

    /// drop the entry of a waiter that is about to go away
    pub fn remove(&self, id: u32) {
        self.table.lock().unwrap().waiters.remove(&id);
    }

    /// hand the outcome to the waiter of `id`
    ///
    /// return false if no query is waiting on `id`
    pub fn resolve(&self, id: u32, outcome: QueryOutcome) -> bool {
        let mut table = self.table.lock().unwrap();
        match table.waiters.remove(&id) {
            Some(token) => {
                let token = unsafe { ID::from_usize(token) };
                TokenWaiter::<QueryOutcome>::set_rsp(token, outcome);
                true
            }
            None => false,
        }
    }

    /// resolve every waiting query with the same error
    pub fn resolve_all(&self, make_err: impl Fn() -> Error) {
        let mut table = self.table.lock().unwrap();
        for (id, token) in table.waiters.drain() {
            debug!("abort pending query, id={id}");
            let token = unsafe { ID::from_usize(token) };
            TokenWaiter::<QueryOutcome>::set_rsp(token, Err(make_err()));
        }
    }

    /// number of queries still waiting
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
