use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// a control query exchanged with the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    /// capability negotiation, `result` is filled in by whoever answers
    Caps {
        filter: Option<String>,
        result: Option<String>,
    },
    /// any other query, carried through but never answered here
    Custom { name: String, data: Vec<u8> },
}

impl Query {
    /// a fresh, unanswered caps query
    pub fn caps(filter: Option<&str>) -> Self {
        Query::Caps {
            filter: filter.map(str::to_owned),
            result: None,
        }
    }

    /// short name used in logs
    pub fn name(&self) -> &str {
        match self {
            Query::Caps { .. } => "caps",
            Query::Custom { name, .. } => name,
        }
    }

    /// true once the query carries an answer
    pub fn is_answered(&self) -> bool {
        match self {
            Query::Caps { result, .. } => result.is_some(),
            Query::Custom { .. } => false,
        }
    }
}

/// turn queries into opaque rpc payloads and back
pub trait QueryMarshaller: Send + Sync + 'static {
    /// serialize the query
    fn marshal(&self, query: &Query) -> Result<Vec<u8>>;
    /// deserialize a query
    fn unmarshal(&self, data: &[u8]) -> Result<Query>;
}

/// default marshaller based on bincode
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeMarshaller;

impl QueryMarshaller for BincodeMarshaller {
    fn marshal(&self, query: &Query) -> Result<Vec<u8>> {
        bincode::serialize(query).map_err(|e| Error::Marshal(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Query> {
        bincode::deserialize(data).map_err(|e| Error::Marshal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_query_survives_marshalling() {
        let m = BincodeMarshaller;
        let mut q = Query::caps(Some("video/x-raw"));
        assert!(!q.is_answered());
        if let Query::Caps { result, .. } = &mut q {
            *result = Some("video/x-raw,width=640".to_owned());
        }
        let back = m.unmarshal(&m.marshal(&q).unwrap()).unwrap();
        assert_eq!(back, q);
        assert!(back.is_answered());
        assert_eq!(back.name(), "caps");
    }

    #[test]
    fn garbage_is_a_marshal_error() {
        let m = BincodeMarshaller;
        assert!(matches!(m.unmarshal(&[0xff; 3]), Err(Error::Marshal(_))));
    }
}
