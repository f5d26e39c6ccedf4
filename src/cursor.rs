//! Live result streams parked between CONTINUE requests.
//!
//! A READ whose stream does not fit one batch parks the remainder here
//! under the query token. CONTINUE resumes it, STOP discards it. Streams
//! stay lazy while parked: nothing is pulled until the client asks.

use std::collections::HashMap;

use crate::stream::JsonStream;

/// Documents per stream response batch.
pub const STREAM_BATCH_SIZE: usize = 1000;

#[derive(Default)]
pub struct CursorStore {
    cursors: HashMap<i64, JsonStream>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a stream under its token, replacing any stream already there.
    pub fn park(&mut self, token: i64, stream: JsonStream) {
        if self.cursors.insert(token, stream).is_some() {
            tracing::debug!(token, "replaced a parked stream");
        }
    }

    /// Take the stream for a token, if one is parked.
    pub fn resume(&mut self, token: i64) -> Option<JsonStream> {
        self.cursors.remove(&token)
    }

    pub fn discard(&mut self, token: i64) -> bool {
        let dropped = self.cursors.remove(&token).is_some();
        if dropped {
            tracing::debug!(token, "discarded a parked stream");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_park_resume_discard() {
        let mut store = CursorStore::new();
        assert!(store.is_empty());

        store.park(1, JsonStream::from_vec(vec![json!(1), json!(2)]));
        assert_eq!(store.len(), 1);

        let mut stream = store.resume(1).unwrap();
        assert_eq!(stream.drain().unwrap(), vec![json!(1), json!(2)]);
        assert!(store.resume(1).is_none());

        store.park(2, JsonStream::from_vec(vec![]));
        assert!(store.discard(2));
        assert!(!store.discard(2));
    }
}
