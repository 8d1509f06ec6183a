//! C8 Talk Dispatcher: registration table for user sub-protocols and
//! synchronous invocation of their handlers (spec 4.8).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// `bytes -> bytes`, invoked synchronously within the ingress packet that
/// carried the request. Boxed because different tenants (e.g. Portal) close
/// over their own state.
pub type TalkHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("talk protocol {0:?} already registered")]
pub struct AlreadyRegistered(pub Vec<u8>);

#[derive(Default)]
pub struct TalkDispatcher {
    handlers: HashMap<Vec<u8>, TalkHandler>,
}

impl fmt::Debug for TalkDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TalkDispatcher")
            .field("registered", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TalkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one handler per `protoId`.
    pub fn register(&mut self, proto_id: Vec<u8>, handler: TalkHandler) -> Result<(), AlreadyRegistered> {
        if self.handlers.contains_key(&proto_id) {
            return Err(AlreadyRegistered(proto_id));
        }
        self.handlers.insert(proto_id, handler);
        Ok(())
    }

    pub fn unregister(&mut self, proto_id: &[u8]) {
        self.handlers.remove(proto_id);
    }

    /// Unknown `protoId` or no handler ⇒ empty response (protocol-level OK).
    pub fn dispatch(&self, proto_id: &[u8], payload: &[u8]) -> Vec<u8> {
        match self.handlers.get(proto_id) {
            Some(handler) => handler(payload),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_twice_for_same_id_fails() {
        let mut dispatcher = TalkDispatcher::new();
        dispatcher.register(b"portal".to_vec(), Arc::new(|_| vec![])).unwrap();
        let err = dispatcher
            .register(b"portal".to_vec(), Arc::new(|_| vec![]))
            .unwrap_err();
        assert_eq!(err, AlreadyRegistered(b"portal".to_vec()));
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let mut dispatcher = TalkDispatcher::new();
        dispatcher
            .register(b"echo".to_vec(), Arc::new(|payload| payload.to_vec()))
            .unwrap();
        assert_eq!(dispatcher.dispatch(b"echo", b"hi"), b"hi");
    }

    #[test]
    fn dispatch_on_unknown_id_is_empty() {
        let dispatcher = TalkDispatcher::new();
        assert_eq!(dispatcher.dispatch(b"unknown", b"hi"), Vec::<u8>::new());
    }
}
