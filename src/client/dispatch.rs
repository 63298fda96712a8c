//! Inbound message dispatch
//!
//! Routes a decoded inbound message either to the handler for one of our
//! own in-flight requests (via the [`RequestRegistry`]) or, for
//! server-initiated traffic, to a handler looked up by method name in an
//! explicit registration table. Handler callbacks run on the listener
//! task and must hand off long work themselves.

use crate::client::registry::RequestRegistry;
use crate::rpc::{ErrorObject, Message};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace, warn};

/// Outcome of a handler invocation: an optional value to send back (used
/// only when the inbound message was a request) or an error that becomes
/// a JSON-RPC error response
pub type HandlerResult = Result<Option<Value>, ErrorObject>;

type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

/// What the listen loop should do after a message was dispatched
#[derive(Debug)]
pub enum Dispatched {
    /// A response was correlated to one of our requests; its handler (if
    /// any) has already run
    Response { method: String, response: Message },

    /// A reply that must be written back to the server
    Reply(Message),

    /// Nothing further to do
    Done,
}

/// Handler table plus routing logic.
///
/// Method names are normalized identically at registration and dispatch
/// time, so `$/progress` and `textDocument/hover` match however the wire
/// spells them. Malformed envelopes never reach `dispatch`; decoding
/// rejects them first.
pub struct Dispatcher {
    handlers: Mutex<HashMap<String, Handler>>,
    registry: Arc<RequestRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RequestRegistry>) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Associate a method name with a callback, replacing any previous one
    pub fn register<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.handlers
            .lock()
            .unwrap()
            .insert(normalize(method), Arc::new(handler));
    }

    fn lookup(&self, method: &str) -> Option<Handler> {
        self.handlers.lock().unwrap().get(&normalize(method)).cloned()
    }

    /// Route one inbound message. Never panics and never lets a handler
    /// failure escape; a misbehaving handler must not kill the listen loop.
    pub fn dispatch(&self, message: Message) -> Dispatched {
        match &message {
            Message::Response { id, .. } => {
                let Some(method) = self.registry.resolve(*id) else {
                    debug!(id, "response for unknown or superseded request, dropping");
                    return Dispatched::Done;
                };

                if let Some(handler) = self.lookup(&method) {
                    if let Err(err) = handler(&message) {
                        error!(method, %err, "response handler failed");
                    }
                } else {
                    trace!(method, "no handler registered for response");
                }

                Dispatched::Response {
                    method,
                    response: message,
                }
            }

            Message::Request { id, method, .. } => {
                let Some(handler) = self.lookup(method) else {
                    warn!(method, "server request for unregistered method");
                    return Dispatched::Reply(Message::Response {
                        id: *id,
                        result: None,
                        error: Some(ErrorObject::method_not_found(method)),
                    });
                };

                let reply = match handler(&message) {
                    Ok(result) => Message::Response {
                        id: *id,
                        // a request always gets an answer; null when the
                        // handler had nothing to say
                        result: Some(result.unwrap_or(Value::Null)),
                        error: None,
                    },
                    Err(err) => {
                        error!(method, %err, "request handler failed");
                        Message::Response {
                            id: *id,
                            result: None,
                            error: Some(err),
                        }
                    }
                };
                Dispatched::Reply(reply)
            }

            Message::Notification { method, .. } => {
                match self.lookup(method) {
                    Some(handler) => {
                        if let Err(err) = handler(&message) {
                            error!(method, %err, "notification handler failed");
                        }
                    }
                    // unhandled notifications are not errors
                    None => trace!(method, "unhandled notification"),
                }
                Dispatched::Done
            }
        }
    }
}

/// Fold the wire method syntax (`textDocument/hover`, `$/progress`) into
/// a case- and separator-insensitive lookup key
fn normalize(method: &str) -> String {
    method
        .chars()
        .map(|c| match c {
            '/' | '$' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error_codes;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dispatcher() -> (Dispatcher, Arc<RequestRegistry>) {
        let registry = Arc::new(RequestRegistry::new());
        (Dispatcher::new(Arc::clone(&registry)), registry)
    }

    #[test]
    fn normalization_folds_separators_and_case() {
        assert_eq!(normalize("textDocument/hover"), "textdocument_hover");
        assert_eq!(normalize("$/progress"), "__progress");
        assert_eq!(normalize("TextDocument/Hover"), normalize("textdocument/hover"));
    }

    #[test]
    fn response_reaches_handler_for_resolved_method() {
        let (dispatcher, registry) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dispatcher.register("textDocument/hover", move |message| {
            assert_eq!(message.result(), Some(&json!({"contents": "doc"})));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        registry.add(3, "textDocument/hover");
        let response = Message::response(3, Some(json!({"contents": "doc"})), None).unwrap();
        let outcome = dispatcher.dispatch(response);

        assert!(matches!(outcome, Dispatched::Response { method, .. } if method == "textDocument/hover"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_response_id_is_dropped() {
        let (dispatcher, _registry) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dispatcher.register("textDocument/hover", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let response = Message::response(42, Some(json!({})), None).unwrap();
        assert!(matches!(dispatcher.dispatch(response), Dispatched::Done));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unregistered_request_gets_method_not_found() {
        let (dispatcher, _) = dispatcher();
        let request = Message::request(7, "workspace/applyEdit", json!({}));

        let Dispatched::Reply(reply) = dispatcher.dispatch(request) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.id(), Some(7));
        assert_eq!(reply.error().unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn request_handler_value_becomes_result() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register("workspace/configuration", |_| Ok(Some(json!([{"go": {}}]))));

        let request = Message::request(8, "workspace/configuration", json!({"items": []}));
        let Dispatched::Reply(reply) = dispatcher.dispatch(request) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.result(), Some(&json!([{"go": {}}])));
    }

    #[test]
    fn request_handler_without_value_answers_null() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register("window/workDoneProgress/create", |_| Ok(None));

        let request = Message::request(9, "window/workDoneProgress/create", json!({}));
        let Dispatched::Reply(reply) = dispatcher.dispatch(request) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.result(), Some(&Value::Null));
        assert!(reply.error().is_none());
    }

    #[test]
    fn request_handler_failure_becomes_error_reply() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register("workspace/applyEdit", |_| {
            Err(ErrorObject::internal("edit rejected"))
        });

        let request = Message::request(10, "workspace/applyEdit", json!({}));
        let Dispatched::Reply(reply) = dispatcher.dispatch(request) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.id(), Some(10));
        assert_eq!(reply.error().unwrap().code, error_codes::INTERNAL_ERROR);
    }

    #[test]
    fn notification_reaches_handler() {
        let (dispatcher, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        dispatcher.register("$/progress", move |message| {
            assert_eq!(message.params(), Some(&json!({"token": 1})));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let notification = Message::notification("$/progress", json!({"token": 1}));
        assert!(matches!(dispatcher.dispatch(notification), Dispatched::Done));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unhandled_notification_is_ignored() {
        let (dispatcher, _) = dispatcher();
        let notification = Message::notification("telemetry/event", json!({}));
        assert!(matches!(dispatcher.dispatch(notification), Dispatched::Done));
    }

    #[test]
    fn notification_handler_failure_is_contained() {
        let (dispatcher, _) = dispatcher();
        dispatcher.register("$/progress", |_| Err(ErrorObject::internal("oops")));

        let notification = Message::notification("$/progress", json!({}));
        // no panic, no reply
        assert!(matches!(dispatcher.dispatch(notification), Dispatched::Done));
    }

    #[test]
    fn registration_is_separator_insensitive_against_the_wire() {
        let (dispatcher, _) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        // registered with different casing than the wire form
        dispatcher.register("textdocument/publishdiagnostics", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let notification = Message::notification("textDocument/publishDiagnostics", json!({}));
        dispatcher.dispatch(notification);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
