//! Queue message framing and handler routing
//!
//! Every enqueued message travels inside an envelope that names its
//! handler. The handler id is the JSON form of the owning base key plus
//! an optional topic, so a collection's listeners only ever see their own
//! messages. Envelopes that do not conform are foreign traffic on the
//! shared queue and are silently dropped.
//!
//! The registry maps handler ids to handler lists and owns the once-only
//! dispatcher activation: the first listener anywhere installs a single
//! dispatcher on the KV queue, later listeners just join the map.

use kvdex_core::{KvKey, KvValue, KvdexResult};
use kvdex_kv::Backend;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Envelope field: true when the user data was `Undefined`.
pub const IS_UNDEFINED_FIELD: &str = "__is_undefined__";
/// Envelope field: the user data.
pub const DATA_FIELD: &str = "__data__";
/// Envelope field: routing id.
pub const HANDLER_ID_FIELD: &str = "__handler_id__";

/// A handler registered for one handler id.
pub type RawHandler = Arc<dyn Fn(KvValue) -> KvdexResult<()> + Send + Sync>;

/// Routing id for a base key and optional topic.
pub fn handler_id(base: &KvKey, topic: Option<&str>) -> String {
    // key serialization cannot fail
    let mut id = serde_json::to_string(base).expect("key serialization");
    if let Some(topic) = topic {
        id.push_str(topic);
    }
    id
}

/// Wrap user data for the wire.
pub fn wrap(data: KvValue, handler_id: String) -> KvValue {
    let mut map = BTreeMap::new();
    map.insert(
        IS_UNDEFINED_FIELD.to_string(),
        KvValue::Bool(data.is_undefined()),
    );
    map.insert(DATA_FIELD.to_string(), data);
    map.insert(HANDLER_ID_FIELD.to_string(), KvValue::String(handler_id));
    KvValue::Object(map)
}

/// A parsed inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// The user data.
    pub data: KvValue,
    /// Routing id.
    pub handler_id: String,
}

/// Parse an inbound message. Returns `None` for foreign traffic.
pub fn parse(value: &KvValue) -> Option<ParsedMessage> {
    let map = value.as_object()?;
    let handler_id = match map.get(HANDLER_ID_FIELD)? {
        KvValue::String(s) => s.clone(),
        _ => return None,
    };
    let is_undefined = match map.get(IS_UNDEFINED_FIELD)? {
        KvValue::Bool(b) => *b,
        _ => return None,
    };
    let data = if is_undefined {
        KvValue::Undefined
    } else {
        map.get(DATA_FIELD)?.clone()
    };
    Some(ParsedMessage { data, handler_id })
}

/// Handler-id → handler list map plus the idempotent dispatcher
/// activator. One registry per database facade.
#[derive(Default)]
pub struct QueueRegistry {
    handlers: dashmap::DashMap<String, Vec<RawHandler>>,
    activated: OnceCell<()>,
}

impl QueueRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        QueueRegistry::default()
    }

    /// Add a handler under a handler id. Handlers listen indefinitely.
    pub fn register(&self, handler_id: String, handler: RawHandler) {
        self.handlers.entry(handler_id).or_default().push(handler);
    }

    /// Install the single dispatcher on the KV queue. The first call
    /// anywhere wins; later calls are no-ops.
    pub fn activate(registry: &Arc<Self>, backend: &Arc<dyn Backend>) -> KvdexResult<()> {
        let dispatch_registry = Arc::clone(registry);
        let backend = Arc::clone(backend);
        registry
            .activated
            .get_or_try_init(move || {
                backend.listen_queue(Arc::new(move |value| {
                    dispatch_registry.dispatch(&value)
                }))
            })
            .map(|_| ())
    }

    /// Route one inbound message to every handler under its id.
    fn dispatch(&self, value: &KvValue) -> KvdexResult<()> {
        let Some(message) = parse(value) else {
            trace!("dropping foreign queue message");
            return Ok(());
        };
        let handlers: Vec<RawHandler> = match self.handlers.get(&message.handler_id) {
            Some(list) => list.value().clone(),
            None => return Ok(()),
        };
        for handler in handlers {
            handler(message.data.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvdex_core::kv_key;

    #[test]
    fn test_handler_id_includes_topic() {
        let base = kv_key!["__kvdex__", "users"];
        let plain = handler_id(&base, None);
        let topical = handler_id(&base, Some("t1"));
        assert!(topical.starts_with(&plain));
        assert!(topical.ends_with("t1"));
    }

    #[test]
    fn test_wrap_parse_round_trip() {
        let envelope = wrap(KvValue::Int(5), "h".to_string());
        let parsed = parse(&envelope).unwrap();
        assert_eq!(parsed.data, KvValue::Int(5));
        assert_eq!(parsed.handler_id, "h");
    }

    #[test]
    fn test_wrap_preserves_undefined() {
        let envelope = wrap(KvValue::Undefined, "h".to_string());
        let parsed = parse(&envelope).unwrap();
        assert!(parsed.data.is_undefined());
    }

    #[test]
    fn test_parse_drops_foreign_messages() {
        assert!(parse(&KvValue::Int(1)).is_none());
        assert!(parse(&KvValue::Object(Default::default())).is_none());
        // wrong field type
        let mut map = BTreeMap::new();
        map.insert(HANDLER_ID_FIELD.to_string(), KvValue::Int(1));
        map.insert(IS_UNDEFINED_FIELD.to_string(), KvValue::Bool(false));
        map.insert(DATA_FIELD.to_string(), KvValue::Null);
        assert!(parse(&KvValue::Object(map)).is_none());
    }
}
