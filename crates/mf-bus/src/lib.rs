// mf-bus: in-process publish/subscribe control plane.
//
// A `MessageBus` routes timestamped payloads from publishers to named
// listeners by topic pattern. Each listener is an actor: a spawned task that
// owns its component, serializes handler execution, and drops stale
// duplicates by `(topic, timestamp)`.

pub mod actor;
pub mod router;

pub use actor::{handler_key, HandlerError, HandlerFuture, HandlerTable, ListenerActor};
pub use router::{Delivery, MessageBus};
