//! Relay-side I/O for relaybot.
//!
//! Sources are pure I/O: they turn watcher output into `InboundEvent`s.
//! Relays resolve conversations and deliver replies.

mod bluebubbles;
mod traits;
mod types;
mod watch;

pub use bluebubbles::{BlueBubblesRelay, fallback_conversation_id};
pub use traits::{ChatRelay, EventSource};
pub use types::{ConversationId, InboundEvent, MessageId, SenderId};
pub use watch::{WatchSource, parse_watch_line};
