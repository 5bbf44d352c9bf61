//! Two-party calls negotiated over a room relay.
//!
//! A peer acquires local media, joins a named room on the relay and waits.
//! Whoever hears that someone joined offers (Caller); whoever receives the
//! offer answers (Callee). Candidates trickle through the relay, and once the
//! transport connects a text side channel carries chat between the two.

pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod messaging;
pub mod negotiation;
pub mod peer;
pub mod room;
pub mod session;
pub mod signaling;
pub mod surface;
pub mod utils;

pub use config::CallConfig;
pub use error::{Error, Result};
pub use negotiation::{NegotiationState, Negotiator, Role};
pub use session::{CallController, CallStart, RoomPrompt, UserCommand};
pub use surface::{CallEvent, CallSurface};
