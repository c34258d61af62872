//! Wire types for RideNow real-time dispatch.
//!
//! Every process that touches ride notifications speaks these types:
//!
//! ```text
//! Client <--[WS: ClientAction / ServerEvent]--> Gateway
//!                                                  |
//!                                          publish DispatchEvent
//!                                                  v
//! Worker ----[DispatchEvent]----> shared channel ----> Relay ----> Session Registry
//! ```
//!
//! ## Design Principles
//!
//! 1. **Ride status is the source of truth.** Events are notifications only and are
//!    never persisted.
//! 2. **Routing lives on the event.** A `DispatchEvent` carries its own `Target`, so
//!    any process can deliver it without consulting the producer.
//! 3. **Lenient inbound, strict outbound.** Clients may send `event` or `action` and
//!    may nest parameters under `payload` or not; the server always replies with
//!    `{"event": .., "payload": {..}}`.

pub mod commands;
pub mod events;
pub mod ids;
pub mod ride;

pub use commands::{ClientAction, ParseError};
pub use events::{DispatchEvent, ErrorCode, EventKind, ServerEvent, Target};
pub use ids::{RideId, UserId};
pub use ride::RideStatus;
