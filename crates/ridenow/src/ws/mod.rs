//! Real-time session layer.
//!
//! ```text
//!   client ──WS──▶ handler (receive loop) ──▶ RideService ──▶ Dispatcher
//!     ▲                                                          │
//!     └──── writer task ◀── session mpsc ◀── SessionRegistry ◀───┘
//! ```
//!
//! Each connection owns exactly one writer task. Everything else, including
//! the relay and the worker, reaches a client only through the session's
//! bounded channel.

mod handler;
mod registry;

pub use handler::{CLOSE_UNAUTHORIZED, ws_handler};
pub use registry::{DeliveryReport, SESSION_BUFFER_SIZE, SessionHandle, SessionRegistry};
