//! RideNow: real-time ride dispatch relay.
//!
//! Riders and drivers hold WebSocket sessions against one or more gateway
//! processes. Ride lifecycle events are routed to the right sessions through
//! a [`relay::Dispatcher`], either in-process or across processes over a
//! shared Redis channel, while [`worker::AssignmentWorker`] loops bind
//! queued rides to drivers.

pub mod api;
pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod queue;
pub mod relay;
pub mod rides;
pub mod worker;
pub mod ws;

pub use app::{App, Role, ShutdownTrigger};
pub use config::AppConfig;
