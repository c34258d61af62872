//! Rides: persistence contract, SQLite store and the ride state machine.

mod models;
mod service;
mod store;

pub use models::{CreateRideRequest, NewUser, Ride, RideUpdate, User};
pub use service::{Actor, RideCreated, RideError, RideService};
pub use store::{RideRepository, RideStore};
