//! Protocol module - wire layouts and constants of the terminal services.

pub mod codec;
pub mod constants;
pub mod route;

pub use codec::*;
pub use constants::*;
pub use route::{CommPath, RouteError, RouteSegment};
