//! API request handlers

mod clients;
mod health;
mod resources;

pub use clients::*;
pub use health::*;
pub use resources::*;
