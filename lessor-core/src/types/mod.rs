//! Shared identifiers and marketplace projections.

pub mod bid;
pub mod ids;
pub mod order;
pub mod resource;

pub use bid::*;
pub use ids::*;
pub use order::*;
pub use resource::*;
