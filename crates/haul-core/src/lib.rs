pub mod errors;
pub mod events;
pub mod ids;
pub mod models;

pub use errors::RelayError;
pub use events::{Audience, Delivery, Frame, Rejection, ServerEvent};
pub use ids::ConnectionId;
