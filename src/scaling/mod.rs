//! Fleet sizing: the predictive scaler and the graceful drain sequence.

pub mod drain;
pub mod scaler;

pub use drain::{drain_server, DrainOutcome};
pub use scaler::FleetScaler;
