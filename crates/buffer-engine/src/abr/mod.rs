// Adaptive bitrate selection: bandwidth estimation and Representation choice.

mod estimator;
mod manager;

pub use estimator::{Estimator, EwmaEstimator, RequestSample};
pub use manager::{AbrDecision, AbrManager, AbrReason, SharedEstimator};

#[cfg(test)]
pub(crate) use estimator::MockEstimator;
