pub mod flow;
pub mod label;
pub mod secrets;

pub use flow::{decide, FlowDecision, FlowDestination};
pub use label::{ContentLabel, DataClass, TrustLevel};
pub use secrets::{Confidence, Finding, RedactOptions, SecretDetector};
