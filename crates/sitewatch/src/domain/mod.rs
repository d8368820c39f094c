//! Domain records shared by storage and monitoring
pub mod endpoint;
pub mod project;

pub use endpoint::{Endpoint, EndpointInfo, EndpointStatus, NewEndpoint, ProbeStatus};
pub use project::{ApiKey, KeyType, Project, UnknownKeyType};
