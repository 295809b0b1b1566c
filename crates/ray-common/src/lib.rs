//! Common types for the Ray operator: CRDs, errors, events, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager and event reporter name for operator writes
pub const FIELD_MANAGER: &str = "ray-operator";

/// Default namespace for operator-owned resources (leader lease)
pub const RAY_SYSTEM_NAMESPACE: &str = "ray-system";

/// Label key selecting head pods; value is the head object name
pub const HEAD_LABEL_KEY: &str = "ray-head";

/// Label key selecting worker pods; value is the worker object name
pub const WORKER_LABEL_KEY: &str = "ray-worker";

/// Label key linking owned objects back to their Ray cluster; value is the cluster name
pub const PARENT_LABEL_KEY: &str = "ray";

/// Name of the head container inside the head pod template
pub const HEAD_CONTAINER_NAME: &str = "ray-head";

/// Environment variable carrying the pod IP into every Ray container
pub const NODE_IP_ENV: &str = "RAY_NODE_IP";

/// Environment variable carrying the head service name into worker containers
pub const HEAD_SERVICE_ENV: &str = "RAY_HEAD_SERVICE";
