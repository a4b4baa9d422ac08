//! micro-ROS agent BlueOS extension
//!
//! HTTP control API over the agent supervisor. The `uros-extension` binary wires
//! it to a [`ProcessSupervisor`](uros_supervisor::ProcessSupervisor).

pub mod api;
pub mod error;

pub use api::{app, router};
pub use error::ApiError;
