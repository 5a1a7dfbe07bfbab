//! `chiroptera-hal` – sensor driver layer.
//!
//! The rest of the workspace only talks to the traits in [`sensor`], so
//! platform drivers (and the simulated ones in [`sim`]) can be swapped
//! without touching estimation code.

pub mod registry;
pub mod sensor;
pub mod sim;

pub use registry::SensorRegistry;
pub use sensor::{EchoDevice, ImuDevice, RangeSensor};
