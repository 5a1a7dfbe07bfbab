//! `chiroptera-perception` – estimation and geometry.
//!
//! Turns raw inertial samples and range readings into a device pose, a
//! single fused distance per direction and, over a sweep, a room model.
//!
//! # Modules
//!
//! - [`orientation`] – [`OrientationFilter`][orientation::OrientationFilter]:
//!   quaternion EKF with gyroscope bias, corrected by gravity and magnetic
//!   heading.
//! - [`position`] – [`PositionFilter`][position::PositionFilter]:
//!   gravity-compensated dead reckoning with optional hints.
//! - [`fusion`] – [`MultiSensorDistanceFuser`][fusion::MultiSensorDistanceFuser]:
//!   confidence × prior weighted fusion of same-instant range readings.
//! - [`room`] – [`RoomGeometryReconstructor`][room::RoomGeometryReconstructor]:
//!   sweep accumulation and room dimensions.
//! - [`plane`] – local normals, sequential RANSAC and total-least-squares
//!   plane fitting used by [`room`].
//! - [`octree`] – [`PointOctree`][octree::PointOctree]: neighbourhood queries
//!   over a sweep's point cloud.

pub mod fusion;
pub mod octree;
pub mod orientation;
pub mod plane;
pub mod position;
pub mod room;
