//! Room geometry from a directional sweep.
//!
//! [`RoomGeometryReconstructor`] walks through
//! `Idle → Sweeping → Reconstructing → Finalized`.
//!
//! While sweeping, every fused reading with a distance, enough confidence and
//! a pose becomes a point `pose.rotate(direction · distance)` in the
//! reference frame centred on the device. Completing the sweep extracts
//! planes (see [`crate::plane`]), groups them into families of parallel
//! planes and measures the room between opposing planes:
//!
//! - **length / width** – the two best-supported vertical families;
//! - **height** – the horizontal family (floor + ceiling), falling back to
//!   the vertical extent of the cloud when one of them was not seen.
//!
//! Fewer than three non-parallel families is [`ChiropteraError::InsufficientGeometry`];
//! the reconstructor then returns to `Idle` so the caller can sweep again.
//! A finalised model is never modified.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_perception::room::{ReconstructionConfig, RoomGeometryReconstructor};
//! use chiroptera_types::ScanPhase;
//!
//! let mut room = RoomGeometryReconstructor::new(ReconstructionConfig::default());
//! let scan_id = room.start_sweep().unwrap();
//! assert_eq!(room.phase(), ScanPhase::Sweeping);
//! assert_eq!(room.scan_id(), Some(scan_id));
//!
//! // Nothing was measured, so there is nothing to reconstruct.
//! assert!(room.complete_sweep().is_err());
//! assert_eq!(room.phase(), ScanPhase::Idle);
//! ```

use chiroptera_types::linalg::Matrix;
use chiroptera_types::{
    ChiropteraError, DistanceMeasurement, RoomModel, ScanPhase, SurfaceKind, Vec3, WallPlane,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::octree::{Aabb, PointOctree};
use crate::plane::{ExtractedPlane, PlaneExtractor, PlaneFitConfig, local_normals};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Readings below this confidence are not accumulated.
    pub min_confidence: f64,
    /// Readings beyond this range are not accumulated (m).
    pub max_range_meters: f64,
    pub octree_capacity: usize,
    pub planes: PlaneFitConfig,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            max_range_meters: 12.0,
            octree_capacity: 16,
            planes: PlaneFitConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct RoomGeometryReconstructor {
    config: ReconstructionConfig,
    phase: ScanPhase,
    scan_id: Option<Uuid>,
    points: Vec<Vec3>,
    model: Option<RoomModel>,
}

impl RoomGeometryReconstructor {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self {
            config,
            phase: ScanPhase::Idle,
            scan_id: None,
            points: Vec::new(),
            model: None,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn scan_id(&self) -> Option<Uuid> {
        self.scan_id
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    /// The finalised model, if this reconstructor reached `Finalized`.
    pub fn model(&self) -> Option<&RoomModel> {
        self.model.as_ref()
    }

    /// Begin accumulating a new scan. Only valid from `Idle`.
    pub fn start_sweep(&mut self) -> Result<Uuid, ChiropteraError> {
        self.expect_phase(ScanPhase::Idle)?;
        let id = Uuid::new_v4();
        self.scan_id = Some(id);
        self.points.clear();
        self.phase = ScanPhase::Sweeping;
        tracing::info!(scan_id = %id, "sweep started");
        Ok(id)
    }

    /// Accumulate one fused reading. Returns whether it became a point.
    ///
    /// Readings without a distance, below the confidence floor, beyond the
    /// range gate or without a pose annotation are skipped.
    pub fn add_measurement(&mut self, m: &DistanceMeasurement) -> Result<bool, ChiropteraError> {
        self.expect_phase(ScanPhase::Sweeping)?;
        let Some(distance) = m.distance_meters else {
            return Ok(false);
        };
        if m.confidence < self.config.min_confidence || distance > self.config.max_range_meters {
            return Ok(false);
        }
        let Some(pose) = m.pose else {
            tracing::debug!("reading without pose skipped");
            return Ok(false);
        };
        let point = pose.rotate(m.direction * distance);
        if !point.is_finite() {
            return Ok(false);
        }
        self.points.push(point);
        Ok(true)
    }

    /// Drop the scan in progress and return to `Idle`. A finalised model is
    /// left untouched and `false` is returned.
    pub fn abort(&mut self) -> bool {
        match self.phase {
            ScanPhase::Sweeping | ScanPhase::Reconstructing => {
                tracing::info!(scan_id = ?self.scan_id, points = self.points.len(), "sweep aborted");
                self.reset();
                true
            }
            ScanPhase::Idle | ScanPhase::Finalized => false,
        }
    }

    /// Reconstruct the room from the accumulated points.
    ///
    /// On success the reconstructor is `Finalized` and the model is returned.
    /// On [`ChiropteraError::InsufficientGeometry`] it is back in `Idle`.
    #[tracing::instrument(skip_all, fields(points = self.points.len()))]
    pub fn complete_sweep(&mut self) -> Result<RoomModel, ChiropteraError> {
        self.expect_phase(ScanPhase::Sweeping)?;
        self.phase = ScanPhase::Reconstructing;
        let scan_id = self.scan_id.unwrap_or_else(Uuid::new_v4);

        match reconstruct(&self.points, &self.config) {
            Ok(geometry) => {
                let model = RoomModel {
                    scan_id,
                    walls: geometry.walls,
                    corners: geometry.corners,
                    length: geometry.length,
                    width: geometry.width,
                    height: geometry.height,
                    area: geometry.length * geometry.width,
                    volume: geometry.length * geometry.width * geometry.height,
                    point_count: self.points.len(),
                    finalized_at: Utc::now(),
                };
                tracing::info!(
                    scan_id = %scan_id,
                    length = model.length,
                    width = model.width,
                    height = model.height,
                    planes = model.walls.len(),
                    "room finalised"
                );
                self.phase = ScanPhase::Finalized;
                self.model = Some(model.clone());
                Ok(model)
            }
            Err(err) => {
                tracing::warn!(scan_id = %scan_id, error = %err, "reconstruction rejected");
                self.reset();
                Err(err)
            }
        }
    }

    fn reset(&mut self) {
        self.phase = ScanPhase::Idle;
        self.scan_id = None;
        self.points.clear();
    }

    fn expect_phase(&self, expected: ScanPhase) -> Result<(), ChiropteraError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(ChiropteraError::InvalidScanState {
                expected,
                found: self.phase,
            })
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Reconstruction
// ────────────────────────────────────────────────────────────────────────────

struct Geometry {
    walls: Vec<WallPlane>,
    corners: Vec<Vec3>,
    length: f64,
    width: f64,
    height: f64,
}

/// Planes sharing one orientation (up to sign).
struct Family {
    planes: Vec<WallPlane>,
    axis: Vec3,
    support: usize,
}

impl Family {
    fn is_vertical(&self) -> bool {
        self.planes.iter().all(|p| p.kind == SurfaceKind::Wall)
    }

    fn is_horizontal(&self) -> bool {
        self.planes
            .iter()
            .all(|p| matches!(p.kind, SurfaceKind::Floor | SurfaceKind::Ceiling))
    }

    /// Distance between the two best-supported opposing planes, if any.
    fn opposing_span(&self) -> Option<f64> {
        let positive = self.planes.iter().filter(|p| p.normal.dot(self.axis) > 0.0).max_by_key(|p| p.support)?;
        let negative = self.planes.iter().filter(|p| p.normal.dot(self.axis) < 0.0).max_by_key(|p| p.support)?;
        Some(positive.offset + negative.offset)
    }
}

fn reconstruct(points: &[Vec3], config: &ReconstructionConfig) -> Result<Geometry, ChiropteraError> {
    let min_support = config.planes.min_support;
    if points.len() < 3 * min_support {
        return Err(ChiropteraError::InsufficientGeometry(format!(
            "{} points, at least {} needed",
            points.len(),
            3 * min_support
        )));
    }

    let tree = PointOctree::from_points(points, config.octree_capacity);
    let normals = local_normals(points, &tree, &config.planes);
    let planes = PlaneExtractor::new(points, &normals, config.planes).extract();
    let walls: Vec<WallPlane> = planes
        .iter()
        .map(|p: &ExtractedPlane| p.to_wall_plane(config.planes.surface_tolerance_deg))
        .collect();

    let families = group_families(&walls, config.planes.normal_tolerance_deg);
    if families.len() < 3 {
        return Err(ChiropteraError::InsufficientGeometry(format!(
            "{} plane orientations found, at least 3 needed",
            families.len()
        )));
    }

    let mut vertical: Vec<&Family> = families.iter().filter(|f| f.is_vertical()).collect();
    if vertical.len() < 2 {
        return Err(ChiropteraError::InsufficientGeometry(format!(
            "{} wall orientations found, at least 2 needed",
            vertical.len()
        )));
    }
    vertical.sort_by(|a, b| b.support.cmp(&a.support));

    let bounds = Aabb::enclosing(points)
        .ok_or_else(|| ChiropteraError::InsufficientGeometry("empty point cloud".into()))?;
    let span = |family: &Family| family.opposing_span().unwrap_or_else(|| extent_along(points, family.axis));

    let a = span(vertical[0]);
    let b = span(vertical[1]);
    let (length, width) = if a >= b { (a, b) } else { (b, a) };
    let height = families
        .iter()
        .find(|f| f.is_horizontal())
        .and_then(Family::opposing_span)
        .unwrap_or(bounds.extent().z);

    let corners = compute_corners(&walls, &bounds, config.planes.normal_tolerance_deg);

    Ok(Geometry {
        walls,
        corners,
        length,
        width,
        height,
    })
}

fn group_families(walls: &[WallPlane], tolerance_deg: f64) -> Vec<Family> {
    let cos_tol = tolerance_deg.to_radians().cos();
    let mut families: Vec<Family> = Vec::new();
    for wall in walls {
        match families.iter_mut().find(|f| wall.normal.dot(f.axis).abs() >= cos_tol) {
            Some(family) => {
                family.support += wall.support;
                family.planes.push(*wall);
            }
            None => families.push(Family {
                planes: vec![*wall],
                axis: wall.normal,
                support: wall.support,
            }),
        }
    }
    families
}

fn extent_along(points: &[Vec3], axis: Vec3) -> f64 {
    let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
        let d = p.dot(axis);
        (lo.min(d), hi.max(d))
    });
    if hi >= lo { hi - lo } else { 0.0 }
}

/// Intersections of every pair of non-parallel walls with each floor or
/// ceiling, kept when they fall near the scanned volume.
fn compute_corners(walls: &[WallPlane], bounds: &Aabb, tolerance_deg: f64) -> Vec<Vec3> {
    let cos_tol = tolerance_deg.to_radians().cos();
    let region = bounds.expanded(0.25);
    let verticals: Vec<&WallPlane> = walls.iter().filter(|w| w.kind == SurfaceKind::Wall).collect();
    let horizontals: Vec<&WallPlane> = walls
        .iter()
        .filter(|w| matches!(w.kind, SurfaceKind::Floor | SurfaceKind::Ceiling))
        .collect();

    let mut corners = Vec::new();
    for (i, a) in verticals.iter().enumerate() {
        for b in &verticals[i + 1..] {
            if a.normal.dot(b.normal).abs() >= cos_tol {
                continue;
            }
            for h in &horizontals {
                if let Some(p) = intersect(a, b, h)
                    && region.contains_point(p)
                {
                    corners.push(p);
                }
            }
        }
    }
    corners
}

fn intersect(a: &WallPlane, b: &WallPlane, c: &WallPlane) -> Option<Vec3> {
    let m = Matrix::<3, 3>::from_rows([a.normal.to_array(), b.normal.to_array(), c.normal.to_array()]);
    let rhs = Matrix::<3, 1>::from_column([-a.offset, -b.offset, -c.offset]);
    let [x, y, z] = (m.try_inverse()? * rhs).column();
    Some(Vec3::new(x, y, z))
}
