//! Plane extraction from a room sweep.
//!
//! Three stages, all deterministic for a given cloud and seed:
//!
//! 1. **Local normals** – for every point, a total-least-squares plane is
//!    fitted to its octree neighbourhood; the normal is kept only when the
//!    neighbourhood is clearly planar.
//! 2. **Sequential RANSAC** – the plane with the most inliers (distance
//!    within tolerance, local normal within the angular tolerance when one
//!    exists) is found, refined by refit/reselect rounds until membership is
//!    stable, removed from the cloud, and the search repeats.
//! 3. **Merge** – planes that ended up split across RANSAC rounds are joined
//!    when their normals and offsets agree.

use std::collections::BTreeSet;

use chiroptera_types::linalg::Matrix;
use chiroptera_types::{SurfaceKind, Vec3, WallPlane};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::octree::PointOctree;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneFitConfig {
    /// Point-to-plane distance for membership (m).
    pub distance_tolerance: f64,
    /// Local normal vs plane normal agreement (degrees).
    pub normal_tolerance_deg: f64,
    /// Minimum member count for a plane to be kept.
    pub min_support: usize,
    /// Hypotheses drawn per extracted plane.
    pub ransac_iterations: usize,
    /// Refit/reselect rounds per plane.
    pub max_refinements: usize,
    pub max_planes: usize,
    /// Neighbourhood radius for local normals (m).
    pub normal_radius: f64,
    pub normal_min_neighbors: usize,
    /// Local normal kept when `λ₀ ≤ planarity_ratio · λ₁`.
    pub planarity_ratio: f64,
    /// Planes closer than this in offset (m) with agreeing normals merge.
    pub merge_offset_tolerance: f64,
    /// Deviation from vertical/horizontal tolerated when classifying (degrees).
    pub surface_tolerance_deg: f64,
    pub seed: u64,
}

impl Default for PlaneFitConfig {
    fn default() -> Self {
        Self {
            distance_tolerance: 0.03,
            normal_tolerance_deg: 10.0,
            min_support: 20,
            ransac_iterations: 400,
            max_refinements: 10,
            max_planes: 12,
            normal_radius: 0.75,
            normal_min_neighbors: 6,
            planarity_ratio: 0.05,
            merge_offset_tolerance: 0.10,
            surface_tolerance_deg: 10.0,
            seed: 0x5eed,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Total least squares
// ────────────────────────────────────────────────────────────────────────────

/// Plane fitted to a set of points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFit {
    /// Unit normal, oriented towards the scan origin.
    pub normal: Vec3,
    /// `normal · x + offset = 0`; non-negative after orientation.
    pub offset: f64,
    pub centroid: Vec3,
    /// Covariance eigenvalues, ascending.
    pub eigenvalues: [f64; 3],
}

impl PlaneFit {
    pub fn distance(&self, p: Vec3) -> f64 {
        (self.normal.dot(p) + self.offset).abs()
    }
}

/// Total-least-squares plane through `points[indices]`: the normal is the
/// eigenvector of the smallest covariance eigenvalue.
///
/// `None` for fewer than three points or a degenerate (non-finite) fit.
pub fn fit_plane(points: &[Vec3], indices: &[usize]) -> Option<PlaneFit> {
    if indices.len() < 3 {
        return None;
    }
    let n = indices.len() as f64;
    let centroid = indices
        .iter()
        .fold(Vec3::zero(), |acc, &i| acc + points[i])
        .scale(1.0 / n);

    let mut cov = Matrix::<3, 3>::zeros();
    for &i in indices {
        let d = (points[i] - centroid).to_array();
        for r in 0..3 {
            for c in 0..3 {
                cov[(r, c)] += d[r] * d[c];
            }
        }
    }
    let (eigenvalues, vectors) = cov.scale(1.0 / n).symmetric_eigen();
    let [nx, ny, nz] = vectors[0];
    let normal = Vec3::new(nx, ny, nz).normalized()?;
    let (normal, offset) = orient_towards_origin(normal, -normal.dot(centroid));

    (offset.is_finite() && eigenvalues.iter().all(|v| v.is_finite())).then_some(PlaneFit {
        normal,
        offset,
        centroid,
        eigenvalues,
    })
}

/// Flip `(n, d)` so the origin lies on the positive side.
fn orient_towards_origin(normal: Vec3, offset: f64) -> (Vec3, f64) {
    if offset < 0.0 {
        (-normal, -offset)
    } else {
        (normal, offset)
    }
}

fn plane_through(a: Vec3, b: Vec3, c: Vec3) -> Option<(Vec3, f64)> {
    let normal = (b - a).cross(c - a).normalized()?;
    Some(orient_towards_origin(normal, -normal.dot(a)))
}

// ────────────────────────────────────────────────────────────────────────────
// Local normals
// ────────────────────────────────────────────────────────────────────────────

/// Per-point surface normal, `None` where the neighbourhood is too sparse
/// or not planar (edges, corners).
pub fn local_normals(points: &[Vec3], tree: &PointOctree, config: &PlaneFitConfig) -> Vec<Option<Vec3>> {
    points
        .iter()
        .map(|&p| {
            let neighbors = tree.within_radius(p, config.normal_radius);
            if neighbors.len() < config.normal_min_neighbors {
                return None;
            }
            let fit = fit_plane(points, &neighbors)?;
            let [l0, l1, _] = fit.eigenvalues;
            (l1 > 1e-8 && l0 <= config.planarity_ratio * l1).then_some(fit.normal)
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Extraction
// ────────────────────────────────────────────────────────────────────────────

/// A fitted plane and the indices of its member points.
#[derive(Debug, Clone)]
pub struct ExtractedPlane {
    pub fit: PlaneFit,
    pub members: Vec<usize>,
}

impl ExtractedPlane {
    pub fn to_wall_plane(&self, surface_tolerance_deg: f64) -> WallPlane {
        WallPlane {
            normal: self.fit.normal,
            offset: self.fit.offset,
            support: self.members.len(),
            kind: classify_surface(self.fit.normal, surface_tolerance_deg),
        }
    }
}

/// Classify an inward normal. A floor's inward normal points up, a
/// ceiling's points down.
pub fn classify_surface(normal: Vec3, tolerance_deg: f64) -> SurfaceKind {
    let tol = tolerance_deg.to_radians();
    if normal.z >= tol.cos() {
        SurfaceKind::Floor
    } else if normal.z <= -tol.cos() {
        SurfaceKind::Ceiling
    } else if normal.z.abs() <= tol.sin() {
        SurfaceKind::Wall
    } else {
        SurfaceKind::Slanted
    }
}

/// Sequential RANSAC plane extraction.
pub struct PlaneExtractor<'a> {
    points: &'a [Vec3],
    normals: &'a [Option<Vec3>],
    config: PlaneFitConfig,
    rng: StdRng,
}

impl<'a> PlaneExtractor<'a> {
    pub fn new(points: &'a [Vec3], normals: &'a [Option<Vec3>], config: PlaneFitConfig) -> Self {
        Self {
            points,
            normals,
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    /// Extract, merge and return planes sorted by support (largest first).
    pub fn extract(mut self) -> Vec<ExtractedPlane> {
        let mut remaining: BTreeSet<usize> = (0..self.points.len()).collect();
        let mut planes = Vec::new();

        while remaining.len() >= self.config.min_support && planes.len() < self.config.max_planes {
            let pool: Vec<usize> = remaining.iter().copied().collect();
            let Some(plane) = self.best_plane(&pool) else {
                break;
            };
            for i in &plane.members {
                remaining.remove(i);
            }
            tracing::debug!(
                support = plane.members.len(),
                offset = plane.fit.offset,
                "plane extracted"
            );
            planes.push(plane);
        }

        let mut merged = self.merge(planes);
        merged.sort_by(|a, b| b.members.len().cmp(&a.members.len()));
        merged
    }

    fn best_plane(&mut self, pool: &[usize]) -> Option<ExtractedPlane> {
        let n = pool.len();
        if n < 3 {
            return None;
        }

        let mut best: Option<(Vec3, f64, usize)> = None;
        for _ in 0..self.config.ransac_iterations {
            let a = pool[self.rng.random_range(0..n)];
            let b = pool[self.rng.random_range(0..n)];
            let c = pool[self.rng.random_range(0..n)];
            if a == b || b == c || a == c {
                continue;
            }
            let Some((normal, offset)) = plane_through(self.points[a], self.points[b], self.points[c]) else {
                continue;
            };
            let count = pool
                .iter()
                .filter(|&&i| self.is_member(i, normal, offset))
                .count();
            if best.is_none_or(|(_, _, best_count)| count > best_count) {
                best = Some((normal, offset, count));
            }
        }

        let (mut normal, mut offset, count) = best?;
        if count < self.config.min_support {
            return None;
        }

        let mut members = self.select(pool, normal, offset);
        let mut fit = fit_plane(self.points, &members)?;
        for _ in 0..self.config.max_refinements {
            normal = fit.normal;
            offset = fit.offset;
            let reselected = self.select(pool, normal, offset);
            if reselected == members {
                break;
            }
            if reselected.len() < 3 {
                return None;
            }
            members = reselected;
            fit = fit_plane(self.points, &members)?;
        }

        (members.len() >= self.config.min_support).then_some(ExtractedPlane { fit, members })
    }

    fn select(&self, pool: &[usize], normal: Vec3, offset: f64) -> Vec<usize> {
        pool.iter()
            .copied()
            .filter(|&i| self.is_member(i, normal, offset))
            .collect()
    }

    fn is_member(&self, i: usize, normal: Vec3, offset: f64) -> bool {
        if (normal.dot(self.points[i]) + offset).abs() > self.config.distance_tolerance {
            return false;
        }
        match self.normals[i] {
            None => true,
            Some(local) => {
                // Local normals are unsigned.
                let cos = local.dot(normal).abs().min(1.0);
                cos.acos() <= self.config.normal_tolerance_deg.to_radians()
            }
        }
    }

    fn merge(&self, planes: Vec<ExtractedPlane>) -> Vec<ExtractedPlane> {
        let max_angle = self.config.normal_tolerance_deg.to_radians();
        let mut out: Vec<ExtractedPlane> = Vec::new();
        for plane in planes {
            let target = out.iter_mut().find(|p| {
                p.fit.normal.angle_to(plane.fit.normal) <= max_angle
                    && (p.fit.offset - plane.fit.offset).abs() <= self.config.merge_offset_tolerance
            });
            match target {
                Some(existing) => {
                    existing.members.extend_from_slice(&plane.members);
                    existing.members.sort_unstable();
                    if let Some(fit) = fit_plane(self.points, &existing.members) {
                        existing.fit = fit;
                    }
                    tracing::debug!(support = existing.members.len(), "planes merged");
                }
                None => out.push(plane),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall_grid(x: f64, n: usize) -> Vec<Vec3> {
        let mut pts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                pts.push(Vec3::new(x, -1.0 + 2.0 * i as f64 / n as f64, -1.0 + 2.0 * j as f64 / n as f64));
            }
        }
        pts
    }

    #[test]
    fn fit_recovers_plane_oriented_inwards() {
        let pts = wall_grid(3.0, 6);
        let idx: Vec<usize> = (0..pts.len()).collect();
        let fit = fit_plane(&pts, &idx).unwrap();
        assert!((fit.normal.x + 1.0).abs() < 1e-9);
        assert!((fit.offset - 3.0).abs() < 1e-9);
        assert!(fit.eigenvalues[0].abs() < 1e-12);
        assert!(fit.distance(Vec3::new(3.0, 5.0, -2.0)) < 1e-9);
    }

    #[test]
    fn fit_needs_three_points() {
        let pts = [Vec3::zero(), Vec3::new(1.0, 0.0, 0.0)];
        assert!(fit_plane(&pts, &[0, 1]).is_none());
    }

    #[test]
    fn classifies_surfaces_by_inward_normal() {
        assert_eq!(classify_surface(Vec3::unit_z(), 10.0), SurfaceKind::Floor);
        assert_eq!(classify_surface(-Vec3::unit_z(), 10.0), SurfaceKind::Ceiling);
        assert_eq!(classify_surface(Vec3::new(-1.0, 0.0, 0.05), 10.0), SurfaceKind::Wall);
        let tilted = Vec3::new(1.0, 0.0, 1.0).normalized().unwrap();
        assert_eq!(classify_surface(tilted, 10.0), SurfaceKind::Slanted);
    }

    #[test]
    fn local_normals_flat_on_plane() {
        let pts = wall_grid(-2.0, 10);
        let tree = PointOctree::from_points(&pts, 8);
        let config = PlaneFitConfig {
            normal_radius: 0.5,
            ..Default::default()
        };
        let normals = local_normals(&pts, &tree, &config);
        let with_normal = normals.iter().flatten().count();
        assert_eq!(with_normal, pts.len());
        for n in normals.iter().flatten() {
            assert!((n.x.abs() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn extracts_two_planes_and_is_deterministic() {
        let mut pts = wall_grid(3.0, 8);
        pts.extend(wall_grid(-2.0, 7));
        let normals = vec![None; pts.len()];
        let config = PlaneFitConfig::default();

        let planes = PlaneExtractor::new(&pts, &normals, config).extract();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].members.len(), 64);
        assert_eq!(planes[1].members.len(), 49);
        assert!((planes[0].fit.offset - 3.0).abs() < 1e-6);
        assert!((planes[1].fit.offset - 2.0).abs() < 1e-6);

        let again = PlaneExtractor::new(&pts, &normals, config).extract();
        assert_eq!(again[0].members, planes[0].members);
    }

    #[test]
    fn sparse_cloud_yields_nothing() {
        let pts = wall_grid(1.0, 3);
        let normals = vec![None; pts.len()];
        assert!(PlaneExtractor::new(&pts, &normals, PlaneFitConfig::default()).extract().is_empty());
    }
}
