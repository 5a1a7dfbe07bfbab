//! Spatial index over a sweep's point cloud.
//!
//! The reconstructor needs the neighbourhood of every point to estimate a
//! local surface normal. [`PointOctree`] partitions the cloud recursively and
//! answers radius and box queries with the indices of the stored points, so
//! callers keep ownership of the cloud itself.
//!
//! # Example
//!
//! ```rust
//! use chiroptera_perception::octree::PointOctree;
//! use chiroptera_types::Vec3;
//!
//! let cloud = [
//!     Vec3::new(0.0, 0.0, 0.0),
//!     Vec3::new(0.05, 0.0, 0.0),
//!     Vec3::new(2.0, 2.0, 2.0),
//! ];
//! let tree = PointOctree::from_points(&cloud, 8);
//!
//! let mut near = tree.within_radius(Vec3::zero(), 0.1);
//! near.sort();
//! assert_eq!(near, vec![0, 1]);
//! ```

use chiroptera_types::Vec3;

// ────────────────────────────────────────────────────────────────────────────
// Aabb
// ────────────────────────────────────────────────────────────────────────────

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Box spanned by two opposite corners, in any order.
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: Vec3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Vec3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    /// Tightest box around `points`, or `None` for an empty slice.
    pub fn enclosing(points: &[Vec3]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().fold(Self::new(first, first), |b, p| Self {
            min: Vec3::new(b.min.x.min(p.x), b.min.y.min(p.y), b.min.z.min(p.z)),
            max: Vec3::new(b.max.x.max(p.x), b.max.y.max(p.y), b.max.z.max(p.z)),
        }))
    }

    pub fn centre(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Grow every face outwards by `margin`.
    pub fn expanded(&self, margin: f64) -> Self {
        let m = Vec3::new(margin, margin, margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }

    /// Inside or on the boundary.
    pub fn contains_point(&self, p: Vec3) -> bool {
        (self.min.x..=self.max.x).contains(&p.x)
            && (self.min.y..=self.max.y).contains(&p.y)
            && (self.min.z..=self.max.z).contains(&p.z)
    }

    /// Squared distance from `p` to the closest point of the box.
    pub fn distance_sq_to(&self, p: Vec3) -> f64 {
        let axis = |v: f64, lo: f64, hi: f64| {
            if v < lo {
                lo - v
            } else if v > hi {
                v - hi
            } else {
                0.0
            }
        };
        let dx = axis(p.x, self.min.x, self.max.x);
        let dy = axis(p.y, self.min.y, self.max.y);
        let dz = axis(p.z, self.min.z, self.max.z);
        dx * dx + dy * dy + dz * dz
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PointOctree
// ────────────────────────────────────────────────────────────────────────────

const MAX_DEPTH: usize = 10;

/// Octree of `(index, position)` entries.
///
/// Leaves split once they hold more than `capacity` entries, down to a fixed
/// maximum depth so coincident points cannot recurse forever.
#[derive(Debug)]
pub struct PointOctree {
    root: Node,
    max_depth: usize,
}

impl PointOctree {
    pub fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            root: Node::new(bounds, capacity.max(1)),
            max_depth: MAX_DEPTH,
        }
    }

    /// Index a whole cloud; entry `i` refers to `points[i]`.
    pub fn from_points(points: &[Vec3], capacity: usize) -> Self {
        let bounds = Aabb::enclosing(points)
            .unwrap_or(Aabb::new(Vec3::zero(), Vec3::zero()))
            .expanded(1e-6);
        let mut tree = Self::new(bounds, capacity);
        for (i, &p) in points.iter().enumerate() {
            tree.insert(i, p);
        }
        tree
    }

    /// Insert an entry. Returns `false` (and stores nothing) when `point`
    /// lies outside the root bounds.
    pub fn insert(&mut self, index: usize, point: Vec3) -> bool {
        self.root.insert(Entry { index, point }, self.max_depth, 0)
    }

    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of all entries within `radius` of `centre` (inclusive).
    pub fn within_radius(&self, centre: Vec3, radius: f64) -> Vec<usize> {
        let mut out = Vec::new();
        self.root.within_radius(centre, radius * radius, &mut out);
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Node – internal implementation
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Entry {
    index: usize,
    point: Vec3,
}

#[derive(Debug)]
struct Node {
    bounds: Aabb,
    capacity: usize,
    /// Non-empty only on leaves.
    entries: Vec<Entry>,
    children: Option<Box<[Node; 8]>>,
}

impl Node {
    fn new(bounds: Aabb, capacity: usize) -> Self {
        Self {
            bounds,
            capacity,
            entries: Vec::new(),
            children: None,
        }
    }

    fn count(&self) -> usize {
        match &self.children {
            None => self.entries.len(),
            Some(children) => children.iter().map(Node::count).sum(),
        }
    }

    fn insert(&mut self, entry: Entry, max_depth: usize, depth: usize) -> bool {
        if !self.bounds.contains_point(entry.point) {
            return false;
        }
        match self.children.as_mut() {
            None => {
                self.entries.push(entry);
                if self.entries.len() > self.capacity && depth < max_depth {
                    self.subdivide(max_depth, depth);
                }
                true
            }
            Some(children) => children
                .iter_mut()
                .any(|child| child.insert(entry, max_depth, depth + 1)),
        }
    }

    fn within_radius(&self, centre: Vec3, radius_sq: f64, out: &mut Vec<usize>) {
        if self.bounds.distance_sq_to(centre) > radius_sq {
            return;
        }
        match &self.children {
            None => out.extend(
                self.entries
                    .iter()
                    .filter(|e| (e.point - centre).dot(e.point - centre) <= radius_sq)
                    .map(|e| e.index),
            ),
            Some(children) => {
                for child in children.iter() {
                    child.within_radius(centre, radius_sq, out);
                }
            }
        }
    }

    fn subdivide(&mut self, max_depth: usize, depth: usize) {
        let c = self.bounds.centre();
        let (lo, hi) = (self.bounds.min, self.bounds.max);

        // Octant k takes the upper half on x/y/z when bit 0/1/2 of k is set.
        let octant = |k: usize| {
            let pick = |bit: usize, l: f64, m: f64, h: f64| if k & bit == 0 { (l, m) } else { (m, h) };
            let (x0, x1) = pick(1, lo.x, c.x, hi.x);
            let (y0, y1) = pick(2, lo.y, c.y, hi.y);
            let (z0, z1) = pick(4, lo.z, c.z, hi.z);
            Aabb::new(Vec3::new(x0, y0, z0), Vec3::new(x1, y1, z1))
        };

        let cap = self.capacity;
        let mut children = Box::new(std::array::from_fn::<Node, 8, _>(|k| Node::new(octant(k), cap)));

        for entry in std::mem::take(&mut self.entries) {
            // Points on a shared face go to the first octant that accepts them.
            for child in children.iter_mut() {
                if child.insert(entry, max_depth, depth + 1) {
                    break;
                }
            }
        }
        self.children = Some(children);
    }
}
