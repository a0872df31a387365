use glam::DVec3;
use hashbrown::HashMap;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};

/// Coordinate axis, used to pick the "up" direction of a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    #[inline]
    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }

    #[inline]
    pub fn component(self, v: DVec3) -> f64 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
            Axis::Z => v.z,
        }
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: DVec3,
    pub max: DVec3,
}

impl Aabb {
    pub fn from_points<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a DVec3>,
    {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), &p| (lo.min(p), hi.max(p)));
        Some(Self { min, max })
    }

    #[inline]
    pub fn extent(&self) -> DVec3 {
        self.max - self.min
    }

    #[inline]
    pub fn max_extent(&self) -> f64 {
        self.extent().max_element()
    }

    #[inline]
    pub fn center(&self) -> DVec3 {
        0.5 * (self.min + self.max)
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        let e = self.extent();
        e.x * e.y * e.z
    }

    #[inline]
    pub fn translated(&self, offset: DVec3) -> Self {
        Self {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    /// Inclusive containment test.
    #[inline]
    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

/// Triangle-connected clusters of a mesh.
#[derive(Debug, Clone)]
pub struct Components {
    /// Cluster id per triangle.
    pub labels: Vec<usize>,
    /// Triangle count per cluster id.
    pub sizes: Vec<usize>,
}

/// Indexed triangle mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriMesh {
    pub vertices: Vec<DVec3>,
    pub triangles: Vec<[u32; 3]>,
}

impl TriMesh {
    pub fn new(vertices: Vec<DVec3>, triangles: Vec<[u32; 3]>) -> Self {
        Self {
            vertices,
            triangles,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Bounding box of all vertices (referenced or not).
    pub fn aabb(&self) -> Option<Aabb> {
        Aabb::from_points(&self.vertices)
    }

    #[inline]
    pub fn triangle(&self, i: usize) -> [DVec3; 3] {
        let [a, b, c] = self.triangles[i];
        [
            self.vertices[a as usize],
            self.vertices[b as usize],
            self.vertices[c as usize],
        ]
    }

    /// Keep the triangles selected by `keep` and drop vertices that are no longer referenced.
    pub fn retain_triangles<F>(&self, mut keep: F) -> TriMesh
    where
        F: FnMut(usize, &[u32; 3]) -> bool,
    {
        let mut remap: Vec<Option<u32>> = vec![None; self.vertices.len()];
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();

        for (i, tri) in self.triangles.iter().enumerate() {
            if !keep(i, tri) {
                continue;
            }

            let mut out = [0u32; 3];
            for (slot, &v) in out.iter_mut().zip(tri.iter()) {
                *slot = *remap[v as usize].get_or_insert_with(|| {
                    vertices.push(self.vertices[v as usize]);
                    (vertices.len() - 1) as u32
                });
            }
            triangles.push(out);
        }

        TriMesh {
            vertices,
            triangles,
        }
    }

    /// Drop vertices that no triangle references.
    pub fn remove_unreferenced_vertices(&self) -> TriMesh {
        self.retain_triangles(|_, _| true)
    }

    /// Keep only triangles whose three vertices lie inside `bbox`.
    pub fn crop(&self, bbox: &Aabb) -> TriMesh {
        let inside: Vec<bool> = self.vertices.iter().map(|&v| bbox.contains(v)).collect();
        self.retain_triangles(|_, tri| tri.iter().all(|&v| inside[v as usize]))
    }

    /// Cluster triangles that share an edge.
    ///
    /// Cluster ids are assigned in order of each cluster's first triangle.
    pub fn connected_components(&self) -> Components {
        let n = self.triangles.len();
        let mut parent: Vec<usize> = (0..n).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut edge_owner: HashMap<(u32, u32), usize> = HashMap::with_capacity(n * 3);
        for (t, &[a, b, c]) in self.triangles.iter().enumerate() {
            for (u, v) in [(a, b), (b, c), (c, a)] {
                let key = (u.min(v), u.max(v));
                match edge_owner.get(&key) {
                    Some(&other) => {
                        let (ra, rb) = (find(&mut parent, t), find(&mut parent, other));
                        if ra != rb {
                            parent[ra.max(rb)] = ra.min(rb);
                        }
                    }
                    None => {
                        edge_owner.insert(key, t);
                    }
                }
            }
        }

        let mut root_to_label: HashMap<usize, usize> = HashMap::new();
        let mut labels = Vec::with_capacity(n);
        let mut sizes = Vec::new();
        for t in 0..n {
            let root = find(&mut parent, t);
            let label = *root_to_label.entry(root).or_insert_with(|| {
                sizes.push(0);
                sizes.len() - 1
            });
            sizes[label] += 1;
            labels.push(label);
        }

        Components { labels, sizes }
    }

    /// Sub-mesh made of one cluster.
    pub fn component(&self, components: &Components, label: usize) -> TriMesh {
        self.retain_triangles(|i, _| components.labels[i] == label)
    }

    /// Vertex clustering on a regular grid of `voxel_size`, averaging the vertices of
    /// each cell. Degenerate and duplicate triangles are dropped.
    pub fn simplify_vertex_clustering(&self, voxel_size: f64) -> TriMesh {
        let Some(bbox) = self.aabb() else {
            return self.clone();
        };
        if !(voxel_size > 0.0) || !voxel_size.is_finite() {
            return self.clone();
        }

        let origin = bbox.min - DVec3::splat(0.5 * voxel_size);
        let mut cell_of: HashMap<(i64, i64, i64), u32> = HashMap::new();
        let mut sums: Vec<(DVec3, u32)> = Vec::new();
        let mut remap = Vec::with_capacity(self.vertices.len());

        for &v in &self.vertices {
            let idx = ((v - origin) / voxel_size).floor();
            let key = (idx.x as i64, idx.y as i64, idx.z as i64);
            let cell = *cell_of.entry(key).or_insert_with(|| {
                sums.push((DVec3::ZERO, 0));
                (sums.len() - 1) as u32
            });
            let (sum, count) = &mut sums[cell as usize];
            *sum += v;
            *count += 1;
            remap.push(cell);
        }

        let vertices: Vec<DVec3> = sums
            .into_iter()
            .map(|(sum, count)| sum / count as f64)
            .collect();

        let mut seen: hashbrown::HashSet<[u32; 3]> = hashbrown::HashSet::new();
        let mut triangles = Vec::with_capacity(self.triangles.len());
        for &[a, b, c] in &self.triangles {
            let tri = [remap[a as usize], remap[b as usize], remap[c as usize]];
            if tri[0] == tri[1] || tri[1] == tri[2] || tri[0] == tri[2] {
                continue;
            }
            let mut key = tri;
            key.sort_unstable();
            if seen.insert(key) {
                triangles.push(tri);
            }
        }

        TriMesh {
            vertices,
            triangles,
        }
        .remove_unreferenced_vertices()
    }

    /// Volume of an oriented bounding box aligned with the principal axes of the vertices.
    pub fn oriented_bounding_volume(&self) -> f64 {
        if self.vertices.len() < 4 {
            return 0.0;
        }

        let n = self.vertices.len() as f64;
        let mean = self.vertices.iter().copied().sum::<DVec3>() / n;

        let mut cov = Matrix3::<f64>::zeros();
        for &v in &self.vertices {
            let d = v - mean;
            let d = Vector3::new(d.x, d.y, d.z);
            cov += d * d.transpose();
        }
        cov /= n;

        let eigen = SymmetricEigen::new(cov);
        let mut volume = 1.0;
        for axis in eigen.eigenvectors.column_iter() {
            let axis = DVec3::new(axis[0], axis[1], axis[2]);
            let (lo, hi) = self
                .vertices
                .iter()
                .map(|&v| (v - mean).dot(axis))
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), t| {
                    (lo.min(t), hi.max(t))
                });
            volume *= hi - lo;
        }

        volume.max(0.0)
    }
}
