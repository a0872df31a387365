//! Ear-clipping triangulation of planar 3D polygons.

use glam::{DVec2, DVec3};

const EPS: f64 = 1e-12;

/// Newell normal of a ring (not normalized).
fn newell_normal(ring: &[DVec3]) -> DVec3 {
    let mut n = DVec3::ZERO;
    for (i, &a) in ring.iter().enumerate() {
        let b = ring[(i + 1) % ring.len()];
        n.x += (a.y - b.y) * (a.z + b.z);
        n.y += (a.z - b.z) * (a.x + b.x);
        n.z += (a.x - b.x) * (a.y + b.y);
    }
    n
}

/// Project onto the plane of the dominant normal component, keeping orientation
/// for a positive component.
fn project(ring: &[DVec3], normal: DVec3) -> Vec<DVec2> {
    let a = normal.abs();
    if a.z >= a.x && a.z >= a.y {
        ring.iter().map(|p| DVec2::new(p.x, p.y)).collect()
    } else if a.x >= a.y {
        ring.iter().map(|p| DVec2::new(p.y, p.z)).collect()
    } else {
        ring.iter().map(|p| DVec2::new(p.z, p.x)).collect()
    }
}

#[inline]
fn cross(o: DVec2, a: DVec2, b: DVec2) -> f64 {
    (a - o).perp_dot(b - o)
}

fn signed_area(pts: &[DVec2]) -> f64 {
    0.5 * pts
        .iter()
        .enumerate()
        .map(|(i, &p)| p.perp_dot(pts[(i + 1) % pts.len()]))
        .sum::<f64>()
}

/// `p` strictly inside triangle `abc` given the triangle's winding sign.
fn strictly_inside(p: DVec2, a: DVec2, b: DVec2, c: DVec2, sign: f64) -> bool {
    sign * cross(a, b, p) > EPS && sign * cross(b, c, p) > EPS && sign * cross(c, a, p) > EPS
}

fn fan(order: &[usize]) -> Vec<[usize; 3]> {
    (1..order.len().saturating_sub(1))
        .map(|k| [order[0], order[k], order[k + 1]])
        .collect()
}

/// Triangulate one ring. Returned indices refer to `ring` and keep its winding.
///
/// A closing vertex equal to the first one is ignored. Rings that are degenerate,
/// or where no ear can be found, fall back to a fan.
pub fn triangulate_ring(ring: &[DVec3]) -> Vec<[usize; 3]> {
    let mut n = ring.len();
    if n >= 2 && ring[0] == ring[n - 1] {
        n -= 1;
    }
    if n < 3 {
        return Vec::new();
    }
    let ring = &ring[..n];

    let pts = project(ring, newell_normal(ring));
    let area = signed_area(&pts);
    let mut order: Vec<usize> = (0..n).collect();
    if area.abs() <= EPS {
        return fan(&order);
    }
    let sign = area.signum();

    let mut out = Vec::with_capacity(n - 2);
    while order.len() > 3 {
        let m = order.len();
        let ear = (0..m).find(|&i| {
            let (ia, ib, ic) = (order[(i + m - 1) % m], order[i], order[(i + 1) % m]);
            let (a, b, c) = (pts[ia], pts[ib], pts[ic]);
            if sign * cross(a, b, c) <= EPS {
                return false;
            }
            order
                .iter()
                .filter(|&&j| j != ia && j != ib && j != ic)
                .all(|&j| !strictly_inside(pts[j], a, b, c, sign))
        });

        match ear {
            Some(i) => {
                out.push([order[(i + m - 1) % m], order[i], order[(i + 1) % m]]);
                order.remove(i);
            }
            None => {
                out.extend(fan(&order));
                return out;
            }
        }
    }
    out.push([order[0], order[1], order[2]]);
    out
}
