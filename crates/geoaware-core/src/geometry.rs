//! Planar geometry for conflict flagging.
//!
//! Coordinates are treated as plane `(lon, lat)` pairs. The overlap test is
//! conservative: vertex containment plus edge crossing, no clipping.

use crate::models::Point;

/// Tolerance for collinear and touching configurations, in degrees.
const EPS: f64 = 1e-12;

/// Ray-casting point-in-polygon test with the odd-crossing rule.
///
/// The ring is implicitly closed; a repeated closing vertex is harmless.
/// Rings with fewer than three vertices contain nothing.
pub fn point_in_polygon(point: Point, ring: &[Point]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].lon, ring[i].lat);
        let (xj, yj) = (ring[j].lon, ring[j].lat);

        if ((yi > point.lat) != (yj > point.lat))
            && (point.lon < (xj - xi) * (point.lat - yi) / (yj - yi) + xi)
        {
            inside = !inside;
        }
        j = i;
    }

    inside
}

fn orient(p: Point, q: Point, r: Point) -> f64 {
    (q.lon - p.lon) * (r.lat - p.lat) - (q.lat - p.lat) * (r.lon - p.lon)
}

fn within(a: f64, b: f64, value: f64) -> bool {
    value >= a.min(b) - EPS && value <= a.max(b) + EPS
}

/// `r` lies within the bounding box of segment `pq` (used once collinear).
fn on_segment(p: Point, q: Point, r: Point) -> bool {
    within(p.lon, q.lon, r.lon) && within(p.lat, q.lat, r.lat)
}

/// True if segment `p1p2` and segment `p3p4` cross or touch.
pub fn segments_intersect(p1: Point, p2: Point, p3: Point, p4: Point) -> bool {
    let o1 = orient(p1, p2, p3);
    let o2 = orient(p1, p2, p4);
    let o3 = orient(p3, p4, p1);
    let o4 = orient(p3, p4, p2);

    if o1.abs() <= EPS && on_segment(p1, p2, p3) {
        return true;
    }
    if o2.abs() <= EPS && on_segment(p1, p2, p4) {
        return true;
    }
    if o3.abs() <= EPS && on_segment(p3, p4, p1) {
        return true;
    }
    if o4.abs() <= EPS && on_segment(p3, p4, p2) {
        return true;
    }

    let a_crosses = (o1 > EPS && o2 < -EPS) || (o1 < -EPS && o2 > EPS);
    let b_crosses = (o3 > EPS && o4 < -EPS) || (o3 < -EPS && o4 > EPS);
    a_crosses && b_crosses
}

/// Number of distinct vertices in a ring.
pub fn distinct_vertex_count(ring: &[Point]) -> usize {
    let mut seen: Vec<Point> = Vec::with_capacity(ring.len());
    for point in ring {
        if !seen.contains(point) {
            seen.push(*point);
        }
    }
    seen.len()
}

fn edges(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

/// Conservative overlap test between two rings.
///
/// True if a vertex of either ring lies inside the other or any pair of
/// edges crosses or touches. Symmetric in its arguments. Degenerate rings
/// (fewer than three distinct vertices) never intersect.
///
/// Known limitation: an overlap detectable only through exactly collinear
/// edges that fall outside the touch tolerance is not reported.
pub fn polygons_intersect(a: &[Point], b: &[Point]) -> bool {
    if distinct_vertex_count(a) < 3 || distinct_vertex_count(b) < 3 {
        return false;
    }

    if a.iter().any(|vertex| point_in_polygon(*vertex, b)) {
        return true;
    }
    if b.iter().any(|vertex| point_in_polygon(*vertex, a)) {
        return true;
    }

    edges(a).any(|(a1, a2)| edges(b).any(|(b1, b2)| segments_intersect(a1, a2, b1, b2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min_lon: f64, min_lat: f64, size: f64) -> Vec<Point> {
        vec![
            Point::new(min_lon, min_lat),
            Point::new(min_lon + size, min_lat),
            Point::new(min_lon + size, min_lat + size),
            Point::new(min_lon, min_lat + size),
        ]
    }

    #[test]
    fn point_inside_and_outside_square() {
        let ring = square(0.0, 0.0, 1.0);
        assert!(point_in_polygon(Point::new(0.5, 0.5), &ring));
        assert!(!point_in_polygon(Point::new(1.5, 0.5), &ring));
        assert!(!point_in_polygon(Point::new(0.5, -0.1), &ring));
    }

    #[test]
    fn explicitly_closed_ring_behaves_like_open_ring() {
        let mut ring = square(0.0, 0.0, 1.0);
        ring.push(ring[0]);
        assert!(point_in_polygon(Point::new(0.25, 0.75), &ring));
        assert!(!point_in_polygon(Point::new(-0.25, 0.75), &ring));
    }

    #[test]
    fn point_in_concave_ring() {
        // "U" shape opening to the north
        let ring = vec![
            Point::new(0.0, 0.0),
            Point::new(3.0, 0.0),
            Point::new(3.0, 3.0),
            Point::new(2.0, 3.0),
            Point::new(2.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 3.0),
            Point::new(0.0, 3.0),
        ];
        assert!(point_in_polygon(Point::new(0.5, 2.0), &ring));
        assert!(!point_in_polygon(Point::new(1.5, 2.0), &ring));
    }

    #[test]
    fn crossing_segments_intersect() {
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 0.0),
        ));
    }

    #[test]
    fn touching_and_collinear_segments_intersect() {
        // Endpoint touch
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(2.0, 1.0),
        ));
        // Collinear overlap
        assert!(segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(3.0, 0.0),
        ));
        // Collinear but disjoint
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(3.0, 0.0),
        ));
    }

    #[test]
    fn parallel_segments_do_not_intersect() {
        assert!(!segments_intersect(
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 1.0),
        ));
    }

    #[test]
    fn disjoint_squares_do_not_intersect() {
        let a = square(0.0, 0.0, 1.0);
        let b = square(2.0, 2.0, 1.0);
        assert!(!polygons_intersect(&a, &b));
        assert!(!polygons_intersect(&b, &a));
    }

    #[test]
    fn overlapping_squares_intersect() {
        let a = square(0.0, 0.0, 1.0);
        let b = square(0.5, 0.5, 1.0);
        assert!(polygons_intersect(&a, &b));
        assert!(polygons_intersect(&b, &a));
    }

    #[test]
    fn containment_intersects_both_ways() {
        let outer = square(0.0, 0.0, 10.0);
        let inner = square(4.0, 4.0, 1.0);
        assert!(polygons_intersect(&outer, &inner));
        assert!(polygons_intersect(&inner, &outer));
    }

    #[test]
    fn cross_shape_without_contained_vertices_intersects() {
        // Horizontal and vertical bars forming a plus sign
        let horizontal = vec![
            Point::new(0.0, 1.0),
            Point::new(3.0, 1.0),
            Point::new(3.0, 2.0),
            Point::new(0.0, 2.0),
        ];
        let vertical = vec![
            Point::new(1.0, 0.0),
            Point::new(2.0, 0.0),
            Point::new(2.0, 3.0),
            Point::new(1.0, 3.0),
        ];
        assert!(polygons_intersect(&horizontal, &vertical));
        assert!(polygons_intersect(&vertical, &horizontal));
    }

    #[test]
    fn squares_sharing_an_edge_touch() {
        let a = square(0.0, 0.0, 1.0);
        let b = square(1.0, 0.0, 1.0);
        assert!(polygons_intersect(&a, &b));
    }

    #[test]
    fn degenerate_rings_never_intersect() {
        let a = square(0.0, 0.0, 1.0);
        let line = vec![Point::new(-1.0, 0.5), Point::new(2.0, 0.5)];
        assert!(!polygons_intersect(&a, &line));
        assert!(!polygons_intersect(&line, &a));
        assert!(!polygons_intersect(&[], &a));

        let repeated = vec![Point::new(0.5, 0.5), Point::new(0.6, 0.6), Point::new(0.5, 0.5)];
        assert!(!polygons_intersect(&a, &repeated));
    }

    #[test]
    fn symmetry_over_sample_rings() {
        let rings = vec![
            square(0.0, 0.0, 1.0),
            square(0.5, 0.5, 1.0),
            square(5.0, 5.0, 1.0),
            square(-2.0, -2.0, 10.0),
            vec![Point::new(0.0, 0.0), Point::new(4.0, 0.0), Point::new(2.0, 3.0)],
            vec![Point::new(1.0, 1.0), Point::new(2.0, 2.0)],
        ];
        for a in &rings {
            for b in &rings {
                assert_eq!(polygons_intersect(a, b), polygons_intersect(b, a));
            }
        }
    }
}
