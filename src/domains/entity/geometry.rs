//! Planar geometry over GeoJSON geometries.
//!
//! Only what the revisioning engine needs: parsing and structural checks,
//! bounding boxes, centroids, point-in-polygon and Douglas-Peucker
//! simplification. Coordinates are treated as planar x/y.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{DomainError, DomainResult};

pub type Coord = [f64; 2];
pub type Ring = Vec<Coord>;

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    MultiPoint(Vec<Coord>),
    LineString(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    fn from_coords<'a>(coords: impl Iterator<Item = &'a Coord>) -> Option<Self> {
        let mut bbox: Option<BoundingBox> = None;
        for c in coords {
            bbox = Some(match bbox {
                None => BoundingBox { min_x: c[0], min_y: c[1], max_x: c[0], max_y: c[1] },
                Some(b) => BoundingBox {
                    min_x: b.min_x.min(c[0]),
                    min_y: b.min_y.min(c[1]),
                    max_x: b.max_x.max(c[0]),
                    max_y: b.max_y.max(c[1]),
                },
            });
        }
        bbox
    }

    pub fn contains_point(&self, point: Coord) -> bool {
        point[0] >= self.min_x && point[0] <= self.max_x && point[1] >= self.min_y && point[1] <= self.max_y
    }
}

fn geometry_error(message: impl Into<String>) -> DomainError {
    DomainError::Geometry(message.into())
}

fn parse_coord(value: &Value) -> DomainResult<Coord> {
    let items = value.as_array().ok_or_else(|| geometry_error("position must be an array"))?;
    if items.len() < 2 {
        return Err(geometry_error("position needs at least two numbers"));
    }
    let x = items[0].as_f64().ok_or_else(|| geometry_error("x is not a number"))?;
    let y = items[1].as_f64().ok_or_else(|| geometry_error("y is not a number"))?;
    if !x.is_finite() || !y.is_finite() {
        return Err(geometry_error("position is not finite"));
    }
    Ok([x, y])
}

fn parse_line(value: &Value, min_len: usize) -> DomainResult<Vec<Coord>> {
    let items = value.as_array().ok_or_else(|| geometry_error("expected an array of positions"))?;
    let line = items.iter().map(parse_coord).collect::<DomainResult<Vec<_>>>()?;
    if line.len() < min_len {
        return Err(geometry_error(format!("expected at least {} positions, got {}", min_len, line.len())));
    }
    Ok(line)
}

fn parse_ring(value: &Value) -> DomainResult<Ring> {
    let ring = parse_line(value, 4)?;
    if ring.first() != ring.last() {
        return Err(geometry_error("polygon ring is not closed"));
    }
    Ok(ring)
}

fn parse_polygon(value: &Value) -> DomainResult<Vec<Ring>> {
    let rings = value.as_array().ok_or_else(|| geometry_error("polygon must be an array of rings"))?;
    if rings.is_empty() {
        return Err(geometry_error("polygon has no rings"));
    }
    rings.iter().map(parse_ring).collect()
}

fn parse_array<T>(value: &Value, item: impl Fn(&Value) -> DomainResult<T>) -> DomainResult<Vec<T>> {
    let items = value.as_array().ok_or_else(|| geometry_error("expected an array"))?;
    if items.is_empty() {
        return Err(geometry_error("empty multi-geometry"));
    }
    items.iter().map(item).collect()
}

impl Geometry {
    /// Parse a GeoJSON geometry object.
    pub fn from_geojson(value: &Value) -> DomainResult<Geometry> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| geometry_error("geometry has no type"))?;
        let coordinates = value
            .get("coordinates")
            .ok_or_else(|| geometry_error("geometry has no coordinates"))?;

        match kind {
            "Point" => Ok(Geometry::Point(parse_coord(coordinates)?)),
            "MultiPoint" => Ok(Geometry::MultiPoint(parse_array(coordinates, parse_coord)?)),
            "LineString" => Ok(Geometry::LineString(parse_line(coordinates, 2)?)),
            "MultiLineString" => Ok(Geometry::MultiLineString(parse_array(coordinates, |v| parse_line(v, 2))?)),
            "Polygon" => Ok(Geometry::Polygon(parse_polygon(coordinates)?)),
            "MultiPolygon" => Ok(Geometry::MultiPolygon(parse_array(coordinates, parse_polygon)?)),
            other => Err(geometry_error(format!("unsupported geometry type {}", other))),
        }
    }

    pub fn from_geojson_str(text: &str) -> DomainResult<Geometry> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_geojson(&value)
    }

    pub fn to_geojson(&self) -> Value {
        match self {
            Geometry::Point(c) => json!({"type": "Point", "coordinates": c}),
            Geometry::MultiPoint(cs) => json!({"type": "MultiPoint", "coordinates": cs}),
            Geometry::LineString(cs) => json!({"type": "LineString", "coordinates": cs}),
            Geometry::MultiLineString(ls) => json!({"type": "MultiLineString", "coordinates": ls}),
            Geometry::Polygon(rs) => json!({"type": "Polygon", "coordinates": rs}),
            Geometry::MultiPolygon(ps) => json!({"type": "MultiPolygon", "coordinates": ps}),
        }
    }

    /// Every line or ring of the geometry; points yield nothing.
    fn paths(&self) -> Vec<&Vec<Coord>> {
        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => Vec::new(),
            Geometry::LineString(line) => vec![line],
            Geometry::MultiLineString(lines) => lines.iter().collect(),
            Geometry::Polygon(rings) => rings.iter().collect(),
            Geometry::MultiPolygon(polygons) => polygons.iter().flatten().collect(),
        }
    }

    fn coords(&self) -> Vec<&Coord> {
        match self {
            Geometry::Point(c) => vec![c],
            Geometry::MultiPoint(cs) => cs.iter().collect(),
            _ => self.paths().into_iter().flatten().collect(),
        }
    }

    fn polygons(&self) -> Vec<&Vec<Ring>> {
        match self {
            Geometry::Polygon(rings) => vec![rings],
            Geometry::MultiPolygon(polygons) => polygons.iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn bbox(&self) -> Option<BoundingBox> {
        BoundingBox::from_coords(self.coords().into_iter())
    }

    pub fn area(&self) -> f64 {
        self.polygons().into_iter().map(|p| polygon_area(p)).sum()
    }

    /// Area-weighted centroid for polygons, vertex mean otherwise.
    pub fn centroid(&self) -> Option<Coord> {
        let mut weighted_x = 0.0;
        let mut weighted_y = 0.0;
        let mut total_area = 0.0;
        for polygon in self.polygons() {
            for (idx, ring) in polygon.iter().enumerate() {
                let (area, cx, cy) = ring_centroid(ring);
                let sign = if idx == 0 { 1.0 } else { -1.0 };
                weighted_x += sign * area * cx;
                weighted_y += sign * area * cy;
                total_area += sign * area;
            }
        }
        if total_area.abs() > EPSILON {
            return Some([weighted_x / total_area, weighted_y / total_area]);
        }

        let coords = self.coords();
        if coords.is_empty() {
            return None;
        }
        let n = coords.len() as f64;
        let (sx, sy) = coords.iter().fold((0.0, 0.0), |(sx, sy), c| (sx + c[0], sy + c[1]));
        Some([sx / n, sy / n])
    }

    /// Point in polygon, honouring holes. Non-areal geometries contain nothing.
    pub fn contains_point(&self, point: Coord) -> bool {
        if let Some(bbox) = self.bbox() {
            if !bbox.contains_point(point) {
                return false;
            }
        }
        self.polygons().into_iter().any(|rings| {
            let mut iter = rings.iter();
            match iter.next() {
                Some(exterior) if ring_contains(exterior, point) => !iter.any(|hole| ring_contains(hole, point)),
                _ => false,
            }
        })
    }

    /// Douglas-Peucker simplification. Rings that would collapse keep their
    /// original vertices.
    pub fn simplify(&self, tolerance: f64) -> Geometry {
        if tolerance <= 0.0 {
            return self.clone();
        }
        let line = |l: &Vec<Coord>| douglas_peucker(l, tolerance);
        let ring = |r: &Ring| {
            let simplified = douglas_peucker(r, tolerance);
            if simplified.len() < 4 { r.clone() } else { simplified }
        };
        match self {
            Geometry::Point(_) | Geometry::MultiPoint(_) => self.clone(),
            Geometry::LineString(l) => Geometry::LineString(line(l)),
            Geometry::MultiLineString(ls) => Geometry::MultiLineString(ls.iter().map(line).collect()),
            Geometry::Polygon(rs) => Geometry::Polygon(rs.iter().map(ring).collect()),
            Geometry::MultiPolygon(ps) => {
                Geometry::MultiPolygon(ps.iter().map(|rs| rs.iter().map(ring).collect()).collect())
            }
        }
    }

    /// True when any line or ring repeats a vertex consecutively.
    pub fn has_duplicate_nodes(&self) -> bool {
        self.paths()
            .into_iter()
            .any(|path| path.windows(2).any(|w| same_point(w[0], w[1])))
    }

    /// True when any single line or ring crosses itself.
    pub fn self_intersects(&self) -> bool {
        let closed = matches!(self, Geometry::Polygon(_) | Geometry::MultiPolygon(_));
        self.paths().into_iter().any(|path| path_self_intersects(path, closed))
    }

    pub fn vertex_count(&self) -> usize {
        self.coords().len()
    }
}

fn same_point(a: Coord, b: Coord) -> bool {
    (a[0] - b[0]).abs() <= EPSILON && (a[1] - b[1]).abs() <= EPSILON
}

/// Absolute area and centroid of one ring (shoelace).
fn ring_centroid(ring: &Ring) -> (f64, f64, f64) {
    let mut signed = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for w in ring.windows(2) {
        let cross = w[0][0] * w[1][1] - w[1][0] * w[0][1];
        signed += cross;
        cx += (w[0][0] + w[1][0]) * cross;
        cy += (w[0][1] + w[1][1]) * cross;
    }
    signed /= 2.0;
    if signed.abs() <= EPSILON {
        return (0.0, 0.0, 0.0);
    }
    (signed.abs(), cx / (6.0 * signed), cy / (6.0 * signed))
}

fn polygon_area(rings: &[Ring]) -> f64 {
    rings
        .iter()
        .enumerate()
        .map(|(idx, ring)| {
            let (area, _, _) = ring_centroid(ring);
            if idx == 0 { area } else { -area }
        })
        .sum()
}

fn ring_contains(ring: &Ring, point: Coord) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i][0], ring[i][1]);
        let (xj, yj) = (ring[j][0], ring[j][1]);
        if (yi > point[1]) != (yj > point[1]) {
            let x_cross = (xj - xi) * (point[1] - yi) / (yj - yi) + xi;
            if point[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn perpendicular_distance(point: Coord, start: Coord, end: Coord) -> f64 {
    let dx = end[0] - start[0];
    let dy = end[1] - start[1];
    let length = (dx * dx + dy * dy).sqrt();
    if length <= EPSILON {
        return ((point[0] - start[0]).powi(2) + (point[1] - start[1]).powi(2)).sqrt();
    }
    (dy * point[0] - dx * point[1] + end[0] * start[1] - end[1] * start[0]).abs() / length
}

// Iterative to keep deep recursion off the stack for long rings.
fn douglas_peucker(points: &[Coord], tolerance: f64) -> Vec<Coord> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;
    let mut stack = vec![(0usize, points.len() - 1)];

    while let Some((first, last)) = stack.pop() {
        let mut max_distance = 0.0;
        let mut index = first;
        for i in (first + 1)..last {
            let distance = perpendicular_distance(points[i], points[first], points[last]);
            if distance > max_distance {
                max_distance = distance;
                index = i;
            }
        }
        if max_distance > tolerance {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| if k { Some(*p) } else { None })
        .collect()
}

fn orientation(a: Coord, b: Coord, c: Coord) -> i8 {
    let value = (b[1] - a[1]) * (c[0] - b[0]) - (b[0] - a[0]) * (c[1] - b[1]);
    if value.abs() <= EPSILON {
        0
    } else if value > 0.0 {
        1
    } else {
        2
    }
}

fn on_segment(a: Coord, b: Coord, c: Coord) -> bool {
    b[0] <= a[0].max(c[0]) + EPSILON
        && b[0] >= a[0].min(c[0]) - EPSILON
        && b[1] <= a[1].max(c[1]) + EPSILON
        && b[1] >= a[1].min(c[1]) - EPSILON
}

fn segments_intersect(p1: Coord, q1: Coord, p2: Coord, q2: Coord) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && on_segment(p1, p2, q1))
        || (o2 == 0 && on_segment(p1, q2, q1))
        || (o3 == 0 && on_segment(p2, p1, q2))
        || (o4 == 0 && on_segment(p2, q1, q2))
}

fn path_self_intersects(path: &[Coord], closed: bool) -> bool {
    let segments: Vec<(Coord, Coord)> = path
        .windows(2)
        .filter(|w| !same_point(w[0], w[1]))
        .map(|w| (w[0], w[1]))
        .collect();
    let n = segments.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let adjacent = j == i + 1 || (closed && i == 0 && j == n - 1);
            if adjacent {
                continue;
            }
            let (a1, a2) = segments[i];
            let (b1, b2) = segments[j];
            if segments_intersect(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}
