// SPDX-License-Identifier: GPL-3.0-only

use cgmath::{Matrix3, Point2, SquareMatrix, Vector3};

const PIVOT_EPSILON: f64 = 1e-10;

/// Source corners of the unit square, in the same order as the keystone corners.
pub const UNIT_SQUARE: [Point2<f64>; 4] = [
    Point2::new(0.0, 0.0),
    Point2::new(1.0, 0.0),
    Point2::new(0.0, 1.0),
    Point2::new(1.0, 1.0),
];

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum HomographyError {
    #[error("corner configuration is degenerate")]
    Degenerate,
}

/// A projective transform mapping the unit square onto a quadrilateral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Homography {
            matrix: Matrix3::identity(),
            inverse: Matrix3::identity(),
        }
    }

    /// Solves `H` so that `H * UNIT_SQUARE[i] ~ dst[i]` for all four corners, with `h33 = 1`.
    pub fn from_unit_square(dst: &[Point2<f64>; 4]) -> Result<Self, HomographyError> {
        // Rows for x' = (h11 x + h12 y + h13) / (h31 x + h32 y + 1), and likewise for y'.
        let mut system = [[0.0f64; 9]; 8];
        for (i, (src, dst)) in UNIT_SQUARE.iter().zip(dst.iter()).enumerate() {
            let (x, y) = (src.x, src.y);
            let (u, v) = (dst.x, dst.y);
            system[2 * i] = [x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, u];
            system[2 * i + 1] = [0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y, v];
        }
        let h = solve(system)?;

        // cgmath matrices are column major
        let matrix = Matrix3::new(h[0], h[3], h[6], h[1], h[4], h[7], h[2], h[5], 1.0);
        let inverse = matrix.invert().ok_or(HomographyError::Degenerate)?;
        if !inverse.x.x.is_finite() || !inverse.z.z.is_finite() {
            return Err(HomographyError::Degenerate);
        }

        Ok(Homography { matrix, inverse })
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Maps output positions back to source coordinates.
    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    pub fn apply(&self, point: Point2<f64>) -> Option<Point2<f64>> {
        project(&self.matrix, point)
    }

    pub fn apply_inverse(&self, point: Point2<f64>) -> Option<Point2<f64>> {
        project(&self.inverse, point)
    }

    /// The same transform, expressed for destination coordinates in pixels.
    pub fn in_pixels(&self, width: f64, height: f64) -> Matrix3<f64> {
        Matrix3::from_diagonal(Vector3::new(width, height, 1.0)) * self.matrix
    }

    /// Column-major single precision copy of the inverse, for shader uniforms.
    pub fn inverse_f32(&self) -> [f32; 9] {
        let m: &[f64; 9] = self.inverse.as_ref();
        m.map(|v| v as f32)
    }
}

fn project(matrix: &Matrix3<f64>, point: Point2<f64>) -> Option<Point2<f64>> {
    let v = matrix * Vector3::new(point.x, point.y, 1.0);
    if v.z.abs() < PIVOT_EPSILON {
        return None;
    }
    Some(Point2::new(v.x / v.z, v.y / v.z))
}

/// Gaussian elimination with partial pivoting on an augmented 8x9 system.
fn solve(mut m: [[f64; 9]; 8]) -> Result<[f64; 8], HomographyError> {
    for col in 0..8 {
        let pivot = (col..8)
            .max_by(|a, b| m[*a][col].abs().total_cmp(&m[*b][col].abs()))
            .unwrap_or(col);
        if m[pivot][col].abs() < PIVOT_EPSILON {
            return Err(HomographyError::Degenerate);
        }
        m.swap(col, pivot);

        for row in (col + 1)..8 {
            let factor = m[row][col] / m[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..9 {
                m[row][k] -= factor * m[col][k];
            }
        }
    }

    let mut result = [0.0f64; 8];
    for row in (0..8).rev() {
        let mut sum = m[row][8];
        for k in (row + 1)..8 {
            sum -= m[row][k] * result[k];
        }
        result[row] = sum / m[row][row];
    }
    Ok(result)
}

/// Projective weights for drawing the quad as two triangles without seams.
///
/// Texture coordinates multiplied by these weights (and divided again per fragment)
/// interpolate exactly like the homography does. Returns `None` for quads whose
/// diagonals do not intersect inside the quad.
pub fn quad_q_weights(corners: &[Point2<f64>; 4]) -> Option<[f64; 4]> {
    // diagonals: top-left -> bottom-right, top-right -> bottom-left
    let (p0, p1, p2, p3) = (corners[0], corners[1], corners[2], corners[3]);
    let d1 = p3 - p0;
    let d2 = p2 - p1;
    let denom = d1.x * d2.y - d1.y * d2.x;
    if denom.abs() < PIVOT_EPSILON {
        return None;
    }
    let diff = p1 - p0;
    let t = (diff.x * d2.y - diff.y * d2.x) / denom;
    let s = (diff.x * d1.y - diff.y * d1.x) / denom;
    if !(0.0..=1.0).contains(&t) || !(0.0..=1.0).contains(&s) {
        return None;
    }

    let len1 = (d1.x * d1.x + d1.y * d1.y).sqrt();
    let len2 = (d2.x * d2.x + d2.y * d2.y).sqrt();
    // distances from each corner to the intersection
    let dist = [t * len1, s * len2, (1.0 - s) * len2, (1.0 - t) * len1];
    // opposite corner along the same diagonal
    let opposite = [3, 2, 1, 0];

    let mut weights = [1.0; 4];
    for i in 0..4 {
        let other = dist[opposite[i]];
        if other <= PIVOT_EPSILON {
            return None;
        }
        weights[i] = (dist[i] + other) / other;
    }
    Some(weights)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const EPSILON: f64 = 1e-9;

    fn assert_close(a: Point2<f64>, b: Point2<f64>) {
        assert!(
            (a.x - b.x).abs() < EPSILON && (a.y - b.y).abs() < EPSILON,
            "{:?} != {:?}",
            a,
            b
        );
    }

    #[test]
    fn unit_square_is_identity() {
        let h = Homography::from_unit_square(&UNIT_SQUARE).unwrap();
        let identity = Matrix3::<f64>::identity();
        let m: &[f64; 9] = h.matrix().as_ref();
        let i: &[f64; 9] = identity.as_ref();
        for (a, b) in m.iter().zip(i.iter()) {
            assert!((a - b).abs() < EPSILON);
        }
        assert_close(
            h.apply_inverse(Point2::new(0.25, 0.75)).unwrap(),
            Point2::new(0.25, 0.75),
        );
    }

    #[test]
    fn random_quads_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x6b65_7973);
        let mut checked = 0;
        while checked < 500 {
            let jitter = |rng: &mut StdRng| rng.random_range(-0.3..0.3);
            let dst = [
                Point2::new(0.0 + jitter(&mut rng), 0.0 + jitter(&mut rng)),
                Point2::new(1.0 + jitter(&mut rng), 0.0 + jitter(&mut rng)),
                Point2::new(0.0 + jitter(&mut rng), 1.0 + jitter(&mut rng)),
                Point2::new(1.0 + jitter(&mut rng), 1.0 + jitter(&mut rng)),
            ];
            let Ok(h) = Homography::from_unit_square(&dst) else {
                continue;
            };
            for (src, dst) in UNIT_SQUARE.iter().zip(dst.iter()) {
                assert_close(h.apply(*src).unwrap(), *dst);
                assert_close(h.apply_inverse(*dst).unwrap(), *src);
            }
            checked += 1;
        }
    }

    #[test]
    fn collinear_corners_are_degenerate() {
        let dst = [
            Point2::new(0.0, 0.0),
            Point2::new(0.5, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
        ];
        assert_eq!(
            Homography::from_unit_square(&dst),
            Err(HomographyError::Degenerate)
        );
    }

    #[test]
    fn pixel_space_matches_scaled_corners() {
        let dst = [
            Point2::new(0.1, 0.05),
            Point2::new(0.95, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(0.85, 0.9),
        ];
        let h = Homography::from_unit_square(&dst).unwrap();
        let px = h.in_pixels(1920.0, 1080.0);
        for (src, dst) in UNIT_SQUARE.iter().zip(dst.iter()) {
            let v = px * Vector3::new(src.x, src.y, 1.0);
            assert_close(
                Point2::new(v.x / v.z, v.y / v.z),
                Point2::new(dst.x * 1920.0, dst.y * 1080.0),
            );
        }
    }

    #[test]
    fn q_weights_of_rectangle_are_uniform() {
        let weights = quad_q_weights(&UNIT_SQUARE).unwrap();
        for w in weights {
            assert!((w - 2.0).abs() < EPSILON);
        }
    }

    #[test]
    fn q_weights_reproduce_homography_at_centre() {
        let dst = [
            Point2::new(0.2, 0.1),
            Point2::new(0.8, 0.0),
            Point2::new(0.0, 1.0),
            Point2::new(1.0, 1.0),
        ];
        let h = Homography::from_unit_square(&dst).unwrap();
        let q = quad_q_weights(&dst).unwrap();
        // interpolate along the TL-BR diagonal at the intersection point
        let centre = h.apply(Point2::new(0.5, 0.5)).unwrap();
        let d = dst[3] - dst[0];
        let t = if d.x.abs() > d.y.abs() {
            (centre.x - dst[0].x) / d.x
        } else {
            (centre.y - dst[0].y) / d.y
        };
        let uq = (1.0 - t) * 0.0 * q[0] + t * 1.0 * q[3];
        let qq = (1.0 - t) * q[0] + t * q[3];
        assert!((uq / qq - 0.5).abs() < 1e-6);
    }
}
