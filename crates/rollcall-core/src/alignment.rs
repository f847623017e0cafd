//! Face alignment to the canonical ArcFace crop.
//!
//! A 4-DOF similarity transform (scale, rotation, translation) is fitted from
//! the five detected landmarks to the InsightFace reference positions, then the
//! luma frame is warped into a 112×112 crop.

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Forward mapping `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit of `src` onto `dst`.
    ///
    /// Each point pair contributes two rows to an overdetermined system in
    /// `[a, b, tx, ty]`, solved through the 4×4 normal equations.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut ata = [[0.0f32; 4]; 4];
        let mut atb = [0.0f32; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
            for (row, rhs) in rows {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve_normal_equations(ata, atb) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse mapping, `None` when the transform is degenerate.
    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det.abs() < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        // inverse translation: -R⁻¹ t
        let tx = -(a * self.tx - b * self.ty);
        let ty = -(b * self.tx + a * self.ty);
        Some(Self { a, b, tx, ty })
    }
}

/// Gaussian elimination with partial pivoting on the augmented 4×5 system.
fn solve_normal_equations(ata: [[f32; 4]; 4], atb: [f32; 4]) -> Option<[f32; 4]> {
    let mut m = [[0.0f32; 5]; 4];
    for (row, (lhs, rhs)) in m.iter_mut().zip(ata.iter().zip(atb)) {
        row[..4].copy_from_slice(lhs);
        row[4] = rhs;
    }

    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Warp a luma frame through `transform` into a square `out_size` crop.
///
/// Bilinear sampling; pixels mapping outside the frame are black.
pub fn warp(
    frame: &[u8],
    width: usize,
    height: usize,
    transform: &SimilarityTransform,
    out_size: usize,
) -> Vec<u8> {
    let Some(inverse) = transform.invert() else {
        return vec![0u8; out_size * out_size];
    };

    let sample = |x: i32, y: i32| -> f32 {
        if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
            frame.get(y as usize * width + x as usize).copied().unwrap_or(0) as f32
        } else {
            0.0
        }
    };

    let mut output = vec![0u8; out_size * out_size];
    for (idx, px) in output.iter_mut().enumerate() {
        let (ox, oy) = ((idx % out_size) as f32, (idx / out_size) as f32);
        let (sx, sy) = inverse.apply((ox, oy));

        let (x0, y0) = (sx.floor() as i32, sy.floor() as i32);
        let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

        let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;

        *px = val.round().clamp(0.0, 255.0) as u8;
    }
    output
}

/// Align a detected face to the canonical 112×112 ArcFace crop.
pub fn align_face(frame: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let transform = SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS);
    warp(frame, width as usize, height as usize, &transform, ALIGNED_SIZE)
}
