//! Face alignment onto the canonical ArcFace crop.
//!
//! The five detected landmarks are mapped onto the InsightFace reference
//! constellation with a least-squares 4-DOF similarity transform (scale,
//! rotation, translation), then the face is warped into a 112×112 crop.

use image::GrayImage;

/// ArcFace reference landmarks for a 112×112 crop:
/// left eye, right eye, nose, left mouth, right mouth.
const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// 4-DOF similarity transform:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    const IDENTITY: Similarity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Map a destination point back to its source position.
    fn invert(&self, dx: f32, dy: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (ux, uy) = (dx - self.tx, dy - self.ty);
        ((self.a * ux + self.b * uy) / det, (self.a * uy - self.b * ux) / det)
    }
}

/// Least-squares similarity transform from `src` onto the reference
/// constellation, in closed form over centered coordinates.
///
/// Minimizing Σ‖M·s + t − d‖² over (a, b, tx, ty) decouples once both point
/// sets are centered: a and b come from the cross-sums, t from the centroids.
fn estimate(src: &[(f32, f32); 5]) -> Similarity {
    let n = src.len() as f32;
    let (mut sx_mean, mut sy_mean, mut dx_mean, mut dy_mean) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
    for i in 0..src.len() {
        sx_mean += src[i].0;
        sy_mean += src[i].1;
        dx_mean += REFERENCE_LANDMARKS[i].0;
        dy_mean += REFERENCE_LANDMARKS[i].1;
    }
    sx_mean /= n;
    sy_mean /= n;
    dx_mean /= n;
    dy_mean /= n;

    let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
    for i in 0..src.len() {
        let (sx, sy) = (src[i].0 - sx_mean, src[i].1 - sy_mean);
        let (dx, dy) = (
            REFERENCE_LANDMARKS[i].0 - dx_mean,
            REFERENCE_LANDMARKS[i].1 - dy_mean,
        );
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        norm += sx * sx + sy * sy;
    }

    if norm < 1e-12 {
        // Degenerate landmark set (all points coincide).
        return Similarity::IDENTITY;
    }

    let a = dot / norm;
    let b = cross / norm;
    Similarity {
        a,
        b,
        tx: dx_mean - (a * sx_mean - b * sy_mean),
        ty: dy_mean - (b * sx_mean + a * sy_mean),
    }
}

/// Warp a face out of `frame` into the canonical 112×112 aligned crop.
///
/// Every output pixel is pulled from the source through the inverted
/// transform with bilinear interpolation; samples outside the frame are
/// black.
pub fn align_face(frame: &GrayImage, landmarks: &[(f32, f32); 5]) -> GrayImage {
    let transform = estimate(landmarks);
    let (w, h) = frame.dimensions();
    let src = frame.as_raw();

    let sample = |x: i32, y: i32| -> f32 {
        if x >= 0 && (x as u32) < w && y >= 0 && (y as u32) < h {
            src[y as usize * w as usize + x as usize] as f32
        } else {
            0.0
        }
    };

    GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        let (sx, sy) = transform.invert(ox as f32, oy as f32);

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let value = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;

        image::Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_identity_when_already_aligned() {
        let t = estimate(&REFERENCE_LANDMARKS);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn estimate_recovers_scale() {
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| (REFERENCE_LANDMARKS[i].0 * 2.0, REFERENCE_LANDMARKS[i].1 * 2.0));
        let t = estimate(&src);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
    }

    #[test]
    fn estimate_recovers_rotation() {
        // Source rotated 90° clockwise about the origin: (x, y) -> (y, -x).
        let src: [(f32, f32); 5] =
            std::array::from_fn(|i| (REFERENCE_LANDMARKS[i].1, -REFERENCE_LANDMARKS[i].0));
        let t = estimate(&src);
        // Undoing that rotation needs a ≈ 0, b ≈ 1 (unit scale).
        assert!(t.a.abs() < 1e-3, "a = {}", t.a);
        assert!((t.b - 1.0).abs() < 1e-3, "b = {}", t.b);
    }

    #[test]
    fn estimate_degenerate_falls_back_to_identity() {
        let src = [(10.0, 10.0); 5];
        let t = estimate(&src);
        assert!((t.a - 1.0).abs() < 1e-6);
        assert!(t.b.abs() < 1e-6);
    }

    #[test]
    fn invert_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let (x, y) = (37.5f32, 90.25f32);
        let dx = t.a * x - t.b * y + t.tx;
        let dy = t.b * x + t.a * y + t.ty;
        let (rx, ry) = t.invert(dx, dy);
        assert!((rx - x).abs() < 1e-3);
        assert!((ry - y).abs() < 1e-3);
    }

    #[test]
    fn align_face_output_size() {
        let frame = GrayImage::from_pixel(640, 480, image::Luma([128]));
        let aligned = align_face(&frame, &REFERENCE_LANDMARKS);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn align_face_moves_landmark_to_reference() {
        // Paint a bright patch at the detected left-eye position and verify
        // it ends up near the reference left-eye position after alignment.
        let mut frame = GrayImage::new(200, 200);
        let src: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (src[0].0 as i64, src[0].1 as i64);
        for dy in -2..=2i64 {
            for dx in -2..=2i64 {
                let (px, py) = (lx + dx, ly + dy);
                if (0..200).contains(&px) && (0..200).contains(&py) {
                    frame.put_pixel(px as u32, py as u32, image::Luma([255]));
                }
            }
        }

        let aligned = align_face(&frame, &src);

        let ref_x = REFERENCE_LANDMARKS[0].0.round() as i64;
        let ref_y = REFERENCE_LANDMARKS[0].1.round() as i64;
        let mut max_val = 0u8;
        for dy in -1..=1i64 {
            for dx in -1..=1i64 {
                let (px, py) = (ref_x + dx, ref_y + dy);
                if (0..ALIGNED_SIZE as i64).contains(&px) && (0..ALIGNED_SIZE as i64).contains(&py) {
                    max_val = max_val.max(aligned.get_pixel(px as u32, py as u32).0[0]);
                }
            }
        }
        assert!(max_val > 100, "expected bright patch near ({ref_x}, {ref_y}), max={max_val}");
    }
}
