//! Landmark alignment onto the 96x96 embedding template.

use image::{imageops, GrayImage, Luma};

/// Side of the aligned face crop the embedding network expects.
pub const ALIGNED_SIZE: u32 = 96;

/// Eyes, nose tip and mouth corners of the canonical 96x96 face.
const TEMPLATE_96: [(f32, f32); 5] = [
    (32.8239, 44.3111),
    (63.0273, 44.1441),
    (48.0216, 61.4885),
    (35.6137, 79.1704),
    (60.6256, 79.0321),
];

/// Rotation, uniform scale and translation:
/// `(x, y) -> (a*x - b*y + tx, b*x + a*y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares similarity taking the `from` points onto `to`.
    /// `None` when the `from` points all coincide.
    pub fn estimate(from: &[(f32, f32); 5], to: &[(f32, f32); 5]) -> Option<Self> {
        let (fx, fy) = centroid(from);
        let (gx, gy) = centroid(to);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(x, y), &(u, v)) in from.iter().zip(to) {
            let (x, y, u, v) = (x - fx, y - fy, u - gx, v - gy);
            dot += x * u + y * v;
            cross += x * v - y * u;
            norm += x * x + y * y;
        }
        if norm < f32::EPSILON {
            return None;
        }

        let (a, b) = (dot / norm, cross / norm);
        Some(Self {
            a,
            b,
            tx: gx - (a * fx - b * fy),
            ty: gy - (b * fx + a * fy),
        })
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < f32::EPSILON {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    let n = points.len() as f32;
    (sx / n, sy / n)
}

/// Warp the face with the given landmarks onto the template.
///
/// Output pixels that map outside the frame are black. `None` when the
/// landmarks are degenerate.
pub fn align_face(frame: &GrayImage, landmarks: &[(f32, f32); 5]) -> Option<GrayImage> {
    let to_frame = Similarity::estimate(landmarks, &TEMPLATE_96)?.inverse()?;
    Some(GrayImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |x, y| {
        let (sx, sy) = to_frame.apply((x as f32, y as f32));
        imageops::interpolate_bilinear(frame, sx, sy).unwrap_or(Luma([0]))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-2 && (a.1 - b.1).abs() < 1e-2
    }

    #[test]
    fn test_identity_estimate() {
        let s = Similarity::estimate(&TEMPLATE_96, &TEMPLATE_96).unwrap();
        assert!((s.a - 1.0).abs() < 1e-4);
        assert!(s.b.abs() < 1e-4);
        assert!(s.tx.abs() < 1e-3 && s.ty.abs() < 1e-3);
    }

    #[test]
    fn test_estimate_recovers_scale_and_rotation() {
        // template scaled by 2, rotated 90 degrees, shifted
        let from = TEMPLATE_96.map(|(x, y)| (-2.0 * y + 300.0, 2.0 * x + 10.0));
        let s = Similarity::estimate(&from, &TEMPLATE_96).unwrap();
        for (p, q) in from.iter().zip(TEMPLATE_96.iter()) {
            assert!(close(s.apply(*p), *q), "{:?} -> {:?}, want {q:?}", p, s.apply(*p));
        }
        assert!((s.a.hypot(s.b) - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_inverse_round_trip() {
        let from = TEMPLATE_96.map(|(x, y)| (1.5 * x + 20.0, 1.5 * y - 7.0));
        let s = Similarity::estimate(&from, &TEMPLATE_96).unwrap();
        let inv = s.inverse().unwrap();
        let p = (123.0, 45.0);
        assert!(close(inv.apply(s.apply(p)), p));
    }

    #[test]
    fn test_degenerate_landmarks() {
        assert!(Similarity::estimate(&[(5.0, 5.0); 5], &TEMPLATE_96).is_none());
        let frame = GrayImage::new(64, 64);
        assert!(align_face(&frame, &[(5.0, 5.0); 5]).is_none());
    }

    #[test]
    fn test_align_moves_eye_onto_template() {
        let landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        let mut frame = GrayImage::new(200, 200);
        for y in 58..=62 {
            for x in 78..=82 {
                frame.put_pixel(x, y, Luma([255]));
            }
        }

        let aligned = align_face(&frame, &landmarks).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));

        let (ex, ey) = TEMPLATE_96[0];
        let (ex, ey) = (ex.round() as u32, ey.round() as u32);
        let brightest = (ey - 1..=ey + 1)
            .flat_map(|y| (ex - 1..=ex + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(brightest > 100, "left eye region max {brightest}");
        // far corner maps outside the bright patch
        assert_eq!(aligned.get_pixel(95, 0).0[0], 0);
    }
}
