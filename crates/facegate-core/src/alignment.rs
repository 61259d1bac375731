//! Face alignment via 4-DOF similarity transform.
//!
//! Maps the five detected landmarks onto the InsightFace reference layout
//! and warps the photo into the 112×112 RGB crop ArcFace expects.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit from `src` to `dst`.
    ///
    /// Closed form: after centering both point sets, the rotation-scale
    /// part is the normalized cross-correlation; translation aligns the centroids.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let centroid = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (scx, scy) = centroid(src);
        let (dcx, dcy) = centroid(dst);

        let mut dot = 0.0f32;
        let mut cross = 0.0f32;
        let mut src_var = 0.0f32;
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy) = (sx - scx, sy - scy);
            let (dx, dy) = (dx - dcx, dy - dcy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            src_var += sx * sx + sy * sy;
        }

        if src_var < 1e-12 {
            // Degenerate landmarks: fall back to a pure translation.
            return Self { a: 1.0, b: 0.0, tx: dcx - scx, ty: dcy - scy };
        }

        let a = dot / src_var;
        let b = cross / src_var;
        Self {
            a,
            b,
            tx: dcx - (a * scx - b * scy),
            ty: dcy - (b * scx + a * scy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse mapping, `None` if the transform collapses the plane.
    fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Bilinear sample; pixels outside the image read as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i64, yi: i64| -> [f32; 3] {
        if xi >= 0 && xi < w && yi >= 0 && yi < h {
            let Rgb(p) = *image.get_pixel(xi as u32, yi as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy
    })
}

/// Warp `image` through `transform` into an `out_size`×`out_size` crop.
fn warp(image: &RgbImage, transform: &Similarity, out_size: u32) -> RgbImage {
    let Some(inverse) = transform.invert() else {
        return RgbImage::new(out_size, out_size);
    };
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let (sx, sy) = inverse.apply((ox as f32, oy as f32));
        let v = sample(image, sx, sy);
        Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8))
    })
}

/// Align a detected face to a canonical 112×112 RGB crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112);
    warp(image, &transform, ALIGNED_SIZE)
}
