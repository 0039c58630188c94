//! Face alignment via a 4-DOF similarity transform (scale, rotation, translation).
//!
//! Detected landmarks are mapped onto the five ArcFace reference points and the
//! face is warped into a canonical 112×112 RGB crop.

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

/// Row-major 2×3 similarity matrix `[a, -b, tx, b, a, ty]`.
type Similarity = [f32; 6];

/// Least-squares similarity transform taking `src` points onto `dst` points.
///
/// Closed form on centered coordinates: with `p = src - mean(src)` and
/// `q = dst - mean(dst)`, `a = Σ(p·q) / Σ|p|²`, `b = Σ(p×q) / Σ|p|²`.
fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let mean = |pts: &[(f32, f32); 5]| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / 5.0, sy / 5.0)
    };
    let (scx, scy) = mean(src);
    let (dcx, dcy) = mean(dst);

    let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (px, py) = (sx - scx, sy - scy);
        let (qx, qy) = (dx - dcx, dy - dcy);
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        norm += px * px + py * py;
    }

    if norm < 1e-12 {
        // All landmarks coincide: translate only.
        return [1.0, 0.0, dcx - scx, 0.0, 1.0, dcy - scy];
    }

    let a = dot / norm;
    let b = cross / norm;
    let tx = dcx - (a * scx - b * scy);
    let ty = dcy - (b * scx + a * scy);
    [a, -b, tx, b, a, ty]
}

/// Bilinear RGB sample; out-of-bounds neighbours read as black.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let fetch = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr) = (fetch(x0, y0), fetch(x0 + 1, y0));
    let (bl, br) = (fetch(x0, y0 + 1), fetch(x0 + 1, y0 + 1));

    Rgb(std::array::from_fn(|c| {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }))
}

/// Warp `image` by the inverse of `m` into an `out_size`² crop.
fn warp_similarity(image: &RgbImage, m: &Similarity, out_size: u32) -> RgbImage {
    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }

    // Inverse of [[a, -b], [b, a]] is [[a, b], [-b, a]] / det.
    let (ia, ib) = (a / det, b / det);
    RgbImage::from_fn(out_size, out_size, |ox, oy| {
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        sample_bilinear(image, ia * dx + ib * dy, -ib * dx + ia * dy)
    })
}

/// Align a face to a canonical 112×112 crop from its five landmarks.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let m = estimate_similarity(landmarks, &REFERENCE_LANDMARKS_112);
    warp_similarity(image, &m, ALIGNED_SIZE)
}
