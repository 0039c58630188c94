//! Per-face sub-image extraction.
//!
//! Every output crop remembers the index of the box it came from. Boxes that
//! collapse to zero area after clamping are reported separately, so the crop
//! list is not dense with respect to the input boxes.

use crate::types::BoundingBox;
use image::{imageops, RgbImage};

/// An independently owned sub-image for one input box.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    /// Position of the source box in the input slice.
    pub index: usize,
    /// The box after clamping to the image bounds.
    pub bbox: BoundingBox,
    pub image: RgbImage,
}

/// Result of cropping a list of boxes.
#[derive(Debug, Default)]
pub struct Crops {
    /// Successful crops, in input order.
    pub faces: Vec<FaceCrop>,
    /// Input indices whose box collapsed to zero width or height.
    pub degenerate: Vec<usize>,
}

/// Clamp a box to `width × height`. Returns `None` if nothing is left.
pub fn clamp_box(bbox: &BoundingBox, width: u32, height: u32) -> Option<BoundingBox> {
    let w = i32::try_from(width).unwrap_or(i32::MAX);
    let h = i32::try_from(height).unwrap_or(i32::MAX);

    let left = bbox.left.clamp(0, w);
    let right = bbox.right.clamp(0, w);
    let top = bbox.top.clamp(0, h);
    let bottom = bbox.bottom.clamp(0, h);

    if right <= left || bottom <= top {
        return None;
    }

    Some(BoundingBox {
        top,
        right,
        bottom,
        left,
        confidence: bbox.confidence,
        landmarks: bbox.landmarks,
    })
}

/// Crop one sub-image per box, preserving box order.
pub fn crop_faces(image: &RgbImage, boxes: &[BoundingBox]) -> Crops {
    let mut crops = Crops::default();

    for (index, bbox) in boxes.iter().enumerate() {
        let Some(clamped) = clamp_box(bbox, image.width(), image.height()) else {
            tracing::warn!(index, ?bbox, "crop collapsed to zero area, skipping");
            crops.degenerate.push(index);
            continue;
        };

        let sub = imageops::crop_imm(
            image,
            clamped.left as u32,
            clamped.top as u32,
            clamped.width() as u32,
            clamped.height() as u32,
        )
        .to_image();

        crops.faces.push(FaceCrop {
            index,
            bbox: clamped,
            image: sub,
        });
    }

    crops
}
