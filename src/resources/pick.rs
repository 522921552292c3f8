//! Encodings written by the pick passes and decoded from the single pixel read back.
//!
//! - Pick colors carry a 24-bit mesh pick index in RGB and the model pick slot in A.
//!   An all-zero pixel is the cleared background.
//! - Depth is spread over the four 8-bit channels of an RGBA8 target.
//! - Normals are stored as `(n * 0.5 + 0.5) * 255` per component.

/// Largest mesh pick index that fits the RGB channels.
pub const MAX_PICK_INDEX: u32 = (1 << 24) - 1;

/// Identity decoded from a pick pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PickId {
    /// `mesh index + 1`, zero is reserved for the background.
    pub index: u32,
    pub slot: u8,
}

/**
 * Splits a pick index into the per-vertex pick color. The fragment shader writes it
 * unchanged so that reading the pixel back recovers the exact index.
 *
 * Indices past `MAX_PICK_INDEX` get the background color and never pick.
 */
pub fn pick_color(index: u32, slot: u8) -> [u8; 4] {
    if index > MAX_PICK_INDEX {
        return [0; 4];
    }
    let r = index as u8;
    let g = (index >> 8) as u8;
    let b = (index >> 16) as u8;
    [r, g, b, slot]
}

/// `None` for the background sentinel.
pub fn decode_pick_color(pixel: [u8; 4]) -> Option<PickId> {
    if pixel == [0; 4] {
        return None;
    }
    let index = pixel[0] as u32 | (pixel[1] as u32) << 8 | (pixel[2] as u32) << 16;
    if index == 0 {
        return None;
    }
    Some(PickId {
        index,
        slot: pixel[3],
    })
}

/// Packs a window depth in `[0, 1]` the same way `fs_packed_depth` does.
pub fn pack_depth(depth: f64) -> [u8; 4] {
    let mut rest = depth.clamp(0.0, 1.0);
    let mut out = [0u8; 4];
    for channel in out.iter_mut() {
        let scaled = (rest * 255.0).min(255.0);
        let byte = scaled.floor();
        *channel = byte as u8;
        rest = scaled - byte;
    }
    out
}

pub fn unpack_depth(pixel: [u8; 4]) -> f64 {
    pixel[0] as f64 / 255.0
        + pixel[1] as f64 / 255.0_f64.powi(2)
        + pixel[2] as f64 / 255.0_f64.powi(3)
        + pixel[3] as f64 / 255.0_f64.powi(4)
}

pub fn encode_normal(normal: [f64; 3]) -> [u8; 4] {
    let c = |v: f64| ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0).round() as u8;
    [c(normal[0]), c(normal[1]), c(normal[2]), 255]
}

/// Unnormalized; callers normalize after transforming.
pub fn decode_normal(pixel: [u8; 4]) -> [f64; 3] {
    let c = |v: u8| v as f64 / 255.0 * 2.0 - 1.0;
    [c(pixel[0]), c(pixel[1]), c(pixel[2])]
}
