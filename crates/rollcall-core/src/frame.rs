//! Frame type and contrast enhancement (CLAHE on luma).

use image::RgbImage;

const CLAHE_TILES: usize = 8;
const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// A decoded color camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self { image, sequence }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Normalize contrast of a color frame in place.
///
/// Splits into BT.601 luma/chroma, equalizes luma with CLAHE (8×8 tiles,
/// clip limit 2.0) and recombines. Chroma is left untouched, so hue is
/// preserved. Deterministic and stateless.
pub fn enhance(image: &mut RgbImage) {
    let (w, h) = image.dimensions();
    let mut luma = Vec::with_capacity((w * h) as usize);
    let mut chroma = Vec::with_capacity((w * h) as usize);

    for px in image.pixels() {
        let [r, g, b] = px.0;
        let (y, cb, cr) = rgb_to_ycbcr(r, g, b);
        luma.push(y.round().clamp(0.0, 255.0) as u8);
        chroma.push((cb, cr));
    }

    clahe(&mut luma, w as usize, h as usize, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    for ((px, &y), &(cb, cr)) in image.pixels_mut().zip(luma.iter()).zip(chroma.iter()) {
        px.0 = ycbcr_to_rgb(y as f32, cb, cr);
    }
}

fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = -0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y, cb, cr)
}

fn ycbcr_to_rgb(y: f32, cb: f32, cr: f32) -> [u8; 3] {
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Contrast-Limited Adaptive Histogram Equalization on a single plane.
///
/// `clip_limit` is relative to the mean bin height, so 2.0 lets a bin hold
/// twice the pixels of a perfectly flat histogram before clipping. Tile
/// CDFs are blended bilinearly.
pub fn clahe(plane: &mut [u8], w: usize, h: usize, tiles: usize, clip_limit: f32) {
    if w == 0 || h == 0 || tiles == 0 || plane.len() < w * h {
        return;
    }

    let tile_w = w / tiles;
    let tile_h = h / tiles;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tiles * tiles);

    for row in 0..tiles {
        for col in 0..tiles {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for &p in &plane[y * w + x0..y * w + x0 + tile_w] {
                    hist[p as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
                acc += count as f32;
                *slot = acc;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    let last = (tiles - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(tiles - 1);
        let dy = fy - r0 as f32;

        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(tiles - 1);
            let dx = fx - c0 as f32;

            let pixel = plane[y * w + x] as usize;
            let top = cdfs[r0 * tiles + c0][pixel] * (1.0 - dx) + cdfs[r0 * tiles + c1][pixel] * dx;
            let bot = cdfs[r1 * tiles + c0][pixel] * (1.0 - dx) + cdfs[r1 * tiles + c1][pixel] * dx;

            plane[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}
