//! Frame enhancement before detection: luma CLAHE, sharpening and contrast.
//!
//! Nothing here resizes: the enhanced frame keeps the submitted dimensions,
//! so detected boxes are already in the caller's coordinate space.

use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ImageResult, Rgb, RgbImage};

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 2.0;
const SHARPNESS_FACTOR: f32 = 1.2;
const CONTRAST_FACTOR: f32 = 1.05;
/// 3x3 smoothing kernel the sharpness blend is measured against.
const SMOOTH_KERNEL: [f32; 9] = [
    1.0 / 13.0, 1.0 / 13.0, 1.0 / 13.0,
    1.0 / 13.0, 5.0 / 13.0, 1.0 / 13.0,
    1.0 / 13.0, 1.0 / 13.0, 1.0 / 13.0,
];
pub const DEFAULT_CROP_PADDING: f32 = 0.15;
pub const CROP_JPEG_QUALITY: u8 = 90;

/// Full enhancement chain applied to every submitted frame.
pub fn enhance_for_detection(image: &RgbImage) -> RgbImage {
    let equalized = clahe_luma(image);
    let sharpened = sharpen(&equalized, SHARPNESS_FACTOR);
    adjust_contrast(&sharpened, CONTRAST_FACTOR)
}

/// Equalize the luma channel only, leaving chroma untouched.
pub fn clahe_luma(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut luma = Vec::with_capacity((width * height) as usize);
    let mut chroma = Vec::with_capacity((width * height) as usize);

    for px in image.pixels() {
        let (y, cr, cb) = rgb_to_ycrcb(px);
        luma.push(y);
        chroma.push((cr, cb));
    }

    clahe_enhance(&mut luma, width, height, CLAHE_TILES, CLAHE_CLIP_LIMIT);

    RgbImage::from_fn(width, height, |x, y| {
        let i = (y * width + x) as usize;
        let (cr, cb) = chroma[i];
        ycrcb_to_rgb(luma[i], cr, cb)
    })
}

/// Contrast-Limited Adaptive Histogram Equalization on an 8-bit plane, in place.
///
/// `clip_limit` is a multiple of the uniform bin height (`tile_pixels / 256`),
/// so 2.0 allows each bin at most twice its share before redistribution.
/// Tile CDFs are bilinearly interpolated between tile centres.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || tiles == 0 || gray.len() < w * h {
        return;
    }

    let tx = tiles as usize;
    let ty = tiles as usize;
    let tile_w = w / tx;
    let tile_h = h / ty;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let mut hist = [0u32; 256];
            let y0 = row * tile_h;
            let x0 = col * tile_w;

            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    hist[gray[y * w + x] as usize] += 1;
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
            cdf[0] = hist[0] as f32;
            for i in 1..256 {
                cdf[i] = cdf[i - 1] + hist[i] as f32;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = (tile_pixels as f32) - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            } else {
                // Flat tile: identity mapping.
                for (i, v) in cdf.iter_mut().enumerate() {
                    *v = i as f32;
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = gray[y * w + x] as usize;

            let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (ty - 1) as f32);
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = cdfs[r0 * tx + c0][pixel];
            let tr = cdfs[r0 * tx + c1][pixel];
            let bl = cdfs[r1 * tx + c0][pixel];
            let br = cdfs[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            gray[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Sharpen by extrapolating away from a smoothed copy.
///
/// `factor` 1.0 returns the input; larger values sharpen.
pub fn sharpen(image: &RgbImage, factor: f32) -> RgbImage {
    let (width, height) = image.dimensions();
    // No interior pixels to filter.
    if width < 3 || height < 3 {
        return image.clone();
    }
    let smooth: RgbImage = imageops::filter3x3(image, &SMOOTH_KERNEL);

    RgbImage::from_fn(width, height, |x, y| {
        let orig = image.get_pixel(x, y);
        // Border pixels are not filtered.
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            return *orig;
        }
        let soft = smooth.get_pixel(x, y);
        Rgb(std::array::from_fn(|c| blend(soft[c] as f32, orig[c] as f32, factor)))
    })
}

/// Scale each channel's distance from the mean grey level by `factor`.
pub fn adjust_contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let count = image.width() as usize * image.height() as usize;
    if count == 0 {
        return image.clone();
    }
    let sum: f32 = image.pixels().map(luminance).sum();
    let mean = (sum / count as f32 + 0.5).floor();

    let mut out = image.clone();
    for px in out.pixels_mut() {
        for c in 0..3 {
            px[c] = blend(mean, px[c] as f32, factor);
        }
    }
    out
}

/// Crop a `[top, right, bottom, left]` box grown by `padding` on every side,
/// clamped to the image, then enhanced.
///
/// Returns `None` when the clamped box has no area, e.g. a detection that
/// lies entirely outside the frame.
pub fn crop_face(image: &RgbImage, trbl: [i32; 4], padding: f32) -> Option<RgbImage> {
    let [top, right, bottom, left] = trbl;
    let (width, height) = image.dimensions();
    let pad_h = ((bottom - top) as f32 * padding) as i32;
    let pad_w = ((right - left) as f32 * padding) as i32;

    let t = (top - pad_h).clamp(0, height as i32) as u32;
    let l = (left - pad_w).clamp(0, width as i32) as u32;
    let b = (bottom + pad_h).clamp(0, height as i32) as u32;
    let r = (right + pad_w).clamp(0, width as i32) as u32;

    if r <= l || b <= t {
        return None;
    }

    let crop = imageops::crop_imm(image, l, t, r - l, b - t).to_image();
    let sharpened = sharpen(&clahe_luma(&crop), SHARPNESS_FACTOR);
    Some(adjust_contrast(&sharpened, CONTRAST_FACTOR))
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

fn blend(base: f32, value: f32, factor: f32) -> u8 {
    (base + factor * (value - base)).round().clamp(0.0, 255.0) as u8
}

fn luminance(px: &Rgb<u8>) -> f32 {
    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32
}

// BT.601 full-range YCrCb.
fn rgb_to_ycrcb(px: &Rgb<u8>) -> (u8, f32, f32) {
    let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cr = (r - y) * 0.713 + 128.0;
    let cb = (b - y) * 0.564 + 128.0;
    (y.round().clamp(0.0, 255.0) as u8, cr, cb)
}

fn ycrcb_to_rgb(y: u8, cr: f32, cb: f32) -> Rgb<u8> {
    let y = y as f32;
    let r = y + 1.403 * (cr - 128.0);
    let g = y - 0.714 * (cr - 128.0) - 0.344 * (cb - 128.0);
    let b = y + 1.773 * (cb - 128.0);
    Rgb([
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ])
}
