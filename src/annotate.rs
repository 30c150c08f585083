//! Detection overlays and transport encoding for annotated images.

use anyhow::{Context, Result};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, Detection};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;
const BOX_THICKNESS: i32 = 3;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;
const LABEL_PADDING: i32 = 2;
const LABEL_HEIGHT: i32 = GLYPH_HEIGHT + LABEL_PADDING * 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const PALETTE: [Rgb<u8>; 10] = [
    Rgb([255, 56, 56]),
    Rgb([255, 157, 151]),
    Rgb([255, 112, 31]),
    Rgb([255, 178, 29]),
    Rgb([207, 210, 49]),
    Rgb([72, 249, 10]),
    Rgb([26, 147, 52]),
    Rgb([0, 194, 255]),
    Rgb([52, 69, 147]),
    Rgb([203, 56, 255]),
];

/// How each box is captioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelStyle {
    /// `car 0.87`
    ClassAndConfidence,
    /// `Car 1`, `Car 2`, ... in detection order.
    Index,
}

/// Draw every detection on a copy of `image`. The input is left untouched
/// and the result has the same dimensions.
pub fn annotate(image: &RgbImage, detections: &[Detection], style: LabelStyle) -> RgbImage {
    let mut canvas = image.clone();
    let (width, height) = canvas.dimensions();
    for (i, det) in detections.iter().enumerate() {
        let bbox = det.bbox.clamp_to(width, height);
        if !bbox.is_valid() {
            continue;
        }
        let color = class_color(det.class_id);
        let (x, y, w, h) = pixel_rect(&bbox);
        draw_box(&mut canvas, x, y, w, h, color);

        let text = match style {
            LabelStyle::ClassAndConfidence => format!("{} {:.2}", det.label, det.confidence),
            LabelStyle::Index => format!("Car {}", i + 1),
        };
        let label_y = if y - LABEL_HEIGHT >= 0 {
            y - LABEL_HEIGHT
        } else {
            y + BOX_THICKNESS
        };
        draw_label(&mut canvas, &text, x, label_y, color);
    }
    canvas
}

pub fn class_color(class_id: usize) -> Rgb<u8> {
    PALETTE[class_id % PALETTE.len()]
}

/// Encode as baseline JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
        .encode_image(image)
        .context("failed to encode annotated image")?;
    Ok(buf)
}

pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// JPEG-encode and base64 the image for embedding in a JSON payload.
pub fn encode_for_transport(image: &RgbImage, quality: u8) -> Result<String> {
    encode_jpeg(image, quality).map(|jpeg| to_base64(&jpeg))
}

fn pixel_rect(bbox: &BoundingBox) -> (i32, i32, u32, u32) {
    let x1 = bbox.x1.floor() as i32;
    let y1 = bbox.y1.floor() as i32;
    let x2 = (bbox.x2.ceil() as i32).max(x1 + 1);
    let y2 = (bbox.y2.ceil() as i32).max(y1 + 1);
    (x1, y1, (x2 - x1) as u32, (y2 - y1) as u32)
}

// Thickness grows inward so the outline never leaves the box.
fn draw_box(img: &mut RgbImage, x: i32, y: i32, width: u32, height: u32, color: Rgb<u8>) {
    for t in 0..BOX_THICKNESS {
        let inset = (t * 2) as u32;
        if width <= inset || height <= inset {
            break;
        }
        let rect = Rect::at(x + t, y + t).of_size(width - inset, height - inset);
        draw_hollow_rect_mut(img, rect, color);
    }
}

fn draw_label(img: &mut RgbImage, text: &str, x: i32, y: i32, bg: Rgb<u8>) {
    let chars: Vec<char> = text.to_uppercase().chars().collect();
    let label_width = chars.len() as i32 * GLYPH_ADVANCE + LABEL_PADDING * 2 - 1;
    for dy in 0..LABEL_HEIGHT {
        for dx in 0..label_width {
            put_clipped(img, x + dx, y + dy, bg);
        }
    }

    for (i, ch) in chars.iter().enumerate() {
        let origin_x = x + LABEL_PADDING + i as i32 * GLYPH_ADVANCE;
        let origin_y = y + LABEL_PADDING;
        for (row, bits) in glyph(*ch).iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if (bits >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                    put_clipped(img, origin_x + col, origin_y + row as i32, TEXT_COLOR);
                }
            }
        }
    }
}

fn put_clipped(img: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// 5x7 bitmap glyphs, one byte per row, high bit on the left.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        ' ' => [0x00; 7],
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}
