use image::{Rgb, RgbImage};

use super::font;
use crate::Detection;

pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const AUTHORIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNAUTHORIZED_COLOR: Rgb<u8> = Rgb([255, 165, 0]);

const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: u32 = 3;
const LABEL_PADDING: u32 = 2;

/// Box color: red for unknown, green for authorized, orange otherwise.
pub fn box_color(detection: &Detection) -> Rgb<u8> {
    if !detection.is_known() {
        UNKNOWN_COLOR
    } else if detection.authorized {
        AUTHORIZED_COLOR
    } else {
        UNAUTHORIZED_COLOR
    }
}

fn label_color(detection: &Detection) -> Rgb<u8> {
    if detection.is_known() && detection.authorized {
        BLACK
    } else {
        WHITE
    }
}

fn text_scale(image: &RgbImage) -> u32 {
    if image.width() >= 640 {
        2
    } else {
        1
    }
}

/// Draw boxes, labels, authorization dots and the accuracy badge.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        draw_detection(image, detection);
    }
    draw_accuracy(image, detections);
}

fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let (width, height) = image.dimensions();
    let bbox = detection.bounding_box.clamped(width, height);
    if bbox.width() == 0 || bbox.height() == 0 {
        return;
    }
    let color = box_color(detection);
    outline(image, bbox.left, bbox.top, bbox.right, bbox.bottom, color);

    let scale = text_scale(image);
    let label = detection.label();
    let band_w = font::text_width(&label, scale) + 2 * LABEL_PADDING;
    let band_h = font::text_height(scale) + 2 * LABEL_PADDING;
    // above the box, or below it when there is no room
    let band_top = if bbox.top >= band_h + 2 {
        bbox.top - band_h - 2
    } else {
        bbox.bottom + 2
    };
    fill(image, bbox.left, band_top, bbox.left + band_w, band_top + band_h, color);
    font::draw_text(
        image,
        (bbox.left + LABEL_PADDING) as i64,
        (band_top + LABEL_PADDING) as i64,
        &label,
        label_color(detection),
        scale,
    );

    if detection.is_known() {
        let radius = 3 * scale;
        let cx = bbox.right.saturating_sub(radius + 3) as i64;
        let cy = (bbox.top + radius + 3) as i64;
        let (dot, ring) = if detection.authorized {
            (AUTHORIZED_COLOR, BLACK)
        } else {
            (UNKNOWN_COLOR, WHITE)
        };
        disc(image, cx, cy, radius as i64 + 1, ring);
        disc(image, cx, cy, radius as i64, dot);
    }
}

fn draw_accuracy(image: &mut RgbImage, detections: &[Detection]) {
    let best = detections
        .iter()
        .filter(|d| d.is_known())
        .map(|d| d.confidence)
        .fold(0.0_f32, f32::max);
    if best <= 0.0 {
        return;
    }
    let scale = text_scale(image);
    let text = format!("ACCURACY: {:.1}%", best * 100.0);
    let (width, height) = image.dimensions();
    let text_w = font::text_width(&text, scale);
    let text_h = font::text_height(scale);
    let right = width.saturating_sub(4);
    let bottom = height.saturating_sub(4);
    let left = right.saturating_sub(text_w + 2 * LABEL_PADDING);
    let top = bottom.saturating_sub(text_h + 2 * LABEL_PADDING);
    fill(image, left, top, right, bottom, BLACK);
    font::draw_text(
        image,
        (left + LABEL_PADDING) as i64,
        (top + LABEL_PADDING) as i64,
        &text,
        WHITE,
        scale,
    );
}

/// Filled rectangle `[x0, x1) x [y0, y1)`, clipped.
fn fill(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb<u8>) {
    let x1 = x1.min(image.width());
    let y1 = y1.min(image.height());
    for y in y0..y1 {
        for x in x0..x1 {
            image.put_pixel(x, y, color);
        }
    }
}

fn outline(image: &mut RgbImage, left: u32, top: u32, right: u32, bottom: u32, color: Rgb<u8>) {
    let t = BOX_THICKNESS;
    fill(image, left, top, right, top + t, color);
    fill(image, left, bottom.saturating_sub(t), right, bottom, color);
    fill(image, left, top, left + t, bottom, color);
    fill(image, right.saturating_sub(t), top, right, bottom, color);
}

fn disc(image: &mut RgbImage, cx: i64, cy: i64, radius: i64, color: Rgb<u8>) {
    let (width, height) = (image.width() as i64, image.height() as i64);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 && x < width && y < height {
                image.put_pixel(x as u32, y as u32, color);
            }
        }
    }
}
