//! annotate — draw player boxes and confidence tags onto a frame in place
//!
//! Each detection gets a green outline at its box bounds and a filled green
//! tag reading `Player: 0.91` in black. The tag sits just above the box's
//! top-left corner; when that would leave the frame it is drawn inside the box
//! under the top edge instead, and shifted left so it ends within the frame.

mod glyphs;

use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detection::{Detection, PixelBox};
use crate::error::Result;
use crate::video::RgbFrame;

pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
pub const TEXT_COLOR: [u8; 3] = [0, 0, 0];
/// Outline thickness in pixels, growing inward from the box bounds.
pub const STROKE_WIDTH: i32 = 2;
/// Each glyph pixel is drawn as a `GLYPH_SCALE`×`GLYPH_SCALE` block.
const GLYPH_SCALE: i32 = 2;
/// Vertical padding around the text inside the tag.
const LABEL_PAD_TOP: i32 = 5;
const LABEL_PAD_BOTTOM: i32 = 5;

pub fn label_text(detection: &Detection) -> String {
    format!("Player: {:.2}", detection.confidence)
}

/// Pixel size of `text` when rendered.
pub fn text_size(text: &str) -> (i32, i32) {
    let chars = text.chars().count() as i32;
    let advance = glyphs::ADVANCE * GLYPH_SCALE;
    let width = (chars * advance - GLYPH_SCALE).max(0);
    (width, glyphs::HEIGHT * GLYPH_SCALE)
}

/// Top-left corner of a `label_w`×`label_h` tag for `bbox` in a
/// `frame_w`×`frame_h` frame.
pub fn label_origin(bbox: &PixelBox, label_w: i32, label_h: i32, frame_w: i32, frame_h: i32) -> (i32, i32) {
    let mut top = bbox.y1 - label_h;
    if top < 0 {
        top = bbox.y1.min(frame_h - label_h).max(0);
    }
    let left = bbox.x1.min(frame_w - label_w).max(0);
    (left, top)
}

/// Draw every detection in `batch` onto `frame` and hand the frame back.
/// An empty batch leaves the pixels untouched.
pub fn annotate<'f>(frame: &'f mut RgbFrame, batch: &[Detection]) -> Result<&'f mut RgbFrame> {
    frame.validate()?;
    if batch.is_empty() {
        return Ok(frame);
    }

    // Build the image from the existing buffer, no clone; written back below.
    let mut img: RgbImage =
        ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
            .expect("frame length validated above");

    for detection in batch {
        let bbox = clip_to_canvas(&detection.bbox, frame.width, frame.height);
        draw_box(&mut img, &bbox);
        draw_label(&mut img, &bbox, &label_text(detection));
    }

    frame.data = img.into_raw();
    Ok(frame)
}

/// Pull coordinates to at most one stroke outside the frame. Edges beyond the
/// frame stay invisible and the size arithmetic below cannot overflow.
fn clip_to_canvas(bbox: &PixelBox, width: u32, height: u32) -> PixelBox {
    let max_x = i32::try_from(width).unwrap_or(i32::MAX - STROKE_WIDTH) - 1 + STROKE_WIDTH;
    let max_y = i32::try_from(height).unwrap_or(i32::MAX - STROKE_WIDTH) - 1 + STROKE_WIDTH;
    PixelBox {
        x1: bbox.x1.clamp(-STROKE_WIDTH, max_x),
        y1: bbox.y1.clamp(-STROKE_WIDTH, max_y),
        x2: bbox.x2.clamp(-STROKE_WIDTH, max_x),
        y2: bbox.y2.clamp(-STROKE_WIDTH, max_y),
    }
}

fn draw_box(img: &mut RgbImage, bbox: &PixelBox) {
    // Corners are inclusive, so the outer ring spans x2 - x1 + 1 pixels.
    for inset in 0..STROKE_WIDTH {
        let w = bbox.x2 - bbox.x1 + 1 - 2 * inset;
        let h = bbox.y2 - bbox.y1 + 1 - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(img, rect, Rgb(BOX_COLOR));
    }
}

fn draw_label(img: &mut RgbImage, bbox: &PixelBox, text: &str) {
    let (text_w, text_h) = text_size(text);
    if text_w == 0 {
        return;
    }
    let label_h = text_h + LABEL_PAD_TOP + LABEL_PAD_BOTTOM;
    let (left, top) = label_origin(
        bbox,
        text_w,
        label_h,
        img.width() as i32,
        img.height() as i32,
    );

    draw_filled_rect_mut(
        img,
        Rect::at(left, top).of_size(text_w as u32, label_h as u32),
        Rgb(BOX_COLOR),
    );
    draw_text(img, left, top + LABEL_PAD_TOP, text);
}

fn draw_text(img: &mut RgbImage, x: i32, y: i32, text: &str) {
    let mut cursor_x = x;
    for ch in text.chars() {
        if let Some(rows) = glyphs::glyph(ch) {
            for (row, &bits) in rows.iter().enumerate() {
                for col in 0..glyphs::WIDTH {
                    if (bits >> (glyphs::WIDTH - 1 - col)) & 1 == 1 {
                        let px = cursor_x + col * GLYPH_SCALE;
                        let py = y + row as i32 * GLYPH_SCALE;
                        draw_filled_rect_mut(
                            img,
                            Rect::at(px, py).of_size(GLYPH_SCALE as u32, GLYPH_SCALE as u32),
                            Rgb(TEXT_COLOR),
                        );
                    }
                }
            }
        }
        cursor_x += glyphs::ADVANCE * GLYPH_SCALE;
    }
}
