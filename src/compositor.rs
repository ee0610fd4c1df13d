//! Burns the nickname/address header and live chat bubbles into a rendered
//! frame. Pure function of its inputs: one raster frame in, one out, same
//! dimensions.
//!
//! Simulation frames are fully opaque, so premultiplied and straight alpha
//! coincide and the pixmap passes below can share the frame buffer directly.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use fontdue::layout::{CoordinateSystem, Layout, LayoutSettings, TextStyle};
use fontdue::Font;
use tiny_skia::{Color, FillRule, Paint, PathBuilder, PixmapMut, Stroke, Transform};

use crate::bubbles::ChatBubble;
use crate::replay::ReplayPack;
use crate::sim::RasterFrame;

/// Header text sits this far left/right of the frame's horizontal centre.
const NAME_OFFSET_X: f32 = 136.0;
const NAME_TOP_Y: f32 = 10.0;
const ADDR_TOP_Y: f32 = 30.0;
const NAME_PX: f32 = 16.0;
const ADDR_PX: f32 = 12.0;

const BUBBLE_TEXT_PX: f32 = 14.0;
const BUBBLE_PAD_X: f32 = 20.0;
const BUBBLE_HEIGHT: f32 = 30.0;
const BUBBLE_RADIUS: f32 = 6.0;
/// The panel never goes fully opaque, even at peak bubble opacity.
const PANEL_ALPHA: f32 = 0.9;

const WHITE: [u8; 4] = [255, 255, 255, 255];
const BLACK: [u8; 4] = [0, 0, 0, 255];

/// Static overlay text, passed in explicitly; each half is independently
/// toggleable.
#[derive(Debug, Clone)]
pub struct OverlayText {
    pub nicknames: [String; 2],
    pub partial_addresses: [String; 2],
    pub show_nicknames: bool,
    pub show_addresses: bool,
}

impl OverlayText {
    pub fn from_pack(pack: &ReplayPack, show_nicknames: bool, show_addresses: bool) -> Self {
        Self {
            nicknames: pack.nicknames.clone(),
            partial_addresses: pack.partial_public_ips.clone(),
            show_nicknames,
            show_addresses,
        }
    }
}

#[derive(Debug, Clone)]
struct GlyphBitmap {
    width: usize,
    height: usize,
    bitmap: Vec<u8>,
}

pub struct Compositor {
    font: Font,
    glyph_cache: HashMap<fontdue::layout::GlyphRasterConfig, GlyphBitmap>,
}

impl Compositor {
    pub fn new(font_bytes: &[u8]) -> Result<Self> {
        let font = Font::from_bytes(font_bytes, fontdue::FontSettings::default())
            .map_err(|error| anyhow!("failed to parse overlay font: {error}"))?;
        Ok(Self {
            font,
            glyph_cache: HashMap::new(),
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read overlay font {}", path.display()))?;
        Self::new(&bytes)
    }

    pub fn composite(
        &mut self,
        frame: &mut RasterFrame,
        overlay: &OverlayText,
        bubbles: &[&ChatBubble],
    ) -> Result<()> {
        frame.validate()?;

        let center_x = frame.width as f32 / 2.0;
        for side in 0..2 {
            let anchor_x = if side == 0 {
                center_x - NAME_OFFSET_X
            } else {
                center_x + NAME_OFFSET_X
            };

            if overlay.show_nicknames && !overlay.nicknames[side].is_empty() {
                let text = &overlay.nicknames[side];
                self.draw_text_centered(frame, text, anchor_x, NAME_TOP_Y, NAME_PX, WHITE, true);
            }
            if overlay.show_addresses && !overlay.partial_addresses[side].is_empty() {
                let text = &overlay.partial_addresses[side];
                self.draw_text_centered(frame, text, anchor_x, ADDR_TOP_Y, ADDR_PX, WHITE, true);
            }
        }

        for bubble in bubbles {
            if bubble.opacity <= 0.0 || bubble.text.is_empty() {
                continue;
            }
            let text_width = self.measure_text(&bubble.text, BUBBLE_TEXT_PX);
            let (panel_x, panel_y, panel_w, panel_h) =
                panel_rect(bubble.x, bubble.y, text_width);
            draw_bubble_panel(frame, panel_x, panel_y, panel_w, panel_h, bubble.opacity)?;

            let mut text_color = BLACK;
            text_color[3] = (bubble.opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
            let text_y = panel_y + (panel_h - BUBBLE_TEXT_PX) / 2.0;
            self.draw_text_centered(
                frame,
                &bubble.text,
                bubble.x,
                text_y,
                BUBBLE_TEXT_PX,
                text_color,
                false,
            );
        }

        Ok(())
    }

    /// Width of `text` laid out at `px`, in pixels.
    fn measure_text(&self, text: &str, px: f32) -> f32 {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x: 0.0,
            y: 0.0,
            ..LayoutSettings::default()
        });
        layout.append(&[&self.font], &TextStyle::new(text, px, 0));
        layout
            .glyphs()
            .iter()
            .map(|glyph| glyph.x + glyph.width as f32)
            .fold(0.0, f32::max)
    }

    fn draw_text_centered(
        &mut self,
        frame: &mut RasterFrame,
        text: &str,
        center_x: f32,
        top_y: f32,
        px: f32,
        color: [u8; 4],
        outlined: bool,
    ) {
        let width = self.measure_text(text, px);
        let left_x = center_x - width / 2.0;
        if outlined {
            let mut outline = BLACK;
            outline[3] = color[3];
            for (dx, dy) in [
                (-1.0, -1.0),
                (0.0, -1.0),
                (1.0, -1.0),
                (-1.0, 0.0),
                (1.0, 0.0),
                (-1.0, 1.0),
                (0.0, 1.0),
                (1.0, 1.0),
            ] {
                self.draw_text(frame, text, left_x + dx, top_y + dy, px, outline);
            }
        }
        self.draw_text(frame, text, left_x, top_y, px, color);
    }

    fn draw_text(
        &mut self,
        frame: &mut RasterFrame,
        text: &str,
        x: f32,
        y: f32,
        px: f32,
        color: [u8; 4],
    ) {
        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x,
            y,
            ..LayoutSettings::default()
        });
        layout.append(&[&self.font], &TextStyle::new(text, px, 0));

        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let glyph_bitmap = self.glyph_cache.entry(glyph.key).or_insert_with(|| {
                let (_, bitmap) = self.font.rasterize_config(glyph.key);
                GlyphBitmap {
                    width: glyph.width,
                    height: glyph.height,
                    bitmap,
                }
            });

            blend_glyph(
                &mut frame.data,
                frame.width,
                frame.height,
                glyph.x.round() as i32,
                glyph.y.round() as i32,
                glyph_bitmap,
                color,
            );
        }
    }
}

/// Panel geometry: sized to the measured text plus fixed padding, centred on
/// the bubble's x, topped at the bubble's y.
pub(crate) fn panel_rect(bubble_x: f32, bubble_y: f32, text_width: f32) -> (f32, f32, f32, f32) {
    let width = text_width + BUBBLE_PAD_X;
    (bubble_x - width / 2.0, bubble_y, width, BUBBLE_HEIGHT)
}

pub(crate) fn draw_bubble_panel(
    frame: &mut RasterFrame,
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    opacity: f32,
) -> Result<()> {
    let opacity = opacity.clamp(0.0, 1.0);
    if opacity == 0.0 || width <= 0.0 || height <= 0.0 {
        return Ok(());
    }

    let frame_width = frame.width;
    let frame_height = frame.height;
    let mut pixmap = PixmapMut::from_bytes(&mut frame.data, frame_width, frame_height)
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;

    let mut builder = PathBuilder::new();
    push_round_rect(&mut builder, x, y, width, height, BUBBLE_RADIUS);
    let path = builder
        .finish()
        .ok_or_else(|| anyhow!("degenerate bubble panel path"))?;

    let mut paint = Paint::default();
    paint.anti_alias = true;
    paint.set_color(
        Color::from_rgba(1.0, 1.0, 1.0, PANEL_ALPHA * opacity)
            .ok_or_else(|| anyhow!("invalid panel color"))?,
    );
    pixmap.fill_path(
        &path,
        &paint,
        FillRule::Winding,
        Transform::identity(),
        None,
    );

    paint.set_color(
        Color::from_rgba(0.0, 0.0, 0.0, opacity).ok_or_else(|| anyhow!("invalid border color"))?,
    );
    pixmap.stroke_path(
        &path,
        &paint,
        &Stroke {
            width: 1.0,
            ..Stroke::default()
        },
        Transform::identity(),
        None,
    );

    Ok(())
}

fn push_round_rect(builder: &mut PathBuilder, x: f32, y: f32, w: f32, h: f32, radius: f32) {
    let r = radius.min(w / 2.0).min(h / 2.0);
    builder.move_to(x + r, y);
    builder.line_to(x + w - r, y);
    builder.quad_to(x + w, y, x + w, y + r);
    builder.line_to(x + w, y + h - r);
    builder.quad_to(x + w, y + h, x + w - r, y + h);
    builder.line_to(x + r, y + h);
    builder.quad_to(x, y + h, x, y + h - r);
    builder.line_to(x, y + r);
    builder.quad_to(x, y, x + r, y);
    builder.close();
}

fn blend_glyph(
    frame: &mut [u8],
    frame_width: u32,
    frame_height: u32,
    x: i32,
    y: i32,
    glyph: &GlyphBitmap,
    color: [u8; 4],
) {
    for row in 0..glyph.height {
        let py = y + row as i32;
        if py < 0 || py >= frame_height as i32 {
            continue;
        }

        for col in 0..glyph.width {
            let px = x + col as i32;
            if px < 0 || px >= frame_width as i32 {
                continue;
            }

            let mask = glyph.bitmap[row * glyph.width + col];
            if mask == 0 {
                continue;
            }

            let alpha = ((u16::from(mask) * u16::from(color[3])) / 255) as u8;
            let idx = ((py as u32 * frame_width + px as u32) * 4) as usize;
            blend_pixel(frame, idx, [color[0], color[1], color[2], alpha]);
        }
    }
}

fn blend_pixel(frame: &mut [u8], idx: usize, src: [u8; 4]) {
    let alpha = u16::from(src[3]);
    if alpha == 0 {
        return;
    }

    let inv_alpha = 255_u16.saturating_sub(alpha);
    for channel in 0..3 {
        let dst = u16::from(frame[idx + channel]);
        let src_c = u16::from(src[channel]);
        frame[idx + channel] = ((src_c * alpha + dst * inv_alpha + 127) / 255) as u8;
    }
    frame[idx + 3] = 255;
}
