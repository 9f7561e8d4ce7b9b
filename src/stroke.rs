use image::{GrayImage, Luma};

pub const CANVAS_SIZE: u32 = 280;
pub const MAX_BRUSH_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Result of closing a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrokeEnd {
    /// No path was open, nothing happened.
    Idle,
    /// The path closed but the bitmap holds no foreground pixel.
    Empty,
    /// The path closed and the bitmap holds at least one foreground pixel.
    Drawn,
}

#[derive(Debug, Clone, Copy)]
struct OpenPath {
    last: Point,
    width: f32,
}

/// Accumulates freehand strokes into a fixed-size alpha raster.
///
/// Drawing is cumulative: opening a new path never erases earlier strokes,
/// only [`StrokeRecorder::clear`] does.
#[derive(Debug)]
pub struct StrokeRecorder {
    bitmap: GrayImage,
    brush_size: u32,
    path: Option<OpenPath>,
}

impl StrokeRecorder {
    pub fn new(size: u32, brush_size: u32) -> Self {
        Self {
            bitmap: GrayImage::new(size, size),
            brush_size: brush_size.clamp(1, MAX_BRUSH_SIZE),
            path: None,
        }
    }

    pub fn bitmap(&self) -> &GrayImage {
        &self.bitmap
    }

    pub fn brush_size(&self) -> u32 {
        self.brush_size
    }

    pub fn is_drawing(&self) -> bool {
        self.path.is_some()
    }

    /// Sets the brush size for the next path. An open path keeps its width.
    pub fn set_brush_size(&mut self, size: u32) -> u32 {
        self.brush_size = size.clamp(1, MAX_BRUSH_SIZE);
        self.brush_size
    }

    pub fn begin(&mut self, point: Point) {
        self.path = Some(OpenPath {
            last: point,
            width: self.brush_size as f32,
        });
    }

    pub fn extend(&mut self, point: Point) {
        let Some(path) = self.path.as_mut() else {
            return;
        };
        paint_segment(&mut self.bitmap, path.last, point, path.width);
        path.last = point;
    }

    pub fn end(&mut self) -> StrokeEnd {
        if self.path.take().is_none() {
            return StrokeEnd::Idle;
        }
        if self.bitmap.pixels().any(|pixel| pixel.0[0] > 0) {
            StrokeEnd::Drawn
        } else {
            StrokeEnd::Empty
        }
    }

    pub fn clear(&mut self) {
        self.path = None;
        for pixel in self.bitmap.pixels_mut() {
            *pixel = Luma([0]);
        }
    }
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f32 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx * dx + dy * dy;
    let t = if length_sq == 0.0 {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq).clamp(0.0, 1.0)
    };
    let cx = a.x + t * dx;
    let cy = a.y + t * dy;
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

// Round-capped line with a half pixel coverage ramp. Samples combine with max
// so repainting the same spot never darkens it further.
fn paint_segment(bitmap: &mut GrayImage, from: Point, to: Point, width: f32) {
    let radius = width / 2.0;
    let reach = radius + 1.0;
    let (bitmap_width, bitmap_height) = bitmap.dimensions();

    // float to int casts saturate, off-canvas coordinates clip to the edges
    let min_x = (from.x.min(to.x) - reach).floor().max(0.0) as u32;
    let min_y = (from.y.min(to.y) - reach).floor().max(0.0) as u32;
    let max_x = ((from.x.max(to.x) + reach).ceil() as u32).min(bitmap_width);
    let max_y = ((from.y.max(to.y) + reach).ceil() as u32).min(bitmap_height);

    for y in min_y..max_y {
        for x in min_x..max_x {
            let center = Point::new(x as f32 + 0.5, y as f32 + 0.5);
            let coverage = (radius + 0.5 - distance_to_segment(center, from, to)).clamp(0.0, 1.0);
            if coverage <= 0.0 {
                continue;
            }
            let value = (coverage * 255.0).round() as u8;
            let pixel = bitmap.get_pixel_mut(x, y);
            pixel.0[0] = pixel.0[0].max(value);
        }
    }
}
