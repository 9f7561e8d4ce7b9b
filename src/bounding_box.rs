use image::GrayImage;

/// Pixel rectangle into a raster, `right` and `bottom` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn is_square(&self) -> bool {
        self.width() == self.height()
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// Finds the drawn glyph and returns a padded, square box around it.
///
/// Every pixel with a non-zero sample counts as foreground. Padding is clamped
/// at the raster edges, then the shorter axis is grown around its centre until
/// the box is square. Growth that would leave the raster is pushed onto the
/// opposite side. Returns `None` for an all-background raster.
pub fn locate(bitmap: &GrayImage, padding: u32) -> Option<BoundingBox> {
    let mut extent: Option<(u32, u32, u32, u32)> = None;
    for (x, y, pixel) in bitmap.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        extent = Some(match extent {
            None => (x, y, x, y),
            Some((min_x, min_y, max_x, max_y)) => {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            }
        });
    }
    let (min_x, min_y, max_x, max_y) = extent?;

    let (width, height) = bitmap.dimensions();
    let left = min_x.saturating_sub(padding);
    let top = min_y.saturating_sub(padding);
    let right = max_x.saturating_add(1).saturating_add(padding).min(width);
    let bottom = max_y.saturating_add(1).saturating_add(padding).min(height);

    let mut size = (right - left).max(bottom - top);
    if size == 0 {
        size = padding.saturating_mul(2).max(1);
    }
    let size = size.min(width.min(height));

    let (left, right) = square_axis(left, right, size, width);
    let (top, bottom) = square_axis(top, bottom, size, height);

    Some(BoundingBox {
        left,
        top,
        right,
        bottom,
    })
}

fn square_axis(start: u32, end: u32, size: u32, limit: u32) -> (u32, u32) {
    let extra = i64::from(size.saturating_sub(end - start));
    let limit = i64::from(limit);

    let mut start = i64::from(start) - extra / 2;
    let mut end = start + i64::from(size);
    if start < 0 {
        end -= start;
        start = 0;
    }
    if end > limit {
        start -= end - limit;
        end = limit;
    }

    (start.max(0) as u32, end as u32)
}
