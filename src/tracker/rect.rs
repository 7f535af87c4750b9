/// Axis-aligned bounding box in TLWH form (top-left x, top-left y, width,
/// height), in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rect {
    /// Top-left x coordinate
    pub x: f32,
    /// Top-left y coordinate
    pub y: f32,
    /// Width of the bounding box
    pub width: f32,
    /// Height of the bounding box
    pub height: f32,
}

impl Rect {
    /// Create a new Rect from top-left coordinates and dimensions (TLWH format).
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a Rect from TLBR format (top-left x, top-left y, bottom-right x, bottom-right y).
    #[inline]
    pub fn from_tlbr(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Convert to TLBR format: (x1, y1, x2, y2).
    #[inline]
    pub fn to_tlbr(&self) -> [f32; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }

    /// Get the area of the bounding box.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Finite coordinates and a strictly positive extent.
    pub fn is_valid(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Area shared with another box.
    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Fraction of this box that lies inside `other`, in `[0, 1]`.
    pub fn containment_in(&self, other: &Rect) -> f32 {
        let area = self.area();
        if area > 0.0 {
            self.intersection_area(other) / area
        } else {
            0.0
        }
    }

    /// Integer pixel window `(x, y, width, height)` of this box clipped to a
    /// `width` x `height` image, or `None` when nothing of it remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        if !self.is_valid() {
            return None;
        }
        let [x1, y1, x2, y2] = self.to_tlbr();
        let x1 = x1.floor().clamp(0.0, width as f32) as u32;
        let y1 = y1.floor().clamp(0.0, height as f32) as u32;
        let x2 = x2.ceil().clamp(0.0, width as f32) as u32;
        let y2 = y2.ceil().clamp(0.0, height as f32) as u32;

        if x2 > x1 && y2 > y1 {
            Some((x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }
}
