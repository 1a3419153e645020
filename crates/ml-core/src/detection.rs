/// Axis-aligned rectangle in integer pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> i64 {
        if self.width <= 0 || self.height <= 0 {
            return 0;
        }
        self.width as i64 * self.height as i64
    }

    /// Overlapping region, empty (zero area) when the rectangles are disjoint.
    pub fn intersection(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            return Rect::default();
        }
        Rect::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }

    /// Intersection over union; zero when either rectangle is empty.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection(other).area();
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f32 / union as f32
    }
}

/// Single object found in a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub rect: Rect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let rect = Rect::new(10, 10, 41, 41);
        assert!((rect.iou(&rect) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disjoint_boxes_do_not_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(10, 0, 10, 10);
        assert_eq!(a.intersection(&b).area(), 0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn half_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 10, 10);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_boxes_have_no_area() {
        assert_eq!(Rect::new(3, 3, -4, 5).area(), 0);
        assert_eq!(Rect::new(3, 3, 0, 0).iou(&Rect::new(3, 3, 0, 0)), 0.0);
    }

    #[test]
    fn edges_saturate_at_the_pixel_range() {
        let wide = Rect::new(i32::MAX - 5, i32::MIN, 100, i32::MAX);
        assert_eq!(wide.right(), i32::MAX);
        assert_eq!(wide.bottom(), -1);
        let far = Rect::new(i32::MIN, 0, 10, 10);
        assert_eq!(wide.intersection(&far).area(), 0);
        assert_eq!(wide.intersection(&wide).width, 5);
    }
}
