/// A struct representing a bounding box.
///
/// A bounding box is the axis-aligned rectangle an object detector draws around an object
/// (here: a weed or crop plant in an orthomosaic tile). Boxes are composed of a rectangle and a
/// class denoting what the object is. When a detector runs, it outputs bounding boxes along with
/// a probability encoding its confidence in that box+class.
///
/// This project uses the standard image convention of the left side of the image being x=0 and
/// the top of the image being y=0. Once a box is mapped into georeferenced space "top" simply
/// means the smaller y value.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundingBox {
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
    class_id: usize,
    category: String,
}

/// Reasons a detector box can be rejected before it becomes a polygon.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("box has non-finite coordinates ({left}, {top}, {right}, {bottom})")]
    NonFinite {
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
    },
    #[error("value for left > value for right ({left} > {right})")]
    InvertedHorizontal { left: f64, right: f64 },
    #[error("value for top > value for bottom ({top} > {bottom})")]
    InvertedVertical { top: f64, bottom: f64 },
    #[error("box has zero area after clipping to the tile")]
    Empty,
}

impl BoundingBox {
    /// Checks if a box has valid parameters before constructing.
    pub fn new(
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        class_id: usize,
        category: String,
    ) -> Result<Self, GeometryError> {
        if ![left, top, right, bottom].iter().all(|v| v.is_finite()) {
            Err(GeometryError::NonFinite {
                left,
                top,
                right,
                bottom,
            })
        } else if left > right {
            Err(GeometryError::InvertedHorizontal { left, right })
        } else if top > bottom {
            Err(GeometryError::InvertedVertical { top, bottom })
        } else {
            Ok(BoundingBox {
                left,
                top,
                right,
                bottom,
                class_id,
                category,
            })
        }
    }

    /// Builds a box from the (x_center, y_center, width, height) layout YOLO models emit.
    pub fn from_xywh(
        x_center: f64,
        y_center: f64,
        width: f64,
        height: f64,
        class_id: usize,
        category: String,
    ) -> Result<Self, GeometryError> {
        BoundingBox::new(
            x_center - width / 2.0,
            y_center - height / 2.0,
            x_center + width / 2.0,
            y_center + height / 2.0,
            class_id,
            category,
        )
    }

    /// Smallest box containing every point, tagged with the given class.
    pub fn enclosing(
        points: &[(f64, f64)],
        class_id: usize,
        category: String,
    ) -> Result<Self, GeometryError> {
        let (mut left, mut top) = (f64::INFINITY, f64::INFINITY);
        let (mut right, mut bottom) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            left = left.min(x);
            top = top.min(y);
            right = right.max(x);
            bottom = bottom.max(y);
        }
        BoundingBox::new(left, top, right, bottom, class_id, category)
    }

    /// Returns a copy with every coordinate multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Result<Self, GeometryError> {
        BoundingBox::new(
            self.left * factor,
            self.top * factor,
            self.right * factor,
            self.bottom * factor,
            self.class_id,
            self.category.clone(),
        )
    }

    /// Clips the box to `[0, width] x [0, height]`, failing when nothing is left.
    pub fn clipped(&self, width: f64, height: f64) -> Result<Self, GeometryError> {
        let clipped = BoundingBox::new(
            self.left.clamp(0.0, width),
            self.top.clamp(0.0, height),
            self.right.clamp(0.0, width),
            self.bottom.clamp(0.0, height),
            self.class_id,
            self.category.clone(),
        )?;
        if clipped.area() <= 0.0 {
            return Err(GeometryError::Empty);
        }
        Ok(clipped)
    }

    /// Smallest box containing both boxes. Keeps the class of `self`.
    pub fn union_envelope(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
            class_id: self.class_id,
            category: self.category.clone(),
        }
    }

    /// Corners in ring order: (x_min,y_min), (x_max,y_min), (x_max,y_max), (x_min,y_max).
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.left, self.top),
            (self.right, self.top),
            (self.right, self.bottom),
            (self.left, self.bottom),
        ]
    }
}

pub trait BoundingBoxGeometry {
    fn left(&self) -> f64;
    fn top(&self) -> f64;
    fn right(&self) -> f64;
    fn bottom(&self) -> f64;
    fn class_id(&self) -> usize;
    fn category(&self) -> &str;

    fn area(&self) -> f64 {
        (self.right() - self.left()) * (self.bottom() - self.top())
    }

    fn as_xyxy(&self) -> (f64, f64, f64, f64) {
        (self.left(), self.top(), self.right(), self.bottom())
    }

    /// True when the boxes share any point, edges included.
    fn touches_or_overlaps<U: BoundingBoxGeometry>(&self, other: &U) -> bool {
        self.left() <= other.right()
            && other.left() <= self.right()
            && self.top() <= other.bottom()
            && other.top() <= self.bottom()
    }

    fn intersection_area<U: BoundingBoxGeometry>(&self, other: &U) -> f64 {
        let width = self.right().min(other.right()) - self.left().max(other.left());
        let height = self.bottom().min(other.bottom()) - self.top().max(other.top());
        if width <= 0.0 || height <= 0.0 {
            return 0.0;
        }
        width * height
    }

    /// Intersection over union. Zero-area boxes never overlap anything.
    fn intersection_over_union<U: BoundingBoxGeometry>(&self, other: &U) -> f64 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;
        if intersection <= 0.0 || union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

impl BoundingBoxGeometry for BoundingBox {
    fn left(&self) -> f64 {
        self.left
    }

    fn top(&self) -> f64 {
        self.top
    }

    fn right(&self) -> f64 {
        self.right
    }

    fn bottom(&self) -> f64 {
        self.bottom
    }

    fn class_id(&self) -> usize {
        self.class_id
    }

    fn category(&self) -> &str {
        &self.category
    }
}
