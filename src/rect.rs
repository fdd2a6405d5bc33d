//! Bounding-box geometry.
//!
//! Detector output stores boxes as `[x_min, y_min, width, height]` in
//! coordinates relative to the image, so [`Rect`] keeps that layout instead
//! of a center/size pair, and serializes as exactly that 4-element array.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle in relative image coordinates.
///
/// Rectangles are allowed to have zero height and/or width. Negative
/// dimensions can arrive from corrupt input and are rejected by
/// [`Rect::iou`] rather than at construction.
#[derive(Clone, Copy, PartialEq)]
pub struct Rect {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl Rect {
    /// Creates a rectangle extending downwards and right from its top-left
    /// corner.
    #[inline]
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Returns the X coordinate of the left side of the rectangle.
    #[inline]
    pub fn x(&self) -> f32 {
        self.x
    }

    /// Returns the Y coordinate of the top side of the rectangle.
    #[inline]
    pub fn y(&self) -> f32 {
        self.y
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.w
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.h
    }

    #[inline]
    pub fn x_center(&self) -> f32 {
        self.x + self.w * 0.5
    }

    #[inline]
    pub fn y_center(&self) -> f32 {
        self.y + self.h * 0.5
    }

    /// Returns the fraction of the image covered by `self`.
    #[inline]
    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Computes the intersection of `self` and `other`.
    ///
    /// Returns [`None`] when the intersection is empty (ie. the rectangles do
    /// not overlap).
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x_min = self.x.max(other.x);
        let y_min = self.y.max(other.y);
        let x_max = (self.x + self.w).min(other.x + other.w);
        let y_max = (self.y + self.h).min(other.y + other.h);
        if x_min > x_max || y_min > y_max {
            return None;
        }

        Some(Rect::from_xywh(x_min, y_min, x_max - x_min, y_max - y_min))
    }

    fn intersection_area(&self, other: &Rect) -> f32 {
        self.intersection(other).map_or(0.0, |rect| rect.area())
    }

    fn union_area(&self, other: &Rect) -> f32 {
        self.area() + other.area() - self.intersection_area(other)
    }

    /// Computes the Intersection over Union (IOU) of `self` and `other`.
    ///
    /// Degenerate geometry (non-finite coordinates, negative dimensions, or
    /// an empty union) yields an [`IouError`] instead of a NaN that would
    /// silently poison threshold comparisons.
    pub fn iou(&self, other: &Rect) -> Result<f32, IouError> {
        let degenerate = |rect: &Rect| {
            !(rect.x.is_finite() && rect.y.is_finite() && rect.w.is_finite() && rect.h.is_finite())
                || rect.w < 0.0
                || rect.h < 0.0
        };
        if degenerate(self) || degenerate(other) {
            return Err(IouError { a: *self, b: *other });
        }

        let union = self.union_area(other);
        if union <= 0.0 {
            return Err(IouError { a: *self, b: *other });
        }

        Ok(self.intersection_area(other) / union)
    }

    /// Bit-exact equality of the x/y/width components.
    ///
    /// Used to verify that a recorded detection instance still refers to the
    /// same table entry it was created from.
    pub fn bits_eq_xyw(&self, other: &Rect) -> bool {
        self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.w.to_bits() == other.w.to_bits()
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rect @ ({},{})/{}x{}", self.x, self.y, self.w, self.h)
    }
}

/// The error produced when computing the IoU of a degenerate box pair.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot compute IoU of boxes {a:?} and {b:?}")]
pub struct IouError {
    a: Rect,
    b: Rect,
}

impl Serialize for Rect {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.x)?;
        tuple.serialize_element(&self.y)?;
        tuple.serialize_element(&self.w)?;
        tuple.serialize_element(&self.h)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Rect {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RectVisitor;

        impl<'de> Visitor<'de> for RectVisitor {
            type Value = Rect;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a `[x, y, width, height]` array")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Rect, A::Error> {
                let mut next = |index| {
                    seq.next_element::<f32>()?
                        .ok_or_else(|| de::Error::invalid_length(index, &self))
                };
                Ok(Rect::from_xywh(next(0)?, next(1)?, next(2)?, next(3)?))
            }
        }

        deserializer.deserialize_tuple(4, RectVisitor)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let rect = Rect::from_xywh(0.1, 0.1, 0.2, 0.2);
        assert_relative_eq!(rect.iou(&rect).unwrap(), 1.0);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Rect::from_xywh(0.0, 0.0, 0.1, 0.1);
        let b = Rect::from_xywh(0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.iou(&b).unwrap(), 0.0);
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn iou_of_half_height_box_is_half() {
        let a = Rect::from_xywh(0.1, 0.1, 0.2, 0.2);
        let b = Rect::from_xywh(0.1, 0.1, 0.2, 0.1);
        assert_relative_eq!(a.iou(&b).unwrap(), 0.5, max_relative = 1e-6);
    }

    #[test]
    fn degenerate_boxes_fail_iou() {
        let ok = Rect::from_xywh(0.1, 0.1, 0.2, 0.2);
        let nan = Rect::from_xywh(f32::NAN, 0.1, 0.2, 0.2);
        let negative = Rect::from_xywh(0.1, 0.1, -0.2, 0.2);
        let empty = Rect::from_xywh(0.1, 0.1, 0.0, 0.0);
        assert!(ok.iou(&nan).is_err());
        assert!(ok.iou(&negative).is_err());
        assert!(empty.iou(&empty).is_err());
    }

    #[test]
    fn serializes_as_xywh_array() {
        let rect = Rect::from_xywh(0.1, 0.2, 0.3, 0.4);
        let json = serde_json::to_string(&rect).unwrap();
        assert_eq!(json, "[0.1,0.2,0.3,0.4]");
        let back: Rect = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rect);
    }

    #[test]
    fn bitwise_comparison_ignores_height() {
        let a = Rect::from_xywh(0.1, 0.2, 0.3, 0.4);
        let b = Rect::from_xywh(0.1, 0.2, 0.3, 0.5);
        let c = Rect::from_xywh(0.1, 0.2, 0.30000001, 0.4);
        assert!(a.bits_eq_xyw(&b));
        assert!(!a.bits_eq_xyw(&c));
    }
}
