use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ApplyError, Editor, Point, Selection};
use crate::ops::{Op, Transaction, transform_path};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
}

impl Pointer {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropSide {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropPlacement {
    pub side: DropSide,
    /// Drop inside the target rather than next to it.
    pub nestable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DragOffset {
    pub bbox: Bounds,
    /// `None` hides the drop indicator.
    pub position: Option<DropPlacement>,
}

/// Where a pointer over `bbox` would drop, by its vertical position.
///
/// The outer fifths of the box always mean a sibling drop; the inner bands
/// nest into the target when `is_nestable` allows it.
pub fn classify(pointer: Pointer, bbox: Bounds, is_nestable: bool) -> DragOffset {
    let outside = pointer.x < bbox.left || pointer.x > bbox.right();
    if outside || bbox.height <= 0.0 {
        return DragOffset {
            bbox,
            position: None,
        };
    }

    let percentage = (pointer.y - bbox.top) / bbox.height * 100.0;
    let (side, nestable) = if percentage <= 20.0 {
        (DropSide::Above, false)
    } else if percentage <= 50.0 {
        (DropSide::Above, is_nestable)
    } else if percentage <= 80.0 {
        (DropSide::Below, is_nestable)
    } else {
        (DropSide::Below, false)
    };

    DragOffset {
        bbox,
        position: Some(DropPlacement { side, nestable }),
    }
}

pub fn insertion_index(index: usize, side: DropSide) -> usize {
    match side {
        DropSide::Above => index,
        DropSide::Below => index + 1,
    }
}

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("node {0:?} is not attached")]
    Detached(String),
    #[error("node {0:?} has no layout")]
    NoLayout(String),
}

/// Host layout queries.
pub trait Geometry {
    fn bounding_box(&self, node_id: &str) -> Result<Bounds, GeometryError>;
}

impl Editor {
    /// Drop indicator for dragging over `target_id`. Lookup failures hide it.
    pub fn drop_target(
        &self,
        target_id: &str,
        pointer: Pointer,
        geometry: &impl Geometry,
    ) -> Option<DragOffset> {
        let Some((_, target)) = self.doc().find_by_id(target_id) else {
            let err = GeometryError::Detached(target_id.to_string());
            tracing::warn!(target: "plate::drop", %err, "drop target lookup failed");
            return None;
        };
        let bbox = match geometry.bounding_box(target_id) {
            Ok(bbox) => bbox,
            Err(err) => {
                tracing::warn!(target: "plate::drop", %err, "drop target lookup failed");
                return None;
            }
        };
        Some(classify(
            pointer,
            bbox,
            self.registry().is_nestable(&target.kind),
        ))
    }

    /// Moves `dragged_id` relative to `target_id`. Returns `false` when the
    /// move would not change the document.
    pub fn move_node(
        &mut self,
        dragged_id: &str,
        target_id: &str,
        placement: DropPlacement,
    ) -> Result<bool, ApplyError> {
        let doc = self.doc();
        let (Some((from, dragged)), Some((target_path, target))) =
            (doc.find_by_id(dragged_id), doc.find_by_id(target_id))
        else {
            return Ok(false);
        };
        if target_path.starts_with(&from) {
            return Ok(false);
        }

        let gap = if placement.nestable && self.registry().is_nestable(&target.kind) {
            let mut gap = target_path.clone();
            gap.push(match placement.side {
                DropSide::Above => 0,
                DropSide::Below => target.children.len(),
            });
            gap
        } else {
            let Some((&ix, parent)) = target_path.split_last() else {
                return Ok(false);
            };
            let mut gap = parent.to_vec();
            gap.push(insertion_index(ix, placement.side));
            gap
        };

        let remove = Op::RemoveNode { path: from.clone() };
        let Some(to) = transform_path(&gap, &remove) else {
            return Ok(false);
        };
        if to == from {
            return Ok(false);
        }

        let node = crate::core::Node::Element(dragged.clone());
        tracing::debug!(target: "plate::drop", ?from, ?to, "moving node");
        self.apply(
            Transaction::new(vec![
                remove,
                Op::InsertNode {
                    path: to.clone(),
                    node,
                },
            ])
            .selection_after(Selection::collapsed(Point::new(to, 0)))
            .source("drop:move_node"),
        )?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_boundaries_are_inclusive_on_the_upper_edge() {
        let bbox = Bounds::new(0.0, 0.0, 10.0, 100.0);
        let at = |y| classify(Pointer::new(5.0, y), bbox, true).position.unwrap();
        assert_eq!(at(20.0), DropPlacement { side: DropSide::Above, nestable: false });
        assert_eq!(at(50.0), DropPlacement { side: DropSide::Above, nestable: true });
        assert_eq!(at(80.0), DropPlacement { side: DropSide::Below, nestable: true });
        assert_eq!(at(80.5), DropPlacement { side: DropSide::Below, nestable: false });
    }

    #[test]
    fn degenerate_box_hides_the_indicator() {
        let bbox = Bounds::new(0.0, 0.0, 10.0, 0.0);
        assert_eq!(classify(Pointer::new(5.0, 0.0), bbox, false).position, None);
    }

    #[test]
    fn below_inserts_after_the_target() {
        assert_eq!(insertion_index(3, DropSide::Above), 3);
        assert_eq!(insertion_index(3, DropSide::Below), 4);
    }
}
