//! Canvas data model
//!
//! `Node` and `Connection` are the two entity kinds stored in the shared
//! document. Connections reference nodes by id only; nothing at this layer
//! guarantees that the referenced nodes exist, so readers must check.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::identifiers::{ConnectionId, NodeId};

// =============================================================================
// Geometry
// =============================================================================

/// A point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Width and height of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    /// Horizontal extent
    pub width: f64,
    /// Vertical extent
    pub height: f64,
}

impl Size {
    /// Create a size.
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Axis-aligned rectangle, normalised so `size` is never negative.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    /// Top-left corner
    pub origin: Position,
    /// Extent from the origin
    pub size: Size,
}

impl Rect {
    /// Create a rectangle from an origin and a size.
    pub fn new(origin: Position, size: Size) -> Self {
        Self::from_corners(
            origin,
            Position::new(origin.x + size.width, origin.y + size.height),
        )
    }

    /// Build the rectangle spanned by two corners, in any order.
    ///
    /// This is what an area-selection drag produces: the anchor and the
    /// current pointer position.
    pub fn from_corners(a: Position, b: Position) -> Self {
        let min_x = a.x.min(b.x);
        let min_y = a.y.min(b.y);
        Self {
            origin: Position::new(min_x, min_y),
            size: Size::new((a.x - b.x).abs(), (a.y - b.y).abs()),
        }
    }

    /// Right edge.
    pub fn max_x(&self) -> f64 {
        self.origin.x + self.size.width
    }

    /// Bottom edge.
    pub fn max_y(&self) -> f64 {
        self.origin.y + self.size.height
    }

    /// Whether a point lies inside or on the border.
    pub fn contains(&self, point: Position) -> bool {
        point.x >= self.origin.x
            && point.x <= self.max_x()
            && point.y >= self.origin.y
            && point.y <= self.max_y()
    }

    /// Whether two rectangles overlap (touching edges count).
    pub fn intersects(&self, other: &Rect) -> bool {
        self.origin.x <= other.max_x()
            && other.origin.x <= self.max_x()
            && self.origin.y <= other.max_y()
            && other.origin.y <= self.max_y()
    }
}

// =============================================================================
// Entities
// =============================================================================

/// A node on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identity; also the key in the `nodes` collection
    pub id: NodeId,
    /// Top-left corner in canvas coordinates
    pub position: Position,
    /// Rendered extent
    pub size: Size,
    /// User-visible content (text, markdown, embed URL...)
    #[serde(default)]
    pub content: String,
    /// Free-form metadata owned by the frontend
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Node {
    /// Create an empty node at a position.
    pub fn new(id: NodeId, position: Position, size: Size) -> Self {
        Self {
            id,
            position,
            size,
            content: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Bounding box on the canvas.
    pub fn bounds(&self) -> Rect {
        Rect::new(self.position, self.size)
    }
}

/// How a connection is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// Straight segment between anchors
    Straight,
    /// Bezier curve
    #[default]
    Curved,
    /// Right-angle elbows
    Orthogonal,
}

/// Visual style of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionStyle {
    /// Line geometry
    #[serde(default)]
    pub line: LineKind,
    /// CSS-style colour, frontend default when absent
    #[serde(default)]
    pub color: Option<String>,
    /// Dashed stroke
    #[serde(default)]
    pub dashed: bool,
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Identity; also the key in the `connections` collection
    pub id: ConnectionId,
    /// Node the connection starts at
    pub source_node_id: NodeId,
    /// Node the connection ends at
    pub target_node_id: NodeId,
    /// Visual style
    #[serde(default)]
    pub style: ConnectionStyle,
}

impl Connection {
    /// Create a connection with the default style.
    pub fn new(id: ConnectionId, source_node_id: NodeId, target_node_id: NodeId) -> Self {
        Self {
            id,
            source_node_id,
            target_node_id,
            style: ConnectionStyle::default(),
        }
    }

    /// Replace the style.
    pub fn with_style(mut self, style: ConnectionStyle) -> Self {
        self.style = style;
        self
    }

    /// Whether either endpoint is `node`.
    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source_node_id == node || &self.target_node_id == node
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rect_from_corners_normalises() {
        let rect = Rect::from_corners(Position::new(10.0, 20.0), Position::new(0.0, 5.0));
        assert_eq!(rect.origin, Position::new(0.0, 5.0));
        assert_eq!(rect.size, Size::new(10.0, 15.0));
    }

    #[test]
    fn rect_contains_its_border_but_not_beyond() {
        let rect = Rect::new(Position::new(0.0, 0.0), Size::new(10.0, 5.0));
        assert!(rect.contains(Position::new(0.0, 0.0)));
        assert!(rect.contains(Position::new(10.0, 5.0)));
        assert!(rect.contains(Position::new(4.0, 2.5)));
        assert!(!rect.contains(Position::new(10.1, 2.0)));
        assert!(!rect.contains(Position::new(4.0, -0.1)));
    }

    #[test]
    fn node_bounds_intersect_touching_rect() {
        let node = Node::new(NodeId::from_u128(1), Position::new(0.0, 0.0), Size::new(10.0, 10.0));
        let touching = Rect::new(Position::new(10.0, 10.0), Size::new(5.0, 5.0));
        let apart = Rect::new(Position::new(11.0, 11.0), Size::new(5.0, 5.0));
        assert!(node.bounds().intersects(&touching));
        assert!(!node.bounds().intersects(&apart));
    }

    #[test]
    fn missing_optional_fields_deserialize_with_defaults() {
        let id = NodeId::from_u128(7);
        let json = format!(
            r#"{{"id":"{id}","position":{{"x":1.0,"y":2.0}},"size":{{"width":3.0,"height":4.0}}}}"#
        );
        let node: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(node.id, id);
        assert!(node.content.is_empty());
        assert!(node.metadata.is_empty());
    }

    #[test]
    fn connection_touches_both_endpoints() {
        let a = NodeId::from_u128(1);
        let b = NodeId::from_u128(2);
        let conn = Connection::new(ConnectionId::from_u128(9), a, b);
        assert!(conn.touches(&a));
        assert!(conn.touches(&b));
        assert!(!conn.touches(&NodeId::from_u128(3)));
    }

    proptest! {
        #[test]
        fn rect_contains_both_corners(
            ax in -1_000_000i32..1_000_000, ay in -1_000_000i32..1_000_000,
            bx in -1_000_000i32..1_000_000, by in -1_000_000i32..1_000_000,
        ) {
            let a = Position::new(f64::from(ax), f64::from(ay));
            let b = Position::new(f64::from(bx), f64::from(by));
            let rect = Rect::from_corners(a, b);
            prop_assert!(rect.size.width >= 0.0 && rect.size.height >= 0.0);
            prop_assert!(rect.contains(a) && rect.contains(b));
            prop_assert!(rect.intersects(&Rect::new(a, Size::default())));
            prop_assert!(rect.intersects(&Rect::new(b, Size::default())));
        }
    }
}
