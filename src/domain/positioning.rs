//! Position Engine
//!
//! Two-anchor trilateration in the plane.
//!
//! Two circles generally intersect in two points. This engine always reports
//! the one on the positive-`y` side of the anchor baseline, which assumes the
//! user never crosses that line. It is an approximation, not a general
//! two-anchor solver. When the circles do not meet at all the perpendicular
//! term is clamped to zero and [`Fix::clamped`] is set.

use crate::domain::errors::PositionError;
use crate::domain::models::{DeviceId, Direction};
use crate::domain::registry::DeviceRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Known physical coordinates of an anchor, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorPoint {
    pub x: f64,
    pub y: f64,
}

impl AnchorPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Result of one trilateration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub x: f64,
    pub y: f64,
    /// True when the readings were geometrically inconsistent and `y` was forced to 0
    pub clamped: bool,
}

/// Immutable mapping from anchor identity to coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorTable {
    anchors: BTreeMap<DeviceId, AnchorPoint>,
}

impl AnchorTable {
    pub fn new(
        entries: impl IntoIterator<Item = (DeviceId, AnchorPoint)>,
    ) -> Result<Self, PositionError> {
        let mut anchors = BTreeMap::new();
        for (id, point) in entries {
            if !point.x.is_finite() || !point.y.is_finite() {
                return Err(PositionError::NonFinite);
            }
            if anchors.insert(id, point).is_some() {
                return Err(PositionError::DuplicateAnchor(id));
            }
        }
        if anchors.len() < 2 {
            return Err(PositionError::TooFewAnchors(anchors.len()));
        }
        Ok(Self { anchors })
    }

    pub fn get(&self, id: DeviceId) -> Option<AnchorPoint> {
        self.anchors.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Trilateration from two anchors.
///
/// On the usual setup where both anchors sit on the `y = 0` axis this is the
/// linear solution
///
/// ```text
/// A = 2 (x2 - x1)
/// C = d1² - d2² - x1² + x2² - y1² + y2²
/// x = C / A
/// y = sqrt(d1² - (x - x1)²), or 0 when the radicand is not positive
/// ```
///
/// For other baselines the same construction is done along the line joining
/// the anchors and the intersection with the larger `y` is returned.
/// Anchors sharing an x coordinate are rejected.
pub fn trilaterate(
    a1: AnchorPoint,
    d1: f64,
    a2: AnchorPoint,
    d2: f64,
) -> Result<Fix, PositionError> {
    if !(d1.is_finite() && d2.is_finite()) || d1 < 0.0 || d2 < 0.0 {
        return Err(PositionError::NonFinite);
    }

    let a = 2.0 * (a2.x - a1.x);
    if a == 0.0 {
        return Err(PositionError::DegenerateGeometry { x: a1.x });
    }

    let (dx, dy) = (a2.x - a1.x, a2.y - a1.y);
    let baseline = (dx * dx + dy * dy).sqrt();
    let (ux, uy) = (dx / baseline, dy / baseline);

    // Projection of the fix onto the baseline, measured from anchor 1
    let along = (d1 * d1 - d2 * d2 + baseline * baseline) / (2.0 * baseline);
    let h_term = d1 * d1 - along * along;
    let (h, clamped) = if h_term > 0.0 {
        (h_term.sqrt(), false)
    } else {
        (0.0, h_term < 0.0)
    };

    // Normal pointing towards increasing y; ux is never 0 here
    let (nx, ny) = if ux > 0.0 { (-uy, ux) } else { (uy, -ux) };
    let x = a1.x + along * ux + h * nx;
    let y = a1.y + along * uy + h * ny;

    if !(x.is_finite() && y.is_finite()) {
        return Err(PositionError::NonFinite);
    }

    Ok(Fix { x, y, clamped })
}

/// Chooses anchor readings from the registry and runs [`trilaterate`].
#[derive(Debug, Clone)]
pub struct PositionEngine {
    anchors: AnchorTable,
}

impl PositionEngine {
    pub fn new(anchors: AnchorTable) -> Self {
        Self { anchors }
    }

    /// Compute a fix from the two freshest anchor readings.
    pub fn locate(&self, registry: &DeviceRegistry) -> Result<Fix, PositionError> {
        let mut readings: Vec<(u64, DeviceId, AnchorPoint, f64)> = registry
            .all()
            .filter_map(|device| {
                let point = self.anchors.get(device.id)?;
                let distance = device.fresh_distance()?;
                let updated_ms = device.location.as_ref()?.updated_ms;
                Some((updated_ms, device.id, point, f64::from(distance)))
            })
            .collect();

        if readings.len() < 2 {
            return Err(PositionError::InsufficientAnchors {
                available: readings.len(),
            });
        }

        // Newest first, identity breaks ties so the pair is deterministic
        readings.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let (_, _, p1, d1) = readings[0];
        let (_, _, p2, d2) = readings[1];
        trilaterate(p1, d1, p2, d2)
    }
}

/// Horizontal angle towards the accessory, in radians.
///
/// With full direction support the lateral component is trusted directly;
/// otherwise the angle is reconstructed in the horizontal plane.
pub fn azimuth(direction: Direction, direction_enabled: bool) -> f32 {
    if direction_enabled {
        direction[0].asin()
    } else {
        direction[0].atan2(direction[2])
    }
}

/// Vertical angle towards the accessory, in radians
pub fn elevation(direction: Direction) -> f32 {
    direction[2].atan2(direction[1]) + std::f32::consts::FRAC_PI_2
}

/// Direction in the horizontal plane for a horizontal angle in radians.
pub fn direction_from_horizontal_angle(angle: f32) -> Direction {
    [angle.sin(), 0.0, angle.cos()]
}
