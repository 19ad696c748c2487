use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Schema version stamped on every item this build produces.
pub const ITEM_SCHEMA_VERSION: u32 = 1;

/// Command ids carried in [`MissionItem::command`].
///
/// Values follow the MAV_CMD enumeration so collections stay interoperable
/// with stock autopilots.
pub mod cmd {
    pub const NAV_WAYPOINT: u16 = 16;
    pub const NAV_LOITER_UNLIM: u16 = 17;
    pub const NAV_RETURN_TO_LAUNCH: u16 = 20;
    pub const NAV_LAND: u16 = 21;
    pub const NAV_TAKEOFF: u16 = 22;
    pub const DO_SET_CAM_TRIGG_DIST: u16 = 206;
    pub const NAV_FENCE_RETURN_POINT: u16 = 5000;
    pub const NAV_FENCE_POLYGON_VERTEX_INCLUSION: u16 = 5001;
    pub const NAV_FENCE_POLYGON_VERTEX_EXCLUSION: u16 = 5002;
    pub const NAV_FENCE_CIRCLE_INCLUSION: u16 = 5003;
    pub const NAV_FENCE_CIRCLE_EXCLUSION: u16 = 5004;
    pub const NAV_RALLY_POINT: u16 = 5100;
}

// ---------------------------------------------------------------------------
// Coordinate
// ---------------------------------------------------------------------------

/// Geographic position. Latitude/longitude in degrees, altitude in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    // ---
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

// ---

impl Coordinate {
    // ---
    pub fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }

    /// Same position at a different altitude.
    pub fn with_alt(self, alt: f64) -> Self {
        Self { alt, ..self }
    }
}

// ---------------------------------------------------------------------------
// MavFrame
// ---------------------------------------------------------------------------

/// Coordinate frame of a mission item's `x`/`y`/`z` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MavFrame {
    Global,
    LocalNed,
    Mission,
    GlobalRelativeAlt,
    GlobalTerrainAlt,
}

// ---------------------------------------------------------------------------
// MissionItem
// ---------------------------------------------------------------------------

/// A single simple item as it travels on the wire.
///
/// Mission waypoints, fence vertices and rally points all share this shape;
/// the `command` id tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionItem {
    // ---
    pub seq: u16,
    pub command: u16,
    pub frame: MavFrame,
    pub param1: f64,
    pub param2: f64,
    pub param3: f64,
    pub param4: f64,
    /// Latitude for global frames.
    pub x: f64,
    /// Longitude for global frames.
    pub y: f64,
    /// Altitude.
    pub z: f64,
    pub autocontinue: bool,
    pub version: u32,
}

// ---

impl MissionItem {
    // ---
    /// Item with all parameters zeroed, `seq` 0, current schema version.
    pub fn new(command: u16, frame: MavFrame) -> Self {
        // ---
        Self {
            seq: 0,
            command,
            frame,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            autocontinue: true,
            version: ITEM_SCHEMA_VERSION,
        }
    }

    // ---

    /// Positional item at `coord` in the relative-altitude frame.
    pub fn at(command: u16, coord: Coordinate) -> Self {
        // ---
        let mut item = Self::new(command, MavFrame::GlobalRelativeAlt);
        item.x = coord.lat;
        item.y = coord.lon;
        item.z = coord.alt;
        item
    }

    /// Plain waypoint at `coord`.
    pub fn waypoint(coord: Coordinate) -> Self {
        Self::at(cmd::NAV_WAYPOINT, coord)
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.x, self.y, self.z)
    }

    pub fn params(&self) -> [f64; 7] {
        [
            self.param1,
            self.param2,
            self.param3,
            self.param4,
            self.x,
            self.y,
            self.z,
        ]
    }
}

// ---------------------------------------------------------------------------
// ComplexItem
// ---------------------------------------------------------------------------

/// Pattern items produced by the planning front end.
///
/// Path geometry (transects, scan layers) arrives pre-computed; this crate
/// only flattens it into simple items for transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "complexItemType", rename_all = "camelCase")]
pub enum ComplexItem {
    // ---
    Survey {
        polygon: Vec<Coordinate>,
        /// Ordered path through the polygon, one point per transect end.
        transects: Vec<Coordinate>,
        altitude: f64,
        /// Camera trigger distance in metres; 0 disables triggering.
        trigger_distance: f64,
        version: u32,
    },

    StructureScan {
        /// Structure footprint, flown once per layer.
        polygon: Vec<Coordinate>,
        layers: u32,
        /// Altitude of the lowest layer.
        altitude: f64,
        layer_height: f64,
        version: u32,
    },

    CorridorScan {
        polyline: Vec<Coordinate>,
        width: f64,
        transects: Vec<Coordinate>,
        altitude: f64,
        trigger_distance: f64,
        version: u32,
    },
}

// ---

impl ComplexItem {
    // ---
    pub fn version(&self) -> u32 {
        match self {
            Self::Survey { version, .. }
            | Self::StructureScan { version, .. }
            | Self::CorridorScan { version, .. } => *version,
        }
    }

    // ---

    /// Flatten into simple items. Sequence numbers are left at 0; the
    /// caller renumbers the whole mission.
    pub fn expand(&self) -> Vec<MissionItem> {
        // ---
        match self {
            Self::Survey {
                transects,
                altitude,
                trigger_distance,
                ..
            }
            | Self::CorridorScan {
                transects,
                altitude,
                trigger_distance,
                ..
            } => {
                let mut items = Vec::with_capacity(transects.len() + 2);
                items.push(trigger_item(*trigger_distance));
                items.extend(
                    transects
                        .iter()
                        .map(|p| MissionItem::waypoint(p.with_alt(*altitude))),
                );
                items.push(trigger_item(0.0));
                items
            }

            Self::StructureScan {
                polygon,
                layers,
                altitude,
                layer_height,
                ..
            } => {
                let mut items = Vec::new();
                for layer in 0..*layers {
                    let alt = altitude + f64::from(layer) * layer_height;
                    // Close the loop back to the first vertex on every layer.
                    for p in polygon.iter().chain(polygon.first()) {
                        items.push(MissionItem::waypoint(p.with_alt(alt)));
                    }
                }
                items
            }
        }
    }
}

// ---

fn trigger_item(distance: f64) -> MissionItem {
    // ---
    let mut item = MissionItem::new(cmd::DO_SET_CAM_TRIGG_DIST, MavFrame::Mission);
    item.param1 = distance;
    item
}

// ---------------------------------------------------------------------------
// PlanItem
// ---------------------------------------------------------------------------

/// One entry of a mission as the planner sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanItem {
    // ---
    Simple(MissionItem),
    Complex(ComplexItem),
}

// ---

impl PlanItem {
    // ---
    pub fn version(&self) -> u32 {
        match self {
            Self::Simple(item) => item.version,
            Self::Complex(item) => item.version(),
        }
    }
}

// ---------------------------------------------------------------------------
// GeoFence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FencePolygon {
    // ---
    pub vertices: Vec<Coordinate>,
    /// `true` keeps the vehicle inside, `false` keeps it out.
    pub inclusion: bool,
    pub version: u32,
}

// ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FenceCircle {
    // ---
    pub center: Coordinate,
    /// Radius in metres.
    pub radius: f64,
    pub inclusion: bool,
    pub version: u32,
}

// ---

/// Inclusion/exclusion boundaries plus the point to fly to on breach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoFence {
    // ---
    pub polygons: Vec<FencePolygon>,
    pub circles: Vec<FenceCircle>,
    pub breach_return: Option<Coordinate>,
}

// ---

impl GeoFence {
    // ---
    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty() && self.circles.is_empty() && self.breach_return.is_none()
    }
}

// ---------------------------------------------------------------------------
// RallyPoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RallyPoint {
    // ---
    pub position: Coordinate,
    pub version: u32,
}

// ---

impl RallyPoint {
    pub fn new(position: Coordinate) -> Self {
        Self {
            position,
            version: ITEM_SCHEMA_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    // ---

    #[test]
    fn survey_expands_with_trigger_bracket() {
        // ---
        let survey = ComplexItem::Survey {
            polygon: vec![],
            transects: vec![
                Coordinate::new(47.0, 8.0, 0.0),
                Coordinate::new(47.001, 8.0, 0.0),
                Coordinate::new(47.001, 8.001, 0.0),
            ],
            altitude: 50.0,
            trigger_distance: 25.0,
            version: ITEM_SCHEMA_VERSION,
        };

        let items = survey.expand();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].command, cmd::DO_SET_CAM_TRIGG_DIST);
        assert_eq!(items[0].param1, 25.0);
        assert!(items[1..4]
            .iter()
            .all(|i| i.command == cmd::NAV_WAYPOINT && i.z == 50.0));
        assert_eq!(items[4].param1, 0.0, "trigger must be switched off at the end");
    }

    // ---

    #[test]
    fn structure_scan_flies_closed_loop_per_layer() {
        // ---
        let scan = ComplexItem::StructureScan {
            polygon: vec![
                Coordinate::new(47.0, 8.0, 0.0),
                Coordinate::new(47.0, 8.001, 0.0),
                Coordinate::new(47.001, 8.001, 0.0),
            ],
            layers: 2,
            altitude: 10.0,
            layer_height: 5.0,
            version: ITEM_SCHEMA_VERSION,
        };

        let items = scan.expand();
        assert_eq!(items.len(), 8, "3 vertices + closing vertex, two layers");
        assert_eq!(items[0].coordinate(), items[3].coordinate());
        assert_eq!(items[3].z, 10.0);
        assert_eq!(items[4].z, 15.0);
    }
}
