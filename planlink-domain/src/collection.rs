use std::fmt;

use serde::{Deserialize, Serialize};

// ---

use super::error::{PlanLinkError, Result};
use super::item::{cmd, Coordinate, FenceCircle, FencePolygon, GeoFence, MavFrame, MissionItem};
use super::item::{RallyPoint, ITEM_SCHEMA_VERSION};

// ---------------------------------------------------------------------------
// CollectionType
// ---------------------------------------------------------------------------

/// The three item collections synchronised with the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionType {
    Mission,
    Fence,
    Rally,
}

// ---

impl CollectionType {
    // ---
    /// Fixed transfer order used for whole-plan operations.
    pub const ALL: [CollectionType; 3] = [Self::Mission, Self::Fence, Self::Rally];

    /// MAV_MISSION_TYPE wire value.
    pub fn wire_id(self) -> u8 {
        match self {
            Self::Mission => 0,
            Self::Fence => 1,
            Self::Rally => 2,
        }
    }
}

// ---

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mission => "mission",
            Self::Fence => "geofence",
            Self::Rally => "rally",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Ordered, gapless sequence of wire items of one collection type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    // ---
    kind: CollectionType,
    items: Vec<MissionItem>,
}

// ---

impl Collection {
    // ---
    pub fn new(kind: CollectionType) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    // ---

    /// Build from items in order, assigning `seq = index`.
    pub fn from_items(kind: CollectionType, items: Vec<MissionItem>) -> Self {
        // ---
        let mut collection = Self { kind, items };
        collection.renumber();
        collection
    }

    // ---

    /// Build from items received over the wire, keeping their sequence
    /// numbers and rejecting gaps or mixed versions.
    pub fn from_wire(kind: CollectionType, items: Vec<MissionItem>) -> Result<Self> {
        // ---
        let collection = Self { kind, items };
        collection.validate()?;
        Ok(collection)
    }

    pub fn kind(&self) -> CollectionType {
        self.kind
    }

    pub fn items(&self) -> &[MissionItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<MissionItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, seq: u16) -> Option<&MissionItem> {
        self.items.get(usize::from(seq))
    }

    // ---

    /// Append at the end, taking the next sequence number.
    pub fn push(&mut self, mut item: MissionItem) {
        // ---
        item.seq = self.items.len() as u16;
        self.items.push(item);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    // ---

    /// Assign `seq = index` to every item.
    pub fn renumber(&mut self) {
        for (index, item) in self.items.iter_mut().enumerate() {
            item.seq = index as u16;
        }
    }

    // ---

    /// Structural checks required before a collection goes on the wire.
    ///
    /// Sequence numbers must run `0..N-1` without gaps, every item must carry
    /// the same schema version, and the count must fit the 16-bit sequence
    /// space.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.items.len() > usize::from(u16::MAX) {
            return Err(PlanLinkError::Schema(format!(
                "{} collection holds {} items, limit is {}",
                self.kind,
                self.items.len(),
                u16::MAX
            )));
        }

        for (index, item) in self.items.iter().enumerate() {
            if usize::from(item.seq) != index {
                return Err(PlanLinkError::Schema(format!(
                    "{} item at index {index} carries seq {}",
                    self.kind, item.seq
                )));
            }
        }

        if let Some(first) = self.items.first() {
            if let Some(odd) = self.items.iter().find(|i| i.version != first.version) {
                return Err(PlanLinkError::Schema(format!(
                    "{} collection mixes schema versions {} and {}",
                    self.kind, first.version, odd.version
                )));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fence wire encoding
// ---------------------------------------------------------------------------

/// Flatten a geofence into its wire collection.
///
/// Polygons emit one item per vertex with `param1` holding the vertex
/// count; circles emit one item with `param1` holding the radius.
pub fn fence_to_collection(fence: &GeoFence) -> Collection {
    // ---
    let mut collection = Collection::new(CollectionType::Fence);

    for polygon in &fence.polygons {
        let command = if polygon.inclusion {
            cmd::NAV_FENCE_POLYGON_VERTEX_INCLUSION
        } else {
            cmd::NAV_FENCE_POLYGON_VERTEX_EXCLUSION
        };
        for vertex in &polygon.vertices {
            let mut item = global_item(command, *vertex, polygon.version);
            item.param1 = polygon.vertices.len() as f64;
            collection.push(item);
        }
    }

    for circle in &fence.circles {
        let command = if circle.inclusion {
            cmd::NAV_FENCE_CIRCLE_INCLUSION
        } else {
            cmd::NAV_FENCE_CIRCLE_EXCLUSION
        };
        let mut item = global_item(command, circle.center, circle.version);
        item.param1 = circle.radius;
        collection.push(item);
    }

    if let Some(point) = fence.breach_return {
        collection.push(global_item(
            cmd::NAV_FENCE_RETURN_POINT,
            point,
            ITEM_SCHEMA_VERSION,
        ));
    }

    collection
}

// ---

/// Rebuild a geofence from a downloaded wire collection.
pub fn fence_from_collection(collection: &Collection) -> Result<GeoFence> {
    // ---
    let mut fence = GeoFence::default();
    let items = collection.items();
    let mut index = 0;

    while index < items.len() {
        let item = &items[index];
        match item.command {
            cmd::NAV_FENCE_POLYGON_VERTEX_INCLUSION | cmd::NAV_FENCE_POLYGON_VERTEX_EXCLUSION => {
                let count = item.param1 as usize;
                if count < 3 || index + count > items.len() {
                    return Err(PlanLinkError::ProtocolViolation(format!(
                        "fence polygon at seq {} declares {count} vertices",
                        item.seq
                    )));
                }
                let run = &items[index..index + count];
                if run
                    .iter()
                    .any(|v| v.command != item.command || v.param1 as usize != count)
                {
                    return Err(PlanLinkError::ProtocolViolation(format!(
                        "fence polygon starting at seq {} is truncated",
                        item.seq
                    )));
                }
                fence.polygons.push(FencePolygon {
                    vertices: run.iter().map(MissionItem::coordinate).collect(),
                    inclusion: item.command == cmd::NAV_FENCE_POLYGON_VERTEX_INCLUSION,
                    version: item.version,
                });
                index += count;
            }

            cmd::NAV_FENCE_CIRCLE_INCLUSION | cmd::NAV_FENCE_CIRCLE_EXCLUSION => {
                fence.circles.push(FenceCircle {
                    center: item.coordinate(),
                    radius: item.param1,
                    inclusion: item.command == cmd::NAV_FENCE_CIRCLE_INCLUSION,
                    version: item.version,
                });
                index += 1;
            }

            cmd::NAV_FENCE_RETURN_POINT => {
                fence.breach_return = Some(item.coordinate());
                index += 1;
            }

            other => {
                return Err(PlanLinkError::ProtocolViolation(format!(
                    "unexpected command {other} at seq {} in fence collection",
                    item.seq
                )));
            }
        }
    }

    Ok(fence)
}

// ---------------------------------------------------------------------------
// Rally wire encoding
// ---------------------------------------------------------------------------

pub fn rally_to_collection(points: &[RallyPoint]) -> Collection {
    // ---
    let items = points
        .iter()
        .map(|p| global_item(cmd::NAV_RALLY_POINT, p.position, p.version))
        .collect();
    Collection::from_items(CollectionType::Rally, items)
}

// ---

pub fn rally_from_collection(collection: &Collection) -> Result<Vec<RallyPoint>> {
    // ---
    collection
        .items()
        .iter()
        .map(|item| {
            if item.command != cmd::NAV_RALLY_POINT {
                return Err(PlanLinkError::ProtocolViolation(format!(
                    "unexpected command {} at seq {} in rally collection",
                    item.command, item.seq
                )));
            }
            Ok(RallyPoint {
                position: item.coordinate(),
                version: item.version,
            })
        })
        .collect()
}

// ---

fn global_item(command: u16, coord: Coordinate, version: u32) -> MissionItem {
    // ---
    let mut item = MissionItem::at(command, coord);
    item.frame = MavFrame::Global;
    item.version = version;
    item
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
