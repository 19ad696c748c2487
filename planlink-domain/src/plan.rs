use serde::{Deserialize, Serialize};

// ---

use super::collection::{
    fence_from_collection, fence_to_collection, rally_from_collection, rally_to_collection,
    Collection, CollectionType,
};
use super::error::{PlanLinkError, Result};
use super::item::{Coordinate, GeoFence, MissionItem, PlanItem, RallyPoint};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Everything the ground station synchronises with one vehicle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    // ---
    pub mission: Vec<PlanItem>,

    /// Planned home position. Kept with the plan, not transferred.
    pub home: Option<Coordinate>,

    pub fence: GeoFence,

    pub rally: Vec<RallyPoint>,
}

// ---

impl Plan {
    // ---
    /// Structural checks applied on load and before upload.
    ///
    /// Rejects malformed fences and any collection whose items carry mixed
    /// schema versions.
    pub fn validate(&self) -> Result<()> {
        // ---
        for (index, polygon) in self.fence.polygons.iter().enumerate() {
            if polygon.vertices.len() < 3 {
                return Err(PlanLinkError::Schema(format!(
                    "fence polygon {index} has {} vertices, need at least 3",
                    polygon.vertices.len()
                )));
            }
        }

        for (index, circle) in self.fence.circles.iter().enumerate() {
            if circle.radius.is_nan() || circle.radius <= 0.0 {
                return Err(PlanLinkError::Schema(format!(
                    "fence circle {index} has radius {}",
                    circle.radius
                )));
            }
        }

        single_version(
            CollectionType::Mission,
            self.mission.iter().map(PlanItem::version),
        )?;
        single_version(
            CollectionType::Fence,
            self.fence
                .polygons
                .iter()
                .map(|p| p.version)
                .chain(self.fence.circles.iter().map(|c| c.version)),
        )?;
        single_version(CollectionType::Rally, self.rally.iter().map(|r| r.version))?;

        Ok(())
    }

    // ---

    /// Mission items flattened for the wire; complex items are expanded in
    /// place.
    pub fn mission_collection(&self) -> Collection {
        // ---
        let items = self
            .mission
            .iter()
            .flat_map(|entry| match entry {
                PlanItem::Simple(item) => vec![item.clone()],
                PlanItem::Complex(complex) => complex.expand(),
            })
            .collect();
        Collection::from_items(CollectionType::Mission, items)
    }

    pub fn fence_collection(&self) -> Collection {
        fence_to_collection(&self.fence)
    }

    pub fn rally_collection(&self) -> Collection {
        rally_to_collection(&self.rally)
    }

    // ---

    /// Wire collection for `kind`.
    pub fn collection(&self, kind: CollectionType) -> Collection {
        match kind {
            CollectionType::Mission => self.mission_collection(),
            CollectionType::Fence => self.fence_collection(),
            CollectionType::Rally => self.rally_collection(),
        }
    }

    // ---

    /// Rebuild a plan from downloaded collections.
    ///
    /// Complex items cannot be recovered from the vehicle; the mission comes
    /// back as simple items only.
    pub fn from_collections(mission: Collection, fence: &Collection, rally: &Collection) -> Result<Self> {
        // ---
        Ok(Self {
            mission: mission
                .into_items()
                .into_iter()
                .map(PlanItem::Simple)
                .collect(),
            home: None,
            fence: fence_from_collection(fence)?,
            rally: rally_from_collection(rally)?,
        })
    }

    /// Convenience constructor for a mission of simple items.
    pub fn with_mission(items: Vec<MissionItem>) -> Self {
        Self {
            mission: items.into_iter().map(PlanItem::Simple).collect(),
            ..Default::default()
        }
    }
}

// ---

fn single_version(kind: CollectionType, mut versions: impl Iterator<Item = u32>) -> Result<()> {
    // ---
    let Some(first) = versions.next() else {
        return Ok(());
    };
    match versions.find(|v| *v != first) {
        Some(other) => Err(PlanLinkError::Schema(format!(
            "{kind} items mix schema versions {first} and {other}"
        ))),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
