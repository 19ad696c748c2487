//! On-disk plan documents.
//!
//! A plan file is a JSON document holding the mission, geofence and rally
//! points together with the planned home position:
//!
//! ```json
//! {
//!   "fileType": "Plan",
//!   "version": 1,
//!   "groundStation": "planlink",
//!   "mission": { "items": [], "plannedHomePosition": null },
//!   "geoFence": { "polygons": [], "circles": [], "breachReturn": null },
//!   "rallyPoints": { "points": [] }
//! }
//! ```
//!
//! Files written by a newer format version are refused rather than
//! silently downgraded.

use std::path::Path;

// ---

use serde::{Deserialize, Serialize};

// ---

use planlink_domain::{
    // ---
    Coordinate,
    FenceCircle,
    FencePolygon,
    GeoFence,
    Plan,
    PlanItem,
    PlanLinkError,
    RallyPoint,
    Result,
};

// ---

pub const PLAN_FILE_TYPE: &str = "Plan";

/// Format version written by this build.
pub const PLAN_FILE_VERSION: u32 = 1;

/// Oldest format version this build still reads.
pub const MIN_PLAN_FILE_VERSION: u32 = 1;

const GROUND_STATION: &str = "planlink";

// ---------------------------------------------------------------------------
// PlanFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    // ---
    pub file_type: String,
    pub version: u32,
    pub ground_station: String,
    pub mission: MissionSection,
    pub geo_fence: GeoFenceSection,
    pub rally_points: RallySection,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionSection {
    pub items: Vec<PlanItem>,
    pub planned_home_position: Option<Coordinate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoFenceSection {
    pub polygons: Vec<FencePolygon>,
    pub circles: Vec<FenceCircle>,
    pub breach_return: Option<Coordinate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RallySection {
    pub points: Vec<RallyPoint>,
}

// ---

impl PlanFile {
    // ---
    pub fn from_plan(plan: &Plan) -> Self {
        // ---
        Self {
            file_type: PLAN_FILE_TYPE.into(),
            version: PLAN_FILE_VERSION,
            ground_station: GROUND_STATION.into(),
            mission: MissionSection {
                items: plan.mission.clone(),
                planned_home_position: plan.home,
            },
            geo_fence: GeoFenceSection {
                polygons: plan.fence.polygons.clone(),
                circles: plan.fence.circles.clone(),
                breach_return: plan.fence.breach_return,
            },
            rally_points: RallySection {
                points: plan.rally.clone(),
            },
        }
    }

    /// Check the header, rebuild the plan and validate it structurally.
    pub fn into_plan(self) -> Result<Plan> {
        // ---
        if self.file_type != PLAN_FILE_TYPE {
            return Err(PlanLinkError::Schema(format!(
                "not a plan file (fileType {:?})",
                self.file_type
            )));
        }
        if self.version > PLAN_FILE_VERSION {
            return Err(PlanLinkError::Schema(format!(
                "plan file version {} is newer than supported version {PLAN_FILE_VERSION}",
                self.version
            )));
        }
        if self.version < MIN_PLAN_FILE_VERSION {
            return Err(PlanLinkError::Schema(format!(
                "plan file version {} is older than minimum supported version {MIN_PLAN_FILE_VERSION}",
                self.version
            )));
        }

        let plan = Plan {
            mission: self.mission.items,
            home: self.mission.planned_home_position,
            fence: GeoFence {
                polygons: self.geo_fence.polygons,
                circles: self.geo_fence.circles,
                breach_return: self.geo_fence.breach_return,
            },
            rally: self.rally_points.points,
        };
        plan.validate()?;
        Ok(plan)
    }

    // ---

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PlanLinkError::Schema(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PlanLinkError::Schema(format!("malformed plan file: {e}")))
    }
}

// ---

/// Write `plan` to `path`, replacing any existing file.
pub fn save_plan(plan: &Plan, path: impl AsRef<Path>) -> Result<()> {
    // ---
    let path = path.as_ref();
    let json = PlanFile::from_plan(plan).to_json()?;
    std::fs::write(path, json)?;
    tracing::info!(path = %path.display(), items = plan.mission.len(), "plan saved");
    Ok(())
}

/// Read and validate the plan stored at `path`.
pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan> {
    // ---
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let plan = PlanFile::from_json(&text)?.into_plan()?;
    tracing::info!(path = %path.display(), items = plan.mission.len(), "plan loaded");
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
