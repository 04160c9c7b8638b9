//! Message types exchanged by the sensor-fusion simulation
//!
//! The bus does not interpret any of these; they are the shapes the clock,
//! camera, LiDAR, pose and fusion services agree on.

use crate::message::{Broadcast, Event};
use serde::{Deserialize, Serialize};

// ============================================================================
// Broadcasts
// ============================================================================

/// Periodic clock tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickBroadcast {
    pub tick: u32,

    /// Set on the last tick of the run
    pub is_final: bool,
}

impl TickBroadcast {
    pub fn new(tick: u32, duration: u32) -> Self {
        Self {
            tick,
            is_final: tick >= duration,
        }
    }
}

impl Broadcast for TickBroadcast {}

/// The sender has finished and is shutting down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminatedBroadcast {
    pub sender: String,
}

impl Broadcast for TerminatedBroadcast {}

/// A sensor failed; services depending on it should stop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashedBroadcast {
    pub sensor: String,
    pub reason: String,
}

impl Broadcast for CrashedBroadcast {}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub id: String,
    pub description: String,
}

/// Camera detections for one tick. Resolves to `true` once a tracker took them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectObjectsEvent {
    pub time: u32,
    pub objects: Vec<DetectedObject>,
}

impl Event for DetectObjectsEvent {
    type Output = bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: String,
    pub time: u32,
    pub description: String,
    pub coordinates: Vec<CloudPoint>,
}

/// Range-sensor observations. Resolves to the number of landmarks in the map
/// after they were merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObjectsEvent {
    pub time: u32,
    pub objects: Vec<TrackedObject>,
}

impl Event for TrackedObjectsEvent {
    type Output = usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub yaw: f32,
    pub time: u32,
}

/// Robot pose at a tick. Resolves to `true` once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseEvent {
    pub pose: Pose,
}

impl Event for PoseEvent {
    type Output = bool;
}
