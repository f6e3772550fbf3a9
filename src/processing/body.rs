//! Body-tracking stream processing.
//!
//! The driver delivers each body frame as a serialized array of body
//! records. For every tracked body this worker smooths the joint positions,
//! derives spine-relative velocities and movement vectors, computes the
//! center of mass and bounding box, scores overall confidence, and watches
//! the right hand for swipe gestures. Gesture and movement results go out on
//! the side channel next to the main artifact.
//!
//! Joints are keyed by canonical camelCase names; the anchor joints are
//! `spineMid` and `handRight`.

use super::{ProcessOutput, SideEvent};
use crate::error::ProcessError;
use crate::frame::{
    Aabb, BodyArtifact, FramePayload, Gesture, GestureEvent, MovementEvent, RawBody, RawJoint,
    TrackedBody, TrackedJoint, Vec3,
};
use std::collections::{BTreeMap, HashMap};

pub const SPINE_JOINT: &str = "spineMid";
pub const RIGHT_HAND_JOINT: &str = "handRight";

#[derive(Debug, Clone)]
pub struct Smoothing {
    /// Blend factor toward the previous position.
    pub correction: f32,
    /// Clamp on per-frame travel, meters.
    pub max_deviation: f32,
    /// Movements below this radius snap back to the previous position.
    pub jitter_radius: f32,
}

#[derive(Debug, Clone)]
pub struct BodyParams {
    pub smoothing: Smoothing,
    /// Joints to smooth; all joints when unset.
    pub smooth_joints: Option<Vec<String>>,
    pub compute_velocity: bool,
    pub compute_bounds: bool,
    pub compute_confidence: bool,
    /// Spine-relative horizontal displacement, meters, that registers a
    /// swipe.
    pub gesture_threshold: f32,
}

struct BodyHistory {
    relative: BTreeMap<String, Vec3>,
    right_hand_relative: Option<Vec3>,
    timestamp_ms: u64,
}

pub struct BodyProcessor {
    params: BodyParams,
    history: HashMap<u64, BodyHistory>,
}

impl BodyProcessor {
    pub fn new(params: BodyParams) -> Self {
        Self {
            params,
            history: HashMap::new(),
        }
    }

    pub fn process(
        &mut self,
        data: &[u8],
        timestamp_ms: u64,
    ) -> Result<ProcessOutput, ProcessError> {
        let raw: Vec<RawBody> = serde_json::from_slice(data)
            .map_err(|err| ProcessError::MalformedBody(err.to_string()))?;

        let mut bodies = Vec::new();
        let mut side_events = Vec::new();
        let mut seen = Vec::new();

        for body in raw.into_iter().filter(|b| b.tracked) {
            if body.joints.is_empty() {
                return Err(ProcessError::MalformedBody(format!(
                    "tracked body {} has no joints",
                    body.tracking_id
                )));
            }
            seen.push(body.tracking_id);
            let tracked = self.process_body(body, timestamp_ms, &mut side_events)?;
            bodies.push(tracked);
        }

        // Forget bodies that left the scene.
        self.history.retain(|id, _| seen.contains(id));

        Ok(ProcessOutput {
            width: 0,
            height: 0,
            payload: FramePayload::Body(BodyArtifact {
                bodies,
                timestamp_ms,
            }),
            side_events,
        })
    }

    fn process_body(
        &mut self,
        body: RawBody,
        timestamp_ms: u64,
        side_events: &mut Vec<SideEvent>,
    ) -> Result<TrackedBody, ProcessError> {
        let mut joints = BTreeMap::new();
        for (name, joint) in &body.joints {
            let position = if self.should_smooth(name) {
                self.smooth(joint)
            } else {
                joint.position
            };
            joints.insert(
                name.clone(),
                TrackedJoint {
                    position,
                    tracking_state: joint.tracking_state,
                    confidence: joint.confidence,
                },
            );
        }

        let spine = joints.get(SPINE_JOINT).map(|j| j.position);
        let previous = self.history.remove(&body.tracking_id);

        let mut velocities = None;
        if self.params.compute_velocity {
            if let Some(spine) = spine {
                let relative: BTreeMap<String, Vec3> = joints
                    .iter()
                    .map(|(name, joint)| (name.clone(), joint.position.sub(spine)))
                    .collect();
                if let Some(prev) = previous.as_ref() {
                    let dt_ms = timestamp_ms.saturating_sub(prev.timestamp_ms);
                    let dt_secs = (dt_ms as f32 / 1_000.0).max(1e-3);
                    let mut movement = BTreeMap::new();
                    let mut velocity = BTreeMap::new();
                    for (name, rel) in &relative {
                        if let Some(prev_rel) = prev.relative.get(name) {
                            let delta = rel.sub(*prev_rel);
                            movement.insert(name.clone(), delta);
                            velocity.insert(name.clone(), delta.scale(1.0 / dt_secs));
                        }
                    }
                    if !movement.is_empty() {
                        side_events.push(SideEvent::Movement(MovementEvent {
                            tracking_id: body.tracking_id,
                            joints: movement,
                            timestamp_ms,
                        }));
                    }
                    velocities = Some(velocity);
                }
            }
        }

        if let (Some(spine), Some(hand)) = (spine, joints.get(RIGHT_HAND_JOINT)) {
            let relative = hand.position.sub(spine);
            if let Some(prev_rel) = previous.as_ref().and_then(|p| p.right_hand_relative) {
                let dx = relative.x - prev_rel.x;
                if dx.abs() > self.params.gesture_threshold && relative.y > 0.0 {
                    let gesture = if dx < 0.0 {
                        Gesture::SwipeLeft
                    } else {
                        Gesture::SwipeRight
                    };
                    side_events.push(SideEvent::Gesture(GestureEvent {
                        tracking_id: body.tracking_id,
                        gesture,
                        displacement: dx,
                        timestamp_ms,
                    }));
                }
            }
        }

        let tracked_positions: Vec<(Vec3, f32)> = joints
            .values()
            .filter(|j| j.tracking_state > 0)
            .map(|j| (j.position, j.confidence))
            .collect();

        let (center_of_mass, bounds) = if self.params.compute_bounds
            && !tracked_positions.is_empty()
        {
            let count = tracked_positions.len() as f32;
            let sum = tracked_positions
                .iter()
                .fold(Vec3::default(), |acc, (p, _)| acc.add(*p));
            let mut min = tracked_positions[0].0;
            let mut max = tracked_positions[0].0;
            for (p, _) in &tracked_positions {
                min.x = min.x.min(p.x);
                min.y = min.y.min(p.y);
                min.z = min.z.min(p.z);
                max.x = max.x.max(p.x);
                max.y = max.y.max(p.y);
                max.z = max.z.max(p.z);
            }
            (Some(sum.scale(1.0 / count)), Some(Aabb { min, max }))
        } else {
            (None, None)
        };

        let confidence = if self.params.compute_confidence && !tracked_positions.is_empty() {
            let total: f32 = tracked_positions.iter().map(|(_, c)| c).sum();
            Some(total / tracked_positions.len() as f32)
        } else {
            None
        };

        // Record this frame for the next one.
        if let Some(spine) = spine {
            let relative: BTreeMap<String, Vec3> = joints
                .iter()
                .map(|(name, joint)| (name.clone(), joint.position.sub(spine)))
                .collect();
            let right_hand_relative = joints.get(RIGHT_HAND_JOINT).map(|j| j.position.sub(spine));
            self.history.insert(
                body.tracking_id,
                BodyHistory {
                    relative,
                    right_hand_relative,
                    timestamp_ms,
                },
            );
        }

        Ok(TrackedBody {
            tracking_id: body.tracking_id,
            joints,
            velocities,
            center_of_mass,
            bounds,
            confidence,
            hand_left_state: body.hand_left_state,
            hand_right_state: body.hand_right_state,
        })
    }

    fn should_smooth(&self, name: &str) -> bool {
        match &self.params.smooth_joints {
            Some(filter) => filter.iter().any(|j| j == name),
            None => true,
        }
    }

    /// Blend toward the previous position, clamp large jumps along the
    /// travel segment, snap jitter back to the previous position.
    fn smooth(&self, joint: &RawJoint) -> Vec3 {
        let Some(prev) = joint.previous_position else {
            return joint.position;
        };
        let s = &self.params.smoothing;
        let blended = joint
            .position
            .scale(1.0 - s.correction)
            .add(prev.scale(s.correction));
        let delta = blended.sub(prev);
        let distance = delta.length();
        if distance > s.max_deviation {
            return prev.add(delta.scale(s.max_deviation / distance));
        }
        if distance < s.jitter_radius {
            return prev;
        }
        blended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HandState;

    fn params() -> BodyParams {
        BodyParams {
            smoothing: Smoothing {
                correction: 0.25,
                max_deviation: 0.1,
                jitter_radius: 0.005,
            },
            smooth_joints: None,
            compute_velocity: true,
            compute_bounds: true,
            compute_confidence: true,
            gesture_threshold: 0.2,
        }
    }

    fn joint(x: f32, y: f32, z: f32, prev: Option<Vec3>) -> RawJoint {
        RawJoint {
            position: Vec3 { x, y, z },
            tracking_state: 2,
            confidence: 0.8,
            previous_position: prev,
        }
    }

    fn body(id: u64, joints: Vec<(&str, RawJoint)>) -> RawBody {
        RawBody {
            tracking_id: id,
            tracked: true,
            joints: joints
                .into_iter()
                .map(|(name, j)| (name.to_string(), j))
                .collect(),
            hand_left_state: HandState::Unknown,
            hand_right_state: HandState::Unknown,
        }
    }

    fn encode(bodies: &[RawBody]) -> Vec<u8> {
        serde_json::to_vec(bodies).unwrap()
    }

    fn process(
        processor: &mut BodyProcessor,
        bodies: &[RawBody],
        ts: u64,
    ) -> (BodyArtifact, Vec<SideEvent>) {
        let output = processor.process(&encode(bodies), ts).unwrap();
        match output.payload {
            FramePayload::Body(artifact) => (artifact, output.side_events),
            _ => panic!("expected body payload"),
        }
    }

    #[test]
    fn test_smoothing_blend() {
        let mut processor = BodyProcessor::new(params());
        let prev = Vec3 { x: 0.0, y: 0.0, z: 2.0 };
        let b = body(
            1,
            vec![("spineMid", joint(0.04, 0.0, 2.0, Some(prev)))],
        );
        let (artifact, _) = process(&mut processor, &[b], 0);
        // Blend: 0.04 * 0.75 = 0.03, within deviation and above jitter.
        let pos = artifact.bodies[0].joints["spineMid"].position;
        assert!((pos.x - 0.03).abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_clamps_large_jump() {
        let mut processor = BodyProcessor::new(params());
        let prev = Vec3 { x: 0.0, y: 0.0, z: 2.0 };
        let b = body(1, vec![("spineMid", joint(1.0, 0.0, 2.0, Some(prev)))]);
        let (artifact, _) = process(&mut processor, &[b], 0);
        // 0.75 m of travel clamps to the 0.1 m deviation limit.
        let pos = artifact.bodies[0].joints["spineMid"].position;
        assert!((pos.x - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_smoothing_snaps_jitter() {
        let mut processor = BodyProcessor::new(params());
        let prev = Vec3 { x: 0.5, y: 0.1, z: 2.0 };
        let b = body(
            1,
            vec![("spineMid", joint(0.501, 0.1, 2.0, Some(prev)))],
        );
        let (artifact, _) = process(&mut processor, &[b], 0);
        let pos = artifact.bodies[0].joints["spineMid"].position;
        assert_eq!(pos.x, 0.5);
    }

    #[test]
    fn test_center_of_mass_and_bounds() {
        let mut processor = BodyProcessor::new(params());
        let b = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("head", joint(0.0, 0.5, 2.0, None)),
                ("handRight", joint(0.4, 0.1, 2.2, None)),
            ],
        );
        let (artifact, _) = process(&mut processor, &[b], 0);
        let tracked = &artifact.bodies[0];
        let com = tracked.center_of_mass.unwrap();
        assert!((com.y - 0.2).abs() < 1e-6);
        let bounds = tracked.bounds.unwrap();
        assert_eq!(bounds.min.x, 0.0);
        assert_eq!(bounds.max.x, 0.4);
        assert_eq!(bounds.max.z, 2.2);
        assert!((tracked.confidence.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_untracked_joints_excluded_from_bounds() {
        let mut processor = BodyProcessor::new(params());
        let mut far = joint(9.0, 9.0, 9.0, None);
        far.tracking_state = 0;
        let b = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("ankleLeft", far),
            ],
        );
        let (artifact, _) = process(&mut processor, &[b], 0);
        let bounds = artifact.bodies[0].bounds.unwrap();
        assert_eq!(bounds.max.x, 0.0);
    }

    #[test]
    fn test_velocity_and_movement() {
        let mut processor = BodyProcessor::new(params());
        let first = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.1, 0.1, 2.0, None)),
            ],
        );
        let (_, events) = process(&mut processor, &[first], 0);
        assert!(events.is_empty());

        let second = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.2, 0.1, 2.0, None)),
            ],
        );
        let (artifact, events) = process(&mut processor, &[second], 100);
        let velocities = artifact.bodies[0].velocities.as_ref().unwrap();
        // 0.1 m in 100 ms is 1 m/s.
        assert!((velocities["handRight"].x - 1.0).abs() < 1e-4);
        assert!(events
            .iter()
            .any(|e| matches!(e, SideEvent::Movement(_))));
    }

    #[test]
    fn test_swipe_right_detection() {
        let mut processor = BodyProcessor::new(params());
        let first = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.0, 0.2, 2.0, None)),
            ],
        );
        process(&mut processor, &[first], 0);

        let second = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.3, 0.2, 2.0, None)),
            ],
        );
        let (_, events) = process(&mut processor, &[second], 33);
        let gesture = events
            .iter()
            .find_map(|e| match e {
                SideEvent::Gesture(g) => Some(g),
                _ => None,
            })
            .expect("gesture detected");
        assert_eq!(gesture.gesture, Gesture::SwipeRight);
    }

    #[test]
    fn test_swipe_left_detection() {
        let mut processor = BodyProcessor::new(params());
        let first = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.3, 0.2, 2.0, None)),
            ],
        );
        process(&mut processor, &[first], 0);

        let second = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.0, 0.2, 2.0, None)),
            ],
        );
        let (_, events) = process(&mut processor, &[second], 33);
        let gesture = events
            .iter()
            .find_map(|e| match e {
                SideEvent::Gesture(g) => Some(g),
                _ => None,
            })
            .expect("gesture detected");
        assert_eq!(gesture.gesture, Gesture::SwipeLeft);
    }

    #[test]
    fn test_no_gesture_below_spine() {
        let mut processor = BodyProcessor::new(params());
        let first = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.0, -0.2, 2.0, None)),
            ],
        );
        process(&mut processor, &[first], 0);

        let second = body(
            1,
            vec![
                ("spineMid", joint(0.0, 0.0, 2.0, None)),
                ("handRight", joint(0.3, -0.2, 2.0, None)),
            ],
        );
        let (_, events) = process(&mut processor, &[second], 33);
        assert!(!events.iter().any(|e| matches!(e, SideEvent::Gesture(_))));
    }

    #[test]
    fn test_untracked_bodies_skipped() {
        let mut processor = BodyProcessor::new(params());
        let mut ghost = body(7, vec![("spineMid", joint(0.0, 0.0, 2.0, None))]);
        ghost.tracked = false;
        let (artifact, _) = process(&mut processor, &[ghost], 0);
        assert!(artifact.bodies.is_empty());
    }

    #[test]
    fn test_tracked_body_without_joints_is_malformed() {
        let mut processor = BodyProcessor::new(params());
        let empty = RawBody {
            tracking_id: 2,
            tracked: true,
            joints: BTreeMap::new(),
            hand_left_state: HandState::Unknown,
            hand_right_state: HandState::Unknown,
        };
        let err = processor.process(&encode(&[empty]), 0).unwrap_err();
        assert!(matches!(err, ProcessError::MalformedBody(_)));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut processor = BodyProcessor::new(params());
        let err = processor.process(b"not json", 0).unwrap_err();
        assert!(matches!(err, ProcessError::MalformedBody(_)));
    }
}
