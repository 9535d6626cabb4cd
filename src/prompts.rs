//! Prompt ingestion and aggregation.
//!
//! Raw prompts arrive from the annotation UI as loosely-shaped JSON (a single
//! point or a list of points). This module normalizes them at the boundary
//! into one uniform, ordered point type and groups them by (frame, object),
//! which is the unit the segmentation engine accepts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Engine convention: 1 = foreground, 0 = background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromptLabel {
    Background,
    Foreground,
}

impl PromptLabel {
    pub fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(PromptLabel::Background),
            1 => Some(PromptLabel::Foreground),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            PromptLabel::Background => 0,
            PromptLabel::Foreground => 1,
        }
    }
}

/// One prompt point as it appears on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RawPrompt {
    pub frame_index: usize,
    pub object_id: u32,
    /// X coordinate in video pixel space.
    pub x: f32,
    /// Y coordinate in video pixel space.
    pub y: f32,
    /// Point label: 1 = foreground, 0 = background.
    pub label: i32,
}

/// Wire payload: the UI sometimes sends a single prompt and sometimes a list.
/// Deserializing through this enum removes the shape difference before any
/// other code runs.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PromptPayload {
    One(RawPrompt),
    Many(Vec<RawPrompt>),
}

impl PromptPayload {
    pub fn into_vec(self) -> Vec<RawPrompt> {
        match self {
            PromptPayload::One(p) => vec![p],
            PromptPayload::Many(ps) => ps,
        }
    }
}

/// A validated prompt point. Immutable once created; `seq` is the position in
/// the original ingestion order and fixes replacement ordering downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPoint {
    pub frame_index: usize,
    pub object_id: u32,
    pub x: f32,
    pub y: f32,
    pub label: PromptLabel,
    pub seq: u64,
}

/// The complete, ordered point set for one (frame, object) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptGroup {
    pub frame_index: usize,
    pub object_id: u32,
    pub points: Vec<PromptPoint>,
}

impl PromptGroup {
    /// Resolve a re-submission for a (frame, object) key that already has a
    /// group: the incoming group fully replaces the previous one.
    ///
    /// Assumption, isolated here on purpose: the engine's submit contract is
    /// "replace old points", so a group is always the complete current point
    /// set for its key. If merge semantics are ever wanted instead, this is
    /// the only function to change.
    pub fn override_with(_previous: Option<PromptGroup>, incoming: PromptGroup) -> PromptGroup {
        incoming
    }

    /// Point coordinates in submission order, `[[x, y]; n]`.
    pub fn coordinates(&self) -> Vec<[f32; 2]> {
        self.points.iter().map(|p| [p.x, p.y]).collect()
    }

    /// Wire labels in submission order.
    pub fn labels(&self) -> Vec<i32> {
        self.points.iter().map(|p| p.label.to_wire()).collect()
    }
}

pub type GroupKey = (usize, u32);

/// A prompt that failed validation, with the reason it was dropped.
#[derive(Debug)]
pub struct RejectedPrompt {
    pub prompt: RawPrompt,
    pub reason: Error,
}

/// Result of ingesting a prompt batch: the canonical grouping plus every
/// rejected point, so callers can report exactly what was dropped.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub groups: BTreeMap<GroupKey, PromptGroup>,
    pub rejected: Vec<RejectedPrompt>,
}

/// Group a raw prompt batch into canonical per-(frame, object) point sets.
///
/// Deterministic and idempotent: the same input sequence always produces the
/// same grouping, with within-group order fixed by ingestion order. A point
/// with an out-of-bounds frame index or an unknown label is rejected on its
/// own; the rest of the batch is unaffected.
pub fn ingest(raw: impl IntoIterator<Item = RawPrompt>, frame_count: usize) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();

    for (seq, prompt) in raw.into_iter().enumerate() {
        let label = match PromptLabel::from_wire(prompt.label) {
            Some(label) => label,
            None => {
                tracing::warn!(
                    "Rejecting prompt for frame {} object {}: label {} is not 0/1",
                    prompt.frame_index,
                    prompt.object_id,
                    prompt.label
                );
                let reason = Error::InvalidPrompt {
                    frame_index: prompt.frame_index,
                    object_id: prompt.object_id,
                    reason: format!("label {} is not foreground(1)/background(0)", prompt.label),
                };
                outcome.rejected.push(RejectedPrompt { prompt, reason });
                continue;
            }
        };

        if prompt.frame_index >= frame_count {
            tracing::warn!(
                "Rejecting prompt for frame {} object {}: video has {} frames",
                prompt.frame_index,
                prompt.object_id,
                frame_count
            );
            let reason = Error::InvalidPrompt {
                frame_index: prompt.frame_index,
                object_id: prompt.object_id,
                reason: format!("frame index outside video bounds (0..{frame_count})"),
            };
            outcome.rejected.push(RejectedPrompt { prompt, reason });
            continue;
        }

        let point = PromptPoint {
            frame_index: prompt.frame_index,
            object_id: prompt.object_id,
            x: prompt.x,
            y: prompt.y,
            label,
            seq: seq as u64,
        };

        outcome
            .groups
            .entry((point.frame_index, point.object_id))
            .or_insert_with(|| PromptGroup {
                frame_index: point.frame_index,
                object_id: point.object_id,
                points: Vec::new(),
            })
            .points
            .push(point);
    }

    outcome
}
