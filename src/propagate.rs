//! Propagation driver: turns submitted prompt groups into frame-ordered
//! masks, single-frame or whole-video, writing into the session's mask
//! buffer.
//!
//! One propagation stream per session at a time. The stream is lazy and
//! non-restartable; overlapping requests fail `SessionBusy` instead of
//! queuing, so the single-writer engine state is never interleaved.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver};

use crate::engine::FramePrediction;
use crate::error::{Error, Result};
use crate::prompts::PromptGroup;
use crate::session::Session;

/// Outcome of a completed propagation.
#[derive(Debug, Clone)]
pub struct PropagationReport {
    pub start_frame: usize,
    /// Frame indices written, in arrival order.
    pub frames_written: Vec<usize>,
}

/// Progress events streamed from a worker propagation.
#[derive(Debug)]
pub enum PropagationEvent {
    /// One frame's masks were written to the buffer.
    Frame {
        frame_index: usize,
        object_ids: Vec<u32>,
    },
    /// The stream is exhausted.
    Finished { frames_written: usize },
    /// The propagation aborted. Frames already written stay in the buffer;
    /// the session must be reset before the next propagation.
    Failed { error: Error },
}

/// Submit one prompt group and store the resulting masks for that frame only.
///
/// O(1) engine call, for immediate feedback while the user places points.
pub fn preview(session: &Arc<Session>, group: &PromptGroup) -> Result<FramePrediction> {
    let _guard = session.try_begin()?;
    let _span = tracing::debug_span!("preview", frame_index = group.frame_index).entered();

    let prediction = session.engine().submit_points(group)?;
    session
        .masks()
        .accept(prediction.frame_index, &prediction.object_ids, &prediction.masks)?;
    Ok(prediction)
}

/// Submit a batch of prompt groups without storing their responses, priming
/// the engine for a subsequent propagation.
pub fn submit_groups<'a>(
    session: &Arc<Session>,
    groups: impl IntoIterator<Item = &'a PromptGroup>,
) -> Result<()> {
    let _guard = session.try_begin()?;
    let mut engine = session.engine();

    for group in groups {
        tracing::debug!(
            "Submitting {} points for frame {} object {}",
            group.points.len(),
            group.frame_index,
            group.object_id
        );
        engine.submit_points(group)?;
    }
    Ok(())
}

/// Propagate masks across the video, blocking until the stream is exhausted.
///
/// Starts the engine stream at `start_frame`, bounded by `max_frames` when
/// given, and writes every yielded frame into the mask buffer in order.
pub fn propagate(
    session: &Arc<Session>,
    start_frame: usize,
    max_frames: Option<usize>,
) -> Result<PropagationReport> {
    let _guard = session.try_begin()?;
    let mut engine = session.engine();

    engine.begin_propagation(start_frame, max_frames)?;

    let mut expected = start_frame;
    let mut frames_written = Vec::new();
    loop {
        let prediction = match engine.next_prediction() {
            Ok(Some(prediction)) => prediction,
            Ok(None) => break,
            Err(error) => {
                engine.abort_propagation();
                return Err(error);
            }
        };

        check_frame_order(expected, prediction.frame_index);
        expected = prediction.frame_index + 1;

        if let Err(error) =
            session
                .masks()
                .accept(prediction.frame_index, &prediction.object_ids, &prediction.masks)
        {
            engine.abort_propagation();
            return Err(error);
        }
        frames_written.push(prediction.frame_index);
    }

    tracing::info!(
        "Propagation complete: {} frames written starting at {}",
        frames_written.len(),
        start_frame
    );

    Ok(PropagationReport {
        start_frame,
        frames_written,
    })
}

/// Extract a single frame from a full propagation stream.
///
/// Used when the preview must reflect propagated state rather than a
/// point-submission response: entries before `target_frame` are drained and
/// discarded; the first entry at or past it is stored and returned. Returns
/// `None` when the stream ends before reaching the target.
pub fn extract_frame(
    session: &Arc<Session>,
    start_frame: usize,
    target_frame: usize,
) -> Result<Option<FramePrediction>> {
    let _guard = session.try_begin()?;
    let mut engine = session.engine();

    engine.begin_propagation(start_frame, None)?;

    let extracted = loop {
        let prediction = match engine.next_prediction() {
            Ok(Some(prediction)) => prediction,
            Ok(None) => break None,
            Err(error) => {
                engine.abort_propagation();
                return Err(error);
            }
        };

        if prediction.frame_index < target_frame {
            tracing::debug!("Discarding intermediate frame {}", prediction.frame_index);
            continue;
        }
        if prediction.frame_index != target_frame {
            tracing::warn!(
                "Frame index mismatch: requested {}, engine yielded {}; using the yielded frame",
                target_frame,
                prediction.frame_index
            );
        }
        break Some(prediction);
    };

    // The rest of the stream is abandoned; release the cursor explicitly
    engine.abort_propagation();

    if let Some(prediction) = &extracted {
        session
            .masks()
            .accept(prediction.frame_index, &prediction.object_ids, &prediction.masks)?;
    }
    Ok(extracted)
}

/// Run a propagation on a dedicated worker thread, streaming one event per
/// written frame over a bounded channel.
///
/// The busy slot is claimed before the thread starts, so an overlapping call
/// fails `SessionBusy` synchronously. Dropping the receiver abandons the
/// stream: the worker notices at its next send, releases the cursor and
/// exits; frames already written stay in the buffer.
pub fn spawn_propagation(
    session: &Arc<Session>,
    start_frame: usize,
    max_frames: Option<usize>,
    capacity: usize,
) -> Result<Receiver<PropagationEvent>> {
    let guard = session.try_begin()?;
    let (tx, rx) = bounded(capacity);

    thread::Builder::new()
        .name("propagation".into())
        .spawn(move || {
            let session = Arc::clone(guard.session());
            let mut engine = session.engine();

            if let Err(error) = engine.begin_propagation(start_frame, max_frames) {
                let _ = tx.send(PropagationEvent::Failed { error });
                return;
            }

            let mut expected = start_frame;
            let mut frames_written = 0usize;
            loop {
                let prediction = match engine.next_prediction() {
                    Ok(Some(prediction)) => prediction,
                    Ok(None) => {
                        let _ = tx.send(PropagationEvent::Finished { frames_written });
                        break;
                    }
                    Err(error) => {
                        engine.abort_propagation();
                        let _ = tx.send(PropagationEvent::Failed { error });
                        break;
                    }
                };

                check_frame_order(expected, prediction.frame_index);
                expected = prediction.frame_index + 1;

                if let Err(error) = session.masks().accept(
                    prediction.frame_index,
                    &prediction.object_ids,
                    &prediction.masks,
                ) {
                    engine.abort_propagation();
                    let _ = tx.send(PropagationEvent::Failed { error });
                    break;
                }
                frames_written += 1;

                let event = PropagationEvent::Frame {
                    frame_index: prediction.frame_index,
                    object_ids: prediction.object_ids,
                };
                if tx.send(event).is_err() {
                    tracing::warn!(
                        "Propagation abandoned at frame {}; cursor released",
                        prediction.frame_index
                    );
                    engine.abort_propagation();
                    break;
                }
            }
        })?;

    Ok(rx)
}

/// Tolerate engine bookkeeping divergence: a yielded index that differs from
/// the expected one is logged and accepted, never fatal.
fn check_frame_order(expected: usize, yielded: usize) {
    if yielded != expected {
        tracing::warn!(
            "Frame index mismatch: expected {}, engine yielded {}; continuing with yielded frame",
            expected,
            yielded
        );
    }
}
