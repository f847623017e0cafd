//! The identification loop: frames in, at most one attendance mark out.
//!
//! Every frame goes WaitingFrame → (Detecting → Matching → Authorizing →
//! Recording, on processed frames) → Rendering. A stop can be observed at the
//! top of an iteration or after rendering, and moves the loop to Stopped.

use crate::preview::{FaceLabel, FrameView, PresentationSink, StatusLine};
use chrono::NaiveDate;
use rollcall_core::{
    matcher, AdmissionNumber, DetectedFace, EmbeddingProvider, Gallery, Identity, ProviderError,
};
use rollcall_hw::{CameraError, Frame, FrameSource, SourceGuard};
use rollcall_store::{AttendanceRecorder, RecordOutcome, RecordRequest, SessionIdentity};
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("frame read failed: {0}")]
    FrameRead(#[from] CameraError),
    #[error("gallery was built with {gallery}, provider is {provider}")]
    ProviderMismatch { gallery: String, provider: String },
}

/// Fixed 1-in-2 decimation; a session starts on a processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Process,
    Skip,
}

impl FramePhase {
    pub fn next(self) -> Self {
        match self {
            FramePhase::Process => FramePhase::Skip,
            FramePhase::Skip => FramePhase::Process,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    WaitingFrame,
    Detecting,
    Matching,
    Authorizing,
    Recording,
    Rendering,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The presentation sink asked to stop.
    Operator,
    /// The cancellation token fired (D-Bus `Stop`, daemon shutdown).
    Cancelled,
    Timeout,
}

/// End-of-session result reported to the student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// A record was created during this session.
    Marked,
    /// No record was created: one already existed, or the student was never
    /// recognized.
    AlreadyMarked,
    /// The student was recognized but every attempt to store the record
    /// failed.
    NotRecorded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub admission_no: AdmissionNumber,
    pub date: NaiveDate,
    pub outcome: SessionOutcome,
    /// The student's own face was matched at least once.
    pub recognized: bool,
    pub stop_reason: StopReason,
    pub frames: u32,
    pub processed_frames: u32,
    pub dark_frames: u32,
    pub persistence_failures: u32,
}

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub identity: SessionIdentity,
    /// Attendance date; fixed for the whole session.
    pub date: NaiveDate,
    pub tolerance: f32,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

pub struct IdentificationLoop<'a, S, P, R, K>
where
    S: FrameSource,
    P: EmbeddingProvider + ?Sized,
    R: AttendanceRecorder + ?Sized,
    K: PresentationSink + ?Sized,
{
    source: SourceGuard<S>,
    provider: &'a mut P,
    gallery: &'a Gallery,
    recorder: &'a R,
    sink: &'a mut K,
    admission_no: AdmissionNumber,
    display_name: String,
    request: RecordRequest,
    tolerance: f32,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    state: LoopState,
    phase: FramePhase,
    labels: Vec<FaceLabel>,
    already_marked: bool,
    created: bool,
    recognized: bool,
    stop_reason: Option<StopReason>,
    frames: u32,
    processed_frames: u32,
    dark_frames: u32,
    persistence_failures: u32,
}

impl<'a, S, P, R, K> IdentificationLoop<'a, S, P, R, K>
where
    S: FrameSource,
    P: EmbeddingProvider + ?Sized,
    R: AttendanceRecorder + ?Sized,
    K: PresentationSink + ?Sized,
{
    /// Take ownership of an open source; it is released when the loop is
    /// dropped, whichever way the session ends.
    pub fn new(
        source: S,
        provider: &'a mut P,
        gallery: &'a Gallery,
        recorder: &'a R,
        sink: &'a mut K,
        params: SessionParams,
    ) -> Result<Self, SessionError> {
        let source = SourceGuard::new(source);
        if !gallery.is_empty() && gallery.provider_version() != provider.version() {
            return Err(SessionError::ProviderMismatch {
                gallery: gallery.provider_version().to_string(),
                provider: provider.version().to_string(),
            });
        }

        Ok(Self {
            source,
            provider,
            gallery,
            recorder,
            sink,
            admission_no: AdmissionNumber::new(params.identity.admission_no.clone()),
            display_name: params.identity.full_name.clone(),
            request: RecordRequest::for_identity(&params.identity, params.date),
            tolerance: params.tolerance,
            deadline: params.timeout.map(|t| Instant::now() + t),
            cancel: params.cancel,
            state: LoopState::WaitingFrame,
            phase: FramePhase::Process,
            labels: Vec::new(),
            already_marked: false,
            created: false,
            recognized: false,
            stop_reason: None,
            frames: 0,
            processed_frames: 0,
            dark_frames: 0,
            persistence_failures: 0,
        })
    }

    #[cfg(test)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[cfg(test)]
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Run until stopped or the source fails.
    pub fn run(mut self) -> Result<SessionSummary, SessionError> {
        tracing::info!(
            gallery = self.gallery.len(),
            tolerance = self.tolerance,
            provider = self.provider.version(),
            "identification loop started"
        );
        while self.step()? != LoopState::Stopped {}
        Ok(self.summary())
    }

    /// Drive one frame through the loop. Returns the state the loop rests in
    /// afterwards: `WaitingFrame` or `Stopped`.
    pub fn step(&mut self) -> Result<LoopState, SessionError> {
        if self.state == LoopState::Stopped {
            return Ok(LoopState::Stopped);
        }
        if let Some(reason) = self.external_stop() {
            return Ok(self.stop(reason));
        }

        self.transition(LoopState::WaitingFrame);
        let frame = match self.source.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, frames = self.frames, "frame source failed");
                self.transition(LoopState::Stopped);
                return Err(e.into());
            }
        };
        self.frames += 1;

        let phase = self.phase;
        self.phase = phase.next();
        let processed = match phase {
            FramePhase::Skip => false,
            FramePhase::Process if frame.is_dark => {
                self.dark_frames += 1;
                self.labels.clear();
                tracing::trace!(sequence = frame.sequence, "dark frame, not processed");
                false
            }
            FramePhase::Process => {
                self.process(&frame);
                true
            }
        };

        self.transition(LoopState::Rendering);
        let status = self.status_line();
        let view = FrameView {
            sequence: frame.sequence,
            processed,
            faces: &self.labels,
            status,
            status_text: status.text(),
        };
        if let Err(e) = self.sink.render(&frame, &view) {
            tracing::warn!(error = %e, "render failed");
        }

        if self.sink.poll_stop() {
            return Ok(self.stop(StopReason::Operator));
        }
        if let Some(reason) = self.external_stop() {
            return Ok(self.stop(reason));
        }

        self.transition(LoopState::WaitingFrame);
        Ok(LoopState::WaitingFrame)
    }

    fn process(&mut self, frame: &Frame) {
        self.processed_frames += 1;

        self.transition(LoopState::Detecting);
        let faces = match self.detect_and_encode(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    sequence = frame.sequence,
                    "face pipeline failed on frame"
                );
                self.labels.clear();
                return;
            }
        };

        self.transition(LoopState::Matching);
        let matches: Vec<_> = faces
            .iter()
            .map(|face| {
                matcher::identify(
                    &*self.provider,
                    self.gallery.entries(),
                    &face.embedding,
                    self.tolerance,
                )
            })
            .collect();

        self.transition(LoopState::Authorizing);
        let mut labels = Vec::with_capacity(faces.len());
        let mut authorized_seen = false;
        for (face, result) in faces.into_iter().zip(matches) {
            let authorized = result.identity.admission_no() == Some(&self.admission_no);
            if let Identity::Matched(ref who) = result.identity {
                tracing::debug!(
                    admission_no = %who,
                    distance = result.distance,
                    authorized,
                    "face matched"
                );
            }
            authorized_seen |= authorized;
            let text = if authorized {
                self.display_name.clone()
            } else {
                "Unknown".to_string()
            };
            labels.push(FaceLabel {
                location: face.location,
                text,
                identity: result.identity,
                distance: result.distance,
                authorized,
            });
        }
        self.labels = labels;

        if authorized_seen {
            self.recognized = true;
            if !self.already_marked {
                self.transition(LoopState::Recording);
                self.record();
            }
        }
    }

    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, ProviderError> {
        let boxes = self.provider.detect(&frame.data, frame.width, frame.height)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self
            .provider
            .encode(&frame.data, frame.width, frame.height, &boxes)?;
        if embeddings.len() != boxes.len() {
            return Err(ProviderError::Misaligned {
                boxes: boxes.len(),
                embeddings: embeddings.len(),
            });
        }
        Ok(boxes
            .into_iter()
            .zip(embeddings)
            .map(|(location, embedding)| DetectedFace { location, embedding })
            .collect())
    }

    fn record(&mut self) {
        match self.recorder.record(&self.request) {
            Ok(RecordOutcome::Created) => {
                tracing::info!(
                    admission_no = %self.admission_no,
                    date = %self.request.date,
                    "attendance marked"
                );
                self.created = true;
                self.already_marked = true;
            }
            Ok(RecordOutcome::AlreadyPresent) => {
                tracing::info!(
                    admission_no = %self.admission_no,
                    date = %self.request.date,
                    "attendance already marked"
                );
                self.already_marked = true;
            }
            Err(e) => {
                // Retried on the next processed frame that matches.
                self.persistence_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = self.persistence_failures,
                    "failed to record attendance"
                );
            }
        }
    }

    fn status_line(&self) -> StatusLine {
        match (self.created, self.already_marked) {
            (true, _) => StatusLine::Marked,
            (false, true) => StatusLine::AlreadyMarked,
            (false, false) => StatusLine::Scanning,
        }
    }

    fn external_stop(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::Timeout),
            _ => None,
        }
    }

    fn stop(&mut self, reason: StopReason) -> LoopState {
        tracing::info!(?reason, frames = self.frames, "identification loop stopping");
        self.stop_reason = Some(reason);
        self.transition(LoopState::Stopped);
        LoopState::Stopped
    }

    fn transition(&mut self, next: LoopState) {
        tracing::trace!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }

    fn outcome(&self) -> SessionOutcome {
        if self.created {
            SessionOutcome::Marked
        } else if self.already_marked || self.persistence_failures == 0 {
            SessionOutcome::AlreadyMarked
        } else {
            SessionOutcome::NotRecorded
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            admission_no: self.admission_no.clone(),
            date: self.request.date,
            outcome: self.outcome(),
            recognized: self.recognized,
            stop_reason: self.stop_reason.unwrap_or(StopReason::Cancelled),
            frames: self.frames,
            processed_frames: self.processed_frames,
            dark_frames: self.dark_frames,
            persistence_failures: self.persistence_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview::RenderError;
    use rollcall_core::{BoundingBox, Embedding, GalleryEntry};
    use rollcall_store::{AttendanceStore, NewStudent, NewTeacher, StoreError};
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    const DAY: &str = "2024-05-01";

    fn day() -> NaiveDate {
        NaiveDate::parse_from_str(DAY, "%Y-%m-%d").unwrap()
    }

    /// Luma frame whose first pixel encodes the "face" seen on it; 0 means no face.
    fn frame(face: u8) -> Frame {
        let mut data = vec![128u8; 16];
        data[0] = face;
        Frame::from_luma(data, 4, 4, 0)
    }

    fn dark_frame() -> Frame {
        Frame::from_luma(vec![0u8; 16], 4, 4, 0)
    }

    struct Scripted {
        frames: VecDeque<Frame>,
        released: Rc<Cell<u32>>,
    }

    impl Scripted {
        fn new(frames: impl IntoIterator<Item = Frame>) -> (Self, Rc<Cell<u32>>) {
            let released = Rc::new(Cell::new(0));
            (Self { frames: frames.into_iter().collect(), released: released.clone() }, released)
        }

        fn repeat(face: u8, n: usize) -> (Self, Rc<Cell<u32>>) {
            Self::new((0..n).map(|_| frame(face)))
        }
    }

    impl FrameSource for Scripted {
        fn read(&mut self) -> Result<Frame, CameraError> {
            self.frames.pop_front().ok_or_else(|| CameraError::FrameReadFailure("unplugged".into()))
        }

        fn release(&mut self) {
            self.released.set(self.released.get() + 1);
        }
    }

    /// One face per frame with a non-zero first pixel; its embedding is
    /// that pixel / 100.
    #[derive(Default)]
    struct PixelProvider {
        detect_calls: u32,
        encode_calls: u32,
        fail_detect: bool,
    }

    impl EmbeddingProvider for PixelProvider {
        fn version(&self) -> &str {
            "pixel"
        }

        fn detect(
            &mut self,
            frame: &[u8],
            _: u32,
            _: u32,
        ) -> Result<Vec<BoundingBox>, ProviderError> {
            self.detect_calls += 1;
            if self.fail_detect {
                return Err(ProviderError::Other("inference failed".into()));
            }
            if frame[0] == 0 {
                return Ok(vec![]);
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: 2.0,
                height: 2.0,
                confidence: 0.9,
                landmarks: None,
            }])
        }

        fn encode(
            &mut self,
            frame: &[u8],
            _: u32,
            _: u32,
            boxes: &[BoundingBox],
        ) -> Result<Vec<Embedding>, ProviderError> {
            self.encode_calls += 1;
            Ok(boxes.iter().map(|_| Embedding::new(vec![frame[0] as f32 / 100.0])).collect())
        }

        fn default_tolerance(&self) -> f32 {
            0.6
        }
    }

    /// Stops after a fixed number of renders and remembers what it was shown.
    struct CountingSink {
        stop_after: u32,
        renders: u32,
        statuses: Vec<StatusLine>,
        labels: Vec<Vec<String>>,
        fail: bool,
    }

    impl CountingSink {
        fn stop_after(n: u32) -> Self {
            Self { stop_after: n, renders: 0, statuses: vec![], labels: vec![], fail: false }
        }
    }

    impl PresentationSink for CountingSink {
        fn render(&mut self, _: &Frame, view: &FrameView<'_>) -> Result<(), RenderError> {
            self.renders += 1;
            self.statuses.push(view.status);
            self.labels.push(view.faces.iter().map(|f| f.text.clone()).collect());
            if self.fail {
                return Err(RenderError::BadFrame { width: 0, height: 0 });
            }
            Ok(())
        }

        fn poll_stop(&mut self) -> bool {
            self.renders >= self.stop_after
        }
    }

    /// Fails the first `failures` calls, then delegates.
    struct Flaky<'s> {
        inner: &'s AttendanceStore,
        failures: Cell<u32>,
        calls: Cell<u32>,
    }

    impl<'s> Flaky<'s> {
        fn failing(inner: &'s AttendanceStore, failures: u32) -> Self {
            Self { inner, failures: Cell::new(failures), calls: Cell::new(0) }
        }
    }

    impl AttendanceRecorder for Flaky<'_> {
        fn record(&self, request: &RecordRequest) -> Result<RecordOutcome, StoreError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err(StoreError::LockPoisoned);
            }
            self.inner.record(request)
        }
    }

    fn gallery(entries: &[(&str, f32)]) -> Gallery {
        Gallery::from_entries(
            "pixel",
            entries
                .iter()
                .map(|(id, v)| GalleryEntry {
                    identity: AdmissionNumber::new(*id),
                    embedding: Embedding::new(vec![*v]),
                })
                .collect(),
        )
    }

    fn store() -> (AttendanceStore, SessionIdentity) {
        let store = AttendanceStore::open_in_memory().unwrap();
        store
            .add_teacher(&NewTeacher {
                full_name: "Mrs Bello".into(),
                class_id: Some(3),
                class_arm_id: Some(1),
            })
            .unwrap();
        store
            .add_student(&NewStudent {
                admission_no: "A123".into(),
                full_name: "Ada Obi".into(),
                class_id: Some(3),
                class_arm_id: Some(1),
            })
            .unwrap();
        let identity = store.session_identity("A123").unwrap().unwrap();
        (store, identity)
    }

    fn params(identity: SessionIdentity) -> SessionParams {
        SessionParams {
            identity,
            date: day(),
            tolerance: 0.6,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_phase_alternates_from_process() {
        let phases: Vec<_> = std::iter::successors(Some(FramePhase::Process), |p| Some(p.next()))
            .take(4)
            .collect();
        use FramePhase::{Process, Skip};
        assert_eq!(phases, [Process, Skip, Process, Skip]);
    }

    #[test]
    fn test_ten_frames_process_five() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(0, 10);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(10);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.frames, 10);
        assert_eq!(summary.processed_frames, 5);
        assert_eq!(provider.detect_calls, 5);
        assert_eq!(sink.renders, 10);
        assert_eq!(summary.stop_reason, StopReason::Operator);
    }

    #[test]
    fn test_marks_own_face_then_reports_already_present() {
        let (store, identity) = store();
        let (source, released) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(4);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.outcome, SessionOutcome::Marked);
        assert!(summary.recognized);
        assert_eq!(released.get(), 1);
        assert_eq!(sink.statuses, [StatusLine::Marked; 4]);
        assert_eq!(sink.labels[0], ["Ada Obi"]);
        // Skip frames keep showing the last processed labels.
        assert_eq!(sink.labels[1], ["Ada Obi"]);
        let record = store.find_attendance(identity.student_id, day()).unwrap().unwrap();
        assert!(record.status);
        assert_eq!(record.teacher_id, identity.default_teacher_id);
        assert_eq!(record.class_arm_id, Some(1));

        // Next session the same day.
        let (source, _) = Scripted::repeat(25, 2);
        let mut sink = CountingSink::stop_after(2);
        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();
        assert_eq!(summary.outcome, SessionOutcome::AlreadyMarked);
        assert!(summary.recognized);
        assert_eq!(sink.statuses[0], StatusLine::AlreadyMarked);
        assert_eq!(store.history(identity.student_id, None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_records_once_per_session() {
        let (store, identity) = store();
        let flaky = Flaky::failing(&store, 0);
        let (source, _) = Scripted::repeat(25, 8);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(8);

        IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &flaky,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(flaky.calls.get(), 1);
    }

    #[test]
    fn test_other_students_face_is_not_recorded() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("B456", 0.0)]);
        let mut sink = CountingSink::stop_after(4);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();

        assert!(!summary.recognized);
        assert_eq!(summary.outcome, SessionOutcome::AlreadyMarked);
        // Still drawn.
        assert_eq!(sink.labels[0], ["Unknown"]);
        assert!(store.find_attendance(identity.student_id, day()).unwrap().is_none());
    }

    #[test]
    fn test_empty_gallery_never_records() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider::default();
        let gallery = Gallery::from_entries("pixel", vec![]);
        let mut sink = CountingSink::stop_after(4);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();

        assert!(!summary.recognized);
        assert_eq!(provider.encode_calls, 2);
        assert!(store.find_attendance(identity.student_id, day()).unwrap().is_none());
    }

    #[test]
    fn test_face_outside_tolerance_is_unknown() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(90, 2);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(2);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap();
        assert!(!summary.recognized);
        assert_eq!(sink.labels[0], ["Unknown"]);
    }

    #[test]
    fn test_persistence_failure_is_retried_on_later_frame() {
        let (store, identity) = store();
        let flaky = Flaky::failing(&store, 1);
        let (source, _) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(4);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &flaky,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(flaky.calls.get(), 2);
        assert_eq!(summary.persistence_failures, 1);
        assert_eq!(summary.outcome, SessionOutcome::Marked);
        assert_eq!(sink.statuses[..2], [StatusLine::Scanning, StatusLine::Scanning]);
        assert_eq!(sink.statuses[2], StatusLine::Marked);
        assert!(store.find_attendance(identity.student_id, day()).unwrap().is_some());
    }

    #[test]
    fn test_store_failing_throughout_is_not_reported_as_already_marked() {
        let (store, identity) = store();
        let flaky = Flaky::failing(&store, u32::MAX);
        let (source, _) = Scripted::repeat(25, 6);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(6);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &flaky,
            &mut sink,
            params(identity.clone()),
        )
        .unwrap()
        .run()
        .unwrap();

        assert!(summary.recognized);
        assert_eq!(summary.persistence_failures, 3);
        assert_eq!(summary.outcome, SessionOutcome::NotRecorded);
        assert_eq!(sink.statuses, [StatusLine::Scanning; 6]);
        assert!(store.find_attendance(identity.student_id, day()).unwrap().is_none());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&SessionOutcome::NotRecorded).unwrap();
        assert_eq!(json, r#""not_recorded""#);
    }

    #[test]
    fn test_read_failure_is_fatal_and_releases_source() {
        let (store, identity) = store();
        let (source, released) = Scripted::repeat(0, 3);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(u32::MAX);

        let err = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap_err();

        assert!(matches!(err, SessionError::FrameRead(CameraError::FrameReadFailure(_))));
        assert_eq!(sink.renders, 3);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_cancelled_token_stops_before_first_read() {
        let (store, identity) = store();
        let (source, released) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(u32::MAX);
        let params = params(identity);
        params.cancel.cancel();

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params,
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.frames, 0);
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_cancel_between_frames_stops_loop() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(0, 10);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(u32::MAX);
        let params = params(identity);
        let cancel = params.cancel.clone();

        let mut session =
            IdentificationLoop::new(source, &mut provider, &gallery, &store, &mut sink, params)
                .unwrap();
        assert_eq!(session.step().unwrap(), LoopState::WaitingFrame);
        assert_eq!(session.phase(), FramePhase::Skip);
        cancel.cancel();
        assert_eq!(session.step().unwrap(), LoopState::Stopped);
        assert_eq!(session.step().unwrap(), LoopState::Stopped);
        assert_eq!(session.summary().frames, 1);
        assert_eq!(session.state(), LoopState::Stopped);
    }

    #[test]
    fn test_session_timeout() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(0, 4);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(u32::MAX);
        let params = SessionParams { timeout: Some(Duration::ZERO), ..params(identity) };

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params,
        )
        .unwrap()
        .run()
        .unwrap();
        assert_eq!(summary.stop_reason, StopReason::Timeout);
    }

    #[test]
    fn test_dark_frame_consumes_process_slot() {
        let (store, identity) = store();
        let (source, _) = Scripted::new([dark_frame(), frame(25), frame(25), frame(25)]);
        let mut provider = PixelProvider::default();
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink::stop_after(4);

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.dark_frames, 1);
        assert_eq!(summary.processed_frames, 1);
        assert_eq!(provider.detect_calls, 1);
        assert_eq!(sink.statuses[..2], [StatusLine::Scanning, StatusLine::Scanning]);
        assert_eq!(sink.statuses[2], StatusLine::Marked);
    }

    #[test]
    fn test_render_and_provider_failures_do_not_stop_the_loop() {
        let (store, identity) = store();
        let (source, _) = Scripted::repeat(25, 4);
        let mut provider = PixelProvider { fail_detect: true, ..Default::default() };
        let gallery = gallery(&[("A123", 0.0)]);
        let mut sink = CountingSink { fail: true, ..CountingSink::stop_after(4) };

        let summary = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.frames, 4);
        assert_eq!(provider.detect_calls, 2);
        assert!(!summary.recognized);
    }

    #[test]
    fn test_gallery_from_other_provider_is_rejected() {
        let (store, identity) = store();
        let (source, released) = Scripted::repeat(25, 1);
        let mut provider = PixelProvider::default();
        let gallery = Gallery::from_entries(
            "w600k_r50",
            vec![GalleryEntry {
                identity: AdmissionNumber::new("A123"),
                embedding: Embedding::new(vec![0.0]),
            }],
        );
        let mut sink = CountingSink::stop_after(1);

        let result = IdentificationLoop::new(
            source,
            &mut provider,
            &gallery,
            &store,
            &mut sink,
            params(identity),
        );
        assert!(matches!(result, Err(SessionError::ProviderMismatch { .. })));
        assert_eq!(released.get(), 1);
    }
}
