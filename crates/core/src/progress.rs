use serde::Serialize;

/// Per-call increment reported by the FTP data-channel writer.
pub const FIXED_CHUNK_BYTES: u64 = 8192;

/// How a transport natively reports upload progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressShape {
    /// Bytes transferred so far (SFTP, SCP).
    Cumulative,
    /// One fixed-size increment per write call (FTP).
    FixedChunk,
    /// Bytes sent since the previous report (S3).
    Delta,
    /// No incremental reports at all (SMB).
    Indeterminate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub destination: String,
    pub current_file: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started(ProgressState),
    Update(ProgressState),
    /// Transfer running with no byte counts available.
    Indeterminate(ProgressState),
    Completed(ProgressState),
}

impl ProgressEvent {
    pub fn state(&self) -> &ProgressState {
        match self {
            Self::Started(s) | Self::Update(s) | Self::Indeterminate(s) | Self::Completed(s) => s,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Normalizes native progress callbacks of one destination into [`ProgressEvent`]s.
///
/// Owned by a single destination transfer; the accumulator resets on every
/// [`ProgressTracker::begin_file`].
pub struct ProgressTracker<'a> {
    sink: Option<&'a dyn ProgressSink>,
    state: ProgressState,
    completed: bool,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(destination: impl Into<String>, sink: Option<&'a dyn ProgressSink>) -> Self {
        Self {
            sink,
            state: ProgressState {
                destination: destination.into(),
                ..ProgressState::default()
            },
            completed: false,
        }
    }

    pub fn begin_file(&mut self, file: &str, total_bytes: u64) {
        self.state.current_file = file.to_string();
        self.state.transferred_bytes = 0;
        self.state.total_bytes = total_bytes;
        self.completed = false;
        self.emit(ProgressEvent::Started(self.state.clone()));
    }

    /// Cumulative shape: `transferred` is the absolute count so far.
    pub fn cumulative(&mut self, transferred: u64) {
        self.state.transferred_bytes = transferred.min(self.state.total_bytes);
        self.update();
    }

    /// Fixed-chunk shape: each call stands for one [`FIXED_CHUNK_BYTES`] block.
    pub fn chunk(&mut self) {
        self.state.transferred_bytes = self
            .state
            .transferred_bytes
            .saturating_add(FIXED_CHUNK_BYTES)
            .min(self.state.total_bytes);
        self.update();
    }

    /// Delta shape: the tracker's accumulator is authoritative.
    pub fn delta(&mut self, bytes: u64) {
        self.state.transferred_bytes = self.state.transferred_bytes.saturating_add(bytes);
        self.update();
    }

    pub fn indeterminate(&mut self) {
        self.emit(ProgressEvent::Indeterminate(self.state.clone()));
    }

    /// Marks the current file done; emits the completion event if no update did.
    pub fn finish(&mut self) {
        if self.completed {
            return;
        }
        self.state.transferred_bytes = self.state.total_bytes;
        self.completed = true;
        self.emit(ProgressEvent::Completed(self.state.clone()));
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    fn update(&mut self) {
        self.emit(ProgressEvent::Update(self.state.clone()));
        if !self.completed
            && self.state.total_bytes > 0
            && self.state.transferred_bytes >= self.state.total_bytes
        {
            self.completed = true;
            self.emit(ProgressEvent::Completed(self.state.clone()));
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = self.sink {
            sink.on_progress(event);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;

    #[test]
    fn delta_accumulator_hits_total_once_and_resets_per_file() {
        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("s3://bucket", Some(&rec));

        tracker.begin_file("a.bin", 1000);
        let mut hits = 0;
        for d in [100, 400, 250, 250] {
            tracker.delta(d);
            if tracker.state().transferred_bytes == 1000 {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);
        tracker.finish();
        assert_eq!(rec.completions(), 1);

        tracker.begin_file("b.bin", 10);
        assert_eq!(tracker.state().transferred_bytes, 0);
        assert_eq!(tracker.state().current_file, "b.bin");
        tracker.delta(10);
        assert_eq!(rec.completions(), 2);
    }

    #[test]
    fn fixed_chunks_are_clamped_to_file_size() {
        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("ftp://h", Some(&rec));
        tracker.begin_file("c.bin", 20_000);
        tracker.chunk();
        tracker.chunk();
        assert_eq!(tracker.state().transferred_bytes, 16_384);
        tracker.chunk();
        assert_eq!(tracker.state().transferred_bytes, 20_000);
        tracker.finish();
        assert_eq!(rec.completions(), 1);

        for event in rec.events.lock().unwrap().iter() {
            let s = event.state();
            assert!(s.transferred_bytes <= s.total_bytes);
        }
    }

    #[test]
    fn cumulative_passes_through() {
        let mut tracker = ProgressTracker::new("sftp://h", None);
        tracker.begin_file("a.txt", 100);
        tracker.cumulative(40);
        assert_eq!(tracker.state().transferred_bytes, 40);
        assert!(!tracker.is_complete());
        tracker.cumulative(100);
        assert!(tracker.is_complete());
    }

    #[test]
    fn indeterminate_then_complete() {
        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("smb://h", Some(&rec));
        tracker.begin_file("d.txt", 5);
        tracker.indeterminate();
        tracker.finish();
        tracker.finish();

        let events = rec.events.lock().unwrap();
        assert!(matches!(events[1], ProgressEvent::Indeterminate(_)));
        assert!(matches!(events[2], ProgressEvent::Completed(ref s) if s.transferred_bytes == 5));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn empty_file_completes_on_finish() {
        let rec = Recorder::default();
        let mut tracker = ProgressTracker::new("sftp://h", Some(&rec));
        tracker.begin_file("empty", 0);
        tracker.finish();
        assert_eq!(rec.completions(), 1);
    }
}
