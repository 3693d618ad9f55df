use std::collections::VecDeque;

use bytes::Bytes;

use crate::{
    error::SourceBufferError,
    host::{LoaderKind, MediaSink},
};

/// What an append was for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AppendKind {
    /// Initialization segment with the given identity.
    Init(String),
    Media,
}

/// A buffer operation the host reported as finished.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceOperation {
    Append(AppendKind),
    Remove { start: f64, end: f64 },
}

enum QueuedOperation {
    Append(Bytes, AppendKind),
    Remove { start: f64, end: f64 },
    TimestampOffset(f64),
}

/// Serializes operations on one of the host's media buffers.
///
/// Only one append or remove is given to the host at a time, the next one being issued once
/// the host reported the previous one as finished through `on_update_end`. Timestamp offset
/// changes are applied between two operations, in order.
pub struct SourceUpdater {
    track: LoaderKind,
    mime_type: String,

    /// Operations waiting for the current one to finish, from the most imminent to the least.
    queue: VecDeque<QueuedOperation>,

    /// Operation currently performed by the host.
    in_flight: Option<SourceOperation>,

    timestamp_offset: f64,
}

impl SourceUpdater {
    /// Create the host's buffer for that track.
    pub fn new<H: MediaSink>(
        host: &mut H,
        track: LoaderKind,
        mime_type: &str,
    ) -> Result<Self, SourceBufferError> {
        tracing::info!("SL({track}): Creating SourceBuffer for {mime_type}");
        host.add_source_buffer(track, mime_type)?;
        Ok(Self {
            track,
            mime_type: mime_type.to_owned(),
            queue: VecDeque::new(),
            in_flight: None,
            timestamp_offset: 0.,
        })
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Returns `true` if an operation is pending or performed.
    pub fn updating(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }

    pub fn timestamp_offset(&self) -> f64 {
        self.timestamp_offset
    }

    pub fn append<H: MediaSink>(&mut self, host: &mut H, data: Bytes, kind: AppendKind) {
        self.queue.push_back(QueuedOperation::Append(data, kind));
        self.run_next(host);
    }

    pub fn remove<H: MediaSink>(&mut self, host: &mut H, start: f64, end: f64) {
        if !(end > start) {
            return;
        }
        self.queue.push_back(QueuedOperation::Remove { start, end });
        self.run_next(host);
    }

    pub fn set_timestamp_offset<H: MediaSink>(&mut self, host: &mut H, offset: f64) {
        self.timestamp_offset = offset;
        self.queue.push_back(QueuedOperation::TimestampOffset(offset));
        self.run_next(host);
    }

    /// To call once the host finished the current operation. Returns that operation.
    pub fn on_update_end<H: MediaSink>(&mut self, host: &mut H) -> Option<SourceOperation> {
        let done = self.in_flight.take();
        self.run_next(host);
        done
    }

    /// Forget every queued operation, e.g. after the host's buffer failed.
    pub fn clear_queue(&mut self) {
        tracing::info!("SL({}): clearing SourceBuffer queue", self.track);
        self.queue.clear();
        self.in_flight = None;
    }

    fn run_next<H: MediaSink>(&mut self, host: &mut H) {
        while self.in_flight.is_none() {
            let Some(op) = self.queue.pop_front() else {
                return;
            };
            match op {
                QueuedOperation::TimestampOffset(offset) => {
                    tracing::debug!("SL({}): timestampOffset set to {offset}", self.track);
                    host.set_timestamp_offset(self.track, offset);
                }
                QueuedOperation::Append(data, kind) => {
                    tracing::debug!(
                        "SL({}): Appending {} bytes ({kind:?})",
                        self.track,
                        data.len()
                    );
                    host.append_buffer(self.track, data);
                    self.in_flight = Some(SourceOperation::Append(kind));
                }
                QueuedOperation::Remove { start, end } => {
                    tracing::debug!("SL({}): Removing {start} => {end}", self.track);
                    host.remove_buffer(self.track, start, end);
                    self.in_flight = Some(SourceOperation::Remove { start, end });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;

    #[test]
    fn issues_one_operation_at_a_time() {
        let mut host = MockHost::new();
        let mut updater =
            SourceUpdater::new(&mut host, LoaderKind::Main, "video/mp2t").expect("created");
        assert_eq!(host.source_buffers.len(), 1);

        updater.append(&mut host, Bytes::from_static(b"init"), AppendKind::Init("i".into()));
        updater.set_timestamp_offset(&mut host, 10.);
        updater.append(&mut host, Bytes::from_static(b"media"), AppendKind::Media);
        updater.remove(&mut host, 0., 5.);
        assert!(updater.updating());
        assert_eq!(host.appended.len(), 1);
        assert!(host.timestamp_offsets.is_empty());

        assert_eq!(
            updater.on_update_end(&mut host),
            Some(SourceOperation::Append(AppendKind::Init("i".into())))
        );
        assert_eq!(host.timestamp_offsets, vec![(LoaderKind::Main, 10.)]);
        assert_eq!(host.appended.len(), 2);
        assert!(host.removed.is_empty());

        assert_eq!(
            updater.on_update_end(&mut host),
            Some(SourceOperation::Append(AppendKind::Media))
        );
        assert_eq!(host.removed, vec![(LoaderKind::Main, 0., 5.)]);
        assert_eq!(
            updater.on_update_end(&mut host),
            Some(SourceOperation::Remove { start: 0., end: 5. })
        );
        assert!(!updater.updating());
        assert_eq!(updater.on_update_end(&mut host), None);
    }

    #[test]
    fn ignores_empty_removals() {
        let mut host = MockHost::new();
        let mut updater =
            SourceUpdater::new(&mut host, LoaderKind::Audio, "audio/mp4").expect("created");
        updater.remove(&mut host, 5., 5.);
        updater.remove(&mut host, 0., f64::NAN);
        assert!(!updater.updating());
        assert!(host.removed.is_empty());
    }

    #[test]
    fn creation_errors_are_propagated() {
        let mut host = MockHost::new();
        host.add_source_buffer_error = Some(SourceBufferError::TypeNotSupported("x".into()));
        assert!(SourceUpdater::new(&mut host, LoaderKind::Main, "x").is_err());
    }
}
