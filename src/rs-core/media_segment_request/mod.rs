//! Loading of everything needed to push one segment: its key, its initialization segment and
//! its media data.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    decrypter::key_from_bytes,
    error::{worst_error, RequestError, RequestErrorKind},
    host::{
        Clock, DecryptedMessage, DecryptionMessage, Decrypter, RequestId, RequestOptions,
        RequestOutcome, ResponseType, Transport,
    },
    playlist::ByteRange,
};

/// A resource to fetch.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceRequest {
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

/// How to obtain the key of an encrypted segment.
#[derive(Clone, Debug, PartialEq)]
pub enum KeySource {
    /// The key is already known.
    Cached([u8; 16]),
    Fetch(Url),
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyRequest {
    pub source: KeySource,
    pub iv: [u8; 16],
}

/// Everything to load for one segment.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentRequestParams {
    pub key: Option<KeyRequest>,
    /// `None` when there is no initialization segment or when it is already cached.
    pub init: Option<ResourceRequest>,
    pub media: ResourceRequest,
    pub timeout_ms: Option<f64>,
    pub with_credentials: bool,
}

/// Measures on the media request.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RequestStats {
    /// Time at which the requests were started, in milliseconds.
    pub request_start: f64,
    /// Time at which the first media bytes were received, if any.
    pub first_bytes_received_at: Option<f64>,
    pub bytes_received: u64,
    /// Time, in milliseconds, the media request took so far.
    pub roundtrip_time: f64,
    /// Estimated bandwidth, in bits per second.
    pub bandwidth: f64,
}

impl RequestStats {
    fn update(&mut self, bytes_received: u64, now: f64) {
        if self.first_bytes_received_at.is_none() && bytes_received > 0 {
            self.first_bytes_received_at = Some(now);
        }
        self.bytes_received = bytes_received;
        self.roundtrip_time = now - self.request_start;
        if self.roundtrip_time > 0. {
            self.bandwidth =
                (self.bytes_received as f64 / self.roundtrip_time * 8. * 1000.).floor();
        }
    }
}

/// Loaded data for a segment, decrypted if it had to be.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentData {
    /// Key used to decrypt the media data, to cache it.
    pub key: Option<[u8; 16]>,
    /// Initialization segment data, if it was requested.
    pub init: Option<Bytes>,
    pub media: Bytes,
    pub stats: RequestStats,
}

/// Where a `MediaSegmentRequest` is at, as returned by each of its methods.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestProgress {
    /// Waiting on requests.
    Pending,
    /// Waiting on the decryption worker.
    Decrypting,
    Done(SegmentData),
    /// Loading failed. Every other request has been aborted.
    Failed(RequestError),
}

#[derive(Clone, Debug, PartialEq)]
enum Slot<T> {
    Pending { request_id: RequestId, url: Url },
    Loaded(T),
    Settled,
}

impl<T> Slot<T> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending { .. })
    }

    fn matches(&self, id: RequestId) -> bool {
        matches!(self, Slot::Pending { request_id, .. } if *request_id == id)
    }

    fn url(&self) -> Option<&Url> {
        match self {
            Slot::Pending { url, .. } => Some(url),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resource {
    Key,
    Init,
    Media,
}

/// One segment's worth of requests.
///
/// Every request is started at once. The first failure or timeout aborts the others. An
/// abort coming from the host does not, and the most severe of the errors seen is reported
/// once every request settled.
pub struct MediaSegmentRequest {
    id: u64,
    token: CancellationToken,
    media_url: Url,
    key: Option<Slot<[u8; 16]>>,
    iv: [u8; 16],
    init: Option<Slot<Bytes>>,
    media: Slot<Bytes>,
    errors: Vec<RequestError>,
    stats: RequestStats,
    decrypting: bool,
    finished: bool,
}

impl MediaSegmentRequest {
    /// Start every request needed. `id` identifies this segment in decryption messages.
    pub fn start<H: Transport + Clock>(host: &mut H, id: u64, params: SegmentRequestParams) -> Self {
        let token = CancellationToken::new();
        let fetch = |host: &mut H, resource: &ResourceRequest| -> Slot<Bytes> {
            let options = RequestOptions {
                uri: resource.url.clone(),
                byte_range: resource.byte_range,
                response_type: ResponseType::ArrayBuffer,
                timeout_ms: params.timeout_ms,
                with_credentials: params.with_credentials,
            };
            let request_id = host.fetch(options, token.child_token());
            Slot::Pending {
                request_id,
                url: resource.url.clone(),
            }
        };

        let (key, iv) = match params.key.as_ref() {
            None => (None, [0; 16]),
            Some(KeyRequest {
                source: KeySource::Cached(key),
                iv,
            }) => (Some(Slot::Loaded(*key)), *iv),
            Some(KeyRequest {
                source: KeySource::Fetch(url),
                iv,
            }) => {
                let slot = match fetch(
                    host,
                    &ResourceRequest {
                        url: url.clone(),
                        byte_range: None,
                    },
                ) {
                    Slot::Pending { request_id, url } => Slot::Pending { request_id, url },
                    _ => Slot::Settled,
                };
                (Some(slot), *iv)
            }
        };
        let init = params.init.as_ref().map(|init| fetch(host, init));
        let media = fetch(host, &params.media);
        tracing::debug!(
            "Req: segment {id} requested: {} (key: {}, init: {})",
            params.media.url,
            key.is_some(),
            init.is_some()
        );

        Self {
            id,
            token,
            media_url: params.media.url.clone(),
            key,
            iv,
            init,
            media,
            errors: vec![],
            stats: RequestStats {
                request_start: host.now(),
                ..RequestStats::default()
            },
            decrypting: false,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    /// Returns `true` if `request_id` is one of this segment's pending requests.
    pub fn owns(&self, request_id: RequestId) -> bool {
        self.media.matches(request_id)
            || self.init.as_ref().map_or(false, |s| s.matches(request_id))
            || self.key.as_ref().map_or(false, |s| s.matches(request_id))
    }

    /// Abort every pending request.
    pub fn abort(&mut self) {
        self.token.cancel();
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// To call on the media request's progress.
    pub fn on_request_progress<H: Clock>(
        &mut self,
        host: &H,
        request_id: RequestId,
        bytes_loaded: u64,
    ) -> Option<&RequestStats> {
        if self.finished || !self.media.matches(request_id) {
            return None;
        }
        self.stats.update(bytes_loaded, host.now());
        Some(&self.stats)
    }

    /// To call when one of this segment's requests ends.
    pub fn on_request_finished<H: Clock + Decrypter>(
        &mut self,
        host: &mut H,
        request_id: RequestId,
        outcome: RequestOutcome,
    ) -> RequestProgress {
        if self.finished {
            return RequestProgress::Pending;
        }
        let resource = if self.media.matches(request_id) {
            Resource::Media
        } else if self.init.as_ref().map_or(false, |s| s.matches(request_id)) {
            Resource::Init
        } else if self.key.as_ref().map_or(false, |s| s.matches(request_id)) {
            Resource::Key
        } else {
            return RequestProgress::Pending;
        };

        let url = match resource {
            Resource::Media => self.media.url(),
            Resource::Init => self.init.as_ref().and_then(Slot::url),
            Resource::Key => self.key.as_ref().and_then(Slot::url),
        }
        .map(|u| u.to_string())
        .unwrap_or_default();

        let result = match outcome {
            RequestOutcome::Loaded { body, .. } => Ok(body),
            RequestOutcome::Failed { status } => Err(RequestError::failed(&url, status)),
            RequestOutcome::TimedOut => Err(RequestError::timed_out(&url, None)),
            RequestOutcome::Aborted => Err(RequestError::aborted(&url, None)),
        };

        match result {
            Ok(body) => {
                if let Err(err) = self.store(host, resource, body, &url) {
                    self.errors.push(err);
                    return self.fail();
                }
            }
            Err(err) => {
                self.settle(resource);
                let fatal = err.kind != RequestErrorKind::Aborted;
                self.errors.push(err);
                if fatal {
                    return self.fail();
                }
            }
        }

        if self.is_pending() {
            return RequestProgress::Pending;
        }
        if !self.errors.is_empty() {
            return self.fail();
        }
        self.complete(host)
    }

    /// To call with the decryption worker's reply.
    pub fn on_decrypted(&mut self, message: DecryptedMessage) -> RequestProgress {
        if !self.decrypting || self.finished || message.source != self.id {
            return RequestProgress::Pending;
        }
        self.decrypting = false;
        match message.decrypted {
            Ok(decrypted) => {
                self.media = Slot::Loaded(decrypted);
                self.finish()
            }
            Err(err) => {
                self.errors.push(
                    RequestError::failed(self.media_url.as_str(), None)
                        .with_message(format!("Could not decrypt segment: {err}")),
                );
                self.fail()
            }
        }
    }

    fn store<H: Clock>(
        &mut self,
        host: &H,
        resource: Resource,
        body: Bytes,
        url: &str,
    ) -> Result<(), RequestError> {
        match resource {
            Resource::Media => {
                self.stats.update(body.len() as u64, host.now());
                self.media = Slot::Loaded(body);
            }
            Resource::Init => self.init = Some(Slot::Loaded(body)),
            Resource::Key => {
                let key = key_from_bytes(&body).map_err(|e| {
                    RequestError::failed(url, None)
                        .with_message(format!("Invalid HLS key at URL: {url}: {e}"))
                })?;
                self.key = Some(Slot::Loaded(key));
            }
        }
        Ok(())
    }

    fn settle(&mut self, resource: Resource) {
        match resource {
            Resource::Media => self.media = Slot::Settled,
            Resource::Init => self.init = Some(Slot::Settled),
            Resource::Key => self.key = Some(Slot::Settled),
        }
    }

    fn is_pending(&self) -> bool {
        self.media.is_pending()
            || self.init.as_ref().map_or(false, Slot::is_pending)
            || self.key.as_ref().map_or(false, Slot::is_pending)
    }

    fn fail(&mut self) -> RequestProgress {
        self.abort();
        let errors = std::mem::take(&mut self.errors);
        match worst_error(errors) {
            Some(err) => {
                tracing::warn!("Req: segment {} failed: {err}", self.id);
                RequestProgress::Failed(err)
            }
            None => RequestProgress::Pending,
        }
    }

    fn complete<H: Decrypter>(&mut self, host: &mut H) -> RequestProgress {
        let key = match self.key.as_ref() {
            Some(Slot::Loaded(key)) => Some(*key),
            _ => None,
        };
        let Some(key) = key else {
            return self.finish();
        };
        let encrypted = match &self.media {
            Slot::Loaded(data) => data.clone(),
            _ => return self.finish(),
        };
        tracing::debug!("Req: decrypting segment {}", self.id);
        self.decrypting = true;
        host.post_decryption(DecryptionMessage {
            source: self.id,
            encrypted,
            key,
            iv: self.iv,
        });
        RequestProgress::Decrypting
    }

    fn finish(&mut self) -> RequestProgress {
        self.finished = true;
        let media = match std::mem::replace(&mut self.media, Slot::Settled) {
            Slot::Loaded(data) => data,
            _ => Bytes::new(),
        };
        let init = match self.init.take() {
            Some(Slot::Loaded(data)) => Some(data),
            _ => None,
        };
        let key = match self.key.as_ref() {
            Some(Slot::Loaded(key)) => Some(*key),
            _ => None,
        };
        RequestProgress::Done(SegmentData {
            key,
            init,
            media,
            stats: self.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decrypter::{decrypt_message, segment_iv, test_utils::encrypt},
        testing::MockHost,
    };
    use rstest::rstest;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("valid url")
    }

    fn params(key: Option<KeyRequest>, with_init: bool) -> SegmentRequestParams {
        SegmentRequestParams {
            key,
            init: with_init.then(|| ResourceRequest {
                url: url("http://cdn.test/init.mp4"),
                byte_range: None,
            }),
            media: ResourceRequest {
                url: url("http://cdn.test/seg1.ts"),
                byte_range: Some(ByteRange {
                    length: 100,
                    offset: 50,
                }),
            },
            timeout_ms: Some(45_000.),
            with_credentials: false,
        }
    }

    fn loaded(data: &'static [u8]) -> RequestOutcome {
        RequestOutcome::Loaded {
            status: 200,
            body: Bytes::from_static(data),
            final_uri: None,
        }
    }

    fn id_of(host: &MockHost, suffix: &str) -> RequestId {
        host.request_to(suffix).map(|r| r.id).expect("pending request")
    }

    #[test]
    fn completes_once_every_request_settled() {
        let mut host = MockHost::new();
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(None, true));
        assert_eq!(host.requests.len(), 2);
        assert_eq!(
            host.request_to("seg1.ts").and_then(|r| r.options.byte_range),
            Some(ByteRange {
                length: 100,
                offset: 50
            })
        );

        let media_id = id_of(&host, "seg1.ts");
        host.now += 500.;
        assert_eq!(
            req.on_request_finished(&mut host, media_id, loaded(b"media")),
            RequestProgress::Pending
        );
        let init_id = id_of(&host, "init.mp4");
        let RequestProgress::Done(data) = req.on_request_finished(&mut host, init_id, loaded(b"init"))
        else {
            panic!("expected the segment to be loaded");
        };
        assert_eq!(&data.media[..], b"media");
        assert_eq!(data.init.as_deref(), Some(b"init".as_slice()));
        assert_eq!(data.stats.bytes_received, 5);
        assert_eq!(data.stats.roundtrip_time, 500.);
        assert_eq!(data.stats.bandwidth, 80.);
        assert!(req.is_finished());
    }

    #[test]
    fn failure_aborts_siblings() {
        let mut host = MockHost::new();
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(None, true));
        let init_id = id_of(&host, "init.mp4");
        let progress = req.on_request_finished(
            &mut host,
            init_id,
            RequestOutcome::Failed { status: Some(404) },
        );
        let RequestProgress::Failed(err) = progress else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind, RequestErrorKind::Failure);
        assert_eq!(err.status, Some(404));
        assert!(host.pending_requests().is_empty());
    }

    #[rstest]
    #[case(RequestOutcome::TimedOut, RequestErrorKind::Timeout)]
    #[case(RequestOutcome::Failed { status: None }, RequestErrorKind::Failure)]
    fn reports_worst_error_after_host_abort(
        #[case] second: RequestOutcome,
        #[case] expected: RequestErrorKind,
    ) {
        let mut host = MockHost::new();
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(None, true));
        let init_id = id_of(&host, "init.mp4");
        let media_id = id_of(&host, "seg1.ts");
        assert_eq!(
            req.on_request_finished(&mut host, init_id, RequestOutcome::Aborted),
            RequestProgress::Pending
        );
        let RequestProgress::Failed(err) = req.on_request_finished(&mut host, media_id, second)
        else {
            panic!("expected a failure");
        };
        assert_eq!(err.kind, expected);
    }

    #[test]
    fn lone_abort_is_reported_once_settled() {
        let mut host = MockHost::new();
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(None, false));
        let media_id = id_of(&host, "seg1.ts");
        let progress = req.on_request_finished(&mut host, media_id, RequestOutcome::Aborted);
        assert!(matches!(progress, RequestProgress::Failed(e) if e.kind == RequestErrorKind::Aborted));
    }

    #[test]
    fn decrypts_encrypted_segments() {
        const KEY: [u8; 16] = *b"abcdefghijklmnop";
        let iv = segment_iv(7);
        let mut host = MockHost::new();
        let key = KeyRequest {
            source: KeySource::Fetch(url("http://cdn.test/key.bin")),
            iv,
        };
        let mut req = MediaSegmentRequest::start(&mut host, 3, params(Some(key), false));
        let key_id = id_of(&host, "key.bin");
        assert_eq!(
            req.on_request_finished(&mut host, key_id, loaded(&KEY)),
            RequestProgress::Pending
        );
        let encrypted = encrypt(b"clear media", &KEY, &iv);
        let media_id = id_of(&host, "seg1.ts");
        let outcome = RequestOutcome::Loaded {
            status: 200,
            body: Bytes::from(encrypted),
            final_uri: None,
        };
        assert_eq!(
            req.on_request_finished(&mut host, media_id, outcome),
            RequestProgress::Decrypting
        );
        let message = host.decryptions.pop().expect("decryption posted");
        assert_eq!(message.source, 3);
        assert_eq!(message.iv, iv);

        let RequestProgress::Done(data) = req.on_decrypted(decrypt_message(message)) else {
            panic!("expected the segment to be loaded");
        };
        assert_eq!(&data.media[..], b"clear media");
        assert_eq!(data.key, Some(KEY));
    }

    #[test]
    fn cached_key_is_not_requested() {
        let mut host = MockHost::new();
        let key = KeyRequest {
            source: KeySource::Cached([1; 16]),
            iv: [0; 16],
        };
        let _req = MediaSegmentRequest::start(&mut host, 1, params(Some(key), false));
        assert_eq!(host.requests.len(), 1);
    }

    #[test]
    fn rejects_invalid_keys() {
        let mut host = MockHost::new();
        let key = KeyRequest {
            source: KeySource::Fetch(url("http://cdn.test/key.bin")),
            iv: [0; 16],
        };
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(Some(key), false));
        let key_id = id_of(&host, "key.bin");
        let progress = req.on_request_finished(&mut host, key_id, loaded(b"too short"));
        assert!(matches!(
            progress,
            RequestProgress::Failed(e) if e.message.starts_with("Invalid HLS key")
        ));
        assert!(host.pending_requests().is_empty());
    }

    #[test]
    fn tracks_progress_of_media_request() {
        let mut host = MockHost::new();
        let mut req = MediaSegmentRequest::start(&mut host, 1, params(None, false));
        let media_id = id_of(&host, "seg1.ts");
        host.now += 1000.;
        let stats = *req
            .on_request_progress(&host, media_id, 125_000)
            .expect("media request");
        assert_eq!(stats.bandwidth, 1_000_000.);
        assert_eq!(stats.first_bytes_received_at, Some(host.now));
        assert!(req.on_request_progress(&host, media_id + 100, 1).is_none());
    }
}
