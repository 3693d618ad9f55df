use std::thread::{self, JoinHandle};

use tracing::trace;

use super::decrypt_message;
use crate::{
    error::DecryptionError,
    host::{DecryptedMessage, DecryptionMessage, Decrypter},
};

/// Decrypts segments on a dedicated thread.
///
/// Messages go in and out through channels, payloads being moved rather than shared. Replies
/// have to be polled with `try_recv` and given back to the controller's `on_decrypted`.
pub struct DecryptionWorker {
    tx: Option<kanal::Sender<DecryptionMessage>>,
    rx: kanal::Receiver<DecryptedMessage>,
    handle: Option<JoinHandle<()>>,
}

impl DecryptionWorker {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = kanal::unbounded::<DecryptionMessage>();
        let (data_tx, data_rx) = kanal::unbounded::<DecryptedMessage>();
        let handle = thread::spawn(move || {
            trace!("DecryptionWorker started");
            while let Ok(message) = cmd_rx.recv() {
                if data_tx.send(decrypt_message(message)).is_err() {
                    break;
                }
            }
            trace!("DecryptionWorker stopped");
        });
        Self {
            tx: Some(cmd_tx),
            rx: data_rx,
            handle: Some(handle),
        }
    }

    /// Send a payload to decrypt.
    pub fn post(&self, message: DecryptionMessage) -> Result<(), DecryptionError> {
        match self.tx.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| DecryptionError::WorkerGone),
            None => Err(DecryptionError::WorkerGone),
        }
    }

    /// A reply, if one is ready.
    pub fn try_recv(&self) -> Option<DecryptedMessage> {
        self.rx.try_recv().ok().flatten()
    }

    /// Wait for the next reply.
    pub fn recv(&self) -> Result<DecryptedMessage, DecryptionError> {
        self.rx.recv().map_err(|_| DecryptionError::WorkerGone)
    }
}

impl Decrypter for DecryptionWorker {
    fn post_decryption(&mut self, message: DecryptionMessage) {
        let source = message.source;
        if let Err(err) = self.post(message) {
            tracing::error!("Req: could not post segment {source} for decryption: {err}");
        }
    }
}

impl Drop for DecryptionWorker {
    fn drop(&mut self) {
        // Dropping the only sender ends the worker's loop.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::decrypter::{segment_iv, test_utils::encrypt};

    const KEY: [u8; 16] = [9; 16];

    #[test]
    fn decrypts_in_order_on_its_thread() {
        let mut worker = DecryptionWorker::spawn();
        for source in 0..3u64 {
            let iv = segment_iv(source);
            let payload = format!("segment {source}");
            worker.post_decryption(DecryptionMessage {
                source,
                encrypted: Bytes::from(encrypt(payload.as_bytes(), &KEY, &iv)),
                key: KEY,
                iv,
            });
        }
        for source in 0..3u64 {
            let reply = worker.recv().expect("worker alive");
            assert_eq!(reply.source, source);
            let expected = format!("segment {source}");
            assert_eq!(reply.decrypted.as_deref(), Ok(expected.as_bytes()));
        }
        assert!(worker.try_recv().is_none());
    }

    #[test]
    fn reports_errors_as_replies() {
        let worker = DecryptionWorker::spawn();
        worker
            .post(DecryptionMessage {
                source: 5,
                encrypted: Bytes::from_static(&[1, 2, 3]),
                key: KEY,
                iv: [0; 16],
            })
            .expect("worker alive");
        let reply = worker.recv().expect("worker alive");
        assert_eq!(reply.decrypted, Err(DecryptionError::InvalidPayloadLength(3)));
    }
}
