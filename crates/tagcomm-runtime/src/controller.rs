//! Serialized tag writer.
//!
//! Every [`TagController`] owns one worker thread fed by a FIFO queue, so
//! writes issued through one controller reach the PLC strictly in order and
//! never overlap.

use crate::access::TagAccess;
use crate::tag::TagId;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tagcomm_codec::TagValue;
use tagcomm_common::{TagError, TagResult};
use tracing::{debug, info, warn};

struct WriteJob {
    tag: TagId,
    value: TagValue,
    reply: Sender<TagResult<TagValue>>,
}

/// Pending result of a queued write.
///
/// Dropping it does not cancel the write.
#[derive(Debug)]
pub struct WriteCompletion {
    tag: TagId,
    reply: Receiver<TagResult<TagValue>>,
}

impl WriteCompletion {
    /// Tag being written.
    #[must_use]
    pub fn tag(&self) -> TagId {
        self.tag
    }

    /// Block until the write finished. Returns the coerced value written.
    ///
    /// # Errors
    ///
    /// The write's own error, or [`TagError::Config`] if the controller
    /// stopped before answering.
    pub fn wait(self) -> TagResult<TagValue> {
        self.reply
            .recv()
            .map_err(|_| TagError::Config("tag controller stopped".into()))?
    }

    /// Like [`Self::wait`] with an upper bound.
    ///
    /// # Errors
    ///
    /// [`TagError::Timeout`] when the bound elapses first.
    pub fn wait_timeout(self, timeout: Duration) -> TagResult<TagValue> {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TagError::Timeout(format!(
                "write of tag {} not completed within {timeout:?}",
                self.tag
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(TagError::Config("tag controller stopped".into()))
            }
        }
    }
}

/// Writes tag values to the PLC one at a time.
pub struct TagController {
    access: Arc<TagAccess>,
    sender: Option<Sender<WriteJob>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TagController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagController")
            .field("queued", &self.queued())
            .field("running", &self.sender.is_some())
            .finish()
    }
}

impl TagController {
    /// Start a controller and its worker thread.
    ///
    /// # Errors
    ///
    /// [`TagError::Config`] if the worker thread cannot be spawned.
    pub fn new(access: Arc<TagAccess>) -> TagResult<Self> {
        let (sender, receiver) = channel::unbounded::<WriteJob>();
        let worker_access = Arc::clone(&access);
        let port = access.transport().port();

        let worker = thread::Builder::new()
            .name(format!("tagcomm-writer-{port}"))
            .spawn(move || {
                debug!("Tag controller worker started");
                for job in receiver {
                    let result = perform_write(&worker_access, job.tag, &job.value);
                    if let Err(e) = &result {
                        warn!(tag = %job.tag, error = %e, "Tag write failed");
                    }
                    // Caller may have dropped the completion
                    let _ = job.reply.send(result);
                }
                debug!("Tag controller worker stopped");
            })
            .map_err(|e| TagError::Config(format!("Failed to spawn controller thread: {e}")))?;

        info!(port, "Tag controller started");
        Ok(Self {
            access,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Queue a write.
    ///
    /// # Errors
    ///
    /// [`TagError::NotConnected`] without queueing when the transport is
    /// down; [`TagError::Config`] after [`Self::stop`].
    pub fn write(&self, tag: TagId, value: TagValue) -> TagResult<WriteCompletion> {
        if !self.access.transport().is_connected() {
            return Err(TagError::NotConnected);
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TagError::Config("tag controller stopped".into()))?;
        let (reply, completion) = channel::bounded(1);
        sender
            .send(WriteJob { tag, value, reply })
            .map_err(|_| TagError::Config("tag controller stopped".into()))?;
        Ok(WriteCompletion {
            tag,
            reply: completion,
        })
    }

    /// Queue a write and wait for it.
    ///
    /// # Errors
    ///
    /// See [`Self::write`] and [`WriteCompletion::wait_timeout`].
    pub fn write_and_wait(&self, tag: TagId, value: TagValue, timeout: Duration) -> TagResult<TagValue> {
        self.write(tag, value)?.wait_timeout(timeout)
    }

    /// Writes waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    /// Finish queued writes and stop the worker.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
            info!("Tag controller stopped");
        }
    }
}

impl Drop for TagController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn perform_write(access: &TagAccess, id: TagId, value: &TagValue) -> TagResult<TagValue> {
    let tag = access.arena().tag(id)?;
    let layout = access.layout(id)?;
    let encoded = access
        .codec()
        .encode(&layout.type_name, layout.bit_size, value)
        .map_err(|e| e.for_tag(tag.path()))?;

    if let Err(first) = access.write_raw(&tag, &encoded.bytes) {
        if first.is_address_invalidation() {
            access.invalidate(id);
        }
        debug!(tag = tag.path(), error = %first, "Write failed, retrying once");
        access
            .write_raw(&tag, &encoded.bytes)
            .map_err(|e| TagError::communication(tag.path(), e))?;
    }

    // No read-back; the PLC is assumed to hold what was sent
    tag.set_value(Some(encoded.value.clone()));
    Ok(encoded.value)
}
