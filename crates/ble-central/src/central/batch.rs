//! Chunked writes over a transport with a hard per-write payload limit
//!
//! Chunks go out strictly one at a time: the next chunk is issued only from
//! the write-completion handler of the previous one. The caller sees one
//! aggregated result.

use super::Shared;
use crate::event::{self, EventHandler, Failure, GattEvent, Outcome};
use crate::routing::{CharacteristicKey, RouteKind};
use crate::transport::TransportHandle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Chunk size for a caller-supplied value, substituting `default` for
/// non-positive sizes
pub fn effective_chunk_size(requested: i32, default: usize) -> usize {
    if requested <= 0 {
        default.max(1)
    } else {
        requested as usize
    }
}

/// Split a payload into `ceil(len / size)` chunks
pub fn split_chunks(data: &[u8], size: usize) -> VecDeque<Vec<u8>> {
    data.chunks(size.max(1)).map(<[u8]>::to_vec).collect()
}

struct BatchWrite {
    shared: Weak<Shared>,
    key: CharacteristicKey,
    handle: TransportHandle,
    pending: Mutex<VecDeque<Vec<u8>>>,
    total: usize,
    finished: AtomicBool,
    handler: EventHandler,
}

impl BatchWrite {
    fn send_next(&self, shared: &Shared) {
        let next = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        let Some(chunk) = next else {
            debug!("Batch write of {} chunk(s) to {} complete", self.total, self.key);
            return self.finish(shared, Ok(()));
        };

        let remaining = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len();
        let index = self.total - remaining;
        debug!(
            "Writing chunk {}/{} ({} byte(s)) to {}",
            index,
            self.total,
            chunk.len(),
            self.key
        );

        if !shared.transport.write_characteristic(
            self.handle,
            self.key.service,
            self.key.characteristic,
            &chunk,
        ) {
            warn!("Transport rejected chunk {}/{} for {}", index, self.total, self.key);
            self.finish(
                shared,
                Err(Failure::other(format!(
                    "write of chunk {}/{} was rejected by the transport",
                    index, self.total
                ))),
            );
        }
    }

    fn on_written(&self, result: Outcome<Vec<u8>>) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        match result {
            Ok(_) => self.send_next(&shared),
            Err(failure) => {
                warn!("Batch write to {} failed: {}", self.key, failure);
                self.pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clear();
                self.finish(&shared, Err(failure));
            }
        }
    }

    fn finish(&self, shared: &Shared, result: Outcome<()>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.report(
            self.handler.clone(),
            GattEvent::BatchWrite {
                peer: shared.peer_info(&self.key.address),
                characteristic: self.key.characteristic,
                result,
            },
        );
    }
}

impl Shared {
    pub(super) fn write_by_batch(
        self: &Arc<Self>,
        key: CharacteristicKey,
        data: &[u8],
        chunk_size: i32,
        handler: EventHandler,
    ) {
        if data.is_empty() {
            debug!("Empty batch write to {}, nothing to send", key);
            return;
        }

        let link = match self.resolve_writable(&key) {
            Ok(link) => link,
            Err(failure) => {
                debug!("Rejecting batch write to {}: {}", key, failure);
                return self.report(
                    handler,
                    GattEvent::BatchWrite {
                        peer: self.peer_info(&key.address),
                        characteristic: key.characteristic,
                        result: Err(failure),
                    },
                );
            }
        };

        let size = effective_chunk_size(chunk_size, self.config.default_chunk_size);
        let chunks = split_chunks(data, size);
        let batch = Arc::new(BatchWrite {
            shared: Arc::downgrade(self),
            key: key.clone(),
            handle: link.handle,
            total: chunks.len(),
            pending: Mutex::new(chunks),
            finished: AtomicBool::new(false),
            handler,
        });
        debug!(
            "Batch writing {} byte(s) to {} in {} chunk(s) of {}",
            data.len(),
            key,
            batch.total,
            size
        );

        let sequencer = Arc::clone(&batch);
        self.routes.register_characteristic(
            RouteKind::Write,
            &key,
            event::handler(move |written| {
                if let GattEvent::Write { result, .. } = written {
                    sequencer.on_written(result);
                }
            }),
        );

        batch.send_next(self);
    }
}
