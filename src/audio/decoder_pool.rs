//! Shared pool of decoders, leased exclusively per stream.

use crate::audio::codec::{Codec, DecoderFactory};
use crate::audio::error::AudioError;
use crate::audio::format::{DecoderKey, MediaFormat};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "soundboard_engine::audio::decoder_pool";

/// Upper bound on decoders kept per (encoding, channel count).
pub const MAX_DECODERS_PER_KEY: usize = 10;

struct Slot {
    id: u64,
    key: DecoderKey,
    /// `None` while leased.
    codec: Option<Box<dyn Codec>>,
}

struct PoolInner {
    factory: Arc<dyn DecoderFactory>,
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // A panic while holding the lock leaves the slot list itself consistent.
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn give_back(&self, slot_id: u64, key: DecoderKey, mut codec: Box<dyn Codec>) {
        codec.flush();
        let mut slots = self.slots();
        match slots.iter_mut().find(|s| s.id == slot_id) {
            Some(slot) => slot.codec = Some(codec),
            None => {
                warn!(target: LOG_TARGET, "Returned decoder {} has no slot, dropping it.", slot_id);
                return;
            }
        }

        // Trim idle decoders of this key above the cap.
        let mut total = slots.iter().filter(|s| s.key == key).count();
        while total > MAX_DECODERS_PER_KEY {
            match slots.iter().position(|s| s.key == key && s.codec.is_some()) {
                Some(idx) => {
                    let removed = slots.remove(idx);
                    debug!(target: LOG_TARGET, "Trimmed idle decoder {} for {:?}", removed.id, key);
                    total -= 1;
                }
                None => break,
            }
        }
        trace!(target: LOG_TARGET, "Decoder {} returned to pool.", slot_id);
    }
}

/// Cloneable handle to the shared pool.
#[derive(Clone)]
pub struct DecoderPool {
    inner: Arc<PoolInner>,
}

impl DecoderPool {
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                slots: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Leases a decoder matching the format's encoding and channel count,
    /// reusing an idle one when possible. Returns `None` if no decoder can
    /// be built for the format.
    pub fn acquire(&self, format: &MediaFormat) -> Option<DecoderLease> {
        let key = format.decoder_key();
        let mut slots = self.inner.slots();

        while let Some(slot) = slots.iter_mut().find(|s| s.key == key && s.codec.is_some()) {
            let slot_id = slot.id;
            if let Some(mut codec) = slot.codec.take() {
                match codec.configure(format) {
                    Ok(()) => {
                        debug!(target: LOG_TARGET, "Reusing decoder {} for {:?}", slot_id, key);
                        return Some(self.lease(slot_id, key, codec));
                    }
                    Err(e) => {
                        warn!(target: LOG_TARGET, "Pooled decoder {} rejected stream ({}), discarding.", slot_id, e);
                        slots.retain(|s| s.id != slot_id);
                    }
                }
            }
        }

        let mut codec = match self.inner.factory.create(format) {
            Ok(codec) => codec,
            Err(e) => {
                warn!(target: LOG_TARGET, "No decoder for {:?}: {}", key, e);
                return None;
            }
        };
        if let Err(e) = codec.configure(format) {
            warn!(target: LOG_TARGET, "New decoder for {:?} failed to configure: {}", key, e);
            return None;
        }
        let slot_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        slots.push(Slot { id: slot_id, key, codec: None });
        debug!(target: LOG_TARGET, "Created decoder {} for {:?}", slot_id, key);
        Some(self.lease(slot_id, key, codec))
    }

    /// Pre-warms one idle decoder for the format if the key is below the cap.
    pub fn initialize(&self, format: &MediaFormat) -> Result<(), AudioError> {
        let key = format.decoder_key();
        let mut slots = self.inner.slots();
        let existing = slots.iter().filter(|s| s.key == key).count();
        if existing >= MAX_DECODERS_PER_KEY {
            trace!(target: LOG_TARGET, "Pool for {:?} already at capacity.", key);
            return Ok(());
        }
        let codec = self.inner.factory.create(format)?;
        let slot_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        slots.push(Slot {
            id: slot_id,
            key,
            codec: Some(codec),
        });
        debug!(target: LOG_TARGET, "Pre-warmed decoder {} for {:?}", slot_id, key);
        Ok(())
    }

    /// Number of idle decoders for a key.
    pub fn idle_count(&self, key: &DecoderKey) -> usize {
        self.inner
            .slots()
            .iter()
            .filter(|s| &s.key == key && s.codec.is_some())
            .count()
    }

    /// Number of decoders for a key, leased or idle.
    pub fn total_count(&self, key: &DecoderKey) -> usize {
        self.inner.slots().iter().filter(|s| &s.key == key).count()
    }

    fn lease(&self, slot_id: u64, key: DecoderKey, codec: Box<dyn Codec>) -> DecoderLease {
        DecoderLease {
            pool: Arc::clone(&self.inner),
            slot_id,
            key,
            codec: Some(codec),
        }
    }
}

/// Exclusive use of one pooled decoder. Dropping the lease flushes the
/// decoder and marks it idle.
pub struct DecoderLease {
    pool: Arc<PoolInner>,
    slot_id: u64,
    key: DecoderKey,
    codec: Option<Box<dyn Codec>>,
}

impl DecoderLease {
    pub fn key(&self) -> DecoderKey {
        self.key
    }

    pub fn codec_mut(&mut self) -> Result<&mut (dyn Codec + 'static), AudioError> {
        self.codec
            .as_deref_mut()
            .ok_or_else(|| AudioError::InvalidState("decoder lease already returned".to_string()))
    }
}

impl Drop for DecoderLease {
    fn drop(&mut self) {
        if let Some(codec) = self.codec.take() {
            self.pool.give_back(self.slot_id, self.key, codec);
        }
    }
}

impl std::fmt::Debug for DecoderLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderLease")
            .field("slot_id", &self.slot_id)
            .field("key", &self.key)
            .finish()
    }
}
