//! Detachable byte buffers and the transfer tag.
//!
//! A [`Buffer`] is a cheaply cloneable, shared byte buffer whose backing
//! storage can be *detached* and moved across the thread boundary instead of
//! being copied. A detached buffer reads as empty from every clone.
//!
//! [`Movable`] is the tag that routes a payload's backing buffer through a
//! submission's transfer list. Wrapping a payload with no transferable
//! backing fails synchronously.
//!
//! # Example
//!
//! ```
//! use lagoon::{Buffer, Movable, Payload};
//!
//! let buffer = Buffer::new(10);
//! let movable = Movable::wrap(Payload::new(buffer.clone())).unwrap();
//! assert!(movable.transferable().ptr_eq(&buffer));
//!
//! // A payload without a backing buffer cannot be moved.
//! assert!(Movable::wrap(Payload::new(42)).is_err());
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::task::Payload;

/// A shared byte buffer whose storage can be transferred between threads.
///
/// Clones share the same backing storage. Once the storage has been
/// detached (by posting the buffer through a transfer list), every clone
/// observes a length of zero.
#[derive(Clone, Default)]
pub struct Buffer {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
}

impl Buffer {
    /// Create a zero-filled buffer of the given length.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Create a buffer backed by the given bytes.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// Current length in bytes. A detached buffer has length zero.
    pub fn len(&self) -> usize {
        self.bytes.lock().as_ref().map_or(0, Vec::len)
    }

    /// Whether the buffer is empty or detached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the backing storage has been detached.
    pub fn is_detached(&self) -> bool {
        self.bytes.lock().is_none()
    }

    /// Run a closure over the backing bytes.
    ///
    /// Returns `None` if the buffer has been detached.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.bytes.lock().as_deref().map(f)
    }

    /// Run a closure over the backing bytes, mutably.
    ///
    /// Returns `None` if the buffer has been detached.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.bytes.lock().as_deref_mut().map(f)
    }

    /// Whether two buffers share the same backing storage.
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    /// Take the backing storage out, leaving the buffer detached.
    pub(crate) fn detach(&self) -> Option<Vec<u8>> {
        self.bytes.lock().take()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.bytes.lock() {
            Some(bytes) => f.debug_struct("Buffer").field("len", &bytes.len()).finish(),
            None => f.debug_struct("Buffer").field("detached", &true).finish(),
        }
    }
}

/// A tagged payload whose backing buffer travels through the transfer list.
///
/// Submitting a `Movable` ships the buffer's storage to the worker instead
/// of sharing it; the submitter-side buffer is detached at post time.
#[derive(Debug)]
pub struct Movable {
    payload: Payload,
    buffer: Buffer,
}

impl Movable {
    /// Tag a payload for transfer.
    ///
    /// Fails synchronously with [`PoolError::InvalidTransfer`] if the
    /// payload is not backed by a [`Buffer`].
    pub fn wrap(payload: Payload) -> Result<Self, PoolError> {
        match payload.downcast_ref::<Buffer>() {
            Some(buffer) => {
                let buffer = buffer.clone();
                Ok(Self { payload, buffer })
            }
            None => Err(PoolError::InvalidTransfer(
                "payload has no transferable backing buffer".to_string(),
            )),
        }
    }

    /// The buffer that will be placed on the transfer list.
    pub fn transferable(&self) -> &Buffer {
        &self.buffer
    }

    pub(crate) fn into_parts(self) -> (Payload, Buffer) {
        (self.payload, self.buffer)
    }
}
