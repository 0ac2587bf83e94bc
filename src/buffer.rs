//! Fixed-capacity recycling buffer pools.
//!
//! Pools bound the memory a pipeline can consume: once `capacity`
//! buffers are outstanding, [`Pool::acquire`] returns `None` and the
//! caller sheds load (drops a packet, skips a repair) instead of
//! allocating. Returned buffers are recycled through a free list.

use parking_lot::Mutex;
use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// Pool of `Vec<T>` buffers of a fixed length.
#[derive(Debug)]
pub struct Pool<T: Copy + Default> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    buffer_len: usize,
    capacity: usize,
    state: Mutex<State<T>>,
}

#[derive(Debug)]
struct State<T> {
    free: Vec<Vec<T>>,
    outstanding: usize,
}

impl<T: Copy + Default> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Copy + Default> Pool<T> {
    /// A pool vending up to `capacity` buffers of `buffer_len` elements.
    #[must_use]
    pub fn new(buffer_len: usize, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer_len,
                capacity,
                state: Mutex::new(State {
                    free: Vec::new(),
                    outstanding: 0,
                }),
            }),
        }
    }

    /// Element count of every vended buffer.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    /// Take a zeroed buffer, or `None` when the pool is exhausted.
    #[must_use]
    pub fn acquire(&self) -> Option<PoolBuf<T>> {
        let mut state = self.shared.state.lock();
        if state.outstanding >= self.shared.capacity {
            return None;
        }
        state.outstanding += 1;

        let mut data = state
            .free
            .pop()
            .unwrap_or_else(|| vec![T::default(); self.shared.buffer_len]);
        drop(state);

        data.clear();
        data.resize(self.shared.buffer_len, T::default());

        Some(PoolBuf {
            data,
            shared: Arc::clone(&self.shared),
        })
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.shared.state.lock().outstanding
    }
}

/// A pooled buffer; returns to its pool on drop.
#[derive(Debug)]
pub struct PoolBuf<T: Copy + Default> {
    data: Vec<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Copy + Default> PoolBuf<T> {
    /// Shrink the visible length (e.g. a short final frame). Never grows
    /// beyond the pool's buffer length.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl<T: Copy + Default> Deref for PoolBuf<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: Copy + Default> DerefMut for PoolBuf<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Copy + Default> Drop for PoolBuf<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.outstanding -= 1;
        let data = std::mem::take(&mut self.data);
        state.free.push(data);
    }
}
