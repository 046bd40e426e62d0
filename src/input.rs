//! Pointer and touch input turned into splats.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DEFAULT_SPLAT_FORCE;

/// One additive impulse for the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Splat {
    /// Normalised position, y up.
    pub position: [f32; 2],
    pub velocity: [f32; 2],
}

impl Splat {
    /// Colour written into both velocity and dye.
    pub fn color(&self) -> [f32; 4] {
        [self.velocity[0], self.velocity[1], 1.0, 0.0]
    }
}

/// Splats waiting for the next frame. Clones share the same queue, so input
/// handlers on another thread can push while the frame loop drains.
#[derive(Debug, Clone, Default)]
pub struct SplatQueue {
    inner: Arc<Mutex<Vec<Splat>>>,
}

impl SplatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, splat: Splat) {
        self.lock().push(splat);
    }

    /// Takes every pending splat, most recent first. The queue is left empty.
    pub fn drain(&self) -> Vec<Splat> {
        let mut splats = std::mem::take(&mut *self.lock());
        splats.reverse();
        splats
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Splat>> {
        // A panic while holding the lock cannot leave a Vec half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client-space rectangle of the output surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl SurfaceRect {
    pub fn from_size(width: f32, height: f32) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            width,
            height,
        }
    }
}

/// Tracks the previous pointer position and turns movement into splats.
#[derive(Debug)]
pub struct InputAggregator {
    queue: SplatQueue,
    last: Option<[f32; 2]>,
    force: f32,
}

impl InputAggregator {
    pub fn new(queue: SplatQueue) -> Self {
        Self::with_force(queue, DEFAULT_SPLAT_FORCE)
    }

    pub fn with_force(queue: SplatQueue, force: f32) -> Self {
        Self {
            queue,
            last: None,
            force,
        }
    }

    pub fn queue(&self) -> &SplatQueue {
        &self.queue
    }

    /// Pointer moved to client coordinates `(x, y)`.
    pub fn pointer_move(&mut self, x: f32, y: f32, rect: SurfaceRect) {
        if rect.width <= 0.0 || rect.height <= 0.0 || !x.is_finite() || !y.is_finite() {
            return;
        }
        let Some([last_x, last_y]) = self.last.replace([x, y]) else {
            // First sample after a leave: nothing to measure against yet.
            return;
        };
        let dx = x - last_x;
        let dy = y - last_y;
        if dx == 0.0 && dy == 0.0 {
            return;
        }
        self.queue.push(Splat {
            position: [(x - rect.left) / rect.width, 1.0 - (y - rect.top) / rect.height],
            velocity: [dx * self.force, -dy * self.force],
        });
    }

    /// Only the first active touch steers the fluid.
    pub fn touch_move(&mut self, touches: &[[f32; 2]], rect: SurfaceRect) {
        if let Some([x, y]) = touches.first() {
            self.pointer_move(*x, *y, rect);
        }
    }

    pub fn pointer_leave(&mut self) {
        self.last = None;
    }

    pub fn touch_end(&mut self) {
        self.pointer_leave();
    }
}
