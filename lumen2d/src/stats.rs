/// Per-frame counters for a debug or profiling overlay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Lights selected for drawing.
    pub total_lights: usize,
    /// Of those, lights drawn with shadows.
    pub shadow_lights: usize,
    /// Shadow-casting lights dropped because the shadow atlas was full.
    pub dropped_shadow_lights: usize,
    pub occluders: usize,
    pub draw_calls: usize,
}

impl FrameStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
