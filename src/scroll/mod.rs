use crate::timeline::ViewDelta;

/// Decides whether the transcript should follow new messages.
#[derive(Debug, Clone)]
pub struct ScrollSentinel {
    threshold_px: f32,
    at_tail: bool,
}

impl ScrollSentinel {
    pub fn new(threshold_px: f32) -> Self {
        Self {
            threshold_px: threshold_px.max(0.0),
            at_tail: true,
        }
    }

    pub fn is_at_tail(&self) -> bool {
        self.at_tail
    }

    /// Feed the container's distance from the bottom on every scroll.
    pub fn observe_scroll(&mut self, distance_from_bottom_px: f32) {
        self.at_tail = distance_from_bottom_px <= self.threshold_px;
    }

    /// Own submissions always scroll; peer arrivals only when at the tail.
    pub fn should_autoscroll(&self, delta: &ViewDelta) -> bool {
        delta.new_local > 0 || (delta.new_remote > 0 && self.at_tail)
    }
}
