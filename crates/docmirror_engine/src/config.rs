//! Configuration for the mirror engine.

/// Default capacity of the pending-mutation buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Configuration for a mirrored dataset subscription.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Project the dataset belongs to.
    pub project_id: String,
    /// Dataset name.
    pub dataset: String,
    /// Enable live mode: open the change feed alongside the bulk fetch.
    /// When disabled, a single fetch is performed and no events flow.
    pub listen: bool,
    /// Merge draft and published variants into one logical document per
    /// published identifier before delivering updates.
    pub overlay_drafts: bool,
    /// Maximum number of mutation events held while awaiting the
    /// snapshot. Exceeding it fails the subscription with an explicit
    /// backpressure error.
    pub buffer_capacity: usize,
}

impl MirrorConfig {
    /// Creates a configuration for the given project and dataset.
    ///
    /// Live mode and draft overlay are off by default.
    pub fn new(project_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            dataset: dataset.into(),
            listen: false,
            overlay_drafts: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Enables or disables live mode.
    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    /// Enables or disables the draft overlay projection.
    pub fn with_overlay_drafts(mut self, overlay: bool) -> Self {
        self.overlay_drafts = overlay;
        self
    }

    /// Sets the pending buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}
