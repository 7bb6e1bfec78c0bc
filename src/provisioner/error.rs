#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("start failed: {message}")]
    Start { message: String, terminal: bool },

    #[error("terminate failed: {message}")]
    Terminate { message: String },
}

impl ProvisionerError {
    /// Whether a `start` failure should be treated as permanent (node goes
    /// straight to `ERROR`) rather than transient (left `PENDING` for the
    /// next tick to retry). Only meaningful for [`ProvisionerError::Start`];
    /// [`ProvisionerError::Terminate`] failures are always transient — the
    /// node is simply left `IDLE` and retried.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Start { terminal: true, .. })
    }
}
