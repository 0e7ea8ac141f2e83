use courier_core::SendError;
use courier_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("send error: {0}")]
    Send(#[from] SendError),

    #[error("render error: {0}")]
    Render(String),

    #[error("no approved template: {0}")]
    TemplateUnavailable(String),

    #[error("config error: {0}")]
    Config(String),
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Send(e) => e.error_kind(),
            Self::Render(_) => "render",
            Self::TemplateUnavailable(_) => "template_unavailable",
            Self::Config(_) => "config",
        }
    }
}
