//! Relay engine: coalescing, dedup, resilience, and throttled presentation.
//!
//! Everything here is safe under both the cooperative streaming path and a
//! thread-per-request webhook path; session mutual exclusion is an explicit
//! per-key guard rather than reliance on single-threaded interleaving.

mod coalescer;
mod dedup;
mod presenter;
mod retry;
mod traits;
mod types;
mod vault;

pub use coalescer::SessionCoalescer;
pub use dedup::DedupCache;
pub use presenter::{
    AnimationConfig, PresentedRun, PresenterConfig, ThrottledPresenter, render_display,
    CONTENT_FIELD, STATUS_FIELD,
};
pub use retry::{FailureKind, RetryPolicy, classify_backend_error, classify_message};
pub use traits::{BatchHandler, HistoryStore, StoredMessage, ToolInvoker, UiSurface};
pub use types::{Attachment, BufferedBatch, FragmentMetadata, InboundFragment, SessionKey, TargetId};
pub use vault::{CredentialSource, IssuedCredential, TokenVault};
