// Resumable Workflows Library - interruption-safe multi-step user workflows
// This exposes the core components for embedding and testing

pub mod api;
pub mod clock;
pub mod config;
pub mod machine;
pub mod platform;
pub mod store;
pub mod telemetry;
pub mod timer;
pub mod workflows;

// Re-export key types for easy access
pub use api::{ApiError, ApiResult, DispositionApi, IdentityApi, PaymentApi};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{config, init_config, WorkflowConfig};
pub use machine::{Context, Machine, Outcome, TransitionTable};
pub use platform::{HeadlessBrowser, Navigator, NoticeLevel, Notifier, TracingNotifier, WindowHandle};
pub use store::{CallbackStore, FileStorage, MemoryStorage, PendingCallback, SessionStorage, StorageError};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
pub use timer::{Countdown, Liveness, PollControl, TimerSlot};
pub use workflows::{
    AssetDispositionController, IdentityVerificationController, PaymentHandoffController, PaymentStep,
};
