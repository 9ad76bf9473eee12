mod line_buffer;
pub(crate) mod payload;
pub(crate) mod progress;
mod supervisor;

use crate::model::StageEvent;
use tokio::sync::broadcast;

pub use payload::StagePayload;
pub use progress::ProgressWindow;
pub use supervisor::{StageReport, StageRequest, Supervisor, WorkerLauncher};

/// Fan-out of stage events to every subscriber of a session.
pub type EventSender = broadcast::Sender<StageEvent>;
