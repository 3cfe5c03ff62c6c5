//! The pipeline: per-task event streaming, the five stage services, the
//! browser test harness, pull-request publishing, the orchestrator, and
//! ingress.

pub mod events;
pub mod ingress;
pub mod orchestrator;
pub mod publish;
pub mod qa;
pub mod stages;

pub use events::{task_channel, EventReceiver, EventSender, TaskEvent};
pub use ingress::{Ingress, Submission, ValidationError};
pub use orchestrator::Orchestrator;
pub use publish::{GitHubGateway, PrGateway, PrRequest, PublishError, RecordedGateway};
pub use qa::{BrowserRunner, HeadlessBrowser, QualityGate, ScriptedBrowser, TestCase, TestHarness};
