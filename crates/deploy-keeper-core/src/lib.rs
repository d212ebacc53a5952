//! # Deploy-Keeper Core
//!
//! Deployment orchestration engine for Deploy-Keeper.
//!
//! This crate turns an inbound push notification into a safely sequenced
//! redeployment of a container-compose stack:
//! - Webhook signature validation and payload routing
//! - Working copy management (clone, update, trust list, ownership repair)
//! - Container-compose redeployment with conflict recovery
//! - Per-branch job deduplication, serialized execution and job metrics
//!
//! External tools (`git`, `docker`, `ssh`) are reached exclusively through the
//! [`command::CommandRunner`] capability.

pub mod command;
pub mod config;
pub mod conflict;
pub mod deployment;
pub mod docker;
pub mod git;
pub mod loader;
pub mod notification;
pub mod repository;
pub mod safe_directory;
pub mod ssh;
pub mod webhook;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{CommandError, CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner};
pub use config::{
    BranchSettings, ConfigError, DeployConfig, LoggingConfig, RepositoryConfig, Settings,
    SharedConfig, SshSettings, WebhookSettings,
};
pub use deployment::{
    DeployError, DeploymentOrchestrator, DeploymentReport, DeploymentStats, JobKey,
};
pub use docker::{ComposeRuntime, ContainerDeployer, ContainerError};
pub use git::{GitSync, SourceSync, SyncError};
pub use notification::{DeploymentStatus, NotificationDispatcher};
pub use repository::{RepositoryError, RepositoryManager, WorkingCopyStatus};
pub use safe_directory::{OwnershipPolicy, SafeDirectoryRegistry};
pub use ssh::{SshTransport, Transport, TransportError};
pub use webhook::{
    pipeline::{IncomingWebhook, PipelineOutcome, WebhookPipeline, WebhookResponse, WebhookStatus},
    PayloadError, PushNotification, RoutingDecision, SignatureError,
};
