//! amiflow Cloud Engine
//!
//! This crate provides the build pipeline engine for amiflow and the
//! capability traits every build step talks to the cloud through.
//!
//! # Components
//!
//! - **Step / Runner**: ordered steps with reverse-order cleanup
//! - **Retry / Waiter**: bounded retries with backoff, polling until a state converges
//! - **Fan-out**: concurrent per-region work with an aggregated [`MultiError`]
//! - **Provider traits**: [`ComputeApi`], [`IdentityApi`], [`RegionalClients`], [`HostProbe`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  amiflow CLI                     │
//! │             (amiflow build / validate)           │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                amiflow-build                     │
//! │     chroot / ebs / ebssurrogate builders         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                amiflow-cloud                     │
//! │  ┌──────────────┐  ┌──────────────────────────┐ │
//! │  │ Step/Runner  │  │ Retry / Waiter / FanOut  │ │
//! │  └──────────────┘  └──────────────────────────┘ │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait ComputeApi / IdentityApi { ... }  │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │  amiflow-aws  │ │   FakeCloud   │
//! │   (AWS SDK)   │ │  (test-utils) │
//! └───────────────┘ └───────────────┘
//! ```

pub mod error;
pub mod fanout;
pub mod model;
pub mod multierror;
pub mod provider;
pub mod retry;
pub mod runner;
pub mod step;
pub mod ui;
pub mod waiter;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;

// Re-exports
pub use error::{CloudError, Result};
pub use fanout::{FanOut, fan_out};
pub use model::{
    BlockDeviceMapping, EbsBlockDevice, Image, ImageState, Instance, InstanceBlockDevice,
    InstanceProfile, InstanceState, KeyPair, SecurityGroup, Snapshot, SnapshotState, Subnet, Tag,
    Volume, VolumeAttachment, VolumeState, tags_from_map,
};
pub use multierror::MultiError;
pub use provider::{
    CloudClients, ComputeApi, CopyImageRequest, CreateImageRequest, CreateVolumeRequest, Filter,
    HostProbe, IdentityApi, ImageAttribute, ImageQuery, IngressRule, LaunchPermissions,
    MetadataOptions, RegionalClients, RegisterImageRequest, RunInstanceRequest,
    SecurityGroupQuery,
};
pub use retry::{Backoff, Retry, RetryConfig};
pub use runner::{CleanupFailure, RunReport, Runner};
pub use step::{PipelineState, SharedStep, Step, StepAction};
pub use tokio_util::sync::CancellationToken;
pub use ui::{BufferUi, TracingUi, Ui, UiLevel, UiLine};
pub use waiter::{Probe, Waiter};
