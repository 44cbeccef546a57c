//! amiflow image builders
//!
//! This crate turns a validated builder configuration into an ordered list of
//! steps, runs them against the cloud capabilities from `amiflow-cloud`, and
//! returns the images the build produced.
//!
//! - `amazon-ebs`: boot a source instance, provision it over SSH, image it
//! - `amazon-chroot`: attach a volume to this host and provision it in a chroot
//! - `amazon-ebssurrogate`: provision a secondary volume, register it as root

pub mod artifact;
pub mod builder;
pub mod communicator;
pub mod error;
pub mod progress;
pub mod state;
pub mod steps;
pub mod template;

pub use artifact::Artifact;
pub use builder::{
    BuildContext, Builder, CHROOT_BUILDER_ID, ChrootBuilder, EBS_BUILDER_ID, EbsBuilder,
    SURROGATE_BUILDER_ID, SurrogateBuilder, from_config, run,
};
pub use communicator::{ChrootShell, CommandOutput, Communicator, LocalShell, SshCommunicator};
pub use error::{BuildError, Result};
pub use progress::BuildProgress;
pub use state::BuildState;
