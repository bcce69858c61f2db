//! Core library for the pose transfer tool.
//!
//! A run imports a posed source rig and a target avatar through an external
//! engine, copies the source pose onto the target by bone name, bakes the
//! result into a single-frame action, strips tool metadata and exports the
//! avatar. A thumbnail of the exported file is then rendered in a separate
//! engine process. Each module owns one step; [`pipeline`] sequences them.

pub mod bake;
pub mod config;
pub mod correspondence;
pub mod engine;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod preview;
pub mod process;
pub mod sanitize;
pub mod scene;
pub mod settings;
pub mod skeleton;
pub mod transfer;

pub use bake::{bake_visual_pose, remove_source_rig, Action, BakeSummary, BAKE_FRAME};
pub use config::{EngineConfig, PipelineConfig};
pub use correspondence::CorrespondenceMap;
pub use engine::{Engine, HostEngine, RunContext};
pub use error::{ErrorKind, PoseTransferError, Result};
pub use export::{export_artifact, DeferredConstraint, ExportRequest, ExportSettings};
pub use pipeline::{
    Pipeline, PipelineFailure, PipelineHandle, PipelineInputs, PipelineReport, PipelineState,
    PreviewOutcome, Stage,
};
pub use preview::{render_preview, PreviewRequest, PreviewSettings};
pub use process::CancellationToken;
pub use sanitize::{sanitize_metadata, RESERVED_NAMESPACE};
pub use scene::{ObjectId, Scene, SceneObject};
pub use settings::Settings;
pub use skeleton::{Bone, BoneId, Constraint, ConstraintSpace, Skeleton, Transform};
pub use transfer::{transfer_pose, Pose, TransferSummary};
