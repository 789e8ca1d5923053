//! Core data model definitions shared across Driftcast crates.
#![allow(missing_docs)]

pub mod capabilities;
pub mod job;
pub mod request;
pub mod telemetry;
pub mod ws;

pub use capabilities::{Capabilities, HardwareTier, HwEncoderGroup, TierLimits};
pub use job::{JobSnapshot, JobStatus};
pub use request::{
    AudioCodec, Container, HwAccel, OutputConfig, Resolution, SubtitleTrack, TranscodeMode,
    TranscodeRequest, VideoCodec,
};
pub use telemetry::{AdmissionDecision, LoadTrend, RealtimeSample};
pub use ws::{ClientMessage, ServerMessage};
