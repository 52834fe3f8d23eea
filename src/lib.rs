//! Stereo Real-Time Detection (stereo-rt)
//!
//! Periodic real-time scheduling for a stereo camera detection pipeline.
//!
//! # Architecture
//!
//! - `scheduler`: runs a fixed set of periodic tasks, one OS thread each,
//!   with optional core pinning and `SCHED_FIFO` priority
//! - `perf`: per-task execution statistics, deadline accounting and
//!   execution-time histograms
//! - `coordinator`: latest-value mailboxes and broadcast readiness signals
//!   between stages
//! - `pipeline`: the five-stage stereo pipeline (two captures, preprocess,
//!   detect, monitor) and its end-to-end cycle budget
//!
//! Collaborators sit behind traits: `ingest::FrameSource` for cameras,
//! `detect::InferenceEngine` for the detector and `sink::ResultSink` for
//! result display.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod perf;
pub mod pipeline;
pub mod scheduler;
pub mod sink;
pub mod task;

pub use context::{available_cores, RealtimePolicy, StopSignal};
pub use coordinator::{HandOff, Mailbox, PipelineCoordinator, ReadCursor, ReadySignal};
pub use error::{RtError, RtResult};
pub use frame::{Frame, PixelFormat, StereoFrame, TensorFrame};
pub use perf::{Histogram, HistogramConfig, MeasurementHandle, PerformanceMonitor, TaskStats};
pub use pipeline::{CycleReport, PipelineConfig, StageTiming, StereoPipeline};
pub use scheduler::Scheduler;
pub use task::{CpuCore, TaskConfig, TaskSpec, MAX_PRIORITY};
