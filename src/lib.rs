#![forbid(unsafe_code)]

pub mod cleanup;
pub mod cli;
pub mod error;
pub mod lock;
pub mod logging;
pub mod mask;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod segmenter;
pub mod split;
pub mod volume;

pub use error::{SegError, SegResult};
pub use model::{CompartmentSpec, RunReport, SegmentationMode, TumorClassMapping};
pub use orchestrator::{CancellationToken, PipelineRun};
pub use segmenter::{FslFast, SegmentRequest, Segmenter};
pub use volume::Volume;
