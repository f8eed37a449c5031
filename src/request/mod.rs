//! Analysis request model.
//!
//! - **AnalysisRequest / AnalysisReply**: the values carried on the queue
//! - **AnalysisKind**: the parsed analysis name used for routing
//! - **Arguments**: typed extraction over the weakly typed argument map

pub mod arguments;
pub mod kind;
pub mod types;

pub use arguments::Arguments;
pub use kind::{AnalysisKind, PlotFamily};
pub use types::{AnalysisReply, AnalysisRequest, ArgValue, ReplyStatus};
