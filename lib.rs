pub mod config;
pub mod error;
pub mod inference;
pub mod labels;
pub mod model;
pub mod models;
pub mod onnx;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod remote;
pub mod sequence;
pub mod tensor;

pub use config::{ExecutionMode, IdentifyConfig};
pub use error::{Error, Result};
pub use model::{ClassifierModel, ModelContract, ModelResources, ModelSource, ScoreKind};
pub use models::{PredictionItem, PredictionSet};
pub use pipeline::{IdentifyOutcome, Identifier};
pub use preprocess::SourceImage;
pub use remote::RemoteClient;
pub use sequence::{RequestSequencer, RequestToken};
