use crate::error::{Error, Result};
use crate::model::ClassifierModel;
use crate::tensor::{PreprocessedTensor, TensorTracker};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub fn infer(
    model: &dyn ClassifierModel,
    input: &PreprocessedTensor,
    tracker: &Arc<TensorTracker>,
) -> Result<Vec<f32>> {
    let expected = model.contract().input_size as usize;
    if input.shape() != [1, expected, expected, 3] {
        return Err(Error::Inference(format!(
            "Input tensor {:?} does not match model input [1, {expected}, {expected}, 3]",
            input.shape()
        )));
    }
    let mut raw = match catch_unwind(AssertUnwindSafe(|| model.run(input))) {
        Ok(res) => res?,
        Err(_) => return Err(Error::Inference("Model backend panicked".into())),
    };
    raw.track(tracker);
    let scores = raw.into_scores()?;
    if let Some(classes) = model.contract().classes {
        if scores.len() != classes {
            log::debug!(
                "Model declared {classes} classes but produced {} scores",
                scores.len()
            );
        }
    }
    Ok(scores)
}
