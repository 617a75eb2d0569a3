use crate::error::{Error, Result};
use ndarray::{Array4, ArrayView4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct TensorTracker {
    live: AtomicUsize,
}

impl TensorTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lease(self: &Arc<Self>) -> TensorLease {
        self.live.fetch_add(1, Ordering::AcqRel);
        TensorLease {
            tracker: Arc::clone(self),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct TensorLease {
    tracker: Arc<TensorTracker>,
}

impl Drop for TensorLease {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct PreprocessedTensor {
    data: Array4<f32>,
    _lease: TensorLease,
}

impl PreprocessedTensor {
    pub(crate) fn new(data: Array4<f32>, lease: TensorLease) -> Self {
        Self {
            data,
            _lease: lease,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let dims = self.data.dim();
        [dims.0, dims.1, dims.2, dims.3]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }
}

#[derive(Debug)]
pub struct OutputTensor {
    shape: Vec<i64>,
    data: Vec<f32>,
    lease: Option<TensorLease>,
}

impl OutputTensor {
    pub fn new(shape: Vec<i64>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data,
            lease: None,
        }
    }

    fn track(&mut self, tracker: &Arc<TensorTracker>) {
        if self.lease.is_none() {
            self.lease = Some(tracker.lease());
        }
    }
}

#[derive(Debug)]
pub enum RawOutput {
    Single(OutputTensor),
    Multi(Vec<OutputTensor>),
}

impl RawOutput {
    pub(crate) fn track(&mut self, tracker: &Arc<TensorTracker>) {
        match self {
            Self::Single(tensor) => tensor.track(tracker),
            Self::Multi(tensors) => tensors.iter_mut().for_each(|t| t.track(tracker)),
        }
    }

    /// Squeezes `[1, N]` to `[N]`; only the first head is scored.
    pub fn into_scores(self) -> Result<Vec<f32>> {
        let tensor = match self {
            Self::Single(tensor) => tensor,
            Self::Multi(tensors) => tensors
                .into_iter()
                .next()
                .ok_or_else(|| Error::Inference("Model returned no outputs".into()))?,
        };
        let expected = match tensor.shape.as_slice() {
            [n] => *n,
            [1, n] => *n,
            other => {
                return Err(Error::Inference(format!(
                    "Unsupported output shape {other:?}; expected [N] or [1, N]"
                )))
            }
        };
        if expected < 0 || tensor.data.len() != expected as usize {
            return Err(Error::Inference(format!(
                "Output data length {} does not match shape {:?}",
                tensor.data.len(),
                tensor.shape
            )));
        }
        Ok(tensor.data)
    }
}
