use crate::error::{Error, Result};
use crate::labels::LabelVocabulary;
use crate::tensor::{PreprocessedTensor, RawOutput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    Logits,
    Probabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub input_size: u32,
    pub score_kind: ScoreKind,
    pub classes: Option<usize>,
}

pub trait ClassifierModel: Send + Sync {
    fn contract(&self) -> &ModelContract;

    fn run(&self, input: &PreprocessedTensor) -> Result<RawOutput>;
}

pub type ModelHandle = Arc<dyn ClassifierModel>;

pub trait ModelSource: Send + Sync {
    fn load_model(&self) -> Result<ModelHandle>;

    fn load_labels(&self) -> Result<LabelVocabulary>;
}

pub fn register_model(model: &dyn ClassifierModel, expected: &ModelContract) -> Result<()> {
    let declared = model.contract();
    if declared.input_size != expected.input_size {
        return Err(Error::ResourceLoad(format!(
            "Model expects {0}x{0} input but the pipeline produces {1}x{1}",
            declared.input_size, expected.input_size
        )));
    }
    if declared.score_kind != expected.score_kind {
        return Err(Error::ResourceLoad(format!(
            "Model emits {:?} but the pipeline is configured for {:?}",
            declared.score_kind, expected.score_kind
        )));
    }
    Ok(())
}

/// Model handle and label vocabulary, each loaded at most once. Failed loads
/// are not cached.
pub struct ModelResources {
    source: Arc<dyn ModelSource>,
    expected: ModelContract,
    model: OnceCell<ModelHandle>,
    labels: OnceCell<Arc<LabelVocabulary>>,
}

impl ModelResources {
    pub fn new(source: Arc<dyn ModelSource>, expected: ModelContract) -> Self {
        Self {
            source,
            expected,
            model: OnceCell::new(),
            labels: OnceCell::new(),
        }
    }

    pub fn contract(&self) -> &ModelContract {
        &self.expected
    }

    pub async fn model(&self) -> Result<ModelHandle> {
        let handle = self
            .model
            .get_or_try_init(|| async {
                let source = Arc::clone(&self.source);
                let handle = tokio::task::spawn_blocking(move || source.load_model())
                    .await
                    .map_err(|e| Error::ResourceLoad(format!("Model load task failed: {e}")))?
                    .map_err(|e| {
                        log::error!("Model load failed: {e}");
                        e
                    })?;
                register_model(handle.as_ref(), &self.expected).map_err(|e| {
                    log::error!("Model rejected at registration: {e}");
                    e
                })?;
                Ok::<_, Error>(handle)
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    pub async fn labels(&self) -> Result<Arc<LabelVocabulary>> {
        let labels = self
            .labels
            .get_or_try_init(|| async {
                let source = Arc::clone(&self.source);
                let labels = tokio::task::spawn_blocking(move || source.load_labels())
                    .await
                    .map_err(|e| Error::ResourceLoad(format!("Label load task failed: {e}")))??;
                Ok::<_, Error>(Arc::new(labels))
            })
            .await?;
        Ok(Arc::clone(labels))
    }

    pub async fn warm_up(&self) -> Result<()> {
        let model = self.model().await?;
        let labels = self.labels().await?;
        if let Some(classes) = model.contract().classes {
            if !labels.is_empty() && labels.len() != classes {
                log::warn!(
                    "Model has {classes} classes but {} labels were loaded; unmatched indices use class_<i>",
                    labels.len()
                );
            }
        }
        Ok(())
    }

    pub fn is_model_loaded(&self) -> bool {
        self.model.initialized()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn resources(source: Arc<FakeSource>, expected: ModelContract) -> ModelResources {
        ModelResources::new(source, expected)
    }

    #[tokio::test]
    async fn model_is_memoized_after_first_success() {
        let c = contract(8, ScoreKind::Logits, 3);
        let model: ModelHandle = Arc::new(FakeModel::with_scores(c.clone(), vec![3], vec![0.0; 3]));
        let source = Arc::new(FakeSource::new(model, None));
        let res = resources(Arc::clone(&source), c);
        assert!(!res.is_model_loaded());
        let a = res.model().await.unwrap();
        let b = res.model().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(res.is_model_loaded());
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_retried_on_next_call() {
        let c = contract(8, ScoreKind::Logits, 3);
        let model: ModelHandle = Arc::new(FakeModel::with_scores(c.clone(), vec![3], vec![0.0; 3]));
        let source = Arc::new(FakeSource::new(model, None));
        source.failures.store(1, Ordering::SeqCst);
        let res = resources(Arc::clone(&source), c);
        assert!(matches!(res.model().await, Err(Error::ResourceLoad(_))));
        assert!(!res.is_model_loaded());
        assert!(res.model().await.is_ok());
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_load_once() {
        let c = contract(8, ScoreKind::Logits, 3);
        let model: ModelHandle = Arc::new(FakeModel::with_scores(c.clone(), vec![3], vec![0.0; 3]));
        let mut source = FakeSource::new(model, None);
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let res = Arc::new(resources(Arc::clone(&source), c));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let res = Arc::clone(&res);
            tasks.push(tokio::spawn(async move { res.model().await.is_ok() }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_contract_is_rejected_at_registration() {
        let declared = contract(224, ScoreKind::Probabilities, 3);
        let model: ModelHandle =
            Arc::new(FakeModel::with_scores(declared, vec![3], vec![0.0; 3]));
        let source = Arc::new(FakeSource::new(model, None));

        let wrong_kind = resources(Arc::clone(&source), contract(224, ScoreKind::Logits, 3));
        assert!(matches!(wrong_kind.model().await, Err(Error::ResourceLoad(_))));

        let wrong_size = resources(source, contract(160, ScoreKind::Probabilities, 3));
        assert!(matches!(wrong_size.model().await, Err(Error::ResourceLoad(_))));
    }

    #[tokio::test]
    async fn warm_up_loads_model_and_labels() {
        let c = contract(8, ScoreKind::Logits, 3);
        let model: ModelHandle = Arc::new(FakeModel::with_scores(c.clone(), vec![3], vec![0.0; 3]));
        let labels = LabelVocabulary::new(vec!["rose".into(), "tulsi".into()]);
        let source = Arc::new(FakeSource::new(model, Some(labels)));
        let res = resources(source, c);
        res.warm_up().await.unwrap();
        assert!(res.is_model_loaded());
        assert_eq!(res.labels().await.unwrap().len(), 2);
    }
}
