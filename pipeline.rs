use crate::config::{ExecutionMode, IdentifyConfig};
use crate::error::{Error, Result};
use crate::inference::infer;
use crate::model::ModelResources;
use crate::models::PredictionSet;
use crate::onnx::OnnxSource;
use crate::postprocess::postprocess;
use crate::preprocess::{preprocess, SourceImage};
use crate::remote::RemoteClient;
use crate::sequence::{RequestSequencer, RequestToken};
use crate::tensor::TensorTracker;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct IdentifyOutcome {
    pub token: RequestToken,
    pub predictions: PredictionSet,
}

pub struct Identifier {
    resources: Arc<ModelResources>,
    tracker: Arc<TensorTracker>,
    sequencer: RequestSequencer,
    remote: Option<RemoteClient>,
    top_k: usize,
}

impl Identifier {
    pub fn new(resources: Arc<ModelResources>, top_k: usize) -> Self {
        Self {
            resources,
            tracker: TensorTracker::new(),
            sequencer: RequestSequencer::new(),
            remote: None,
            top_k,
        }
    }

    pub fn with_remote(mut self, client: RemoteClient) -> Self {
        self.remote = Some(client);
        self
    }

    pub fn from_config(config: &IdentifyConfig) -> Result<Self> {
        config.validate()?;
        let source = OnnxSource::new(config.clone());
        let contract = source.expected_contract();
        let resources = Arc::new(ModelResources::new(Arc::new(source), contract));
        let client = RemoteClient::new(
            &config.remote_url,
            Duration::from_secs(config.remote_timeout_secs),
        )?;
        Ok(Self::new(resources, config.top_k).with_remote(client))
    }

    pub async fn warm_up(&self) -> Result<()> {
        self.resources.warm_up().await
    }

    pub fn live_tensors(&self) -> usize {
        self.tracker.live()
    }

    pub fn is_current(&self, token: RequestToken) -> bool {
        self.sequencer.is_current(token)
    }

    pub fn accept(&self, outcome: IdentifyOutcome) -> Option<PredictionSet> {
        self.sequencer.accept(outcome.token, outcome.predictions)
    }

    pub async fn identify(&self, image: &SourceImage, mode: ExecutionMode) -> Result<IdentifyOutcome> {
        let token = self.sequencer.issue();
        log::debug!("Request {} started ({mode:?})", token.value());
        let predictions = match mode {
            ExecutionMode::Local => self.identify_local(image).await?,
            ExecutionMode::Remote => {
                let client = self.remote.as_ref().ok_or_else(|| {
                    Error::Config("Remote mode requested but no service is configured".into())
                })?;
                client.identify_remote(image, self.top_k).await?
            }
        };
        Ok(IdentifyOutcome { token, predictions })
    }

    // Execution failures yield an empty set; load and decode failures propagate.
    pub async fn identify_local(&self, image: &SourceImage) -> Result<PredictionSet> {
        let contract = self.resources.contract().clone();
        let tensor = preprocess(image, contract.input_size, &self.tracker)?;
        let model = self.resources.model().await?;
        let labels = self.resources.labels().await?;

        let tracker = Arc::clone(&self.tracker);
        let run_model = Arc::clone(&model);
        let scores = tokio::task::spawn_blocking(move || infer(run_model.as_ref(), &tensor, &tracker))
            .await
            .map_err(|e| Error::Inference(format!("Inference task failed: {e}")))
            .and_then(|res| res);

        let result = scores.and_then(|scores| {
            postprocess(&scores, model.contract().score_kind, &labels, self.top_k)
        });
        match result {
            Ok(set) => {
                if let Some(top) = set.top() {
                    log::info!("Top prediction: {} ({:.4})", top.label, top.score);
                }
                Ok(set)
            }
            Err(Error::Inference(detail)) => {
                log::error!("Inference failed: {detail}");
                Ok(PredictionSet::empty())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelVocabulary;
    use crate::model::testing::{contract, FakeModel, FakeSource};
    use crate::model::{ModelHandle, ModelSource, ScoreKind};
    use crate::models::PredictionItem;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::Ordering;

    fn leaf(w: u32, h: u32) -> SourceImage {
        SourceImage::from_rgb(RgbImage::from_pixel(w, h, Rgb([30, 140, 50])))
    }

    fn identifier(model: FakeModel, labels: Option<LabelVocabulary>) -> (Identifier, Arc<FakeSource>) {
        let expected = model.contract.clone();
        let handle: ModelHandle = Arc::new(model);
        let source = Arc::new(FakeSource::new(handle, labels));
        let resources = Arc::new(ModelResources::new(
            Arc::clone(&source) as Arc<dyn ModelSource>,
            expected,
        ));
        (Identifier::new(resources, 2), source)
    }

    fn herbs() -> LabelVocabulary {
        LabelVocabulary::new(vec!["rose".into(), "tulsi".into(), "neem".into()])
    }

    #[tokio::test]
    async fn local_identification_end_to_end() {
        let model = FakeModel::with_scores(
            contract(32, ScoreKind::Probabilities, 3),
            vec![1, 3],
            vec![0.1, 0.7, 0.2],
        );
        let (identifier, _) = identifier(model, Some(herbs()));
        let outcome = identifier.identify(&leaf(100, 400), ExecutionMode::Local).await.unwrap();
        assert_eq!(
            outcome.predictions.items(),
            &[
                PredictionItem { label: "tulsi".into(), score: 0.7 },
                PredictionItem { label: "neem".into(), score: 0.2 },
            ]
        );
        assert!(identifier.is_current(outcome.token));
    }

    #[tokio::test]
    async fn no_tensors_outlive_sequential_calls() {
        let model = FakeModel::with_scores(contract(16, ScoreKind::Logits, 3), vec![3], vec![1.0, 2.0, 3.0]);
        let (identifier, _) = identifier(model, None);
        for i in 0..5 {
            let set = identifier.identify_local(&leaf(10 + i, 20)).await.unwrap();
            assert_eq!(set.len(), 2);
            assert_eq!(identifier.live_tensors(), 0);
        }
    }

    #[tokio::test]
    async fn inference_failure_yields_empty_set_and_recovers() {
        let c = contract(16, ScoreKind::Logits, 3);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let model = FakeModel::with_output(c, move || {
            use crate::tensor::{OutputTensor, RawOutput};
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(RawOutput::Single(OutputTensor::new(vec![2, 3], vec![0.0; 6])))
            } else {
                Ok(RawOutput::Single(OutputTensor::new(vec![3], vec![0.0, 5.0, 1.0])))
            }
        });
        let (identifier, _) = identifier(model, Some(herbs()));

        let first = identifier.identify_local(&leaf(16, 16)).await.unwrap();
        assert!(first.is_empty());
        assert_eq!(identifier.live_tensors(), 0);

        let second = identifier.identify_local(&leaf(16, 16)).await.unwrap();
        assert_eq!(second.top().map(|p| p.label.as_str()), Some("tulsi"));
        assert_eq!(identifier.live_tensors(), 0);
    }

    #[tokio::test]
    async fn load_failure_is_returned_then_retried() {
        let model = FakeModel::with_scores(contract(16, ScoreKind::Logits, 2), vec![2], vec![0.0, 1.0]);
        let (identifier, source) = identifier(model, None);
        source.failures.store(1, Ordering::SeqCst);

        let err = identifier.identify_local(&leaf(16, 16)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceLoad(_)));
        assert_eq!(identifier.live_tensors(), 0);

        let set = identifier.identify_local(&leaf(16, 16)).await.unwrap();
        assert_eq!(set.top().map(|p| p.label.as_str()), Some("class_1"));
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn superseded_outcome_is_discarded() {
        let model = FakeModel::with_scores(contract(16, ScoreKind::Logits, 2), vec![2], vec![0.0, 1.0]);
        let (identifier, _) = identifier(model, None);
        let first = identifier.identify(&leaf(16, 16), ExecutionMode::Local).await.unwrap();
        let second = identifier.identify(&leaf(16, 16), ExecutionMode::Local).await.unwrap();
        assert!(identifier.accept(first).is_none());
        assert!(identifier.accept(second).is_some());
    }

    #[tokio::test]
    async fn remote_mode_without_client_is_config_error() {
        let model = FakeModel::with_scores(contract(16, ScoreKind::Logits, 2), vec![2], vec![0.0, 1.0]);
        let (identifier, _) = identifier(model, None);
        let err = identifier.identify(&leaf(16, 16), ExecutionMode::Remote).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn remote_mode_bypasses_local_pipeline() {
        use axum::routing::post;
        use axum::{Json, Router};
        use serde_json::json;

        let app = Router::new().route(
            "/api/identify",
            post(|| async {
                Json(json!({
                    "success": true,
                    "predictions": [{ "label": "Tulsi", "score": 0.9 }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let model = Arc::new(FakeModel::with_scores(
            contract(16, ScoreKind::Logits, 2),
            vec![2],
            vec![0.0, 1.0],
        ));
        let handle: ModelHandle = Arc::clone(&model) as ModelHandle;
        let source = Arc::new(FakeSource::new(handle, None));
        let resources = Arc::new(ModelResources::new(
            Arc::clone(&source) as Arc<dyn ModelSource>,
            model.contract.clone(),
        ));
        let client = RemoteClient::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap();
        let identifier = Identifier::new(resources, 2).with_remote(client);

        let outcome = identifier.identify(&leaf(16, 16), ExecutionMode::Remote).await.unwrap();
        assert_eq!(outcome.predictions.top().map(|p| p.label.as_str()), Some("Tulsi"));
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
        assert_eq!(model.runs.load(Ordering::SeqCst), 0);
        assert_eq!(identifier.live_tensors(), 0);
    }
}
