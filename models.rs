use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionItem {
    pub label: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionSet {
    items: Vec<PredictionItem>,
}

impl PredictionSet {
    pub(crate) fn from_sorted(items: Vec<PredictionItem>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[PredictionItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn top(&self) -> Option<&PredictionItem> {
        self.items.first()
    }
}

impl IntoIterator for PredictionSet {
    type Item = PredictionItem;
    type IntoIter = std::vec::IntoIter<PredictionItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

// The service also sends rank, class, confidence and probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePrediction {
    pub label: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIdentifyResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub predictions: Vec<RemotePrediction>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub predicted_class: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemedyRequest {
    pub symptoms: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemedyResponse {
    pub response: String,
}
