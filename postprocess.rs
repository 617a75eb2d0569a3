use crate::error::{Error, Result};
use crate::labels::LabelVocabulary;
use crate::model::ScoreKind;
use crate::models::{PredictionItem, PredictionSet};
use std::cmp::Ordering;

pub const DEFAULT_TOP_K: usize = 3;

const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

pub fn softmax(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let max_val = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut exps = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for v in values {
        let e = (v - max_val).exp();
        exps.push(e);
        sum += e;
    }
    if sum <= 0.0 {
        return vec![0.0; values.len()];
    }
    exps.iter().map(|e| e / sum).collect()
}

pub fn to_probabilities(scores: &[f32], kind: ScoreKind) -> Result<Vec<f32>> {
    if let Some(bad) = scores.iter().find(|v| !v.is_finite()) {
        return Err(Error::Inference(format!("Model produced non-finite score {bad}")));
    }
    match kind {
        ScoreKind::Logits => Ok(softmax(scores)),
        ScoreKind::Probabilities => {
            if scores.iter().any(|p| !(0.0..=1.0).contains(p)) {
                return Err(Error::Inference(
                    "Model declared probabilities but emitted scores outside [0, 1]".into(),
                ));
            }
            let sum: f32 = scores.iter().sum();
            if (sum - 1.0).abs() > PROBABILITY_SUM_TOLERANCE {
                return Err(Error::Inference(format!(
                    "Model declared probabilities but scores sum to {sum:.4}"
                )));
            }
            Ok(scores.to_vec())
        }
    }
}

fn round4(score: f32) -> f32 {
    (score * 10000.0).round() / 10000.0
}

/// Indices of the `k` highest probabilities. Equal scores keep index order.
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    ranked.truncate(k);
    ranked
}

pub fn postprocess(
    scores: &[f32],
    kind: ScoreKind,
    labels: &LabelVocabulary,
    k: usize,
) -> Result<PredictionSet> {
    if scores.is_empty() {
        return Err(Error::Inference("Model produced an empty score vector".into()));
    }
    let probs = to_probabilities(scores, kind)?;
    let items = top_k(&probs, k)
        .into_iter()
        .map(|(idx, prob)| PredictionItem {
            label: labels.label_for(idx),
            score: round4(prob),
        })
        .collect();
    Ok(PredictionSet::from_sorted(items))
}
