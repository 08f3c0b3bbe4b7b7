use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use ndarray::Array2;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};

use crate::{
    features::{FEATURE_LEN, FeatureVector},
    types::PredictionLabel,
};

/// Maps a feature vector to a letter.
pub trait LetterClassifier: Send + 'static {
    fn classify(&mut self, features: &FeatureVector) -> Result<PredictionLabel>;
}

/// ONNX export of the letter model with a `[N, 84]` float input.
///
/// The first output is the label tensor written by sklearn-style exporters
/// (`string` letters or `int64` class indices), or a float score tensor that
/// is argmax'ed. Indices map through the labels list.
pub struct OrtLetterClassifier {
    session: Session,
    labels: Vec<String>,
}

impl OrtLetterClassifier {
    pub fn new(model_path: &Path, labels_path: &Path) -> Result<Self> {
        let labels = if labels_path.exists() {
            let text = fs::read_to_string(labels_path)
                .with_context(|| format!("failed to read labels {}", labels_path.display()))?;
            parse_labels(&text)
                .with_context(|| format!("invalid labels file {}", labels_path.display()))?
        } else {
            log::info!(
                "no labels file at {}, using A-Z",
                labels_path.display()
            );
            default_labels()
        };

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| {
                format!("failed to load ASL classifier from {}", model_path.display())
            })?;

        let classes = check_signature(&session)?;
        check_label_count(&labels, classes)
            .with_context(|| format!("labels do not match {}", model_path.display()))?;

        Ok(Self { session, labels })
    }
}

/// Validates the input width and returns the class count when labels are
/// looked up by index and an output declares a fixed-width float score tensor.
fn check_signature(session: &Session) -> Result<Option<usize>> {
    let input = session
        .inputs
        .first()
        .ok_or_else(|| anyhow!("classifier model declares no inputs"))?;
    log::info!(
        "classifier input \"{}\" type={:?}",
        input.name,
        input.input_type
    );
    for output in &session.outputs {
        log::info!(
            "classifier output \"{}\" type={:?}",
            output.name,
            output.output_type
        );
    }

    if let ValueType::Tensor { shape, .. } = &input.input_type {
        // Dynamic dimensions are reported as -1.
        if let Some(&width) = shape.iter().last() {
            if width > 0 && width as usize != FEATURE_LEN {
                return Err(anyhow!(
                    "classifier expects {width} features, this service produces {FEATURE_LEN}"
                ));
            }
        }
    }

    let emits_letters = matches!(
        session.outputs.first().map(|output| &output.output_type),
        Some(ValueType::Tensor {
            ty: TensorElementType::String,
            ..
        })
    );
    if emits_letters {
        return Ok(None);
    }

    let classes = session.outputs.iter().find_map(|output| match &output.output_type {
        ValueType::Tensor {
            ty: TensorElementType::Float32,
            shape,
            ..
        } => shape
            .iter()
            .last()
            .and_then(|&width| usize::try_from(width).ok())
            .filter(|&width| width > 0),
        _ => None,
    });
    Ok(classes)
}

fn check_label_count(labels: &[String], classes: Option<usize>) -> Result<()> {
    match classes {
        Some(classes) if classes != labels.len() => Err(anyhow!(
            "model scores {classes} classes but {} labels are configured",
            labels.len()
        )),
        _ => Ok(()),
    }
}

impl LetterClassifier for OrtLetterClassifier {
    fn classify(&mut self, features: &FeatureVector) -> Result<PredictionLabel> {
        let input = Array2::from_shape_vec((1, FEATURE_LEN), features.as_slice().to_vec())
            .map_err(|err| anyhow!("failed to build classifier input: {err}"))?;
        let tensor = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .context("failed to run classifier session")?;
        if outputs.len() < 1 {
            return Err(anyhow!("classifier returned no outputs"));
        }

        if let Ok((_, letters)) = outputs[0].try_extract_strings() {
            return label_from_strings(letters);
        }

        if let Ok(classes) = outputs[0].try_extract_array::<i64>() {
            let class = classes
                .iter()
                .next()
                .copied()
                .ok_or_else(|| anyhow!("classifier returned an empty label tensor"))?;
            return label_for_index(&self.labels, class);
        }

        let scores = outputs[0]
            .try_extract_array::<f32>()
            .context("classifier output is neither string or int64 labels nor float scores")?;
        let scores: Vec<f32> = scores.iter().copied().collect();
        let best = argmax(&scores).ok_or_else(|| anyhow!("classifier returned no scores"))?;
        label_for_index(&self.labels, best as i64)
    }
}

pub fn default_labels() -> Vec<String> {
    ('A'..='Z').map(String::from).collect()
}

/// One label per line; blank lines are ignored.
pub fn parse_labels(text: &str) -> Result<Vec<String>> {
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(anyhow!("labels file contains no labels"));
    }
    Ok(labels)
}

fn label_from_strings(values: Vec<String>) -> Result<PredictionLabel> {
    values
        .into_iter()
        .next()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .map(PredictionLabel)
        .ok_or_else(|| anyhow!("classifier returned an empty label"))
}

fn label_for_index(labels: &[String], class: i64) -> Result<PredictionLabel> {
    usize::try_from(class)
        .ok()
        .and_then(|idx| labels.get(idx))
        .map(|label| PredictionLabel(label.clone()))
        .ok_or_else(|| anyhow!("class index {class} outside of {} labels", labels.len()))
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
}
