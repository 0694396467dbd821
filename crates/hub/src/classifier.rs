//! Pump classifier oracle.
//!
//! The shipped model is a random forest exported to JSON: a list of binary
//! decision trees over the features `ph` (index 0) and `soil_percent`
//! (index 1). Each split sends `x[feature] <= threshold` left, everything
//! else right. The forest answers ON only on a strict majority of votes.
//!
//! ```json
//! { "trees": [ { "nodes": [
//!     { "kind": "split", "feature": 1, "threshold": 30.0, "left": 1, "right": 2 },
//!     { "kind": "leaf", "pump": "ON" },
//!     { "kind": "leaf", "pump": "OFF" }
//! ] } ] }
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::PumpStatus;

const FEATURE_COUNT: usize = 2;

#[derive(Debug, Error, PartialEq)]
pub enum ClassifierError {
    #[error("non-finite input (ph={ph}, soil_percent={soil_percent})")]
    InvalidInput { ph: f64, soil_percent: i64 },
    #[error("tree {tree} references missing node {node}")]
    MissingNode { tree: usize, node: usize },
    #[error("tree {tree} splits on unknown feature {feature}")]
    UnknownFeature { tree: usize, feature: usize },
    #[error("tree {tree} does not reach a leaf")]
    NoLeaf { tree: usize },
}

/// Maps (pH, soil moisture %) to a pump recommendation.
pub trait Classifier: Send + Sync {
    fn predict(&self, ph: f64, soil_percent: i64) -> Result<PumpStatus, ClassifierError>;
}

// ---------------------------------------------------------------------------
// Forest model
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ForestModel {
    trees: Vec<DecisionTree>,
}

#[derive(Debug, Deserialize)]
struct DecisionTree {
    nodes: Vec<TreeNode>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        pump: PumpStatus,
    },
}

impl ForestModel {
    pub fn from_json(json: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(json).context("model is not valid forest JSON")?;
        model.check()?;
        Ok(model)
    }

    /// Structural checks done once at load time so prediction never
    /// indexes out of bounds on a well-formed file.
    fn check(&self) -> Result<()> {
        if self.trees.is_empty() {
            bail!("model has no trees");
        }
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                bail!("tree {t} has no nodes");
            }
            for (n, node) in tree.nodes.iter().enumerate() {
                if let TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } = node
                {
                    if *feature >= FEATURE_COUNT {
                        bail!("tree {t} node {n}: unknown feature {feature}");
                    }
                    if !threshold.is_finite() {
                        bail!("tree {t} node {n}: threshold is not finite");
                    }
                    if *left >= tree.nodes.len() || *right >= tree.nodes.len() {
                        bail!("tree {t} node {n}: child index out of range");
                    }
                }
            }
        }
        Ok(())
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    fn vote(&self, t: usize, features: &[f64; FEATURE_COUNT]) -> Result<PumpStatus, ClassifierError> {
        let tree = &self.trees[t];
        let mut idx = 0;

        // A path longer than the node count means the tree has a cycle.
        for _ in 0..=tree.nodes.len() {
            match tree.nodes.get(idx) {
                Some(TreeNode::Leaf { pump }) => return Ok(*pump),
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = features.get(*feature).ok_or(ClassifierError::UnknownFeature {
                        tree: t,
                        feature: *feature,
                    })?;
                    idx = if x <= threshold { *left } else { *right };
                }
                None => return Err(ClassifierError::MissingNode { tree: t, node: idx }),
            }
        }

        Err(ClassifierError::NoLeaf { tree: t })
    }
}

impl Classifier for ForestModel {
    fn predict(&self, ph: f64, soil_percent: i64) -> Result<PumpStatus, ClassifierError> {
        if !ph.is_finite() {
            return Err(ClassifierError::InvalidInput { ph, soil_percent });
        }
        let features = [ph, soil_percent as f64];

        let mut on_votes = 0;
        for t in 0..self.trees.len() {
            if self.vote(t, &features)? == PumpStatus::On {
                on_votes += 1;
            }
        }

        Ok(if on_votes * 2 > self.trees.len() {
            PumpStatus::On
        } else {
            PumpStatus::Off
        })
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load the classifier from `path`. A missing or broken model is not fatal:
/// the hub keeps running in monitoring mode and recommendations are UNKNOWN.
pub fn load(path: &Path) -> Option<Arc<dyn Classifier>> {
    if !path.exists() {
        warn!(path = %path.display(), "no classifier model found, running in monitoring mode");
        return None;
    }

    let loaded = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model: {}", path.display()))
        .and_then(|json| ForestModel::from_json(&json));

    match loaded {
        Ok(model) => {
            info!(path = %path.display(), trees = model.tree_count(), "classifier model loaded");
            Some(Arc::new(model))
        }
        Err(e) => {
            error!(path = %path.display(), "failed to load classifier model: {e:#}");
            None
        }
    }
}

/// Fixed-answer classifiers for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct FixedClassifier(pub PumpStatus);

    impl Classifier for FixedClassifier {
        fn predict(&self, _ph: f64, _soil_percent: i64) -> Result<PumpStatus, ClassifierError> {
            Ok(self.0)
        }
    }

    pub(crate) struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn predict(&self, ph: f64, soil_percent: i64) -> Result<PumpStatus, ClassifierError> {
            Err(ClassifierError::InvalidInput { ph, soil_percent })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Stump: ON when soil <= 30 %.
    const DRY_STUMP: &str = r#"
        { "nodes": [
            { "kind": "split", "feature": 1, "threshold": 30.0, "left": 1, "right": 2 },
            { "kind": "leaf", "pump": "ON" },
            { "kind": "leaf", "pump": "OFF" }
        ] }"#;

    /// Stump: ON when pH <= 5.0.
    const ACID_STUMP: &str = r#"
        { "nodes": [
            { "kind": "split", "feature": 0, "threshold": 5.0, "left": 1, "right": 2 },
            { "kind": "leaf", "pump": "ON" },
            { "kind": "leaf", "pump": "OFF" }
        ] }"#;

    const ALWAYS_ON: &str = r#"{ "nodes": [ { "kind": "leaf", "pump": "ON" } ] }"#;

    fn forest(trees: &[&str]) -> ForestModel {
        ForestModel::from_json(&format!(r#"{{ "trees": [{}] }}"#, trees.join(","))).unwrap()
    }

    // -- Prediction ---------------------------------------------------------

    #[test]
    fn single_tree_follows_split() {
        let m = forest(&[DRY_STUMP]);
        assert_eq!(m.predict(6.5, 20), Ok(PumpStatus::On));
        assert_eq!(m.predict(6.5, 30), Ok(PumpStatus::On));
        assert_eq!(m.predict(6.5, 31), Ok(PumpStatus::Off));
    }

    #[test]
    fn majority_vote() {
        let m = forest(&[DRY_STUMP, ACID_STUMP, ALWAYS_ON]);
        // dry + always-on = 2 of 3
        assert_eq!(m.predict(6.5, 10), Ok(PumpStatus::On));
        // only always-on = 1 of 3
        assert_eq!(m.predict(6.5, 60), Ok(PumpStatus::Off));
    }

    #[test]
    fn tied_vote_is_off() {
        let m = forest(&[DRY_STUMP, ACID_STUMP]);
        assert_eq!(m.predict(6.5, 10), Ok(PumpStatus::Off));
        assert_eq!(m.predict(4.0, 10), Ok(PumpStatus::On));
    }

    #[test]
    fn non_finite_ph_is_an_error() {
        let m = forest(&[DRY_STUMP]);
        assert!(matches!(
            m.predict(f64::NAN, 10),
            Err(ClassifierError::InvalidInput { .. })
        ));
    }

    #[test]
    fn cyclic_tree_reports_no_leaf() {
        let m = forest(&[r#"{ "nodes": [
            { "kind": "split", "feature": 0, "threshold": 5.0, "left": 0, "right": 0 }
        ] }"#]);
        assert_eq!(m.predict(6.0, 10), Err(ClassifierError::NoLeaf { tree: 0 }));
    }

    // -- Loading ------------------------------------------------------------

    #[test]
    fn rejects_empty_forest() {
        let err = ForestModel::from_json(r#"{ "trees": [] }"#).unwrap_err();
        assert!(format!("{err:#}").contains("no trees"));
    }

    #[test]
    fn rejects_out_of_range_child() {
        let err = ForestModel::from_json(
            r#"{ "trees": [ { "nodes": [
                { "kind": "split", "feature": 0, "threshold": 5.0, "left": 1, "right": 7 },
                { "kind": "leaf", "pump": "ON" }
            ] } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("child index out of range"));
    }

    #[test]
    fn rejects_unknown_feature() {
        let err = ForestModel::from_json(
            r#"{ "trees": [ { "nodes": [
                { "kind": "split", "feature": 2, "threshold": 5.0, "left": 0, "right": 0 }
            ] } ] }"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown feature 2"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ForestModel::from_json("not json").is_err());
        assert!(ForestModel::from_json(r#"{ "trees": [ { "nodes": [ { "kind": "leaf", "pump": "MAYBE" } ] } ] }"#).is_err());
    }

    #[test]
    fn missing_model_file_yields_none() {
        assert!(load(Path::new("definitely/not/here/model.json")).is_none());
    }

    #[test]
    fn bundled_model_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../ml_models/model.json");
        let model = load(&path).expect("bundled model should load");
        assert_eq!(model.predict(6.5, 15), Ok(PumpStatus::On));
        assert_eq!(model.predict(6.8, 70), Ok(PumpStatus::Off));
    }
}
