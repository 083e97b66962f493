//! Architecture registry
//!
//! Every known classifier architecture is an enum variant carrying its
//! feature-tap table. The name lookup happens once, at resolution time.

use crate::error::{Error, Result};
use std::fmt;

/// Name of the layer that produces class logits; its width is `num_classes`
pub const LOGITS_TAP: &str = "logits";

/// Known main-classifier architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelName {
    BiasedMnistCnn,
    ResNet18,
    UpDn,
}

impl ModelName {
    pub const ALL: [ModelName; 3] = [ModelName::BiasedMnistCnn, ModelName::ResNet18, ModelName::UpDn];

    /// Look up an architecture by its config name
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "biasedmnistcnn" => Ok(ModelName::BiasedMnistCnn),
            "resnet18" => Ok(ModelName::ResNet18),
            "updn" => Ok(ModelName::UpDn),
            _ => Err(Error::config(format!(
                "unknown model '{name}'. Supported: BiasedMNISTCNN, ResNet18, UpDn"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::BiasedMnistCnn => "BiasedMNISTCNN",
            ModelName::ResNet18 => "ResNet18",
            ModelName::UpDn => "UpDn",
        }
    }

    /// Hidden feature taps in forward order, excluding `logits`
    pub fn hidden_taps(&self) -> &'static [(&'static str, usize)] {
        match self {
            ModelName::BiasedMnistCnn => &[
                ("conv1", 32),
                ("conv2", 32),
                ("pooled2", 32),
                ("conv3", 64),
                ("conv4", 64),
                ("conv5", 64),
                ("pooled5", 128),
            ],
            ModelName::ResNet18 => &[
                ("layer1", 64),
                ("layer2", 128),
                ("layer3", 256),
                ("layer4", 512),
            ],
            ModelName::UpDn => &[("v_emb", 512), ("q_emb", 512), ("joint", 1024)],
        }
    }

    /// Width of a named tap, `None` when the tap is not in the table
    pub fn tap_width(&self, tap: &str, num_classes: usize) -> Option<usize> {
        if tap == LOGITS_TAP {
            return Some(num_classes);
        }
        self.hidden_taps()
            .iter()
            .find(|(name, _)| *name == tap)
            .map(|(_, width)| *width)
    }

    /// Full tap table including `logits`
    pub fn tap_table(&self, num_classes: usize) -> Vec<(String, usize)> {
        self.hidden_taps()
            .iter()
            .map(|(name, width)| (name.to_string(), *width))
            .chain(std::iter::once((LOGITS_TAP.to_string(), num_classes)))
            .collect()
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
