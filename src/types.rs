use serde::Serialize;
use std::fmt;

/// The six emotion categories of the fine-tuned classifier head, in the
/// index order of its output logits. The mapping is fixed for the lifetime
/// of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EmotionLabel {
    Joy,
    Embarrassment,
    Anger,
    Anxiety,
    Hurt,
    Sadness,
}

impl EmotionLabel {
    pub const COUNT: usize = 6;

    pub const ALL: [EmotionLabel; Self::COUNT] = [
        EmotionLabel::Joy,
        EmotionLabel::Embarrassment,
        EmotionLabel::Anger,
        EmotionLabel::Anxiety,
        EmotionLabel::Hurt,
        EmotionLabel::Sadness,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EmotionLabel::Joy => "Joy",
            EmotionLabel::Embarrassment => "Embarrassment",
            EmotionLabel::Anger => "Anger",
            EmotionLabel::Anxiety => "Anxiety",
            EmotionLabel::Hurt => "Hurt",
            EmotionLabel::Sadness => "Sadness",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// A single validated classification request. Built by the HTTP handlers
/// after the `text` field has been checked for presence, never deserialized
/// straight off the wire.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResponse {
    pub id: String,
    pub created: i64,
    pub label: EmotionLabel,
    pub index: usize,
    /// Softmax of the six logits, in label-index order.
    pub probs: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_table_is_total_and_fixed() {
        let expected = [
            (0, "Joy"),
            (1, "Embarrassment"),
            (2, "Anger"),
            (3, "Anxiety"),
            (4, "Hurt"),
            (5, "Sadness"),
        ];
        for (index, name) in expected {
            let label = EmotionLabel::from_index(index).unwrap();
            assert_eq!(label.index(), index);
            assert_eq!(label.display_name(), name);
        }
        assert_eq!(EmotionLabel::from_index(6), None);
    }

    #[test]
    fn no_two_indices_share_a_display_name() {
        let mut names: Vec<_> = EmotionLabel::ALL
            .iter()
            .map(|l| l.display_name())
            .collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EmotionLabel::COUNT);
    }

    #[test]
    fn display_matches_display_name() {
        for label in EmotionLabel::ALL {
            assert_eq!(label.to_string(), label.display_name());
        }
    }
}
