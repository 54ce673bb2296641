//! Ordered channel label sets

use crate::error::{BspError, BspResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered list of unique channel labels.
///
/// The length defines the channel-axis size a node expects on input or
/// produces on output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ChannelSet {
    labels: Vec<String>,
}

impl ChannelSet {
    /// Create a channel set, rejecting duplicate labels
    pub fn new<I, S>(labels: I) -> BspResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        for (i, label) in labels.iter().enumerate() {
            if labels[..i].contains(label) {
                return Err(BspError::config(format!("Duplicate channel label '{}'", label)));
            }
        }
        Ok(ChannelSet { labels })
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Position of a label
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index_of(label).is_some()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl TryFrom<Vec<String>> for ChannelSet {
    type Error = BspError;

    fn try_from(labels: Vec<String>) -> BspResult<Self> {
        ChannelSet::new(labels)
    }
}

impl From<ChannelSet> for Vec<String> {
    fn from(set: ChannelSet) -> Self {
        set.labels
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.labels.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_labels_rejected() {
        assert!(ChannelSet::new(["C3", "C4", "C3"]).is_err());
        let set = ChannelSet::new(["C3", "C4", "Cz"]).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.index_of("Cz"), Some(2));
        assert!(!set.contains("Pz"));
    }

    #[test]
    fn test_display() {
        let set = ChannelSet::new(["C3", "C4"]).unwrap();
        assert_eq!(set.to_string(), "[C3, C4]");
    }
}
