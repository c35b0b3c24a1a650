use smallvec::SmallVec;

/// Reserved label name carrying the metric name, as in the Prometheus
/// data model.
pub const METRIC_NAME_LABEL: &str = "__name__";

pub type LabelPairs = SmallVec<[(String, String); 8]>;

/// An ordered-by-name set of label pairs identifying one time series,
/// including its metric name under [`METRIC_NAME_LABEL`].
///
/// Construction sorts and deduplicates by name, so two label sets that
/// are equal as sets compare equal and produce the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    pairs: LabelPairs,
}

impl LabelSet {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut pairs: LabelPairs = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        // Duplicate names are invalid in the wire protocol, keep the last one.
        pairs.reverse();
        let mut seen = std::collections::HashSet::new();
        pairs.retain(|(name, _)| seen.insert(name.clone()));
        pairs.reverse();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == METRIC_NAME_LABEL)
            .map(|(_, value)| value.as_str())
    }

    /// Deterministic fingerprint of the canonical representation.
    ///
    /// Only process-lifetime stability is required, the backend remains
    /// the source of truth for series identity.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.pairs {
            // Length-prefixed so ("ab","c") and ("a","bc") never collide.
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        Fingerprint(*hasher.finalize().as_bytes())
    }

    /// Canonical JSON object used as the unique series key in storage.
    /// Keys are sorted, serde_json maps are BTree-backed.
    pub fn to_canonical_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .pairs
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Cache key for the series identity cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
