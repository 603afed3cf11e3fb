use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Label recorded for a probe face that matched no gallery identity.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Default rejection threshold on cosine distance.
///
/// Calibrated for ArcFace (w600k_r50) embeddings. Any other embedding model
/// has a different distance distribution and needs its own value.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.35;

/// Upper bound of the cosine distance; also reported when nothing was comparable.
pub const MAX_DISTANCE: f32 = 2.0;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero-norm vector has similarity 0 with everything. Accumulates in
    /// f64 so that near-identical 512-d vectors do not drift below 1.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0) as f32
        } else {
            0.0
        }
    }

    /// Cosine distance, `1 - similarity`, in [0, 2].
    ///
    /// Embeddings of different dimensionality are not comparable and sit at
    /// [`MAX_DISTANCE`], so they can never pass a threshold.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return MAX_DISTANCE;
        }
        1.0 - self.similarity(other)
    }
}

/// One face returned by an embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub embedding: Embedding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<BoundingBox>,
}

/// Identity label → embeddings enrolled for it.
///
/// Backed by a `BTreeMap`, so identities iterate in lexicographic order and
/// embeddings in the order they were added. The matcher's tie-break follows
/// this order. An identity is only present if it holds at least one embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gallery {
    identities: BTreeMap<String, Vec<Embedding>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert all embeddings for `label`. An empty list is ignored.
    pub fn insert(&mut self, label: impl Into<String>, embeddings: Vec<Embedding>) {
        if embeddings.is_empty() {
            return;
        }
        self.identities
            .entry(label.into())
            .or_default()
            .extend(embeddings);
    }

    pub fn get(&self, label: &str) -> Option<&[Embedding]> {
        self.identities.get(label).map(Vec::as_slice)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.identities.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Embedding])> {
        self.identities
            .iter()
            .map(|(label, embs)| (label.as_str(), embs.as_slice()))
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Total number of embeddings across all identities.
    pub fn embedding_count(&self) -> usize {
        self.identities.values().map(Vec::len).sum()
    }

    /// Write the gallery as a JSON object `{label: [embedding, ...]}`.
    pub fn save_json(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)
    }

    /// Read a gallery written by [`save_json`](Self::save_json).
    ///
    /// Empty identity lists in the file are dropped.
    pub fn load_json(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let raw: BTreeMap<String, Vec<Embedding>> = serde_json::from_slice(&bytes)?;
        let mut gallery = Gallery::new();
        for (label, embs) in raw {
            gallery.insert(label, embs);
        }
        Ok(gallery)
    }
}

/// Outcome identity of a match: a gallery label or the "unknown" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Known(String),
    Unknown,
}

impl Identity {
    pub fn label(&self) -> &str {
        match self {
            Identity::Known(label) => label,
            Identity::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub identity: Identity,
    /// Cosine distance to the closest gallery embedding, reported for both
    /// outcomes. [`MAX_DISTANCE`] when the gallery is empty.
    pub distance: f32,
}

/// Strategy for comparing a probe embedding against a gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchOutcome;
}

/// Nearest-neighbour matcher on cosine distance.
///
/// Visits every embedding of every identity. The first pair at the minimum
/// distance wins; a match requires `distance < threshold` (strict).
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchOutcome {
        let mut best: Option<(&str, f32)> = None;

        for (label, embeddings) in gallery.iter() {
            for candidate in embeddings {
                let dist = probe.distance(candidate);
                if best.map_or(true, |(_, d)| dist < d) {
                    best = Some((label, dist));
                }
            }
        }

        match best {
            Some((label, distance)) if distance < threshold => MatchOutcome {
                identity: Identity::Known(label.to_string()),
                distance,
            },
            Some((_, distance)) => MatchOutcome {
                identity: Identity::Unknown,
                distance,
            },
            None => MatchOutcome {
                identity: Identity::Unknown,
                distance: MAX_DISTANCE,
            },
        }
    }
}
