//! Entity Vector Index
//!
//! Every cube, measure, dimension and known dimension value gets one text
//! document and one embedding. Search is an exact cosine scan; tenant schemas
//! hold hundreds of entities, not millions.

use crate::error::{ChatBiError, Result};
use crate::semantic::model::SemanticSchema;
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

pub type Embedding = Vec<f32>;

/// Text to vector. Implementations must return vectors of one fixed
/// dimension.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Deterministic character n-gram hashing embedder. Needs no network and
/// gives lexical similarity, which is what short CJK and English schema
/// labels mostly need.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0f32; self.dimension];
        let chars: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect();
        for n in 1..=2 {
            if chars.len() < n {
                continue;
            }
            for gram in chars.windows(n) {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                gram.hash(&mut hasher);
                let slot = (hasher.finish() % self.dimension as u64) as usize;
                vector[slot] += if n == 1 { 1.0 } else { 2.0 };
            }
        }
        normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Cube,
    Measure,
    Dimension,
    DimensionValue,
}

/// One indexed schema entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDocument {
    pub kind: EntityKind,
    pub cube: String,
    /// Member name; for values, the dimension holding the value.
    pub member: Option<String>,
    /// Set for [`EntityKind::DimensionValue`].
    pub value: Option<String>,
    pub text: String,
    #[serde(skip)]
    pub embedding: Embedding,
}

#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub document: &'a EntityDocument,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    documents: Vec<EntityDocument>,
    dimension: usize,
}

impl EntityIndex {
    /// Embed every entity of `schema`.
    pub async fn build(schema: &SemanticSchema, embedder: &dyn Embedder) -> Result<Self> {
        let mut documents = Vec::new();
        for cube in &schema.cubes {
            documents.push(document(
                EntityKind::Cube,
                &cube.name,
                None,
                None,
                join_text(&[Some(&cube.name), cube.title.as_deref(), cube.description.as_deref()], &[]),
            ));
            for m in &cube.measures {
                documents.push(document(
                    EntityKind::Measure,
                    &cube.name,
                    Some(&m.name),
                    None,
                    join_text(&[Some(&m.name), m.title.as_deref(), m.description.as_deref()], &m.synonyms),
                ));
            }
            for d in &cube.dimensions {
                documents.push(document(
                    EntityKind::Dimension,
                    &cube.name,
                    Some(&d.name),
                    None,
                    join_text(&[Some(&d.name), d.title.as_deref(), d.description.as_deref()], &d.synonyms),
                ));
                for v in &d.values {
                    documents.push(document(
                        EntityKind::DimensionValue,
                        &cube.name,
                        Some(&d.name),
                        Some(&v.value),
                        join_text(&[Some(&v.value)], &v.aliases),
                    ));
                }
            }
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;
        if embeddings.len() != documents.len() {
            return Err(ChatBiError::Semantic(format!(
                "Embedder returned {} vectors for {} documents",
                embeddings.len(),
                documents.len()
            )));
        }
        let dimension = embeddings.first().map(Vec::len).unwrap_or(0);
        for (doc, embedding) in documents.iter_mut().zip(embeddings) {
            if embedding.len() != dimension {
                return Err(ChatBiError::Semantic(format!(
                    "Embedding dimension {} doesn't match index dimension {}",
                    embedding.len(),
                    dimension
                )));
            }
            doc.embedding = embedding;
        }
        Ok(Self { documents, dimension })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Cosine similarity of `query` against one entity, if indexed.
    pub fn score_of(&self, query: &[f32], kind: EntityKind, cube: &str, member: Option<&str>) -> f32 {
        self.documents
            .iter()
            .find(|d| d.kind == kind && d.cube == cube && d.member.as_deref() == member && d.value.is_none())
            .map(|d| cosine_similarity(query, &d.embedding))
            .unwrap_or(0.0)
    }

    /// Top-`top_k` documents of `kind`, best first.
    pub fn search(&self, query: &[f32], kind: EntityKind, top_k: usize) -> Result<Vec<SearchHit<'_>>> {
        if self.documents.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(ChatBiError::Semantic(format!(
                "Query embedding dimension {} doesn't match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let mut hits: Vec<SearchHit<'_>> = self
            .documents
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| SearchHit {
                document: d,
                score: cosine_similarity(query, &d.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}

fn document(
    kind: EntityKind,
    cube: &str,
    member: Option<&str>,
    value: Option<&str>,
    text: String,
) -> EntityDocument {
    EntityDocument {
        kind,
        cube: cube.to_string(),
        member: member.map(str::to_string),
        value: value.map(str::to_string),
        text,
        embedding: Vec::new(),
    }
}

fn join_text(parts: &[Option<&str>], synonyms: &[String]) -> String {
    parts
        .iter()
        .flatten()
        .copied()
        .chain(synonyms.iter().map(String::as_str))
        .join(" ")
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::model::Cube;
    use serde_json::json;

    #[test]
    fn test_hashing_embedder_is_deterministic_and_lexical() {
        let e = HashingEmbedder::default();
        assert_eq!(e.embed_sync("订单金额"), e.embed_sync("订单金额"));
        let close = cosine_similarity(&e.embed_sync("订单金额"), &e.embed_sync("订单总金额"));
        let far = cosine_similarity(&e.embed_sync("订单金额"), &e.embed_sync("employee city"));
        assert!(close > far, "{} <= {}", close, far);
        assert!((cosine_similarity(&e.embed_sync("x"), &e.embed_sync("x")) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_index_search_by_kind() {
        let cube: Cube = serde_json::from_value(json!({
            "name": "Products",
            "measures": [{"name": "units_sold", "sql": "SUM(units)", "title": "销量"}],
            "dimensions": [{"name": "model", "sql": "${CUBE}.model",
                            "values": [{"value": "iPhone 15 Pro", "parent": "手机"}]}]
        }))
        .unwrap();
        let schema = SemanticSchema::new(vec![cube]).unwrap();
        let embedder = HashingEmbedder::default();
        let index = EntityIndex::build(&schema, &embedder).await.unwrap();
        assert_eq!(index.len(), 4);

        let query = embedder.embed_sync("iphone 15 pro 销量");
        let values = index.search(&query, EntityKind::DimensionValue, 5).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].document.value.as_deref(), Some("iPhone 15 Pro"));
        assert!(index.search(&[0.0; 3], EntityKind::Measure, 5).is_err());
    }
}
