//! Entity Linker
//!
//! Links free-text mentions to known dimension values. A value (or alias)
//! appearing verbatim in the question is a lexical link with a span and
//! score 1.0; otherwise values are ranked by vector similarity against the
//! whole question. Links carry the parent value when the dimension is part
//! of a hierarchy.

use crate::error::Result;
use crate::semantic::glossary::Span;
use crate::semantic::model::SemanticSchema;
use crate::semantic::vector_store::{EntityIndex, EntityKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub dimension: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityLink {
    pub cube: String,
    pub dimension: String,
    pub value: String,
    pub score: f32,
    /// Present for lexical links.
    pub span: Option<Span>,
    pub parent: Option<ParentRef>,
}

impl EntityLink {
    pub fn target(&self) -> String {
        format!("{}.{}", self.cube, self.dimension)
    }
}

#[derive(Debug, Clone)]
pub struct EntityLinker {
    pub top_k: usize,
    pub min_score: f32,
}

impl Default for EntityLinker {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_score: 0.55,
        }
    }
}

impl EntityLinker {
    pub fn new(top_k: usize, min_score: f32) -> Self {
        Self { top_k, min_score }
    }

    pub fn link(
        &self,
        question: &str,
        question_vec: &[f32],
        schema: &SemanticSchema,
        index: &EntityIndex,
    ) -> Result<Vec<EntityLink>> {
        let lowered: Vec<char> = question.to_lowercase().chars().collect();
        let mut links: Vec<EntityLink> = Vec::new();

        for cube in &schema.cubes {
            for dim in &cube.dimensions {
                for v in &dim.values {
                    let forms = std::iter::once(&v.value).chain(v.aliases.iter());
                    let span = forms
                        .filter_map(|form| find_span(&lowered, form))
                        .max_by_key(|s| s.len());
                    if let Some(span) = span {
                        links.push(EntityLink {
                            cube: cube.name.clone(),
                            dimension: dim.name.clone(),
                            value: v.value.clone(),
                            score: 1.0,
                            span: Some(span),
                            parent: parent_of(dim.parent.as_deref(), v.parent.as_deref()),
                        });
                    }
                }
            }
        }

        for hit in index.search(question_vec, EntityKind::DimensionValue, self.top_k * 2)? {
            if hit.score < self.min_score {
                continue;
            }
            let doc = hit.document;
            let (Some(dimension), Some(value)) = (doc.member.as_deref(), doc.value.as_deref()) else {
                continue;
            };
            if links
                .iter()
                .any(|l| l.cube == doc.cube && l.dimension == dimension && l.value == value)
            {
                continue;
            }
            let parent = schema
                .cube(&doc.cube)
                .and_then(|c| c.dimension(dimension))
                .and_then(|d| {
                    let declared = d.values.iter().find(|v| v.value == value)?;
                    parent_of(d.parent.as_deref(), declared.parent.as_deref())
                });
            links.push(EntityLink {
                cube: doc.cube.clone(),
                dimension: dimension.to_string(),
                value: value.to_string(),
                score: hit.score,
                span: None,
                parent,
            });
        }

        links.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        links.truncate(self.top_k);
        Ok(links)
    }
}

fn parent_of(dimension: Option<&str>, value: Option<&str>) -> Option<ParentRef> {
    let value = value?;
    Some(ParentRef {
        dimension: dimension.unwrap_or_default().to_string(),
        value: value.to_string(),
    })
}

fn find_span(haystack: &[char], form: &str) -> Option<Span> {
    let needle: Vec<char> = form.to_lowercase().chars().collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()] == needle[..])
        .map(|start| Span {
            start,
            end: start + needle.len(),
        })
}
