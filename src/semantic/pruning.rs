//! Schema Pruning
//!
//! Selects the part of a large schema worth showing the language model:
//! members scoring at or above a similarity threshold, capped per category,
//! plus anything the glossary named explicitly (kept regardless of score).

use crate::config::PruningConfig;
use crate::semantic::model::{column_references, template_identifiers, Cube, Dimension, Join, Measure, SemanticSchema};
use crate::semantic::vector_store::{EntityIndex, EntityKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;

/// Members that must survive pruning, as `(cube, member)`.
#[derive(Debug, Clone, Default)]
pub struct ForcedMembers {
    pub measures: Vec<(String, String)>,
    pub dimensions: Vec<(String, String)>,
    pub cubes: Vec<String>,
    /// `(cube, column)`: members reading one of these columns are kept.
    pub columns: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunedCube {
    pub name: String,
    pub table: String,
    pub measures: Vec<Measure>,
    pub dimensions: Vec<Dimension>,
    pub joins: Vec<Join>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrunedSchema {
    pub cubes: Vec<PrunedCube>,
}

impl PrunedSchema {
    pub fn is_empty(&self) -> bool {
        self.cubes.is_empty()
    }

    pub fn cube(&self, name: &str) -> Option<&PrunedCube> {
        self.cubes.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_measure(&self, cube: &str, measure: &str) -> bool {
        self.cube(cube)
            .map(|c| c.measures.iter().any(|m| m.name.eq_ignore_ascii_case(measure)))
            .unwrap_or(false)
    }

    /// Every name a query may legitimately reference: cube and table names,
    /// member names and the bare columns inside member templates.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for cube in &self.cubes {
            out.insert(cube.name.to_lowercase());
            out.insert(cube.table.to_lowercase());
            for m in &cube.measures {
                out.insert(m.name.to_lowercase());
                out.extend(template_identifiers(&m.sql).into_iter().map(|s| s.to_lowercase()));
            }
            for d in &cube.dimensions {
                out.insert(d.name.to_lowercase());
                out.extend(template_identifiers(&d.sql).into_iter().map(|s| s.to_lowercase()));
            }
        }
        out
    }

    pub fn contains_identifier(&self, name: &str) -> bool {
        let name = name.trim_matches(|c| c == '"' || c == '`' || c == '\'').to_lowercase();
        // `table.column` hints are checked on the column part.
        let last = name.rsplit('.').next().unwrap_or(&name).to_string();
        let known = self.identifiers();
        known.contains(&name) || known.contains(&last)
    }

    /// Compact text form for prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for cube in &self.cubes {
            let _ = writeln!(out, "cube {} (table {})", cube.name, cube.table);
            for m in &cube.measures {
                let _ = writeln!(out, "  measure {}: {}{}", m.name, m.sql, describe(&m.title, &m.description));
            }
            for d in &cube.dimensions {
                let _ = writeln!(out, "  dimension {}: {}{}", d.name, d.sql, describe(&d.title, &d.description));
            }
            for j in &cube.joins {
                let _ = writeln!(
                    out,
                    "  join {} ({:?}, {}): {}",
                    j.name,
                    j.relationship,
                    j.join_type.as_sql(),
                    j.sql
                );
            }
        }
        out
    }
}

fn describe(title: &Option<String>, description: &Option<String>) -> String {
    match (title, description) {
        (Some(t), Some(d)) => format!("  -- {}: {}", t, d),
        (Some(t), None) => format!("  -- {}", t),
        (None, Some(d)) => format!("  -- {}", d),
        (None, None) => String::new(),
    }
}

/// Score and cap the schema against the question.
pub fn prune(
    schema: &SemanticSchema,
    question: &str,
    question_vec: &[f32],
    index: &EntityIndex,
    forced: &ForcedMembers,
    config: &PruningConfig,
) -> PrunedSchema {
    let lowered = question.to_lowercase();

    let mut measures: Vec<(f32, &Cube, &Measure)> = Vec::new();
    let mut dimensions: Vec<(f32, &Cube, &Dimension)> = Vec::new();
    for cube in &schema.cubes {
        for m in &cube.measures {
            let lexical = lexical_score(&lowered, &m.name, m.title.as_deref(), &m.synonyms);
            let vector = index.score_of(question_vec, EntityKind::Measure, &cube.name, Some(&m.name));
            measures.push((lexical.max(vector), cube, m));
        }
        for d in &cube.dimensions {
            let lexical = lexical_score(&lowered, &d.name, d.title.as_deref(), &d.synonyms);
            let vector = index.score_of(question_vec, EntityKind::Dimension, &cube.name, Some(&d.name));
            dimensions.push((lexical.max(vector), cube, d));
        }
    }

    let keep_measures = select(measures, config.min_similarity, config.max_measures, |c, m| {
        is_forced(&forced.measures, &c.name, &m.name) || reads_forced_column(&forced.columns, &c.name, &m.sql)
    });
    let keep_dimensions = select(dimensions, config.min_similarity, config.max_dimensions, |c, d| {
        is_forced(&forced.dimensions, &c.name, &d.name) || reads_forced_column(&forced.columns, &c.name, &d.sql)
    });

    // Cube order: forced cubes, then in order of first kept member.
    let mut cube_order: Vec<String> = Vec::new();
    let mut push_cube = |name: &str| {
        if !cube_order.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            cube_order.push(name.to_string());
        }
    };
    for name in &forced.cubes {
        push_cube(name);
    }
    for (c, _) in &keep_measures {
        push_cube(&c.name);
    }
    for (c, _) in &keep_dimensions {
        push_cube(&c.name);
    }
    let forced_cubes: HashSet<String> = forced
        .measures
        .iter()
        .chain(forced.dimensions.iter())
        .map(|(c, _)| c.to_lowercase())
        .chain(forced.cubes.iter().map(|c| c.to_lowercase()))
        .collect();
    let mut cube_names: Vec<String> = Vec::new();
    for name in cube_order {
        if cube_names.len() < config.max_cubes || forced_cubes.contains(&name.to_lowercase()) {
            cube_names.push(name);
        }
    }

    let cubes = cube_names
        .iter()
        .filter_map(|name| schema.cube(name))
        .map(|cube| PrunedCube {
            name: cube.name.clone(),
            table: cube.table().to_string(),
            measures: keep_measures
                .iter()
                .filter(|(c, _)| c.name == cube.name)
                .map(|(_, m)| (*m).clone())
                .collect(),
            dimensions: keep_dimensions
                .iter()
                .filter(|(c, _)| c.name == cube.name)
                .map(|(_, d)| (*d).clone())
                .collect(),
            joins: cube
                .joins
                .iter()
                .filter(|j| cube_names.iter().any(|n| n.eq_ignore_ascii_case(&j.name)))
                .cloned()
                .collect(),
        })
        .collect();

    PrunedSchema { cubes }
}

fn select<'a, T, F>(
    mut scored: Vec<(f32, &'a Cube, &'a T)>,
    min_similarity: f32,
    cap: usize,
    forced: F,
) -> Vec<(&'a Cube, &'a T)>
where
    F: Fn(&Cube, &T) -> bool,
{
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<(&Cube, &T)> = Vec::new();
    let mut regular = 0usize;
    for (score, cube, member) in scored {
        if forced(cube, member) {
            kept.push((cube, member));
        } else if score >= min_similarity && regular < cap {
            kept.push((cube, member));
            regular += 1;
        }
    }
    kept
}

fn is_forced(list: &[(String, String)], cube: &str, member: &str) -> bool {
    list.iter()
        .any(|(c, m)| c.eq_ignore_ascii_case(cube) && m.eq_ignore_ascii_case(member))
}

fn reads_forced_column(columns: &[(String, String)], cube: &str, sql: &str) -> bool {
    if !columns.iter().any(|(c, _)| c.eq_ignore_ascii_case(cube)) {
        return false;
    }
    column_references(sql)
        .iter()
        .any(|col| is_forced(columns, cube, col))
}

/// 1.0 when a name, title or synonym appears in the question; otherwise the
/// share of the name's `_`-separated words found in it.
fn lexical_score(question: &str, name: &str, title: Option<&str>, synonyms: &[String]) -> f32 {
    let forms = std::iter::once(name)
        .chain(title)
        .chain(synonyms.iter().map(String::as_str));
    for form in forms {
        let form = form.to_lowercase();
        if !form.is_empty() && question.contains(&form) {
            return 1.0;
        }
    }
    let words: Vec<String> = name
        .to_lowercase()
        .split('_')
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| question.contains(w.as_str())).count();
    hits as f32 / words.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::vector_store::HashingEmbedder;
    use serde_json::json;

    async fn fixture() -> (SemanticSchema, EntityIndex, HashingEmbedder) {
        let mut measures = vec![json!({"name": "total_revenue", "sql": "SUM(total_amount)", "title": "总收入"})];
        for i in 0..30 {
            measures.push(json!({"name": format!("metric_{}", i), "sql": format!("SUM(col_{})", i)}));
        }
        let orders: Cube = serde_json::from_value(json!({
            "name": "Orders",
            "sql_table": "orders",
            "measures": measures,
            "dimensions": [{"name": "status", "sql": "${CUBE}.status", "title": "订单状态"}],
            "joins": [{"name": "Customers", "sql": "${CUBE}.customer_id = ${Customers}.id", "relationship": "many_to_one"}]
        }))
        .unwrap();
        let customers: Cube = serde_json::from_value(json!({
            "name": "Customers",
            "dimensions": [{"name": "city", "sql": "${CUBE}.city", "title": "城市"}]
        }))
        .unwrap();
        let schema = SemanticSchema::new(vec![orders, customers]).unwrap();
        let embedder = HashingEmbedder::default();
        let index = EntityIndex::build(&schema, &embedder).await.unwrap();
        (schema, index, embedder)
    }

    #[tokio::test]
    async fn test_prune_keeps_relevant_and_caps() {
        let (schema, index, embedder) = fixture().await;
        let q = "各城市的总收入";
        let config = PruningConfig {
            max_measures: 3,
            ..PruningConfig::default()
        };
        let pruned = prune(&schema, q, &embedder.embed_sync(q), &index, &ForcedMembers::default(), &config);

        assert!(pruned.has_measure("Orders", "total_revenue"));
        let measure_total: usize = pruned.cubes.iter().map(|c| c.measures.len()).sum();
        assert!(measure_total <= 3);
        assert!(pruned.cube("Customers").is_some());
        assert!(pruned.contains_identifier("total_amount"));
        assert!(pruned.contains_identifier("customers.city"));
        assert!(!pruned.contains_identifier("department_id"));
    }

    #[tokio::test]
    async fn test_forced_measure_survives_low_score() {
        let (schema, index, embedder) = fixture().await;
        let q = "unrelated question";
        let forced = ForcedMembers {
            measures: vec![("Orders".to_string(), "metric_17".to_string())],
            ..ForcedMembers::default()
        };
        let config = PruningConfig {
            min_similarity: 0.99,
            ..PruningConfig::default()
        };
        let pruned = prune(&schema, q, &embedder.embed_sync(q), &index, &forced, &config);
        assert!(pruned.has_measure("Orders", "metric_17"));
        assert_eq!(pruned.cubes.len(), 1);
        assert!(pruned.render().contains("measure metric_17: SUM(col_17)"));
    }

    #[tokio::test]
    async fn test_forced_column_keeps_members_reading_it() {
        let (schema, index, embedder) = fixture().await;
        let q = "metric";
        let forced = ForcedMembers {
            cubes: vec!["Orders".to_string()],
            columns: vec![("Orders".to_string(), "total_amount".to_string())],
            ..ForcedMembers::default()
        };
        let config = PruningConfig {
            max_measures: 2,
            ..PruningConfig::default()
        };
        let pruned = prune(&schema, q, &embedder.embed_sync(q), &index, &forced, &config);
        assert!(pruned.has_measure("Orders", "total_revenue"));
        assert!(pruned.contains_identifier("total_amount"));
        assert!(!pruned.has_measure("Customers", "total_revenue"));
    }
}
