//! Semantic Resolver
//!
//! Composes, in order: glossary lookup, entity linking, schema pruning and
//! join resolution. Declared glossary mappings win over inferred similarity
//! wherever the two disagree.

use crate::config::PruningConfig;
use crate::error::Result;
use crate::semantic::entity_linker::{EntityLink, EntityLinker};
use crate::semantic::glossary::{BusinessGlossary, GlossaryMatch, MappingType};
use crate::semantic::join_graph::{JoinGraph, JoinPlan};
use crate::semantic::model::{column_references, same_expression, SemanticSchema};
use crate::semantic::pruning::{prune, ForcedMembers, PrunedSchema};
use crate::semantic::time::{DateRange, RelativeTime};
use crate::semantic::vector_store::{Embedder, EntityIndex};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMeasure {
    pub cube: String,
    /// Declared measure name, when the mapping points at one.
    pub name: Option<String>,
    pub sql: String,
    pub from_glossary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFilter {
    pub cube: String,
    pub dimension: String,
    pub value: String,
    pub from_glossary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTime {
    pub expression: RelativeTime,
    pub range: DateRange,
}

/// Everything the planner and generator get to know about the question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticContext {
    pub question: String,
    pub glossary_matches: Vec<GlossaryMatch>,
    pub measures: Vec<ResolvedMeasure>,
    pub filters: Vec<ResolvedFilter>,
    pub group_by: Vec<(String, String)>,
    pub time: Option<ResolvedTime>,
    pub entity_links: Vec<EntityLink>,
    pub pruned: PrunedSchema,
    pub joins: Option<JoinPlan>,
}

impl SemanticContext {
    /// Cube of the first resolved measure, filter or pruned cube.
    pub fn primary_cube(&self) -> Option<&str> {
        self.measures
            .first()
            .map(|m| m.cube.as_str())
            .or_else(|| self.filters.first().map(|f| f.cube.as_str()))
            .or_else(|| self.group_by.first().map(|(c, _)| c.as_str()))
            .or_else(|| self.pruned.cubes.first().map(|c| c.name.as_str()))
    }

    /// How much of the question the declared vocabulary explains, in [0, 1].
    /// Used as plan confidence when the model does not report one.
    pub fn coverage(&self) -> f64 {
        let mut score: f64 = 0.3;
        if !self.measures.is_empty() {
            score += 0.3;
        }
        if !self.glossary_matches.is_empty() {
            score += 0.2;
        }
        if !self.filters.is_empty() || self.time.is_some() || !self.group_by.is_empty() {
            score += 0.1;
        }
        if !self.pruned.is_empty() {
            score += 0.1;
        }
        score.min(1.0)
    }

    /// Text block for prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.measures.is_empty() {
            out.push_str("Resolved measures:\n");
            for m in &self.measures {
                let _ = writeln!(out, "  {} on cube {}", m.sql, m.cube);
            }
        }
        if !self.filters.is_empty() {
            out.push_str("Resolved filters:\n");
            for f in &self.filters {
                let _ = writeln!(out, "  {}.{} = '{}'", f.cube, f.dimension, f.value);
            }
        }
        if !self.group_by.is_empty() {
            out.push_str("Group by:\n");
            for (cube, dim) in &self.group_by {
                let _ = writeln!(out, "  {}.{}", cube, dim);
            }
        }
        if let Some(time) = &self.time {
            let _ = writeln!(
                out,
                "Time range: {:?} = [{}, {})",
                time.expression, time.range.start, time.range.end
            );
        }
        let hints: Vec<&EntityLink> = self.entity_links.iter().filter(|l| l.span.is_none()).collect();
        if !hints.is_empty() {
            out.push_str("Possibly related values:\n");
            for l in hints {
                let _ = writeln!(out, "  {}.{} = '{}' (score {:.2})", l.cube, l.dimension, l.value, l.score);
            }
        }
        if let Some(joins) = &self.joins {
            let _ = writeln!(out, "Join path: {}", joins.from_clause());
        }
        out.push_str("Schema:\n");
        out.push_str(&self.pruned.render());
        out
    }
}

/// Per-tenant resolver over one schema snapshot.
pub struct SemanticResolver {
    schema: Arc<SemanticSchema>,
    graph: JoinGraph,
    index: EntityIndex,
    embedder: Arc<dyn Embedder>,
    linker: EntityLinker,
    pruning: PruningConfig,
}

impl SemanticResolver {
    pub async fn build(
        schema: Arc<SemanticSchema>,
        embedder: Arc<dyn Embedder>,
        pruning: PruningConfig,
    ) -> Result<Self> {
        let index = EntityIndex::build(&schema, embedder.as_ref()).await?;
        let graph = JoinGraph::from_schema(&schema);
        Ok(Self {
            schema,
            graph,
            index,
            embedder,
            linker: EntityLinker::default(),
            pruning,
        })
    }

    pub fn schema(&self) -> &SemanticSchema {
        &self.schema
    }

    pub fn join_graph(&self) -> &JoinGraph {
        &self.graph
    }

    pub async fn resolve(
        &self,
        glossary: &BusinessGlossary,
        question: &str,
        today: NaiveDate,
    ) -> Result<SemanticContext> {
        let mut ctx = SemanticContext {
            question: question.to_string(),
            ..SemanticContext::default()
        };

        // 1. Glossary.
        let matches = glossary.lookup(question);
        for m in &matches {
            self.apply_glossary_match(m, today, &mut ctx);
        }
        ctx.glossary_matches = matches;
        if ctx.time.is_none() {
            ctx.time = RelativeTime::detect(question).map(|expression| ResolvedTime {
                expression,
                range: expression.resolve(today),
            });
        }

        // 2. Entity linking, glossary first.
        let question_vec = self.embedder.embed(question).await?;
        let links = self.linker.link(question, &question_vec, &self.schema, &self.index)?;
        ctx.entity_links = links
            .into_iter()
            .filter(|link| !conflicts_with_glossary(link, &ctx.glossary_matches, &ctx.filters))
            .collect();
        for link in ctx.entity_links.iter().filter(|l| l.span.is_some()) {
            let duplicate = ctx
                .filters
                .iter()
                .any(|f| f.cube == link.cube && f.dimension == link.dimension);
            if !duplicate {
                ctx.filters.push(ResolvedFilter {
                    cube: link.cube.clone(),
                    dimension: link.dimension.clone(),
                    value: link.value.clone(),
                    from_glossary: false,
                });
            }
        }

        // 3. Pruning with glossary members forced in.
        let forced = ForcedMembers {
            measures: ctx
                .measures
                .iter()
                .filter_map(|m| m.name.as_ref().map(|n| (m.cube.clone(), n.clone())))
                .collect(),
            dimensions: ctx
                .filters
                .iter()
                .map(|f| (f.cube.clone(), f.dimension.clone()))
                .chain(ctx.group_by.iter().cloned())
                .collect(),
            cubes: ctx.measures.iter().map(|m| m.cube.clone()).collect(),
            // Raw expressions with no declared measure keep their columns.
            columns: ctx
                .measures
                .iter()
                .filter(|m| m.name.is_none())
                .flat_map(|m| column_references(&m.sql).into_iter().map(move |c| (m.cube.clone(), c)))
                .collect(),
        };
        ctx.pruned = prune(
            &self.schema,
            question,
            &question_vec,
            &self.index,
            &forced,
            &self.pruning,
        );

        // 4. Joins.
        if let Some(primary) = ctx.primary_cube().map(str::to_string) {
            let mut required: Vec<String> = Vec::new();
            let referenced = ctx
                .measures
                .iter()
                .map(|m| m.cube.as_str())
                .chain(ctx.filters.iter().map(|f| f.cube.as_str()))
                .chain(ctx.group_by.iter().map(|(c, _)| c.as_str()));
            for cube in referenced {
                if !cube.eq_ignore_ascii_case(&primary) && !required.iter().any(|r| r.eq_ignore_ascii_case(cube)) {
                    required.push(cube.to_string());
                }
            }
            ctx.joins = Some(self.graph.resolve(&primary, &required)?);
        }

        debug!(
            measures = ctx.measures.len(),
            filters = ctx.filters.len(),
            cubes = ctx.pruned.cubes.len(),
            "Semantic resolution complete"
        );
        Ok(ctx)
    }

    fn apply_glossary_match(&self, m: &GlossaryMatch, today: NaiveDate, ctx: &mut SemanticContext) {
        let entry = &m.entry;
        match entry.mapping_type {
            MappingType::Measure => {
                if let Some((cube, measure)) = self.schema.qualified_measure(&entry.target_value) {
                    ctx.measures.push(ResolvedMeasure {
                        cube: cube.name.clone(),
                        name: Some(measure.name.clone()),
                        sql: measure.sql.clone(),
                        from_glossary: true,
                    });
                } else if let Some(cube) = entry.metadata_str("cube").and_then(|c| self.schema.cube(c)) {
                    let declared = entry
                        .metadata_str("measure")
                        .and_then(|n| cube.measure(n))
                        .or_else(|| cube.measures.iter().find(|m| same_expression(&m.sql, &entry.target_value)));
                    ctx.measures.push(ResolvedMeasure {
                        cube: cube.name.clone(),
                        name: declared
                            .map(|m| m.name.clone())
                            .or_else(|| entry.metadata_str("measure").map(str::to_string)),
                        sql: entry.target_value.clone(),
                        from_glossary: true,
                    });
                } else {
                    warn!("Glossary entry {} maps to unknown measure '{}'", entry.id, entry.target_value);
                }
            }
            MappingType::Dimension => match self.schema.qualified_dimension(&entry.target_value) {
                Some((cube, dim)) => ctx.group_by.push((cube.name.clone(), dim.name.clone())),
                None => warn!("Glossary entry {} maps to unknown dimension '{}'", entry.id, entry.target_value),
            },
            MappingType::DimensionValue => {
                let target = entry
                    .metadata_str("cube")
                    .zip(entry.metadata_str("dimension"))
                    .and_then(|(c, d)| self.schema.cube(c).and_then(|cube| cube.dimension(d).map(|dim| (cube, dim))));
                match target {
                    Some((cube, dim)) => ctx.filters.push(ResolvedFilter {
                        cube: cube.name.clone(),
                        dimension: dim.name.clone(),
                        value: entry.target_value.clone(),
                        from_glossary: true,
                    }),
                    None => warn!("Glossary entry {} has no valid cube/dimension metadata", entry.id),
                }
            }
            MappingType::TimeRange => match RelativeTime::parse(&entry.target_value) {
                Some(expression) if ctx.time.is_none() => {
                    ctx.time = Some(ResolvedTime {
                        expression,
                        range: expression.resolve(today),
                    })
                }
                Some(_) => {}
                None => warn!("Glossary entry {} has unknown time expression '{}'", entry.id, entry.target_value),
            },
            MappingType::Other => debug!("Glossary entry {} has an unhandled mapping type", entry.id),
        }
    }
}

/// A link loses to the glossary when it covers the same text with another
/// target, or assigns another value to a dimension the glossary already
/// filtered.
fn conflicts_with_glossary(link: &EntityLink, matches: &[GlossaryMatch], filters: &[ResolvedFilter]) -> bool {
    if let Some(span) = link.span {
        let overlapping_other = matches.iter().any(|m| {
            m.span.overlaps(&span)
                && !(m.entry.mapping_type == MappingType::DimensionValue
                    && m.entry.target_value == link.value
                    && m.entry.metadata_str("dimension") == Some(link.dimension.as_str()))
        });
        if overlapping_other {
            debug!("Dropping entity link {} = {}: glossary covers the span", link.target(), link.value);
            return true;
        }
    }
    filters.iter().any(|f| {
        f.from_glossary
            && f.cube.eq_ignore_ascii_case(&link.cube)
            && f.dimension.eq_ignore_ascii_case(&link.dimension)
            && f.value != link.value
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::model::Cube;
    use crate::semantic::vector_store::HashingEmbedder;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()
    }

    async fn resolver() -> SemanticResolver {
        let cubes: Vec<Cube> = serde_json::from_value(json!([
            {"name": "Orders", "sql_table": "orders",
             "measures": [{"name": "total_revenue", "sql": "SUM(total_amount)"},
                          {"name": "order_count", "sql": "COUNT(*)", "title": "订单数"}],
             "dimensions": [{"name": "created_at", "sql": "${CUBE}.created_at", "type": "time"}],
             "joins": [{"name": "Stores", "sql": "${CUBE}.store_id = ${Stores}.id", "relationship": "many_to_one"}]},
            {"name": "Stores", "sql_table": "stores",
             "dimensions": [{"name": "city", "sql": "${CUBE}.city", "title": "城市",
                             "values": [{"value": "北京"}, {"value": "上海"}, {"value": "南京"}]}]},
            {"name": "Employees", "sql_table": "employees",
             "dimensions": [{"name": "department", "sql": "${CUBE}.department"}]}
        ]))
        .unwrap();
        let schema = Arc::new(SemanticSchema::new(cubes).unwrap());
        SemanticResolver::build(schema, Arc::new(HashingEmbedder::default()), PruningConfig::default())
            .await
            .unwrap()
    }

    fn glossary() -> BusinessGlossary {
        serde_json::from_value(json!({"entries": [
            {"id": "rev", "term": "总收入", "mapping_type": "measure",
             "target_value": "SUM(total_amount)", "metadata": {"cube": "Orders"}},
            {"id": "sh", "term": "魔都", "mapping_type": "value", "target_value": "上海",
             "metadata": {"cube": "Stores", "dimension": "city"}},
            {"id": "bj", "term": "北京", "mapping_type": "value", "target_value": "南京",
             "metadata": {"cube": "Stores", "dimension": "city"}}
        ]}))
        .unwrap()
    }

    #[tokio::test]
    async fn test_total_revenue_resolves_to_orders_measure() {
        let ctx = resolver().await.resolve(&glossary(), "总收入", today()).await.unwrap();
        assert_eq!(ctx.measures.len(), 1);
        assert_eq!(ctx.measures[0].cube, "Orders");
        assert_eq!(ctx.measures[0].sql, "SUM(total_amount)");
        assert!(ctx.coverage() >= 0.6);
        assert!(ctx.pruned.cube("Orders").is_some());
    }

    #[tokio::test]
    async fn test_qualified_measure_reference() {
        let glossary: BusinessGlossary = serde_json::from_value(json!({"entries": [
            {"id": "rev", "term": "总收入", "mapping_type": "measure", "target_value": "Orders.total_revenue"}
        ]}))
        .unwrap();
        let ctx = resolver().await.resolve(&glossary, "总收入是多少", today()).await.unwrap();
        assert_eq!(ctx.measures[0].name.as_deref(), Some("total_revenue"));
        assert_eq!(ctx.measures[0].sql, "SUM(total_amount)");
    }

    #[tokio::test]
    async fn test_glossary_beats_entity_link_on_same_span() {
        // The glossary maps the literal "北京" to another value on purpose.
        let ctx = resolver().await.resolve(&glossary(), "北京的总收入", today()).await.unwrap();
        let city: Vec<&ResolvedFilter> = ctx.filters.iter().filter(|f| f.dimension == "city").collect();
        assert_eq!(city.len(), 1);
        assert_eq!(city[0].value, "南京");
        assert!(city[0].from_glossary);
        assert!(ctx.entity_links.iter().all(|l| l.value != "北京"));

        let joins = ctx.joins.unwrap();
        assert_eq!(joins.primary, "Orders");
        assert_eq!(joins.clauses[0].cube, "Stores");
    }

    #[tokio::test]
    async fn test_entity_link_becomes_filter_and_time_detected() {
        let ctx = resolver().await.resolve(&glossary(), "上海上个月的订单数", today()).await.unwrap();
        assert!(ctx.filters.iter().any(|f| f.value == "上海" && !f.from_glossary));
        let time = ctx.time.unwrap();
        assert_eq!(time.expression, RelativeTime::LastMonth);
        assert_eq!(time.range.start, NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
    }

    #[tokio::test]
    async fn test_unconnected_cubes_fail() {
        let glossary: BusinessGlossary = serde_json::from_value(json!({"entries": [
            {"id": "rev", "term": "总收入", "mapping_type": "measure", "target_value": "Orders.total_revenue"},
            {"id": "dept", "term": "销售部", "mapping_type": "value", "target_value": "销售部",
             "metadata": {"cube": "Employees", "dimension": "department"}}
        ]}))
        .unwrap();
        let err = resolver()
            .await
            .resolve(&glossary, "销售部总收入", today())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::ChatBiError::JoinPathNotFound { .. }));
    }

    async fn crowded_resolver() -> SemanticResolver {
        let mut measures = vec![json!({"name": "total_revenue", "sql": "SUM(${CUBE}.total_amount)"})];
        for i in 0..30 {
            measures.push(json!({"name": format!("revenue_metric_{}", i), "sql": format!("SUM(col_{})", i)}));
        }
        let cubes: Vec<Cube> =
            serde_json::from_value(json!([{"name": "Orders", "sql_table": "orders", "measures": measures}])).unwrap();
        let pruning = PruningConfig {
            max_measures: 2,
            ..PruningConfig::default()
        };
        SemanticResolver::build(
            Arc::new(SemanticSchema::new(cubes).unwrap()),
            Arc::new(HashingEmbedder::default()),
            pruning,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_raw_sql_measure_matches_declared_measure() {
        let ctx = crowded_resolver()
            .await
            .resolve(&glossary(), "revenue 总收入", today())
            .await
            .unwrap();
        assert_eq!(ctx.measures[0].name.as_deref(), Some("total_revenue"));
        assert!(ctx.pruned.has_measure("Orders", "total_revenue"));
        assert!(ctx.pruned.contains_identifier("total_amount"));
    }

    #[tokio::test]
    async fn test_undeclared_raw_sql_measure_keeps_its_columns() {
        let glossary: BusinessGlossary = serde_json::from_value(json!({"entries": [
            {"id": "avg", "term": "客单价", "mapping_type": "measure",
             "target_value": "AVG(total_amount)", "metadata": {"cube": "Orders"}}
        ]}))
        .unwrap();
        let ctx = crowded_resolver()
            .await
            .resolve(&glossary, "revenue 客单价", today())
            .await
            .unwrap();
        assert_eq!(ctx.measures[0].name, None);
        assert!(ctx.pruned.contains_identifier("total_amount"));
    }
}
