//! Join Graph Resolution
//!
//! Cubes are nodes; each declared join is an edge usable in both
//! directions. Paths are breadth-first shortest. Join mechanics come from
//! the declarations only: a pair of cubes with no connecting path is an
//! error, never a guessed join.

use crate::error::{ChatBiError, Result};
use crate::semantic::model::{render_template, JoinType, Relationship, SemanticSchema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    to: String,
    /// Cube that declared the join; `${CUBE}` in `sql` refers to it.
    owner: String,
    sql: String,
    relationship: Relationship,
    join_type: JoinType,
}

/// One rendered join clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinClause {
    pub cube: String,
    pub table: String,
    pub alias: String,
    pub join_type: JoinType,
    pub relationship: Relationship,
    pub on: String,
}

impl JoinClause {
    pub fn to_sql(&self) -> String {
        format!(
            "{} {} AS {} ON {}",
            self.join_type.as_sql(),
            self.table,
            self.alias,
            self.on
        )
    }
}

/// Joins needed to reach every required cube from the primary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub primary: String,
    pub primary_table: String,
    pub clauses: Vec<JoinClause>,
    /// Cube name to SQL alias.
    pub aliases: BTreeMap<String, String>,
}

impl JoinPlan {
    /// `FROM <table> AS <alias> <joins...>`
    pub fn from_clause(&self) -> String {
        let mut sql = format!(
            "FROM {} AS {}",
            self.primary_table,
            self.aliases.get(&self.primary).cloned().unwrap_or_else(|| alias_for(&self.primary))
        );
        for clause in &self.clauses {
            sql.push(' ');
            sql.push_str(&clause.to_sql());
        }
        sql
    }

    /// True when some step of the plan can multiply rows of the primary cube.
    pub fn fans_out(&self) -> bool {
        self.clauses
            .iter()
            .any(|c| matches!(c.relationship, Relationship::OneToMany | Relationship::ManyToMany))
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinGraph {
    adjacency: HashMap<String, Vec<Edge>>,
    tables: HashMap<String, String>,
    /// Canonical cube name by lowercase key.
    names: HashMap<String, String>,
}

impl JoinGraph {
    pub fn from_schema(schema: &SemanticSchema) -> Self {
        let mut graph = JoinGraph::default();
        for cube in &schema.cubes {
            graph.names.insert(cube.name.to_lowercase(), cube.name.clone());
            graph.tables.insert(cube.name.clone(), cube.table().to_string());
            graph.adjacency.entry(cube.name.clone()).or_default();
        }
        for cube in &schema.cubes {
            for join in &cube.joins {
                let Some(target) = graph.names.get(&join.name.to_lowercase()).cloned() else {
                    continue;
                };
                graph.adjacency.entry(cube.name.clone()).or_default().push(Edge {
                    to: target.clone(),
                    owner: cube.name.clone(),
                    sql: join.sql.clone(),
                    relationship: join.relationship,
                    join_type: join.join_type,
                });
                graph.adjacency.entry(target).or_default().push(Edge {
                    to: cube.name.clone(),
                    owner: cube.name.clone(),
                    sql: join.sql.clone(),
                    relationship: join.relationship.inverse(),
                    join_type: join.join_type,
                });
            }
        }
        graph
    }

    fn canonical(&self, name: &str) -> Result<String> {
        self.names
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| ChatBiError::Semantic(format!("Unknown cube '{}'", name)))
    }

    /// Shortest path of edges from `from` to `to`.
    fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<Edge>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut previous: HashMap<String, (String, Edge)> = HashMap::new();
        let mut queue = VecDeque::from([from.to_string()]);
        let mut visited = vec![from.to_string()];

        while let Some(node) = queue.pop_front() {
            for edge in self.adjacency.get(&node).into_iter().flatten() {
                if visited.contains(&edge.to) {
                    continue;
                }
                visited.push(edge.to.clone());
                previous.insert(edge.to.clone(), (node.clone(), edge.clone()));
                if edge.to == to {
                    let mut path = Vec::new();
                    let mut cursor = to.to_string();
                    while let Some((prev, edge)) = previous.get(&cursor) {
                        path.push(edge.clone());
                        cursor = prev.clone();
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(edge.to.clone());
            }
        }
        None
    }

    /// Join every cube in `required` onto `primary`, sharing path prefixes.
    pub fn resolve(&self, primary: &str, required: &[String]) -> Result<JoinPlan> {
        let primary = self.canonical(primary)?;
        let mut aliases = BTreeMap::new();
        aliases.insert(primary.clone(), alias_for(&primary));

        let mut path_edges: Vec<Edge> = Vec::new();
        for target in required {
            let target = self.canonical(target)?;
            let path = self.shortest_path(&primary, &target).ok_or_else(|| {
                ChatBiError::JoinPathNotFound {
                    from: primary.clone(),
                    to: target.clone(),
                }
            })?;
            for edge in path {
                if !aliases.contains_key(&edge.to) {
                    aliases.insert(edge.to.clone(), alias_for(&edge.to));
                    path_edges.push(edge);
                }
            }
        }

        let clauses = path_edges
            .into_iter()
            .map(|edge| {
                let owner_alias = aliases.get(&edge.owner).cloned().unwrap_or_else(|| alias_for(&edge.owner));
                let on = render_template(&edge.sql, &owner_alias, |name| {
                    self.names
                        .get(&name.to_lowercase())
                        .and_then(|canonical| aliases.get(canonical))
                        .cloned()
                });
                JoinClause {
                    table: self.tables.get(&edge.to).cloned().unwrap_or_else(|| edge.to.clone()),
                    alias: aliases.get(&edge.to).cloned().unwrap_or_else(|| alias_for(&edge.to)),
                    cube: edge.to,
                    join_type: edge.join_type,
                    relationship: edge.relationship,
                    on,
                }
            })
            .collect();

        Ok(JoinPlan {
            primary_table: self.tables.get(&primary).cloned().unwrap_or_else(|| primary.clone()),
            primary,
            clauses,
            aliases,
        })
    }
}

/// `OrderItems` -> `order_items`.
fn alias_for(cube: &str) -> String {
    let mut out = String::new();
    for (i, c) in cube.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c.is_alphanumeric() || c == '_' {
            out.push(c);
        }
    }
    if out.is_empty() {
        "t".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::model::Cube;
    use serde_json::json;

    fn schema() -> SemanticSchema {
        let cubes: Vec<Cube> = serde_json::from_value(json!([
            {"name": "Orders", "sql_table": "orders", "joins": [
                {"name": "Customers", "sql": "${CUBE}.customer_id = ${Customers}.id", "relationship": "many_to_one"},
                {"name": "OrderItems", "sql": "${CUBE}.id = ${OrderItems}.order_id", "relationship": "one_to_many", "join_type": "INNER"}
            ]},
            {"name": "Customers", "sql_table": "customers", "joins": [
                {"name": "Regions", "sql": "${CUBE}.region_id = ${Regions}.id", "relationship": "many_to_one"}
            ]},
            {"name": "Regions", "sql_table": "regions"},
            {"name": "OrderItems", "sql_table": "order_items"},
            {"name": "Suppliers", "sql_table": "suppliers"}
        ]))
        .unwrap();
        SemanticSchema::new(cubes).unwrap()
    }

    #[test]
    fn test_two_hop_path_with_aliases() {
        let graph = JoinGraph::from_schema(&schema());
        let plan = graph.resolve("Orders", &["Regions".to_string()]).unwrap();
        assert_eq!(plan.clauses.len(), 2);
        assert_eq!(
            plan.from_clause(),
            "FROM orders AS orders \
             LEFT JOIN customers AS customers ON orders.customer_id = customers.id \
             LEFT JOIN regions AS regions ON customers.region_id = regions.id"
        );
        assert!(!plan.fans_out());
    }

    #[test]
    fn test_reverse_edge_uses_owner_alias() {
        let graph = JoinGraph::from_schema(&schema());
        let plan = graph.resolve("regions", &["Orders".to_string()]).unwrap();
        assert_eq!(plan.primary, "Regions");
        assert_eq!(plan.clauses[0].on, "customers.region_id = regions.id");
        assert_eq!(plan.clauses[1].on, "orders.customer_id = customers.id");
        assert!(plan.fans_out());
    }

    #[test]
    fn test_shared_prefix_is_joined_once() {
        let graph = JoinGraph::from_schema(&schema());
        let plan = graph
            .resolve("Orders", &["Customers".to_string(), "Regions".to_string(), "OrderItems".to_string()])
            .unwrap();
        assert_eq!(plan.clauses.len(), 3);
        assert_eq!(plan.aliases["OrderItems"], "order_items");
        assert_eq!(plan.clauses[2].join_type, JoinType::Inner);
    }

    #[test]
    fn test_disconnected_cubes_fail_explicitly() {
        let graph = JoinGraph::from_schema(&schema());
        let err = graph.resolve("Orders", &["Suppliers".to_string()]).unwrap_err();
        match err {
            ChatBiError::JoinPathNotFound { from, to } => {
                assert_eq!(from, "Orders");
                assert_eq!(to, "Suppliers");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(graph.resolve("Orders", &["Nope".to_string()]).is_err());
    }
}
