//! Semantic Model
//!
//! Cubes, measures, dimensions and joins as declared in per-cube schema
//! documents. SQL templates reference the owning cube as `${CUBE}` and other
//! cubes by name, e.g. `${CUBE}.customer_id = ${Customers}.id`.

use crate::error::{ChatBiError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern");
    static ref IDENT_RE: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier pattern");
}

/// Declared cardinality of a join, read from the owning cube's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    #[serde(alias = "one-to-many", alias = "hasMany", alias = "1:n")]
    OneToMany,
    #[serde(alias = "many-to-one", alias = "belongsTo", alias = "n:1")]
    ManyToOne,
    #[serde(alias = "many-to-many", alias = "n:n")]
    ManyToMany,
}

impl Relationship {
    /// The same relationship seen from the other cube.
    pub fn inverse(&self) -> Self {
        match self {
            Relationship::OneToMany => Relationship::ManyToOne,
            Relationship::ManyToOne => Relationship::OneToMany,
            Relationship::ManyToMany => Relationship::ManyToMany,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JoinType {
    #[default]
    #[serde(alias = "left")]
    Left,
    #[serde(alias = "inner")]
    Inner,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Left => "LEFT JOIN",
            JoinType::Inner => "INNER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub sql: String,
    #[serde(rename = "type", default)]
    pub agg_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// One known value of a dimension. `parent` names the value of the parent
/// dimension it rolls up into (a product model into its category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionValue {
    pub value: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub sql: String,
    #[serde(rename = "type", default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    /// Dimension on the same cube one level up the hierarchy.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub values: Vec<DimensionValue>,
    #[serde(default)]
    pub metadata: Value,
}

/// Join declared on a cube. `name` is the target cube.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub name: String,
    pub sql: String,
    pub relationship: Relationship,
    #[serde(default)]
    pub join_type: JoinType,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cube {
    pub name: String,
    /// Physical table; defaults to the cube name.
    #[serde(default, alias = "table")]
    pub sql_table: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default)]
    pub metadata: Value,
}

impl Cube {
    pub fn table(&self) -> &str {
        self.sql_table.as_deref().unwrap_or(&self.name)
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

/// The full declared schema of one tenant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticSchema {
    pub cubes: Vec<Cube>,
}

impl SemanticSchema {
    pub fn new(cubes: Vec<Cube>) -> Result<Self> {
        let schema = Self { cubes };
        schema.validate()?;
        Ok(schema)
    }

    pub fn cube(&self, name: &str) -> Option<&Cube> {
        self.cubes.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look up `Cube.measure`.
    pub fn qualified_measure(&self, reference: &str) -> Option<(&Cube, &Measure)> {
        let (cube, member) = reference.split_once('.')?;
        let cube = self.cube(cube)?;
        cube.measure(member).map(|m| (cube, m))
    }

    /// Look up `Cube.dimension`.
    pub fn qualified_dimension(&self, reference: &str) -> Option<(&Cube, &Dimension)> {
        let (cube, member) = reference.split_once('.')?;
        let cube = self.cube(cube)?;
        cube.dimension(member).map(|d| (cube, d))
    }

    pub fn measure_count(&self) -> usize {
        self.cubes.iter().map(|c| c.measures.len()).sum()
    }

    pub fn dimension_count(&self) -> usize {
        self.cubes.iter().map(|c| c.dimensions.len()).sum()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for cube in &self.cubes {
            if !seen.insert(cube.name.to_lowercase()) {
                return Err(ChatBiError::Semantic(format!(
                    "Cube '{}' is declared more than once",
                    cube.name
                )));
            }
        }
        for cube in &self.cubes {
            for join in &cube.joins {
                if self.cube(&join.name).is_none() {
                    return Err(ChatBiError::Semantic(format!(
                        "Cube '{}' declares a join to unknown cube '{}'",
                        cube.name, join.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Cube names referenced as `${Name}` in a template, excluding `${CUBE}`.
pub fn referenced_cubes(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|name| name != "CUBE")
        .collect()
}

/// Substitute `${CUBE}` with `owner` and every other `${Name}` through
/// `alias_of`. Unknown placeholders are left in place.
pub fn render_template<F>(template: &str, owner: &str, alias_of: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            if name == "CUBE" {
                owner.to_string()
            } else {
                alias_of(name).unwrap_or_else(|| caps[0].to_string())
            }
        })
        .into_owned()
}

/// Bare identifiers used by a template, placeholders removed.
pub fn template_identifiers(template: &str) -> Vec<String> {
    let stripped = PLACEHOLDER_RE.replace_all(template, " ");
    IDENT_RE
        .find_iter(&stripped)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Column names an expression reads: identifiers that are not function
/// calls or SQL keywords.
pub fn column_references(sql: &str) -> Vec<String> {
    const KEYWORDS: &[&str] = &[
        "and", "as", "case", "distinct", "else", "end", "in", "is", "not", "null", "or", "then", "when",
    ];
    let stripped = PLACEHOLDER_RE.replace_all(sql, " ").into_owned();
    let mut out: Vec<String> = Vec::new();
    for m in IDENT_RE.find_iter(&stripped) {
        let is_call = stripped[m.end()..].trim_start().starts_with('(');
        let name = m.as_str().to_lowercase();
        if is_call || KEYWORDS.contains(&name.as_str()) || out.contains(&name) {
            continue;
        }
        out.push(name);
    }
    out
}

/// Two member expressions are the same once the `${CUBE}.` qualifier,
/// whitespace and case are ignored.
pub fn same_expression(a: &str, b: &str) -> bool {
    fn normalize(sql: &str) -> String {
        sql.replace("${CUBE}.", "")
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    }
    normalize(a) == normalize(b)
}
