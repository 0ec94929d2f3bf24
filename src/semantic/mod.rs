//! Semantic Layer
//!
//! Maps business vocabulary and entity mentions onto the declared schema:
//! glossary lookup, entity linking, schema pruning and join resolution.

pub mod catalog;
pub mod entity_linker;
pub mod glossary;
pub mod join_graph;
pub mod loader;
pub mod model;
pub mod pruning;
pub mod resolver;
pub mod time;
pub mod vector_store;

pub use catalog::{SemanticCatalog, SemanticSnapshot};
pub use glossary::{BusinessGlossary, GlossaryEntry, GlossaryMatch, GlossaryStore, MappingType};
pub use join_graph::{JoinGraph, JoinPlan};
pub use model::{Cube, Dimension, Join, JoinType, Measure, Relationship, SemanticSchema};
pub use pruning::PrunedSchema;
pub use resolver::{SemanticContext, SemanticResolver};
pub use vector_store::{Embedder, HashingEmbedder};
