//! gateflow core
//!
//! gate.kdl の読み込み、変数の解決、組み込みトポロジーの展開、
//! リソース依存グラフの構築を行います。
//!
//! ```text
//! gate.kdl ──parse──▶ Project ──resolve──▶ ResolvedVariables
//!                                             │
//!                          topology + custom resources
//!                                             ▼
//!                                       ResourceGraph ──▶ gateflow-cloud
//! ```

pub mod discovery;
pub mod error;
pub mod graph;
pub mod loader;
pub mod model;
pub mod network;
pub mod parser;
pub mod template;
pub mod topology;
pub mod variables;

// Re-exports
pub use discovery::{DiscoveredFiles, discover_files, find_project_root};
pub use error::{FlowError, Result};
pub use graph::{
    DependencyMap, ResourceGraph, layers, reverse_topological_sort, topological_sort,
};
pub use loader::{LoadedProject, load_project, load_project_from_root};
pub use model::*;
pub use network::{IngressPolicy, IngressRule, Protocol};
pub use parser::{parse_kdl_file, parse_kdl_string};
pub use template::TemplateProcessor;
pub use topology::{FILE_GATEWAY, Topology, build_topology, builtin_variables};
pub use variables::{ENV_PREFIX, ResolvedVariables, VariableSources, parse_assignment, resolve_variables};
