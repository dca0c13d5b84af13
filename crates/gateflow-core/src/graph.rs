//! リソース依存グラフ
//!
//! 属性の参照と明示的な depends_on から有向非巡回グラフを構築し、
//! 作成順・削除順・並列実行可能なレイヤー・変更の影響範囲を計算します。
//!
//! 辺の向きは「A が B に依存する」= A -> B です。B は A より先に作成され、
//! A より後に削除されます。

use crate::error::{FlowError, Result};
use crate::model::{Dependencies, OutputSpec, ResourceDescriptor};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// 依存関係マップ（名前 -> 依存先の集合）
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// 検証済みのリソースグラフ
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceDescriptor>,
    dependencies: DependencyMap,
    dependents: DependencyMap,
    order: Vec<String>,
}

impl ResourceGraph {
    /// 記述子の集合からグラフを構築
    ///
    /// 名前の重複、存在しないリソースへの参照、循環依存はエラーになります。
    pub fn build(descriptors: impl IntoIterator<Item = ResourceDescriptor>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for descriptor in descriptors {
            if nodes.contains_key(&descriptor.name) {
                return Err(FlowError::DuplicateResource(descriptor.name));
            }
            nodes.insert(descriptor.name.clone(), descriptor);
        }

        let mut dependencies = DependencyMap::new();
        let mut dependents: DependencyMap =
            nodes.keys().map(|name| (name.clone(), BTreeSet::new())).collect();

        for (name, descriptor) in &nodes {
            let deps = descriptor.dependencies();
            for dep in &deps {
                if !nodes.contains_key(dep) {
                    return Err(FlowError::UnknownReference {
                        from: name.clone(),
                        to: dep.clone(),
                    });
                }
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(name.clone());
                }
            }
            dependencies.insert(name.clone(), deps);
        }

        let order = topological_sort(&dependencies)?;
        debug!(resources = order.len(), "Resource graph built");

        Ok(Self {
            nodes,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 作成順に記述子を列挙
    pub fn descriptors(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.order.iter().filter_map(|name| self.nodes.get(name))
    }

    /// 直接の依存先
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.dependencies.get(name).cloned().unwrap_or_default()
    }

    /// 直接の被依存（このリソースを参照しているリソース）
    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.dependents.get(name).cloned().unwrap_or_default()
    }

    pub fn dependency_map(&self) -> &DependencyMap {
        &self.dependencies
    }

    /// 作成順（全ての依存先が先に来る）
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// 削除順（作成順の逆）
    pub fn destroy_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// 並列実行可能なレイヤー
    ///
    /// 同じレイヤー内のリソース同士には依存関係がありません。
    pub fn layers(&self) -> Vec<Vec<String>> {
        layers(&self.dependencies, &self.order)
    }

    /// 推移的な被依存リソース
    ///
    /// 起点自身は、他の起点から到達できる場合にのみ含まれます。
    pub fn transitive_dependents<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        let roots: Vec<&str> = roots.into_iter().collect();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = roots.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        seen
    }

    /// 変更の影響範囲（変更されたリソース + その推移的な被依存）
    pub fn affected_subgraph(&self, changed: &BTreeSet<String>) -> BTreeSet<String> {
        let mut affected: BTreeSet<String> = changed
            .iter()
            .filter(|name| self.nodes.contains_key(*name))
            .cloned()
            .collect();
        let roots: Vec<String> = affected.iter().cloned().collect();
        affected.extend(self.transitive_dependents(roots.iter().map(String::as_str)));
        affected
    }

    /// 出力が存在するリソースだけを参照しているか検証
    pub fn validate_outputs(&self, outputs: &[OutputSpec]) -> Result<()> {
        for output in outputs {
            for dep in output.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(FlowError::UnknownReference {
                        from: format!("output {}", output.name),
                        to: dep,
                    });
                }
            }
        }
        Ok(())
    }
}

/// 依存関係マップをトポロジカルソート（Kahn法）
///
/// 同順位は名前順で決定的に並びます。マップに存在しない依存先は無視します。
/// 循環がある場合は、循環に関わる辺の集合を報告します。
pub fn topological_sort(dependencies: &DependencyMap) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (name, deps) in dependencies {
        let known = deps
            .iter()
            .filter(|d| dependencies.contains_key(*d));
        let mut count = 0;
        for dep in known {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
            count += 1;
        }
        in_degree.insert(name.as_str(), count);
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(current) = ready.pop_first() {
        order.push(current.to_string());
        if let Some(children) = dependents.get(current) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if order.len() < dependencies.len() {
        let done: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let edges = cycle_edges(dependencies, &done);
        return Err(FlowError::CircularDependency { edges });
    }

    Ok(order)
}

/// 逆順（被依存が先）のトポロジカルソート
pub fn reverse_topological_sort(dependencies: &DependencyMap) -> Result<Vec<String>> {
    let mut order = topological_sort(dependencies)?;
    order.reverse();
    Ok(order)
}

/// 作成順から並列実行レイヤーを計算
pub fn layers(dependencies: &DependencyMap, order: &[String]) -> Vec<Vec<String>> {
    let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
    let mut result: Vec<Vec<String>> = Vec::new();

    for name in order {
        let level = dependencies
            .get(name)
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| depth.get(d.as_str()))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        depth.insert(name.as_str(), level);
        if result.len() <= level {
            result.resize_with(level + 1, Vec::new);
        }
        result[level].push(name.clone());
    }

    result
}

/// 循環に関わる辺を抽出
///
/// Kahn法で処理できなかったノードから、さらに「誰からも依存されていない」ノードを
/// 繰り返し取り除くと、循環上（または循環間）のノードだけが残ります。
fn cycle_edges(dependencies: &DependencyMap, done: &BTreeSet<&str>) -> Vec<(String, String)> {
    let mut remaining: BTreeSet<&str> = dependencies
        .keys()
        .map(String::as_str)
        .filter(|name| !done.contains(name))
        .collect();

    loop {
        let sinks: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|candidate| {
                !remaining.iter().any(|other| {
                    dependencies
                        .get(*other)
                        .is_some_and(|deps| deps.contains(*candidate))
                })
            })
            .collect();
        if sinks.is_empty() {
            break;
        }
        for sink in sinks {
            remaining.remove(sink);
        }
    }

    let mut edges = Vec::new();
    for from in &remaining {
        if let Some(deps) = dependencies.get(*from) {
            for to in deps {
                if remaining.contains(to.as_str()) {
                    edges.push((from.to_string(), to.clone()));
                }
            }
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Expr, ResourceKind};

    fn node(name: &str, deps: &[&str]) -> ResourceDescriptor {
        let mut descriptor = ResourceDescriptor::new(name, ResourceKind::NotificationTopic);
        for dep in deps {
            descriptor = descriptor.with(format!("{dep}_id"), Expr::reference(*dep, "id"));
        }
        descriptor
    }

    fn assert_valid_order(graph: &ResourceGraph) {
        let order = graph.topological_order();
        let position: BTreeMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for name in order {
            for dep in graph.dependencies_of(name) {
                assert!(
                    position[dep.as_str()] < position[name.as_str()],
                    "{dep} must come before {name}"
                );
            }
        }
    }

    #[test]
    fn test_linear_chain_order() {
        // a -> b -> c（c が a に依存）
        let graph = ResourceGraph::build(vec![
            node("c", &["b"]),
            node("a", &[]),
            node("b", &["a"]),
        ])
        .unwrap();

        assert_eq!(graph.topological_order(), &["a", "b", "c"]);
        assert_eq!(graph.destroy_order(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_diamond_is_valid_topological_sort() {
        let graph = ResourceGraph::build(vec![
            node("share", &["gateway", "role"]),
            node("gateway", &["instance", "endpoint"]),
            node("instance", &["sg"]),
            node("endpoint", &["sg"]),
            node("role", &[]),
            node("sg", &[]),
        ])
        .unwrap();

        assert_valid_order(&graph);
        assert_eq!(
            graph.layers(),
            vec![
                vec!["role".to_string(), "sg".to_string()],
                vec!["endpoint".to_string(), "instance".to_string()],
                vec!["gateway".to_string()],
                vec!["share".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_reports_offending_edges_only() {
        let err = ResourceGraph::build(vec![
            node("root", &[]),
            node("a", &["root", "c"]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("downstream", &["c"]),
        ])
        .unwrap_err();

        match err {
            FlowError::CircularDependency { edges } => {
                assert_eq!(
                    edges,
                    vec![
                        ("a".to_string(), "c".to_string()),
                        ("b".to_string(), "a".to_string()),
                        ("c".to_string(), "b".to_string()),
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        // 自分自身の出力を参照するリソースは作成できない
        let err = ResourceGraph::build(vec![
            node("other", &[]),
            ResourceDescriptor::new("a", ResourceKind::Role)
                .with("self_arn", Expr::reference("a", "arn")),
        ])
        .unwrap_err();

        match err {
            FlowError::CircularDependency { edges } => {
                assert_eq!(edges, vec![("a".to_string(), "a".to_string())]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dangling_reference() {
        let err = ResourceGraph::build(vec![node("a", &["ghost"])]).unwrap_err();
        assert!(matches!(
            err,
            FlowError::UnknownReference { from, to } if from == "a" && to == "ghost"
        ));
    }

    #[test]
    fn test_explicit_depends_on_creates_edge() {
        let graph = ResourceGraph::build(vec![
            node("a", &[]),
            ResourceDescriptor::new("b", ResourceKind::Role).depends_on("a"),
        ])
        .unwrap();
        assert_eq!(graph.dependencies_of("b"), BTreeSet::from(["a".to_string()]));
        assert_eq!(graph.dependents_of("a"), BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn test_duplicate_names() {
        let err = ResourceGraph::build(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateResource(_)));
    }

    #[test]
    fn test_affected_subgraph() {
        let graph = ResourceGraph::build(vec![
            node("sg", &[]),
            node("instance", &["sg"]),
            node("volume", &["instance"]),
            node("attachment", &["instance", "volume"]),
            node("topic", &[]),
            node("policy", &["topic"]),
        ])
        .unwrap();

        let affected = graph.affected_subgraph(&BTreeSet::from(["instance".to_string()]));
        assert_eq!(
            affected,
            BTreeSet::from([
                "attachment".to_string(),
                "instance".to_string(),
                "volume".to_string(),
            ])
        );

        let affected = graph.affected_subgraph(&BTreeSet::from(["topic".to_string()]));
        assert_eq!(
            affected,
            BTreeSet::from(["policy".to_string(), "topic".to_string()])
        );

        assert!(graph.affected_subgraph(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_transitive_dependents_excludes_roots() {
        let graph = ResourceGraph::build(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
        ])
        .unwrap();
        assert_eq!(
            graph.transitive_dependents(["a"]),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
        // 起点同士に依存関係がある場合は、依存している側が残る
        assert_eq!(
            graph.transitive_dependents(["a", "b"]),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_topological_sort_ignores_unknown_dependencies() {
        let deps: DependencyMap = [
            ("a".to_string(), BTreeSet::from(["removed".to_string()])),
            ("b".to_string(), BTreeSet::from(["a".to_string()])),
        ]
        .into();
        assert_eq!(topological_sort(&deps).unwrap(), vec!["a", "b"]);
        assert_eq!(reverse_topological_sort(&deps).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_validate_outputs() {
        let graph = ResourceGraph::build(vec![node("a", &[])]).unwrap();
        assert!(graph
            .validate_outputs(&[OutputSpec::new("x", Expr::reference("a", "id"))])
            .is_ok());
        assert!(graph
            .validate_outputs(&[OutputSpec::new("y", Expr::reference("b", "id"))])
            .is_err());
    }
}
