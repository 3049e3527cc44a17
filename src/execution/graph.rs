// Dependency Graph
// Builds the stage/job DAG used for execution ordering and for the advisory
// schedule analysis. Levels come from Kahn's algorithm: level 0 holds every
// node with no dependencies, level k every node whose dependencies all sit
// in levels 0..k-1.

use crate::pipeline::models::{Pipeline, Stage};

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Error type for graph operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("circular dependency detected: {path}")]
    CyclicDependency { path: String },

    #[error("{dependent} depends on unknown node '{missing}'")]
    UnknownDependency { dependent: String, missing: String },

    #[error("invalid graph structure: {0}")]
    InvalidStructure(String),
}

/// A name-keyed dependency graph over stages or jobs.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    indices: HashMap<String, usize>,
    /// dependencies[i] holds the indices node i depends on
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: Vec<String>) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(nodes.len());
        for (i, name) in nodes.iter().enumerate() {
            if indices.insert(name.clone(), i).is_some() {
                return Err(GraphError::InvalidStructure(format!(
                    "duplicate node name '{}'",
                    name
                )));
            }
        }
        let dependencies = vec![Vec::new(); nodes.len()];
        Ok(Self {
            nodes,
            indices,
            dependencies,
        })
    }

    pub fn add_dependency(&mut self, node: &str, depends_on: &str) -> Result<(), GraphError> {
        let from = *self
            .indices
            .get(node)
            .ok_or_else(|| GraphError::UnknownDependency {
                dependent: node.to_string(),
                missing: node.to_string(),
            })?;
        let to = *self
            .indices
            .get(depends_on)
            .ok_or_else(|| GraphError::UnknownDependency {
                dependent: node.to_string(),
                missing: depends_on.to_string(),
            })?;
        self.dependencies[from].push(to);
        Ok(())
    }

    /// Build the stage-level graph for a pipeline.
    pub fn for_stages(pipeline: &Pipeline) -> Result<Self, GraphError> {
        let names = pipeline.stages.iter().map(|s| s.name.clone()).collect();
        let mut graph = Self::new(names)?;
        for stage in &pipeline.stages {
            for dep in &stage.dependencies {
                graph.add_dependency(&stage.name, dep)?;
            }
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Build the intra-stage job graph for a stage.
    pub fn for_jobs(stage: &Stage) -> Result<Self, GraphError> {
        let names = stage.jobs.iter().map(|j| j.name.clone()).collect();
        let mut graph = Self::new(names)?;
        for job in &stage.jobs {
            for dep in &job.dependencies {
                graph.add_dependency(&job.name, dep)?;
            }
        }
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.indices
            .get(name)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Detect cycles with DFS color marking, returning the first cycle found.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        fn visit(
            node: usize,
            graph: &DependencyGraph,
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Result<(), Vec<usize>> {
            colors[node] = Color::Grey;
            path.push(node);

            for &dep in &graph.dependencies[node] {
                match colors[dep] {
                    Color::Grey => {
                        let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Err(cycle);
                    }
                    Color::White => visit(dep, graph, colors, path)?,
                    Color::Black => {}
                }
            }

            path.pop();
            colors[node] = Color::Black;
            Ok(())
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();

        for node in 0..self.nodes.len() {
            if colors[node] == Color::White {
                if let Err(cycle) = visit(node, self, &mut colors, &mut path) {
                    let names: Vec<&str> =
                        cycle.iter().map(|&i| self.nodes[i].as_str()).collect();
                    return Err(GraphError::CyclicDependency {
                        path: names.join(" -> "),
                    });
                }
            }
        }

        Ok(())
    }

    /// Compute execution levels with Kahn's algorithm (BFS peeling of
    /// in-degree-zero nodes). The levels partition the node set; every
    /// node's level is strictly greater than the levels of its dependencies.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        // dependents[d] lists the nodes that depend on d
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (node, deps) in self.dependencies.iter().enumerate() {
            in_degree[node] = deps.len();
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut processed = 0usize;

        while !queue.is_empty() {
            let mut next = VecDeque::new();
            let mut level = Vec::with_capacity(queue.len());

            while let Some(node) = queue.pop_front() {
                level.push(self.nodes[node].clone());
                processed += 1;

                for &dependent in &dependents[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push_back(dependent);
                    }
                }
            }

            level.sort();
            levels.push(level);
            queue = next;
        }

        if processed != n {
            // Leftover nodes all sit on a cycle; name one for the message
            let stuck = (0..n)
                .find(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].clone())
                .unwrap_or_default();
            return Err(GraphError::CyclicDependency { path: stuck });
        }

        Ok(levels)
    }
}

/// Advisory schedule report computed from the stage graph.
///
/// Estimates achievable parallelism for operators and dashboards. The
/// executor derives its own dispatch order from the same levels, so the two
/// never disagree.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub pipeline_name: String,
    /// Stage names per execution level, level 0 first.
    pub levels: Vec<Vec<String>>,
    /// Stages with no dependencies at all.
    pub independent_stages: usize,
    /// Width of the widest level: the maximum achievable stage concurrency.
    pub max_parallelism: usize,
    pub total_stages: usize,
    pub total_jobs: usize,
}

/// Analyze a pipeline's stage graph and report its topological levels.
pub fn analyze(pipeline: &Pipeline) -> Result<ScheduleReport, GraphError> {
    let graph = DependencyGraph::for_stages(pipeline)?;
    let levels = graph.execution_levels()?;

    let independent_stages = pipeline
        .stages
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .count();
    let max_parallelism = levels.iter().map(|l| l.len()).max().unwrap_or(0);
    let total_jobs = pipeline.stages.iter().map(|s| s.jobs.len()).sum();

    Ok(ScheduleReport {
        pipeline_name: pipeline.name.clone(),
        levels,
        independent_stages,
        max_parallelism,
        total_stages: pipeline.stages.len(),
        total_jobs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{Job, Pipeline, Stage};

    fn stage(name: &str, deps: &[&str]) -> Stage {
        Stage::new(name, vec![Job::new("work", vec!["true".to_string()])])
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_linear_levels() {
        let pipeline = Pipeline::new(
            "p",
            vec![stage("build", &[]), stage("test", &["build"]), stage("deploy", &["test"])],
        );

        let graph = DependencyGraph::for_stages(&pipeline).unwrap();
        let levels = graph.execution_levels().unwrap();

        assert_eq!(levels, vec![
            vec!["build".to_string()],
            vec!["test".to_string()],
            vec!["deploy".to_string()],
        ]);
    }

    #[test]
    fn test_diamond_levels() {
        let pipeline = Pipeline::new(
            "p",
            vec![
                stage("build", &[]),
                stage("unit", &["build"]),
                stage("integration", &["build"]),
                stage("deploy", &["unit", "integration"]),
            ],
        );

        let graph = DependencyGraph::for_stages(&pipeline).unwrap();
        let levels = graph.execution_levels().unwrap();

        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["build".to_string()]);
        assert_eq!(levels[1], vec!["integration".to_string(), "unit".to_string()]);
        assert_eq!(levels[2], vec!["deploy".to_string()]);
    }

    #[test]
    fn test_levels_partition_all_stages() {
        let pipeline = Pipeline::new(
            "p",
            vec![
                stage("a", &[]),
                stage("b", &[]),
                stage("c", &["a", "b"]),
                stage("d", &["a"]),
                stage("e", &["c", "d"]),
            ],
        );

        let graph = DependencyGraph::for_stages(&pipeline).unwrap();
        let levels = graph.execution_levels().unwrap();

        // Union with no duplicates equals the full stage set
        let mut all: Vec<String> = levels.iter().flatten().cloned().collect();
        assert_eq!(all.len(), pipeline.stages.len());
        all.sort();
        all.dedup();
        assert_eq!(all.len(), pipeline.stages.len());

        // Every stage's level strictly exceeds the max level of its deps
        let level_of = |name: &str| {
            levels
                .iter()
                .position(|l| l.iter().any(|n| n == name))
                .unwrap()
        };
        for s in &pipeline.stages {
            for dep in &s.dependencies {
                assert!(level_of(&s.name) > level_of(dep));
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let pipeline = Pipeline::new(
            "p",
            vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"])],
        );

        let err = DependencyGraph::for_stages(&pipeline).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency { .. }));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let pipeline = Pipeline::new("p", vec![stage("a", &["ghost"])]);

        let err = DependencyGraph::for_stages(&pipeline).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                dependent: "a".to_string(),
                missing: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_analyze_report() {
        let mut build = stage("build", &[]);
        build.jobs.push(Job::new("lint", vec!["true".to_string()]));

        let pipeline = Pipeline::new(
            "release",
            vec![
                build,
                stage("docs", &[]),
                stage("unit", &["build"]),
                stage("integration", &["build"]),
                stage("deploy", &["unit", "integration"]),
            ],
        );

        let report = analyze(&pipeline).unwrap();
        assert_eq!(report.pipeline_name, "release");
        assert_eq!(report.total_stages, 5);
        assert_eq!(report.total_jobs, 6);
        assert_eq!(report.independent_stages, 2);
        // Level 1 holds unit + integration; level 0 holds build + docs
        assert_eq!(report.max_parallelism, 2);
        assert_eq!(report.levels.len(), 3);
    }

    #[test]
    fn test_job_graph_from_stage() {
        let mut s = stage("build", &[]);
        s.jobs = vec![
            Job::new("compile", vec!["true".to_string()]),
            Job::new("lint", vec!["true".to_string()]),
            Job::new("package", vec!["true".to_string()])
                .with_dependencies(vec!["compile".to_string(), "lint".to_string()]),
        ];

        let graph = DependencyGraph::for_jobs(&s).unwrap();
        let levels = graph.execution_levels().unwrap();

        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
        assert_eq!(levels[1], vec!["package".to_string()]);
    }
}
