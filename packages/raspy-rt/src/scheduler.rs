//! DAG scheduler: topological order at construction, per-tick release gate.

use crate::error::ConstructionFault;
use parking_lot::{Condvar, Mutex};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;
use std::collections::HashMap;
use std::time::Instant;

/// Dependency graph over modules. Node indices are module indices in
/// declaration order.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    order: Vec<usize>,
    upstream: Vec<Vec<usize>>,
}

impl DagScheduler {
    /// Build from `(module, depends_on)` pairs.
    pub fn new<'a, I>(modules: I) -> Result<Self, ConstructionFault>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let modules: Vec<(&str, &[String])> = modules.into_iter().collect();
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        for (name, _) in &modules {
            if node_map.contains_key(*name) {
                return Err(ConstructionFault::DuplicateModule(name.to_string()));
            }
            let index = graph.add_node(name.to_string());
            node_map.insert(name.to_string(), index);
        }

        for (name, deps) in &modules {
            let target = node_map[*name];
            for dep in deps.iter() {
                if dep == name {
                    return Err(ConstructionFault::SelfDependency(name.to_string()));
                }
                let source = node_map.get(dep).ok_or_else(|| ConstructionFault::UnknownDependency {
                    module: name.to_string(),
                    dependency: dep.clone(),
                })?;
                if graph.find_edge(*source, target).is_none() {
                    graph.add_edge(*source, target, ());
                }
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| ConstructionFault::Cycle {
            module: graph[cycle.node_id()].clone(),
        })?;
        let order: Vec<usize> = sorted.into_iter().map(|idx| idx.index()).collect();

        let upstream = (0..graph.node_count())
            .map(|i| {
                let mut ups: Vec<usize> = graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .map(|n| n.index())
                    .collect();
                ups.sort_unstable();
                ups
            })
            .collect();

        log::debug!(
            "Schedule order: {}",
            order.iter().map(|&i| graph[NodeIndex::new(i)].as_str()).collect::<Vec<_>>().join(" -> ")
        );

        Ok(Self {
            graph,
            node_map,
            order,
            upstream,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn name(&self, module: usize) -> &str {
        &self.graph[NodeIndex::new(module)]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.node_map.get(name).map(|idx| idx.index())
    }

    /// Module indices in topological order
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn order_names(&self) -> Vec<String> {
        self.order.iter().map(|&i| self.name(i).to_string()).collect()
    }

    pub fn upstream(&self, module: usize) -> &[usize] {
        &self.upstream[module]
    }

    /// Every module `module` transitively depends on, sorted
    pub fn ancestors(&self, module: usize) -> Vec<usize> {
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, NodeIndex::new(module));
        let mut found = Vec::new();
        while let Some(node) = dfs.next(reversed) {
            if node.index() != module {
                found.push(node.index());
            }
        }
        found.sort_unstable();
        found
    }

    pub fn upstream_table(&self) -> Vec<Vec<usize>> {
        self.upstream.clone()
    }

    /// Modules released at the start of each tick without waiting
    pub fn roots(&self) -> Vec<usize> {
        self.order.iter().copied().filter(|&i| self.upstream[i].is_empty()).collect()
    }

    /// Split the modules still pending at a missed deadline into the hung
    /// module (first pending one, in order, whose upstreams all completed)
    /// and the dependents it stalled.
    pub fn diagnose(&self, pending: &[usize]) -> Option<(usize, Vec<usize>)> {
        let culprit = self
            .order
            .iter()
            .copied()
            .find(|m| pending.contains(m) && self.upstream[*m].iter().all(|u| !pending.contains(u)))?;
        let stalled = self
            .order
            .iter()
            .copied()
            .filter(|m| *m != culprit && pending.contains(m))
            .collect();
        Some((culprit, stalled))
    }
}

/// What a module worker should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    Run { tick: u64, deadline: Instant },
    Halt,
}

struct BoardState {
    released: u64,
    deadline: Instant,
    completed: Vec<u64>,
    halted: bool,
}

/// Tick-tagged completion tokens shared by the coordinator and all workers.
pub struct CompletionBoard {
    state: Mutex<BoardState>,
    changed: Condvar,
    upstream: Vec<Vec<usize>>,
}

impl CompletionBoard {
    pub fn new(upstream: Vec<Vec<usize>>) -> Self {
        Self {
            state: Mutex::new(BoardState {
                released: 0,
                deadline: Instant::now(),
                completed: vec![0; upstream.len()],
                halted: false,
            }),
            changed: Condvar::new(),
            upstream,
        }
    }

    /// Open tick `tick` to every module; it must complete before `deadline`
    pub fn release(&self, tick: u64, deadline: Instant) {
        let mut state = self.state.lock();
        debug_assert!(tick > state.released, "ticks are never replayed");
        state.released = tick;
        state.deadline = deadline;
        self.changed.notify_all();
    }

    /// Block until `module` may run the released tick: it has not completed
    /// that tick yet and all its upstreams have.
    pub fn wait_turn(&self, module: usize) -> Turn {
        let mut state = self.state.lock();
        loop {
            if state.halted {
                return Turn::Halt;
            }
            let tick = state.released;
            if tick > state.completed[module]
                && self.upstream[module].iter().all(|&u| state.completed[u] >= tick)
            {
                return Turn::Run {
                    tick,
                    deadline: state.deadline,
                };
            }
            self.changed.wait(&mut state);
        }
    }

    pub fn complete(&self, module: usize, tick: u64) {
        let mut state = self.state.lock();
        state.completed[module] = tick;
        self.changed.notify_all();
    }

    /// Wait until every module completed `tick`. On timeout returns the
    /// modules still pending.
    pub fn wait_all_complete(&self, tick: u64, deadline: Instant) -> Result<(), Vec<usize>> {
        let mut state = self.state.lock();
        loop {
            let pending: Vec<usize> = state
                .completed
                .iter()
                .enumerate()
                .filter(|&(_, &done)| done < tick)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if state.halted {
                return Err(pending);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                let pending = (0..state.completed.len()).filter(|&i| state.completed[i] < tick).collect();
                return Err(pending);
            }
        }
    }

    pub fn halt(&self) {
        let mut state = self.state.lock();
        state.halted = true;
        self.changed.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    pub fn completed_tick(&self, module: usize) -> u64 {
        self.state.lock().completed[module]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_linear_chain_order() {
        let none = deps(&[]);
        let a = deps(&["eeg"]);
        let b = deps(&["filter"]);
        let sched =
            DagScheduler::new([("decoder", b.as_slice()), ("eeg", none.as_slice()), ("filter", a.as_slice())])
                .unwrap();
        assert_eq!(sched.order_names(), vec!["eeg", "filter", "decoder"]);
        assert_eq!(sched.roots(), vec![1]);
    }

    #[test]
    fn test_ancestors_are_transitive() {
        let none = deps(&[]);
        let a = deps(&["eeg"]);
        let b = deps(&["filter"]);
        let sched = DagScheduler::new([
            ("eeg", none.as_slice()),
            ("filter", a.as_slice()),
            ("decoder", b.as_slice()),
            ("task", none.as_slice()),
        ])
        .unwrap();
        assert_eq!(sched.ancestors(2), vec![0, 1]);
        assert!(sched.ancestors(0).is_empty());
        assert!(sched.ancestors(3).is_empty());
    }

    #[test]
    fn test_random_dags_respect_edges() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let n = rng.random_range(1..12);
            let names: Vec<String> = (0..n).map(|i| format!("m{}", i)).collect();
            // Edges only from lower to higher index keep the graph acyclic.
            let edges: Vec<Vec<String>> = (0..n)
                .map(|i| (0..i).filter(|_| rng.random_bool(0.3)).map(|j| names[j].clone()).collect())
                .collect();
            let sched =
                DagScheduler::new(names.iter().map(|s| s.as_str()).zip(edges.iter().map(|e| e.as_slice())))
                    .unwrap();

            let position: HashMap<usize, usize> =
                sched.order().iter().enumerate().map(|(pos, &m)| (m, pos)).collect();
            for m in 0..n {
                for &u in sched.upstream(m) {
                    assert!(position[&u] < position[&m]);
                }
            }
        }
    }

    #[test]
    fn test_cycle_fails_construction() {
        let a = deps(&["c"]);
        let b = deps(&["a"]);
        let c = deps(&["b"]);
        let err = DagScheduler::new([("a", a.as_slice()), ("b", b.as_slice()), ("c", c.as_slice())]).unwrap_err();
        assert!(matches!(err, ConstructionFault::Cycle { .. }));
    }

    #[test]
    fn test_self_and_unknown_dependencies() {
        let own = deps(&["a"]);
        assert_eq!(
            DagScheduler::new([("a", own.as_slice())]).unwrap_err(),
            ConstructionFault::SelfDependency("a".to_string())
        );
        let ghost = deps(&["ghost"]);
        assert!(matches!(
            DagScheduler::new([("a", ghost.as_slice())]).unwrap_err(),
            ConstructionFault::UnknownDependency { .. }
        ));
        let none = deps(&[]);
        assert!(matches!(
            DagScheduler::new([("a", none.as_slice()), ("a", none.as_slice())]).unwrap_err(),
            ConstructionFault::DuplicateModule(_)
        ));
    }

    #[test]
    fn test_diagnose_names_hung_module() {
        let none = deps(&[]);
        let on_src = deps(&["src"]);
        let on_hung = deps(&["hung"]);
        let sched = DagScheduler::new([
            ("src", none.as_slice()),
            ("hung", on_src.as_slice()),
            ("sink", on_hung.as_slice()),
        ])
        .unwrap();
        let (culprit, stalled) = sched.diagnose(&[1, 2]).unwrap();
        assert_eq!(sched.name(culprit), "hung");
        assert_eq!(stalled, vec![2]);
    }

    #[test]
    fn test_dependent_released_after_upstream_completes() {
        let board = Arc::new(CompletionBoard::new(vec![vec![], vec![0]]));
        let deadline = Instant::now() + Duration::from_secs(1);
        board.release(1, deadline);
        assert_eq!(board.wait_turn(0), Turn::Run { tick: 1, deadline });

        let waiter = {
            let board = Arc::clone(&board);
            thread::spawn(move || board.wait_turn(1))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(board.completed_tick(1), 0);
        board.complete(0, 1);
        assert_eq!(waiter.join().unwrap(), Turn::Run { tick: 1, deadline });

        board.complete(1, 1);
        assert!(board.wait_all_complete(1, Instant::now() + Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_wait_all_complete_times_out_with_pending() {
        let board = CompletionBoard::new(vec![vec![], vec![0]]);
        board.release(1, Instant::now() + Duration::from_millis(20));
        board.complete(0, 1);
        let pending = board
            .wait_all_complete(1, Instant::now() + Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(pending, vec![1]);
    }

    #[test]
    fn test_halt_wakes_waiters() {
        let board = Arc::new(CompletionBoard::new(vec![vec![]]));
        let waiter = {
            let board = Arc::clone(&board);
            thread::spawn(move || board.wait_turn(0))
        };
        thread::sleep(Duration::from_millis(10));
        board.halt();
        assert_eq!(waiter.join().unwrap(), Turn::Halt);
        assert!(board.is_halted());
    }
}
