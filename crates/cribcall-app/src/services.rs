//! Process-wide service lifecycle.
//!
//! Services declare their dependencies up front; the coordinator resolves a
//! startup order by topological sort, and tears everything down in reverse
//! once the process is asked to stop. Keeps the wiring free of back-pointers:
//! no service ever holds a handle to the one that started it.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("service '{0}' depends on unknown service '{1}'")]
    UnknownDependency(String, String),

    #[error("dependency cycle involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

type Teardown = Box<dyn FnOnce() + Send>;

pub struct ServiceCoordinator {
    teardowns: Vec<(String, Teardown)>,
}

impl ServiceCoordinator {
    pub fn new() -> Self {
        Self {
            teardowns: Vec::new(),
        }
    }

    /// Resolve a startup order from `(name, depends_on)` declarations.
    /// Kahn's algorithm; ties break in declaration order so the result is
    /// stable.
    pub fn resolve(declared: &[(&str, &[&str])]) -> Result<Vec<String>, CoordinatorError> {
        let names: HashSet<&str> = declared.iter().map(|(name, _)| *name).collect();
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, deps) in declared {
            indegree.entry(name).or_insert(0);
            for dep in *deps {
                if !names.contains(dep) {
                    return Err(CoordinatorError::UnknownDependency(
                        (*name).to_owned(),
                        (*dep).to_owned(),
                    ));
                }
                *indegree.entry(name).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(name);
            }
        }

        let mut ready: VecDeque<&str> = declared
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| indegree[name] == 0)
            .collect();
        let mut order = Vec::with_capacity(declared.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_owned());
            for dependent in dependents.get(name).into_iter().flatten() {
                let count = indegree
                    .get_mut(dependent)
                    .expect("dependent was registered");
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() != declared.len() {
            let stuck: Vec<String> = declared
                .iter()
                .map(|(name, _)| *name)
                .filter(|name| !order.iter().any(|o| o == name))
                .map(str::to_owned)
                .collect();
            return Err(CoordinatorError::Cycle(stuck));
        }

        debug!("[services] Startup order: {}", order.join(" → "));
        Ok(order)
    }

    /// Register a started service's teardown. Call in startup order.
    pub fn register(&mut self, name: impl Into<String>, teardown: impl FnOnce() + Send + 'static) {
        self.teardowns.push((name.into(), Box::new(teardown)));
    }

    /// Tear services down in reverse startup order.
    pub fn shutdown(self) {
        for (name, teardown) in self.teardowns.into_iter().rev() {
            info!("[services] Stopping {}", name);
            teardown();
        }
    }
}

impl Default for ServiceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
