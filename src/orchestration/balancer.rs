//! Load balancing.
//!
//! The balancer keeps a short utilization history per agent and turns it into
//! recommendations. It never mutates capacity itself: the scheduler carries
//! out `Redistribute` recommendations through its migration path.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::config::BalancerConfig;
use crate::core::task::TaskId;
use crate::orchestration::capacity::{CapacitySnapshot, CapacityTracker};
use crate::orchestration::registry::AgentRegistry;

/// Agent load class over the sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadClass {
    Bottleneck,
    Normal,
    Underutilized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub bottlenecks: Vec<AgentId>,
    pub underutilized: Vec<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Recommendation {
    /// More agents of this kind are needed.
    ScaleUp { kind: String, bottlenecks: usize },
    /// This kind has idle agents to spare.
    ScaleDown { kind: String, idle: usize },
    /// Move queued tasks from `from` to `to`.
    Redistribute {
        from: AgentId,
        to: AgentId,
        tasks: Vec<TaskId>,
    },
}

/// Utilization history and classification thresholds.
#[derive(Debug)]
pub struct LoadBalancer {
    config: BalancerConfig,
    history: BTreeMap<AgentId, VecDeque<f64>>,
}

impl LoadBalancer {
    pub fn new(config: BalancerConfig) -> Self {
        Self {
            config,
            history: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    fn window(&self) -> usize {
        self.config.window.max(1)
    }

    /// Record one utilization sample per agent. Agents missing from the
    /// snapshot lose their history.
    pub fn sample(&mut self, snapshots: &[CapacitySnapshot]) {
        let window = self.window();
        let present: BTreeSet<AgentId> = snapshots.iter().map(|s| s.agent).collect();
        self.history.retain(|id, _| present.contains(id));
        for snap in snapshots {
            let samples = self.history.entry(snap.agent).or_default();
            samples.push_back(snap.utilization_percentage);
            while samples.len() > window {
                samples.pop_front();
            }
        }
    }

    pub fn forget(&mut self, agent: &AgentId) {
        self.history.remove(agent);
    }

    /// Class of one agent. Agents with fewer samples than the window are
    /// `Normal`.
    pub fn class_of(&self, agent: &AgentId) -> LoadClass {
        let Some(samples) = self.history.get(agent) else {
            return LoadClass::Normal;
        };
        if samples.len() < self.window() {
            return LoadClass::Normal;
        }
        if samples.iter().all(|u| *u >= self.config.high_water_pct) {
            LoadClass::Bottleneck
        } else if samples.iter().all(|u| *u <= self.config.low_water_pct) {
            LoadClass::Underutilized
        } else {
            LoadClass::Normal
        }
    }

    pub fn classify(&self, capacity: &CapacityTracker) -> Classification {
        let mut out = Classification::default();
        for agent in self.history.keys() {
            match self.class_of(agent) {
                LoadClass::Bottleneck => out.bottlenecks.push(*agent),
                LoadClass::Underutilized if capacity.available_slots(agent) > 0 => {
                    out.underutilized.push(*agent)
                }
                _ => {}
            }
        }
        out
    }

    /// Build recommendations from the current window.
    ///
    /// `movable` filters queued tasks that are allowed to migrate, and
    /// `compatible` checks whether a task may run on a target agent.
    pub fn recommend<M, C>(
        &self,
        registry: &AgentRegistry,
        capacity: &CapacityTracker,
        movable: M,
        compatible: C,
    ) -> Vec<Recommendation>
    where
        M: Fn(&TaskId) -> bool,
        C: Fn(&TaskId, &AgentId) -> bool,
    {
        let classes = self.classify(capacity);
        let mut recs = Vec::new();

        let mut up: BTreeMap<&str, usize> = BTreeMap::new();
        for id in &classes.bottlenecks {
            if let Some(agent) = registry.get(id) {
                *up.entry(agent.kind.as_str()).or_default() += 1;
            }
        }
        let mut down: BTreeMap<&str, usize> = BTreeMap::new();
        for id in &classes.underutilized {
            if let Some(agent) = registry.get(id) {
                *down.entry(agent.kind.as_str()).or_default() += 1;
            }
        }

        // Free target slots, consumed as tasks are matched
        let mut free: BTreeMap<AgentId, u32> = classes
            .underutilized
            .iter()
            .filter(|id| registry.get(id).is_some_and(|a| a.status.is_schedulable()))
            .map(|id| (*id, capacity.available_slots(id)))
            .collect();

        for from in &classes.bottlenecks {
            let mut moves: BTreeMap<AgentId, Vec<TaskId>> = BTreeMap::new();
            // Newest reservations first
            for task in capacity.queued(from).iter().rev().filter(|t| movable(t)) {
                let target = free
                    .iter_mut()
                    .find(|(to, slots)| **slots > 0 && *to != from && compatible(task, to));
                if let Some((to, slots)) = target {
                    *slots -= 1;
                    moves.entry(*to).or_default().push(*task);
                }
            }
            for (to, tasks) in moves {
                recs.push(Recommendation::Redistribute {
                    from: *from,
                    to,
                    tasks,
                });
            }
        }

        // A kind that still has spare agents does not need more
        for (kind, bottlenecks) in up {
            if !down.contains_key(kind) {
                recs.push(Recommendation::ScaleUp {
                    kind: kind.to_string(),
                    bottlenecks,
                });
            }
        }
        for (kind, idle) in down {
            recs.push(Recommendation::ScaleDown {
                kind: kind.to_string(),
                idle,
            });
        }
        recs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn setup(agents: &[(&str, u32)]) -> (AgentRegistry, CapacityTracker, Vec<AgentId>) {
        let mut registry = AgentRegistry::new();
        let mut capacity = CapacityTracker::new(0.2);
        let mut ids = Vec::new();
        for (kind, max) in agents {
            let agent = Agent::new(&format!("{}-{}", kind, ids.len()), kind).with_capacity(*max);
            ids.push(agent.id);
            capacity.add_agent(agent.id, *max);
            registry.register(agent).unwrap();
        }
        (registry, capacity, ids)
    }

    fn fill(capacity: &mut CapacityTracker, agent: &AgentId, running: usize, queued: usize) -> Vec<TaskId> {
        let mut queued_ids = Vec::new();
        for _ in 0..running {
            let t = TaskId::new();
            capacity.reserve(agent, t).unwrap();
            capacity.mark_started(agent, &t).unwrap();
        }
        for _ in 0..queued {
            let t = TaskId::new();
            capacity.reserve(agent, t).unwrap();
            queued_ids.push(t);
        }
        queued_ids
    }

    fn balancer(window: usize) -> LoadBalancer {
        LoadBalancer::new(BalancerConfig {
            window,
            ..Default::default()
        })
    }

    #[test]
    fn test_classification_needs_full_window() {
        let (_, mut capacity, ids) = setup(&[("coder", 10), ("coder", 10)]);
        fill(&mut capacity, &ids[0], 9, 0);
        let mut lb = balancer(3);

        lb.sample(&capacity.snapshot());
        lb.sample(&capacity.snapshot());
        assert_eq!(lb.class_of(&ids[0]), LoadClass::Normal);

        lb.sample(&capacity.snapshot());
        assert_eq!(lb.class_of(&ids[0]), LoadClass::Bottleneck);
        assert_eq!(lb.class_of(&ids[1]), LoadClass::Underutilized);
    }

    #[test]
    fn test_spike_is_not_a_bottleneck() {
        let (_, mut capacity, ids) = setup(&[("coder", 10)]);
        let mut lb = balancer(2);
        lb.sample(&capacity.snapshot());
        fill(&mut capacity, &ids[0], 9, 0);
        lb.sample(&capacity.snapshot());
        assert_eq!(lb.class_of(&ids[0]), LoadClass::Normal);
    }

    #[test]
    fn test_redistribute_queued_tasks() {
        let (registry, mut capacity, ids) = setup(&[("coder", 10), ("coder", 10)]);
        let queued = fill(&mut capacity, &ids[0], 9, 1);
        fill(&mut capacity, &ids[1], 1, 0);
        let mut lb = balancer(1);
        lb.sample(&capacity.snapshot());

        let recs = lb.recommend(&registry, &capacity, |_| true, |_, _| true);
        assert!(recs.contains(&Recommendation::Redistribute {
            from: ids[0],
            to: ids[1],
            tasks: queued,
        }));
        // Same kind has a bottleneck and a spare agent: no scale-up
        assert!(!recs
            .iter()
            .any(|r| matches!(r, Recommendation::ScaleUp { .. })));
    }

    #[test]
    fn test_incompatible_target_gets_nothing() {
        let (registry, mut capacity, ids) = setup(&[("coder", 10), ("tester", 10)]);
        fill(&mut capacity, &ids[0], 9, 1);
        let mut lb = balancer(1);
        lb.sample(&capacity.snapshot());

        let recs = lb.recommend(&registry, &capacity, |_| true, |_, _| false);
        assert!(!recs
            .iter()
            .any(|r| matches!(r, Recommendation::Redistribute { .. })));
        assert!(recs.contains(&Recommendation::ScaleUp {
            kind: "coder".to_string(),
            bottlenecks: 1,
        }));
        assert!(recs.contains(&Recommendation::ScaleDown {
            kind: "tester".to_string(),
            idle: 1,
        }));
    }

    #[test]
    fn test_sample_drops_removed_agents() {
        let (_, capacity, ids) = setup(&[("coder", 1)]);
        let mut lb = balancer(1);
        lb.sample(&capacity.snapshot());
        assert_eq!(lb.class_of(&ids[0]), LoadClass::Underutilized);
        lb.sample(&[]);
        assert_eq!(lb.class_of(&ids[0]), LoadClass::Normal);
    }
}
