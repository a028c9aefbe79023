//! Conflict resolution for queued actions targeting the same resource.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::action::{ActionPayload, ActionStatus, ActionType, QueuedAction};

/// Reduces queued actions of one type and resource to the single action
/// that should be replayed. Returning `None` defers to last-write-wins.
pub type ConflictResolver = Arc<dyn Fn(&[QueuedAction]) -> Option<QueuedAction> + Send + Sync>;

/// Latest action by `created_at`, queue position breaking ties.
pub fn last_write_wins(actions: &[QueuedAction]) -> Option<QueuedAction> {
    actions
        .iter()
        .max_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)))
        .cloned()
}

/// Union of all tag sets (first-seen order) carried by the latest action.
pub fn merge_tags(actions: &[QueuedAction]) -> Option<QueuedAction> {
    let mut winner = last_write_wins(actions)?;
    let mut merged: Vec<String> = Vec::new();
    for action in actions {
        if let ActionPayload::SetTags { tags, .. } = &action.payload {
            for tag in tags {
                if !merged.contains(tag) {
                    merged.push(tag.clone());
                }
            }
        }
    }
    if let ActionPayload::SetTags { tags, .. } = &mut winner.payload {
        *tags = merged;
    }
    Some(winner)
}

/// Per-type resolver lookup.
#[derive(Default, Clone)]
pub struct ResolverRegistry {
    resolvers: HashMap<ActionType, ConflictResolver>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: ActionType, resolver: ConflictResolver) {
        self.resolvers.insert(action_type, resolver);
    }

    pub fn resolve(
        &self,
        action_type: ActionType,
        actions: &[QueuedAction],
    ) -> Option<QueuedAction> {
        self.resolvers
            .get(&action_type)
            .and_then(|resolver| resolver(actions))
            .or_else(|| last_write_wins(actions))
    }
}

/// Changes needed to coalesce a queue.
#[derive(Debug, Default, PartialEq)]
pub struct CoalescePlan {
    /// Actions to write (resolved survivors)
    pub upserts: Vec<QueuedAction>,
    /// Actions superseded by a survivor
    pub dropped: Vec<Uuid>,
}

impl CoalescePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.dropped.is_empty()
    }
}

/// Plan the coalescing of pending actions. Each group of same-type,
/// same-resource actions collapses into one survivor that takes the queue
/// position of the group's latest member. Failed actions are left alone.
pub fn plan_coalesce(actions: &[QueuedAction], registry: &ResolverRegistry) -> CoalescePlan {
    let mut groups: Vec<((ActionType, String), Vec<&QueuedAction>)> = Vec::new();
    let mut positions: HashMap<(ActionType, String), usize> = HashMap::new();

    for action in actions.iter().filter(|a| a.status == ActionStatus::Pending) {
        let key = (action.action_type(), action.payload.resource_key());
        match positions.get(&key) {
            Some(&i) => groups[i].1.push(action),
            None => {
                positions.insert(key.clone(), groups.len());
                groups.push((key, vec![action]));
            }
        }
    }

    let mut plan = CoalescePlan::default();
    for ((action_type, _), members) in groups {
        if members.len() < 2 {
            continue;
        }
        let owned: Vec<QueuedAction> = members.iter().map(|a| (*a).clone()).collect();
        let Some(mut survivor) = registry.resolve(action_type, &owned) else {
            continue;
        };
        // A resolver returning another type would break the registry contract
        if survivor.action_type() != action_type {
            continue;
        }

        survivor.seq = owned.iter().map(|a| a.seq).max().unwrap_or(survivor.seq);
        survivor.status = ActionStatus::Pending;

        plan.dropped.extend(
            owned
                .iter()
                .filter(|a| a.id != survivor.id)
                .map(|a| a.id),
        );
        if owned.iter().all(|a| *a != survivor) {
            plan.upserts.push(survivor);
        }
    }
    plan
}
