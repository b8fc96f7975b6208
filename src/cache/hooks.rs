//! Lifecycle hooks around rebuilds and per-node publish/unpublish.
//!
//! Hooks run synchronously on the calling task, in registration order, so a
//! collaborator can veto the operation in flight. Each registration is keyed by
//! a registrant name: registering the same name again for the same point
//! replaces the earlier callback in place instead of stacking a second one.
//!
//! Callbacks must not register or unregister hooks themselves.

use std::sync::RwLock;

use tracing::debug;

use crate::domain::node::{Node, NodeId, SourceRow};
use crate::domain::snapshot::TreeSnapshot;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::hooks";

/// Verdict returned by a "before" hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HookOutcome {
    #[default]
    Proceed,
    /// Carry out the operation for this node but leave its descendants out.
    CancelDescendants,
    Cancel,
}

impl HookOutcome {
    /// Combine two verdicts; the stronger one wins.
    pub fn merge(self, other: HookOutcome) -> HookOutcome {
        self.max(other)
    }
}

type BeforeRefreshFn = Box<dyn Fn() -> HookOutcome + Send + Sync>;
type AfterRefreshFn = Box<dyn Fn(&TreeSnapshot) + Send + Sync>;
type BeforeNodeFn = Box<dyn Fn(NodeId) -> HookOutcome + Send + Sync>;
type AfterPublishFn = Box<dyn Fn(&Node) + Send + Sync>;
type AfterUnpublishFn = Box<dyn Fn(NodeId, &[NodeId]) + Send + Sync>;
type BeforeNodeLoadFn = Box<dyn Fn(&mut SourceRow) -> HookOutcome + Send + Sync>;
type AfterNodeLoadFn = Box<dyn Fn(&mut Node) -> HookOutcome + Send + Sync>;

/// A typed callback bound to one hook point.
pub enum Hook {
    BeforeRefresh(BeforeRefreshFn),
    AfterRefresh(AfterRefreshFn),
    BeforePublish(BeforeNodeFn),
    AfterPublish(AfterPublishFn),
    BeforeUnpublish(BeforeNodeFn),
    /// Receives the unpublished id and every id removed with it.
    AfterUnpublish(AfterUnpublishFn),
    /// May rewrite the raw row (payload included) or veto it.
    BeforeNodeLoad(BeforeNodeLoadFn),
    /// May rewrite the parsed node or veto it.
    AfterNodeLoad(AfterNodeLoadFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeRefresh,
    AfterRefresh,
    BeforePublish,
    AfterPublish,
    BeforeUnpublish,
    AfterUnpublish,
    BeforeNodeLoad,
    AfterNodeLoad,
}

impl Hook {
    pub fn before_refresh(f: impl Fn() -> HookOutcome + Send + Sync + 'static) -> Self {
        Self::BeforeRefresh(Box::new(f))
    }

    pub fn after_refresh(f: impl Fn(&TreeSnapshot) + Send + Sync + 'static) -> Self {
        Self::AfterRefresh(Box::new(f))
    }

    pub fn before_publish(f: impl Fn(NodeId) -> HookOutcome + Send + Sync + 'static) -> Self {
        Self::BeforePublish(Box::new(f))
    }

    pub fn after_publish(f: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        Self::AfterPublish(Box::new(f))
    }

    pub fn before_unpublish(f: impl Fn(NodeId) -> HookOutcome + Send + Sync + 'static) -> Self {
        Self::BeforeUnpublish(Box::new(f))
    }

    pub fn after_unpublish(f: impl Fn(NodeId, &[NodeId]) + Send + Sync + 'static) -> Self {
        Self::AfterUnpublish(Box::new(f))
    }

    pub fn before_node_load(
        f: impl Fn(&mut SourceRow) -> HookOutcome + Send + Sync + 'static,
    ) -> Self {
        Self::BeforeNodeLoad(Box::new(f))
    }

    pub fn after_node_load(f: impl Fn(&mut Node) -> HookOutcome + Send + Sync + 'static) -> Self {
        Self::AfterNodeLoad(Box::new(f))
    }

    pub fn point(&self) -> HookPoint {
        match self {
            Hook::BeforeRefresh(_) => HookPoint::BeforeRefresh,
            Hook::AfterRefresh(_) => HookPoint::AfterRefresh,
            Hook::BeforePublish(_) => HookPoint::BeforePublish,
            Hook::AfterPublish(_) => HookPoint::AfterPublish,
            Hook::BeforeUnpublish(_) => HookPoint::BeforeUnpublish,
            Hook::AfterUnpublish(_) => HookPoint::AfterUnpublish,
            Hook::BeforeNodeLoad(_) => HookPoint::BeforeNodeLoad,
            Hook::AfterNodeLoad(_) => HookPoint::AfterNodeLoad,
        }
    }
}

struct Registration {
    name: String,
    hook: Hook,
}

/// Registry of lifecycle callbacks shared by the cache components.
#[derive(Default)]
pub struct LifecycleHooks {
    registrations: RwLock<Vec<Registration>>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` under `name`. Returns true when it replaced an earlier
    /// registration of the same name at the same point.
    pub fn register(&self, name: impl Into<String>, hook: Hook) -> bool {
        let name = name.into();
        let point = hook.point();
        let mut registrations = rw_write(&self.registrations, SOURCE, "register");

        if let Some(existing) = registrations
            .iter_mut()
            .find(|entry| entry.name == name && entry.hook.point() == point)
        {
            existing.hook = hook;
            debug!(target = "verdant::cache::hooks", name = %name, ?point, "Hook replaced");
            return true;
        }

        debug!(target = "verdant::cache::hooks", name = %name, ?point, "Hook registered");
        registrations.push(Registration { name, hook });
        false
    }

    /// Remove the registration of `name` at `point`. Returns whether one existed.
    pub fn unregister(&self, name: &str, point: HookPoint) -> bool {
        let mut registrations = rw_write(&self.registrations, SOURCE, "unregister");
        let before = registrations.len();
        registrations.retain(|entry| !(entry.name == name && entry.hook.point() == point));
        registrations.len() != before
    }

    pub fn len(&self) -> usize {
        rw_read(&self.registrations, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn before_refresh(&self) -> HookOutcome {
        self.fold(|hook| match hook {
            Hook::BeforeRefresh(f) => Some(f()),
            _ => None,
        })
    }

    pub(crate) fn after_refresh(&self, snapshot: &TreeSnapshot) {
        self.each(|hook| {
            if let Hook::AfterRefresh(f) = hook {
                f(snapshot);
            }
        });
    }

    pub(crate) fn before_publish(&self, id: NodeId) -> HookOutcome {
        self.fold(|hook| match hook {
            Hook::BeforePublish(f) => Some(f(id)),
            _ => None,
        })
    }

    pub(crate) fn after_publish(&self, node: &Node) {
        self.each(|hook| {
            if let Hook::AfterPublish(f) = hook {
                f(node);
            }
        });
    }

    pub(crate) fn before_unpublish(&self, id: NodeId) -> HookOutcome {
        self.fold(|hook| match hook {
            Hook::BeforeUnpublish(f) => Some(f(id)),
            _ => None,
        })
    }

    pub(crate) fn after_unpublish(&self, id: NodeId, removed: &[NodeId]) {
        self.each(|hook| {
            if let Hook::AfterUnpublish(f) = hook {
                f(id, removed);
            }
        });
    }

    pub(crate) fn before_node_load(&self, row: &mut SourceRow) -> HookOutcome {
        self.fold(|hook| match hook {
            Hook::BeforeNodeLoad(f) => Some(f(row)),
            _ => None,
        })
    }

    pub(crate) fn after_node_load(&self, node: &mut Node) -> HookOutcome {
        self.fold(|hook| match hook {
            Hook::AfterNodeLoad(f) => Some(f(node)),
            _ => None,
        })
    }

    fn each(&self, mut visit: impl FnMut(&Hook)) {
        let registrations = rw_read(&self.registrations, SOURCE, "each");
        for entry in registrations.iter() {
            visit(&entry.hook);
        }
    }

    fn fold(&self, mut visit: impl FnMut(&Hook) -> Option<HookOutcome>) -> HookOutcome {
        let mut outcome = HookOutcome::Proceed;
        self.each(|hook| {
            if let Some(verdict) = visit(hook) {
                outcome = outcome.merge(verdict);
            }
        });
        outcome
    }
}
