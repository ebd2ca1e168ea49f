//! Ambient, per-logical-task key/value bindings.
//!
//! Grounded in a `global_context: AHashMap<String, String>` pattern (a
//! single flat map attached to every log call), generalized into a
//! `Value`-typed, task-scoped store using `tokio::task_local!` for the
//! common in-task case, with an explicit snapshot/install pair for
//! thread-pool and cross-executor hand-off — grounded in
//! `abitofhelp-adaptive_pipeline`'s practice of handing an explicit,
//! cloned `ProcessingContext` across service boundaries instead of
//! relying on implicit propagation.

use ahash::AHashMap;
use std::cell::RefCell;
use std::future::Future;

use crate::envelope::Value;

tokio::task_local! {
    static AMBIENT: RefCell<AHashMap<String, Value>>;
}

/// An immutable point-in-time copy of the ambient context, transferable
/// across task/thread boundaries.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(AHashMap<String, Value>);

impl Snapshot {
    pub fn into_map(self) -> AHashMap<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &AHashMap<String, Value> {
        &self.0
    }
}

/// Handle to the ambient context of whichever task is currently running.
///
/// All methods here operate on the task-local storage of the *calling*
/// task: the facade's per-call merge always reads the ambient context
/// of the task currently issuing the log call.
pub struct ContextStore;

impl ContextStore {
    /// Returns a snapshot of the ambient map for the current task, or an
    /// empty snapshot if no ambient context has been installed.
    pub fn get_ambient() -> Snapshot {
        AMBIENT
            .try_with(|m| Snapshot(m.borrow().clone()))
            .unwrap_or_default()
    }

    /// Binds `fields` into the current task's ambient context. Panics if
    /// called outside of a task that has an ambient scope installed; use
    /// [`ContextStore::scope`] to install one.
    pub fn bind(fields: impl IntoIterator<Item = (String, Value)>) {
        AMBIENT.with(|m| {
            let mut guard = m.borrow_mut();
            for (k, v) in fields {
                guard.insert(k, v);
            }
        });
    }

    /// Removes `keys` from the current task's ambient context.
    pub fn unbind(keys: impl IntoIterator<Item = impl AsRef<str>>) {
        AMBIENT.with(|m| {
            let mut guard = m.borrow_mut();
            for k in keys {
                guard.remove(k.as_ref());
            }
        });
    }

    /// Clears the current task's ambient context entirely.
    pub fn clear() {
        AMBIENT.with(|m| m.borrow_mut().clear());
    }

    /// Takes an immutable snapshot usable to install the same ambient
    /// state onto another task.
    pub fn snapshot() -> Snapshot {
        Self::get_ambient()
    }

    /// Runs `fut` inside a freshly-installed ambient scope initialized
    /// from `snapshot`. Mutations the future makes are local to that
    /// scope: a child's mutations must never affect the parent, which
    /// this satisfies structurally — `fut` gets its own
    /// `RefCell`, not a handle to the parent's.
    pub async fn run_with_snapshot<F: Future>(snapshot: Snapshot, fut: F) -> F::Output {
        AMBIENT
            .scope(RefCell::new(snapshot.into_map()), fut)
            .await
    }

    /// Installs an empty ambient scope around `fut`. Used by spawn
    /// helpers that want a task to start with a clean context instead of
    /// inheriting one.
    pub async fn run_with_fresh_scope<F: Future>(fut: F) -> F::Output {
        Self::run_with_snapshot(Snapshot::default(), fut).await
    }
}

/// Spawns `fut` on the Tokio runtime with the calling task's ambient
/// context snapshotted and installed on the new task before it runs, and
/// restored (i.e. left untouched on the parent) on return.
///
/// This is an explicit snapshot-install pattern, needed wherever the
/// runtime doesn't propagate task-locals on its own (it doesn't, across
/// `tokio::spawn`).
pub fn spawn_with_context<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let snapshot = ContextStore::snapshot();
    tokio::spawn(ContextStore::run_with_snapshot(snapshot, fut))
}

/// Offloads `f` onto the blocking thread pool with the calling task's
/// ambient context available to it via the returned snapshot — blocking
/// closures cannot be `.await`-instrumented, so callers that need context
/// inside `f` should capture this snapshot explicitly rather than relying
/// on task-locals (which blocking-pool threads do not share).
pub fn snapshot_for_blocking() -> Snapshot {
    ContextStore::snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_and_get_ambient_round_trip() {
        ContextStore::run_with_fresh_scope(async {
            ContextStore::bind([("user".to_string(), Value::from("alice"))]);
            let snap = ContextStore::get_ambient();
            assert_eq!(snap.as_map().get("user"), Some(&Value::from("alice")));
        })
        .await;
    }

    #[tokio::test]
    async fn child_task_mutation_invisible_to_parent() {
        ContextStore::run_with_fresh_scope(async {
            ContextStore::bind([("k".to_string(), Value::from("parent"))]);

            spawn_with_context(async {
                ContextStore::bind([("k".to_string(), Value::from("child"))]);
                ContextStore::bind([("only_child".to_string(), Value::from(true))]);
            })
            .await
            .unwrap();

            let after = ContextStore::get_ambient();
            assert_eq!(after.as_map().get("k"), Some(&Value::from("parent")));
            assert_eq!(after.as_map().get("only_child"), None);
        })
        .await;
    }

    #[tokio::test]
    async fn unbind_and_clear() {
        ContextStore::run_with_fresh_scope(async {
            ContextStore::bind([
                ("a".to_string(), Value::from(1i64)),
                ("b".to_string(), Value::from(2i64)),
            ]);
            ContextStore::unbind(["a"]);
            let snap = ContextStore::get_ambient();
            assert_eq!(snap.as_map().get("a"), None);
            assert_eq!(snap.as_map().get("b"), Some(&Value::from(2i64)));

            ContextStore::clear();
            assert!(ContextStore::get_ambient().as_map().is_empty());
        })
        .await;
    }

    #[test]
    fn get_ambient_outside_scope_is_empty() {
        // No tokio task-local scope installed at all (not even inside a
        // tokio runtime) — must not panic.
        let snap = ContextStore::get_ambient();
        assert!(snap.as_map().is_empty());
    }
}
