//! Optimistic updates with rollback
//!
//! What this module provides
//! - `OptimisticUpdater::update`: apply a local mutation now, await the remote call,
//!   undo the mutation if the call fails
//! - `OptimisticList`: a shared list whose edits go through `update` and roll back to
//!   the exact prior position
//!
//! Ordering per call: mutate, await remote, then either `on_success` or
//! rollback followed by `on_error`. The error is always returned to the caller.
//!
//! Mutations and rollbacks are infallible by type. A panic inside `mutate`
//! propagates before the remote call is made and nothing is rolled back; a panic
//! inside `rollback` propagates and `on_error` is not called.
//!
//! No state is kept between calls. Overlapping updates on the same data are not
//! serialized; callers that race edits must order them themselves. List
//! rollbacks locate the value they wrote rather than trusting a stored index,
//! so a failed edit never undoes another caller's confirmed one.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

/// Applies the optimistic change.
pub trait Mutate {
    fn apply(self);
}

impl<F: FnOnce()> Mutate for F {
    fn apply(self) {
        self()
    }
}

/// Undoes the optimistic change.
pub trait Rollback {
    fn undo(self);
}

impl<F: FnOnce()> Rollback for F {
    fn undo(self) {
        self()
    }
}

/// The remote operation that confirms the change.
pub trait RemoteCall<T, E> {
    type Future: Future<Output = Result<T, E>>;
    fn call(self) -> Self::Future;
}

impl<F, Fut, T, E> RemoteCall<T, E> for F
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    type Future = Fut;
    fn call(self) -> Fut {
        self()
    }
}

type SuccessHook<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorHook<E> = Box<dyn FnOnce(&E) + Send>;

/// Optional success / error hooks, typically used to show a toast.
///
/// Hooks are owned (`Send + 'static`), so an update carrying them can be
/// moved onto a spawned task.
pub struct UpdateCallbacks<T, E> {
    on_success: Option<SuccessHook<T>>,
    on_error: Option<ErrorHook<E>>,
}

impl<T, E> Default for UpdateCallbacks<T, E> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }
}

impl<T, E> UpdateCallbacks<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&E) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Runs "mutate now, confirm later, undo on failure" interactions.
#[derive(Debug, Clone, Default)]
pub struct OptimisticUpdater {
    label: Option<String>,
}

impl OptimisticUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in log records, e.g. `"delete_item"`.
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }

    pub async fn update<M, R, B, T, E>(
        &self,
        mutate: M,
        remote: R,
        rollback: B,
        callbacks: UpdateCallbacks<T, E>,
    ) -> Result<T, E>
    where
        M: Mutate,
        R: RemoteCall<T, E>,
        B: Rollback,
        E: std::fmt::Debug,
    {
        let label = self.label.as_deref().unwrap_or("optimistic_update");
        mutate.apply();

        match remote.call().await {
            Ok(result) => {
                debug!(operation = label, "remote call confirmed optimistic update");
                if let Some(on_success) = callbacks.on_success {
                    on_success(&result);
                }
                Ok(result)
            }
            Err(error) => {
                warn!(operation = label, ?error, "remote call failed, rolling back");
                rollback.undo();
                if let Some(on_error) = callbacks.on_error {
                    on_error(&error);
                }
                Err(error)
            }
        }
    }
}

/// Shorthand for [`OptimisticUpdater::update`] without a label or callbacks.
pub async fn update<M, R, B, T, E>(mutate: M, remote: R, rollback: B) -> Result<T, E>
where
    M: Mutate,
    R: RemoteCall<T, E>,
    B: Rollback,
    E: std::fmt::Debug,
{
    OptimisticUpdater::new()
        .update(mutate, remote, rollback, UpdateCallbacks::new())
        .await
}

/// A shared list edited optimistically.
///
/// Clones share the same items.
#[derive(Debug)]
pub struct OptimisticList<T> {
    items: Arc<Mutex<Vec<T>>>,
    updater: OptimisticUpdater,
}

impl<T> Clone for OptimisticList<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            updater: self.updater.clone(),
        }
    }
}

impl<T> Default for OptimisticList<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> From<Vec<T>> for OptimisticList<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

impl<T> OptimisticList<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
            updater: OptimisticUpdater::named("optimistic_list"),
        }
    }

    pub fn with_updater(mut self, updater: OptimisticUpdater) -> Self {
        self.updater = updater;
        self
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().clone()
    }

    /// Remove the first item matching `pred`; re-insert it at the same index on failure.
    ///
    /// When nothing matches the list is left alone but `remote` still runs.
    pub async fn remove_where<P, R, V, E>(
        &self,
        pred: P,
        remote: R,
        callbacks: UpdateCallbacks<V, E>,
    ) -> Result<V, E>
    where
        P: Fn(&T) -> bool,
        R: RemoteCall<V, E>,
        E: std::fmt::Debug,
    {
        let removed: Mutex<Option<(usize, T)>> = Mutex::new(None);
        self.updater
            .update(
                || {
                    let mut items = self.lock();
                    if let Some(idx) = items.iter().position(|item| pred(item)) {
                        let item = items.remove(idx);
                        *lock_slot(&removed) = Some((idx, item));
                    }
                },
                remote,
                || {
                    if let Some((idx, item)) = lock_slot(&removed).take() {
                        let mut items = self.lock();
                        let idx = idx.min(items.len());
                        items.insert(idx, item);
                    }
                },
                callbacks,
            )
            .await
    }

    /// Append `item`; remove it again on failure.
    ///
    /// The rollback removes the last item equal to `item`, wherever other
    /// edits have moved it.
    pub async fn push<R, V, E>(
        &self,
        item: T,
        remote: R,
        callbacks: UpdateCallbacks<V, E>,
    ) -> Result<V, E>
    where
        T: Clone + PartialEq,
        R: RemoteCall<V, E>,
        E: std::fmt::Debug,
    {
        let pushed = item.clone();
        self.updater
            .update(
                || self.lock().push(item),
                remote,
                || {
                    let mut items = self.lock();
                    if let Some(idx) = items.iter().rposition(|other| *other == pushed) {
                        items.remove(idx);
                    }
                },
                callbacks,
            )
            .await
    }

    /// Replace the first item matching `pred`; restore the old value on failure.
    ///
    /// The rollback looks for `replacement` at its original index first, then
    /// anywhere in the list. If it is gone, the list is left as is.
    pub async fn replace_where<P, R, V, E>(
        &self,
        pred: P,
        replacement: T,
        remote: R,
        callbacks: UpdateCallbacks<V, E>,
    ) -> Result<V, E>
    where
        T: Clone + PartialEq,
        P: Fn(&T) -> bool,
        R: RemoteCall<V, E>,
        E: std::fmt::Debug,
    {
        let written = replacement.clone();
        let previous: Mutex<Option<(usize, T)>> = Mutex::new(None);
        self.updater
            .update(
                || {
                    let mut items = self.lock();
                    if let Some(idx) = items.iter().position(|item| pred(item)) {
                        let old = std::mem::replace(&mut items[idx], replacement);
                        *lock_slot(&previous) = Some((idx, old));
                    }
                },
                remote,
                || {
                    if let Some((idx, old)) = lock_slot(&previous).take() {
                        let mut items = self.lock();
                        let at = if items.get(idx) == Some(&written) {
                            Some(idx)
                        } else {
                            items.iter().position(|item| *item == written)
                        };
                        if let Some(at) = at {
                            items[at] = old;
                        }
                    }
                },
                callbacks,
            )
            .await
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_slot<S>(slot: &Mutex<S>) -> MutexGuard<'_, S> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    #[tokio::test]
    async fn success_calls_on_success_only() {
        let log: Log = Arc::default();
        let (l1, l2, l3, l4, l5) = (log.clone(), log.clone(), log.clone(), log.clone(), log.clone());

        let result = OptimisticUpdater::new()
            .update(
                move || push(&l1, "mutate"),
                move || async move {
                    push(&l2, "remote");
                    Ok::<_, String>(42)
                },
                move || push(&l3, "rollback"),
                UpdateCallbacks::new()
                    .on_success(move |v: &i32| push(&l4, format!("success {}", v)))
                    .on_error(move |e: &String| push(&l5, format!("error {}", e))),
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["mutate".to_string(), "remote".into(), "success 42".into()]
        );
    }

    #[tokio::test]
    async fn failure_rolls_back_then_reports_and_returns_error() {
        let log: Log = Arc::default();
        let (l1, l2, l3, l4, l5) = (log.clone(), log.clone(), log.clone(), log.clone(), log.clone());

        let result = OptimisticUpdater::named("delete_item")
            .update(
                move || push(&l1, "mutate"),
                move || async move {
                    push(&l2, "remote");
                    Err::<i32, _>("network down".to_string())
                },
                move || push(&l3, "rollback"),
                UpdateCallbacks::new()
                    .on_success(move |v: &i32| push(&l4, format!("success {}", v)))
                    .on_error(move |e: &String| push(&l5, format!("error {}", e))),
            )
            .await;

        assert_eq!(result, Err("network down".to_string()));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "mutate".to_string(),
                "remote".into(),
                "rollback".into(),
                "error network down".into()
            ]
        );
    }

    #[tokio::test]
    async fn mutation_is_visible_before_remote_runs() {
        let state = Arc::new(Mutex::new(vec![1, 2, 3]));
        let (s1, s2, s3) = (state.clone(), state.clone(), state.clone());

        let seen = update(
            move || s1.lock().unwrap().retain(|x| *x != 2),
            move || async move { Ok::<_, ()>(s2.lock().unwrap().clone()) },
            move || s3.lock().unwrap().insert(1, 2),
        )
        .await
        .unwrap();

        assert_eq!(seen, vec![1, 3]);
        assert_eq!(*state.lock().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn callbacks_are_optional() {
        let rolled_back = Arc::new(Mutex::new(false));
        let flag = rolled_back.clone();
        let err = update(|| {}, || async { Err::<(), _>("boom") }, move || {
            *flag.lock().unwrap() = true;
        })
        .await
        .unwrap_err();
        assert_eq!(err, "boom");
        assert!(*rolled_back.lock().unwrap());
    }

    #[tokio::test]
    async fn list_remove_restores_position_on_failure() {
        let list = OptimisticList::from(vec!["coat", "scarf", "boots"]);
        let err = list
            .remove_where(
                |item| *item == "scarf",
                || async { Err::<(), _>("delete failed") },
                UpdateCallbacks::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, "delete failed");
        assert_eq!(list.snapshot(), vec!["coat", "scarf", "boots"]);
    }

    #[tokio::test]
    async fn list_remove_keeps_change_on_success() {
        let list = OptimisticList::from(vec!["coat", "scarf", "boots"]);
        let observer = list.clone();
        let removed = list
            .remove_where(
                |item| *item == "coat",
                move || async move { Ok::<_, ()>(observer.len()) },
                UpdateCallbacks::new(),
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(list.snapshot(), vec!["scarf", "boots"]);
    }

    #[tokio::test]
    async fn list_remove_without_match_leaves_list_alone() {
        let list = OptimisticList::from(vec![1, 2]);
        let _ = list
            .remove_where(|x| *x == 9, || async { Err::<(), _>(()) }, UpdateCallbacks::new())
            .await;
        assert_eq!(list.snapshot(), vec![1, 2]);
    }

    #[tokio::test]
    async fn list_push_rolls_back() {
        let list = OptimisticList::from(vec!["hat"]);
        let _ = list
            .push("gloves", || async { Err::<(), _>("quota") }, UpdateCallbacks::new())
            .await;
        assert_eq!(list.snapshot(), vec!["hat"]);

        list.push("gloves", || async { Ok::<_, ()>(()) }, UpdateCallbacks::new())
            .await
            .unwrap();
        assert_eq!(list.snapshot(), vec!["hat", "gloves"]);
    }

    #[tokio::test]
    async fn failed_push_keeps_items_confirmed_meanwhile() {
        let list = OptimisticList::from(vec!["a"]);
        let other = list.clone();
        let (release, held) = tokio::sync::oneshot::channel::<()>();

        let (failed, ()) = tokio::join!(
            list.push(
                "b",
                move || async move {
                    let _ = held.await;
                    Err::<(), _>("upload failed")
                },
                UpdateCallbacks::new(),
            ),
            async move {
                other
                    .remove_where(|x| *x == "a", || async { Ok::<_, ()>(()) }, UpdateCallbacks::new())
                    .await
                    .unwrap();
                other
                    .push("c", || async { Ok::<_, ()>(()) }, UpdateCallbacks::new())
                    .await
                    .unwrap();
                assert_eq!(other.snapshot(), vec!["b", "c"]);
                release.send(()).unwrap();
            }
        );

        assert_eq!(failed.unwrap_err(), "upload failed");
        assert_eq!(list.snapshot(), vec!["c"]);
    }

    #[tokio::test]
    async fn failed_replace_follows_shifted_item() {
        let list = OptimisticList::from(vec![("outfit-1", 3), ("outfit-2", 4)]);
        let other = list.clone();
        let (release, held) = tokio::sync::oneshot::channel::<()>();

        let (failed, ()) = tokio::join!(
            list.replace_where(
                |(id, _)| *id == "outfit-2",
                ("outfit-2", 5),
                move || async move {
                    let _ = held.await;
                    Err::<(), _>("rating rejected")
                },
                UpdateCallbacks::new(),
            ),
            async move {
                other
                    .remove_where(
                        |(id, _)| *id == "outfit-1",
                        || async { Ok::<_, ()>(()) },
                        UpdateCallbacks::new(),
                    )
                    .await
                    .unwrap();
                release.send(()).unwrap();
            }
        );

        assert!(failed.is_err());
        assert_eq!(list.snapshot(), vec![("outfit-2", 4)]);
    }

    #[tokio::test]
    async fn list_edits_run_on_spawned_tasks() {
        let list = OptimisticList::from(vec!["hat".to_string()]);
        let toasts: Log = Arc::default();
        let toasts_cl = toasts.clone();

        let task = {
            let list = list.clone();
            tokio::spawn(async move {
                list.push(
                    "gloves".to_string(),
                    || async { Err::<(), _>("quota".to_string()) },
                    UpdateCallbacks::new().on_error(move |e: &String| push(&toasts_cl, e.clone())),
                )
                .await
            })
        };

        assert_eq!(task.await.unwrap(), Err("quota".to_string()));
        assert_eq!(list.snapshot(), vec!["hat".to_string()]);
        assert_eq!(*toasts.lock().unwrap(), vec!["quota".to_string()]);
    }

    #[tokio::test]
    async fn list_replace_restores_old_value() {
        let list = OptimisticList::from(vec![("outfit-1", 3), ("outfit-2", 4)]);
        let _ = list
            .replace_where(
                |(id, _)| *id == "outfit-2",
                ("outfit-2", 5),
                || async { Err::<(), _>("rating rejected") },
                UpdateCallbacks::new(),
            )
            .await;
        assert_eq!(list.snapshot(), vec![("outfit-1", 3), ("outfit-2", 4)]);

        list.replace_where(
            |(id, _)| *id == "outfit-2",
            ("outfit-2", 5),
            || async { Ok::<_, ()>(()) },
            UpdateCallbacks::new(),
        )
        .await
        .unwrap();
        assert_eq!(list.snapshot(), vec![("outfit-1", 3), ("outfit-2", 5)]);
    }
}
