//! Live views over the store.
//!
//! Every delivery is a complete snapshot that replaces the previous one.
//! Snapshots of one subscription arrive in change order, and a reader that
//! falls behind skips straight to the newest one. There is no ordering
//! between different subscriptions.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use futures::task::AtomicWaker;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::{ChangeFeedClosedSnafu, StorageError, StorageResult};
use super::ids::{ConversationId, UserId};
use super::types::{ContactRecord, ConversationRecord, MessageRecord, StoreChange};
use super::{BoxFuture, ChangeFeed, ContactStore, ConversationStore, Storage};

#[derive(Debug)]
pub enum LiveEvent<T> {
    Snapshot(T),
    /// Terminal; the subscription yields nothing after this.
    Failed(StorageError),
}

/// Holds at most one undelivered event. A newer snapshot replaces the pending one;
/// a pending failure is never replaced.
struct LatestSlot<T> {
    state: Mutex<SlotState<T>>,
    waker: AtomicWaker,
}

struct SlotState<T> {
    pending: Option<LiveEvent<T>>,
    sender_gone: bool,
    receiver_gone: bool,
}

impl<T> LatestSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                sender_gone: false,
                receiver_gone: false,
            }),
            waker: AtomicWaker::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct EventSender<T> {
    slot: Arc<LatestSlot<T>>,
}

impl<T> EventSender<T> {
    /// Returns `false` once the receiving side is gone.
    fn send(&self, event: LiveEvent<T>) -> bool {
        {
            let mut state = self.slot.lock();
            if state.receiver_gone {
                return false;
            }
            if !matches!(state.pending, Some(LiveEvent::Failed(_))) {
                state.pending = Some(event);
            }
        }
        self.slot.waker.wake();
        true
    }
}

impl<T> Drop for EventSender<T> {
    fn drop(&mut self) {
        self.slot.lock().sender_gone = true;
        self.slot.waker.wake();
    }
}

/// Receiving end of a live view.
///
/// A slow reader never accumulates a backlog: only the newest undelivered
/// snapshot is kept, and it is always a complete state.
pub struct Subscription<T> {
    slot: Arc<LatestSlot<T>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    fn poll_event(&self, cx: &mut Context<'_>) -> Poll<Option<LiveEvent<T>>> {
        self.slot.waker.register(cx.waker());

        let mut state = self.slot.lock();
        if let Some(event) = state.pending.take() {
            return Poll::Ready(Some(event));
        }
        if state.sender_gone || state.receiver_gone {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }

    pub async fn recv(&mut self) -> Option<LiveEvent<T>> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent<T>> {
        self.slot.lock().pending.take()
    }

    /// Next snapshot, `Ok(None)` once the subscription has ended.
    pub async fn next_snapshot(&mut self) -> StorageResult<Option<T>> {
        match self.recv().await {
            Some(LiveEvent::Snapshot(snapshot)) => Ok(Some(snapshot)),
            Some(LiveEvent::Failed(error)) => Err(error),
            None => Ok(None),
        }
    }

    /// Stops deliveries. Returns `false` when already cancelled.
    ///
    /// A pending snapshot is discarded, so nothing is observable after this returns.
    pub fn cancel(&mut self) -> bool {
        let was_active = self
            .cancel_tx
            .take()
            .map(|tx| {
                let _ = tx.send(());
                true
            })
            .unwrap_or(false);

        let mut state = self.slot.lock();
        state.receiver_gone = true;
        state.pending = None;
        was_active
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_tx.is_none()
    }

    /// Maps every snapshot through `transform`; failures pass through unchanged.
    pub fn then<U, F>(self, mut transform: F) -> Subscription<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnMut(T) -> BoxFuture<'static, U> + Send + 'static,
    {
        let (event_tx, subscription, mut cancel_rx) = make_subscription();
        let mut upstream = self;

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    event = upstream.recv() => event,
                };

                let mapped = match event {
                    Some(LiveEvent::Snapshot(snapshot)) => {
                        tokio::select! {
                            biased;
                            _ = &mut cancel_rx => break,
                            mapped = transform(snapshot) => LiveEvent::Snapshot(mapped),
                        }
                    }
                    Some(LiveEvent::Failed(error)) => {
                        event_tx.send(LiveEvent::Failed(error));
                        break;
                    }
                    None => break,
                };

                if !event_tx.send(mapped) {
                    break;
                }
            }
        });

        subscription
    }
}

impl<T> Unpin for Subscription<T> {}

impl<T> Stream for Subscription<T> {
    type Item = LiveEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_event(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
        self.slot.lock().receiver_gone = true;
    }
}

fn make_subscription<T>() -> (EventSender<T>, Subscription<T>, oneshot::Receiver<()>) {
    let slot = Arc::new(LatestSlot::new());
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        EventSender { slot: slot.clone() },
        Subscription {
            slot,
            cancel_tx: Some(cancel_tx),
        },
        cancel_rx,
    )
}

/// Spawns a worker that reloads `load` for every change matching `is_relevant`.
///
/// The feed is joined before the first load so no change between the two is lost.
pub fn spawn_live_view<F, T, R, L>(
    feed: &F,
    view: &'static str,
    is_relevant: R,
    mut load: L,
) -> Subscription<T>
where
    F: ChangeFeed + ?Sized,
    T: Clone + PartialEq + Send + 'static,
    R: Fn(&StoreChange) -> bool + Send + 'static,
    L: FnMut() -> BoxFuture<'static, StorageResult<T>> + Send + 'static,
{
    let mut changes = feed.subscribe_changes();
    let (event_tx, subscription, mut cancel_rx) = make_subscription();

    tokio::spawn(async move {
        let mut last_delivered: Option<T> = None;
        let mut reload = true;

        loop {
            if reload {
                let loaded = tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    loaded = load() => loaded,
                };

                match loaded {
                    Ok(snapshot) => {
                        if last_delivered.as_ref() != Some(&snapshot) {
                            if !event_tx.send(LiveEvent::Snapshot(snapshot.clone())) {
                                break;
                            }
                            last_delivered = Some(snapshot);
                        }
                    }
                    Err(error) => {
                        warn!(view, %error, "live view reload failed, ending subscription");
                        event_tx.send(LiveEvent::Failed(error));
                        break;
                    }
                }
            }

            let change = tokio::select! {
                biased;
                _ = &mut cancel_rx => break,
                change = changes.recv() => change,
            };

            reload = match change {
                Ok(change) => is_relevant(&change),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(view, skipped, "live view lagged behind change feed, reloading");
                    true
                }
                Err(RecvError::Closed) => {
                    event_tx.send(LiveEvent::Failed(
                        ChangeFeedClosedSnafu { stage: view }.build(),
                    ));
                    break;
                }
            };
        }

        debug!(view, "live view worker stopped");
    });

    subscription
}

pub fn subscribe_messages(
    storage: Arc<dyn Storage>,
    conversation_id: ConversationId,
) -> Subscription<Vec<MessageRecord>> {
    let watched = conversation_id.clone();
    let feed = storage.clone();
    spawn_live_view(
        feed.as_ref(),
        "live-messages",
        move |change| {
            matches!(change, StoreChange::Message { conversation_id } if *conversation_id == watched)
        },
        move || {
            let storage = storage.clone();
            let conversation_id = conversation_id.clone();
            Box::pin(async move { storage.list_messages(&conversation_id).await })
        },
    )
}

pub fn subscribe_conversations_for(
    storage: Arc<dyn Storage>,
    user_id: UserId,
) -> Subscription<Vec<ConversationRecord>> {
    let watched = user_id.clone();
    let feed = storage.clone();
    spawn_live_view(
        feed.as_ref(),
        "live-conversations",
        move |change| {
            matches!(change, StoreChange::Conversation { participant_ids, .. } if participant_ids.contains(&watched))
        },
        move || {
            let storage = storage.clone();
            let user_id = user_id.clone();
            Box::pin(async move { storage.list_conversations_for(&user_id).await })
        },
    )
}

pub fn subscribe_contacts(
    storage: Arc<dyn Storage>,
    owner_id: UserId,
) -> Subscription<Vec<ContactRecord>> {
    let watched = owner_id.clone();
    let feed = storage.clone();
    spawn_live_view(
        feed.as_ref(),
        "live-contacts",
        move |change| matches!(change, StoreChange::Contact { owner_id } if *owner_id == watched),
        move || {
            let storage = storage.clone();
            let owner_id = owner_id.clone();
            Box::pin(async move { storage.list_contacts(&owner_id).await })
        },
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::broadcast;

    use super::*;
    use crate::sqlite::SqliteStorage;
    use crate::types::{NewMessage, SummaryUpdate};
    use crate::{ConversationStore, StorageErrorKind, derive_conversation_id};

    async fn memory_store() -> Arc<dyn Storage> {
        Arc::new(SqliteStorage::open(":memory:").await.unwrap())
    }

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    async fn next<T>(subscription: &mut Subscription<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), subscription.next_snapshot())
            .await
            .expect("snapshot within timeout")
            .expect("subscription not failed")
            .expect("subscription still open")
    }

    async fn send(storage: &Arc<dyn Storage>, from: &str, to: &str, text: &str) -> MessageRecord {
        let conversation_id = derive_conversation_id(&user(from), &user(to)).unwrap();
        storage
            .upsert_summary(
                &conversation_id,
                SummaryUpdate::for_participants(user(from), user(to)).with_last_message(text),
            )
            .await
            .unwrap();
        storage
            .append_message(&conversation_id, NewMessage::new(user(from), user(to), text))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn message_view_delivers_initial_and_updated_snapshots() {
        let storage = memory_store().await;
        let conversation_id = derive_conversation_id(&user("u1"), &user("u2")).unwrap();
        let mut subscription = subscribe_messages(storage.clone(), conversation_id);

        assert!(next(&mut subscription).await.is_empty());

        send(&storage, "u1", "u2", "hi").await;
        let mut snapshot = next(&mut subscription).await;
        while snapshot.is_empty() {
            snapshot = next(&mut subscription).await;
        }
        assert_eq!(snapshot[0].text, "hi");

        send(&storage, "u2", "u1", "there").await;
        let mut snapshot = next(&mut subscription).await;
        while snapshot.len() < 2 {
            snapshot = next(&mut subscription).await;
        }
        let texts = snapshot.iter().map(|m| m.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, ["there", "hi"]);
    }

    #[tokio::test]
    async fn conversation_view_only_contains_own_conversations() {
        let storage = memory_store().await;
        let mut subscription = subscribe_conversations_for(storage.clone(), user("u1"));
        assert!(next(&mut subscription).await.is_empty());

        send(&storage, "u2", "u3", "not for u1").await;
        send(&storage, "u2", "u1", "for u1").await;

        let mut snapshot = next(&mut subscription).await;
        while snapshot.is_empty() {
            snapshot = next(&mut subscription).await;
        }
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.iter().all(|conversation| conversation.includes(&user("u1"))));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_silences_deliveries() {
        let storage = memory_store().await;
        let conversation_id = derive_conversation_id(&user("u1"), &user("u2")).unwrap();
        let mut subscription = subscribe_messages(storage.clone(), conversation_id);
        next(&mut subscription).await;

        assert!(subscription.cancel());
        assert!(!subscription.cancel());
        assert!(subscription.is_cancelled());

        send(&storage, "u1", "u2", "after cancel").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(subscription.try_recv().is_none());
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_reader_holds_only_the_latest_snapshot() {
        let storage = memory_store().await;
        let conversation_id = derive_conversation_id(&user("u1"), &user("u2")).unwrap();
        let mut subscription = subscribe_messages(storage.clone(), conversation_id);
        assert!(next(&mut subscription).await.is_empty());

        for index in 0..100 {
            send(&storage, "u1", "u2", &format!("message {index}")).await;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let pending = match subscription.try_recv() {
            Some(LiveEvent::Snapshot(snapshot)) => snapshot,
            other => panic!("expected one pending snapshot, got {other:?}"),
        };
        assert_eq!(pending.len(), 100);
        assert_eq!(pending[0].text, "message 99");
        assert!(subscription.try_recv().is_none());

        send(&storage, "u2", "u1", "one more").await;
        let snapshot = next(&mut subscription).await;
        assert_eq!(snapshot.len(), 101);
        assert_eq!(snapshot[0].text, "one more");
    }

    struct DetachedFeed {
        sender: broadcast::Sender<StoreChange>,
    }

    impl ChangeFeed for DetachedFeed {
        fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
            self.sender.subscribe()
        }
    }

    #[tokio::test]
    async fn closed_feed_terminates_with_error() {
        let (sender, _) = broadcast::channel(4);
        let feed = DetachedFeed { sender };
        let mut subscription = spawn_live_view(
            &feed,
            "test-detached",
            |_| true,
            || Box::pin(async { Ok(Vec::<u8>::new()) }),
        );
        assert!(next(&mut subscription).await.is_empty());

        drop(feed);
        let error = tokio::time::timeout(Duration::from_secs(5), subscription.next_snapshot())
            .await
            .expect("terminal event within timeout")
            .unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::StoreUnavailable);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn mapped_subscription_forwards_snapshots() {
        let storage = memory_store().await;
        let conversation_id = derive_conversation_id(&user("u1"), &user("u2")).unwrap();
        let mut counts = subscribe_messages(storage.clone(), conversation_id)
            .then(|messages| Box::pin(async move { messages.len() }));

        assert_eq!(next(&mut counts).await, 0);
        send(&storage, "u1", "u2", "hello").await;
        let mut count = next(&mut counts).await;
        while count == 0 {
            count = next(&mut counts).await;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn failed_event_carries_error_kind() {
        let event: LiveEvent<()> =
            LiveEvent::Failed(ChangeFeedClosedSnafu { stage: "test" }.build());
        match event {
            LiveEvent::Failed(error) => {
                assert_eq!(error.kind(), StorageErrorKind::StoreUnavailable)
            }
            LiveEvent::Snapshot(()) => panic!("expected failure"),
        }
    }
}
