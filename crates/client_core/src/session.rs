use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use chrono::Utc;
use shared::{
    domain::{ConversationKey, Message, MessageId, PresenceEntry, UserId, UserProfile},
    protocol::{ChannelNames, PushEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{BackendApi, HttpBackend},
    config::ClientSettings,
    error::{SyncError, SyncResult},
    inbox::{InboxAggregator, InboxChange, InboxRow},
    message_store::MessageStore,
    pagination::{PageRequest, PaginationController, PaginationCursor},
    presence::PresenceTracker,
    pusher::PusherTransport,
    read_receipts::ReadReceiptSync,
    send_pipeline::{PendingSend, SendPipeline, SendState},
    session_store::{AccessToken, SessionSnapshot, SessionStore},
    subscriptions::{
        ChannelNotice, ChannelSubscriptionManager, PushTransport, SubscriptionContext,
        SubscriptionState,
    },
    typing::{TypingSignal, TypingTimer},
    ClientEvent,
};

/// Header data for the open conversation. Live presence wins over the
/// backend's `isOnline` once the broker delivered a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterpartView {
    pub profile: UserProfile,
    pub online: bool,
}

impl CounterpartView {
    fn new(profile: UserProfile, presence: &PresenceTracker) -> Self {
        let online = if presence.has_snapshot() {
            presence.is_online(&profile.id)
        } else {
            profile.is_online
        };
        Self { profile, online }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FriendChange {
    Add,
    Remove,
}

/// Captured when a request is issued and checked when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextGuard {
    generation: u64,
    epoch: u64,
}

struct ActiveConversation {
    key: ConversationKey,
    counterpart: Option<UserProfile>,
}

struct SessionState {
    generation: u64,
    epoch: u64,
    logged_out: bool,
    active: Option<ActiveConversation>,
    stores: HashMap<ConversationKey, MessageStore>,
    cursors: HashMap<ConversationKey, PaginationController>,
    send: SendPipeline,
    presence: PresenceTracker,
    typing: TypingSignal,
    typing_timer: Option<JoinHandle<()>>,
    receipts: ReadReceiptSync,
    inbox: InboxAggregator,
    last_error: Option<SyncError>,
}

impl SessionState {
    fn guard(&self) -> ContextGuard {
        ContextGuard {
            generation: self.generation,
            epoch: self.epoch,
        }
    }

    fn check_current(&self, guard: ContextGuard) -> SyncResult<()> {
        if self.guard() == guard {
            Ok(())
        } else {
            Err(SyncError::StaleContext)
        }
    }

    fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref().map(|active| &active.key)
    }

    fn store_mut(&mut self, key: &ConversationKey) -> &mut MessageStore {
        self.stores
            .entry(key.clone())
            .or_insert_with(|| MessageStore::new(key.clone()))
    }

    fn active_cursor_mut(&mut self) -> Option<&mut PaginationController> {
        let key = self.active.as_ref()?.key.clone();
        self.cursors.get_mut(&key)
    }

    fn cancel_typing_timer(&mut self) {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
    }
}

/// Everything one logged-in identity needs: stores, presence, inbox and the
/// push subscriptions feeding them. Created on login, torn down on logout
/// or drop.
pub struct ChatSession {
    settings: ClientSettings,
    local_user: UserProfile,
    token: AccessToken,
    backend: Arc<dyn BackendApi>,
    session_store: Arc<dyn SessionStore>,
    inner: Mutex<SessionState>,
    subscriptions: Mutex<ChannelSubscriptionManager>,
    subscription_state: watch::Receiver<SubscriptionState>,
    presence_view: watch::Receiver<Vec<PresenceEntry>>,
    events: broadcast::Sender<ClientEvent>,
    dispatcher: JoinHandle<()>,
}

impl ChatSession {
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: ClientSettings,
        snapshot: SessionSnapshot,
        backend: Arc<dyn BackendApi>,
        transport: Arc<dyn PushTransport>,
        session_store: Arc<dyn SessionStore>,
    ) -> Arc<Self> {
        let SessionSnapshot {
            access_token,
            user: local_user,
        } = snapshot;
        let (events, _) = broadcast::channel(1024);
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let subscriptions = ChannelSubscriptionManager::new(transport, &settings, notices);
        let subscription_state = subscriptions.watch_state();
        let presence = PresenceTracker::new();
        let presence_view = presence.subscribe();
        let state = SessionState {
            generation: 0,
            epoch: 0,
            logged_out: false,
            active: None,
            stores: HashMap::new(),
            cursors: HashMap::new(),
            send: SendPipeline::new(local_user.id.clone()),
            presence,
            typing: TypingSignal::new(settings.typing_quiet_period()),
            typing_timer: None,
            receipts: ReadReceiptSync::new(),
            inbox: InboxAggregator::new(local_user.id.clone()),
            last_error: None,
        };

        Arc::new_cyclic(|weak| Self {
            dispatcher: tokio::spawn(dispatch_notices(weak.clone(), notice_rx)),
            settings,
            local_user,
            token: access_token,
            backend,
            session_store,
            inner: Mutex::new(state),
            subscriptions: Mutex::new(subscriptions),
            subscription_state,
            presence_view,
            events,
        })
    }

    /// Rebuilds a session from the persisted snapshot with the HTTP backend
    /// and the Pusher transport.
    pub fn restore(
        settings: ClientSettings,
        session_store: Arc<dyn SessionStore>,
    ) -> SyncResult<Arc<Self>> {
        let snapshot = match session_store.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Err(SyncError::NotAuthenticated),
            Err(err) => {
                warn!(error = %err, "session: persisted session unreadable");
                return Err(SyncError::NotAuthenticated);
            }
        };
        let backend = HttpBackend::new(&settings.api_base_url, snapshot.access_token.clone())?;
        let transport = PusherTransport::new(&settings);
        Ok(Self::new(
            settings,
            snapshot,
            Arc::new(backend),
            Arc::new(transport),
            session_store,
        ))
    }

    pub fn local_user(&self) -> &UserProfile {
        &self.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn presence(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.presence_view.clone()
    }

    pub fn online_friends(&self) -> Vec<PresenceEntry> {
        self.presence_view.borrow().clone()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        *self.subscription_state.borrow()
    }

    pub async fn messages(&self, key: &ConversationKey) -> Vec<Message> {
        let state = self.inner.lock().await;
        state
            .stores
            .get(key)
            .map(|store| store.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn inbox_rows(&self) -> Vec<InboxRow> {
        let state = self.inner.lock().await;
        state.inbox.rows(&state.presence)
    }

    pub async fn active_conversation(&self) -> Option<ConversationKey> {
        self.inner.lock().await.active_key().cloned()
    }

    pub async fn counterpart(&self) -> Option<CounterpartView> {
        let state = self.inner.lock().await;
        let profile = state.active.as_ref()?.counterpart.clone()?;
        Some(CounterpartView::new(profile, &state.presence))
    }

    pub async fn pagination_cursor(&self) -> Option<PaginationCursor> {
        let state = self.inner.lock().await;
        let key = state.active_key()?;
        state.cursors.get(key).map(|pagination| pagination.cursor().clone())
    }

    pub async fn is_typing(&self) -> bool {
        self.inner.lock().await.typing.is_typing()
    }

    pub async fn send_state(&self, temp_id: &MessageId) -> Option<SendState> {
        self.inner.lock().await.send.state(temp_id)
    }

    pub async fn last_error(&self) -> Option<SyncError> {
        self.inner.lock().await.last_error.clone()
    }

    /// Loads the inbox and friend list, then subscribes. Read failures are
    /// surfaced as events and leave whatever already loaded in place.
    pub async fn start(self: &Arc<Self>) -> SyncResult<()> {
        let generation = {
            let state = self.inner.lock().await;
            if state.logged_out {
                return Err(SyncError::NotAuthenticated);
            }
            state.generation
        };
        info!(user = %self.local_user.id, "session: starting");

        let (inbox, friends) =
            tokio::join!(self.backend.fetch_inbox(), self.backend.fetch_friends());
        {
            let mut lock = self.inner.lock().await;
            if lock.generation != generation {
                debug!("session: discarding startup snapshot after logout");
                return Ok(());
            }
            let state = &mut *lock;
            match friends {
                Ok(friends) => {
                    state.presence.set_friends(&friends);
                    state.inbox.set_friends(friends);
                }
                Err(err) => {
                    state.presence.resolve_friends(Err(err.clone()));
                    self.surface(state, err);
                }
            }
            match inbox {
                Ok(items) => state.inbox.load_snapshot(items),
                Err(err) => self.surface(state, err),
            }
            self.publish_inbox(state);
        }

        self.refresh_subscriptions().await;
        Ok(())
    }

    /// Makes `peer` the active conversation: fresh context, first history
    /// page, counterpart profile, then a read receipt.
    pub async fn open_conversation(self: &Arc<Self>, peer: ConversationKey) -> SyncResult<()> {
        let (request, guard) = {
            let mut lock = self.inner.lock().await;
            let state = &mut *lock;
            if state.logged_out {
                return Err(SyncError::NotAuthenticated);
            }
            if peer == self.local_user.id {
                return Err(SyncError::InvalidInput(
                    "cannot open a conversation with yourself".into(),
                ));
            }
            state.cancel_typing_timer();
            state.epoch += 1;

            let known = state
                .inbox
                .get(&peer)
                .map(|summary| summary.participant.clone())
                .or_else(|| {
                    state
                        .inbox
                        .friends()
                        .iter()
                        .find(|friend| friend.id == peer)
                        .cloned()
                });
            let page_size = self.settings.page_size;
            let pagination = state
                .cursors
                .entry(peer.clone())
                .or_insert_with(|| PaginationController::new(peer.clone(), page_size));
            // A fetch left over from an earlier visit is discarded as stale.
            pagination.abort();
            let request = pagination.refresh();
            state.active = Some(ActiveConversation {
                key: peer.clone(),
                counterpart: known,
            });
            state.store_mut(&peer);
            state.typing.set_counterpart(Some(peer.clone()));
            (request, state.guard())
        };
        info!(peer = %peer, "session: conversation opened");
        self.emit(ClientEvent::MessagesUpdated {
            conversation: peer.clone(),
        });

        self.refresh_subscriptions().await;

        let first_page = async {
            match request {
                Some(request) => self.load_page(request, guard).await,
                None => Ok(()),
            }
        };
        let (page, ()) = tokio::join!(first_page, self.resolve_counterpart(peer, guard));
        page
    }

    pub async fn close_conversation(self: &Arc<Self>) {
        {
            let mut state = self.inner.lock().await;
            if let Some(pagination) = state.active_cursor_mut() {
                pagination.abort();
            }
            if state.active.take().is_none() {
                return;
            }
            state.epoch += 1;
            state.typing.set_counterpart(None);
            state.cancel_typing_timer();
        }
        debug!("session: conversation closed");
        self.refresh_subscriptions().await;
    }

    /// Fetches the next older page of the active conversation. Returns
    /// whether a request was issued.
    pub async fn load_older(self: &Arc<Self>) -> SyncResult<bool> {
        let (request, guard) = {
            let mut lock = self.inner.lock().await;
            let guard = lock.guard();
            let Some(pagination) = lock.active_cursor_mut() else {
                return Ok(false);
            };
            let Some(request) = pagination.begin() else {
                return Ok(false);
            };
            (request, guard)
        };
        self.load_page(request, guard).await?;
        Ok(true)
    }

    /// Scroll hook: loads older history once the viewport nears the top.
    pub async fn on_scroll(self: &Arc<Self>, scroll_top: f32) -> SyncResult<bool> {
        let trigger = {
            let state = self.inner.lock().await;
            state
                .active_key()
                .and_then(|key| state.cursors.get(key))
                .is_some_and(|pagination| {
                    pagination.should_trigger(scroll_top, self.settings.scroll_top_threshold)
                })
        };
        if !trigger {
            return Ok(false);
        }
        self.load_older().await
    }

    /// Appends an optimistic message and delivers it in the background.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> SyncResult<MessageId> {
        let (pending, generation) = {
            let mut lock = self.inner.lock().await;
            let state = &mut *lock;
            if state.logged_out {
                return Err(SyncError::NotAuthenticated);
            }
            let Some(key) = state.active_key().cloned() else {
                return Err(SyncError::InvalidInput("no conversation is open".into()));
            };
            let store = state
                .stores
                .entry(key.clone())
                .or_insert_with(|| MessageStore::new(key));
            let pending = state.send.submit(text, store, Utc::now())?;
            (pending, state.generation)
        };

        let conversation = pending.receiver_id.clone();
        self.emit(ClientEvent::MessagesUpdated {
            conversation: conversation.clone(),
        });
        self.emit(ClientEvent::ScrollToLatest { conversation });

        let temp_id = pending.temp_id.clone();
        tokio::spawn(Arc::clone(self).deliver(pending, generation));
        Ok(temp_id)
    }

    /// Resends a failed message under its original temporary id.
    pub async fn retry_failed(self: &Arc<Self>, temp_id: &MessageId) -> SyncResult<()> {
        let (pending, generation) = {
            let mut lock = self.inner.lock().await;
            let state = &mut *lock;
            if state.logged_out {
                return Err(SyncError::NotAuthenticated);
            }
            let Some(store) = state
                .stores
                .values_mut()
                .find(|store| store.get(temp_id).is_some())
            else {
                return Err(SyncError::InvalidInput(format!("no message with id {temp_id}")));
            };
            let Some(pending) = state.send.retry(temp_id, store) else {
                return Err(SyncError::InvalidInput(format!(
                    "message {temp_id} is not in a failed state"
                )));
            };
            (pending, state.generation)
        };
        info!(temp_id = %temp_id, "send: retrying failed message");
        self.emit(ClientEvent::MessagesUpdated {
            conversation: pending.receiver_id.clone(),
        });
        tokio::spawn(Arc::clone(self).deliver(pending, generation));
        Ok(())
    }

    /// Broadcasts a typing signal to the counterpart. Returns whether one
    /// was sent.
    pub async fn on_keystroke(self: &Arc<Self>, is_send_action: bool) -> SyncResult<bool> {
        let peer = {
            let state = self.inner.lock().await;
            if state.logged_out {
                return Ok(false);
            }
            state.typing.on_keystroke(is_send_action).cloned()
        };
        let Some(peer) = peer else {
            return Ok(false);
        };
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .notify_peer(&ChannelNames::typing_event_for(&peer), &self.local_user.id)
            .await
    }

    pub async fn add_friend(self: &Arc<Self>, id: UserId) -> SyncResult<()> {
        self.change_friend(id, FriendChange::Add).await
    }

    pub async fn remove_friend(self: &Arc<Self>, id: UserId) -> SyncResult<()> {
        self.change_friend(id, FriendChange::Remove).await
    }

    /// Applies a friend-list change server-side, then re-derives who shows
    /// as online from the edited list.
    async fn change_friend(self: &Arc<Self>, id: UserId, change: FriendChange) -> SyncResult<()> {
        if id == self.local_user.id {
            return Err(SyncError::InvalidInput("cannot befriend yourself".into()));
        }
        let (generation, known) = {
            let state = self.inner.lock().await;
            if state.logged_out {
                return Err(SyncError::NotAuthenticated);
            }
            let known = state
                .inbox
                .get(&id)
                .map(|summary| summary.participant.clone())
                .or_else(|| state.inbox.friends().iter().find(|f| f.id == id).cloned());
            (state.generation, known)
        };

        let result = match change {
            FriendChange::Add => self.backend.add_friend(&id).await,
            FriendChange::Remove => self.backend.remove_friend(&id).await,
        };
        if let Err(err) = result {
            let mut state = self.inner.lock().await;
            self.surface(&mut state, err.clone());
            return Err(err);
        }

        let added = match (change, known) {
            (FriendChange::Remove, _) => None,
            (FriendChange::Add, Some(profile)) => Some(profile),
            (FriendChange::Add, None) => Some(match self.backend.fetch_user(&id).await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(id = %id, error = %err, "session: new friend's profile unavailable");
                    UserProfile::unresolved(id.clone())
                }
            }),
        };

        let mut lock = self.inner.lock().await;
        if lock.generation != generation {
            return Ok(());
        }
        let state = &mut *lock;
        let mut friends = state.inbox.friends().to_vec();
        friends.retain(|friend| friend.id != id);
        friends.extend(added);
        if !state.presence.is_degraded() {
            state.presence.set_friends(&friends);
        }
        info!(id = %id, ?change, friends = friends.len(), "session: friend list changed");
        state.inbox.set_friends(friends);
        self.publish_presence(state);
        Ok(())
    }

    /// Invalidates the credential server-side, tears down channels and
    /// presence and clears the persisted session. Every later completion is
    /// discarded.
    pub async fn logout(self: &Arc<Self>) {
        {
            let mut lock = self.inner.lock().await;
            if lock.logged_out {
                return;
            }
            let state = &mut *lock;
            state.logged_out = true;
            state.generation += 1;
            state.epoch += 1;
            state.active = None;
            state.typing.set_counterpart(None);
            state.cancel_typing_timer();
            state.receipts.clear();
            state.presence.clear();
        }

        if let Err(err) = self.backend.logout().await {
            warn!(error = %err, "session: server logout failed");
        }
        self.subscriptions.lock().await.teardown().await;
        if let Err(err) = self.session_store.clear() {
            warn!(error = %err, "session: failed to clear persisted session");
        }
        info!(user = %self.local_user.id, "session: logged out");
        self.emit(ClientEvent::PresenceChanged(Vec::new()));
        self.emit(ClientEvent::LoggedOut);
    }

    async fn refresh_subscriptions(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock().await;
        let counterpart = {
            let state = self.inner.lock().await;
            if state.logged_out {
                return;
            }
            state.active_key().cloned()
        };
        let context = SubscriptionContext {
            user_id: self.local_user.id.clone(),
            token: self.token.clone(),
            counterpart,
        };
        if let Err(err) = subscriptions.activate(context).await {
            drop(subscriptions);
            let mut state = self.inner.lock().await;
            self.surface(&mut state, err);
        }
    }

    async fn load_page(
        self: &Arc<Self>,
        request: PageRequest,
        guard: ContextGuard,
    ) -> SyncResult<()> {
        let key = request.conversation_key.clone();
        let result = self
            .backend
            .fetch_messages(&key, request.limit, request.skip)
            .await;

        let mut lock = self.inner.lock().await;
        if let Err(err) = lock.check_current(guard) {
            debug!(
                conversation = %key,
                skip = request.skip,
                error = %err,
                "pagination: discarding stale page"
            );
            return Ok(());
        }
        let state = &mut *lock;
        let Some(pagination) = state.cursors.get_mut(&key) else {
            return Ok(());
        };
        let page = match result {
            Ok(page) => page,
            Err(err) => {
                pagination.abort();
                self.surface(state, err.clone());
                return Err(err);
            }
        };

        let messages: Vec<Message> = page
            .into_iter()
            .map(|wire| wire.into_message(&self.local_user.id))
            .collect();
        let store = state
            .stores
            .entry(key.clone())
            .or_insert_with(|| MessageStore::new(key.clone()));
        let outcome = pagination.complete(&request, messages, store);
        drop(lock);

        self.emit(ClientEvent::MessagesUpdated {
            conversation: key.clone(),
        });
        if outcome.exhausted {
            self.emit(ClientEvent::HistoryExhausted {
                conversation: key.clone(),
            });
        }
        if outcome.first_page {
            self.emit(ClientEvent::ScrollToLatest {
                conversation: key.clone(),
            });
            self.sync_read(key, guard.generation).await;
        }
        Ok(())
    }

    async fn resolve_counterpart(self: &Arc<Self>, peer: ConversationKey, guard: ContextGuard) {
        let result = self.backend.fetch_user(&peer).await;
        let mut lock = self.inner.lock().await;
        if let Err(err) = lock.check_current(guard) {
            debug!(peer = %peer, error = %err, "session: discarding stale counterpart profile");
            return;
        }
        let state = &mut *lock;
        match result {
            Ok(profile) => {
                if state.inbox.set_participant(profile.clone()) {
                    self.publish_inbox(state);
                }
                if let Some(active) = state.active.as_mut() {
                    active.counterpart = Some(profile.clone());
                }
                let view = CounterpartView::new(profile, &state.presence);
                self.emit(ClientEvent::CounterpartResolved(view));
            }
            Err(err) => {
                warn!(peer = %peer, error = %err, "session: counterpart lookup failed");
                self.surface(state, err);
            }
        }
    }

    async fn resolve_participant(self: Arc<Self>, key: ConversationKey, generation: u64) {
        let result = self.backend.fetch_user(&key).await;
        let mut lock = self.inner.lock().await;
        if lock.generation != generation {
            return;
        }
        match result {
            Ok(profile) => {
                let state = &mut *lock;
                if state.inbox.set_participant(profile) {
                    self.publish_inbox(state);
                }
            }
            Err(err) => {
                warn!(conversation = %key, error = %err, "inbox: participant lookup failed");
            }
        }
    }

    async fn deliver(self: Arc<Self>, pending: PendingSend, generation: u64) {
        let sent_event = ChannelNames::sent_event_for(&pending.receiver_id);
        let notify = async {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .notify_peer(&sent_event, &self.local_user.id)
                .await
        };
        let (notified, sent) = tokio::join!(
            notify,
            self.backend
                .send_message(&pending.receiver_id, &pending.body)
        );
        if let Err(err) = notified {
            warn!(temp_id = %pending.temp_id, error = %err, "send: peer notification failed");
        }

        let mut lock = self.inner.lock().await;
        if lock.generation != generation {
            debug!(temp_id = %pending.temp_id, "send: discarding delivery result after logout");
            return;
        }
        let state = &mut *lock;
        let key = pending.receiver_id.clone();
        let store = state
            .stores
            .entry(key.clone())
            .or_insert_with(|| MessageStore::new(key.clone()));

        match sent {
            Ok(wire) => {
                let message = wire.into_message(&self.local_user.id);
                let id = message.id.clone();
                state.send.confirm(&pending.temp_id, message.clone(), store);
                if state.inbox.apply_message(&message) != InboxChange::Unchanged {
                    self.publish_inbox(state);
                }
                self.emit(ClientEvent::MessagesUpdated { conversation: key });
                self.emit(ClientEvent::MessageDelivered {
                    temp_id: pending.temp_id,
                    id,
                });
            }
            Err(err) => {
                state.send.fail(&pending.temp_id, store);
                let reason = err.to_string();
                warn!(temp_id = %pending.temp_id, reason = %reason, "send: delivery failed");
                if err.is_unauthorized() {
                    self.spawn_logout();
                }
                state.last_error = Some(SyncError::Delivery {
                    temp_id: pending.temp_id.clone(),
                    reason: reason.clone(),
                });
                self.emit(ClientEvent::MessagesUpdated { conversation: key });
                self.emit(ClientEvent::SendFailed {
                    temp_id: pending.temp_id,
                    reason,
                });
            }
        }
    }

    /// Single-flight mark-read; a trigger that lands mid-request is replayed
    /// once the request finishes.
    async fn sync_read(self: &Arc<Self>, key: ConversationKey, generation: u64) {
        loop {
            {
                let mut state = self.inner.lock().await;
                if state.generation != generation {
                    return;
                }
                if !state.receipts.begin(&key) {
                    debug!(conversation = %key, "read: request in flight, queued");
                    return;
                }
            }

            let result = self.backend.mark_read(&key).await;

            let mut lock = self.inner.lock().await;
            if lock.generation != generation {
                return;
            }
            let state = &mut *lock;
            match result {
                Ok(()) => {
                    let updated = state.store_mut(&key).mark_incoming_read(&key, Utc::now());
                    if updated > 0 {
                        self.emit(ClientEvent::MessagesUpdated {
                            conversation: key.clone(),
                        });
                    }
                    if state.inbox.mark_read(&key) {
                        self.publish_inbox(state);
                    }
                    debug!(conversation = %key, updated, "read: conversation marked read");
                }
                Err(err) => self.surface(state, err),
            }
            if !state.receipts.complete(&key) {
                return;
            }
        }
    }

    async fn handle_notice(self: &Arc<Self>, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Event(event) => self.apply_push(event).await,
            ChannelNotice::StateChanged(state) => {
                debug!(?state, "push: subscription state changed");
                self.emit(ClientEvent::SubscriptionStateChanged(state));
            }
            // Already logged by the pump; the event is simply dropped.
            ChannelNotice::Failed(SyncError::MalformedEvent(_)) => {}
            ChannelNotice::Failed(err) => {
                let mut state = self.inner.lock().await;
                self.surface(&mut state, err);
            }
        }
    }

    async fn apply_push(self: &Arc<Self>, event: PushEvent) {
        let mut lock = self.inner.lock().await;
        if lock.logged_out {
            return;
        }
        let state = &mut *lock;
        match event {
            PushEvent::NewMessage(wire) => {
                let message = wire.into_message(&self.local_user.id);
                self.apply_live_message(state, message);
            }
            PushEvent::Typing { sender_id } => {
                let was_typing = state.typing.is_typing();
                if let Some(timer) = state.typing.on_remote_typing(&sender_id, Instant::now()) {
                    self.schedule_typing_clear(state, sender_id.clone(), timer);
                    if !was_typing {
                        self.emit(ClientEvent::TypingChanged {
                            conversation: sender_id,
                            typing: true,
                        });
                    }
                }
            }
            PushEvent::PeerSent { sender_id } => {
                if state.typing.on_peer_sent(&sender_id) {
                    state.cancel_typing_timer();
                    self.emit(ClientEvent::TypingChanged {
                        conversation: sender_id,
                        typing: false,
                    });
                }
            }
            PushEvent::PresenceSnapshot(members) => {
                state.presence.replace_connected(members);
                self.publish_presence(state);
            }
            PushEvent::MemberAdded(member) => {
                if state.presence.member_added(member) {
                    self.publish_presence(state);
                }
            }
            PushEvent::MemberRemoved { id } => {
                if state.presence.member_removed(&id) {
                    self.publish_presence(state);
                }
            }
        }
    }

    fn apply_live_message(self: &Arc<Self>, state: &mut SessionState, message: Message) {
        let local = &self.local_user.id;
        if !message.is_from(local) && &message.receiver_id != local {
            warn!(id = %message.id, "push: message not addressed to this user, dropping");
            return;
        }
        let key = message.conversation_key.clone();

        if state.store_mut(&key).merge([message.clone()]) > 0 {
            self.emit(ClientEvent::MessagesUpdated {
                conversation: key.clone(),
            });
        }

        match state.inbox.apply_message(&message) {
            InboxChange::Unchanged => {}
            InboxChange::Updated => self.publish_inbox(state),
            InboxChange::Inserted => {
                self.publish_inbox(state);
                let is_friend = state.inbox.friends().iter().any(|f| f.id == key);
                if !is_friend {
                    let generation = state.generation;
                    tokio::spawn(Arc::clone(self).resolve_participant(key.clone(), generation));
                }
            }
        }

        if state.typing.on_peer_sent(&message.sender_id) {
            state.cancel_typing_timer();
            self.emit(ClientEvent::TypingChanged {
                conversation: key.clone(),
                typing: false,
            });
        }

        if ReadReceiptSync::should_sync_on_push(state.active_key(), &message, local) {
            self.emit(ClientEvent::ScrollToLatest {
                conversation: key.clone(),
            });
            let session = Arc::clone(self);
            let generation = state.generation;
            tokio::spawn(async move { session.sync_read(key, generation).await });
        }
    }

    fn schedule_typing_clear(
        self: &Arc<Self>,
        state: &mut SessionState,
        conversation: ConversationKey,
        timer: TypingTimer,
    ) {
        state.cancel_typing_timer();
        let session = Arc::downgrade(self);
        state.typing_timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(timer.deadline).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let mut state = session.inner.lock().await;
            if state.typing.expire(timer.generation) {
                state.typing_timer = None;
                let _ = session.events.send(ClientEvent::TypingChanged {
                    conversation,
                    typing: false,
                });
            }
        }));
    }

    fn surface(self: &Arc<Self>, state: &mut SessionState, err: SyncError) {
        warn!(error = %err, "session: operation failed");
        self.emit(ClientEvent::Error(err.to_string()));
        if err.is_unauthorized() && !state.logged_out {
            self.spawn_logout();
        }
        state.last_error = Some(err);
    }

    fn spawn_logout(self: &Arc<Self>) {
        warn!("session: credential rejected, logging out");
        let session = Arc::clone(self);
        tokio::spawn(async move { session.logout().await });
    }

    fn publish_inbox(&self, state: &SessionState) {
        self.emit(ClientEvent::InboxUpdated(state.inbox.rows(&state.presence)));
    }

    fn publish_presence(&self, state: &SessionState) {
        self.emit(ClientEvent::PresenceChanged(state.presence.online()));
        self.publish_inbox(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.inner.get_mut().cancel_typing_timer();
    }
}

async fn dispatch_notices(
    session: Weak<ChatSession>,
    mut notices: mpsc::UnboundedReceiver<ChannelNotice>,
) {
    while let Some(notice) = notices.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_notice(notice).await;
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
