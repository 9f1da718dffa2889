use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use haul_cache::{keys, EphemeralStore};
use haul_core::ids::{ConnectionId, RoomId};
use haul_core::models::{ChatMessage, MessageType};
use haul_core::{RelayError, ServerEvent};
use haul_store::messages::{MessageRepo, NewMessage};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::best_effort::attempt;
use crate::outbox::Outbox;
use crate::{run_blocking, Caller};

#[derive(Clone, Debug)]
pub struct RoomConfig {
    pub history_limit: u32,
    pub max_message_chars: usize,
    pub typing_ttl: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_limit: 50,
            max_message_chars: 1000,
            typing_ttl: Duration::from_secs(10),
        }
    }
}

/// Which connections sit in which rooms. Both directions are indexed so a
/// disconnect can leave everything without scanning.
#[derive(Default)]
pub struct RoomRegistry {
    members: DashMap<RoomId, HashSet<ConnectionId>>,
    joined: DashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the connection was already a member.
    pub fn join(&self, room: RoomId, connection_id: &ConnectionId) -> bool {
        let added = self
            .members
            .entry(room)
            .or_default()
            .insert(connection_id.clone());
        self.joined
            .entry(connection_id.clone())
            .or_default()
            .insert(room);
        added
    }

    pub fn leave(&self, room: RoomId, connection_id: &ConnectionId) -> bool {
        let removed = self
            .members
            .get_mut(&room)
            .map(|mut set| set.remove(connection_id))
            .unwrap_or(false);
        self.members.remove_if(&room, |_, set| set.is_empty());

        if let Some(mut rooms) = self.joined.get_mut(connection_id) {
            rooms.remove(&room);
        }
        self.joined.remove_if(connection_id, |_, rooms| rooms.is_empty());
        removed
    }

    /// Drop every membership of a connection and return the rooms it was in.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let Some((_, rooms)) = self.joined.remove(connection_id) else {
            return Vec::new();
        };
        for room in &rooms {
            if let Some(mut set) = self.members.get_mut(room) {
                set.remove(connection_id);
            }
            self.members.remove_if(room, |_, set| set.is_empty());
        }
        let mut rooms: Vec<RoomId> = rooms.into_iter().collect();
        rooms.sort_by_key(|r| (r.offer_id, r.driver_id));
        rooms
    }

    pub fn members(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.members
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn others(&self, room: &RoomId, except: &ConnectionId) -> Vec<ConnectionId> {
        self.members
            .get(room)
            .map(|set| set.iter().filter(|c| *c != except).cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_member(&self, room: &RoomId, connection_id: &ConnectionId) -> bool {
        self.members
            .get(room)
            .is_some_and(|set| set.contains(connection_id))
    }

    #[cfg(test)]
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.joined
            .get(connection_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }
}

type TurnLocks = DashMap<RoomId, Arc<Mutex<()>>>;

/// Exclusive turn on one room. Dropping it releases the lock and removes
/// the room's entry once no other sender holds or waits on it.
struct RoomTurn<'a> {
    locks: &'a TurnLocks,
    room: RoomId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.room, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Per-(offer, driver) chat: membership, history, typing and receipts.
pub struct RoomBus {
    registry: RoomRegistry,
    messages: MessageRepo,
    store: Arc<dyn EphemeralStore>,
    outbox: Outbox,
    config: RoomConfig,
    // Persist-and-enqueue, and join-and-read-history, take turns per room.
    turns: TurnLocks,
}

impl RoomBus {
    pub fn new(
        messages: MessageRepo,
        store: Arc<dyn EphemeralStore>,
        outbox: Outbox,
        config: RoomConfig,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(),
            messages,
            store,
            outbox,
            config,
            turns: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Dispatchers may enter any room; a driver only rooms carrying their
    /// own driver id.
    pub fn authorize(&self, caller: &Caller, room: &RoomId) -> Result<(), RelayError> {
        if caller.identity.is_dispatcher() || caller.identity.user_id == Some(room.driver_id) {
            return Ok(());
        }
        Err(RelayError::Unauthorized(format!("not a participant of {room}")))
    }

    async fn turn(&self, room: RoomId) -> RoomTurn<'_> {
        let lock = self.turns.entry(room).or_default().clone();
        RoomTurn {
            locks: &self.turns,
            room,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Join, queue recent history (oldest first) to the joiner, and return it.
    ///
    /// Membership is taken before history is read, within the room's turn:
    /// a concurrent message is either in the history or delivered after it.
    #[instrument(skip_all, fields(connection_id = %caller.connection_id, room = %room))]
    pub async fn join(&self, caller: &Caller, room: RoomId) -> Result<Vec<ChatMessage>, RelayError> {
        self.authorize(caller, &room)?;

        let _turn = self.turn(room).await;
        let newly_joined = self.registry.join(room, &caller.connection_id);

        let repo = self.messages.clone();
        let limit = self.config.history_limit;
        let mut history =
            match run_blocking(move || repo.list_recent(room.offer_id, room.driver_id, limit)).await {
                Ok(history) => history,
                Err(e) => {
                    if newly_joined {
                        self.registry.leave(room, &caller.connection_id);
                    }
                    return Err(e);
                }
            };
        history.reverse();

        self.outbox.unicast(
            &caller.connection_id,
            &ServerEvent::ChatHistory {
                offer_id: room.offer_id,
                driver_id: room.driver_id,
                messages: history.clone(),
            },
        );

        if newly_joined {
            self.outbox.multicast(
                self.registry.others(&room, &caller.connection_id),
                &ServerEvent::UserJoined {
                    offer_id: room.offer_id,
                    driver_id: room.driver_id,
                    user_id: caller.identity.user_id,
                    username: caller.identity.username.clone(),
                    user_type: caller.identity.user_type,
                },
            );
        }
        debug!(history = history.len(), "joined room");
        Ok(history)
    }

    /// Leaving a room that was never joined does nothing.
    pub fn leave(&self, caller: &Caller, room: RoomId) {
        if self.registry.leave(room, &caller.connection_id) {
            self.announce_left(caller, room);
        }
    }

    /// Remove the connection from every room it joined.
    pub fn leave_all(&self, caller: &Caller) {
        for room in self.registry.leave_all(&caller.connection_id) {
            self.announce_left(caller, room);
        }
    }

    fn announce_left(&self, caller: &Caller, room: RoomId) {
        self.outbox.multicast(
            self.registry.members(&room),
            &ServerEvent::UserLeft {
                offer_id: room.offer_id,
                driver_id: room.driver_id,
                user_id: caller.identity.user_id,
                username: caller.identity.username.clone(),
            },
        );
    }

    /// Validate, persist, then deliver to the room.
    #[instrument(skip_all, fields(connection_id = %caller.connection_id, room = %room))]
    pub async fn send(
        &self,
        caller: &Caller,
        room: RoomId,
        body: &str,
        message_type: Option<&str>,
    ) -> Result<ChatMessage, RelayError> {
        self.authorize(caller, &room)?;
        let sender_id = caller
            .identity
            .user_id
            .ok_or_else(|| RelayError::Unauthorized("sender has no user id".into()))?;
        self.validate_body(body)?;
        let message_type = match message_type {
            None => MessageType::default(),
            Some(raw) => raw
                .parse::<MessageType>()
                .map_err(RelayError::InvalidRequest)?,
        };

        let new = NewMessage {
            offer_id: room.offer_id,
            driver_id: room.driver_id,
            sender_type: caller.identity.user_type,
            sender_id,
            message: body.to_string(),
            message_type,
        };

        let message = {
            let _turn = self.turn(room).await;
            let repo = self.messages.clone();
            let message = run_blocking(move || repo.insert(new)).await?;

            let mut audience = self.registry.members(&room);
            if !audience.contains(&caller.connection_id) {
                audience.push(caller.connection_id.clone());
            }
            self.outbox
                .multicast(audience, &ServerEvent::ReceiveMessage(message.clone()));
            message
        };

        attempt(
            "typing.clear",
            self.store.delete(&keys::typing(&room, sender_id)),
        )
        .await;
        self.outbox.multicast(
            self.registry.others(&room, &caller.connection_id),
            &ServerEvent::UserTyping {
                offer_id: room.offer_id,
                driver_id: room.driver_id,
                user_id: Some(sender_id),
                username: caller.identity.username.clone(),
                is_typing: false,
            },
        );

        debug!(message_id = message.id, "message sent");
        Ok(message)
    }

    fn validate_body(&self, body: &str) -> Result<(), RelayError> {
        if body.trim().is_empty() {
            return Err(RelayError::InvalidMessage("message is empty".into()));
        }
        let chars = body.chars().count();
        if chars > self.config.max_message_chars {
            return Err(RelayError::InvalidMessage(format!(
                "message is {chars} characters, limit is {}",
                self.config.max_message_chars
            )));
        }
        Ok(())
    }

    pub async fn set_typing(
        &self,
        caller: &Caller,
        room: RoomId,
        is_typing: bool,
    ) -> Result<(), RelayError> {
        self.authorize(caller, &room)?;

        if let Some(user_id) = caller.identity.user_id {
            let key = keys::typing(&room, user_id);
            if is_typing {
                attempt("typing.set", self.store.set(&key, "1", self.config.typing_ttl)).await;
            } else {
                attempt("typing.clear", self.store.delete(&key)).await;
            }
        }

        self.outbox.multicast(
            self.registry.others(&room, &caller.connection_id),
            &ServerEvent::UserTyping {
                offer_id: room.offer_id,
                driver_id: room.driver_id,
                user_id: caller.identity.user_id,
                username: caller.identity.username.clone(),
                is_typing,
            },
        );
        Ok(())
    }

    /// Mark a message read. Repeating the call re-notifies the room.
    #[instrument(skip_all, fields(connection_id = %caller.connection_id, message_id = message_id))]
    pub async fn mark_read(&self, caller: &Caller, message_id: i64) -> Result<ChatMessage, RelayError> {
        let repo = self.messages.clone();
        let existing = run_blocking(move || repo.get(message_id)).await?;
        let room = RoomId::new(existing.offer_id, existing.driver_id);
        self.authorize(caller, &room)?;

        let repo = self.messages.clone();
        let message = run_blocking(move || repo.mark_read(message_id)).await?;

        self.outbox.multicast(
            self.registry.others(&room, &caller.connection_id),
            &ServerEvent::MessageReadConfirmed {
                message_id,
                offer_id: room.offer_id,
                driver_id: room.driver_id,
                reader_id: caller.identity.user_id,
                reader_type: caller.identity.user_type,
            },
        );
        Ok(message)
    }

    /// Deliver a message persisted elsewhere to whoever is in its room.
    pub fn relay_external(&self, message: ChatMessage) {
        let room = RoomId::new(message.offer_id, message.driver_id);
        self.outbox
            .multicast(self.registry.members(&room), &ServerEvent::ReceiveMessage(message));
    }

    pub async fn is_typing(&self, room: &RoomId, user_id: i64) -> Result<bool, RelayError> {
        Ok(self.store.get(&keys::typing(room, user_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dispatcher, driver};
    use haul_cache::MemoryStore;
    use haul_core::{Audience, Delivery};
    use haul_store::Database;
    use tokio::sync::broadcast;

    struct Fixture {
        bus: RoomBus,
        repo: MessageRepo,
        rx: broadcast::Receiver<Delivery>,
    }

    fn fixture() -> Fixture {
        let repo = MessageRepo::new(Database::in_memory().unwrap());
        let outbox = Outbox::new(64);
        let rx = outbox.subscribe();
        let bus = RoomBus::new(
            repo.clone(),
            Arc::new(MemoryStore::new()),
            outbox,
            RoomConfig::default(),
        );
        Fixture { bus, repo, rx }
    }

    fn drain(rx: &mut broadcast::Receiver<Delivery>) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    #[test]
    fn registry_tracks_both_directions() {
        let registry = RoomRegistry::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let room = RoomId::new(7, 42);
        let other = RoomId::new(8, 42);

        assert!(registry.join(room, &a));
        assert!(!registry.join(room, &a));
        registry.join(room, &b);
        registry.join(other, &a);

        assert_eq!(registry.others(&room, &a), vec![b.clone()]);
        assert_eq!(registry.rooms_of(&a).len(), 2);

        assert_eq!(registry.leave_all(&a), vec![room, other]);
        assert!(!registry.is_member(&room, &a));
        assert!(registry.is_member(&room, &b));
        assert!(registry.members(&other).is_empty());
        assert!(!registry.leave(room, &a));
    }

    #[tokio::test]
    async fn driver_cannot_join_another_drivers_room() {
        let mut f = fixture();
        let caller = driver(42);
        let err = f.bus.join(&caller, RoomId::new(7, 99)).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(f.bus.registry().rooms_of(&caller.connection_id).is_empty());
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn dispatcher_may_join_any_room() {
        let f = fixture();
        f.bus.join(&dispatcher(1), RoomId::new(7, 99)).await.unwrap();
    }

    #[tokio::test]
    async fn join_returns_history_oldest_first() {
        let f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let m1 = f.bus.send(&d, room, "m1", None).await.unwrap();
        let m2 = f.bus.send(&d, room, "m2", None).await.unwrap();
        let m3 = f.bus.send(&d, room, "m3", None).await.unwrap();

        let history = f.bus.join(&dispatcher(1), room).await.unwrap();
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id, m3.id]);
    }

    #[tokio::test]
    async fn join_announces_to_other_members_only() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let disp = dispatcher(1);

        f.bus.join(&d, room).await.unwrap();
        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 1, "nobody else to tell");
        assert_eq!(out[0].event(), "chat_history");
        assert_eq!(out[0].audience, Audience::Connection(d.connection_id.clone()));

        f.bus.join(&disp, room).await.unwrap();
        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].event(), "chat_history");
        assert_eq!(out[0].audience, Audience::Connection(disp.connection_id.clone()));
        assert_eq!(out[1].event(), "user_joined");
        assert_eq!(out[1].audience, Audience::Members(vec![d.connection_id.clone()]));
        assert_eq!(out[1].frame.data["userType"], "dispatcher");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_racing_send_sees_message_exactly_once() {
        let room = RoomId::new(7, 42);
        for _ in 0..200 {
            let Fixture { bus, mut rx, .. } = fixture();
            let bus = Arc::new(bus);
            let joiner = dispatcher(1);
            let sender = driver(42);

            let join = tokio::spawn({
                let bus = Arc::clone(&bus);
                let joiner = joiner.clone();
                async move { bus.join(&joiner, room).await }
            });
            let send = tokio::spawn({
                let bus = Arc::clone(&bus);
                async move { bus.send(&sender, room, "hello", None).await }
            });
            join.await.unwrap().unwrap();
            let message = send.await.unwrap().unwrap();

            // (event, copies of the message it carried) as seen by the joiner
            let seen: Vec<(String, usize)> = drain(&mut rx)
                .into_iter()
                .filter(|d| d.reaches(&joiner.connection_id))
                .filter_map(|d| match d.event() {
                    "chat_history" => {
                        let copies = d.frame.data["messages"]
                            .as_array()
                            .map(|msgs| msgs.iter().filter(|m| m["id"] == message.id).count())
                            .unwrap_or(0);
                        Some(("chat_history".to_string(), copies))
                    }
                    "receive_message" => {
                        Some(("receive_message".to_string(), usize::from(d.frame.data["id"] == message.id)))
                    }
                    _ => None,
                })
                .collect();

            assert_eq!(seen[0].0, "chat_history", "history must come first: {seen:?}");
            let copies: usize = seen.iter().map(|(_, n)| n).sum();
            assert_eq!(copies, 1, "joiner saw the message {copies} times: {seen:?}");
        }
    }

    #[tokio::test]
    async fn send_to_unjoined_room_leaves_no_turn_lock() {
        let f = fixture();
        let room = RoomId::new(7, 42);
        f.bus.send(&driver(42), room, "anyone?", None).await.unwrap();
        f.bus.send(&dispatcher(1), room, "here", None).await.unwrap();
        assert!(f.bus.turns.is_empty());

        f.bus.join(&driver(42), room).await.unwrap();
        assert!(f.bus.turns.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_clean_up_turn_lock() {
        let f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let (a, b, c) = tokio::join!(
            f.bus.send(&d, room, "a", None),
            f.bus.send(&d, room, "b", None),
            f.bus.send(&d, room, "c", None),
        );
        let mut ids = vec![a.unwrap().id, b.unwrap().id, c.unwrap().id];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(f.bus.turns.is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_remaining_members() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let disp = dispatcher(1);
        f.bus.join(&d, room).await.unwrap();
        f.bus.join(&disp, room).await.unwrap();
        drain(&mut f.rx);

        f.bus.leave(&disp, room);
        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event(), "user_left");
        assert!(out[0].reaches(&d.connection_id));

        // Not a member any more: nothing happens.
        f.bus.leave(&disp, room);
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn send_delivers_to_members_including_sender() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let disp = dispatcher(1);
        f.bus.join(&d, room).await.unwrap();
        f.bus.join(&disp, room).await.unwrap();
        drain(&mut f.rx);

        let msg = f.bus.send(&disp, room, "load ready at dock 4", None).await.unwrap();
        assert_eq!(msg.sender_id, 1);
        assert!(!msg.is_read);

        let out = drain(&mut f.rx);
        assert_eq!(out[0].event(), "receive_message");
        assert!(out[0].reaches(&d.connection_id));
        assert!(out[0].reaches(&disp.connection_id));
        assert_eq!(out[0].frame.data["id"], msg.id);

        assert_eq!(out[1].event(), "user_typing");
        assert_eq!(out[1].frame.data["isTyping"], false);
        assert!(!out[1].reaches(&disp.connection_id));
    }

    #[tokio::test]
    async fn send_clears_typing_flag() {
        let f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        f.bus.set_typing(&d, room, true).await.unwrap();
        assert!(f.bus.is_typing(&room, 42).await.unwrap());

        f.bus.send(&d, room, "done typing", None).await.unwrap();
        assert!(!f.bus.is_typing(&room, 42).await.unwrap());
    }

    #[tokio::test]
    async fn empty_message_leaves_no_row() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);

        for body in ["", "   \n\t"] {
            let err = f.bus.send(&d, room, body, None).await.unwrap_err();
            assert_eq!(err.code(), "INVALID_MESSAGE");
        }
        assert_eq!(f.repo.list_recent(7, 42, 50).unwrap().len(), 0);
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn over_long_message_rejected() {
        let f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let exactly = "é".repeat(1000);
        f.bus.send(&d, room, &exactly, None).await.unwrap();

        let too_long = "x".repeat(1001);
        let err = f.bus.send(&d, room, &too_long, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");
        assert_eq!(f.repo.list_recent(7, 42, 50).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_message_type_is_invalid_request() {
        let f = fixture();
        let err = f
            .bus
            .send(&driver(42), RoomId::new(7, 42), "hi", Some("image"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let msg = f
            .bus
            .send(&driver(42), RoomId::new(7, 42), "joined", Some("system"))
            .await
            .unwrap();
        assert_eq!(msg.message_type, MessageType::System);
    }

    #[tokio::test]
    async fn unauthorized_send_has_no_side_effect() {
        let f = fixture();
        let err = f
            .bus
            .send(&driver(42), RoomId::new(7, 99), "hello", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert_eq!(f.repo.list_recent(7, 99, 50).unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_flag_lapses() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let disp = dispatcher(1);
        f.bus.join(&disp, room).await.unwrap();
        drain(&mut f.rx);

        f.bus.set_typing(&d, room, true).await.unwrap();
        let out = drain(&mut f.rx);
        assert_eq!(out[0].event(), "user_typing");
        assert_eq!(out[0].frame.data["isTyping"], true);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!f.bus.is_typing(&room, 42).await.unwrap());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_renotifies() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        let disp = dispatcher(1);
        f.bus.join(&d, room).await.unwrap();
        f.bus.join(&disp, room).await.unwrap();
        let msg = f.bus.send(&disp, room, "call me", None).await.unwrap();
        drain(&mut f.rx);

        assert!(f.bus.mark_read(&d, msg.id).await.unwrap().is_read);
        assert!(f.bus.mark_read(&d, msg.id).await.unwrap().is_read);

        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 2);
        for delivery in out {
            assert_eq!(delivery.event(), "message_read_confirmed");
            assert_eq!(delivery.audience, Audience::Members(vec![disp.connection_id.clone()]));
            assert_eq!(delivery.frame.data["messageId"], msg.id);
        }
    }

    #[tokio::test]
    async fn mark_read_unknown_or_foreign_message() {
        let f = fixture();
        let err = f.bus.mark_read(&driver(42), 12345).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        let msg = f.bus.send(&driver(99), RoomId::new(7, 99), "mine", None).await.unwrap();
        let err = f.bus.mark_read(&driver(42), msg.id).await.unwrap_err();
        assert_eq!(err.code(), "UNAUTHORIZED");
        assert!(!f.repo.get(msg.id).unwrap().is_read);
    }

    #[tokio::test]
    async fn relay_external_reaches_room_members() {
        let mut f = fixture();
        let room = RoomId::new(7, 42);
        let d = driver(42);
        f.bus.join(&d, room).await.unwrap();
        drain(&mut f.rx);

        let msg = f.bus.send(&dispatcher(1), room, "from elsewhere", None).await.unwrap();
        drain(&mut f.rx);
        f.bus.relay_external(msg.clone());

        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event(), "receive_message");
        assert_eq!(out[0].audience, Audience::Members(vec![d.connection_id.clone()]));
    }

    #[tokio::test]
    async fn leave_all_announces_each_room() {
        let mut f = fixture();
        let d = driver(42);
        let disp = dispatcher(1);
        for offer in [7, 8] {
            f.bus.join(&d, RoomId::new(offer, 42)).await.unwrap();
            f.bus.join(&disp, RoomId::new(offer, 42)).await.unwrap();
        }
        drain(&mut f.rx);

        f.bus.leave_all(&d);
        let out = drain(&mut f.rx);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.event() == "user_left"));
        assert!(f.bus.registry().rooms_of(&d.connection_id).is_empty());
    }
}
