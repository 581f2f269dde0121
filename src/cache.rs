//! In-memory view of what the gateway told us about.
//!
//! Filled from the READY payload and kept current from house, room and
//! member dispatches before handlers see them. Lookups hand out clones.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::event::names;
use crate::model::{Entity, House, Member, Ready, Room, User};

#[derive(Debug, Default)]
struct CacheInner {
    client_user: Option<User>,
    users: HashMap<String, User>,
    houses: HashMap<String, House>,
    rooms: HashMap<String, Room>,
    private_rooms: HashMap<String, Room>,
    entities: HashMap<String, Entity>,
}

#[derive(Debug, Default)]
pub struct Cache {
    inner: RwLock<CacheInner>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The account this client is logged in as.
    pub fn client_user(&self) -> Option<User> {
        self.inner.read().client_user.clone()
    }

    pub fn user(&self, user_id: &str) -> Option<User> {
        self.inner.read().users.get(user_id).cloned()
    }

    pub fn house(&self, house_id: &str) -> Option<House> {
        self.inner.read().houses.get(house_id).cloned()
    }

    /// House rooms first, then private rooms.
    pub fn room(&self, room_id: &str) -> Option<Room> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room_id)
            .or_else(|| inner.private_rooms.get(room_id))
            .cloned()
    }

    pub fn private_room(&self, room_id: &str) -> Option<Room> {
        self.inner.read().private_rooms.get(room_id).cloned()
    }

    pub fn entity(&self, entity_id: &str) -> Option<Entity> {
        self.inner.read().entities.get(entity_id).cloned()
    }

    pub fn houses(&self) -> Vec<House> {
        self.inner.read().houses.values().cloned().collect()
    }

    /// First house whose name matches, ignoring case.
    pub fn find_house(&self, name: &str) -> Option<House> {
        self.inner
            .read()
            .houses
            .values()
            .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
    }

    pub fn find_user(&self, username: &str) -> Option<User> {
        self.inner
            .read()
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned()
    }

    /// Replaces the cache with the READY snapshot.
    pub(crate) fn load_ready(&self, ready: &Ready) {
        let mut inner = CacheInner::default();

        if let Some(user) = &ready.user {
            inner.users.insert(user.id.clone(), user.clone());
            inner.client_user = Some(user.clone());
        }

        // Hiven sends a map keyed by house id; arrays are accepted too.
        let memberships: Vec<&Value> = match &ready.house_memberships {
            Value::Object(map) => map.values().collect(),
            Value::Array(list) => list.iter().collect(),
            _ => Vec::new(),
        };
        for raw in memberships {
            match parse::<House>(raw) {
                Some(house) => inner.insert_house(house),
                None => log::warn!("Skipping unreadable house in ready payload"),
            }
        }

        for room in &ready.private_rooms {
            for user in room.recipients.iter().flatten() {
                inner.users.insert(user.id.clone(), user.clone());
            }
            inner.private_rooms.insert(room.id.clone(), room.clone());
        }

        log::debug!(
            "Cached {} houses, {} rooms, {} users",
            inner.houses.len(),
            inner.rooms.len() + inner.private_rooms.len(),
            inner.users.len()
        );
        *self.inner.write() = inner;
    }

    /// Applies one dispatch. Events the cache does not track are ignored.
    pub(crate) fn apply(&self, event: &str, data: &Value) {
        let event = event.to_ascii_uppercase();
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        match event.as_str() {
            names::HOUSE_JOIN => {
                if let Some(house) = parse::<House>(data) {
                    inner.insert_house(house);
                }
            }
            names::HOUSE_UPDATE => {
                if let Some(update) = parse::<House>(data) {
                    if !inner.houses.contains_key(&update.id) {
                        inner.insert_house(update);
                    } else if let Some(house) = inner.houses.get_mut(&update.id) {
                        house.name = update.name.or(house.name.take());
                        house.icon = update.icon.or(house.icon.take());
                        house.banner = update.banner.or(house.banner.take());
                        house.owner_id = update.owner_id.or(house.owner_id.take());
                    }
                }
            }
            names::HOUSE_LEAVE | names::HOUSE_DOWN => {
                if let Some(id) = id_of(data, "house_id") {
                    inner.remove_house(&id);
                }
            }
            names::ROOM_CREATE | names::ROOM_UPDATE => {
                if let Some(room) = parse::<Room>(data) {
                    inner.upsert_room(room);
                }
            }
            names::ROOM_DELETE => {
                if let Some(id) = data.get("id").and_then(Value::as_str) {
                    inner.remove_room(id);
                }
            }
            names::HOUSE_MEMBER_JOIN => {
                if let Some(member) = parse::<Member>(data) {
                    if let Some(user) = member.user.clone() {
                        inner.users.insert(user.id.clone(), user);
                    }
                    let house_id = member.house_id.clone().unwrap_or_default();
                    if let Some(house) = inner.houses.get_mut(&house_id) {
                        house.members.push(member);
                    }
                }
            }
            names::HOUSE_MEMBER_LEAVE => {
                let house_id = data.get("house_id").and_then(Value::as_str);
                let user_id = data
                    .get("user_id")
                    .and_then(Value::as_str)
                    .or_else(|| data.pointer("/user/id").and_then(Value::as_str));
                if let (Some(house_id), Some(user_id)) = (house_id, user_id) {
                    if let Some(house) = inner.houses.get_mut(house_id) {
                        house.members.retain(|m| m.user_id.as_deref() != Some(user_id));
                    }
                }
            }
            _ => {}
        }
    }
}

impl CacheInner {
    fn insert_house(&mut self, mut house: House) {
        for room in &mut house.rooms {
            room.house_id.get_or_insert_with(|| house.id.clone());
            self.rooms.insert(room.id.clone(), room.clone());
        }
        for entity in &house.entities {
            self.entities.insert(entity.id.clone(), entity.clone());
        }
        for user in house.members.iter().filter_map(|m| m.user.as_ref()) {
            self.users.insert(user.id.clone(), user.clone());
        }
        self.houses.insert(house.id.clone(), house);
    }

    fn remove_house(&mut self, house_id: &str) {
        if let Some(house) = self.houses.remove(house_id) {
            for room in &house.rooms {
                self.rooms.remove(&room.id);
            }
            for entity in &house.entities {
                self.entities.remove(&entity.id);
            }
        }
    }

    /// Rooms without a house are private rooms.
    fn upsert_room(&mut self, room: Room) {
        let Some(house_id) = room.house_id.clone() else {
            self.private_rooms.insert(room.id.clone(), room);
            return;
        };
        if let Some(house) = self.houses.get_mut(&house_id) {
            match house.rooms.iter_mut().find(|r| r.id == room.id) {
                Some(existing) => *existing = room.clone(),
                None => house.rooms.push(room.clone()),
            }
        }
        self.rooms.insert(room.id.clone(), room);
    }

    fn remove_room(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            let house_id = room.house_id.unwrap_or_default();
            if let Some(house) = self.houses.get_mut(&house_id) {
                house.rooms.retain(|r| r.id != room_id);
            }
        }
        self.private_rooms.remove(room_id);
    }
}

fn parse<T: DeserializeOwned>(data: &Value) -> Option<T> {
    match serde_json::from_value(data.clone()) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("Cache could not read payload: {}", e);
            None
        }
    }
}

/// `house_id` if present, otherwise `id`.
fn id_of(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .or_else(|| data.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ready() -> Ready {
        serde_json::from_value(json!({
            "session_id": "s1",
            "user": { "id": "u1", "username": "bot", "name": "Bot" },
            "house_memberships": {
                "h1": {
                    "id": "h1",
                    "name": "Lounge",
                    "rooms": [{ "id": "r1", "name": "general" }],
                    "entities": [{ "id": "e1", "name": "Rooms", "type": 1 }],
                    "members": [{ "user_id": "u2", "user": { "id": "u2", "username": "alice" } }]
                }
            },
            "private_rooms": [{ "id": "p1", "recipients": [{ "id": "u3", "username": "carol" }] }]
        }))
        .unwrap()
    }

    #[test]
    fn ready_fills_every_map() {
        let cache = Cache::new();
        cache.load_ready(&ready());

        assert_eq!(cache.client_user().unwrap().id, "u1");
        assert_eq!(cache.house("h1").unwrap().name.as_deref(), Some("Lounge"));
        assert_eq!(cache.room("r1").unwrap().house_id.as_deref(), Some("h1"));
        assert_eq!(cache.room("p1").unwrap().id, "p1");
        assert!(cache.private_room("r1").is_none());
        assert_eq!(cache.entity("e1").unwrap().name.as_deref(), Some("Rooms"));
        assert_eq!(cache.find_user("ALICE").unwrap().id, "u2");
        assert!(cache.user("u3").is_some());
        assert_eq!(cache.find_house("lounge").unwrap().id, "h1");
    }

    #[test]
    fn room_events_update_house() {
        let cache = Cache::new();
        cache.load_ready(&ready());

        cache.apply("ROOM_CREATE", &json!({ "id": "r2", "house_id": "h1", "name": "memes" }));
        assert_eq!(cache.house("h1").unwrap().rooms.len(), 2);

        cache.apply("room_update", &json!({ "id": "r2", "house_id": "h1", "name": "dank" }));
        assert_eq!(cache.room("r2").unwrap().name.as_deref(), Some("dank"));
        assert_eq!(cache.house("h1").unwrap().rooms.len(), 2);

        cache.apply("ROOM_DELETE", &json!({ "id": "r2", "house_id": "h1" }));
        assert!(cache.room("r2").is_none());
        assert_eq!(cache.house("h1").unwrap().rooms.len(), 1);
    }

    #[test]
    fn house_leave_drops_its_rooms() {
        let cache = Cache::new();
        cache.load_ready(&ready());

        cache.apply("HOUSE_LEAVE", &json!({ "house_id": "h1" }));

        assert!(cache.house("h1").is_none());
        assert!(cache.room("r1").is_none());
        assert!(cache.entity("e1").is_none());
        assert!(cache.user("u2").is_some());
    }

    #[test]
    fn house_join_and_member_events() {
        let cache = Cache::new();
        cache.apply("HOUSE_JOIN", &json!({ "id": "h2", "name": "Arcade", "rooms": [{ "id": "r9" }] }));
        assert_eq!(cache.room("r9").unwrap().house_id.as_deref(), Some("h2"));

        cache.apply(
            "HOUSE_MEMBER_JOIN",
            &json!({ "house_id": "h2", "user_id": "u7", "user": { "id": "u7", "username": "dave" } }),
        );
        assert_eq!(cache.house("h2").unwrap().members.len(), 1);
        assert_eq!(cache.user("u7").unwrap().username, "dave");

        cache.apply("HOUSE_MEMBER_LEAVE", &json!({ "house_id": "h2", "user_id": "u7" }));
        assert!(cache.house("h2").unwrap().members.is_empty());

        cache.apply("HOUSE_UPDATE", &json!({ "id": "h2", "name": "Arcade 2" }));
        let house = cache.house("h2").unwrap();
        assert_eq!(house.name.as_deref(), Some("Arcade 2"));
        assert_eq!(house.rooms.len(), 1);
    }
}
