use serde::{Deserialize, Serialize};

pub type Snowflake = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub icon: Option<String>,
    pub header: Option<String>,
    #[serde(default)]
    pub bot: Option<bool>,
    pub presence: Option<String>,
    pub flags: Option<String>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct House {
    pub id: Snowflake,
    pub name: Option<String>,
    pub owner_id: Option<Snowflake>,
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub default_permissions: Option<u64>,
    #[serde(default)]
    pub rooms: Vec<Room>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub members: Vec<Member>,
}

impl House {
    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.iter().find(|r| r.id == room_id)
    }

    /// The entity new rooms land in when no parent is given.
    pub fn default_entity(&self) -> Option<&Entity> {
        self.entities
            .iter()
            .find(|e| e.name.as_deref() == Some("Rooms"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Snowflake,
    pub house_id: Option<Snowflake>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub emoji: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub kind: Option<u8>,
    pub position: Option<i64>,
    pub last_message_id: Option<Snowflake>,
    pub recipients: Option<Vec<User>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Snowflake,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<u8>,
    pub position: Option<i64>,
    #[serde(default)]
    pub resource_pointers: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user_id: Option<Snowflake>,
    pub house_id: Option<Snowflake>,
    pub user: Option<User>,
    pub joined_at: Option<String>,
    #[serde(default)]
    pub roles: Vec<serde_json::Value>,
}

impl Member {
    pub fn display_name(&self) -> &str {
        self.user.as_ref().map(User::display_name).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub room_id: Option<Snowflake>,
    pub house_id: Option<Snowflake>,
    pub author_id: Option<Snowflake>,
    pub author: Option<User>,
    pub content: Option<String>,
    pub timestamp: Option<serde_json::Value>,
    pub edited_at: Option<String>,
    #[serde(default)]
    pub mentions: Vec<User>,
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub embed: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub media_url: Option<String>,
    pub dimensions: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub code: String,
    pub url: Option<String>,
    pub house_id: Option<Snowflake>,
    pub max_age: Option<u64>,
    pub max_uses: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<u8>,
}

/// Payload of the gateway Hello frame; intervals are in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    pub hbt_int: Option<u64>,
    pub heartbeat_interval: Option<u64>,
}

impl Hello {
    pub fn interval_ms(&self) -> Option<u64> {
        self.hbt_int.or(self.heartbeat_interval).filter(|ms| *ms > 0)
    }
}

/// Payload of the READY (`INIT_STATE`) event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub session_id: Option<String>,
    pub resume_token: Option<String>,
    pub user: Option<User>,
    #[serde(default)]
    pub house_memberships: serde_json::Value,
    #[serde(default)]
    pub private_rooms: Vec<Room>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EditProfilePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EditRoomPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}
