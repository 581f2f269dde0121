use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::ClientError;
use crate::gateway::SessionState;
use crate::model::*;

/// Raw outcome of one REST call.
#[derive(Debug, Clone, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

/// The request layer the client talks to. Knows nothing about endpoints.
#[async_trait]
pub trait RestClient: Send + Sync {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<RestResponse, ClientError>;
}

/// [`RestClient`] on top of `reqwest`.
pub struct ReqwestRest {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestRest {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("hiven-rust"));

        Ok(Self {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .timeout(timeout)
                .build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: &str,
    ) -> Result<RestResponse, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let auth = HeaderValue::from_str(token)
            .map_err(|_| ClientError::Auth("token contains invalid header characters".into()))?;

        let mut request = self.client.request(method, &url).header(AUTHORIZATION, auth);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(RestResponse { status, body })
    }
}

/// REST surface handed to handlers through [`Context`](crate::client::Context).
///
/// Every call checks that the gateway session is `Ready` first and fails
/// with [`NotConnected`](ClientError::NotConnected) right away otherwise.
/// A call still in flight when the connection drops fails the same way, even
/// if a new connection comes up before the response arrives.
pub struct Http {
    rest: Arc<dyn RestClient>,
    session: Arc<SessionState>,
    token: RwLock<Option<String>>,
}

impl Http {
    pub fn new(rest: Arc<dyn RestClient>, session: Arc<SessionState>) -> Self {
        Self {
            rest,
            session,
            token: RwLock::new(None),
        }
    }

    pub(crate) fn authorize(&self, token: &str) {
        *self.token.write() = Some(token.to_string());
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let epoch = self.session.require_ready()?;
        let token = self.token.read().clone().ok_or(ClientError::NotConnected)?;

        let response = tokio::select! {
            biased;
            () = epoch.token.cancelled() => {
                log::debug!("{} {} abandoned: connection epoch {} ended", method, path, epoch.id);
                return Err(ClientError::NotConnected);
            }
            response = self.rest.request(method.clone(), path, body.as_ref(), &token) => response?,
        };

        if !self.session.is_current(epoch.id) {
            return Err(ClientError::NotConnected);
        }

        unwrap_envelope(&method, path, response)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ClientError> {
        let data = self.request(method, path, body).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn get_me(&self) -> Result<User, ClientError> {
        self.call(Method::GET, "/users/@me", None).await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, ClientError> {
        self.call(Method::GET, &format!("/users/{}", user_id), None).await
    }

    pub async fn edit_profile(&self, payload: &EditProfilePayload) -> Result<(), ClientError> {
        let body = serde_json::to_value(payload)?;
        self.request(Method::PATCH, "/users/@me", Some(body)).await?;
        Ok(())
    }

    pub async fn send_message(&self, room_id: &str, content: &str) -> Result<Message, ClientError> {
        let body = json!({ "content": content });
        self.call(Method::POST, &format!("/rooms/{}/messages", room_id), Some(body))
            .await
    }

    pub async fn delete_message(&self, room_id: &str, message_id: &str) -> Result<(), ClientError> {
        let path = format!("/rooms/{}/messages/{}", room_id, message_id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }

    pub async fn edit_room(&self, room_id: &str, payload: &EditRoomPayload) -> Result<(), ClientError> {
        let body = serde_json::to_value(payload)?;
        self.request(Method::PATCH, &format!("/rooms/{}", room_id), Some(body))
            .await?;
        Ok(())
    }

    pub async fn get_member(&self, house_id: &str, user_id: &str) -> Result<Member, ClientError> {
        self.call(Method::GET, &format!("/houses/{}/users/{}", house_id, user_id), None)
            .await
    }

    pub async fn get_house(&self, house_id: &str) -> Result<House, ClientError> {
        self.call(Method::GET, &format!("/houses/{}", house_id), None).await
    }

    pub async fn edit_house(&self, house_id: &str, name: &str) -> Result<(), ClientError> {
        let body = json!({ "name": name });
        self.request(Method::PATCH, &format!("/houses/{}", house_id), Some(body))
            .await?;
        Ok(())
    }

    pub async fn create_room(
        &self,
        house_id: &str,
        name: &str,
        parent_entity_id: Option<&str>,
    ) -> Result<Room, ClientError> {
        let mut body = json!({ "name": name });
        if let Some(parent) = parent_entity_id {
            body["parent_entity_id"] = json!(parent);
        }
        self.call(Method::POST, &format!("/houses/{}/rooms", house_id), Some(body))
            .await
    }

    pub async fn create_entity(&self, house_id: &str, name: &str) -> Result<Entity, ClientError> {
        let body = json!({ "name": name, "type": 1 });
        self.call(Method::POST, &format!("/houses/{}/entities", house_id), Some(body))
            .await
    }

    pub async fn create_invite(&self, house_id: &str, max_uses: Option<u64>) -> Result<Invite, ClientError> {
        let body = max_uses.map(|uses| json!({ "max_uses": uses }));
        self.call(Method::POST, &format!("/houses/{}/invites", house_id), body)
            .await
    }

    pub async fn leave_house(&self, house_id: &str) -> Result<(), ClientError> {
        self.request(Method::DELETE, &format!("/users/@me/houses/{}", house_id), None)
            .await?;
        Ok(())
    }

    pub async fn delete_house(&self, house_id: &str) -> Result<(), ClientError> {
        self.request(Method::DELETE, &format!("/houses/{}", house_id), None)
            .await?;
        Ok(())
    }

    pub async fn kick_member(&self, house_id: &str, user_id: &str) -> Result<(), ClientError> {
        let path = format!("/houses/{}/members/{}", house_id, user_id);
        self.request(Method::DELETE, &path, None).await?;
        Ok(())
    }
}

/// Hiven wraps successful bodies as `{"success": true, "data": ...}` and
/// failures as `{"error": {"code": ..., "message": ...}}`.
fn unwrap_envelope(method: &Method, path: &str, response: RestResponse) -> Result<Value, ClientError> {
    let RestResponse { status, mut body } = response;

    let error = body
        .get("error")
        .filter(|e| !e.is_null() && **e != Value::Bool(false));
    if !(200..300).contains(&status) || error.is_some() {
        let detail = error.cloned().unwrap_or_else(|| body.clone());
        log::debug!("{} {} failed with HTTP {}: {}", method, path, status, detail);
        return Err(ClientError::Api(format!("HTTP {}: {}", status, detail)));
    }

    match body.get_mut("data") {
        Some(data) => Ok(data.take()),
        None => Ok(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConnectionStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct MockRest {
        calls: AtomicUsize,
        response: RestResponse,
        gate: Option<Arc<Notify>>,
    }

    impl MockRest {
        fn new(status: u16, body: Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: RestResponse { status, body },
                gate: None,
            }
        }
    }

    #[async_trait]
    impl RestClient for MockRest {
        async fn request(
            &self,
            _method: Method,
            _path: &str,
            _body: Option<&Value>,
            token: &str,
        ) -> Result<RestResponse, ClientError> {
            assert_eq!(token, "token");
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.response.clone())
        }
    }

    fn ready_session() -> Arc<SessionState> {
        let session = Arc::new(SessionState::new());
        session.begin_epoch(false);
        session.set_status(ConnectionStatus::Ready);
        session
    }

    fn http(rest: Arc<MockRest>, session: Arc<SessionState>) -> Http {
        let http = Http::new(rest, session);
        http.authorize("token");
        http
    }

    #[tokio::test]
    async fn fails_fast_when_not_ready() {
        let rest = Arc::new(MockRest::new(200, json!({})));
        let session = Arc::new(SessionState::new());
        session.begin_epoch(false);
        session.set_status(ConnectionStatus::Reconnecting);
        let http = http(rest.clone(), session);

        let result = http.send_message("1", "hi").await;

        assert!(matches!(result, Err(ClientError::NotConnected)));
        assert_eq!(rest.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unwraps_data_envelope() {
        let body = json!({
            "success": true,
            "data": { "id": "9", "room_id": "1", "author_id": "2", "content": "hi" }
        });
        let rest = Arc::new(MockRest::new(200, body));
        let http = http(rest, ready_session());

        let message = http.send_message("1", "hi").await.unwrap();

        assert_eq!(message.id, "9");
        assert_eq!(message.content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn error_body_becomes_api_error() {
        let body = json!({ "success": false, "error": { "code": "forbidden", "message": "Missing permissions" } });
        let rest = Arc::new(MockRest::new(403, body));
        let http = http(rest, ready_session());

        let err = http.kick_member("1", "2").await.unwrap_err();

        match err {
            ClientError::Api(detail) => {
                assert!(detail.starts_with("HTTP 403"));
                assert!(detail.contains("Missing permissions"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_flight_call_fails_when_epoch_ends() {
        let gate = Arc::new(Notify::new());
        let rest = Arc::new(MockRest {
            gate: Some(gate.clone()),
            ..MockRest::new(200, json!({ "data": null }))
        });
        let session = ready_session();
        let http = Arc::new(http(rest.clone(), session.clone()));

        let pending = tokio::spawn({
            let http = http.clone();
            async move { http.delete_house("1").await }
        });
        while rest.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        session.set_status(ConnectionStatus::Reconnecting);
        session.begin_epoch(true);
        session.set_status(ConnectionStatus::Ready);
        gate.notify_one();

        assert!(matches!(pending.await.unwrap(), Err(ClientError::NotConnected)));
    }
}
