//! Client side of the wire: `reqwest` PUTs and WebSocket feed connections.

use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use axum::http::StatusCode;

use crate::error::SyncError;
use crate::protocol::{
    ClientId, DocumentId, FeedMessage, Table, CLIENT_ID_PARAM, DOCUMENT_ID_PARAM, OFFSET_PARAM,
};

/// HTTP and WebSocket access to one sync server on behalf of one session.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    session_token: Option<String>,
}

impl HttpTransport {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:9090`.
    pub fn new(
        base_url: impl Into<String>,
        session_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        let base_url: String = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token,
        })
    }

    /// Append one update to a document's log.
    pub async fn append_update(&self, doc_id: DocumentId, payload: &[u8]) -> Result<(), SyncError> {
        let url = format!(
            "{}/document-updates?{DOCUMENT_ID_PARAM}={doc_id}",
            self.base_url
        );
        self.put(url, payload.to_vec()).await
    }

    /// Upsert this client's presence row.
    pub async fn upsert_presence(
        &self,
        doc_id: DocumentId,
        client_id: ClientId,
        payload: &[u8],
    ) -> Result<(), SyncError> {
        if payload.is_empty() {
            return Err(SyncError::InvalidPayload("empty presence payload".into()));
        }
        self.put(self.presence_url(doc_id, client_id), payload.to_vec()).await
    }

    /// Withdraw this client's presence row.
    pub async fn delete_presence(&self, doc_id: DocumentId, client_id: ClientId) -> Result<(), SyncError> {
        self.put(self.presence_url(doc_id, client_id), Vec::new()).await
    }

    fn presence_url(&self, doc_id: DocumentId, client_id: ClientId) -> String {
        format!(
            "{}/presence-updates?{DOCUMENT_ID_PARAM}={doc_id}&{CLIENT_ID_PARAM}={client_id}",
            self.base_url
        )
    }

    async fn put(&self, url: String, body: Vec<u8>) -> Result<(), SyncError> {
        let mut request = self
            .http
            .put(url)
            .header(header::CONTENT_TYPE.as_str(), "application/octet-stream")
            .body(body);
        if let Some(token) = &self.session_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(code, body))
    }

    /// Open a change feed on `table` for `doc_id`, resuming after `offset`.
    pub async fn subscribe(
        &self,
        table: Table,
        doc_id: DocumentId,
        offset: u64,
    ) -> Result<FeedStream, SyncError> {
        let url = format!(
            "{}/replication/{table}?{DOCUMENT_ID_PARAM}={doc_id}&{OFFSET_PARAM}={offset}",
            websocket_base(&self.base_url)
        );
        let mut request = url.into_client_request()?;
        if let Some(token) = &self.session_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::InvalidPayload(format!("unusable session token: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        log::debug!("Subscribed to {table} of document {doc_id} from offset {offset}");
        Ok(FeedStream { socket, table })
    }
}

fn websocket_base(base_url: &str) -> String {
    match base_url.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => base_url.to_string(),
    }
}

/// An open change feed.
pub struct FeedStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    table: Table,
}

impl FeedStream {
    /// Next feed message. `None` when the server closed the feed.
    pub async fn next(&mut self) -> Option<Result<FeedMessage, SyncError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Binary(frame)) => {
                    return Some(FeedMessage::decode(&frame).map_err(SyncError::from));
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Principal, StaticAccessControl};
    use crate::server::{spawn_local, ServerConfig, SyncServer};
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_websocket_base() {
        assert_eq!(websocket_base("http://localhost:9090"), "ws://localhost:9090");
        assert_eq!(websocket_base("https://sync.example.com"), "wss://sync.example.com");
        assert_eq!(websocket_base("ws://already"), "ws://already");
    }

    async fn fixture() -> (SyncServer, String, DocumentId) {
        let doc = Uuid::new_v4();
        let access = StaticAccessControl::new();
        access.add_session("tok", Principal::new("alice"));
        access.add_session("tok-outsider", Principal::new("mallory"));
        access.add_member("acme", Principal::new("alice"));
        access.assign_document(doc, "acme");
        let server = SyncServer::with_store(
            ServerConfig::for_testing(),
            Arc::new(MemoryStore::new()),
            Arc::new(access),
        );
        let (addr, _handle) = spawn_local(server.clone()).await.unwrap();
        (server, format!("http://{addr}"), doc)
    }

    fn transport(base: &str, token: &str) -> HttpTransport {
        HttpTransport::new(base, Some(token.to_string()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_append_then_subscribe() {
        let (server, base, doc) = fixture().await;
        let client = transport(&base, "tok");
        client.append_update(doc, b"first").await.unwrap();

        let mut feed = client.subscribe(Table::DocumentUpdates, doc, 0).await.unwrap();
        assert_eq!(
            feed.next().await.unwrap().unwrap(),
            FeedMessage::Update { seq: 1, payload: b"first".to_vec() }
        );
        assert_eq!(feed.next().await.unwrap().unwrap(), FeedMessage::UpToDate { cursor: 1 });

        client.append_update(doc, b"second").await.unwrap();
        assert_eq!(
            feed.next().await.unwrap().unwrap(),
            FeedMessage::Update { seq: 2, payload: b"second".to_vec() }
        );
        feed.close().await;
        server.shutdown();
    }

    #[tokio::test]
    async fn test_errors_map_to_taxonomy() {
        let (server, base, doc) = fixture().await;

        let outsider = transport(&base, "tok-outsider");
        assert_eq!(outsider.append_update(doc, b"x").await, Err(SyncError::Forbidden));
        assert!(matches!(
            outsider.subscribe(Table::PresenceUpdates, doc, 0).await,
            Err(SyncError::Forbidden)
        ));

        let anonymous = HttpTransport::new(&base, None, Duration::from_secs(5)).unwrap();
        assert_eq!(anonymous.append_update(doc, b"x").await, Err(SyncError::Unauthenticated));

        let member = transport(&base, "tok");
        assert!(matches!(
            member.append_update(doc, b"").await,
            Err(SyncError::InvalidPayload(_))
        ));
        assert!(matches!(
            member.append_update(Uuid::new_v4(), b"x").await,
            Err(SyncError::NotFound(_))
        ));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = transport(&format!("http://{addr}"), "tok");
        let err = client.append_update(Uuid::new_v4(), b"x").await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
        let err = client
            .subscribe(Table::DocumentUpdates, Uuid::new_v4(), 0)
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable(), "{err:?}");
    }
}
