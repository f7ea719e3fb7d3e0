//! Microsoft Graph mailbox client.
//!
//! Every call goes through [`MailClient::dispatch`], which asks the token
//! guard for a fresh bearer token before sending, so multi-page reads and
//! compound operations never run on an expired token.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header::CONTENT_TYPE, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use super::mailbox::{Mailbox, WellKnownFolder};
use super::models::{BodyType, ForwardDraft, MailFolder, OutgoingMessage, Recipient};
use super::query::QueryFilters;
use crate::auth::{TokenGuard, TokenProvider, TokenRecord};
use crate::config::Config;
use crate::error::{GraphError, GraphResult};
use crate::http::{response, HttpSession};

/// Default cap on pages followed by one paginated read.
pub const DEFAULT_MAX_PAGES: usize = 1000;

/// Tuning knobs for a [`MailClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Pages a single paginated read may fetch.
    pub max_pages: usize,
    /// Pause between consecutive pages.
    pub page_delay: Option<Duration>,
    /// Refresh the token this long before it expires.
    pub refresh_skew: chrono::Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            page_delay: None,
            refresh_skew: chrono::Duration::seconds(60),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_pages: config.pagination.max_pages,
            page_delay: config.page_delay(),
            refresh_skew: config.refresh_skew(),
        }
    }
}

/// Mailbox operations over Microsoft Graph v1.0.
pub struct MailClient {
    session: HttpSession,
    guard: TokenGuard,
    options: ClientOptions,
}

impl MailClient {
    /// Build the token provider and HTTP session from configuration and sign in.
    pub async fn connect(config: &Config) -> GraphResult<Self> {
        let provider = config.credentials().provider()?;
        let session = HttpSession::new(&config.graph.base_url, config.retry_policy())?
            .with_timeout(config.request_timeout());
        Self::new(provider, session, ClientOptions::from_config(config)).await
    }

    /// Acquire the initial token through `provider`.
    pub async fn new(
        provider: Arc<dyn TokenProvider>,
        session: HttpSession,
        options: ClientOptions,
    ) -> GraphResult<Self> {
        let guard = TokenGuard::acquire(provider, options.refresh_skew).await?;
        Ok(Self::with_guard(guard, session, options))
    }

    pub fn with_guard(guard: TokenGuard, session: HttpSession, options: ClientOptions) -> Self {
        Self {
            session,
            guard,
            options,
        }
    }

    pub fn guard(&self) -> &TokenGuard {
        &self.guard
    }

    /// Snapshot of the token currently in use.
    pub async fn token(&self) -> TokenRecord {
        self.guard.current().await
    }

    /// Serialize query options the way every call appends them.
    pub fn filter_query(filters: &QueryFilters) -> GraphResult<String> {
        filters.to_query_string()
    }

    // ----- folders -----

    pub async fn create_folder(
        &self,
        mailbox: &Mailbox,
        name: &str,
        is_hidden: bool,
    ) -> GraphResult<MailFolder> {
        let url = self.url(mailbox, &["mailFolders"], None)?;
        let payload = json!({ "displayName": name, "isHidden": is_hidden });
        let response = self.dispatch(Method::POST, url, |r| r.json(&payload)).await?;
        info!("Created folder '{}' in {}", name, mailbox);
        decode(response::json(response).await?)
    }

    pub async fn delete_folder(&self, mailbox: &Mailbox, folder_id: &str) -> GraphResult<()> {
        let url = self.url(mailbox, &["mailFolders", folder_id], None)?;
        let response = self.dispatch(Method::DELETE, url, |r| r).await?;
        response::empty(response).await
    }

    /// One page of folders; defaults to `top=200, select=id,displayName`.
    pub async fn list_folders(
        &self,
        mailbox: &Mailbox,
        filters: Option<&QueryFilters>,
    ) -> GraphResult<Vec<MailFolder>> {
        let defaults = QueryFilters::new()
            .with("top", "200")
            .with("select", "id,displayName");
        let filters = non_empty(filters).unwrap_or(&defaults);

        let url = self.url(mailbox, &["mailFolders"], Some(filters))?;
        let response = self.dispatch(Method::GET, url, |r| r).await?;
        let values = take_values(response::json(response).await?)?;
        values.into_iter().map(decode).collect()
    }

    /// Id of the first folder whose display name matches exactly.
    pub async fn folder_id_by_name(
        &self,
        mailbox: &Mailbox,
        name: &str,
    ) -> GraphResult<Option<String>> {
        let folders = self.list_folders(mailbox, None).await?;
        Ok(folders
            .into_iter()
            .find(|folder| folder.display_name == name)
            .map(|folder| folder.id))
    }

    // ----- reading -----

    pub async fn search_messages(&self, mailbox: &Mailbox, text: &str) -> GraphResult<Vec<Value>> {
        let filters = QueryFilters::new().with("search", text);
        let url = self.url(mailbox, &["messages"], Some(&filters))?;
        let response = self.dispatch(Method::GET, url, |r| r).await?;
        take_values(response::json(response).await?)
    }

    pub async fn list_attachments(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
    ) -> GraphResult<Vec<Value>> {
        let filters = QueryFilters::new().with("top", "999");
        let url = self.url(mailbox, &["messages", message_id, "attachments"], Some(&filters))?;
        let response = self.dispatch(Method::GET, url, |r| r).await?;
        take_values(response::json(response).await?)
    }

    pub async fn read_message_metadata(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        body_type: BodyType,
    ) -> GraphResult<Value> {
        let url = self.url(mailbox, &["messages", message_id], None)?;
        let response = self
            .dispatch(Method::GET, url, |r| r.header("Prefer", body_type.prefer_header()))
            .await?;
        response::json(response).await
    }

    /// Raw RFC 822 content of a message.
    pub async fn read_message_mime(&self, mailbox: &Mailbox, message_id: &str) -> GraphResult<Vec<u8>> {
        let url = self.url(mailbox, &["messages", message_id, "$value"], None)?;
        let response = self.dispatch(Method::GET, url, |r| r).await?;
        response::bytes(response).await
    }

    /// Metadata plus an `attachments` array, fetched only when
    /// `hasAttachments` is true.
    pub async fn read_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        body_type: BodyType,
    ) -> GraphResult<Value> {
        let mut message = self.read_message_metadata(mailbox, message_id, body_type).await?;

        let attachments = if message.get("hasAttachments").and_then(Value::as_bool) == Some(true) {
            self.list_attachments(mailbox, message_id).await?
        } else {
            Vec::new()
        };

        let Some(object) = message.as_object_mut() else {
            return Err(GraphError::Decode(format!(
                "message {} is not a JSON object",
                message_id
            )));
        };
        object.insert("attachments".into(), Value::Array(attachments));
        Ok(message)
    }

    /// All messages of a folder (or the whole mailbox), following every page.
    ///
    /// Defaults to `select=id`. `page_delay` overrides the configured pause.
    pub async fn folder_messages(
        &self,
        mailbox: &Mailbox,
        folder: Option<&str>,
        filters: Option<&QueryFilters>,
        page_delay: Option<Duration>,
    ) -> GraphResult<Vec<Value>> {
        let defaults = QueryFilters::new().with("select", "id");
        let filters = non_empty(filters).unwrap_or(&defaults);

        let url = match folder {
            Some(folder) => self.url(mailbox, &["mailFolders", folder, "messages"], Some(filters))?,
            None => self.url(mailbox, &["messages"], Some(filters))?,
        };
        self.paginate(url, page_delay.or(self.options.page_delay)).await
    }

    /// Messages of one conversation; caller filters override the
    /// conversation filter key by key.
    pub async fn thread_messages(
        &self,
        mailbox: &Mailbox,
        conversation_id: &str,
        filters: Option<&QueryFilters>,
        folder: Option<&str>,
    ) -> GraphResult<Vec<Value>> {
        let mut merged = conversation_filter(conversation_id);
        if let Some(filters) = filters {
            merged = merged.merged(filters);
        }
        self.folder_messages(mailbox, folder, Some(&merged), None).await
    }

    // ----- sending -----

    pub async fn send_mail(&self, mailbox: &Mailbox, message: &OutgoingMessage) -> GraphResult<()> {
        let url = self.url(mailbox, &["sendMail"], None)?;
        let payload = message.to_payload();
        let response = self.dispatch(Method::POST, url, |r| r.json(&payload)).await?;
        response::empty(response).await?;
        info!(
            "Sent '{}' to {} recipient(s) with {} attachment(s)",
            message.subject,
            message.to.len() + message.cc.len(),
            message.attachments.len()
        );
        Ok(())
    }

    /// Send a complete MIME message; Graph expects it base64 encoded.
    pub async fn send_mime(&self, mailbox: &Mailbox, raw_mime: &[u8]) -> GraphResult<()> {
        let url = self.url(mailbox, &["sendMail"], None)?;
        let body = STANDARD.encode(raw_mime);
        let response = self
            .dispatch(Method::POST, url, |r| r.header(CONTENT_TYPE, "text/plain").body(body))
            .await?;
        response::empty(response).await
    }

    pub async fn forward_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        to: &[String],
        comment: &str,
    ) -> GraphResult<()> {
        let url = self.url(mailbox, &["messages", message_id, "forward"], None)?;
        let payload = json!({ "comment": comment, "toRecipients": Recipient::list(to) });
        let response = self.dispatch(Method::POST, url, |r| r.json(&payload)).await?;
        response::empty(response).await
    }

    // ----- moving and deleting -----

    /// Returns the moved message, which carries a new id.
    pub async fn move_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        destination: &str,
    ) -> GraphResult<Value> {
        let url = self.url(mailbox, &["messages", message_id, "move"], None)?;
        let payload = json!({ "destinationId": destination });
        let response = self.dispatch(Method::POST, url, |r| r.json(&payload)).await?;
        response::json(response).await
    }

    /// Move every message of a conversation; returns how many were moved.
    ///
    /// Stops at the first failure. Messages already moved stay moved.
    pub async fn move_thread(
        &self,
        mailbox: &Mailbox,
        conversation_id: &str,
        source_folder: Option<&str>,
        destination: &str,
    ) -> GraphResult<usize> {
        let filters = conversation_filter(conversation_id).with("select", "id");
        let messages = self
            .folder_messages(mailbox, source_folder, Some(&filters), None)
            .await?;
        info!(
            "Moving {} message(s) of conversation {} to {}",
            messages.len(),
            conversation_id,
            destination
        );

        let mut moved = 0;
        for message in &messages {
            let id = message
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| GraphError::Decode("message without id".into()))?;
            if let Err(e) = self.move_message(mailbox, id, destination).await {
                warn!(
                    "Moved {} of {} message(s) before failing on {}: {}",
                    moved,
                    messages.len(),
                    id,
                    e
                );
                return Err(e);
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Move a message to `destination`, `deleteditems` by default.
    pub async fn delete_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        destination: Option<&str>,
    ) -> GraphResult<Value> {
        let destination = destination.unwrap_or(WellKnownFolder::DeletedItems.as_str());
        self.move_message(mailbox, message_id, destination).await
    }

    pub async fn delete_thread(
        &self,
        mailbox: &Mailbox,
        conversation_id: &str,
        source_folder: Option<&str>,
    ) -> GraphResult<usize> {
        self.move_thread(
            mailbox,
            conversation_id,
            source_folder,
            WellKnownFolder::DeletedItems.as_str(),
        )
        .await
    }

    // ----- drafts -----

    pub async fn update_message(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        updates: &Value,
    ) -> GraphResult<Value> {
        let url = self.url(mailbox, &["messages", message_id], None)?;
        let response = self.dispatch(Method::PATCH, url, |r| r.json(updates)).await?;
        response::json(response).await
    }

    pub async fn add_attachment(
        &self,
        mailbox: &Mailbox,
        message_id: &str,
        name: &str,
        base64_content: &str,
    ) -> GraphResult<Value> {
        let url = self.url(mailbox, &["messages", message_id, "attachments"], None)?;
        let payload = json!({
            "@odata.type": "#microsoft.graph.fileAttachment",
            "name": name,
            "contentBytes": base64_content,
        });
        let response = self.dispatch(Method::POST, url, |r| r.json(&payload)).await?;
        response::json(response).await
    }

    /// Create a forward draft, attach files, rewrite recipients and
    /// subject/body, then send it.
    ///
    /// A failing step leaves the draft behind in the drafts folder.
    pub async fn draft_and_forward(&self, mailbox: &Mailbox, draft: &ForwardDraft) -> GraphResult<()> {
        let url = self.url(mailbox, &["messages", &draft.message_id, "createForward"], None)?;
        let response = self.dispatch(Method::POST, url, |r| r).await?;
        let created = response::json(response).await?;
        let draft_id = id_of(&created)?;
        info!("Created forward draft of {}", draft.message_id);

        for attachment in &draft.attachments {
            self.add_attachment(mailbox, &draft_id, &attachment.name, &attachment.content_base64())
                .await?;
        }

        let updated = self.update_message(mailbox, &draft_id, &draft.updates()).await?;
        let send_id = id_of(&updated).unwrap_or(draft_id);

        let url = self.url(mailbox, &["messages", &send_id, "send"], None)?;
        let response = self.dispatch(Method::POST, url, |r| r).await?;
        response::empty(response).await?;
        info!(
            "Forwarded {} to {} recipient(s)",
            draft.message_id,
            draft.to.len() + draft.cc.len()
        );
        Ok(())
    }

    // ----- plumbing -----

    fn url(
        &self,
        mailbox: &Mailbox,
        resource: &[&str],
        filters: Option<&QueryFilters>,
    ) -> GraphResult<Url> {
        let mut segments = mailbox.segments();
        segments.extend_from_slice(resource);
        let mut url = self.session.url(&segments)?;

        if let Some(filters) = filters {
            let query = filters.to_query_string()?;
            if let Some(query) = query.strip_prefix('?') {
                url.set_query(Some(query));
            }
        }
        Ok(url)
    }

    /// Send one request with a fresh bearer token.
    async fn dispatch<F>(&self, method: Method, url: Url, build: F) -> GraphResult<Response>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
    {
        let token = self.guard.bearer().await?;
        let request = build(
            self.session
                .request(method, url)
                .bearer_auth(token.as_str()),
        );
        self.session.send(request).await
    }

    /// Concatenate `value` arrays while `@odata.nextLink` points further.
    async fn paginate(&self, url: Url, page_delay: Option<Duration>) -> GraphResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages >= self.options.max_pages {
                return Err(GraphError::PageLimitExceeded {
                    limit: self.options.max_pages,
                });
            }
            if pages > 0 {
                if let Some(delay) = page_delay {
                    sleep(delay).await;
                }
            }

            debug!("Fetching page {} from {}", pages + 1, url);
            let response = self.dispatch(Method::GET, url, |r| r).await?;
            let page = response::json(response).await?;
            pages += 1;

            next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(Url::parse)
                .transpose()?;
            items.extend(take_values(page)?);
        }

        debug!("Fetched {} item(s) in {} page(s)", items.len(), pages);
        Ok(items)
    }
}

fn conversation_filter(conversation_id: &str) -> QueryFilters {
    QueryFilters::new().with(
        "filter",
        format!("conversationId eq '{}'", conversation_id.replace('\'', "''")),
    )
}

fn non_empty(filters: Option<&QueryFilters>) -> Option<&QueryFilters> {
    filters.filter(|filters| !filters.is_empty())
}

/// The `value` array of a collection response.
fn take_values(mut page: Value) -> GraphResult<Vec<Value>> {
    match page.get_mut("value").map(Value::take) {
        Some(Value::Array(values)) => Ok(values),
        _ => Err(GraphError::Decode(
            "collection response without a value array".into(),
        )),
    }
}

fn id_of(resource: &Value) -> GraphResult<String> {
    resource
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GraphError::Decode("response without id".into()))
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> GraphResult<T> {
    serde_json::from_value(value).map_err(|e| GraphError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_manager::tests::CountingProvider;
    use crate::http::RetryPolicy;
    use crate::mail::models::FileAttachment;
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::atomic::Ordering;
    use wiremock::{
        matchers::{body_partial_json, body_string, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn session(server: &MockServer) -> HttpSession {
        let policy = RetryPolicy {
            backoff_factor: 0.0,
            ..RetryPolicy::default()
        };
        HttpSession::new(&format!("{}/v1.0/", server.uri()), policy).unwrap()
    }

    fn client_with(server: &MockServer, options: ClientOptions) -> MailClient {
        let record = TokenRecord::new(
            "test-token".into(),
            Utc::now() + chrono::Duration::hours(1),
            Map::new(),
        );
        let guard = TokenGuard::with_record(
            Arc::new(CountingProvider::default()),
            record,
            chrono::Duration::zero(),
        );
        MailClient::with_guard(guard, session(server), options)
    }

    fn client(server: &MockServer) -> MailClient {
        client_with(server, ClientOptions::default())
    }

    fn not_found() -> ResponseTemplate {
        ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": "ErrorItemNotFound", "message": "The specified object was not found in the store."}
        }))
    }

    #[tokio::test]
    async fn test_new_acquires_initial_token() {
        let server = MockServer::start().await;
        let provider = Arc::new(CountingProvider::default());
        let client = MailClient::new(provider.clone(), session(&server), ClientOptions::default())
            .await
            .unwrap();
        assert_eq!(client.token().await.access_token().as_str(), "token-1");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_list_folders_uses_default_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders"))
            .and(query_param("$top", "200"))
            .and(query_param("select", "id,displayName"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"id": "f1", "displayName": "Inbox"},
                    {"id": "f2", "displayName": "Invoices"},
                    {"id": "f3", "displayName": "Invoices"}
                ]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server);
        let folders = client.list_folders(&Mailbox::Me, None).await.unwrap();
        assert_eq!(folders.len(), 3);

        let id = client.folder_id_by_name(&Mailbox::Me, "Invoices").await.unwrap();
        assert_eq!(id.as_deref(), Some("f2"));
    }

    #[tokio::test]
    async fn test_folder_id_by_name_without_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users/shared@example.com/mailFolders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .mount(&server)
            .await;

        let mailbox = Mailbox::User("shared@example.com".into());
        let id = client(&server).folder_id_by_name(&mailbox, "Archive").await.unwrap();
        assert_eq!(id, None);
    }

    #[tokio::test]
    async fn test_create_and_delete_folder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/mailFolders"))
            .and(body_partial_json(json!({"displayName": "Receipts", "isHidden": true})))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"id": "f9", "displayName": "Receipts", "isHidden": true})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1.0/me/mailFolders/f9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let folder = client.create_folder(&Mailbox::Me, "Receipts", true).await.unwrap();
        assert_eq!(folder.id, "f9");
        assert_eq!(folder.is_hidden, Some(true));
        client.delete_folder(&Mailbox::Me, "f9").await.unwrap();
    }

    #[tokio::test]
    async fn test_pagination_concatenates_pages_in_order() {
        let server = MockServer::start().await;
        let next = format!("{}/v1.0/me/mailFolders/inbox/messages?$skip=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages"))
            .and(query_param("$select", "id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "m1"}, {"id": "m2"}],
                "@odata.nextLink": next
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages"))
            .and(query_param("$skip", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "m3"}]})))
            .expect(1)
            .mount(&server)
            .await;

        let messages = client(&server)
            .folder_messages(&Mailbox::Me, Some("inbox"), None, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        let ids: Vec<&str> = messages.iter().filter_map(|m| m["id"].as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_pagination_stops_at_page_cap() {
        let server = MockServer::start().await;
        let next = format!("{}/v1.0/me/messages?$skip=1", server.uri());
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "m1"}],
                "@odata.nextLink": next
            })))
            .expect(2)
            .mount(&server)
            .await;

        let options = ClientOptions {
            max_pages: 2,
            ..ClientOptions::default()
        };
        let result = client_with(&server, options)
            .folder_messages(&Mailbox::Me, None, None, None)
            .await;
        assert!(matches!(result, Err(GraphError::PageLimitExceeded { limit: 2 })));
    }

    #[tokio::test]
    async fn test_page_without_value_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": null})))
            .mount(&server)
            .await;

        let result = client(&server)
            .folder_messages(&Mailbox::Me, None, None, None)
            .await;
        assert!(matches!(result, Err(GraphError::Decode(_))));
    }

    #[tokio::test]
    async fn test_thread_messages_merges_caller_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .and(query_param("$filter", "conversationId eq 'AAQk=='"))
            .and(query_param("select", "id,subject"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "m1"}]})))
            .expect(1)
            .mount(&server)
            .await;

        let filters = QueryFilters::new().with("select", "id,subject");
        let messages = client(&server)
            .thread_messages(&Mailbox::Me, "AAQk==", Some(&filters), None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_filters_fail_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let filters = QueryFilters::new().with("limit", "5");
        let result = client(&server)
            .folder_messages(&Mailbox::Me, None, Some(&filters), None)
            .await;
        assert!(matches!(result, Err(GraphError::Validation(_))));
    }

    #[tokio::test]
    async fn test_read_message_without_attachments_skips_attachment_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1"))
            .and(header("prefer", "outlook.body-content-type=\"text\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1", "hasAttachments": false})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1/attachments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
            .expect(0)
            .mount(&server)
            .await;

        let message = client(&server)
            .read_message(&Mailbox::Me, "m1", BodyType::Text)
            .await
            .unwrap();
        assert_eq!(message["attachments"], json!([]));
    }

    #[tokio::test]
    async fn test_read_message_with_attachments_fetches_them_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1"))
            .and(header("prefer", "outlook.body-content-type=\"html\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1", "hasAttachments": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1/attachments"))
            .and(query_param("$top", "999"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "a1", "name": "q3.pdf"}]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let message = client(&server)
            .read_message(&Mailbox::Me, "m1", BodyType::Html)
            .await
            .unwrap();
        assert_eq!(message["attachments"][0]["name"], "q3.pdf");
    }

    #[tokio::test]
    async fn test_missing_message_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/users/a@example.com/messages/gone"))
            .respond_with(not_found())
            .mount(&server)
            .await;

        let mailbox = Mailbox::User("a@example.com".into());
        let err = client(&server)
            .read_message_metadata(&mailbox, "gone", BodyType::Text)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_message_mime_returns_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1/$value"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"Subject: hi\r\n\r\nbody".to_vec()))
            .mount(&server)
            .await;

        let mime = client(&server).read_message_mime(&Mailbox::Me, "m1").await.unwrap();
        assert_eq!(mime, b"Subject: hi\r\n\r\nbody");
    }

    #[tokio::test]
    async fn test_send_mail_and_send_mime() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/sendMail"))
            .and(body_partial_json(json!({
                "message": {"subject": "Hello", "toRecipients": [{"emailAddress": {"address": "a@example.com"}}]},
                "saveToSentItems": true
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/sendMail"))
            .and(header("content-type", "text/plain"))
            .and(body_string("U3ViamVjdDogaGk="))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        let message = OutgoingMessage::new(
            "Hello",
            crate::mail::models::ItemBody::text("hi"),
            vec!["a@example.com".into()],
        );
        client.send_mail(&Mailbox::Me, &message).await.unwrap();
        client.send_mime(&Mailbox::Me, b"Subject: hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_move_thread_moves_each_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/mailFolders/inbox/messages"))
            .and(query_param("$filter", "conversationId eq 'conv-1'"))
            .and(query_param("select", "id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "m1"}, {"id": "m2"}]})))
            .expect(1)
            .mount(&server)
            .await;
        for id in ["m1", "m2"] {
            Mock::given(method("POST"))
                .and(path(format!("/v1.0/me/messages/{}/move", id)))
                .and(body_partial_json(json!({"destinationId": "deleteditems"})))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": format!("{}-moved", id)})))
                .expect(1)
                .mount(&server)
                .await;
        }

        let moved = client(&server)
            .delete_thread(&Mailbox::Me, "conv-1", Some("inbox"))
            .await
            .unwrap();
        assert_eq!(moved, 2);
    }

    #[tokio::test]
    async fn test_move_thread_stops_at_first_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "m1"}, {"id": "m2"}, {"id": "m3"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m1/move"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "x1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m2/move"))
            .respond_with(not_found())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m3/move"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "x3"})))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server)
            .move_thread(&Mailbox::Me, "conv-1", None, "archive")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_message_defaults_to_deleted_items() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m1/move"))
            .and(body_partial_json(json!({"destinationId": "deleteditems"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "m1-new"})))
            .expect(1)
            .mount(&server)
            .await;

        let moved = client(&server)
            .delete_message(&Mailbox::Me, "m1", None)
            .await
            .unwrap();
        assert_eq!(moved["id"], "m1-new");
    }

    #[tokio::test]
    async fn test_forward_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m1/forward"))
            .and(body_partial_json(json!({
                "comment": "FYI",
                "toRecipients": [{"emailAddress": {"address": "b@example.com"}}]
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .forward_message(&Mailbox::Me, "m1", &["b@example.com".to_string()], "FYI")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_draft_and_forward_runs_every_step() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m1/createForward"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "draft-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/draft-1/attachments"))
            .and(body_partial_json(json!({"name": "notes.txt", "contentBytes": "aGVsbG8="})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "att-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/v1.0/me/messages/draft-1"))
            .and(body_partial_json(json!({
                "subject": "FW: notes",
                "toRecipients": [{"emailAddress": {"address": "c@example.com"}}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "draft-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/draft-1/send"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let mut draft = ForwardDraft::new("m1", vec!["c@example.com".into()]);
        draft.subject = Some("FW: notes".into());
        draft.attachments.push(FileAttachment::new("notes.txt", b"hello".to_vec()));
        client(&server).draft_and_forward(&Mailbox::Me, &draft).await.unwrap();
    }

    #[tokio::test]
    async fn test_draft_and_forward_stops_when_draft_creation_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/me/messages/m1/createForward"))
            .respond_with(not_found())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let draft = ForwardDraft::new("m1", vec!["c@example.com".into()]);
        let err = client(&server)
            .draft_and_forward(&Mailbox::Me, &draft)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_before_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1.0/me/messages/m1"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
            .expect(1)
            .mount(&server)
            .await;

        let provider = Arc::new(CountingProvider::default());
        let stale = TokenRecord::new(
            "stale".into(),
            Utc::now() - chrono::Duration::minutes(1),
            Map::new(),
        );
        let guard = TokenGuard::with_record(provider.clone(), stale, chrono::Duration::zero());
        let client = MailClient::with_guard(guard, session(&server), ClientOptions::default());

        client
            .read_message_metadata(&Mailbox::Me, "m1", BodyType::Text)
            .await
            .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_query() {
        let filters = QueryFilters::new().with("search", "invoice 2024");
        assert_eq!(
            MailClient::filter_query(&filters).unwrap(),
            "?$search=invoice%202024"
        );
    }
}
