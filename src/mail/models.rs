//! Graph mail payload models.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Fallback when the attachment content has no recognizable signature.
const OCTET_STREAM: &str = "application/octet-stream";

/// An email address with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A message recipient (`toRecipients`, `ccRecipients`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub email_address: EmailAddress,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            email_address: EmailAddress {
                address: address.into(),
                name: None,
            },
        }
    }

    pub fn list(addresses: &[String]) -> Vec<Recipient> {
        addresses.iter().map(Recipient::new).collect()
    }
}

/// Body format for outgoing messages and the `Prefer` header on reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    #[default]
    Text,
    Html,
}

impl BodyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Html => "html",
        }
    }

    /// Value of the `Prefer` header selecting this body format.
    pub fn prefer_header(&self) -> String {
        format!("outlook.body-content-type=\"{}\"", self.as_str())
    }
}

impl std::str::FromStr for BodyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "html" => Ok(Self::Html),
            other => Err(format!("unknown body type '{}', expected text or html", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    pub content_type: BodyType,
    pub content: String,
}

impl ItemBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: BodyType::Text,
            content: content.into(),
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content_type: BodyType::Html,
            content: content.into(),
        }
    }
}

/// A file attached to an outgoing message or draft.
#[derive(Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub name: String,
    pub content: Vec<u8>,
}

impl FileAttachment {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    /// MIME type sniffed from the content's magic bytes.
    pub fn content_type(&self) -> &'static str {
        infer::get(&self.content)
            .map(|kind| kind.mime_type())
            .unwrap_or(OCTET_STREAM)
    }

    pub fn content_base64(&self) -> String {
        STANDARD.encode(&self.content)
    }

    /// `#microsoft.graph.fileAttachment` resource.
    pub fn to_graph(&self) -> Value {
        json!({
            "@odata.type": "#microsoft.graph.fileAttachment",
            "name": self.name,
            "contentType": self.content_type(),
            "contentBytes": self.content_base64(),
        })
    }
}

impl std::fmt::Debug for FileAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAttachment")
            .field("name", &self.name)
            .field("bytes", &self.content.len())
            .finish()
    }
}

/// A new message for `sendMail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub subject: String,
    pub body: ItemBody,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub attachments: Vec<FileAttachment>,
    pub save_to_sent_items: bool,
}

impl OutgoingMessage {
    pub fn new(subject: impl Into<String>, body: ItemBody, to: Vec<String>) -> Self {
        Self {
            subject: subject.into(),
            body,
            to,
            cc: Vec::new(),
            attachments: Vec::new(),
            save_to_sent_items: true,
        }
    }

    /// Request body for `POST {mailbox}/sendMail`.
    pub fn to_payload(&self) -> Value {
        let attachments: Vec<Value> = self.attachments.iter().map(FileAttachment::to_graph).collect();
        json!({
            "message": {
                "subject": self.subject,
                "body": self.body,
                "toRecipients": Recipient::list(&self.to),
                "ccRecipients": Recipient::list(&self.cc),
                "attachments": attachments,
            },
            "saveToSentItems": self.save_to_sent_items,
        })
    }
}

/// Forward an existing message through an editable draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardDraft {
    pub message_id: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Replaces the draft subject when set.
    pub subject: Option<String>,
    /// Replaces the draft body (plain text) when set.
    pub body: Option<String>,
    pub attachments: Vec<FileAttachment>,
}

impl ForwardDraft {
    pub fn new(message_id: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            message_id: message_id.into(),
            to,
            cc: Vec::new(),
            subject: None,
            body: None,
            attachments: Vec::new(),
        }
    }

    /// PATCH body applied to the draft before it is sent.
    pub fn updates(&self) -> Value {
        let mut updates = json!({
            "toRecipients": Recipient::list(&self.to),
            "ccRecipients": Recipient::list(&self.cc),
        });
        if let Some(subject) = self.subject.as_deref().filter(|s| !s.is_empty()) {
            updates["subject"] = json!(subject);
        }
        if let Some(body) = self.body.as_deref().filter(|s| !s.is_empty()) {
            updates["body"] = json!(ItemBody::text(body));
        }
        updates
    }
}

/// A mail folder as returned by `mailFolders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailFolder {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_folder_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_folder_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_item_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_item_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_hidden: Option<bool>,
}
