use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, FetchError};

/// Transport security for the IMAP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Security {
    /// Implicit TLS from the first byte (usually port 993).
    #[default]
    Tls,
    /// Plain connection upgraded via the STARTTLS command (usually port 143).
    StartTls,
    /// Unencrypted connection. Only sensible against localhost test servers.
    Plain,
}

/// Credentials and endpoint of one IMAP account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailAccount {
    pub username: String,
    pub password: String,
    pub server_address: String,
    pub server_port: u16,
    pub security: Security,
}

impl MailAccount {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        server_address: impl Into<String>,
        server_port: u16,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            server_address: server_address.into(),
            server_port,
            security: Security::Tls,
        }
    }
}

/// One node of the server-side folder hierarchy. Rebuilt fresh on every
/// listing call, never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailFolder {
    /// Decoded UTF-8 display name (last path segment).
    pub name: String,
    pub message_count: u32,
    pub sub_folders: Vec<MailFolder>,
}

/// Attachment descriptor without content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub file_name: String,
    pub size: u32,
    pub mime_type: String,
}

/// A downloaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub size: u32,
    pub mime_type: String,
    pub content: Vec<u8>,
}

impl Attachment {
    /// The content-free descriptor for this attachment.
    pub fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            file_name: self.file_name.clone(),
            size: self.size,
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Size and line count of a body part, available without downloading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailBodyInfo {
    pub size: u32,
    pub line_count: u32,
}

/// A fetched message. Which fields are populated depends on the
/// [`FetchOptions`] toggles the message was retrieved with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Email {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    /// Unix timestamp of the server-side arrival time.
    pub received_at: i64,
    /// Unix timestamp of the Date header, if present.
    pub sent_at: Option<i64>,
    /// Folder-persistent message id (IMAP UID). Only resolved when
    /// `retrieve_message_ids` was requested.
    pub message_id: Option<u32>,
    pub size: Option<u32>,
    /// Effective content type, lowercased and stripped of parameters.
    /// Only set when body structure or content was inspected.
    pub content_type: Option<String>,
    pub plain_text_body_info: Option<EmailBodyInfo>,
    pub plain_text_body: Option<String>,
    pub html_body_info: Option<EmailBodyInfo>,
    pub html_body: Option<String>,
    pub attachment_infos: Vec<AttachmentInfo>,
    pub attachments: Vec<Attachment>,
}

impl Email {
    /// Plain text body if present, HTML body otherwise. May be absent,
    /// e.g. for encrypted messages.
    pub fn body(&self) -> Option<&str> {
        self.plain_text_body
            .as_deref()
            .or(self.html_body.as_deref())
    }
}

/// Which messages of the folder a fetch should resolve.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageSelection {
    /// Every message in the folder.
    #[default]
    All,
    /// All messages whose id is greater than or equal to the given id,
    /// ascending.
    FromIdOnward(u32),
    /// Exactly the given message ids.
    Ids(Vec<u32>),
}

/// Options for one fetch operation. The retrieval toggles compose
/// orthogonally; see the field docs for the cost each one adds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    pub account: MailAccount,
    /// Case-insensitive substring of the top-level folder to open.
    pub folder: String,
    pub selection: MessageSelection,
    /// Resolve the persistent message id of each mail.
    pub retrieve_message_ids: bool,
    pub retrieve_plain_text_bodies: bool,
    pub retrieve_html_bodies: bool,
    /// Retrieve attachment metadata. Without bodies or downloads this uses
    /// a structure-only path that transfers no part content.
    pub retrieve_attachment_infos: bool,
    /// Download full attachment content.
    pub download_attachments: bool,
    /// When greater than zero, a partial [`FetchResult`] is emitted after
    /// every `chunk_size` mails. Zero means one terminal result only.
    pub chunk_size: u32,
}

impl FetchOptions {
    pub fn new(account: MailAccount) -> Self {
        Self {
            account,
            folder: "inbox".to_string(),
            selection: MessageSelection::All,
            retrieve_message_ids: false,
            retrieve_plain_text_bodies: false,
            retrieve_html_bodies: false,
            retrieve_attachment_infos: false,
            download_attachments: false,
            chunk_size: 0,
        }
    }

    pub fn chunked(&self) -> bool {
        self.chunk_size > 0
    }

    /// True when message content has to be transferred, false when body
    /// structure metadata is enough.
    pub fn wants_content(&self) -> bool {
        self.retrieve_plain_text_bodies || self.retrieve_html_bodies || self.download_attachments
    }

    /// True for the cheap metadata-only path: attachment infos without any
    /// body content or downloads.
    pub fn structure_only(&self) -> bool {
        self.retrieve_attachment_infos && !self.wants_content()
    }
}

/// One element of the result stream of a fetch: zero or more partial
/// results (`completed == false`) followed by exactly one terminal result.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub completed: bool,
    /// Everything retrieved so far, across all chunks.
    pub all_retrieved: Vec<Email>,
    /// The mails of the chunk that triggered this result. Empty on the
    /// terminal result.
    pub latest_chunk: Vec<Email>,
    pub error: Option<FetchError>,
}

impl FetchResult {
    pub(crate) fn partial(all_retrieved: Vec<Email>, latest_chunk: Vec<Email>) -> Self {
        Self {
            completed: false,
            all_retrieved,
            latest_chunk,
            error: None,
        }
    }

    pub(crate) fn terminal(all_retrieved: Vec<Email>) -> Self {
        Self {
            completed: true,
            all_retrieved,
            latest_chunk: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn failed(error: FetchError) -> Self {
        Self {
            completed: true,
            all_retrieved: Vec::new(),
            latest_chunk: Vec::new(),
            error: Some(error),
        }
    }
}

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckCredentialsResult {
    Ok,
    WrongUsername,
    WrongPassword,
    InvalidServerAddress,
    InvalidServerPort,
    Unknown(String),
}

impl From<ConnectError> for CheckCredentialsResult {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::WrongUsername => Self::WrongUsername,
            ConnectError::WrongPassword => Self::WrongPassword,
            ConnectError::InvalidServerAddress => Self::InvalidServerAddress,
            ConnectError::InvalidServerPort => Self::InvalidServerPort,
            ConnectError::Unknown(msg) => Self::Unknown(msg),
        }
    }
}

/// Result of listing the account's folder hierarchy.
pub type GetMailFoldersResult = Result<Vec<MailFolder>, ConnectError>;

/// Options for registering a folder change watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchOptions {
    pub account: MailAccount,
    /// Case-insensitive substring of the top-level folder to watch.
    pub folder: String,
}

impl WatchOptions {
    pub fn new(account: MailAccount) -> Self {
        Self {
            account,
            folder: "inbox".to_string(),
        }
    }
}

/// Kind of a folder change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageChangeType {
    Added,
    Deleted,
    Modified,
}

/// Opaque handle for one live change watch. Used only to release the watch
/// via [`EmailFetcher::unwatch`](crate::EmailFetcher::unwatch).
#[derive(Debug, Clone)]
pub struct WatchHandle {
    pub(crate) id: u64,
    pub(crate) folder: String,
}

impl std::fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch #{} on {}", self.id, self.folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> MailAccount {
        MailAccount::new("user@example.com", "secret", "mail.example.com", 993)
    }

    #[test]
    fn body_prefers_plain_text() {
        let mut mail = Email {
            plain_text_body: Some("plain".to_string()),
            html_body: Some("<p>html</p>".to_string()),
            ..Default::default()
        };
        assert_eq!(mail.body(), Some("plain"));

        mail.plain_text_body = None;
        assert_eq!(mail.body(), Some("<p>html</p>"));

        mail.html_body = None;
        assert_eq!(mail.body(), None);
    }

    #[test]
    fn structure_only_requires_infos_without_content() {
        let mut options = FetchOptions::new(account());
        options.retrieve_attachment_infos = true;
        assert!(options.structure_only());
        assert!(!options.wants_content());

        options.download_attachments = true;
        assert!(!options.structure_only());
        assert!(options.wants_content());

        options.download_attachments = false;
        options.retrieve_html_bodies = true;
        assert!(!options.structure_only());
    }

    #[test]
    fn chunking_disabled_by_default() {
        let options = FetchOptions::new(account());
        assert!(!options.chunked());
        assert_eq!(options.folder, "inbox");
        assert_eq!(options.selection, MessageSelection::All);
    }

    #[test]
    fn attachment_info_accessor_strips_content() {
        let attachment = Attachment {
            file_name: "invoice.pdf".to_string(),
            size: 4,
            mime_type: "application/pdf".to_string(),
            content: vec![1, 2, 3, 4],
        };
        let info = attachment.info();
        assert_eq!(info.file_name, "invoice.pdf");
        assert_eq!(info.size, 4);
        assert_eq!(info.mime_type, "application/pdf");
    }
}
