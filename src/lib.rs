//! Client-side IMAP mailbox synchronization and MIME content extraction.
//!
//! The engine connects to an IMAP account, retrieves mails in windows or
//! chunks, walks each message's MIME tree to extract bodies and
//! attachments, and can keep a live watch on a folder that streams typed
//! change events until released.
//!
//! ```no_run
//! use mailfetch::{EmailFetcher, FetchOptions, MailAccount};
//!
//! # async fn run() {
//! let account = MailAccount::new("user@example.com", "secret", "imap.example.com", 993);
//! let fetcher = EmailFetcher::new();
//!
//! let mut options = FetchOptions::new(account);
//! options.retrieve_plain_text_bodies = true;
//! options.chunk_size = 50;
//!
//! fetcher
//!     .fetch_mails(&options, |result| {
//!         println!(
//!             "{} mails so far (completed: {})",
//!             result.all_retrieved.len(),
//!             result.completed
//!         );
//!     })
//!     .await;
//! # }
//! ```

mod client;
mod error;
mod extract;
mod fetch;
mod types;
mod watch;

pub use error::{ConnectError, FetchError, FolderError};
pub use fetch::EmailFetcher;
pub use types::{
    Attachment, AttachmentInfo, CheckCredentialsResult, Email, EmailBodyInfo, FetchOptions,
    FetchResult, GetMailFoldersResult, MailAccount, MailFolder, MessageChangeType,
    MessageSelection, Security, WatchHandle, WatchOptions,
};
