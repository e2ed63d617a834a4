use std::io;
use std::time::Duration;

use async_imap::types::{Mailbox, Name};
use async_imap::Client;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

use crate::error::{ConnectError, FolderError};
use crate::types::{MailAccount, MailFolder, Security};

/// Fixed connect/handshake timeout. Conservative enough for slow servers,
/// short enough that a credential check against a dead host returns quickly.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------- Stream wrapper ----------

/// Wrapper to unify TLS / plain streams so the session can be generic.
pub(crate) enum ImapStream {
    Tls(TlsStream<TcpStream>),
    Plain(TcpStream),
}

impl tokio::io::AsyncRead for ImapStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for ImapStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapStream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ImapStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for ImapStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapStream::Tls(_) => write!(f, "ImapStream::Tls"),
            ImapStream::Plain(_) => write!(f, "ImapStream::Plain"),
        }
    }
}

pub(crate) type ImapSession = async_imap::Session<ImapStream>;

// ---------- Connect ----------

/// Establish an IMAP connection and authenticate with LOGIN.
///
/// Supports TLS (direct), STARTTLS (upgrade), and plain connections.
/// Failures are classified into the [`ConnectError`] taxonomy by their
/// innermost cause.
pub(crate) async fn connect(account: &MailAccount) -> Result<ImapSession, ConnectError> {
    if account.security == Security::StartTls {
        // STARTTLS requires a special flow: connect plain, upgrade, then
        // auth. The greeting is consumed during the upgrade.
        return connect_starttls(account).await;
    }

    let stream = connect_stream(account).await?;
    let client = Client::new(stream);
    authenticate(client, account).await
}

/// Establish the TCP + TLS or plain stream for the direct security modes.
async fn connect_stream(account: &MailAccount) -> Result<ImapStream, ConnectError> {
    let tcp = tcp_connect(account).await?;
    match account.security {
        Security::Tls => Ok(ImapStream::Tls(tls_handshake(account, tcp).await?)),
        Security::Plain => Ok(ImapStream::Plain(tcp)),
        Security::StartTls => Err(ConnectError::Unknown(
            "STARTTLS is handled by its own connect flow".to_string(),
        )),
    }
}

async fn tcp_connect(account: &MailAccount) -> Result<TcpStream, ConnectError> {
    let addr = (account.server_address.as_str(), account.server_port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(tcp)) => Ok(tcp),
        Ok(Err(e)) => {
            log::warn!(
                "TCP connect to {}:{} failed: {e}",
                account.server_address,
                account.server_port
            );
            Err(classify_connect_io(&e))
        }
        Err(_) => Err(ConnectError::Unknown(format!(
            "TCP connect to {}:{} timed out",
            account.server_address, account.server_port
        ))),
    }
}

async fn tls_handshake(
    account: &MailAccount,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, ConnectError> {
    let native_connector = native_tls::TlsConnector::new()
        .map_err(|e| ConnectError::Unknown(format!("failed to create TLS connector: {e}")))?;
    let tls_connector = tokio_native_tls::TlsConnector::from(native_connector);
    match tokio::time::timeout(
        CONNECT_TIMEOUT,
        tls_connector.connect(&account.server_address, tcp),
    )
    .await
    {
        Ok(Ok(tls)) => Ok(tls),
        Ok(Err(e)) => Err(ConnectError::Unknown(format!(
            "TLS handshake with {} failed: {e}",
            account.server_address
        ))),
        Err(_) => Err(ConnectError::Unknown(format!(
            "TLS handshake with {} timed out",
            account.server_address
        ))),
    }
}

/// Handle STARTTLS: connect plain, upgrade to TLS, then authenticate.
///
/// The STARTTLS command must be issued on the plain connection and the
/// client rebuilt on the TLS stream afterwards.
async fn connect_starttls(account: &MailAccount) -> Result<ImapSession, ConnectError> {
    let mut tcp = tcp_connect(account).await?;

    let mut buf = vec![0u8; 4096];
    let n = tcp
        .read(&mut buf)
        .await
        .map_err(|e| ConnectError::Unknown(format!("failed to read server greeting: {e}")))?;
    let greeting = String::from_utf8_lossy(&buf[..n]);
    if !greeting.contains("OK") {
        return Err(ConnectError::Unknown(format!(
            "unexpected server greeting: {greeting}"
        )));
    }

    tcp.write_all(b"a001 STARTTLS\r\n")
        .await
        .map_err(|e| ConnectError::Unknown(format!("failed to send STARTTLS: {e}")))?;

    let n = tcp
        .read(&mut buf)
        .await
        .map_err(|e| ConnectError::Unknown(format!("failed to read STARTTLS response: {e}")))?;
    let response = String::from_utf8_lossy(&buf[..n]);
    if !response.contains("OK") {
        return Err(ConnectError::Unknown(format!(
            "STARTTLS rejected: {response}"
        )));
    }

    let tls = tls_handshake(account, tcp).await?;
    let client = Client::new(ImapStream::Tls(tls));
    authenticate(client, account).await
}

async fn authenticate(
    client: Client<ImapStream>,
    account: &MailAccount,
) -> Result<ImapSession, ConnectError> {
    client
        .login(&account.username, &account.password)
        .await
        .map_err(|(e, _)| {
            log::warn!(
                "login as {} at {} failed: {e}",
                account.username,
                account.server_address
            );
            classify_login_error(&e)
        })
}

/// Map a connect-phase io error onto the taxonomy. The specific
/// network-level causes are checked before the generic fallback: a refused
/// TCP connection means the host is up but the port is wrong, while a
/// failed address lookup means the host itself is wrong.
fn classify_connect_io(e: &io::Error) -> ConnectError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ConnectError::InvalidServerPort,
        io::ErrorKind::TimedOut => ConnectError::Unknown(e.to_string()),
        _ => ConnectError::InvalidServerAddress,
    }
}

/// Map a LOGIN failure onto the taxonomy. IMAP reports a single NO for any
/// credential problem, so the response text decides between username and
/// password.
fn classify_login_error(e: &async_imap::error::Error) -> ConnectError {
    let text = e.to_string();
    if matches!(e, async_imap::error::Error::No(_)) {
        if text.to_ascii_lowercase().contains("password") {
            ConnectError::WrongPassword
        } else {
            ConnectError::WrongUsername
        }
    } else {
        ConnectError::Unknown(format!("login failed: {text}"))
    }
}

// ---------- Folders ----------

/// A folder opened read-only, together with the raw name needed for
/// subsequent IMAP commands.
#[derive(Debug)]
pub(crate) struct OpenFolder {
    /// Original modified UTF-7 path for IMAP commands.
    pub raw_name: String,
    /// Decoded UTF-8 display name.
    pub name: String,
    pub mailbox: Mailbox,
}

/// Resolve a top-level folder by case-insensitive name substring and open
/// it read-only. Nested folders are not searched.
pub(crate) async fn open_folder(
    session: &mut ImapSession,
    folder: &str,
) -> Result<OpenFolder, FolderError> {
    let names = session
        .list(Some(""), Some("%"))
        .await
        .map_err(|e| FolderError::Unexpected(format!("LIST failed: {e}")))?;

    let names: Vec<Name> = names
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|r| r.ok())
        .collect();

    // Decode modified UTF-7 (RFC 3501 §5.1.3) so the match works on what
    // the user sees, but keep the raw path for commands.
    let candidates: Vec<(String, String)> = names
        .iter()
        .map(|name| {
            let raw = name.name().to_string();
            (utf7_imap::decode_utf7_imap(raw.clone()), raw)
        })
        .collect();

    let Some((name, raw_name)) = find_folder(&candidates, folder) else {
        log::error!(
            "could not find folder matching {folder:?} in {:?}",
            candidates.iter().map(|(n, _)| n).collect::<Vec<_>>()
        );
        return Err(FolderError::FolderDoesNotExist(folder.to_string()));
    };

    let mailbox = session
        .examine(raw_name)
        .await
        .map_err(|e| FolderError::CouldNotOpenStore(format!("EXAMINE {raw_name} failed: {e}")))?;

    Ok(OpenFolder {
        raw_name: raw_name.clone(),
        name: name.clone(),
        mailbox,
    })
}

/// First folder whose decoded name contains the needle, case-insensitively
/// ("inbox" matches "INBOX").
fn find_folder<'a>(candidates: &'a [(String, String)], needle: &str) -> Option<&'a (String, String)> {
    let needle = needle.to_lowercase();
    candidates
        .iter()
        .find(|(decoded, _)| decoded.to_lowercase().contains(&needle))
}

/// One flat LIST entry before tree assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FolderEntry {
    /// Decoded full path.
    pub path: String,
    pub delimiter: String,
    pub message_count: u32,
}

/// List the account's complete folder hierarchy as a materialized tree.
///
/// Message counts come from one STATUS per folder; folders that refuse
/// STATUS (e.g. \Noselect containers) count as zero.
pub(crate) async fn list_folders(
    session: &mut ImapSession,
) -> Result<Vec<MailFolder>, ConnectError> {
    let names = session
        .list(Some(""), Some("*"))
        .await
        .map_err(|e| ConnectError::Unknown(format!("LIST failed: {e}")))?;

    let names: Vec<Name> = names
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|r| r.ok())
        .collect();

    let mut entries = Vec::new();
    for name in &names {
        let raw_path = name.name().to_string();
        let delimiter = name.delimiter().unwrap_or("/").to_string();
        let path = utf7_imap::decode_utf7_imap(raw_path.clone());

        let message_count = match session.status(&raw_path, "(MESSAGES)").await {
            Ok(mailbox) => mailbox.exists,
            Err(e) => {
                log::debug!("STATUS {path} failed, counting 0 messages: {e}");
                0
            }
        };

        entries.push(FolderEntry {
            path,
            delimiter,
            message_count,
        });
    }

    Ok(build_folder_tree(entries))
}

/// Assemble flat LIST entries into the folder tree by splitting each path
/// on its hierarchy delimiter. Parents missing from the listing are
/// materialized with zero messages.
fn build_folder_tree(entries: Vec<FolderEntry>) -> Vec<MailFolder> {
    let mut roots: Vec<MailFolder> = Vec::new();
    for entry in entries {
        let segments: Vec<&str> = if entry.delimiter.is_empty() {
            vec![entry.path.as_str()]
        } else {
            entry.path.split(entry.delimiter.as_str()).collect()
        };
        insert_folder(&mut roots, &segments, entry.message_count);
    }
    roots
}

fn insert_folder(level: &mut Vec<MailFolder>, segments: &[&str], message_count: u32) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let pos = match level.iter().position(|f| f.name == *head) {
        Some(pos) => pos,
        None => {
            level.push(MailFolder {
                name: (*head).to_string(),
                message_count: 0,
                sub_folders: Vec::new(),
            });
            level.len() - 1
        }
    };
    if rest.is_empty() {
        level[pos].message_count = message_count;
    } else {
        insert_folder(&mut level[pos].sub_folders, rest, message_count);
    }
}

/// Log out, ignoring errors. Sessions are owned by exactly one operation
/// and closed by it.
pub(crate) async fn close(mut session: ImapSession) {
    if let Err(e) = session.logout().await {
        log::warn!("LOGOUT failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_means_bad_port() {
        let e = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert_eq!(classify_connect_io(&e), ConnectError::InvalidServerPort);
    }

    #[test]
    fn lookup_failure_means_bad_address() {
        let e = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert_eq!(classify_connect_io(&e), ConnectError::InvalidServerAddress);
    }

    #[test]
    fn timeout_stays_unclassified() {
        let e = io::Error::new(io::ErrorKind::TimedOut, "connection timed out");
        assert!(matches!(
            classify_connect_io(&e),
            ConnectError::Unknown(_)
        ));
    }

    #[test]
    fn folder_match_is_case_insensitive_substring() {
        let candidates = vec![
            ("Drafts".to_string(), "Drafts".to_string()),
            ("INBOX".to_string(), "INBOX".to_string()),
            ("Sent".to_string(), "Sent".to_string()),
        ];
        let (decoded, raw) = find_folder(&candidates, "inbox").expect("inbox should match");
        assert_eq!(decoded, "INBOX");
        assert_eq!(raw, "INBOX");

        assert!(find_folder(&candidates, "archive").is_none());
    }

    #[test]
    fn folder_tree_nests_by_delimiter() {
        let entries = vec![
            FolderEntry {
                path: "INBOX".to_string(),
                delimiter: "/".to_string(),
                message_count: 12,
            },
            FolderEntry {
                path: "Work/2024/Q1".to_string(),
                delimiter: "/".to_string(),
                message_count: 3,
            },
            FolderEntry {
                path: "Work/2024".to_string(),
                delimiter: "/".to_string(),
                message_count: 7,
            },
        ];

        let tree = build_folder_tree(entries);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].name, "INBOX");
        assert_eq!(tree[0].message_count, 12);
        assert!(tree[0].sub_folders.is_empty());

        // "Work" was never listed on its own but is materialized as parent.
        let work = &tree[1];
        assert_eq!(work.name, "Work");
        assert_eq!(work.message_count, 0);
        assert_eq!(work.sub_folders.len(), 1);

        let y2024 = &work.sub_folders[0];
        assert_eq!(y2024.name, "2024");
        assert_eq!(y2024.message_count, 7);
        assert_eq!(y2024.sub_folders.len(), 1);
        assert_eq!(y2024.sub_folders[0].name, "Q1");
        assert_eq!(y2024.sub_folders[0].message_count, 3);
    }
}
