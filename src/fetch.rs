use async_imap::imap_proto::Address;
use async_imap::types::Fetch;
use futures::StreamExt;
use mail_parser::MessageParser;
use tokio::sync::mpsc;

use crate::client::{self, ImapSession, OpenFolder};
use crate::error::FetchError;
use crate::extract;
use crate::types::{
    CheckCredentialsResult, Email, FetchOptions, FetchResult, GetMailFoldersResult, MailAccount,
    MessageChangeType, MessageSelection, WatchHandle, WatchOptions,
};
use crate::watch::{self, WatchRegistry};

/// The engine's entry point. Cheap to clone; clones share the watch
/// registry.
#[derive(Debug, Clone, Default)]
pub struct EmailFetcher {
    watches: WatchRegistry,
}

impl EmailFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect and authenticate once, then drop the session. The result
    /// classifies why a failing account fails.
    pub async fn check_credentials(&self, account: &MailAccount) -> CheckCredentialsResult {
        match client::connect(account).await {
            Ok(session) => {
                client::close(session).await;
                CheckCredentialsResult::Ok
            }
            Err(e) => e.into(),
        }
    }

    /// List the account's complete folder hierarchy. The tree is rebuilt
    /// fresh on every call.
    pub async fn list_folders(&self, account: &MailAccount) -> GetMailFoldersResult {
        let mut session = client::connect(account).await?;
        let result = client::list_folders(&mut session).await;
        client::close(session).await;
        result
    }

    /// Fetch mails per the given options, driving `on_result` with zero or
    /// more partial results followed by exactly one terminal result.
    ///
    /// Errors never escape: they surface through the terminal result's
    /// error field.
    pub async fn fetch_mails<F>(&self, options: &FetchOptions, mut on_result: F)
    where
        F: FnMut(FetchResult) + Send,
    {
        match fetch_mails_inner(options, &mut on_result).await {
            Ok(mails) => on_result(FetchResult::terminal(mails)),
            Err(e) => {
                log::error!("could not fetch mails from {}: {e}", options.folder);
                on_result(FetchResult::failed(e));
            }
        }
    }

    /// Run the fetch on a dedicated worker task and stream its results.
    /// Must be called within a Tokio runtime.
    pub fn fetch_mails_detached(
        &self,
        options: FetchOptions,
    ) -> mpsc::UnboundedReceiver<FetchResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = self.clone();
        tokio::spawn(async move {
            fetcher
                .fetch_mails(&options, |result| {
                    // The receiver may have been dropped; fine either way.
                    let _ = tx.send(result);
                })
                .await;
        });
        rx
    }

    /// Open the folder and stream change events to the listener until the
    /// returned handle is released with [`unwatch`](Self::unwatch).
    /// Returns `None` when the folder could not be opened.
    ///
    /// Deleted messages carry no [`Email`]: the protocol reports nothing
    /// about a removed message, not even its id.
    pub async fn watch<F>(&self, options: &WatchOptions, listener: F) -> Option<WatchHandle>
    where
        F: Fn(MessageChangeType, Option<Email>) + Send + Sync + 'static,
    {
        watch::watch(&self.watches, options, listener).await
    }

    /// Release a change watch. The watch's session is closed within one
    /// wait cycle and no further events fire. Releasing twice is a no-op.
    pub fn unwatch(&self, handle: &WatchHandle) {
        watch::unwatch(&self.watches, handle);
    }
}

async fn fetch_mails_inner(
    options: &FetchOptions,
    emit: &mut (dyn FnMut(FetchResult) + Send),
) -> Result<Vec<Email>, FetchError> {
    let mut session = client::connect(&options.account).await?;

    let folder = match client::open_folder(&mut session, &options.folder).await {
        Ok(folder) => folder,
        Err(e) => {
            client::close(session).await;
            return Err(e.into());
        }
    };

    let result = run_fetch(&mut session, &folder, options, emit).await;
    client::close(session).await;

    let mut mails = result?;
    sort_by_message_id(&mut mails);
    Ok(mails)
}

/// Pick and drive the retrieval strategy the options select, in priority
/// order: from-id-onward, explicit id set, chunked full scan, single-shot
/// full scan.
async fn run_fetch(
    session: &mut ImapSession,
    folder: &OpenFolder,
    options: &FetchOptions,
    emit: &mut (dyn FnMut(FetchResult) + Send),
) -> Result<Vec<Email>, FetchError> {
    let message_count = folder.mailbox.exists;

    match &options.selection {
        MessageSelection::FromIdOnward(id) => {
            fetch_uid_set(session, options, &format!("{id}:*"), Some(*id), emit).await
        }
        MessageSelection::Ids(ids) if !ids.is_empty() => {
            let set = ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            fetch_uid_set(session, options, &set, None, emit).await
        }
        _ if options.chunked() => fetch_all_chunked(session, options, message_count, emit).await,
        _ if message_count == 0 => Ok(Vec::new()),
        // message sequence numbers start at one, not zero
        _ => fetch_seq_window(session, options, 1, message_count).await,
    }
}

/// Resolve a UID set in one batched fetch. `min_id` filters out the last
/// message some servers echo for an overshooting `n:*` range.
async fn fetch_uid_set(
    session: &mut ImapSession,
    options: &FetchOptions,
    uid_set: &str,
    min_id: Option<u32>,
    emit: &mut (dyn FnMut(FetchResult) + Send),
) -> Result<Vec<Email>, FetchError> {
    let items = fetch_items(options);
    let stream = session
        .uid_fetch(uid_set, &items)
        .await
        .map_err(|e| FetchError::Protocol(format!("UID FETCH {uid_set} failed: {e}")))?;

    let mut fetches: Vec<Fetch> = stream
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|r| match r {
            Ok(fetch) => Some(fetch),
            Err(e) => {
                log::warn!("fetch stream error for UID set {uid_set}: {e}");
                None
            }
        })
        .collect();

    if let Some(min_id) = min_id {
        fetches.retain(|f| f.uid.map_or(true, |uid| uid >= min_id));
    }

    // Ascending by native sequence number for prefetch efficiency; callers
    // needing a different order re-sort the final list.
    fetches.sort_by_key(|f| f.message);

    if options.chunked() {
        Ok(map_chunked(&fetches, options, emit))
    } else {
        map_strict(&fetches, options)
    }
}

/// Backward chunked scan over the whole folder, latest messages first.
async fn fetch_all_chunked(
    session: &mut ImapSession,
    options: &FetchOptions,
    message_count: u32,
    emit: &mut (dyn FnMut(FetchResult) + Send),
) -> Result<Vec<Email>, FetchError> {
    let mut all = Vec::new();
    for (start, end) in backward_windows(message_count, options.chunk_size) {
        let chunk = fetch_seq_window(session, options, start, end).await?;
        all.extend(chunk.iter().cloned());
        emit(FetchResult::partial(all.clone(), chunk));
    }
    Ok(all)
}

/// Fetch one sequence-number window `[start, end]` (inclusive) in a single
/// batched call and map every message. A message that fails to map aborts
/// the window.
pub(crate) async fn fetch_seq_window(
    session: &mut ImapSession,
    options: &FetchOptions,
    start: u32,
    end: u32,
) -> Result<Vec<Email>, FetchError> {
    let items = fetch_items(options);
    let range = format!("{start}:{end}");
    let stream = session
        .fetch(&range, &items)
        .await
        .map_err(|e| FetchError::Protocol(format!("FETCH {range} failed: {e}")))?;

    let fetches: Vec<Fetch> = stream
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .filter_map(|r| match r {
            Ok(fetch) => Some(fetch),
            Err(e) => {
                log::warn!("fetch stream error in window {range}: {e}");
                None
            }
        })
        .collect();

    log::debug!("retrieved {} messages for window {range}", fetches.len());

    map_strict(&fetches, options)
}

/// Map every message, failing the whole window on the first bad message.
fn map_strict(fetches: &[Fetch], options: &FetchOptions) -> Result<Vec<Email>, FetchError> {
    fetches
        .iter()
        .map(|fetch| map_message(fetch, options))
        .collect()
}

/// Map in chunks of `chunk_size`, emitting a partial result per chunk. A
/// message that fails to map is logged and skipped rather than aborting
/// the fetch.
fn map_chunked(
    fetches: &[Fetch],
    options: &FetchOptions,
    emit: &mut (dyn FnMut(FetchResult) + Send),
) -> Vec<Email> {
    let mut all = Vec::new();
    for chunk in fetches.chunks(options.chunk_size as usize) {
        let mut mapped = Vec::new();
        for fetch in chunk {
            match map_message(fetch, options) {
                Ok(mail) => mapped.push(mail),
                Err(e) => log::error!("could not map message {}: {e}", fetch.message),
            }
        }
        all.extend(mapped.iter().cloned());
        emit(FetchResult::partial(all.clone(), mapped));
    }
    all
}

/// FETCH items covering everything the options need in one round trip per
/// window. Resolving message ids rides along in the same batch, so the
/// option gate costs nothing extra here.
fn fetch_items(options: &FetchOptions) -> String {
    let mut items = vec!["ENVELOPE", "RFC822.SIZE", "INTERNALDATE"];
    if options.retrieve_message_ids {
        items.push("UID");
    }
    if options.wants_content() {
        items.push("BODY.PEEK[]");
    } else if options.structure_only() {
        items.push("BODYSTRUCTURE");
    }
    format!("({})", items.join(" "))
}

/// Build an [`Email`] from one FETCH response, then hand it to the content
/// extractor per the options.
fn map_message(fetch: &Fetch, options: &FetchOptions) -> Result<Email, FetchError> {
    let envelope = fetch
        .envelope()
        .ok_or_else(|| FetchError::Parse(format!("message {} has no envelope", fetch.message)))?;

    let sender = envelope
        .from
        .as_ref()
        .and_then(|from| from.first())
        .map(format_address)
        .unwrap_or_default();

    let mut recipients = Vec::new();
    for list in [&envelope.to, &envelope.cc, &envelope.bcc] {
        if let Some(addresses) = list {
            recipients.extend(addresses.iter().map(format_address));
        }
    }

    let subject = envelope
        .subject
        .as_ref()
        .map(|s| decode_header_value(s))
        .unwrap_or_default();
    let sent_at = envelope.date.as_ref().and_then(|d| parse_date_header(d));
    let received_at = fetch
        .internal_date()
        .map(|d| d.timestamp())
        .or(sent_at)
        .unwrap_or(0);

    let mut mail = Email {
        sender,
        recipients,
        subject,
        received_at,
        sent_at,
        message_id: if options.retrieve_message_ids {
            fetch.uid
        } else {
            None
        },
        size: fetch.size,
        ..Default::default()
    };

    if options.structure_only() {
        // Reading the prefetched structure costs no extra round trip; its
        // absence is non-fatal and just leaves the infos unset.
        match fetch.bodystructure() {
            Some(structure) => {
                let root = extract::structure_from_proto(structure);
                extract::apply_structure(&mut mail, &root);
            }
            None => log::warn!("message {} carries no body structure", fetch.message),
        }
    } else if options.wants_content() {
        let raw = fetch
            .body()
            .ok_or_else(|| FetchError::Parse(format!("message {} has no body", fetch.message)))?;
        let message = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| FetchError::Parse(format!("could not parse message {}", fetch.message)))?;
        extract::apply_content(&mut mail, &message, options);
    }

    Ok(mail)
}

/// Re-sort the terminal list ascending by message id when any ids were
/// resolved; ids are not guaranteed to arrive in native sequence order.
fn sort_by_message_id(mails: &mut [Email]) {
    if mails.iter().any(|m| m.message_id.is_some()) {
        mails.sort_by_key(|m| m.message_id.unwrap_or(0));
    }
}

/// Format an envelope address as `"Name <mailbox@host>"`, or just the bare
/// address when no display name is present.
fn format_address(address: &Address<'_>) -> String {
    let mailbox = address
        .mailbox
        .as_ref()
        .map(|m| String::from_utf8_lossy(m).to_string())
        .unwrap_or_default();
    let host = address
        .host
        .as_ref()
        .map(|h| String::from_utf8_lossy(h).to_string())
        .unwrap_or_default();
    let bare = if host.is_empty() {
        mailbox
    } else {
        format!("{mailbox}@{host}")
    };

    match address.name.as_ref().map(|n| decode_header_value(n)) {
        Some(name) if !name.is_empty() => format!("{name} <{bare}>"),
        _ => bare,
    }
}

/// Decode RFC 2047 encoded words by letting the MIME parser chew on a
/// synthetic header.
fn decode_header_value(raw: &[u8]) -> String {
    let lossy = String::from_utf8_lossy(raw);
    if !lossy.contains("=?") {
        return lossy.into_owned();
    }
    let synthetic = format!("Subject: {lossy}\r\n\r\n");
    match MessageParser::default()
        .parse(synthetic.as_bytes())
        .and_then(|m| m.subject().map(|s| s.to_string()))
    {
        Some(decoded) => decoded,
        None => lossy.into_owned(),
    }
}

fn parse_date_header(raw: &[u8]) -> Option<i64> {
    let synthetic = format!("Date: {}\r\n\r\n", String::from_utf8_lossy(raw));
    MessageParser::default()
        .parse(synthetic.as_bytes())
        .and_then(|m| m.date().map(|d| d.to_timestamp()))
}

/// Windows for the backward chunked scan, latest first. Shifting the
/// window back clamps the start at 1 and extends the final window to abut
/// the previous start, so coverage stays gap-free and duplicate-free even
/// when `chunk` does not divide `count`.
fn backward_windows(count: u32, chunk: u32) -> Vec<(u32, u32)> {
    let mut windows = Vec::new();
    if count == 0 || chunk == 0 {
        return windows;
    }
    let count = i64::from(count);
    let chunk = i64::from(chunk);

    let mut end = count;
    let mut start = (count - chunk + 1).max(1);
    loop {
        windows.push((start as u32, end as u32));
        let last_start = start;
        end = start - 1;
        start -= chunk;
        if start < 1 {
            if last_start > 1 {
                start = 1;
                end = last_start - 1;
            } else {
                break;
            }
        }
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> MailAccount {
        MailAccount::new("user@example.com", "secret", "mail.example.com", 993)
    }

    #[test]
    fn backward_windows_walk_latest_first() {
        assert_eq!(backward_windows(10, 4), vec![(7, 10), (3, 6), (1, 2)]);
        assert_eq!(backward_windows(8, 4), vec![(5, 8), (1, 4)]);
        assert_eq!(backward_windows(1, 4), vec![(1, 1)]);
        assert_eq!(backward_windows(2, 5), vec![(1, 2)]);
        assert_eq!(backward_windows(0, 4), Vec::<(u32, u32)>::new());
    }

    #[test]
    fn backward_windows_cover_every_message_exactly_once() {
        for count in [1u32, 2, 3, 5, 8, 10, 25, 99, 100] {
            for chunk in [1u32, 2, 3, 4, 7, 10, 30, 100] {
                let windows = backward_windows(count, chunk);

                let mut seen = vec![false; count as usize + 1];
                let mut total = 0u32;
                let mut previous_start = None;
                for (start, end) in windows {
                    assert!(start >= 1 && end >= start && end <= count);
                    // Strictly descending, latest messages first.
                    if let Some(previous) = previous_start {
                        assert_eq!(end + 1, previous, "windows must abut ({count}/{chunk})");
                    } else {
                        assert_eq!(end, count);
                    }
                    previous_start = Some(start);
                    for n in start..=end {
                        assert!(!seen[n as usize], "duplicate message {n} ({count}/{chunk})");
                        seen[n as usize] = true;
                    }
                    total += end - start + 1;
                }
                assert_eq!(total, count, "gap in coverage ({count}/{chunk})");
            }
        }
    }

    #[test]
    fn fetch_items_follow_the_toggles() {
        let mut options = FetchOptions::new(account());
        assert_eq!(fetch_items(&options), "(ENVELOPE RFC822.SIZE INTERNALDATE)");

        options.retrieve_message_ids = true;
        assert_eq!(
            fetch_items(&options),
            "(ENVELOPE RFC822.SIZE INTERNALDATE UID)"
        );

        options.retrieve_attachment_infos = true;
        assert_eq!(
            fetch_items(&options),
            "(ENVELOPE RFC822.SIZE INTERNALDATE UID BODYSTRUCTURE)"
        );

        // Any content request replaces the structure-only prefetch.
        options.retrieve_html_bodies = true;
        assert_eq!(
            fetch_items(&options),
            "(ENVELOPE RFC822.SIZE INTERNALDATE UID BODY.PEEK[])"
        );
    }

    #[test]
    fn terminal_sort_orders_by_message_id_when_present() {
        let mut mails: Vec<Email> = [3u32, 1, 2]
            .iter()
            .map(|id| Email {
                message_id: Some(*id),
                ..Default::default()
            })
            .collect();
        sort_by_message_id(&mut mails);
        let ids: Vec<_> = mails.iter().filter_map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn terminal_sort_keeps_order_without_message_ids() {
        let mut mails = vec![
            Email {
                subject: "b".to_string(),
                ..Default::default()
            },
            Email {
                subject: "a".to_string(),
                ..Default::default()
            },
        ];
        sort_by_message_id(&mut mails);
        assert_eq!(mails[0].subject, "b");
        assert_eq!(mails[1].subject, "a");
    }

    #[test]
    fn decode_header_value_handles_encoded_words() {
        assert_eq!(decode_header_value(b"plain subject"), "plain subject");
        assert_eq!(
            decode_header_value("=?UTF-8?B?R3LDvMOfZQ==?=".as_bytes()),
            "Gr\u{fc}\u{df}e"
        );
        assert_eq!(
            decode_header_value(b"=?ISO-8859-1?Q?caf=E9?="),
            "caf\u{e9}"
        );
    }

    #[test]
    fn parse_date_header_reads_rfc2822_dates() {
        let ts = parse_date_header(b"Mon, 2 Mar 2020 10:00:00 +0000").expect("date should parse");
        assert_eq!(ts, 1583143200);
        assert!(parse_date_header(b"not a date").is_none());
    }
}
