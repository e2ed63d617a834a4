use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{AttributeValue, MailboxDatum, Response};
use async_imap::types::UnsolicitedResponse;
use tokio::sync::Notify;

use crate::client::{self, ImapSession};
use crate::error::FetchError;
use crate::fetch;
use crate::types::{
    Email, FetchOptions, MessageChangeType, MessageSelection, WatchHandle, WatchOptions,
};

/// How long one IDLE cycle lasts before it is re-armed. Well below the
/// RFC 2177 half-hour limit and typical NAT idle timeouts.
const IDLE_REARM: Duration = Duration::from_secs(9 * 60);

type ChangeListener = Arc<dyn Fn(MessageChangeType, Option<Email>) + Send + Sync>;

/// Shared registry of live watches, keyed by an opaque id rather than any
/// session object, so registry lifetime and connection lifetime stay
/// decoupled. Release can race with event delivery; the map is only ever
/// touched under the lock.
#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<Notify>>>,
}

pub(crate) type WatchRegistry = Arc<RegistryInner>;

impl RegistryInner {
    fn active(&self) -> MutexGuard<'_, HashMap<u64, Arc<Notify>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Raw folder event distilled from the server's untagged responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FolderEvent {
    /// New total message count.
    Exists(u32),
    /// A message at this sequence number was removed.
    Expunge(u32),
    /// A FETCH that carries nothing but flags (read/unread churn).
    FlagsOnly(u32),
    /// A FETCH with more than flags: the message itself changed.
    Changed(u32),
}

/// What the watch loop has to do for one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchAction {
    /// Re-extract and report the messages in this sequence range as added.
    FetchAdded(u32, u32),
    Deleted,
    /// Re-extract and report this message as modified.
    Refetch(u32),
    None,
}

struct WatchState {
    registry: WatchRegistry,
    id: u64,
    stop: Arc<Notify>,
    folder: String,
    listener: ChangeListener,
    /// Fixed rich option set for re-extraction: ids, both bodies,
    /// attachment download.
    refetch_options: FetchOptions,
    last_count: u32,
}

/// Open the folder and start the keep-alive loop. Returns `None` when the
/// folder could not be opened.
pub(crate) async fn watch<F>(
    registry: &WatchRegistry,
    options: &WatchOptions,
    listener: F,
) -> Option<WatchHandle>
where
    F: Fn(MessageChangeType, Option<Email>) + Send + Sync + 'static,
{
    let mut session = match client::connect(&options.account).await {
        Ok(session) => session,
        Err(e) => {
            log::error!("could not connect to watch {}: {e}", options.folder);
            return None;
        }
    };

    let folder = match client::open_folder(&mut session, &options.folder).await {
        Ok(folder) => folder,
        Err(e) => {
            log::error!("could not open folder to watch {}: {e}", options.folder);
            client::close(session).await;
            return None;
        }
    };

    let id = registry.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let stop = Arc::new(Notify::new());
    registry.active().insert(id, stop.clone());

    let handle = WatchHandle {
        id,
        folder: folder.name.clone(),
    };

    let mut refetch_options = FetchOptions::new(options.account.clone());
    refetch_options.folder = options.folder.clone();
    refetch_options.selection = MessageSelection::All;
    refetch_options.retrieve_message_ids = true;
    refetch_options.retrieve_plain_text_bodies = true;
    refetch_options.retrieve_html_bodies = true;
    refetch_options.download_attachments = true;

    let state = WatchState {
        registry: registry.clone(),
        id,
        stop,
        folder: folder.name.clone(),
        listener: Arc::new(listener),
        refetch_options,
        last_count: folder.mailbox.exists,
    };

    log::info!(
        "watching {} ({} messages)",
        folder.name,
        folder.mailbox.exists
    );
    tokio::spawn(run_watch_loop(session, state));

    Some(handle)
}

/// Release a watch. Idempotent; past the first call nothing happens.
pub(crate) fn unwatch(registry: &WatchRegistry, handle: &WatchHandle) {
    match registry.active().remove(&handle.id) {
        Some(stop) => {
            // The permit is stored if the loop is not waiting right now,
            // so release takes effect within one wait cycle either way.
            stop.notify_one();
            log::info!("released {handle}");
        }
        None => log::debug!("{handle} was already released"),
    }
}

/// Keep-alive loop: repeatedly re-arm server push via IDLE and turn the
/// responses into listener calls. Checks registry membership on every
/// iteration so release takes effect promptly. Errors end the loop
/// silently apart from the log; there is no automatic reconnect.
async fn run_watch_loop(mut session: ImapSession, mut state: WatchState) {
    loop {
        if !state.registry.active().contains_key(&state.id) {
            break;
        }

        // Events buffered since the last command round.
        let mut events = Vec::new();
        while let Ok(response) = session.unsolicited_responses.try_recv() {
            if let Some(event) = classify_unsolicited(&response) {
                events.push(event);
            }
        }
        if let Err(e) = deliver_events(&mut session, &mut state, events).await {
            log::error!("error while watching {}: {e}", state.folder);
            break;
        }

        if !state.registry.active().contains_key(&state.id) {
            break;
        }

        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            log::error!("IDLE init on {} failed: {e}", state.folder);
            state.registry.active().remove(&state.id);
            return;
        }

        let mut idle_events = Vec::new();
        let (idle_wait, interrupt) = idle.wait_with_timeout(IDLE_REARM);
        tokio::select! {
            result = idle_wait => match result {
                Ok(IdleResponse::NewData(response)) => {
                    if let Some(event) = classify_response(response.parsed()) {
                        idle_events.push(event);
                    }
                }
                // Timeout and manual interrupt both just re-arm.
                Ok(_) => {}
                Err(e) => log::warn!("IDLE wait on {} failed: {e}", state.folder),
            },
            _ = state.stop.notified() => {}
        }
        drop(interrupt);

        session = match idle.done().await {
            Ok(session) => session,
            Err(e) => {
                log::error!("could not leave IDLE on {}: {e}", state.folder);
                state.registry.active().remove(&state.id);
                return;
            }
        };

        if let Err(e) = deliver_events(&mut session, &mut state, idle_events).await {
            log::error!("error while watching {}: {e}", state.folder);
            break;
        }
    }

    state.registry.active().remove(&state.id);
    client::close(session).await;
    log::info!("watch loop for {} ended", state.folder);
}

async fn deliver_events(
    session: &mut ImapSession,
    state: &mut WatchState,
    events: Vec<FolderEvent>,
) -> Result<(), FetchError> {
    for event in events {
        match apply_event(event, &mut state.last_count) {
            WatchAction::FetchAdded(start, end) => {
                let mails =
                    fetch::fetch_seq_window(session, &state.refetch_options, start, end).await?;
                for mail in mails {
                    (state.listener)(MessageChangeType::Added, Some(mail));
                }
            }
            WatchAction::Deleted => {
                // The protocol reports nothing about the removed message.
                (state.listener)(MessageChangeType::Deleted, None);
            }
            WatchAction::Refetch(seq) => {
                // The message may already be gone again; that only costs
                // this one event.
                match fetch::fetch_seq_window(session, &state.refetch_options, seq, seq).await {
                    Ok(mails) => {
                        for mail in mails {
                            (state.listener)(MessageChangeType::Modified, Some(mail));
                        }
                    }
                    Err(e) => {
                        log::error!("could not re-extract changed message {seq}: {e}")
                    }
                }
            }
            WatchAction::None => {}
        }
    }
    Ok(())
}

/// Turn one raw event into the loop's next action, updating the tracked
/// message count.
pub(crate) fn apply_event(event: FolderEvent, last_count: &mut u32) -> WatchAction {
    match event {
        FolderEvent::Exists(count) => {
            if count > *last_count {
                let first_new = *last_count + 1;
                *last_count = count;
                WatchAction::FetchAdded(first_new, count)
            } else {
                // Count shrank or stayed: EXPUNGE events carry the deletes.
                *last_count = count;
                WatchAction::None
            }
        }
        FolderEvent::Expunge(_) => {
            *last_count = last_count.saturating_sub(1);
            WatchAction::Deleted
        }
        FolderEvent::FlagsOnly(_) => WatchAction::None,
        FolderEvent::Changed(seq) => WatchAction::Refetch(seq),
    }
}

fn classify_unsolicited(response: &UnsolicitedResponse) -> Option<FolderEvent> {
    match response {
        UnsolicitedResponse::Exists(count) => Some(FolderEvent::Exists(*count)),
        UnsolicitedResponse::Expunge(seq) => Some(FolderEvent::Expunge(*seq)),
        UnsolicitedResponse::Recent(_) => None,
        UnsolicitedResponse::Other(data) => classify_response(data.parsed()),
        _ => None,
    }
}

fn classify_response(response: &Response<'_>) -> Option<FolderEvent> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(count)) => Some(FolderEvent::Exists(*count)),
        Response::Expunge(seq) => Some(FolderEvent::Expunge(*seq)),
        Response::Fetch(seq, attributes) => {
            let flags_only = attributes
                .iter()
                .all(|attr| matches!(attr, AttributeValue::Flags(_) | AttributeValue::Uid(_)));
            Some(if flags_only {
                FolderEvent::FlagsOnly(*seq)
            } else {
                FolderEvent::Changed(*seq)
            })
        }
        _ => None,
    }
}
