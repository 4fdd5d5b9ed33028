//! Merging of optimistic sends, realtime pushes and fetch results into the
//! visible message list.
//!
//! Every outbound message goes through `Pending -> Confirmed | Failed | Expired`.
//! A pending send owns a temporary row in the list. It is confirmed by
//! whichever arrives first of the insert response and the realtime INSERT for
//! the same row; both go through [`Timeline::confirm`], so the final list is
//! the same for either arrival order.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use huddle_types::models::{Message, Reaction};

/// An optimistic send awaiting confirmation.
#[derive(Debug, Clone)]
pub struct PendingSend {
    /// Idempotency token sent with the insert.
    pub token: String,
    /// Id of the temporary row standing in for the message.
    pub temp_id: String,
    pub channel_id: String,
    pub user_id: String,
    /// Text of the send, kept so a dropped send can be reported back.
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub issued_at: Instant,
}

impl PendingSend {
    /// How well `confirmed` fits this send, lower is better. `None` when it
    /// cannot be the stored row for this send.
    ///
    /// Rows that carry a client token are matched exactly. Rows without one
    /// fall back to same author and channel within `window` of the
    /// optimistic creation time; equal content ranks ahead of closeness in
    /// time, so rapid sends pair up with the right temp rows. A row that was
    /// already on screen (`seen`) had its own send resolved when it first
    /// arrived, so it never takes the fallback.
    fn rank(&self, confirmed: &Message, window: Duration, seen: bool) -> Option<(bool, u64)> {
        match &confirmed.client_token {
            Some(token) => (*token == self.token).then_some((false, 0)),
            None if seen => None,
            None => {
                let skew_ms = (confirmed.created_at - self.created_at)
                    .num_milliseconds()
                    .unsigned_abs();
                let candidate = confirmed.user_id == self.user_id
                    && confirmed.channel_id == self.channel_id
                    && u128::from(skew_ms) <= window.as_millis();
                candidate.then_some((confirmed.content != self.content, skew_ms))
            }
        }
    }
}

/// Taken when a fetch is issued; changes applied after it survive the
/// fetch result. See [`Timeline::merge_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchMark(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Present,
    Removed,
}

/// How [`Timeline::confirm`] placed a confirmed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The temp row was swapped for the confirmed row.
    ReplacedTemp,
    /// The row was already visible and was refreshed in place.
    Refreshed,
    /// The row was new to the list.
    Appended,
    /// The visible copy is newer than the one offered.
    Ignored,
}

/// Visible message list of the active channel plus its outstanding sends.
#[derive(Debug)]
pub struct Timeline {
    messages: Vec<Message>,
    pending: Vec<PendingSend>,
    match_window: Duration,
    /// Bumped on every incremental change.
    seq: u64,
    /// Last incremental change per message id, kept while a fetch is open.
    touched: HashMap<String, (u64, Touch)>,
    /// Marks of fetches still in flight.
    open_fetches: Vec<u64>,
}

impl Timeline {
    pub fn new(match_window: Duration) -> Self {
        Self {
            messages: Vec::new(),
            pending: Vec::new(),
            match_window,
            seq: 0,
            touched: HashMap::new(),
            open_fetches: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn pending(&self) -> &[PendingSend] {
        &self.pending
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending.clear();
        self.touched.clear();
        self.open_fetches.clear();
    }

    fn touch(&mut self, message_id: &str, touch: Touch) {
        self.seq += 1;
        if !self.open_fetches.is_empty() {
            self.touched.insert(message_id.to_string(), (self.seq, touch));
        }
    }

    fn sort(&mut self) {
        self.messages.sort_by_key(|m| m.created_at);
    }

    /// Show an optimistic row for a send that was just issued.
    pub fn push_pending(&mut self, temp: Message, pending: PendingSend) {
        self.messages.push(temp);
        self.pending.push(pending);
        self.sort();
    }

    /// Merge a confirmed row, resolving the pending send it belongs to.
    pub fn confirm(&mut self, confirmed: Message) -> Placement {
        let seen = self.contains(&confirmed.id);
        let resolved = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(idx, p)| p.rank(&confirmed, self.match_window, seen).map(|rank| (rank, idx)))
            .min()
            .map(|(_, idx)| self.pending.remove(idx));
        self.touch(&confirmed.id, Touch::Present);

        let placement = if seen {
            // The other confirmation path got here first.
            if let Some(p) = &resolved {
                self.messages.retain(|m| m.id != p.temp_id);
            }
            match self.messages.iter().position(|m| m.id == confirmed.id) {
                Some(pos) if self.messages[pos].updated_at > confirmed.updated_at => Placement::Ignored,
                Some(pos) => {
                    self.messages[pos] = confirmed;
                    Placement::Refreshed
                }
                None => {
                    self.messages.push(confirmed);
                    Placement::Appended
                }
            }
        } else {
            let temp_pos = resolved
                .as_ref()
                .and_then(|p| self.messages.iter().position(|m| m.id == p.temp_id));
            match temp_pos {
                Some(pos) => {
                    self.messages[pos] = confirmed;
                    Placement::ReplacedTemp
                }
                None => {
                    self.messages.push(confirmed);
                    Placement::Appended
                }
            }
        };

        self.sort();
        placement
    }

    /// Roll back a send whose insert was rejected.
    pub fn fail(&mut self, token: &str) -> Option<PendingSend> {
        let idx = self.pending.iter().position(|p| p.token == token)?;
        let pending = self.pending.remove(idx);
        self.messages.retain(|m| m.id != pending.temp_id);
        Some(pending)
    }

    /// Replace a visible row by id. Returns `false` if it is not visible.
    pub fn update(&mut self, message: Message) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                let id = message.id.clone();
                *existing = message;
                self.touch(&id, Touch::Present);
                self.sort();
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        // Recorded even when not visible, so an in-flight fetch cannot
        // bring the row back.
        self.touch(message_id, Touch::Removed);
        self.messages.len() != before
    }

    /// Swap in a fresh reaction set. Returns the updated row if it is visible.
    pub fn set_reactions(&mut self, message_id: &str, reactions: Vec<Reaction>) -> Option<&Message> {
        let pos = self.messages.iter().position(|m| m.id == message_id)?;
        self.messages[pos].reactions = reactions;
        self.touch(message_id, Touch::Present);
        Some(&self.messages[pos])
    }

    /// Id of the visible message holding the reaction `reaction_id`.
    pub fn reaction_owner(&self, reaction_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.reactions.iter().any(|r| r.id == reaction_id))
            .map(|m| m.id.as_str())
    }

    /// Start tracking changes for a fetch that is about to be issued.
    pub fn begin_fetch(&mut self) -> FetchMark {
        self.open_fetches.push(self.seq);
        FetchMark(self.seq)
    }

    /// Forget a fetch that failed or was dropped.
    pub fn abandon_fetch(&mut self, mark: FetchMark) {
        if let Some(idx) = self.open_fetches.iter().position(|m| *m == mark.0) {
            self.open_fetches.swap_remove(idx);
        }
        self.prune();
    }

    fn prune(&mut self) {
        match self.open_fetches.iter().min().copied() {
            Some(oldest) => self.touched.retain(|_, (seq, _)| *seq > oldest),
            None => self.touched.clear(),
        }
    }

    /// Replace the list with a fetch result issued at `mark`.
    ///
    /// Changes applied since `mark` win over the fetched rows: rows confirmed
    /// or updated meanwhile are kept (the newer copy by `updated_at`), rows
    /// removed meanwhile stay removed. Temp rows of sends that are still
    /// pending survive. A pending send whose stored row is in the result is
    /// resolved; each fetched row resolves at most one send, and a row that
    /// was already on screen only by exact token.
    pub fn merge_fetch(&mut self, fetched: Vec<Message>, mark: FetchMark) {
        let since = |entry: Option<&(u64, Touch)>| entry.filter(|(seq, _)| *seq > mark.0).map(|(_, t)| *t);

        let mut merged: Vec<Message> = Vec::with_capacity(fetched.len());
        for row in fetched {
            match since(self.touched.get(&row.id)) {
                Some(Touch::Removed) => continue,
                Some(Touch::Present) => {
                    match self.messages.iter().find(|m| m.id == row.id) {
                        Some(live) if live.updated_at >= row.updated_at => merged.push(live.clone()),
                        _ => merged.push(row),
                    }
                }
                None => merged.push(row),
            }
        }
        for live in &self.messages {
            let fresh = since(self.touched.get(&live.id)) == Some(Touch::Present);
            if fresh && !live.is_temporary() && !merged.iter().any(|m| m.id == live.id) {
                merged.push(live.clone());
            }
        }

        let window = self.match_window;
        let mut claimed: HashSet<String> = HashSet::new();
        let mut still_pending = Vec::new();
        let mut temps = Vec::new();

        for p in std::mem::take(&mut self.pending) {
            let confirmation = merged
                .iter()
                .filter(|m| !claimed.contains(&m.id))
                .filter_map(|m| {
                    let seen = self.messages.iter().any(|v| v.id == m.id);
                    p.rank(m, window, seen).map(|rank| (rank, m.id.as_str()))
                })
                .min();
            if let Some((_, id)) = confirmation {
                claimed.insert(id.to_string());
                continue;
            }
            if let Some(temp) = self.messages.iter().find(|m| m.id == p.temp_id) {
                temps.push(temp.clone());
                still_pending.push(p);
            }
        }

        self.messages = merged;
        self.messages.extend(temps);
        self.pending = still_pending;
        self.sort();
        self.abandon_fetch(mark);
    }

    /// Replace the list with rows known to be current, e.g. a cache entry.
    pub fn replace_all(&mut self, fetched: Vec<Message>) {
        let mark = self.begin_fetch();
        self.merge_fetch(fetched, mark);
    }

    /// Confirmed rows of the list, for writing back to the cache.
    pub fn confirmed(&self) -> Vec<Message> {
        self.messages.iter().filter(|m| !m.is_temporary()).cloned().collect()
    }

    /// Drop sends that have gone unconfirmed for longer than `grace`.
    pub fn sweep(&mut self, grace: Duration) -> Vec<PendingSend> {
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|p| p.issued_at.elapsed() > grace);
        self.pending = kept;

        for p in &expired {
            self.messages.retain(|m| m.id != p.temp_id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WINDOW: Duration = Duration::from_secs(5);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn row(id: &str, user: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            content: Some(format!("text {}", id)),
            image_url: None,
            channel_id: "general".into(),
            user_id: user.into(),
            created_at: at(secs),
            updated_at: at(secs),
            parent_id: None,
            client_token: None,
            profile: None,
            reactions: vec![],
        }
    }

    fn pending(token: &str, temp_id: &str, user: &str, secs: i64) -> (Message, PendingSend) {
        let temp = row(temp_id, user, secs);
        let pending = PendingSend {
            token: token.into(),
            temp_id: temp_id.into(),
            channel_id: "general".into(),
            user_id: user.into(),
            content: temp.content.clone(),
            created_at: at(secs),
            issued_at: Instant::now(),
        };
        (temp, pending)
    }

    fn ids(timeline: &Timeline) -> Vec<&str> {
        timeline.messages().iter().map(|m| m.id.as_str()).collect()
    }

    fn timeline_with_send() -> Timeline {
        let mut timeline = Timeline::new(WINDOW);
        timeline.replace_all(vec![row("m-1", "U7", 0)]);
        let (temp, p) = pending("tok-1", "temp-1", "U42", 100);
        timeline.push_pending(temp, p);
        timeline
    }

    fn confirmed_row() -> Message {
        let mut confirmed = row("m-991", "U42", 101);
        confirmed.client_token = Some("tok-1".into());
        confirmed
    }

    #[test]
    fn insert_response_first_then_realtime() {
        let mut timeline = timeline_with_send();

        assert_eq!(timeline.confirm(confirmed_row()), Placement::ReplacedTemp);
        assert_eq!(timeline.confirm(confirmed_row()), Placement::Refreshed);

        assert_eq!(ids(&timeline), ["m-1", "m-991"]);
        assert!(timeline.pending().is_empty());
    }

    #[test]
    fn realtime_first_then_insert_response() {
        let mut timeline = timeline_with_send();

        let mut realtime = confirmed_row();
        realtime.content = Some("from realtime".into());
        assert_eq!(timeline.confirm(realtime), Placement::ReplacedTemp);
        assert_eq!(timeline.confirm(confirmed_row()), Placement::Refreshed);

        assert_eq!(ids(&timeline), ["m-1", "m-991"]);
        assert!(timeline.messages().iter().all(|m| !m.is_temporary()));
    }

    #[test]
    fn stale_copy_does_not_overwrite_newer_edit() {
        let mut timeline = timeline_with_send();
        timeline.confirm(confirmed_row());

        let mut edited = confirmed_row();
        edited.content = Some("edited".into());
        edited.updated_at = at(200);
        assert!(timeline.update(edited));

        assert_eq!(timeline.confirm(confirmed_row()), Placement::Ignored);
        assert_eq!(timeline.messages()[1].content.as_deref(), Some("edited"));
    }

    #[test]
    fn heuristic_match_without_token() {
        let mut timeline = timeline_with_send();

        assert_eq!(timeline.confirm(row("m-991", "U42", 104)), Placement::ReplacedTemp);
        assert_eq!(ids(&timeline), ["m-1", "m-991"]);
    }

    #[test]
    fn heuristic_rejects_other_author_or_distant_time() {
        let mut timeline = timeline_with_send();

        assert_eq!(timeline.confirm(row("m-2", "U7", 100)), Placement::Appended);
        assert_eq!(timeline.confirm(row("m-3", "U42", 106)), Placement::Appended);
        assert_eq!(timeline.pending().len(), 1);
        assert!(timeline.contains("temp-1"));
    }

    #[test]
    fn foreign_token_never_matches() {
        let mut timeline = timeline_with_send();

        let mut other_device = row("m-5", "U42", 100);
        other_device.client_token = Some("tok-other".into());
        assert_eq!(timeline.confirm(other_device), Placement::Appended);
        assert!(timeline.contains("temp-1"));
    }

    #[test]
    fn fail_removes_only_the_temp_row() {
        let mut timeline = timeline_with_send();

        let failed = timeline.fail("tok-1").unwrap();
        assert_eq!(failed.temp_id, "temp-1");
        assert_eq!(ids(&timeline), ["m-1"]);
        assert!(timeline.fail("tok-1").is_none());
    }

    #[test]
    fn list_stays_sorted_under_mixed_changes() {
        let mut timeline = Timeline::new(WINDOW);
        timeline.replace_all(vec![row("a", "U1", 10), row("c", "U1", 30)]);
        timeline.confirm(row("d", "U2", 40));
        timeline.confirm(row("b", "U2", 20));
        timeline.remove("c");
        let mut moved = row("a", "U1", 35);
        moved.updated_at = at(50);
        timeline.update(moved);

        let stamps: Vec<_> = timeline.messages().iter().map(|m| m.created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ids(&timeline), ["b", "a", "d"]);
    }

    #[test]
    fn update_of_unknown_row_is_ignored() {
        let mut timeline = timeline_with_send();
        assert!(!timeline.update(row("m-404", "U1", 5)));
        assert_eq!(timeline.messages().len(), 2);
    }

    #[test]
    fn refetch_keeps_pending_rows_and_resolves_confirmed_ones() {
        let mut timeline = timeline_with_send();
        let (temp, p) = pending("tok-2", "temp-2", "U42", 300);
        timeline.push_pending(temp, p);

        timeline.replace_all(vec![row("m-1", "U7", 0), confirmed_row()]);

        assert_eq!(ids(&timeline), ["m-1", "m-991", "temp-2"]);
        assert_eq!(timeline.pending().len(), 1);
        assert_eq!(timeline.pending()[0].token, "tok-2");
    }

    #[test]
    fn reactions_are_replaced_in_place() {
        let mut timeline = timeline_with_send();
        let reaction = Reaction {
            id: "r-1".into(),
            message_id: "m-1".into(),
            user_id: "U42".into(),
            emoji: "🎉".into(),
        };

        let updated = timeline.set_reactions("m-1", vec![reaction]).unwrap();
        assert_eq!(updated.reactions.len(), 1);
        assert_eq!(timeline.reaction_owner("r-1"), Some("m-1"));
        assert!(timeline.set_reactions("m-404", vec![]).is_none());
    }

    fn two_sends_in_flight() -> Timeline {
        let mut timeline = Timeline::new(WINDOW);
        let (temp, p) = pending("tok-a", "temp-a", "U42", 100);
        timeline.push_pending(temp, p);
        let (temp, p) = pending("tok-b", "temp-b", "U42", 102);
        timeline.push_pending(temp, p);
        timeline
    }

    #[test]
    fn second_copy_without_token_leaves_next_send_pending() {
        let mut timeline = two_sends_in_flight();

        assert_eq!(timeline.confirm(row("m-a", "U42", 100)), Placement::ReplacedTemp);
        assert_eq!(timeline.confirm(row("m-a", "U42", 100)), Placement::Refreshed);

        assert_eq!(ids(&timeline), ["m-a", "temp-b"]);
        assert_eq!(timeline.pending().len(), 1);
        assert_eq!(timeline.pending()[0].token, "tok-b");
    }

    #[test]
    fn second_copy_with_token_resolves_only_its_own_send() {
        let mut timeline = two_sends_in_flight();
        let mut stored = row("m-a", "U42", 100);
        stored.client_token = Some("tok-a".into());

        timeline.confirm(stored.clone());
        timeline.confirm(stored);

        assert_eq!(ids(&timeline), ["m-a", "temp-b"]);
        assert_eq!(timeline.pending()[0].token, "tok-b");
    }

    #[test]
    fn fallback_prefers_matching_content() {
        let mut timeline = two_sends_in_flight();

        // Closer in time to temp-a, but carries temp-b's text.
        let mut stored = row("m-b", "U42", 101);
        stored.content = Some("text temp-b".into());
        assert_eq!(timeline.confirm(stored), Placement::ReplacedTemp);

        assert_eq!(ids(&timeline), ["temp-a", "m-b"]);
        assert_eq!(timeline.pending()[0].token, "tok-a");
    }

    #[test]
    fn refetch_of_seen_row_does_not_resolve_another_send() {
        let mut timeline = two_sends_in_flight();
        timeline.confirm(row("m-a", "U42", 100));

        timeline.replace_all(vec![row("m-a", "U42", 100)]);

        assert_eq!(ids(&timeline), ["m-a", "temp-b"]);
        assert_eq!(timeline.pending()[0].token, "tok-b");
    }

    #[test]
    fn fetch_keeps_changes_applied_while_in_flight() {
        let mut timeline = Timeline::new(WINDOW);
        timeline.replace_all(vec![row("m-1", "U7", 0), row("m-2", "U8", 10)]);

        let mark = timeline.begin_fetch();
        timeline.confirm(row("m-new", "U9", 30));
        timeline.remove("m-2");
        let mut edited = row("m-1", "U7", 0);
        edited.content = Some("edited".into());
        edited.updated_at = at(40);
        timeline.update(edited);

        timeline.merge_fetch(vec![row("m-1", "U7", 0), row("m-2", "U8", 10)], mark);

        assert_eq!(ids(&timeline), ["m-1", "m-new"]);
        assert_eq!(timeline.messages()[0].content.as_deref(), Some("edited"));
        assert_eq!(timeline.confirmed().len(), 2);
    }

    #[test]
    fn fetch_result_wins_over_changes_from_before_it() {
        let mut timeline = Timeline::new(WINDOW);
        timeline.confirm(row("m-old", "U9", 5));
        timeline.remove("m-1");

        let mark = timeline.begin_fetch();
        timeline.merge_fetch(vec![row("m-1", "U7", 0)], mark);

        assert_eq!(ids(&timeline), ["m-1"]);
    }

    #[test]
    fn abandoned_fetch_forgets_tracked_changes() {
        let mut timeline = Timeline::new(WINDOW);
        let mark = timeline.begin_fetch();
        timeline.remove("m-1");
        timeline.abandon_fetch(mark);

        timeline.replace_all(vec![row("m-1", "U7", 0)]);
        assert_eq!(ids(&timeline), ["m-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_only_rows_past_grace() {
        let grace = Duration::from_secs(10);
        let mut timeline = timeline_with_send();

        tokio::time::advance(Duration::from_secs(5)).await;
        let (temp, p) = pending("tok-2", "temp-2", "U42", 105);
        timeline.push_pending(temp, p);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(timeline.sweep(grace).is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        let expired = timeline.sweep(grace);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].temp_id, "temp-1");
        assert_eq!(ids(&timeline), ["m-1", "temp-2"]);
    }
}
