use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use concierge_contracts::{AssistantThread, EventKind, InboundEvent, RawEvent, WebhookPayload};

/// Sent instead of an empty generation result.
pub const CLARIFICATION_PROMPT: &str = "Could you repeat your message?";

/// Reduce a raw user identifier to its canonical `U…` form.
///
/// Accepts mention markup (`<@U1|alias>`, `<@U1>`), profile URLs (last path
/// segment), composite `WORKSPACE-ID` tokens (right-hand segment when it
/// starts with the user sigil), and identifiers with stray prefixes before
/// the sigil. Total and idempotent; empty input yields an empty string.
pub fn normalize_user_id(raw: &str) -> String {
    let mut v = raw.trim().to_string();
    if v.is_empty() {
        return v;
    }
    if let Some(inner) = v.strip_prefix("<@").and_then(|s| s.strip_suffix('>')) {
        v = inner.split('|').next().unwrap_or_default().to_string();
    }
    if v.starts_with("https://") || v.starts_with("http://") {
        v = v
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
    }
    if let Some((_, right)) = v.split_once('-') {
        if right.starts_with('U') {
            v = right.to_string();
        }
    }
    if let Some(pos) = v.find('U') {
        if pos > 0 {
            v = v[pos..].to_string();
        }
    }
    v.trim().to_string()
}

/// Map a webhook payload to the event it carries, if it is one this service
/// handles. `assistant_thread_started` arrives either wrapped in an
/// `event_callback` envelope or as the top-level payload.
pub fn classify_event(payload: &WebhookPayload) -> Option<InboundEvent> {
    if let Some(event) = &payload.event {
        return classify_raw(payload.event_id.clone(), event);
    }
    if payload.payload_type.as_deref() == Some("assistant_thread_started") {
        let thread = payload.assistant_thread.as_ref()?;
        return Some(thread_started_event(payload.event_id.clone(), thread, None));
    }
    None
}

fn classify_raw(event_id: Option<String>, event: &RawEvent) -> Option<InboundEvent> {
    match event.event_type.as_str() {
        "assistant_thread_started" => {
            let thread = event.assistant_thread.as_ref()?;
            Some(thread_started_event(event_id, thread, event.channel.clone()))
        }
        "message" => Some(conversation_event(EventKind::Message, event_id, event)),
        "app_mention" => Some(conversation_event(EventKind::Mention, event_id, event)),
        _ => None,
    }
}

fn thread_started_event(
    event_id: Option<String>,
    thread: &AssistantThread,
    fallback_channel: Option<String>,
) -> InboundEvent {
    // Channel may be on the thread, in its context, or (rarely) only on the
    // outer event. An absent channel is handled downstream by opening a DM.
    let channel_id = thread
        .channel_id
        .clone()
        .filter(|c| !c.is_empty())
        .or_else(|| thread.context.channel_id.clone().filter(|c| !c.is_empty()))
        .or_else(|| fallback_channel.filter(|c| !c.is_empty()));
    InboundEvent {
        kind: EventKind::ThreadStarted,
        event_id,
        channel_id,
        user_id: thread.user_id.clone(),
        text: String::new(),
        ts: String::new(),
        thread_ts: thread.thread_ts.clone(),
        from_bot: false,
        subtype: None,
        client_msg_id: None,
    }
}

fn conversation_event(kind: EventKind, event_id: Option<String>, event: &RawEvent) -> InboundEvent {
    InboundEvent {
        kind,
        event_id,
        channel_id: event.channel.clone(),
        user_id: event.user.clone(),
        text: event.text.clone().unwrap_or_default(),
        ts: event.ts.clone().unwrap_or_default(),
        thread_ts: event.thread_ts.clone(),
        from_bot: event.bot_id.is_some(),
        subtype: event.subtype.clone(),
        client_msg_id: event.client_msg_id.clone(),
    }
}

/// The thread token replies should attach to: the event's own thread, or the
/// event itself as a new thread root.
pub fn reply_thread_token(event: &InboundEvent) -> Option<String> {
    event
        .thread_ts
        .clone()
        .filter(|v| !v.is_empty())
        .or_else(|| (!event.ts.is_empty()).then(|| event.ts.clone()))
}

/// Set of opaque tokens with insertion-order eviction beyond a fixed
/// capacity. Tokens are checked at most a few times shortly after insertion,
/// so oldest-first is sufficient and cheaper than LRU bookkeeping.
#[derive(Debug)]
pub struct BoundedTokenSet {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl BoundedTokenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.members.contains(token)
    }

    /// Returns false when the token was already present.
    pub fn insert(&mut self, token: &str) -> bool {
        if !self.members.insert(token.to_string()) {
            return false;
        }
        self.order.push_back(token.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// String-to-string cache with the same insertion-order eviction policy as
/// `BoundedTokenSet`. Entries are never invalidated, only evicted.
#[derive(Debug)]
pub struct BoundedCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, String>,
}

impl BoundedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        if self.entries.insert(key.to_string(), value.to_string()).is_none() {
            self.order.push_back(key.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admitted,
    Dropped { reason: &'static str },
}

/// Dedup state consulted before any event is processed. Three independent
/// token sets: delivery event ids (recorded at admission), replied-to
/// timestamps and replied-to mention message ids (both recorded only after a
/// successful reply, via [`AdmissionState::record_replied`]).
#[derive(Debug)]
pub struct AdmissionState {
    delivered_event_ids: BoundedTokenSet,
    replied_timestamps: BoundedTokenSet,
    replied_mention_ids: BoundedTokenSet,
}

impl AdmissionState {
    pub fn new(capacity: usize) -> Self {
        Self {
            delivered_event_ids: BoundedTokenSet::new(capacity),
            replied_timestamps: BoundedTokenSet::new(capacity),
            replied_mention_ids: BoundedTokenSet::new(capacity),
        }
    }

    /// Decide whether to process `event`. On admission the delivery event id
    /// is recorded immediately, before any reply is attempted: a redelivery
    /// of the same envelope is dropped even if the first attempt later fails.
    pub fn admit(&mut self, event: &InboundEvent, bot_user_id: &str) -> AdmissionVerdict {
        if let Some(event_id) = &event.event_id {
            if self.delivered_event_ids.contains(event_id) {
                return AdmissionVerdict::Dropped {
                    reason: "event_redelivered",
                };
            }
        }
        if event.from_bot {
            return AdmissionVerdict::Dropped {
                reason: "bot_origin",
            };
        }
        if event.subtype.as_deref() == Some("bot_message") {
            return AdmissionVerdict::Dropped {
                reason: "bot_subtype",
            };
        }
        if let Some(user) = &event.user_id {
            if !bot_user_id.is_empty() && normalize_user_id(user) == bot_user_id {
                return AdmissionVerdict::Dropped {
                    reason: "self_message",
                };
            }
        }
        if !event.ts.is_empty() && self.replied_timestamps.contains(&event.ts) {
            return AdmissionVerdict::Dropped {
                reason: "timestamp_replied",
            };
        }
        if event.kind == EventKind::Mention {
            if let Some(msg_id) = &event.client_msg_id {
                if self.replied_mention_ids.contains(msg_id) {
                    return AdmissionVerdict::Dropped {
                        reason: "mention_replied",
                    };
                }
            }
        }
        if let Some(event_id) = &event.event_id {
            self.delivered_event_ids.insert(event_id);
        }
        AdmissionVerdict::Admitted
    }

    /// Record the post-delivery dedup tokens for a successfully answered
    /// event.
    pub fn record_replied(&mut self, event: &InboundEvent) {
        if !event.ts.is_empty() {
            self.replied_timestamps.insert(&event.ts);
        }
        if event.kind == EventKind::Mention {
            if let Some(msg_id) = &event.client_msg_id {
                self.replied_mention_ids.insert(msg_id);
            }
        }
    }
}

/// Per-thread greeting state. A thread is Ungreeted until a greeting has
/// actually been delivered into it; Greeted is terminal for the process
/// lifetime. Ordinary messages are only answered in Greeted threads.
#[derive(Debug)]
pub struct ThreadGate {
    greeted: BoundedTokenSet,
}

impl ThreadGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            greeted: BoundedTokenSet::new(capacity),
        }
    }

    pub fn is_greeted(&self, channel_id: &str, thread_ts: &str) -> bool {
        self.greeted.contains(&thread_key(channel_id, thread_ts))
    }

    /// Returns false when the thread was already greeted.
    pub fn mark_greeted(&mut self, channel_id: &str, thread_ts: &str) -> bool {
        self.greeted.insert(&thread_key(channel_id, thread_ts))
    }
}

fn thread_key(channel_id: &str, thread_ts: &str) -> String {
    format!("{channel_id}:{thread_ts}")
}

pub fn greeting_text(name: Option<&str>) -> String {
    match name {
        Some(name) => format!("Hello, {name} — how can I help you today?"),
        None => "Hello — how can I help you today?".to_string(),
    }
}

/// Shape a generation result for delivery: rewrite double-asterisk emphasis
/// to the single-asterisk convention the destination renders, and substitute
/// the clarification prompt for an empty result.
pub fn shape_reply_text(raw: &str) -> String {
    let text = raw.replace("**", "*");
    if text.trim().is_empty() {
        CLARIFICATION_PROMPT.to_string()
    } else {
        text
    }
}

/// Lowercase and strip non-alphanumerics, for fuzzy header comparison.
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Convert a raw values grid (first row = headers) into one column map per
/// data row. Short rows leave trailing columns absent; extra cells beyond
/// the header row are ignored.
pub fn tabular_records(rows: &[Vec<String>]) -> Vec<BTreeMap<String, String>> {
    let Some((headers, data)) = rows.split_first() else {
        return Vec::new();
    };
    data.iter()
        .map(|row| {
            headers
                .iter()
                .zip(row.iter())
                .map(|(header, value)| (header.clone(), value.clone()))
                .collect()
        })
        .collect()
}

/// Headers tried verbatim when no column fuzzy-matches the identifier.
const IDENTIFIER_FALLBACK_HEADERS: [&str; 4] = ["Slack ID", "slack_id", "slackid", "idslack"];

/// Locate the identifier cell of a directory row: first a header whose
/// normalized form contains both "slack" and "id", then the fixed fallback
/// spellings.
pub fn row_identifier(row: &BTreeMap<String, String>) -> Option<&str> {
    for (header, value) in row {
        let normalized = normalize_header(header);
        if normalized.contains("slack") && normalized.contains("id") {
            return Some(value.as_str());
        }
    }
    IDENTIFIER_FALLBACK_HEADERS
        .iter()
        .find_map(|header| row.get(*header).map(String::as_str))
}

/// First row whose identifier cell normalizes to `canonical_id`.
pub fn find_directory_row<'a>(
    rows: &'a [BTreeMap<String, String>],
    canonical_id: &str,
) -> Option<&'a BTreeMap<String, String>> {
    if canonical_id.is_empty() {
        return None;
    }
    rows.iter().find(|row| {
        row_identifier(row)
            .map(|value| normalize_user_id(value) == canonical_id)
            .unwrap_or(false)
    })
}

/// Preferred display name from a directory row: exact `Name (pref)` then
/// `Name (first)` headers, then their normalized variants. A value counts
/// only when non-empty after trimming.
pub fn preferred_name(row: &BTreeMap<String, String>) -> Option<String> {
    for header in ["Name (pref)", "Name (first)"] {
        if let Some(value) = row.get(header) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    let normalized: HashMap<String, &String> = row
        .iter()
        .map(|(header, value)| (normalize_header(header), value))
        .collect();
    for key in ["namepref", "namefirst", "firstname"] {
        if let Some(value) = normalized.get(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_contracts::{EventKind, WebhookPayload};

    fn message_event(event_id: &str, ts: &str) -> InboundEvent {
        InboundEvent {
            kind: EventKind::Message,
            event_id: Some(event_id.to_string()),
            channel_id: Some("D1".to_string()),
            user_id: Some("U1".to_string()),
            text: "hi".to_string(),
            ts: ts.to_string(),
            thread_ts: None,
            from_bot: false,
            subtype: None,
            client_msg_id: None,
        }
    }

    #[test]
    fn normalize_extracts_mention_markup() {
        assert_eq!(normalize_user_id("<@U02ABC|jane>"), "U02ABC");
        assert_eq!(normalize_user_id("<@U02ABC>"), "U02ABC");
    }

    #[test]
    fn normalize_takes_last_url_segment() {
        assert_eq!(
            normalize_user_id("https://example.slack.com/team/U02ABC"),
            "U02ABC"
        );
        assert_eq!(
            normalize_user_id("https://example.slack.com/team/U02ABC/"),
            "U02ABC"
        );
    }

    #[test]
    fn normalize_splits_workspace_composite() {
        assert_eq!(normalize_user_id("T0999-U02ABC"), "U02ABC");
        // Right-hand side not a user id: fall through to the sigil scan.
        assert_eq!(normalize_user_id("T0999-X-U02ABC"), "U02ABC");
    }

    #[test]
    fn normalize_strips_residual_prefix_before_sigil() {
        assert_eq!(normalize_user_id("T0999 U02ABC"), "U02ABC");
        assert_eq!(normalize_user_id("  U02ABC  "), "U02ABC");
    }

    #[test]
    fn normalize_is_total_and_idempotent() {
        for raw in [
            "",
            "   ",
            "<@U02ABC|jane>",
            "https://example.slack.com/team/U02ABC",
            "T0999-U02ABC",
            "plainvalue",
            "U02ABC",
        ] {
            let once = normalize_user_id(raw);
            assert_eq!(normalize_user_id(&once), once, "not idempotent for {raw:?}");
        }
        assert_eq!(normalize_user_id(""), "");
    }

    #[test]
    fn classify_maps_message_and_mention() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"type":"event_callback","event_id":"Ev1","event":{"type":"app_mention","user":"U1","channel":"C1","text":"<@U9> hi","ts":"5.1","client_msg_id":"m1"}}"#,
        )
        .unwrap();
        let event = classify_event(&payload).expect("mention should classify");
        assert_eq!(event.kind, EventKind::Mention);
        assert_eq!(event.event_id.as_deref(), Some("Ev1"));
        assert_eq!(event.client_msg_id.as_deref(), Some("m1"));
    }

    #[test]
    fn classify_ignores_unhandled_types() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"type":"event_callback","event":{"type":"reaction_added","user":"U1"}}"#,
        )
        .unwrap();
        assert!(classify_event(&payload).is_none());
    }

    #[test]
    fn classify_thread_started_prefers_direct_channel_then_context() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{"type":"assistant_thread_started","event_id":"Ev2","assistant_thread":{"user_id":"U1","thread_ts":"T1","context":{"channel_id":"D9"}}}"#,
        )
        .unwrap();
        let event = classify_event(&payload).expect("thread started should classify");
        assert_eq!(event.kind, EventKind::ThreadStarted);
        assert_eq!(event.channel_id.as_deref(), Some("D9"));
        assert_eq!(event.thread_ts.as_deref(), Some("T1"));
    }

    #[test]
    fn reply_thread_token_prefers_existing_thread() {
        let mut event = message_event("Ev1", "100.1");
        assert_eq!(reply_thread_token(&event).as_deref(), Some("100.1"));
        event.thread_ts = Some("99.5".to_string());
        assert_eq!(reply_thread_token(&event).as_deref(), Some("99.5"));
    }

    #[test]
    fn bounded_set_evicts_oldest_beyond_capacity() {
        let mut set = BoundedTokenSet::new(2);
        assert!(set.insert("a"));
        assert!(set.insert("b"));
        assert!(!set.insert("b"));
        assert!(set.insert("c"));
        assert_eq!(set.len(), 2);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
    }

    #[test]
    fn bounded_cache_overwrites_without_growth() {
        let mut cache = BoundedCache::new(2);
        cache.insert("u1", "Ana");
        cache.insert("u1", "Anna");
        cache.insert("u2", "Bo");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("u1").as_deref(), Some("Anna"));
        cache.insert("u3", "Cy");
        assert!(cache.get("u1").is_none());
        assert_eq!(cache.get("u3").as_deref(), Some("Cy"));
    }

    #[test]
    fn admission_drops_redelivered_event_id_immediately() {
        let mut state = AdmissionState::new(16);
        let event = message_event("Ev1", "1.0");
        assert_eq!(state.admit(&event, "UBOT"), AdmissionVerdict::Admitted);
        // Same delivery id again, even though no reply was ever recorded.
        assert_eq!(
            state.admit(&event, "UBOT"),
            AdmissionVerdict::Dropped {
                reason: "event_redelivered"
            }
        );
    }

    #[test]
    fn admission_drops_bot_traffic() {
        let mut state = AdmissionState::new(16);

        let mut event = message_event("Ev1", "1.0");
        event.from_bot = true;
        assert!(matches!(
            state.admit(&event, "UBOT"),
            AdmissionVerdict::Dropped { reason: "bot_origin" }
        ));

        let mut event = message_event("Ev2", "1.1");
        event.subtype = Some("bot_message".to_string());
        assert!(matches!(
            state.admit(&event, "UBOT"),
            AdmissionVerdict::Dropped { reason: "bot_subtype" }
        ));

        let mut event = message_event("Ev3", "1.2");
        event.user_id = Some("<@UBOT>".to_string());
        assert!(matches!(
            state.admit(&event, "UBOT"),
            AdmissionVerdict::Dropped { reason: "self_message" }
        ));
    }

    #[test]
    fn admission_drops_replied_timestamp() {
        let mut state = AdmissionState::new(16);
        let event = message_event("Ev1", "100");
        assert_eq!(state.admit(&event, "UBOT"), AdmissionVerdict::Admitted);
        state.record_replied(&event);

        let retry = message_event("Ev2", "100");
        assert!(matches!(
            state.admit(&retry, "UBOT"),
            AdmissionVerdict::Dropped {
                reason: "timestamp_replied"
            }
        ));
    }

    #[test]
    fn admission_drops_replied_mention_id() {
        let mut state = AdmissionState::new(16);
        let mut mention = message_event("Ev1", "5.0");
        mention.kind = EventKind::Mention;
        mention.client_msg_id = Some("m1".to_string());
        assert_eq!(state.admit(&mention, "UBOT"), AdmissionVerdict::Admitted);
        state.record_replied(&mention);

        let mut retry = message_event("Ev2", "5.9");
        retry.kind = EventKind::Mention;
        retry.client_msg_id = Some("m1".to_string());
        assert!(matches!(
            state.admit(&retry, "UBOT"),
            AdmissionVerdict::Dropped {
                reason: "mention_replied"
            }
        ));
    }

    #[test]
    fn gate_transitions_at_most_once() {
        let mut gate = ThreadGate::new(16);
        assert!(!gate.is_greeted("D1", "T1"));
        assert!(gate.mark_greeted("D1", "T1"));
        assert!(gate.is_greeted("D1", "T1"));
        assert!(!gate.mark_greeted("D1", "T1"));
        // Distinct channel, same thread token: a different ThreadKey.
        assert!(!gate.is_greeted("D2", "T1"));
    }

    #[test]
    fn greeting_uses_name_when_available() {
        assert_eq!(
            greeting_text(Some("Ana")),
            "Hello, Ana — how can I help you today?"
        );
        assert_eq!(greeting_text(None), "Hello — how can I help you today?");
    }

    #[test]
    fn shape_reply_rewrites_emphasis_and_fills_empty() {
        assert_eq!(shape_reply_text("**Hello**"), "*Hello*");
        assert_eq!(shape_reply_text("plain"), "plain");
        assert_eq!(shape_reply_text(""), CLARIFICATION_PROMPT);
        assert_eq!(shape_reply_text("   "), CLARIFICATION_PROMPT);
    }

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tabular_records_zips_headers_and_pads_short_rows() {
        let rows = vec![
            vec!["Slack ID".to_string(), "Name (pref)".to_string()],
            vec!["T1-U1".to_string(), "Ana".to_string()],
            vec!["U2".to_string()],
        ];
        let records = tabular_records(&rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Name (pref)").unwrap(), "Ana");
        assert!(records[1].get("Name (pref)").is_none());
    }

    #[test]
    fn row_identifier_fuzzy_matches_headers() {
        let fuzzy = row(&[("Member Slack-ID", "U7"), ("Name (pref)", "Gus")]);
        assert_eq!(row_identifier(&fuzzy), Some("U7"));

        let exact_only = row(&[("Slack ID", "U8")]);
        assert_eq!(row_identifier(&exact_only), Some("U8"));

        let unmatched = row(&[("Email", "gus@example.com")]);
        assert_eq!(row_identifier(&unmatched), None);
    }

    #[test]
    fn find_directory_row_normalizes_cell_before_comparing() {
        let rows = vec![
            row(&[("Slack ID", "T0999-U02ABC"), ("Name (pref)", "Ana")]),
            row(&[("Slack ID", "U03DEF"), ("Name (pref)", "Bo")]),
        ];
        let hit = find_directory_row(&rows, "U02ABC").expect("row should match");
        assert_eq!(hit.get("Name (pref)").unwrap(), "Ana");
        assert!(find_directory_row(&rows, "U99").is_none());
        assert!(find_directory_row(&rows, "").is_none());
    }

    #[test]
    fn preferred_name_tries_exact_then_normalized_headers() {
        assert_eq!(
            preferred_name(&row(&[("Name (pref)", " Ana "), ("Name (first)", "Anita")])),
            Some("Ana".to_string())
        );
        assert_eq!(
            preferred_name(&row(&[("Name (pref)", "  "), ("Name (first)", "Anita")])),
            Some("Anita".to_string())
        );
        assert_eq!(
            preferred_name(&row(&[("First Name", "Bo")])),
            Some("Bo".to_string())
        );
        assert_eq!(preferred_name(&row(&[("Email", "x@y.z")])), None);
    }
}
