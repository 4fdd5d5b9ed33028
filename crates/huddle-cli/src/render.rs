use std::collections::{BTreeMap, HashSet};

use huddle_feed::FeedSnapshot;
use huddle_types::models::Message;

/// Prints the parts of each snapshot the terminal has not shown yet.
#[derive(Default)]
pub struct Renderer {
    channel: Option<String>,
    shown: HashSet<String>,
    was_loading: bool,
}

impl Renderer {
    /// Lines to print for `snapshot`, in order.
    pub fn update(&mut self, snapshot: &FeedSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if snapshot.channel_id != self.channel {
            self.channel = snapshot.channel_id.clone();
            self.shown.clear();
            if let Some(channel) = &self.channel {
                lines.push(format!("--- #{} ---", channel));
            }
        }
        if snapshot.is_loading && !self.was_loading {
            lines.push("loading...".to_string());
        }
        self.was_loading = snapshot.is_loading;

        for message in &snapshot.messages {
            // Temp rows are printed once they are confirmed.
            if message.is_temporary() || self.shown.contains(&message.id) {
                continue;
            }
            self.shown.insert(message.id.clone());
            lines.push(format_message(message));
        }
        lines
    }
}

pub fn format_message(message: &Message) -> String {
    let author = message
        .profile
        .as_ref()
        .map(|p| p.username.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(message.user_id.as_str());

    let mut line = format!("[{}] {} <{}>", message.created_at.format("%H:%M"), message.id, author);
    if let Some(parent) = &message.parent_id {
        line.push_str(&format!(" (re {})", parent));
    }
    if let Some(content) = &message.content {
        line.push(' ');
        line.push_str(content);
    }
    if let Some(image) = &message.image_url {
        line.push_str(&format!(" [image {}]", image));
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for reaction in &message.reactions {
        *counts.entry(reaction.emoji.as_str()).or_default() += 1;
    }
    if !counts.is_empty() {
        let summary: Vec<String> = counts.iter().map(|(emoji, n)| format!("{}{}", emoji, n)).collect();
        line.push_str(&format!("  {}", summary.join(" ")));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use huddle_types::models::{Profile, Reaction};

    fn message(id: &str) -> Message {
        Message {
            id: id.into(),
            content: Some("hello".into()),
            image_url: None,
            channel_id: "general".into(),
            user_id: "U7".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap(),
            parent_id: None,
            client_token: None,
            profile: Some(Profile {
                id: "U7".into(),
                username: "ana".into(),
                full_name: None,
                avatar_url: None,
            }),
            reactions: vec![],
        }
    }

    fn snapshot(channel: &str, messages: Vec<Message>) -> FeedSnapshot {
        FeedSnapshot {
            channel_id: Some(channel.into()),
            messages,
            is_loading: false,
        }
    }

    #[test]
    fn message_line_shows_author_and_reactions() {
        let mut m = message("m-1");
        for (id, emoji) in [("r-1", "👍"), ("r-2", "👍"), ("r-3", "🎉")] {
            m.reactions.push(Reaction {
                id: id.into(),
                message_id: "m-1".into(),
                user_id: "U8".into(),
                emoji: emoji.into(),
            });
        }

        let line = format_message(&m);
        assert!(line.starts_with("[09:30] m-1 <ana> hello"));
        assert!(line.contains("👍2"));
        assert!(line.contains("🎉1"));
    }

    #[test]
    fn only_new_confirmed_rows_are_printed() {
        let mut renderer = Renderer::default();

        let first = renderer.update(&snapshot("general", vec![message("m-1")]));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], "--- #general ---");

        let mut temp = message("temp-1");
        temp.content = Some("pending".into());
        let second = renderer.update(&snapshot("general", vec![message("m-1"), temp]));
        assert!(second.is_empty());

        let third = renderer.update(&snapshot("general", vec![message("m-1"), message("m-2")]));
        assert_eq!(third.len(), 1);
        assert!(third[0].contains("m-2"));

        let switched = renderer.update(&snapshot("random", vec![message("m-1")]));
        assert_eq!(switched.len(), 2);
    }
}
