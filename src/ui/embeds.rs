use serenity::builder::CreateEmbed;

use crate::audio::session::{EntryStatus, QueueEntry, QueueSnapshot};

/// Embed colours
pub mod colors {
    use serenity::all::Colour;

    pub const BLURPLE: Colour = Colour::new(0x7289DA);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
}

/// Discord rejects embed field values longer than this.
const FIELD_LIMIT: usize = 1024;

const PLACEHOLDER: &str = "Getting info...";

/// Queue listing as sent by the `queue` command.
pub fn queue_embed(bot_name: &str, snapshot: &QueueSnapshot) -> CreateEmbed {
    CreateEmbed::new()
        .title(bot_name)
        .field("Queue", format_queue(snapshot), false)
        .color(colors::BLURPLE)
}

/// Confirmation for a `play` request.
pub fn enqueued_embed(bot_name: &str, query: &str, slots: usize) -> CreateEmbed {
    let value = if slots > 1 {
        format!("{} ({} tracks)", query, slots)
    } else {
        query.to_string()
    };
    CreateEmbed::new()
        .title(bot_name)
        .field("Enqueued", truncate(&value, FIELD_LIMIT), false)
        .color(colors::BLURPLE)
}

pub fn error_embed(bot_name: &str, message: &str) -> CreateEmbed {
    CreateEmbed::new()
        .title(bot_name)
        .description(truncate(message, 4096))
        .color(colors::ERROR_RED)
}

/// Renders the queue as text, fitting Discord's field limit.
///
/// Entries still resolving show a placeholder instead of being hidden.
pub fn format_queue(snapshot: &QueueSnapshot) -> String {
    if snapshot.entries.is_empty() {
        return "Queue is empty".to_string();
    }

    let mut lines = Vec::with_capacity(snapshot.entries.len());
    let mut position = 0;
    for entry in &snapshot.entries {
        if Some(entry.id) == snapshot.now_playing {
            let line = match &entry.track {
                Some(track) => format!(
                    "Currently playing: {} - {} added by {}\n",
                    track.title,
                    track.display_duration(),
                    entry.requested_by
                ),
                None => format!("Currently playing: {}\n", PLACEHOLDER),
            };
            lines.push(line);
        } else {
            position += 1;
            lines.push(format!("{}) {}", position, describe(entry)));
        }
    }

    let mut out = String::new();
    for (shown, line) in lines.iter().enumerate() {
        let remaining = lines.len() - shown;
        let footer = format!("...and {} more", remaining);
        if out.len() + line.len() + 1 + footer.len() > FIELD_LIMIT {
            out.push_str(&footer);
            return out;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn describe(entry: &QueueEntry) -> String {
    let Some(track) = &entry.track else {
        return PLACEHOLDER.to_string();
    };
    let line = format!(
        "{} - {} by {}",
        track.title,
        track.display_duration(),
        entry.requested_by
    );
    match entry.status {
        EntryStatus::Downloading => format!("{} (downloading)", line),
        _ => line,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit.saturating_sub(3);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
