use url::Url;
use urlencoding::{decode, encode};

pub const INVITE_SCHEME: &str = "syncstream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteLink {
    pub room_id: String,
}

pub fn build_invite_url(room_id: &str) -> String {
    format!("{INVITE_SCHEME}://join?room={}", encode(room_id))
}

/// Accepts `syncstream://join?room=<id>`, web links ending in `/room/<id>`
/// (or carrying `?room=<id>`), and bare room ids.
pub fn parse_invite_url(input: &str) -> Option<InviteLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with("syncstream://")
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else if trimmed.contains('=') {
        format!("{INVITE_SCHEME}://join?{trimmed}")
    } else {
        return bare_room_id(trimmed);
    };

    let url = Url::parse(&normalized).ok()?;
    let from_query = url
        .query_pairs()
        .find(|(key, _)| key == "room")
        .and_then(|(_, value)| decode(&value).ok().map(|v| v.into_owned()));

    let room_id = from_query.or_else(|| {
        let mut segments = url.path_segments()?;
        segments
            .by_ref()
            .find(|segment| *segment == "room")
            .and_then(|_| segments.next())
            .and_then(|id| decode(id).ok().map(|v| v.into_owned()))
    })?;

    bare_room_id(&room_id)
}

fn bare_room_id(candidate: &str) -> Option<InviteLink> {
    let candidate = candidate.trim();
    let valid = !candidate.is_empty()
        && candidate.len() <= 64
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| InviteLink {
        room_id: candidate.to_string(),
    })
}
