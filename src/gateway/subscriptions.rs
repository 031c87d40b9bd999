//! Session-start guild subscription planning.
//!
//! After READY the shard announces interest in every guild the session
//! covers. Each subscription frame must stay under a hard serialized-size
//! cap, so the guild set is split greedily by byte cost rather than by
//! guild count.

/// Serialized-size budget per subscription frame.
const FRAME_BUDGET: usize = 14 * 1024;

/// Subscription value attached to every guild. Fixed shape: all the
/// per-guild feeds on, no member or thread lists, no channel overrides.
const ENTRY_VALUE: &str = "{\"typing\":true,\"threads\":true,\"activities\":true,\
\"member_updates\":true,\"members\":[],\"thread_member_lists\":[],\"channels\":{}}";

/// Envelope wrapped around each chunk's guild map.
const PREFIX: &str = "{\"subscriptions\":{";
const SUFFIX: &str = "}}";

/// Split `guild_ids` into serialized subscription payloads, each within
/// the frame budget.
///
/// Greedy: a frame closes as soon as the next entry would push it over
/// budget. A single entry that is inherently over budget still gets its
/// own frame; empty frames are never produced.
pub fn plan(guild_ids: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut frames = Vec::new();
    let mut chunk = String::from(PREFIX);
    let mut entries = 0usize;

    for id in guild_ids {
        // "<id>":<value> plus a separator when the chunk already has one.
        let entry_len = id.len() + 2 + 1 + ENTRY_VALUE.len();
        let separator = usize::from(entries > 0);

        if entries > 0 && chunk.len() + separator + entry_len + SUFFIX.len() > FRAME_BUDGET {
            chunk.push_str(SUFFIX);
            frames.push(chunk);
            chunk = String::from(PREFIX);
            entries = 0;
        }

        if entries > 0 {
            chunk.push(',');
        }
        chunk.push('"');
        chunk.push_str(&id);
        chunk.push_str("\":");
        chunk.push_str(ENTRY_VALUE);
        entries += 1;

        // A pathological id can blow the budget on its own; ship it alone
        // rather than dragging other guilds over the cap with it.
        if entries == 1 && chunk.len() + SUFFIX.len() > FRAME_BUDGET {
            chunk.push_str(SUFFIX);
            frames.push(chunk);
            chunk = String::from(PREFIX);
            entries = 0;
        }
    }

    if entries > 0 {
        chunk.push_str(SUFFIX);
        frames.push(chunk);
    }

    frames
}
