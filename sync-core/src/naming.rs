//! Room names generated from lazy-load heroes.
//!
//! The caller resolves each hero's current member state beforehand; this
//! module only decides how those members are rendered.

use std::collections::HashMap;

use larch_sync_types::{ContentUri, LazyLoadSummary, Membership, UserId};

/// Names shown before collapsing the rest into "and N others".
pub const MAX_DISPLAYED_NAMES: usize = 5;

/// Name used when no member can be shown.
pub const EMPTY_ROOM_NAME: &str = "Empty room";

/// Current member state of a hero.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeroMember {
    /// Membership string, parsed. `None` for unrecognized values.
    pub membership: Option<Membership>,
    /// Display name, if set.
    pub display_name: Option<String>,
    /// Raw avatar URI, if set.
    pub avatar_url: Option<String>,
}

/// A generated room name and the avatar to adopt with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantName {
    /// Rendered name.
    pub name: String,
    /// Avatar of the only displayed member, if exactly one was displayed.
    pub avatar: Option<ContentUri>,
}

/// Join member names as "A", "A and B", "A, B and C".
///
/// Five names with more than six members collapse to the first four plus
/// "and N others" where N is `total_count - 5`.
pub fn join_member_names(names: &[String], total_count: i64) -> String {
    match names {
        [] => String::new(),
        [only] => only.clone(),
        [rest @ .., last]
            if names.len() < MAX_DISPLAYED_NAMES
                || (names.len() == MAX_DISPLAYED_NAMES && total_count <= 6) =>
        {
            format!("{} and {}", rest.join(", "), last)
        }
        _ => format!("{} and {} others", names[..4].join(", "), total_count - 5),
    }
}

/// Derive a participant-based room name.
///
/// `members` maps hero ids to their resolved member state; a hero missing
/// from the map has no member event and counts as a former member.
/// Functional members are skipped and reduce the effective member count.
pub fn participant_name(
    summary: Option<&LazyLoadSummary>,
    functional_members: &[UserId],
    members: &HashMap<UserId, HeroMember>,
) -> ParticipantName {
    let heroes = match summary.and_then(|s| s.heroes.as_deref()) {
        Some(heroes) if !heroes.is_empty() => heroes,
        _ => {
            return ParticipantName {
                name: EMPTY_ROOM_NAME.to_string(),
                avatar: None,
            }
        }
    };
    let mut member_count = summary.map(|s| i64::from(s.member_count())).unwrap_or(0);

    let mut present: Vec<String> = Vec::new();
    let mut left: Vec<String> = Vec::new();
    let mut avatar: Option<ContentUri> = None;

    for hero in heroes {
        if functional_members.contains(hero) {
            member_count -= 1;
            continue;
        }
        if present.len() >= MAX_DISPLAYED_NAMES {
            break;
        }
        let Some(member) = members.get(hero) else {
            left.push(hero.to_string());
            continue;
        };
        let name = match member.display_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => hero.to_string(),
        };
        if let Some(url) = member.avatar_url.as_deref().filter(|url| !url.is_empty()) {
            avatar = ContentUri::parse_or_ignore(url);
        }
        if member.membership.is_some_and(|m| m.is_present()) {
            present.push(name);
        } else {
            left.push(name);
        }
    }

    if present.len() + left.len() > 1 {
        avatar = None;
    }

    let name = if !present.is_empty() {
        join_member_names(&present, member_count)
    } else if !left.is_empty() {
        format!(
            "{} (was {})",
            EMPTY_ROOM_NAME,
            join_member_names(&left, member_count)
        )
    } else {
        EMPTY_ROOM_NAME.to_string()
    };
    ParticipantName { name, avatar }
}
