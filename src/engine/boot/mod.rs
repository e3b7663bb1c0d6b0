use std::sync::OnceLock;

use regex::Regex;

pub mod grub;
pub mod systemd;

/// Roles a boot entry can have, in menu order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryRole {
    Active,
    Passive,
    Recovery,
    Statereset,
}

pub const ENTRY_ROLES: [EntryRole; 4] = [
    EntryRole::Active,
    EntryRole::Passive,
    EntryRole::Recovery,
    EntryRole::Statereset,
];

/// The display names of a stock entry set, in menu order.
pub const CANONICAL_DISPLAY_NAMES: [&str; 4] = ["cos", "fallback", "recovery", "statereset"];

impl EntryRole {
    /// Token the entry's conf filename starts with.
    pub fn conf_prefix(&self) -> &'static str {
        match self {
            EntryRole::Active => "active",
            EntryRole::Passive => "passive",
            EntryRole::Recovery => "recovery",
            EntryRole::Statereset => "statereset",
        }
    }

    /// Human-facing name shown in listings and accepted by selection.
    pub fn display_name(&self) -> &'static str {
        match self {
            EntryRole::Active => "cos",
            EntryRole::Passive => "fallback",
            EntryRole::Recovery => "recovery",
            EntryRole::Statereset => "statereset",
        }
    }

    /// Menu position, independent of directory order.
    pub fn sort_key(&self) -> &'static str {
        match self {
            EntryRole::Active => "0001",
            EntryRole::Passive => "0002",
            EntryRole::Recovery => "0003",
            EntryRole::Statereset => "0004",
        }
    }

    /// Suffix appended to an entry title when artifacts rotate into this
    /// role.
    pub fn title_suffix(&self) -> &'static str {
        match self {
            EntryRole::Passive => " (fallback)",
            EntryRole::Recovery => " recovery",
            EntryRole::Active | EntryRole::Statereset => "",
        }
    }

    pub fn from_conf_token(token: &str) -> Option<Self> {
        ENTRY_ROLES.into_iter().find(|r| r.conf_prefix() == token)
    }

    pub fn from_display_token(token: &str) -> Option<Self> {
        match token {
            // `active` is accepted as a migration alias for `cos`.
            "cos" | "active" => Some(EntryRole::Active),
            "fallback" => Some(EntryRole::Passive),
            "recovery" => Some(EntryRole::Recovery),
            "statereset" => Some(EntryRole::Statereset),
            _ => None,
        }
    }
}

/// Sort key for an arbitrary conf filename; entries outside the known role
/// set sort after them.
pub fn sort_key_for(filename: &str) -> &'static str {
    let name = strip_assessment(filename.strip_suffix(".conf").unwrap_or(filename));
    let token = name.split('_').next().unwrap_or(name);
    EntryRole::from_conf_token(token)
        .map(|role| role.sort_key())
        .unwrap_or("0010")
}

fn assessment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\+\d+(-\d+)?$").expect("valid regex"))
}

/// Strips the boot-assessment counter (`+N` or `+N-M`) systemd-boot appends
/// to entry filenames.
pub fn strip_assessment(name: &str) -> &str {
    match assessment_regex().find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// Maps a conf filename to its display name: the role prefix becomes the
/// human name, a `_`-joined differentiator follows space-separated, and the
/// boot-assessment suffix is dropped. Names outside the role set map to
/// their underscore-to-space rendition.
pub fn conf_to_display(filename: &str) -> String {
    let name = strip_assessment(filename.strip_suffix(".conf").unwrap_or(filename));
    let mut parts = name.split('_');
    let first = parts.next().unwrap_or(name);

    let mut display = match EntryRole::from_conf_token(first) {
        Some(role) => role.display_name().to_string(),
        None => first.to_string(),
    };
    for part in parts {
        display.push(' ');
        display.push_str(part);
    }
    display
}

/// Inverse of [`conf_to_display`], minus the boot-assessment suffix, which
/// is not recoverable from a display name. Callers reconcile the suffix
/// against the real entry list.
pub fn display_to_conf_prefix(name: &str) -> String {
    let mut words = name.split_whitespace();
    let first = words.next().unwrap_or(name);

    let mut prefix = match EntryRole::from_display_token(first) {
        Some(role) => role.conf_prefix().to_string(),
        None => first.to_string(),
    };
    for word in words {
        prefix.push('_');
        prefix.push_str(word);
    }
    prefix
}
