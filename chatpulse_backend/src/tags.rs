//! Inline control tags in model output, e.g. `[AFFINITY:+5]` or
//! `[DIARY:today was good]`. Tags are stripped from what the user sees and
//! their effects are applied in one transaction.

use anyhow::Result;
use regex_lite::Regex;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::OnceLock;

use crate::database::{self, Character, MessageRole, RoomKind, StoredMessage, USER_ID};
use crate::ledger::{self, LedgerError, Transfer};

/// Upper bound for a `[TIMER:n]` override, in minutes.
pub const MAX_TIMER_MINUTES: f64 = 24.0 * 60.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tag {
    Timer { minutes: f64 },
    Transfer { amount: f64, note: String },
    Moment { content: String },
    MomentLike { moment_id: i64 },
    MomentComment { moment_id: i64, content: String },
    Diary { content: String },
    Affinity { delta: i64 },
    Pressure { level: i64 },
    /// Matched the tag grammar but has an unknown name or bad payload.
    Unrecognized { raw: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub display_text: String,
    pub tags: Vec<Tag>,
}

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[([A-Za-z_]+):([^\[\]]*)\]").ok())
        .as_ref()
}

/// Splits raw model output into display text and tags.
pub fn parse(text: &str) -> ParsedReply {
    let Some(pattern) = tag_pattern() else {
        return ParsedReply {
            display_text: tidy_whitespace(text),
            tags: Vec::new(),
        };
    };
    let mut tags = Vec::new();
    for captures in pattern.captures_iter(text) {
        let raw = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let payload = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        tags.push(parse_tag(name, payload).unwrap_or_else(|| Tag::Unrecognized {
            raw: raw.to_string(),
        }));
    }

    let stripped = pattern.replace_all(text, "");
    ParsedReply {
        display_text: tidy_whitespace(&stripped),
        tags,
    }
}

fn parse_tag(name: &str, payload: &str) -> Option<Tag> {
    let payload = payload.trim();
    match name.to_ascii_uppercase().as_str() {
        "TIMER" => {
            let minutes: f64 = payload.parse().ok()?;
            (minutes.is_finite() && minutes > 0.0).then(|| Tag::Timer {
                minutes: minutes.min(MAX_TIMER_MINUTES),
            })
        }
        "TRANSFER" => {
            let (amount, note) = match payload.split_once(':') {
                Some((amount, note)) => (amount, note.trim()),
                None => (payload, ""),
            };
            let amount: f64 = amount.trim().trim_start_matches(['¥', '$']).parse().ok()?;
            (amount.is_finite() && amount > 0.0).then(|| Tag::Transfer {
                amount,
                note: note.to_string(),
            })
        }
        "MOMENT" => non_empty(payload).map(|content| Tag::Moment { content }),
        "MOMENT_LIKE" => Some(Tag::MomentLike {
            moment_id: payload.parse().ok()?,
        }),
        "MOMENT_COMMENT" => {
            let (id, content) = payload.split_once(':')?;
            Some(Tag::MomentComment {
                moment_id: id.trim().parse().ok()?,
                content: non_empty(content)?,
            })
        }
        "DIARY" => non_empty(payload).map(|content| Tag::Diary { content }),
        "AFFINITY" => Some(Tag::Affinity {
            delta: payload.trim_start_matches('+').parse().ok()?,
        }),
        "PRESSURE" => Some(Tag::Pressure {
            level: payload.parse().ok()?,
        }),
        _ => None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Removes the blank runs left behind by stripped tags.
fn tidy_whitespace(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() && lines.last().map(|l| l.is_empty()).unwrap_or(true) {
            continue;
        }
        lines.push(collapsed);
    }
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

/// Where a reply was produced; transfers post their marker message here.
#[derive(Debug, Clone, Copy)]
pub struct TagScope<'a> {
    pub character: &'a Character,
    pub room_kind: RoomKind,
    pub room_id: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedEffects {
    /// Minutes until the next proactive wake, when `sys_timer` allows it.
    pub timer_override: Option<f64>,
    pub affinity: Option<i64>,
    pub pressure: Option<i64>,
    pub transfers: Vec<Transfer>,
    /// Marker messages written alongside the reply (transfers).
    pub messages: Vec<StoredMessage>,
    pub moments: Vec<i64>,
    pub diary_entries: usize,
    /// Human-readable reasons for tags that were recognized but had no effect.
    pub skipped: Vec<String>,
}

impl AppliedEffects {
    pub fn changed_character(&self) -> bool {
        self.affinity.is_some() || self.pressure.is_some() || !self.transfers.is_empty()
    }
}

/// Applies tags against an open transaction. An error leaves the caller to
/// roll back everything written so far.
pub fn apply(conn: &Connection, scope: TagScope<'_>, tags: &[Tag]) -> Result<AppliedEffects> {
    let character = scope.character;
    let mut effects = AppliedEffects::default();

    for tag in tags {
        match tag {
            Tag::Timer { minutes } => {
                if character.sys_timer {
                    effects.timer_override = Some(*minutes);
                } else {
                    effects.skipped.push("timer override disabled".to_string());
                }
            }
            Tag::Transfer { amount, note } => {
                match ledger::create_transfer(conn, &character.id, USER_ID, scope.room_id, *amount, note) {
                    Ok(transfer) => {
                        let marker = database::insert_message(
                            conn,
                            scope.room_kind,
                            scope.room_id,
                            &character.id,
                            MessageRole::Character,
                            &ledger::transfer_marker(&transfer),
                        )?;
                        effects.messages.push(marker);
                        effects.transfers.push(transfer);
                    }
                    Err(error @ (LedgerError::InsufficientFunds { .. } | LedgerError::InvalidAmount)) => {
                        tracing::debug!("Transfer from {} skipped: {}", character.id, error);
                        effects.skipped.push(format!("transfer: {}", error));
                    }
                    Err(error) => return Err(anyhow::Error::new(error).context("transfer tag failed")),
                }
            }
            Tag::Moment { content } => {
                effects
                    .moments
                    .push(database::insert_moment(conn, &character.id, content)?);
            }
            Tag::MomentLike { moment_id } => {
                if !database::moment_exists(conn, *moment_id)? {
                    effects.skipped.push(format!("moment {} not found", moment_id));
                } else if !database::insert_moment_like(conn, *moment_id, &character.id)? {
                    effects.skipped.push(format!("moment {} already liked", moment_id));
                }
            }
            Tag::MomentComment { moment_id, content } => {
                if database::moment_exists(conn, *moment_id)? {
                    database::insert_moment_comment(conn, *moment_id, &character.id, content)?;
                } else {
                    effects.skipped.push(format!("moment {} not found", moment_id));
                }
            }
            Tag::Diary { content } => {
                database::insert_diary(conn, &character.id, content)?;
                effects.diary_entries += 1;
            }
            Tag::Affinity { delta } => {
                effects.affinity = database::adjust_affinity(conn, &character.id, *delta)?;
            }
            Tag::Pressure { level } => {
                if character.sys_pressure {
                    let level = (*level).max(0);
                    database::set_pressure(conn, &character.id, level)?;
                    effects.pressure = Some(level);
                } else {
                    effects.skipped.push("pressure tracking disabled".to_string());
                }
            }
            Tag::Unrecognized { raw } => {
                tracing::debug!("Ignoring unrecognized tag {} from {}", raw, character.id);
            }
        }
    }

    Ok(effects)
}
