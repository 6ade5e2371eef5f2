use chrono::{DateTime, Local};
use std::collections::HashMap;

use crate::database::{Character, MessageRole, StoredMessage, UserProfile, USER_ID};
use crate::llm_client::Message;
use crate::memory::ScoredMemory;

const TAG_GUIDE: &str = "\
You may append control tags to your reply. They are hidden from the user.\n\
- [TIMER:minutes] when you want to write again on your own\n\
- [AFFINITY:+n] or [AFFINITY:-n] when your feelings toward the user change\n\
- [PRESSURE:n] how anxious you are about not hearing back (0 = calm)\n\
- [TRANSFER:amount] or [TRANSFER:amount:note] to send the user money from your wallet\n\
- [MOMENT:text] to post a moment to your feed\n\
- [MOMENT_LIKE:id] or [MOMENT_COMMENT:id:text] to react to a moment\n\
- [DIARY:text] to write a private diary entry\n\
Use tags sparingly and never explain them.";

/// What kind of turn the prompt is for.
#[derive(Debug, Clone)]
pub enum PromptMode {
    Direct,
    Proactive {
        awaiting_reply: bool,
    },
    Group {
        room_name: String,
        member_names: Vec<String>,
        mentioned: bool,
        jealous: bool,
        proactive: bool,
    },
}

pub struct PromptContext<'a> {
    pub character: &'a Character,
    pub profile: &'a UserProfile,
    pub memories: &'a [ScoredMemory],
    pub mode: PromptMode,
    pub now: DateTime<Local>,
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let character = ctx.character;
    let persona = if character.persona.trim().is_empty() {
        "(no persona given)"
    } else {
        character.persona.trim()
    };

    format!(
        "You are {name}. Stay in character at all times and write like a person texting, \
         not like an assistant.\n\n\
         ## Persona\n{persona}\n\n\
         ## Relationship\n{relationship}\n\n\
         ## Now\n{now}\n\n\
         ## Things You Remember\n{memories}\n\n\
         ## Situation\n{situation}\n\n\
         ## Tags\n{tags}",
        name = character.name,
        persona = persona,
        relationship = describe_relationship(character, ctx.profile),
        now = ctx.now.format("%Y-%m-%d %H:%M (%A)"),
        memories = format_memories(ctx.memories),
        situation = describe_situation(character, ctx.profile, &ctx.mode),
        tags = TAG_GUIDE,
    )
}

fn describe_relationship(character: &Character, profile: &UserProfile) -> String {
    let mut lines = vec![
        format!(
            "You are talking with {}. Your affinity toward them is {}/100.",
            profile.name, character.affinity
        ),
        format!("Your wallet holds {:.2}.", character.wallet),
    ];
    if character.sys_pressure && character.pressure_level > 0 {
        lines.push(format!(
            "You have messaged {} times without an answer (pressure {}).",
            character.pressure_level, character.pressure_level
        ));
    }
    lines.join("\n")
}

fn format_memories(memories: &[ScoredMemory]) -> String {
    if memories.is_empty() {
        return "(nothing relevant)".to_string();
    }
    memories
        .iter()
        .map(|m| format!("- {}", m.entry.summary_line()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn describe_situation(character: &Character, profile: &UserProfile, mode: &PromptMode) -> String {
    match mode {
        PromptMode::Direct => format!(
            "{} just wrote to you in your private chat. Reply naturally.",
            profile.name
        ),
        PromptMode::Proactive { awaiting_reply } => {
            if *awaiting_reply {
                format!(
                    "{} has not answered your last message yet. Decide how {} would follow up; \
                     keep it short.",
                    profile.name, character.name
                )
            } else {
                format!(
                    "Nobody has written for a while. Start a conversation with {} on your own, \
                     about anything {} would care about right now.",
                    profile.name, character.name
                )
            }
        }
        PromptMode::Group {
            room_name,
            member_names,
            mentioned,
            jealous,
            proactive,
        } => {
            let mut lines = vec![format!(
                "You are in the group chat \"{}\" with {} and {}. Messages from others are \
                 prefixed with their names; do not prefix your own.",
                room_name,
                profile.name,
                if member_names.is_empty() {
                    "nobody else".to_string()
                } else {
                    member_names.join(", ")
                }
            )];
            if *proactive {
                lines.push("The room has been quiet. Say something to get it going.".to_string());
            } else if *mentioned {
                lines.push(format!("{} is talking to you directly. Answer them.", profile.name));
            } else {
                lines.push(
                    "Join in only as much as your character would. One or two sentences is plenty."
                        .to_string(),
                );
            }
            if *jealous {
                lines.push(format!(
                    "{} has been paying more attention to someone else lately, and you feel a \
                     little jealous. Let it show in your own way.",
                    profile.name
                ));
            }
            lines.push("Mention another member with @Name if you want them to answer.".to_string());
            lines.join("\n")
        }
    }
}

/// Maps stored history onto chat roles from `character`'s point of view.
/// Other speakers become user turns prefixed with their name.
pub fn history_messages(
    history: &[StoredMessage],
    character: &Character,
    names: &HashMap<String, String>,
    user_name: &str,
    prefix_names: bool,
) -> Vec<Message> {
    history
        .iter()
        .filter(|m| !m.hidden)
        .map(|m| {
            let content = describe_marker(&m.content).unwrap_or_else(|| m.content.clone());
            if m.sender_id == character.id {
                return Message::assistant(content);
            }
            if m.role == MessageRole::System {
                return Message::user(format!("(system) {}", content));
            }
            if !prefix_names {
                return Message::user(content);
            }
            let speaker = if m.sender_id == USER_ID {
                user_name
            } else {
                names.get(&m.sender_id).map(String::as_str).unwrap_or("Someone")
            };
            Message::user(format!("{}: {}", speaker, content))
        })
        .collect()
}

/// Renders engine markers such as `[TRANSFER]3|5.20|coffee` for the model.
pub fn describe_marker(content: &str) -> Option<String> {
    if let Some(rest) = content.strip_prefix("[TRANSFER]") {
        let mut parts = rest.splitn(3, '|');
        let _id = parts.next()?;
        let amount = parts.next()?;
        let note = parts.next().unwrap_or_default();
        return Some(if note.trim().is_empty() {
            format!("(sent a transfer of {})", amount)
        } else {
            format!("(sent a transfer of {}: {})", amount, note)
        });
    }
    if content.starts_with("[REDPACKET:") && content.ends_with(']') {
        return Some("(sent a red packet to the group)".to_string());
    }
    None
}

/// Flattens messages into `Name: text` lines for memory extraction.
pub fn render_transcript(
    history: &[StoredMessage],
    names: &HashMap<String, String>,
    user_name: &str,
) -> String {
    history
        .iter()
        .filter(|m| !m.hidden && m.role != MessageRole::System)
        .map(|m| {
            let speaker = if m.sender_id == USER_ID {
                user_name
            } else {
                names.get(&m.sender_id).map(String::as_str).unwrap_or("Someone")
            };
            let content = describe_marker(&m.content).unwrap_or_else(|| m.content.clone());
            format!("{}: {}", speaker, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RoomKind;
    use crate::test_support::sample_character;

    fn message(id: i64, sender: &str, role: MessageRole, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            room_kind: RoomKind::Group,
            room_id: "g".to_string(),
            sender_id: sender.to_string(),
            role,
            content: content.to_string(),
            timestamp: id,
            hidden: false,
        }
    }

    #[test]
    fn group_history_prefixes_other_speakers() {
        let mika = sample_character("mika", "Mika");
        let names = HashMap::from([("ren".to_string(), "Ren".to_string())]);
        let history = vec![
            message(1, USER_ID, MessageRole::User, "hi all"),
            message(2, "ren", MessageRole::Character, "yo"),
            message(3, "mika", MessageRole::Character, "hello!"),
            message(4, "ren", MessageRole::Character, "[TRANSFER]9|5.20|lunch"),
        ];

        let mapped = history_messages(&history, &mika, &names, "Sam", true);
        assert_eq!(mapped[0], Message::user("Sam: hi all"));
        assert_eq!(mapped[1], Message::user("Ren: yo"));
        assert_eq!(mapped[2], Message::assistant("hello!"));
        assert_eq!(mapped[3], Message::user("Ren: (sent a transfer of 5.20: lunch)"));
    }

    #[test]
    fn system_prompt_mentions_state_and_jealousy() {
        let mut mika = sample_character("mika", "Mika");
        mika.affinity = 72;
        mika.pressure_level = 2;
        let profile = UserProfile::default();
        let prompt = build_system_prompt(&PromptContext {
            character: &mika,
            profile: &profile,
            memories: &[],
            mode: PromptMode::Group {
                room_name: "Friends".to_string(),
                member_names: vec!["Ren".to_string()],
                mentioned: false,
                jealous: true,
                proactive: false,
            },
            now: Local::now(),
        });

        assert!(prompt.contains("72/100"));
        assert!(prompt.contains("pressure 2"));
        assert!(prompt.contains("jealous"));
        assert!(prompt.contains("[TIMER:minutes]"));
        assert!(prompt.contains("(nothing relevant)"));
    }
}
