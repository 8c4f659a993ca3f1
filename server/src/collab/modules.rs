//! Bot module contract and registry.
//!
//! Modules register command patterns (a command name, an argument regex and
//! the types of the captured arguments). The registry decides whether a chat
//! post is a command, and runs module entry points under a per-module lock
//! acquired with a bounded wait. A module that stays busy past the wait is
//! skipped, never waited on indefinitely.

use std::time::Duration;

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::message::Message;
use crate::engine::user::UserSnapshot;

/// Type of a captured command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Word,
    Integer,
    Number,
    /// A user id, optionally written with a leading `@`.
    Uid,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Word(String),
    Integer(i64),
    Number(f64),
    Uid(u64),
    Text(String),
}

impl ArgKind {
    fn parse(&self, raw: &str) -> Option<ArgValue> {
        match self {
            ArgKind::Word => Some(ArgValue::Word(raw.to_string())),
            ArgKind::Integer => raw.parse().ok().map(ArgValue::Integer),
            ArgKind::Number => raw.parse().ok().map(ArgValue::Number),
            ArgKind::Uid => raw.trim_start_matches('@').parse().ok().map(ArgValue::Uid),
            ArgKind::Text => Some(ArgValue::Text(raw.to_string())),
        }
    }
}

/// One command a module understands, e.g. `/roll 2d6`.
#[derive(Debug, Clone)]
pub struct CommandPattern {
    pub name: String,
    pub usage: String,
    pattern: Regex,
    args: Vec<ArgKind>,
}

impl CommandPattern {
    /// `pattern` is matched against everything after the command name and
    /// must have one capture group per entry in `args`.
    pub fn new(name: &str, pattern: &str, args: Vec<ArgKind>, usage: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.to_lowercase(),
            usage: usage.to_string(),
            pattern: Regex::new(&format!("^(?:{pattern})$"))?,
            args,
        })
    }

    fn parse_args(&self, rest: &str) -> Option<Vec<ArgValue>> {
        let caps = self.pattern.captures(rest)?;
        self.args
            .iter()
            .enumerate()
            .map(|(i, kind)| caps.get(i + 1).and_then(|m| kind.parse(m.as_str())))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub module: String,
    pub name: String,
    pub args: Vec<ArgValue>,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandParse {
    NotCommand,
    /// Recognized command name whose arguments didn't match.
    Malformed { command: String, usage: String },
    Parsed(ParsedCommand),
}

/// Payload returned by a module entry point.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleReply {
    pub text: String,
    /// Post into the tag the command came from; otherwise only the caller sees it.
    pub broadcast: bool,
}

impl ModuleReply {
    pub fn private(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            broadcast: false,
        }
    }

    pub fn public(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            broadcast: true,
        }
    }
}

/// A pluggable chat module.
pub trait ChatModule: Send {
    fn name(&self) -> &str;

    fn commands(&self) -> Vec<CommandPattern>;

    fn process_command(&mut self, command: &ParsedCommand, caller: &UserSnapshot) -> Vec<ModuleReply>;

    fn on_user_join(&mut self, _user: &UserSnapshot) -> Vec<ModuleReply> {
        Vec::new()
    }

    fn process_message(&mut self, _message: &Message) -> Vec<ModuleReply> {
        Vec::new()
    }
}

/// Replies gathered from modules plus the names of modules that were busy.
#[derive(Debug, Default)]
pub struct ModuleOutcome {
    pub replies: Vec<(String, ModuleReply)>,
    pub busy: Vec<String>,
}

struct ModuleSlot {
    name: String,
    patterns: Vec<CommandPattern>,
    module: Mutex<Box<dyn ChatModule>>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    slots: Vec<ModuleSlot>,
    wait: Duration,
}

impl ModuleRegistry {
    pub fn new(wait: Duration) -> Self {
        Self {
            slots: Vec::new(),
            wait,
        }
    }

    pub fn register(&mut self, module: Box<dyn ChatModule>) {
        let name = module.name().to_string();
        let patterns = module.commands();
        debug!(module = %name, commands = patterns.len(), "registered chat module");
        self.slots.push(ModuleSlot {
            name,
            patterns,
            module: Mutex::new(module),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Classify a chat post. Slash-prefixed text naming no registered
    /// command is plain chat.
    pub fn parse(&self, text: &str) -> CommandParse {
        let Some(body) = text.trim().strip_prefix('/') else {
            return CommandParse::NotCommand;
        };
        let (name, rest) = match body.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (body, ""),
        };
        let name = name.to_lowercase();

        for slot in &self.slots {
            if let Some(pattern) = slot.patterns.iter().find(|p| p.name == name) {
                return match pattern.parse_args(rest) {
                    Some(args) => CommandParse::Parsed(ParsedCommand {
                        module: slot.name.clone(),
                        name: name.clone(),
                        args,
                        raw: text.to_string(),
                    }),
                    None => CommandParse::Malformed {
                        command: name.clone(),
                        usage: pattern.usage.clone(),
                    },
                };
            }
        }
        CommandParse::NotCommand
    }

    /// Route a parsed command to its owning module. `Err` carries the
    /// module name when its lock couldn't be taken in time.
    pub async fn run_command(
        &self,
        command: &ParsedCommand,
        caller: &UserSnapshot,
    ) -> Result<Vec<ModuleReply>, String> {
        let Some(slot) = self.slots.iter().find(|s| s.name == command.module) else {
            return Ok(Vec::new());
        };
        match tokio::time::timeout(self.wait, slot.module.lock()).await {
            Ok(mut module) => Ok(module.process_command(command, caller)),
            Err(_) => {
                warn!(module = %slot.name, command = %command.name, "module busy, skipping command");
                Err(slot.name.clone())
            }
        }
    }

    pub async fn on_user_join(&self, user: &UserSnapshot) -> ModuleOutcome {
        self.for_each(|m| m.on_user_join(user)).await
    }

    pub async fn process_message(&self, message: &Message) -> ModuleOutcome {
        self.for_each(|m| m.process_message(message)).await
    }

    async fn for_each<F>(&self, mut f: F) -> ModuleOutcome
    where
        F: FnMut(&mut dyn ChatModule) -> Vec<ModuleReply>,
    {
        let mut outcome = ModuleOutcome::default();
        for slot in &self.slots {
            match tokio::time::timeout(self.wait, slot.module.lock()).await {
                Ok(mut module) => {
                    outcome
                        .replies
                        .extend(f(module.as_mut()).into_iter().map(|r| (slot.name.clone(), r)));
                }
                Err(_) => {
                    warn!(module = %slot.name, "module busy, skipping");
                    outcome.busy.push(slot.name.clone());
                }
            }
        }
        outcome
    }

    #[cfg(test)]
    async fn hold(&self, name: &str) -> Option<tokio::sync::MutexGuard<'_, Box<dyn ChatModule>>> {
        let slot = self.slots.iter().find(|s| s.name == name)?;
        Some(slot.module.lock().await)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `/roll <count> <sides>` and `/say <text>`; greets joiners.
    pub(crate) struct DiceModule;

    impl ChatModule for DiceModule {
        fn name(&self) -> &str {
            "dice"
        }

        fn commands(&self) -> Vec<CommandPattern> {
            vec![
                CommandPattern::new(
                    "roll",
                    r"(\d+)d(\d+)",
                    vec![ArgKind::Integer, ArgKind::Integer],
                    "/roll <count>d<sides>",
                )
                .unwrap(),
                CommandPattern::new("say", r"(.+)", vec![ArgKind::Text], "/say <text>").unwrap(),
            ]
        }

        fn process_command(&mut self, command: &ParsedCommand, caller: &UserSnapshot) -> Vec<ModuleReply> {
            match (command.name.as_str(), command.args.as_slice()) {
                ("roll", [ArgValue::Integer(count), ArgValue::Integer(sides)]) => {
                    vec![ModuleReply::public(format!(
                        "{} rolled {} (max)",
                        caller.username,
                        count * sides
                    ))]
                }
                ("say", [ArgValue::Text(text)]) => vec![ModuleReply::private(text.clone())],
                _ => Vec::new(),
            }
        }

        fn on_user_join(&mut self, user: &UserSnapshot) -> Vec<ModuleReply> {
            vec![ModuleReply::private(format!("dice says hi, {}", user.username))]
        }
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new(Duration::from_millis(50));
        registry.register(Box::new(DiceModule));
        registry
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        let r = registry();
        assert_eq!(r.parse("hello there"), CommandParse::NotCommand);
        assert_eq!(r.parse("/unknown thing"), CommandParse::NotCommand);
    }

    #[test]
    fn test_parse_typed_arguments() {
        let r = registry();
        match r.parse("/ROLL 3d6") {
            CommandParse::Parsed(cmd) => {
                assert_eq!(cmd.module, "dice");
                assert_eq!(cmd.name, "roll");
                assert_eq!(cmd.args, vec![ArgValue::Integer(3), ArgValue::Integer(6)]);
            }
            other => panic!("expected parsed command, got {other:?}"),
        }
    }

    #[test]
    fn test_recognized_but_malformed() {
        let r = registry();
        assert_eq!(
            r.parse("/roll lots"),
            CommandParse::Malformed {
                command: "roll".into(),
                usage: "/roll <count>d<sides>".into()
            }
        );
        // Pattern matches but the integer overflows i64
        assert!(matches!(
            r.parse("/roll 99999999999999999999d6"),
            CommandParse::Malformed { .. }
        ));
    }

    #[test]
    fn test_uid_argument_accepts_at_prefix() {
        assert_eq!(ArgKind::Uid.parse("@42"), Some(ArgValue::Uid(42)));
        assert_eq!(ArgKind::Uid.parse("bob"), None);
    }

    #[tokio::test]
    async fn test_run_command_returns_replies() {
        let r = registry();
        let CommandParse::Parsed(cmd) = r.parse("/roll 2d6") else {
            panic!("expected parsed command");
        };
        let replies = r.run_command(&cmd, &UserSnapshot::system("alice")).await.unwrap();
        assert_eq!(replies, vec![ModuleReply::public("alice rolled 12 (max)")]);
    }

    #[tokio::test]
    async fn test_busy_module_is_skipped() {
        let r = registry();
        let CommandParse::Parsed(cmd) = r.parse("/say hi") else {
            panic!("expected parsed command");
        };
        let _guard = r.hold("dice").await.unwrap();
        let result = r.run_command(&cmd, &UserSnapshot::system("alice")).await;
        assert_eq!(result, Err("dice".to_string()));

        let outcome = r.on_user_join(&UserSnapshot::system("alice")).await;
        assert!(outcome.replies.is_empty());
        assert_eq!(outcome.busy, vec!["dice".to_string()]);
    }

    #[tokio::test]
    async fn test_on_user_join_aggregates() {
        let r = registry();
        let outcome = r.on_user_join(&UserSnapshot::system("bob")).await;
        assert_eq!(outcome.replies.len(), 1);
        assert_eq!(outcome.replies[0].0, "dice");
        assert!(outcome.busy.is_empty());
    }
}
