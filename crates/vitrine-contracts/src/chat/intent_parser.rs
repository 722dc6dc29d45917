use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SETTING_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub instruction: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            instruction: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    fn refine(raw: &str, instruction: &str) -> Self {
        let mut intent = Self::new("refine", raw);
        intent.instruction = Some(instruction.to_string());
        intent
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>()
            .join(" "),
        Err(_) => arg.trim().to_string(),
    }
}

/// Parses one studio input line. Plain text is a refinement instruction;
/// `/command args` lines map to the actions in the command registry.
pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    let Some(slash_tail) = raw_trimmed.strip_prefix('/') else {
        return Intent::refine(text, raw_trimmed);
    };
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return Intent::refine(text, raw_trimmed);
    }

    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    if find_action(&command, RAW_ARG_COMMANDS).is_some() {
        let mut intent = Intent::refine(text, arg);
        if arg.is_empty() {
            intent.instruction = None;
        }
        return intent;
    }

    if let Some(spec) = SETTING_COMMANDS.iter().find(|spec| spec.command == command) {
        let mut intent = Intent::new("set_setting", text);
        intent
            .settings_update
            .insert(spec.key.to_string(), Value::String(arg.to_string()));
        return intent;
    }

    if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
        let mut intent = Intent::new(action, text);
        intent.command_args.insert(
            "path".to_string(),
            Value::String(parse_single_path_arg(arg)),
        );
        return intent;
    }

    if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
        return Intent::new(action, text);
    }

    let mut intent = Intent::new("unknown", text);
    intent
        .command_args
        .insert("command".to_string(), Value::String(command));
    intent
        .command_args
        .insert("arg".to_string(), Value::String(arg.to_string()));
    intent
}
