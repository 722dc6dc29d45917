#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose argument feeds `Intent::settings_update` under `key`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SettingSpec {
    pub command: &'static str,
    pub key: &'static str,
}

pub(crate) const SETTING_COMMANDS: &[SettingSpec] = &[
    SettingSpec {
        command: "lighting",
        key: "lighting_effect",
    },
    SettingSpec {
        command: "remove_existing",
        key: "remove_existing_jewelry",
    },
];

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "refine",
    action: "refine",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "save",
    action: "save",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "regenerate",
        action: "regenerate",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "prompt",
        action: "show_prompt",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const STUDIO_HELP_COMMANDS: &[&str] = &[
    "/refine",
    "/regenerate",
    "/lighting",
    "/remove_existing",
    "/save",
    "/status",
    "/prompt",
    "/help",
    "/quit",
];
