use regex::Regex;

/// Screen heuristics for one agent's terminal UI
#[derive(Debug, Clone)]
pub struct ScreenPatterns {
    /// UI framing ignored for fingerprints and teasers
    pub chrome: Vec<Regex>,
    /// "Awaiting user decision" markers matched anywhere in the capture
    pub waiting: Vec<Regex>,
    /// Option menus, matched against the last non-blank content line only
    pub menu: Vec<Regex>,
}

impl ScreenPatterns {
    pub fn is_chrome(&self, plain: &str) -> bool {
        plain.trim().is_empty() || self.chrome.iter().any(|re| re.is_match(plain))
    }

    pub fn is_waiting(&self, plain: &str) -> bool {
        self.waiting.iter().any(|re| re.is_match(plain))
    }

    pub fn is_menu(&self, plain: &str) -> bool {
        self.menu.iter().any(|re| re.is_match(plain))
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
}

const COMMON_CHROME: &[&str] = &[
    // separator rules
    r"^\s*[─━═—\-_=]{3,}\s*$",
    // prompt boxes
    r"^\s*[╭╰┌└].*[╮╯┐┘]\s*$",
    r"^\s*[│┃|]\s*(>|❯)?\s*[│┃|]\s*$",
    r"^\s*(>|❯)\s*$",
];

const COMMON_WAITING: &[&str] = &[
    r"(?i)\(y/n\)",
    r"(?i)\[y/n\]",
    r"(?i)\(yes/no\)",
    r"(?i)press enter",
    r"(?i)do you want to (proceed|continue|make this edit|create|run)",
];

const COMMON_MENU: &[&str] = &[
    r"^\s*(❯|>|›|●|▶)?\s*\d+[.)]\s+\S",
];

fn join<'a>(base: &[&'a str], extra: &[&'a str]) -> Vec<Regex> {
    let mut all: Vec<&str> = base.to_vec();
    all.extend_from_slice(extra);
    compile(&all)
}

fn build(chrome: &[&str], waiting: &[&str], menu: &[&str]) -> ScreenPatterns {
    ScreenPatterns {
        chrome: join(COMMON_CHROME, chrome),
        waiting: join(COMMON_WAITING, waiting),
        menu: join(COMMON_MENU, menu),
    }
}

pub fn claude() -> ScreenPatterns {
    build(
        &[
            r"\? for shortcuts",
            r"(?i)auto-accept edits",
            r"(?i)bypass permissions",
            r"(?i)plan mode on",
            r"^\s*[│┃]\s*>\s.*[│┃]\s*$",
            r"(?i)context left until auto-compact",
        ],
        &[r"(?i)would you like to", r"(?i)esc to cancel"],
        &[],
    )
}

pub fn gemini() -> ScreenPatterns {
    build(
        &[
            r"(?i)type your message",
            r"(?i)\bcontext left\)",
            r"(?i)^\s*using:? \d+ .*files?",
            r"(?i)no sandbox",
        ],
        &[r"(?i)allow execution", r"(?i)apply this change\?", r"(?i)waiting for user confirmation"],
        &[],
    )
}

pub fn aider() -> ScreenPatterns {
    build(
        &[r"^\s*(architect|ask|code)?>\s*$", r"(?i)^\s*tokens: .* sent"],
        &[r"\(Y\)es/\(N\)o", r"(?i)\[yes\]:\s*$"],
        &[],
    )
}

pub fn codex() -> ScreenPatterns {
    build(
        &[r"(?i)⏎ send", r"(?i)ctrl\+j newline", r"(?i)\d+% context left"],
        &[r"(?i)allow command\?", r"(?i)approve this", r"(?i)would you like to run"],
        &[r"^\s*▌?\s*(›|>)\s*(Yes|No|Always)"],
    )
}

pub fn amazon_q() -> ScreenPatterns {
    build(
        &[r"^\s*!?>\s*$"],
        &[r"(?i)\[y/n/t\]", r"(?i)allow this action\?"],
        &[],
    )
}

pub fn opencode() -> ScreenPatterns {
    build(
        &[r"(?i)ctrl\+\w+ \w+\s+ctrl\+", r"(?i)^\s*enter send"],
        &[r"(?i)permission required", r"(?i)allow once"],
        &[],
    )
}

pub fn terminal() -> ScreenPatterns {
    build(&[], &[r"(?i)password( for [^:]+)?:\s*$", r"\(END\)\s*$"], &[])
}
