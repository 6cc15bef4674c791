//! Command policy for the terminal tool.
//!
//! Decides which command heads may run, splits shell command lines into
//! segments, and detects the features that require explicit permission:
//! writing redirections, command substitution, `rm`/`chmod`,
//! `git reset --hard`, and options of allowed heads (`find -exec`,
//! `sed -i`, awk `system()`) that run commands or write files.

use std::fmt;

/// Command heads the terminal tool may run.
pub const ALLOWED_COMMANDS: &[&str] = &[
    // listing / inspection
    "ls", "dir", "tree", "cat", "head", "tail", "less", "more", "file", "stat",
    // search
    "find", "grep", "egrep", "fgrep", "rg",
    // text processing
    "wc", "sort", "uniq", "cut", "awk", "sed",
    // benign
    "echo", "printf", "pwd", "which", "whereis", "du", "df", "mkdir",
    // special-cased
    "git", "cd",
];

/// Heads that are refused unless the caller passes `allow_dangerous`.
pub const DANGEROUS_COMMANDS: &[&str] = &["rm", "chmod"];

/// `git` subcommands that never need permission.
pub const READONLY_GIT_SUBCOMMANDS: &[&str] = &["status", "diff"];

/// Commands whose arguments are not file paths.
pub const NON_PATH_COMMANDS: &[&str] = &["echo", "printf", "pwd", "which", "whereis"];

/// `find` primaries that execute programs, delete, or write files.
pub const FIND_SIDE_EFFECTS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

pub fn is_allowed(head: &str) -> bool {
    ALLOWED_COMMANDS.contains(&head)
}

pub fn is_dangerous(head: &str) -> bool {
    DANGEROUS_COMMANDS.contains(&head)
}

/// Why a command line needs `allow_dangerous`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DangerousFeature {
    /// Output redirection to anything but `/dev/null`.
    Redirection(String),
    CommandSubstitution,
    DangerousCommand(String),
    GitResetHard,
    /// An allowed head used in a way that runs commands or writes files.
    SideEffect(String),
}

impl fmt::Display for DangerousFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DangerousFeature::Redirection(target) => write!(f, "redirection to '{target}'"),
            DangerousFeature::CommandSubstitution => f.write_str("command substitution"),
            DangerousFeature::DangerousCommand(cmd) => write!(f, "high-risk command '{cmd}'"),
            DangerousFeature::GitResetHard => f.write_str("git reset --hard"),
            DangerousFeature::SideEffect(what) => write!(f, "'{what}' runs commands or writes files"),
        }
    }
}

/// A command the policy refuses outright.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("command not allowed: {0}")]
    DisallowedCommand(String),

    #[error("git subcommand not allowed: {0}")]
    DisallowedGitSubcommand(String),
}

/// Tokenize one command shell-style; falls back to whitespace splitting
/// when quotes are unbalanced.
pub fn words(segment: &str) -> Vec<String> {
    shell_words::split(segment)
        .unwrap_or_else(|_| segment.split_whitespace().map(str::to_string).collect())
}

/// Split a command line on `|`, `||`, `&&`, `;`, `&` and newlines outside
/// quotes. `&` that belongs to a redirection (`2>&1`, `&>`) is kept.
pub fn split_segments(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        if let Some(q) = quote {
            current.push(ch);
            if ch == '\\' && q == '"' {
                if let Some(n) = next {
                    current.push(n);
                    i += 1;
                }
            } else if ch == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match ch {
            '\\' => {
                current.push(ch);
                if let Some(n) = next {
                    current.push(n);
                    i += 1;
                }
            }
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            '|' | ';' | '\n' => {
                segments.push(std::mem::take(&mut current));
                if ch == '|' && next == Some('|') {
                    i += 1;
                }
            }
            '&' => {
                let prev = if i > 0 { Some(chars[i - 1]) } else { None };
                if next == Some('&') {
                    segments.push(std::mem::take(&mut current));
                    i += 1;
                } else if prev == Some('>') || prev == Some('<') || next == Some('>') {
                    current.push(ch);
                } else {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
        i += 1;
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Every feature of `command` that requires `allow_dangerous`.
pub fn dangerous_features(command: &str) -> Vec<DangerousFeature> {
    let mut found = Vec::new();

    for target in redirection_targets(command) {
        if target != "/dev/null" {
            found.push(DangerousFeature::Redirection(target));
        }
    }
    if has_command_substitution(command) {
        found.push(DangerousFeature::CommandSubstitution);
    }

    for segment in split_segments(command) {
        for feature in argv_features(&words(&segment)) {
            push_unique(&mut found, feature);
        }
    }

    found
}

/// Features of one tokenized command that require `allow_dangerous`:
/// `rm`/`chmod` anywhere in it, `git reset --hard`, and side-effecting
/// `find`, `awk` and `sed` usage.
pub fn argv_features(argv: &[String]) -> Vec<DangerousFeature> {
    let mut found = Vec::new();
    for word in argv {
        let base = basename(word);
        if is_dangerous(base) {
            push_unique(&mut found, DangerousFeature::DangerousCommand(base.to_string()));
        }
    }
    if is_git_reset_hard(argv) {
        push_unique(&mut found, DangerousFeature::GitResetHard);
    }

    let Some(head) = argv.first() else {
        return found;
    };
    let args = &argv[1..];
    let side_effects = match basename(head) {
        "find" => find_side_effects(args),
        "awk" => awk_side_effects(args),
        "sed" => sed_side_effects(args),
        _ => Vec::new(),
    };
    for what in side_effects {
        push_unique(&mut found, DangerousFeature::SideEffect(what));
    }
    found
}

fn push_unique<T: PartialEq>(found: &mut Vec<T>, item: T) {
    if !found.contains(&item) {
        found.push(item);
    }
}

fn basename(word: &str) -> &str {
    word.rsplit('/').next().unwrap_or(word)
}

fn find_side_effects(args: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for arg in args {
        if FIND_SIDE_EFFECTS.contains(&arg.as_str()) {
            push_unique(&mut found, format!("find {arg}"));
        }
    }
    found
}

/// The program text is the first operand after `-F`/`-v` options. A program
/// read with `-f` cannot be inspected and is flagged as is.
fn awk_side_effects(args: &[String]) -> Vec<String> {
    let mut iter = args.iter();
    let mut program = None;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-F" | "-v" => {
                iter.next();
            }
            "--" => {
                program = iter.next();
                break;
            }
            a if a.starts_with("-f") => return vec!["awk -f".into()],
            a if a.starts_with('-') && a.len() > 1 => {}
            _ => {
                program = Some(arg);
                break;
            }
        }
    }

    let Some(program) = program else {
        return Vec::new();
    };
    let mut found = Vec::new();
    if program.contains("system(") {
        found.push("awk system()".into());
    }
    if program.replace("||", "").contains('|') {
        found.push("awk pipe".into());
    }
    let compact: String = program.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains(">\"") || compact.contains(">>") {
        found.push("awk output redirection".into());
    }
    found
}

/// In-place editing, script files, and the `e`/`w`/`W` commands or `s///e`,
/// `s///w` flags in any script.
fn sed_side_effects(args: &[String]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut scripts: Vec<&str> = Vec::new();
    let mut operands: Vec<&str> = Vec::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let arg = arg.as_str();
        if let Some(long) = arg.strip_prefix("--") {
            let (name, value) = match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            };
            match name {
                "" => {
                    operands.extend(iter.by_ref().map(String::as_str));
                    break;
                }
                "in-place" => push_unique(&mut found, "sed -i".into()),
                "expression" => {
                    if let Some(script) = value.or_else(|| iter.next().map(String::as_str)) {
                        scripts.push(script);
                    }
                }
                "file" => push_unique(&mut found, "sed -f".into()),
                "line-length" if value.is_none() => {
                    iter.next();
                }
                _ => {}
            }
            continue;
        }
        let Some(cluster) = arg.strip_prefix('-').filter(|c| !c.is_empty()) else {
            operands.push(arg);
            continue;
        };
        for (i, flag) in cluster.char_indices() {
            let rest = &cluster[i + flag.len_utf8()..];
            match flag {
                'i' => {
                    push_unique(&mut found, "sed -i".into());
                    break;
                }
                'e' => {
                    if !rest.is_empty() {
                        scripts.push(rest);
                    } else if let Some(script) = iter.next() {
                        scripts.push(script);
                    }
                    break;
                }
                'f' => {
                    push_unique(&mut found, "sed -f".into());
                    if rest.is_empty() {
                        iter.next();
                    }
                    break;
                }
                'l' => {
                    if rest.is_empty() {
                        iter.next();
                    }
                    break;
                }
                _ => {}
            }
        }
    }

    if scripts.is_empty()
        && let Some(first) = operands.first().copied()
    {
        scripts.push(first);
    }
    if scripts.iter().any(|s| sed_script_runs_or_writes(s)) {
        found.push("sed e/w command".into());
    }
    found
}

/// Walks a sed script command by command, skipping addresses, regexes, and
/// the text of `a`/`i`/`c` and label commands.
fn sed_script_runs_or_writes(script: &str) -> bool {
    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        // Address
        while i < chars.len() {
            match chars[i] {
                c if c.is_ascii_digit() || c.is_whitespace() => i += 1,
                '$' | ',' | '!' | '~' | '+' | ';' | '{' | '}' => i += 1,
                '/' => i = skip_delimited(&chars, i + 1, '/'),
                '\\' if i + 1 < chars.len() => i = skip_delimited(&chars, i + 2, chars[i + 1]),
                _ => break,
            }
        }
        let Some(&cmd) = chars.get(i) else { break };
        i += 1;
        match cmd {
            'e' | 'w' | 'W' => return true,
            's' | 'y' => {
                let Some(&delim) = chars.get(i) else { break };
                i = skip_delimited(&chars, i + 1, delim);
                i = skip_delimited(&chars, i, delim);
                let start = i;
                while i < chars.len() && !matches!(chars[i], ';' | '\n' | '}') {
                    i += 1;
                }
                if cmd == 's' && chars[start..i].iter().any(|c| matches!(c, 'e' | 'w')) {
                    return true;
                }
            }
            'a' | 'i' | 'c' | 'r' | 'R' | 'b' | 't' | 'T' | ':' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            _ => {}
        }
    }
    false
}

/// Index just past the next unescaped `delim` at or after `from`.
fn skip_delimited(chars: &[char], from: usize, delim: char) -> usize {
    let mut i = from;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == delim => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Check the head of every segment. With `allow_dangerous`, `rm`/`chmod`
/// heads and `git reset` are also accepted.
pub fn check_segments(command: &str, allow_dangerous: bool) -> Result<(), PolicyViolation> {
    for segment in split_segments(command) {
        let argv = words(&segment);
        let Some(head) = argv.first() else { continue };
        if !is_allowed(head) && !(allow_dangerous && is_dangerous(head)) {
            return Err(PolicyViolation::DisallowedCommand(head.clone()));
        }
        if head == "git" {
            check_git(&argv, allow_dangerous)?;
        }
    }
    Ok(())
}

/// `git` must be followed directly by a read-only subcommand (or `reset`
/// with permission). Options before the subcommand (`-C`, `-c`) and
/// `--output` are refused since they reach outside the workspace.
pub fn check_git(argv: &[String], allow_dangerous: bool) -> Result<(), PolicyViolation> {
    let sub = argv.get(1).map(String::as_str).unwrap_or("");
    let permitted = READONLY_GIT_SUBCOMMANDS.contains(&sub) || (allow_dangerous && sub == "reset");
    if !permitted {
        return Err(PolicyViolation::DisallowedGitSubcommand(sub.to_string()));
    }
    if let Some(flag) = argv.iter().skip(2).find(|a| a.starts_with("--output")) {
        return Err(PolicyViolation::DisallowedGitSubcommand(format!("{sub} {flag}")));
    }
    Ok(())
}

fn is_git_reset_hard(argv: &[String]) -> bool {
    match argv.iter().position(|w| w == "git") {
        Some(pos) => {
            let rest = &argv[pos + 1..];
            rest.iter().any(|w| w == "reset") && rest.iter().any(|w| w == "--hard")
        }
        None => false,
    }
}

/// Targets of every unquoted `>` / `>>`, skipping fd duplications (`2>&1`).
fn redirection_targets(command: &str) -> Vec<String> {
    let chars: Vec<char> = command.chars().collect();
    let mut targets = Vec::new();
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if let Some(q) = quote {
            if ch == '\\' && q == '"' {
                i += 1;
            } else if ch == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match ch {
            '\\' => i += 1,
            '\'' | '"' => quote = Some(ch),
            '>' => {
                let mut j = i + 1;
                while matches!(chars.get(j), Some('>') | Some('|')) {
                    j += 1;
                }
                if chars.get(j) == Some(&'&') {
                    i = j + 1;
                    continue;
                }
                while matches!(chars.get(j), Some(c) if c.is_whitespace()) {
                    j += 1;
                }
                let start = j;
                while let Some(c) = chars.get(j) {
                    if c.is_whitespace() || matches!(c, ';' | '|' | '&' | '<' | '>' | '(' | ')') {
                        break;
                    }
                    j += 1;
                }
                let target: String = chars[start..j].iter().collect();
                targets.push(target.trim_matches(|c| c == '"' || c == '\'').to_string());
                i = j;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    targets
}

/// `$(`, backticks, or process substitution outside single quotes.
/// Double quotes do not stop substitution, so they are not honored here.
fn has_command_substitution(command: &str) -> bool {
    let chars: Vec<char> = command.chars().collect();
    let mut in_single = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        if in_single {
            if ch == '\'' {
                in_single = false;
            }
        } else {
            match ch {
                '\\' => i += 1,
                '\'' => in_single = true,
                '`' => return true,
                '$' | '<' | '>' if next == Some('(') => return true,
                _ => {}
            }
        }
        i += 1;
    }
    false
}
