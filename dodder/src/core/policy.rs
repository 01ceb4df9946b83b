//! Conservative deny-list for commands proposed by the backend.
//!
//! The predicate errs toward refusal: a command matching any rule is never
//! executed, even when the backend's stated intent looks harmless. Rules cover
//! POSIX shells, `cmd.exe`, and PowerShell spellings.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// A refused command: which rule matched and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    pub rule: String,
    pub reason: String,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.rule)
    }
}

struct PatternRule {
    name: &'static str,
    reason: &'static str,
    pattern: &'static str,
}

const PATTERN_RULES: &[PatternRule] = &[
    PatternRule {
        name: "raw-device-write",
        reason: "writes directly to a block device",
        pattern: r"(?i)\bof=\s*(/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk|mapper|md|loop)|\\\\\.\\physicaldrive)",
    },
    PatternRule {
        name: "raw-device-write",
        reason: "redirects output onto a block device",
        pattern: r"(?i)>\s*/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk|rdisk|mapper|md)",
    },
    PatternRule {
        name: "raw-device-write",
        reason: "overwrites a block device",
        pattern: r"(?i)\b(shred|blkdiscard)\b[^;&|]*/dev/",
    },
    PatternRule {
        name: "fork-bomb",
        reason: "spawns processes without bound",
        pattern: r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    },
    PatternRule {
        name: "remote-script",
        reason: "pipes a downloaded script straight into a shell",
        pattern: r"(?i)\b(curl|wget|iwr|invoke-webrequest)\b[^;&]*\|\s*(sudo\s+)?(sh|bash|zsh|dash|ksh|fish|iex|invoke-expression|powershell|pwsh)\b",
    },
    PatternRule {
        name: "recursive-delete-root",
        reason: "disables the root-deletion safeguard",
        pattern: r"--no-preserve-root",
    },
];

/// Quoted script handed to another interpreter: `bash -c '...'`,
/// `pwsh -Command "..."`, `cmd /c "..."`, `eval "..."`.
const INLINE_SCRIPT_PATTERN: &str = r#"(?i)(?:\b(?:sh|bash|zsh|dash|ksh|fish)(?:\.exe)?\s+(?:-[a-z]*\s+)*-[a-z]*c[a-z]*|\b(?:pwsh|powershell)(?:\.exe)?\s+(?:-\S+\s+)*?-c(?:ommand)?|\bcmd(?:\.exe)?\s+/[ck]|\beval)\s+(?:"([^"]*)"|'([^']*)')"#;

/// Inline scripts nested deeper than this are refused unread.
const MAX_NESTING: usize = 4;

const DISK_FORMAT_PROGRAMS: &[&str] = &[
    "mke2fs",
    "mkswap",
    "wipefs",
    "fdisk",
    "sfdisk",
    "cfdisk",
    "gdisk",
    "sgdisk",
    "parted",
    "diskpart",
    "format-volume",
    "clear-disk",
    "initialize-disk",
];

const POWER_PROGRAMS: &[&str] = &[
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "stop-computer",
    "restart-computer",
];

const POSIX_SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "fish"];

/// `sudo`/`doas` options that consume the next token.
const SUDO_VALUE_OPTIONS: &[&str] = &[
    "-u", "-g", "-C", "-h", "-p", "-D", "-r", "-t", "-U", "-T", "--user", "--group",
    "--close-from", "--host", "--prompt", "--chdir", "--role", "--type", "--other-user",
    "--command-timeout",
];
const SUDO_CHDIR_OPTIONS: &[&str] = &["-D", "--chdir"];

const ENV_VALUE_OPTIONS: &[&str] = &["-u", "--unset", "-C", "--chdir", "-S", "--split-string"];
const ENV_CHDIR_OPTIONS: &[&str] = &["-C", "--chdir"];

const XARGS_VALUE_OPTIONS: &[&str] = &["-I", "-i", "-n", "-P", "-L", "-l", "-d", "-E", "-e", "-s", "-a"];
const TIMEOUT_VALUE_OPTIONS: &[&str] = &["-s", "--signal", "-k", "--kill-after"];
const NICE_VALUE_OPTIONS: &[&str] = &["-n", "--adjustment", "-c", "--class", "-p", "--pid"];
const TIME_VALUE_OPTIONS: &[&str] = &["-f", "--format", "-o", "--output"];

static COMPILED_RULES: LazyLock<Vec<(&'static PatternRule, Result<Regex, regex::Error>)>> =
    LazyLock::new(|| {
        PATTERN_RULES
            .iter()
            .map(|rule| (rule, Regex::new(rule.pattern)))
            .collect()
    });

static INLINE_SCRIPT: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(INLINE_SCRIPT_PATTERN));

/// Check a command against the deny-list.
///
/// `cwd` is the directory the command will start in. When it is known,
/// relative targets (`*`, `.`, `../..`) and `cd` steps inside the command are
/// resolved against it; otherwise only absolute targets and bare `..` chains
/// count as root-level.
///
/// Returns the first matching violation, or `Ok(())` when the command is allowed.
pub fn check_command(command: &str, cwd: Option<&Path>) -> Result<(), PolicyViolation> {
    let dir = cwd.map(|path| path.to_string_lossy().into_owned());
    check_nested(command, dir, 0)
}

fn check_nested(
    command: &str,
    mut dir: Option<String>,
    depth: usize,
) -> Result<(), PolicyViolation> {
    if depth > MAX_NESTING {
        return Err(violation(
            "nested-shell",
            "nests shell invocations too deeply to inspect",
        ));
    }

    for (rule, compiled) in COMPILED_RULES.iter() {
        let matched = match compiled {
            Ok(re) => re.is_match(command),
            // An uncompilable rule refuses every command.
            Err(_) => true,
        };
        if matched {
            return Err(violation(rule.name, rule.reason));
        }
    }

    for script in inline_scripts(command)? {
        check_nested(script, dir.clone(), depth + 1)?;
    }

    for segment in split_segments(command) {
        let tokens = tokenize(segment);
        let (tokens, chdir) = strip_wrappers(&tokens);
        if let Some(target) = chdir {
            dir = resolve_path(dir.as_deref(), target);
        }
        let Some((program, args)) = tokens.split_first() else {
            continue;
        };
        let program = program_name(program);

        if let Some(found) = check_program(&program, args) {
            return Err(found);
        }
        if is_change_directory(&program) {
            dir = next_directory(args, dir.as_deref());
            continue;
        }
        if let Some(found) = check_recursive_delete(&program, args, dir.as_deref()) {
            return Err(found);
        }
        if let Some(found) = check_recursive_permissions(&program, args, dir.as_deref()) {
            return Err(found);
        }
    }

    Ok(())
}

fn violation(rule: &str, reason: &str) -> PolicyViolation {
    PolicyViolation {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

fn inline_scripts(command: &str) -> Result<Vec<&str>, PolicyViolation> {
    let re = INLINE_SCRIPT
        .as_ref()
        .map_err(|_| violation("nested-shell", "inline scripts cannot be inspected"))?;
    Ok(re
        .captures_iter(command)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str())
        .collect())
}

/// Split a command line into simple commands: on `;`, `&`, `|`, newlines,
/// and subshell or command-substitution boundaries.
fn split_segments(command: &str) -> impl Iterator<Item = &str> {
    command
        .split([';', '&', '|', '\n', '(', ')', '`'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Whitespace tokens with surrounding quotes removed.
fn tokenize(segment: &str) -> Vec<String> {
    segment
        .split_whitespace()
        .map(|token| token.trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Skip prefixes that run the real program: privilege wrappers, `env`,
/// `timeout`, `xargs`, `eval`, and interpreters given an inline script
/// (`bash -c`, `pwsh -Command`, `cmd /c`). Also returns the last directory
/// a wrapper switches to (`sudo -D`, `env -C`).
fn strip_wrappers(tokens: &[String]) -> (&[String], Option<&str>) {
    let mut rest = tokens;
    let mut chdir = None;
    loop {
        while rest.first().is_some_and(|token| is_assignment(token)) {
            rest = &rest[1..];
        }
        let Some(first) = rest.first() else {
            break;
        };
        let name = program_name(first);
        let args = &rest[1..];
        let next = match name.as_str() {
            "sudo" | "doas" => {
                let (next, dir) = skip_options(args, SUDO_VALUE_OPTIONS, SUDO_CHDIR_OPTIONS);
                chdir = dir.or(chdir);
                next
            }
            "env" => {
                let (next, dir) = skip_options(args, ENV_VALUE_OPTIONS, ENV_CHDIR_OPTIONS);
                chdir = dir.or(chdir);
                next
            }
            "xargs" => skip_options(args, XARGS_VALUE_OPTIONS, &[]).0,
            "nice" | "ionice" => skip_options(args, NICE_VALUE_OPTIONS, &[]).0,
            "time" => skip_options(args, TIME_VALUE_OPTIONS, &[]).0,
            "timeout" => {
                let after = skip_options(args, TIMEOUT_VALUE_OPTIONS, &[]).0;
                // The duration comes before the program.
                after.get(1..).unwrap_or_default()
            }
            "nohup" | "exec" | "command" | "builtin" | "stdbuf" | "eval" => {
                skip_options(args, &[], &[]).0
            }
            "pwsh" | "powershell" => match args.iter().position(|arg| {
                arg.eq_ignore_ascii_case("-command") || arg.eq_ignore_ascii_case("-c")
            }) {
                Some(pos) => &args[pos + 1..],
                None => break,
            },
            "cmd" => match args
                .iter()
                .position(|arg| arg.eq_ignore_ascii_case("/c") || arg.eq_ignore_ascii_case("/k"))
            {
                Some(pos) => &args[pos + 1..],
                None => break,
            },
            shell if POSIX_SHELLS.contains(&shell) => match inline_script_start(args) {
                Some(pos) => &args[pos..],
                None => break,
            },
            _ => break,
        };
        rest = next;
    }
    (rest, chdir)
}

/// Skip leading options; those listed in `with_value` also consume the next
/// token. Returns what follows and the value of the last `chdir_options` seen.
fn skip_options<'t>(
    tokens: &'t [String],
    with_value: &[&str],
    chdir_options: &[&str],
) -> (&'t [String], Option<&'t str>) {
    let mut rest = tokens;
    let mut chdir = None;
    while let Some(flag) = rest.first() {
        if flag == "--" {
            rest = &rest[1..];
            break;
        }
        if !flag.starts_with('-') || flag.len() == 1 {
            break;
        }
        if let Some((name, value)) = flag.split_once('=') {
            if chdir_options.contains(&name) {
                chdir = Some(value);
            }
            rest = &rest[1..];
        } else if with_value.contains(&flag.as_str()) {
            if chdir_options.contains(&flag.as_str()) {
                chdir = rest.get(1).map(String::as_str);
            }
            rest = rest.get(2..).unwrap_or_default();
        } else {
            rest = &rest[1..];
        }
    }
    (rest, chdir)
}

/// Index of the first script token after a POSIX shell's `-c` flag
/// (`-c`, `-lc`, `-ec`), or `None` when the shell runs a file or reads stdin.
fn inline_script_start(args: &[String]) -> Option<usize> {
    for (pos, arg) in args.iter().enumerate() {
        if !arg.starts_with('-') || arg.starts_with("--") {
            return None;
        }
        if arg.contains('c') {
            return Some(pos + 1);
        }
    }
    None
}

/// `NAME=value` prefix assignment.
fn is_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn program_name(token: &str) -> String {
    let base = token.rsplit(['/', '\\']).next().unwrap_or(token);
    let base = base.to_ascii_lowercase();
    base.strip_suffix(".exe").map(str::to_string).unwrap_or(base)
}

/// Rules keyed on the program itself, whatever path it is invoked by.
fn check_program(program: &str, args: &[String]) -> Option<PolicyViolation> {
    if program == "mkfs" || program.starts_with("mkfs.") || DISK_FORMAT_PROGRAMS.contains(&program)
    {
        return Some(violation("disk-format", "formats or repartitions a disk"));
    }
    if matches!(program, "format" | "format.com") && args.first().is_some_and(|arg| is_drive(arg)) {
        return Some(violation("disk-format", "formats a Windows drive"));
    }
    let power_verb = match program {
        "init" | "telinit" => args.first().is_some_and(|arg| arg == "0" || arg == "6"),
        "systemctl" | "loginctl" => args
            .iter()
            .any(|arg| matches!(arg.as_str(), "poweroff" | "reboot" | "halt" | "kexec")),
        _ => POWER_PROGRAMS.contains(&program),
    };
    if power_verb {
        return Some(violation("system-power", "shuts down or restarts the machine"));
    }
    None
}

fn is_change_directory(program: &str) -> bool {
    matches!(
        program,
        "cd" | "chdir" | "pushd" | "set-location" | "sl" | "push-location"
    )
}

/// Directory after a `cd`-like step. `None` means it is no longer known.
fn next_directory(args: &[String], dir: Option<&str>) -> Option<String> {
    let target = args
        .iter()
        .map(String::as_str)
        .find(|arg| !arg.starts_with('-') || *arg == "-");
    match target {
        None => Some("~".to_string()),
        Some("-") => None,
        Some(target) => resolve_path(dir, target),
    }
}

fn check_recursive_delete(
    program: &str,
    args: &[String],
    dir: Option<&str>,
) -> Option<PolicyViolation> {
    // Windows builtins take `/x` switches, so their targets never start with `/`.
    let (recursive, targets): (bool, Vec<&str>) = match program {
        "rm" => (
            args.iter().any(|arg| {
                arg == "--recursive"
                    || (arg.starts_with('-') && !arg.starts_with("--") && arg.contains(['r', 'R']))
            }),
            args.iter()
                .filter(|arg| !arg.starts_with('-'))
                .map(String::as_str)
                .collect(),
        ),
        "rd" | "rmdir" | "del" | "erase" => (
            args.iter().any(|arg| arg.eq_ignore_ascii_case("/s")),
            args.iter()
                .filter(|arg| !arg.starts_with('/'))
                .map(String::as_str)
                .collect(),
        ),
        "remove-item" | "ri" => (
            args.iter()
                .any(|arg| arg.to_ascii_lowercase().starts_with("-r")),
            args.iter()
                .filter(|arg| !arg.starts_with('-'))
                .map(String::as_str)
                .collect(),
        ),
        "find" => (
            args.iter()
                .any(|arg| arg == "-delete" || program_name(arg) == "rm"),
            vec![
                args.first()
                    .map(String::as_str)
                    .filter(|arg| !arg.starts_with('-'))
                    .unwrap_or("."),
            ],
        ),
        _ => return None,
    };

    if recursive && targets.iter().any(|target| reaches_root_level(target, dir)) {
        return Some(violation(
            "recursive-delete-root",
            "recursively deletes a root-level path",
        ));
    }
    None
}

fn check_recursive_permissions(
    program: &str,
    args: &[String],
    dir: Option<&str>,
) -> Option<PolicyViolation> {
    if !matches!(program, "chmod" | "chown" | "chgrp") {
        return None;
    }
    let recursive = args
        .iter()
        .any(|arg| arg == "--recursive" || (arg.starts_with('-') && arg.contains('R')));
    // The first operand is the mode or owner.
    let mut operands = args.iter().filter(|arg| !arg.starts_with('-')).skip(1);
    if recursive && operands.any(|target| reaches_root_level(target, dir)) {
        return Some(violation(
            "recursive-permissions-root",
            "recursively changes ownership or permissions of a root-level path",
        ));
    }
    None
}

fn reaches_root_level(target: &str, dir: Option<&str>) -> bool {
    match resolve_path(dir, target) {
        Some(path) => is_root_level_path(&path),
        None => is_parent_chain(target),
    }
}

/// `..`, `../..`, `../../*`: climbs out of an unknown directory without naming anything.
fn is_parent_chain(target: &str) -> bool {
    let mut climbs = false;
    for part in target.split(['/', '\\']) {
        match part {
            ".." => climbs = true,
            "" | "." | "*" => {}
            _ => return false,
        }
    }
    climbs
}

/// Lexically join `target` onto `base`, folding `.` and `..`.
///
/// Returns `None` when `target` is relative and `base` is unknown or relative.
fn resolve_path(base: Option<&str>, target: &str) -> Option<String> {
    let (root, parts) = match split_root(target) {
        Some(split) => split,
        None => {
            let (root, mut parts) = split_root(base?)?;
            parts.extend(target.split(['/', '\\']).map(str::to_string));
            (root, parts)
        }
    };

    let mut folded: Vec<String> = Vec::new();
    for part in parts {
        match part.as_str() {
            "" | "." => {}
            ".." => {
                folded.pop();
            }
            _ => folded.push(part),
        }
    }

    Some(match root {
        PathRoot::Posix => format!("/{}", folded.join("/")),
        PathRoot::Home if folded.is_empty() => "~".to_string(),
        PathRoot::Home => format!("~/{}", folded.join("/")),
        PathRoot::Drive(letter) => format!("{letter}:\\{}", folded.join("\\")),
    })
}

enum PathRoot {
    Posix,
    Home,
    Drive(char),
}

/// Root of an absolute path and its remaining components.
fn split_root(path: &str) -> Option<(PathRoot, Vec<String>)> {
    let path = path.strip_prefix(r"\\?\").unwrap_or(path);
    let components =
        |rest: &str| -> Vec<String> { rest.split(['/', '\\']).map(str::to_string).collect() };

    for home in ["~", "$HOME", "${HOME}", "%USERPROFILE%", "$env:USERPROFILE"] {
        let rest = path
            .strip_prefix(home)
            .filter(|rest| rest.is_empty() || rest.starts_with(['/', '\\']));
        if let Some(rest) = rest {
            return Some((PathRoot::Home, components(rest)));
        }
    }
    if let Some(rest) = path.strip_prefix(['/', '\\']) {
        return Some((PathRoot::Posix, components(rest)));
    }
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => Some((
            PathRoot::Drive(letter.to_ascii_uppercase()),
            components(chars.as_str()),
        )),
        _ => None,
    }
}

/// `C:`, `C:\`, `D:/`.
fn is_drive(arg: &str) -> bool {
    let bytes = arg.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2..].iter().all(|b| matches!(b, b'\\' | b'/'))
}

/// Root, a direct child of root, the home directory, or a bare drive.
fn is_root_level_path(arg: &str) -> bool {
    let arg = arg.trim_end_matches('*');
    if matches!(
        arg,
        "~" | "~/" | "$HOME" | "$HOME/" | "${HOME}" | "${HOME}/" | "%USERPROFILE%"
    ) {
        return true;
    }

    if let Some(rest) = arg.strip_prefix('/') {
        let rest = rest.trim_end_matches('/');
        return !rest.contains('/') && rest != "." && rest != "..";
    }

    // Windows drive roots and their direct children: `C:`, `C:\`, `C:\Windows`.
    let bytes = arg.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = arg[2..].trim_start_matches(['\\', '/']).trim_end_matches(['\\', '/']);
        return !rest.contains(['\\', '/']);
    }

    false
}
