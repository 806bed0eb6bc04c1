//! Terminal resolver
//!
//! Walks up the process tree from a shell's parent to find the terminal
//! emulator (or remote session) and any multiplexer in between.

use std::collections::HashSet;

use Needle::{Anywhere, Word};

/// Maximum number of ancestors inspected
const MAX_DEPTH: usize = 10;

/// Reported when no known terminal is found
pub const UNKNOWN_TERMINAL: &str = "unknown";

/// How a needle is looked up in a lowercased process name
#[derive(Debug, Clone, Copy)]
enum Needle {
    /// Anywhere in the name
    Anywhere(&'static str),
    /// Only between non-alphanumeric characters, so `code` skips `codex`
    Word(&'static str),
}

/// Known terminal emulators as (needle, reported name). Longer needles first
/// so that e.g. `gnome-terminal` wins over `terminal`.
const TERMINALS: &[(Needle, &str)] = &[
    (Anywhere("gnome-terminal"), "gnome-terminal"),
    (Anywhere("windowsterminal"), "windows-terminal"),
    (Anywhere("wezterm"), "wezterm"),
    (Anywhere("alacritty"), "alacritty"),
    (Anywhere("ghostty"), "ghostty"),
    (Anywhere("iterm"), "iterm2"),
    (Anywhere("kitty"), "kitty"),
    (Anywhere("konsole"), "konsole"),
    (Anywhere("tilix"), "tilix"),
    (Anywhere("terminator"), "terminator"),
    (Anywhere("xfce4-terminal"), "xfce4-terminal"),
    (Word("rio"), "rio"),
    (Word("warp"), "warp"),
    (Word("hyper"), "hyper"),
    (Word("tabby"), "tabby"),
    (Word("cursor"), "cursor"),
    (Word("code"), "vscode"),
    (Word("zed"), "zed"),
    (Anywhere("jetbrains"), "jetbrains"),
    (Anywhere("xterm"), "xterm"),
    (Anywhere("urxvt"), "urxvt"),
    (Word("foot"), "foot"),
    (Word("terminal"), "terminal"),
];

/// Remote or container sessions; treated like a terminal match
const REMOTE_INDICATORS: &[(Needle, &str)] = &[
    (Anywhere("mosh-server"), "mosh"),
    (Word("sshd"), "ssh"),
    (Anywhere("containerd-shim"), "container"),
    (Anywhere("docker"), "docker"),
    (Anywhere("kubectl"), "kubectl"),
];

const MULTIPLEXERS: &[(Needle, &str)] = &[
    (Anywhere("tmux"), "tmux"),
    (Anywhere("zellij"), "zellij"),
    (Word("screen"), "screen"),
];

impl Needle {
    fn matches(self, lower: &str) -> bool {
        match self {
            Anywhere(needle) => lower.contains(needle),
            Word(needle) => lower.match_indices(needle).any(|(at, _)| {
                let before = lower[..at].chars().next_back();
                let after = lower[at + needle.len()..].chars().next();
                !before.is_some_and(char::is_alphanumeric)
                    && !after.is_some_and(char::is_alphanumeric)
            }),
        }
    }
}

/// Process lookups the resolver needs
pub trait ProcessInfoProvider {
    /// Executable name (or path) of `pid`
    fn process_name(&self, pid: u32) -> Option<String>;
    /// Parent of `pid`
    fn parent_pid(&self, pid: u32) -> Option<u32>;
}

/// Result of [`resolve_terminal`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTerminal {
    /// Terminal name, `unknown` when none was found
    pub terminal: String,
    /// Multiplexer name, empty when none was found
    pub multiplexer: String,
}

fn match_name(name: &str, table: &[(Needle, &'static str)]) -> Option<&'static str> {
    let lower = name.to_ascii_lowercase();
    table
        .iter()
        .find(|(needle, _)| needle.matches(&lower))
        .map(|(_, reported)| *reported)
}

/// Walk up from `ppid` looking for a terminal and a multiplexer.
///
/// Stops at the first terminal or remote match, at PID 1, on a cycle, or
/// after [`MAX_DEPTH`] levels. A multiplexer alone does not stop the walk.
pub fn resolve_terminal<P>(ppid: u32, provider: &P) -> ResolvedTerminal
where
    P: ProcessInfoProvider + ?Sized,
{
    let mut terminal: Option<&'static str> = None;
    let mut multiplexer: Option<&'static str> = None;
    let mut visited = HashSet::new();
    let mut pid = ppid;

    for _ in 0..MAX_DEPTH {
        if pid <= 1 || !visited.insert(pid) {
            break;
        }

        if let Some(name) = provider.process_name(pid) {
            if multiplexer.is_none() {
                multiplexer = match_name(&name, MULTIPLEXERS);
            }
            terminal = match_name(&name, TERMINALS)
                .or_else(|| match_name(&name, REMOTE_INDICATORS));
            if terminal.is_some() {
                break;
            }
        }

        match provider.parent_pid(pid) {
            Some(parent) => pid = parent,
            None => break,
        }
    }

    ResolvedTerminal {
        terminal: terminal.unwrap_or(UNKNOWN_TERMINAL).to_string(),
        multiplexer: multiplexer.unwrap_or_default().to_string(),
    }
}

/// Reads `/proc/<pid>/comm` and `/proc/<pid>/stat`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFsProvider;

impl ProcessInfoProvider for ProcFsProvider {
    fn process_name(&self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
        let comm = comm.trim();
        (!comm.is_empty()).then(|| comm.to_string())
    }

    fn parent_pid(&self, pid: u32) -> Option<u32> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_stat_ppid(&stat)
    }
}

/// The comm field may contain spaces and parentheses, so fields are counted
/// from the last `)`: state, then ppid.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

/// Asks `ps` for the command name and parent PID
#[derive(Debug, Default, Clone, Copy)]
pub struct PsProvider;

impl PsProvider {
    fn ps_field(pid: u32, field: &str) -> Option<String> {
        let output = std::process::Command::new("ps")
            .args(["-o", &format!("{}=", field), "-p", &pid.to_string()])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!value.is_empty()).then_some(value)
    }
}

impl ProcessInfoProvider for PsProvider {
    fn process_name(&self, pid: u32) -> Option<String> {
        Self::ps_field(pid, "comm")
    }

    fn parent_pid(&self, pid: u32) -> Option<u32> {
        Self::ps_field(pid, "ppid")?.parse().ok()
    }
}

/// Provider for the current platform
pub fn system_provider() -> Box<dyn ProcessInfoProvider> {
    if cfg!(target_os = "linux") {
        Box::new(ProcFsProvider)
    } else {
        Box::new(PsProvider)
    }
}

/// Resolve the terminal hosting the current process
pub fn resolve_current_terminal() -> ResolvedTerminal {
    let provider = system_provider();
    let ppid = provider.parent_pid(std::process::id()).unwrap_or(0);
    resolve_terminal(ppid, provider.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    /// pid -> (name, ppid)
    struct FakeProcesses(HashMap<u32, (&'static str, u32)>);

    impl FakeProcesses {
        fn new(entries: &[(u32, &'static str, u32)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(pid, name, ppid)| (*pid, (*name, *ppid)))
                    .collect(),
            )
        }
    }

    impl ProcessInfoProvider for FakeProcesses {
        fn process_name(&self, pid: u32) -> Option<String> {
            self.0.get(&pid).map(|(name, _)| name.to_string())
        }

        fn parent_pid(&self, pid: u32) -> Option<u32> {
            self.0.get(&pid).map(|(_, ppid)| *ppid)
        }
    }

    #[test]
    fn test_terminal_through_multiplexer() {
        let procs = FakeProcesses::new(&[
            (100, "zsh", 90),
            (90, "tmux: server", 80),
            (80, "zsh", 70),
            (70, "Alacritty", 1),
        ]);
        let resolved = resolve_terminal(100, &procs);
        assert_eq!(
            resolved,
            ResolvedTerminal {
                terminal: "alacritty".to_string(),
                multiplexer: "tmux".to_string(),
            }
        );
    }

    #[test]
    fn test_stops_at_first_terminal() {
        let procs = FakeProcesses::new(&[
            (50, "/Applications/iTerm.app/Contents/MacOS/iTerm2", 40),
            (40, "kitty", 1),
        ]);
        let resolved = resolve_terminal(50, &procs);
        assert_eq!(resolved.terminal, "iterm2");
        assert_eq!(resolved.multiplexer, "");
    }

    #[test]
    fn test_longer_needle_wins() {
        let procs = FakeProcesses::new(&[(10, "gnome-terminal-server", 1)]);
        assert_eq!(resolve_terminal(10, &procs).terminal, "gnome-terminal");
    }

    #[test]
    fn test_short_needles_match_whole_words() {
        let resolve = |name: &'static str| {
            resolve_terminal(10, &FakeProcesses::new(&[(10, name, 1)])).terminal
        };
        assert_eq!(resolve("codex"), UNKNOWN_TERMINAL);
        assert_eq!(resolve("/usr/local/bin/opencode"), UNKNOWN_TERMINAL);
        assert_eq!(resolve("prior-daemon"), UNKNOWN_TERMINAL);
        assert_eq!(resolve("zedd"), UNKNOWN_TERMINAL);

        assert_eq!(resolve("code"), "vscode");
        assert_eq!(resolve("Code Helper (Renderer)"), "vscode");
        assert_eq!(
            resolve("/Applications/Visual Studio Code.app/Contents/MacOS/Electron"),
            "vscode"
        );
        assert_eq!(resolve("rio"), "rio");
        assert_eq!(resolve("/usr/bin/zed"), "zed");
        assert_eq!(resolve("sshd: dev@pts/3"), "ssh");
    }

    #[test]
    fn test_remote_session() {
        let procs = FakeProcesses::new(&[(30, "bash", 20), (20, "sshd", 2)]);
        assert_eq!(resolve_terminal(30, &procs).terminal, "ssh");
    }

    #[test]
    fn test_unknown_when_nothing_matches() {
        let procs = FakeProcesses::new(&[(30, "bash", 20), (20, "init-helper", 1)]);
        let resolved = resolve_terminal(30, &procs);
        assert_eq!(resolved.terminal, UNKNOWN_TERMINAL);
        assert_eq!(resolved.multiplexer, "");
    }

    #[test]
    fn test_cycle_and_pid_one_guard() {
        let procs = FakeProcesses::new(&[(30, "bash", 31), (31, "fish", 30)]);
        assert_eq!(resolve_terminal(30, &procs).terminal, UNKNOWN_TERMINAL);

        assert_eq!(resolve_terminal(1, &procs).terminal, UNKNOWN_TERMINAL);
        assert_eq!(resolve_terminal(0, &procs).terminal, UNKNOWN_TERMINAL);
    }

    #[test]
    fn test_depth_limit() {
        // Chain of 12 shells with a terminal at the top
        let mut entries: Vec<(u32, &'static str, u32)> =
            (100..112).map(|pid| (pid, "bash", pid + 1)).collect();
        entries.push((112, "kitty", 1));
        let procs = FakeProcesses::new(&entries);
        assert_eq!(resolve_terminal(100, &procs).terminal, UNKNOWN_TERMINAL);
        assert_eq!(resolve_terminal(104, &procs).terminal, "kitty");
    }

    #[test]
    fn test_parse_stat_ppid() {
        let stat = "1234 (my (weird) proc) S 987 1234 1234 0 -1 4194560";
        assert_eq!(parse_stat_ppid(stat), Some(987));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_reads_self() {
        let provider = ProcFsProvider;
        let me = std::process::id();
        assert!(provider.process_name(me).is_some());
        assert_eq!(
            provider.parent_pid(me),
            Some(std::os::unix::process::parent_id())
        );
    }
}
