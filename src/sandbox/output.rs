//! Command wrapping, exit-code recovery and output truncation.
//!
//! Every backend runs commands through the same wrapper so that the exit
//! code survives interleaved stdout/stderr: the wrapper echoes a sentinel
//! line carrying `$?`, which is parsed and stripped here before any
//! truncation happens.

use shell_words::quote;

/// Prefix of the line the wrapper appends after the command finishes.
pub(crate) const EXIT_SENTINEL: &str = "FIXLOOP_EXIT:";

/// Exit code reported when the sentinel line is missing.
pub(crate) const UNKNOWN_EXIT_CODE: i32 = -1;

/// Builds the `bash -c` script that runs `command` inside `workdir`.
///
/// stderr is folded into stdout for the whole script. When `pid_file` is
/// given, the shell records its pid there first so a timed-out command can
/// be killed from a second exec, and removes it once the command returns.
pub(crate) fn wrap_command(command: &str, workdir: &str, pid_file: Option<&str>) -> String {
    let mut script = String::from("exec 2>&1; ");
    if let Some(pid_file) = pid_file {
        script.push_str(&format!("echo $$ > {}; ", quote(pid_file)));
    }
    script.push_str(&format!("cd {} && ({command}); ", quote(workdir)));
    script.push_str("__fixloop_rc=$?; ");
    if let Some(pid_file) = pid_file {
        script.push_str(&format!("rm -f {}; ", quote(pid_file)));
    }
    script.push_str(&format!("echo \"{EXIT_SENTINEL}$__fixloop_rc\""));
    script
}

/// Script that kills the process tree whose root pid is stored in `pid_file`.
///
/// Walks `/proc/<pid>/task/*/children` so it works in images without
/// procps. Each process is stopped before its children are listed.
pub(crate) fn kill_tree_script(pid_file: &str) -> String {
    let pid_file = quote(pid_file);
    format!(
        "kill_tree() {{ kill -STOP \"$1\" 2>/dev/null; \
         for c in $(cat /proc/\"$1\"/task/*/children 2>/dev/null); do kill_tree \"$c\"; done; \
         kill -KILL \"$1\" 2>/dev/null; }}; \
         pid=$(cat {pid_file} 2>/dev/null); \
         if [ -n \"$pid\" ]; then kill_tree \"$pid\"; fi; \
         rm -f {pid_file}"
    )
}

/// Splits the sentinel line off raw wrapper output.
///
/// Returns the command's own output and the parsed exit code, or the
/// untouched output and `None` when the final line carries no sentinel
/// (killed on timeout, or cut short).
pub(crate) fn split_exit_sentinel(raw: &str) -> (String, Option<i32>) {
    let trimmed = raw.trim_end_matches('\n');
    let last_line_start = trimmed.rfind('\n').map_or(0, |i| i + 1);
    let last_line = &trimmed[last_line_start..];

    // Output without a trailing newline shares its last line with the sentinel.
    let Some(offset) = last_line.rfind(EXIT_SENTINEL) else {
        return (raw.to_string(), None);
    };
    let code = last_line[offset + EXIT_SENTINEL.len()..].trim().parse::<i32>().ok();
    let body = &trimmed[..last_line_start + offset];
    let body = body.strip_suffix('\n').unwrap_or(body);
    (body.to_string(), code)
}

/// Truncates `text` to at most `max_bytes` bytes of original content.
///
/// Keeps the first and last `max_bytes / 2` bytes (adjusted inwards to
/// UTF-8 boundaries) and inserts a marker stating the original length.
pub(crate) fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let half = max_bytes / 2;
    let head_end = floor_char_boundary(text, half);
    let tail_start = ceil_char_boundary(text, text.len() - half);
    format!(
        "{}\n\n... [output truncated: {} bytes total] ...\n\n{}",
        &text[..head_end],
        text.len(),
        &text[tail_start..]
    )
}

/// Truncates `text` to at most `max_chars` characters of original content.
///
/// Same shape as [`truncate_bytes`], counted in characters. Used when
/// re-injecting command output into the conversation.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head_end = text.char_indices().nth(half).map_or(text.len(), |(i, _)| i);
    let tail_start = text
        .char_indices()
        .nth(total - half)
        .map_or(text.len(), |(i, _)| i);
    format!(
        "{}\n\n... [output truncated: {total} chars total] ...\n\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_command_without_pid_file() {
        let script = wrap_command("ls -la", "/testbed", None);
        assert_eq!(
            script,
            "exec 2>&1; cd /testbed && (ls -la); __fixloop_rc=$?; echo \"FIXLOOP_EXIT:$__fixloop_rc\""
        );
    }

    #[test]
    fn test_wrap_command_quotes_workdir_and_records_pid() {
        let script = wrap_command("true", "/work dir", Some("/tmp/x.pid"));
        assert!(script.contains("cd '/work dir' && (true)"));
        assert!(script.starts_with("exec 2>&1; echo $$ > /tmp/x.pid; "));
        assert!(script.contains("rm -f /tmp/x.pid; "));
        assert!(script.ends_with("echo \"FIXLOOP_EXIT:$__fixloop_rc\""));
    }

    #[test]
    fn test_kill_tree_script_reads_pid_file() {
        let script = kill_tree_script("/tmp/fixloop-exec-1.pid");
        assert!(script.contains("pid=$(cat /tmp/fixloop-exec-1.pid 2>/dev/null)"));
        assert!(script.contains("kill -KILL"));
        assert!(script.ends_with("rm -f /tmp/fixloop-exec-1.pid"));
    }

    #[test]
    fn test_split_exit_sentinel_strips_line() {
        let (out, code) = split_exit_sentinel("hello\nworld\nFIXLOOP_EXIT:0\n");
        assert_eq!(out, "hello\nworld");
        assert_eq!(code, Some(0));
    }

    #[test]
    fn test_split_exit_sentinel_nonzero() {
        let (out, code) = split_exit_sentinel("boom\nFIXLOOP_EXIT:127\n");
        assert_eq!(out, "boom");
        assert_eq!(code, Some(127));
    }

    #[test]
    fn test_split_exit_sentinel_no_trailing_newline_in_output() {
        let (out, code) = split_exit_sentinel("partialFIXLOOP_EXIT:1\n");
        assert_eq!(out, "partial");
        assert_eq!(code, Some(1));
    }

    #[test]
    fn test_split_exit_sentinel_empty_output() {
        let (out, code) = split_exit_sentinel("FIXLOOP_EXIT:1\n");
        assert_eq!(out, "");
        assert_eq!(code, Some(1));
    }

    #[test]
    fn test_split_exit_sentinel_missing() {
        let (out, code) = split_exit_sentinel("still running\nmore output\n");
        assert_eq!(out, "still running\nmore output\n");
        assert_eq!(code, None);
    }

    #[test]
    fn test_split_exit_sentinel_only_on_last_line() {
        let (out, code) = split_exit_sentinel("FIXLOOP_EXIT:0\nlater output");
        assert_eq!(out, "FIXLOOP_EXIT:0\nlater output");
        assert_eq!(code, None);
    }

    #[test]
    fn test_truncate_bytes_short_text_untouched() {
        assert_eq!(truncate_bytes("short", 100), "short");
    }

    #[test]
    fn test_truncate_bytes_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(600), "b".repeat(600));
        let out = truncate_bytes(&text, 100);
        let marker = "\n\n... [output truncated: 1200 bytes total] ...\n\n";
        assert!(out.starts_with(&"a".repeat(50)));
        assert!(out.ends_with(&"b".repeat(50)));
        assert!(out.contains("[output truncated: 1200 bytes total]"));
        assert_eq!(out.len(), 100 + marker.len());
    }

    #[test]
    fn test_truncate_bytes_respects_char_boundaries() {
        let text = "é".repeat(100); // 200 bytes
        let out = truncate_bytes(&text, 51);
        assert!(out.contains("[output truncated: 200 bytes total]"));
        assert!(out.starts_with(&"é".repeat(12)));
        assert!(out.ends_with(&"é".repeat(12)));
    }

    #[test]
    fn test_truncate_chars_counts_characters() {
        let text = format!("{}{}", "ü".repeat(40), "x".repeat(40));
        let out = truncate_chars(&text, 20);
        assert!(out.starts_with(&"ü".repeat(10)));
        assert!(out.ends_with(&"x".repeat(10)));
        assert!(out.contains("[output truncated: 80 chars total]"));
    }

    #[test]
    fn test_truncate_chars_short_text_untouched() {
        assert_eq!(truncate_chars("ok", 20), "ok");
    }
}
