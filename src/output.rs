//! Terminal rendering of flow progress, verdicts and sign-in outcomes.
//!
//! Everything is written to stderr so stdout stays free for `--json` output.

use crate::enrollment::EnrollmentPhase;
use crate::services::LivenessLabel;
use crate::session::SignInOutcome;
use crate::verification::{VerificationPhase, VerificationVerdict};
use std::io::{self, Write};
use std::time::Duration;

const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";
const STRIKETHROUGH: &str = "\x1b[9m";

const BAR_WIDTH: usize = 30;

/// Clear the current terminal line (replaces the countdown bar etc.)
pub fn clear_line() {
    eprint!("\r\x1b[2K");
}

/// Color for a score in [0, 1].
fn score_color(score: f32) -> &'static str {
    if score >= 0.8 {
        GREEN
    } else if score >= 0.5 {
        YELLOW
    } else {
        RED
    }
}

fn mark(passed: bool) -> String {
    if passed {
        format!("{GREEN}pass{RESET}")
    } else {
        format!("{RED}fail{RESET}")
    }
}

/// Progress bar for a recording of `total` with `elapsed` already captured.
pub fn format_recording_bar(elapsed: Duration, total: Duration) -> String {
    let fraction = if total.is_zero() {
        1.0
    } else {
        (elapsed.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    };
    let filled = (fraction * BAR_WIDTH as f64).round() as usize;
    let remaining = total.saturating_sub(elapsed).as_secs_f64();
    format!(
        "{RED}●{RESET} [{}{DIM}{}{RESET}] {:.1}s",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        remaining
    )
}

/// Redraw the recording bar in place.
pub fn render_recording_bar(elapsed: Duration, total: Duration) {
    eprint!("\r\x1b[2K{}", format_recording_bar(elapsed, total));
    io::stderr().flush().ok();
}

/// Compute the longest common subsequence of two word slices.
/// Returns a list of (expected_idx, heard_idx) pairs for matched words.
fn lcs_indices(expected: &[&str], heard: &[&str]) -> Vec<(usize, usize)> {
    let m = expected.len();
    let n = heard.len();

    // u16 suffices: challenge phrases and their transcripts are a few words
    let mut table = vec![vec![0u16; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            if expected[i - 1].eq_ignore_ascii_case(heard[j - 1]) {
                table[i][j] = table[i - 1][j - 1] + 1;
            } else {
                table[i][j] = table[i - 1][j].max(table[i][j - 1]);
            }
        }
    }

    let mut matches = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if expected[i - 1].eq_ignore_ascii_case(heard[j - 1]) {
            matches.push((i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    matches.reverse();
    matches
}

#[derive(Debug, PartialEq)]
enum DiffOp<'a> {
    /// Said as asked.
    Equal(&'a str),
    /// Asked for but not heard.
    Missing(&'a str),
    /// Heard but not asked for.
    Extra(&'a str),
}

fn word_diff<'a>(expected: &[&'a str], heard: &[&'a str]) -> Vec<DiffOp<'a>> {
    let matches = lcs_indices(expected, heard);
    let mut ops = Vec::new();
    let (mut ei, mut hi) = (0, 0);

    for &(em, hm) in &matches {
        while ei < em {
            ops.push(DiffOp::Missing(expected[ei]));
            ei += 1;
        }
        while hi < hm {
            ops.push(DiffOp::Extra(heard[hi]));
            hi += 1;
        }
        ops.push(DiffOp::Equal(expected[em]));
        ei = em + 1;
        hi = hm + 1;
    }
    ops.extend(expected[ei..].iter().copied().map(DiffOp::Missing));
    ops.extend(heard[hi..].iter().copied().map(DiffOp::Extra));
    ops
}

/// The challenge phrase with missed words struck through and extra words dimmed.
pub fn format_phrase_diff(expected: &str, heard: &str) -> String {
    let expected = crate::services::transcript::normalize_phrase(expected);
    let heard = crate::services::transcript::normalize_phrase(heard);
    let expected: Vec<&str> = expected.split_whitespace().collect();
    let heard: Vec<&str> = heard.split_whitespace().collect();

    word_diff(&expected, &heard)
        .iter()
        .map(|op| match op {
            DiffOp::Equal(w) => format!("{GREEN}{w}{RESET}"),
            DiffOp::Missing(w) => format!("{STRIKETHROUGH}{RED}{w}{RESET}"),
            DiffOp::Extra(w) => format!("{DIM}[{w}]{RESET}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Multi-line breakdown of a verdict.
pub fn format_verdict(verdict: &VerificationVerdict) -> String {
    let mut lines = Vec::new();

    let heard = match verdict.transcript() {
        Some(text) => format!("  {}", format_phrase_diff(verdict.phrase(), text)),
        None => String::new(),
    };
    lines.push(format!(
        "  Phrase     {}{heard}",
        mark(verdict.transcript_match())
    ));

    let similarity = verdict.similarity();
    lines.push(format!(
        "  Speaker    {}  {}{:.0}%{RESET} similarity",
        mark(verdict.speaker_confirmed()),
        score_color(similarity),
        similarity * 100.0
    ));

    let genuine = verdict.liveness_label() == LivenessLabel::Genuine;
    lines.push(format!(
        "  Liveness   {}  {} {DIM}({:.0}%){RESET}",
        mark(genuine),
        verdict.liveness_label(),
        verdict.liveness_confidence() * 100.0
    ));

    for failure in verdict.failures() {
        lines.push(format!("  {YELLOW}! {}{RESET}", failure.message));
    }

    let summary = if verdict.passed() {
        format!("{BOLD}{GREEN}Voice verified{RESET}")
    } else {
        format!("{BOLD}{RED}Voice not verified{RESET}")
    };
    lines.push(summary);
    lines.join("\n")
}

pub fn render_verdict(verdict: &VerificationVerdict) {
    clear_line();
    eprintln!("{}", format_verdict(verdict));
}

/// One status line for an enrollment phase, or `None` for phases that
/// need no line of their own.
pub fn format_enrollment_phase(phase: &EnrollmentPhase) -> Option<String> {
    match phase {
        EnrollmentPhase::Idle => None,
        EnrollmentPhase::Capturing {
            round,
            attempt,
            prompt,
        } => {
            let retry = if *attempt > 1 {
                format!(" {DIM}(attempt {attempt}){RESET}")
            } else {
                String::new()
            };
            Some(format!(
                "{BOLD}Round {round}/{}{RESET}{retry} Read aloud:\n  \"{prompt}\"",
                crate::defaults::ENROLLMENT_ROUNDS
            ))
        }
        EnrollmentPhase::Analyzing { round, .. } => {
            Some(format!("{DIM}Analyzing round {round}...{RESET}"))
        }
        EnrollmentPhase::Retrying { reason, .. } => {
            Some(format!("{YELLOW}{reason}. Let's try that again.{RESET}"))
        }
        EnrollmentPhase::Completed => Some(format!("{GREEN}Voiceprint enrolled{RESET}")),
        EnrollmentPhase::Failed { reason } => Some(format!("{RED}Enrollment failed: {reason}{RESET}")),
    }
}

pub fn render_enrollment_phase(phase: &EnrollmentPhase) {
    if let Some(line) = format_enrollment_phase(phase) {
        clear_line();
        eprintln!("{line}");
    }
}

pub fn render_verification_phase(phase: &VerificationPhase) {
    match phase {
        VerificationPhase::Analyzing => {
            clear_line();
            eprintln!("{DIM}Checking phrase, speaker and liveness...{RESET}");
        }
        // Verdicts are printed by the caller.
        VerificationPhase::Idle | VerificationPhase::Capturing | VerificationPhase::Resolved(_) => {}
    }
}

/// Final line of a sign-in.
pub fn format_outcome(outcome: &SignInOutcome) -> String {
    match outcome {
        SignInOutcome::Authenticated(session) => format!(
            "{BOLD}{GREEN}Signed in{RESET} as {}",
            session.identity.email
        ),
        SignInOutcome::RejectedPassword => format!("{RED}Incorrect email or password{RESET}"),
        SignInOutcome::RejectedVoice(_) => {
            format!("{RED}Voice verification failed{RESET}")
        }
        SignInOutcome::RejectedOtpExpired => format!(
            "{RED}Verification code expired or already used.{RESET} Sign in again."
        ),
        SignInOutcome::RejectedOtpMismatch => {
            format!("{RED}Incorrect verification code{RESET}")
        }
        SignInOutcome::Aborted => format!("{DIM}Sign-in cancelled{RESET}"),
    }
}

pub fn render_outcome(outcome: &SignInOutcome) {
    clear_line();
    eprintln!("{}", format_outcome(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AccountId;
    use chrono::Utc;

    fn strip_ansi(text: &str) -> String {
        let mut out = String::new();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn word_diff_identical_phrase() {
        let ops = word_diff(&["river", "candle"], &["river", "candle"]);
        assert_eq!(ops, vec![DiffOp::Equal("river"), DiffOp::Equal("candle")]);
    }

    #[test]
    fn word_diff_missing_and_extra_words() {
        let ops = word_diff(&["river", "candle", "ocean"], &["river", "handle", "ocean"]);
        assert_eq!(
            ops,
            vec![
                DiffOp::Equal("river"),
                DiffOp::Missing("candle"),
                DiffOp::Extra("handle"),
                DiffOp::Equal("ocean"),
            ]
        );
    }

    #[test]
    fn word_diff_trailing_words() {
        let ops = word_diff(&["river", "candle"], &["river"]);
        assert_eq!(ops, vec![DiffOp::Equal("river"), DiffOp::Missing("candle")]);

        let ops = word_diff(&["river"], &["river", "um"]);
        assert_eq!(ops, vec![DiffOp::Equal("river"), DiffOp::Extra("um")]);
    }

    #[test]
    fn word_diff_empty_transcript() {
        let ops = word_diff(&["river", "candle"], &[]);
        assert_eq!(ops, vec![DiffOp::Missing("river"), DiffOp::Missing("candle")]);
    }

    #[test]
    fn phrase_diff_normalizes_case_and_punctuation() {
        let diff = strip_ansi(&format_phrase_diff("river candle", "River, candle!"));
        assert_eq!(diff, "river candle");
    }

    #[test]
    fn score_color_thresholds() {
        assert_eq!(score_color(0.95), GREEN);
        assert_eq!(score_color(0.8), GREEN);
        assert_eq!(score_color(0.6), YELLOW);
        assert_eq!(score_color(0.1), RED);
    }

    #[test]
    fn recording_bar_counts_down() {
        let bar = strip_ansi(&format_recording_bar(
            Duration::from_secs(3),
            Duration::from_secs(6),
        ));
        assert!(bar.contains(&"#".repeat(15)));
        assert!(bar.ends_with("3.0s"));

        let done = strip_ansi(&format_recording_bar(
            Duration::from_secs(9),
            Duration::from_secs(6),
        ));
        assert!(done.contains(&"#".repeat(BAR_WIDTH)));
        assert!(done.ends_with("0.0s"));
    }

    #[test]
    fn verdict_lists_each_check() {
        let verdict =
            crate::verification::test_verdict(AccountId::new("uid-1"), false, Utc::now());
        let text = strip_ansi(&format_verdict(&verdict));
        assert!(text.contains("Phrase     fail"));
        assert!(text.contains("Speaker    fail  20% similarity"));
        assert!(text.contains("Liveness   pass  genuine"));
        assert!(text.ends_with("Voice not verified"));
    }

    #[test]
    fn enrollment_phase_lines() {
        assert!(format_enrollment_phase(&EnrollmentPhase::Idle).is_none());

        let line = strip_ansi(
            &format_enrollment_phase(&EnrollmentPhase::Capturing {
                round: 2,
                attempt: 2,
                prompt: "The quick brown fox jumps over the lazy dog.",
            })
            .unwrap(),
        );
        assert!(line.starts_with("Round 2/3 (attempt 2)"));
        assert!(line.contains("lazy dog"));
    }

    #[test]
    fn outcome_lines() {
        assert_eq!(
            strip_ansi(&format_outcome(&SignInOutcome::RejectedOtpMismatch)),
            "Incorrect verification code"
        );
        assert_eq!(
            strip_ansi(&format_outcome(&SignInOutcome::Aborted)),
            "Sign-in cancelled"
        );
    }

    #[test]
    fn test_clear_line_doesnt_panic() {
        clear_line();
    }
}
