//! Unit tests for command normalization: fingerprints, base commands,
//! and templates.

use zsh_tool::fingerprint::{base_command, fingerprint, normalize, template};

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

#[test]
fn test_normalize_trims_and_collapses_whitespace() {
    assert_eq!(normalize("  ls   -la   /tmp  "), "ls -la /tmp");
    assert_eq!(normalize("echo\t\thello\n"), "echo hello");
}

#[test]
fn test_normalize_empties_quoted_runs() {
    assert_eq!(normalize(r#"grep "some pattern" file"#), r#"grep "" file"#);
    assert_eq!(normalize("echo 'a b c'"), "echo ''");
}

#[test]
fn test_normalize_replaces_digit_runs() {
    assert_eq!(normalize("sleep 30"), "sleep N");
    assert_eq!(normalize("kill -9 12345"), "kill -N N");
}

// ---------------------------------------------------------------------------
// Fingerprint stability
// ---------------------------------------------------------------------------

#[test]
fn test_fingerprint_is_16_hex_chars() {
    let fp = fingerprint("echo hello");
    assert_eq!(fp.len(), 16);
    assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_fingerprint_deterministic() {
    assert_eq!(fingerprint("ls -la"), fingerprint("ls -la"));
}

#[test]
fn test_fingerprint_stable_under_whitespace_runs() {
    assert_eq!(fingerprint("ls   -la"), fingerprint("ls -la"));
    assert_eq!(fingerprint("  ls -la  "), fingerprint("ls -la"));
}

#[test]
fn test_fingerprint_stable_under_numeric_literals() {
    assert_eq!(fingerprint("sleep 30"), fingerprint("sleep 99"));
    assert_eq!(fingerprint("head -5 f"), fingerprint("head -200 f"));
}

#[test]
fn test_fingerprint_stable_under_quoted_contents() {
    assert_eq!(
        fingerprint(r#"grep "foo" file"#),
        fingerprint(r#"grep "barbaz" file"#)
    );
    assert_eq!(fingerprint("echo 'x'"), fingerprint("echo 'different'"));
}

#[test]
fn test_fingerprint_keeps_literal_operators_distinct() {
    assert_ne!(fingerprint("tar xf a"), fingerprint("tar cf a"));
    assert_ne!(fingerprint("ls -l"), fingerprint("ls -a"));
}

// ---------------------------------------------------------------------------
// Base command
// ---------------------------------------------------------------------------

#[test]
fn test_base_command_first_token() {
    assert_eq!(base_command("grep pattern file"), "grep");
    assert_eq!(base_command("  tar xf foo.tar"), "tar");
}

#[test]
fn test_base_command_strips_path() {
    assert_eq!(base_command("/usr/bin/grep pattern"), "grep");
    assert_eq!(base_command("./scripts/build.sh --fast"), "build.sh");
}

#[test]
fn test_base_command_empty() {
    assert_eq!(base_command(""), "");
    assert_eq!(base_command("   "), "");
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

#[test]
fn test_template_wildcards_filenames() {
    assert_eq!(template("tar xf bad1.tar"), "tar xf *");
    assert_eq!(template("tar xf anything.tar"), "tar xf *");
}

#[test]
fn test_template_same_shape_different_files() {
    assert_eq!(template("tar xf bad1.tar"), template("tar xf bad2.tar"));
    assert_eq!(template("cat /etc/hosts"), template("cat /tmp/other"));
}

#[test]
fn test_template_keeps_options_and_words() {
    assert_eq!(template("git push origin main"), "git push origin main");
    assert_eq!(template("ls -la"), "ls -la");
    assert_eq!(template("tar --xyzzy"), "tar --xyzzy");
}

#[test]
fn test_template_wildcards_numbers_and_globs() {
    assert_eq!(template("sleep 30"), "sleep *");
    assert_eq!(template("rm *.log"), "rm *");
}

#[test]
fn test_template_distinguishes_shapes() {
    assert_ne!(template("tar xf a.tar"), template("git push origin main"));
}
