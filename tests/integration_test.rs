use anyhow::Result;
use std::process::Command;
use tempfile::TempDir;

/// Helper to run ascii-dream and capture output
fn run_dream(args: &[&str]) -> Result<std::process::Output> {
    // Isolated HOME so a developer's saved settings don't leak in
    let home = TempDir::new()?;

    let mut cmd = Command::new("cargo");
    cmd.arg("run");
    cmd.arg("--quiet");
    cmd.arg("--");
    cmd.args(args);

    // Offline backend, no artificial latency
    cmd.env("HOME", home.path());
    cmd.env("ASCII_DREAM_USE_MOCK", "1");
    cmd.env("ASCII_DREAM_MOCK_LATENCY_MS", "0");
    cmd.env_remove("ASCII_DREAM_ENDPOINT");

    let output = cmd.output()?;
    Ok(output)
}

#[test]
fn test_headless_prints_requested_frames() -> Result<()> {
    let output = run_dream(&[
        "--headless", "--max-frames", "2", "--width", "20", "--no-color", "--fps", "5", "--seed", "7",
    ])?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "Dream should succeed. Stderr: {}", stderr);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("#0 [abstract]"), "Should caption the first frame");
    assert!(stdout.contains("#1 [abstract]"), "Should caption the second frame");
    assert!(!stdout.contains("#2 ["), "Should stop after two frames");
    assert!(!stdout.contains('\x1b'), "Monochrome output has no escape codes");

    // Art rows are exactly as wide as requested
    let art_rows: Vec<&str> = stdout
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .collect();
    assert!(!art_rows.is_empty(), "Should print art rows");
    assert!(art_rows.iter().all(|row| row.chars().count() == 20));

    Ok(())
}

#[test]
fn test_static_prompt_is_captioned() -> Result<()> {
    let output = run_dream(&[
        "--headless", "--max-frames", "1", "--width", "16", "--prompt", "a paper boat on a neon river",
    ])?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("#0 [custom] a paper boat on a neon river"));
    Ok(())
}

#[test]
fn test_zero_capacity_fails_fast() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "1", "--capacity", "0"])?;
    assert!(!output.status.success(), "Capacity 0 should be rejected");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("capacity"), "Should explain the problem. Stderr: {}", stderr);
    assert!(output.stdout.is_empty(), "Nothing should be generated");
    Ok(())
}

#[test]
fn test_unknown_journey_is_rejected() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "1", "--journey", "jungle"])?;
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown journey 'jungle'"), "Stderr: {}", stderr);
    Ok(())
}

#[test]
fn test_custom_journey_without_prompt_is_rejected() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "1", "--journey", "custom"])?;
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("needs a prompt"), "Stderr: {}", stderr);
    Ok(())
}

#[test]
fn test_speed_is_seconds_between_frames() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "2", "--width", "16", "--speed", "0.2"])?;
    assert!(output.status.success(), "Stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("#1 ["));
    Ok(())
}

#[test]
fn test_speed_and_fps_conflict() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "1", "--speed", "3", "--fps", "3"])?;
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot be used with"), "Stderr: {}", stderr);
    Ok(())
}

#[test]
fn test_buffer_alias_sets_capacity() -> Result<()> {
    let output = run_dream(&["--headless", "--max-frames", "1", "--buffer", "17"])?;
    assert!(!output.status.success(), "Capacity above the maximum should be rejected");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exceeds the maximum"), "Stderr: {}", stderr);
    Ok(())
}
