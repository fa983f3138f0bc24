use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use clap::Parser;
use pretty_assertions::assert_eq;

#[derive(Debug, Default)]
struct FakeTerminalClient;

impl gearlink::TerminalClient for FakeTerminalClient {
    fn stdout_is_terminal(&self) -> bool {
        false
    }

    fn stderr_is_terminal(&self) -> bool {
        false
    }
}

async fn run_with_parsed_args(args: gearlink::Args) -> anyhow::Result<String> {
    let mut output = Vec::new();
    let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
    let transport = match maybe_fake_args {
        Some(fake_args) => gearlink::fake_gear_transport(fake_args),
        None => gearlink::real_gear_transport().await?,
    };
    gearlink::run_with_clients(command, &mut output, &FakeTerminalClient, transport).await?;
    Ok(String::from_utf8(output)?)
}

async fn run_with_argv<const N: usize>(argv: [&str; N]) -> anyhow::Result<String> {
    let parsed_args = gearlink::Args::try_parse_from(argv)?;
    run_with_parsed_args(parsed_args).await
}

#[tokio::test]
async fn scan_command_lists_models_and_flags_unsupported_gear() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43;hci1|CC:DD|Speaker|-",
        "scan",
    ])
    .await?;

    assert!(stdout.contains("Discovered gear:"));
    assert!(stdout.contains("MiTail"));
    assert!(stdout.contains("-43 dBm"));
    assert!(stdout.contains("unsupported"));
    assert!(stdout.contains("n/a"));
    Ok(())
}

#[tokio::test]
async fn scan_command_applies_fake_discovery_delay() -> anyhow::Result<()> {
    let started_at = Instant::now();
    let _ = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43",
        "--fake-discovery-delay",
        "40ms",
        "scan",
    ])
    .await?;

    assert!(started_at.elapsed() >= Duration::from_millis(40));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn catalog_command_prints_the_merged_catalog() -> anyhow::Result<()> {
    let fake = gearlink::FakeArgs::builder()
        .scan_fixture("hci0|AA:BB|mitail|-43")?
        .build();
    let args =
        gearlink::Args::new(gearlink::Command::Catalog(gearlink::CatalogArgs::new(None)))
            .with_fake(fake);

    let stdout = run_with_parsed_args(args).await?;

    assert!(stdout.contains("Merged catalog:"));
    assert!(stdout.contains("Slow Wag 1"));
    assert!(stdout.contains("TAILS1"));
    assert!(stdout.contains("11s 530ms"));
    assert!(stdout.contains("available"));
    assert!(stdout.contains("AA:BB"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn catalog_command_merges_equivalent_commands_across_devices() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43;hci0|CC:DD|mitail|-51",
        "catalog",
    ])
    .await?;

    // Both tails ship the same builtin file, so every row merges.
    assert!(stdout.contains("AA:BB, CC:DD"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn catalog_command_scopes_to_the_selected_device() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43;hci0|CC:DD|mitail|-51",
        "catalog",
        "--device",
        "CC:DD",
    ])
    .await?;

    assert!(stdout.contains("CC:DD"));
    assert!(!stdout.contains("AA:BB"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_command_dispatches_and_waits_for_the_queue_to_drain() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43",
        "send",
        "Tail Home Position",
    ])
    .await?;

    assert!(stdout.contains("Queued:"));
    assert!(stdout.contains("sent"));
    assert!(stdout.contains("Tail Home Position"));
    assert!(stdout.contains("to AA:BB"));
    assert!(stdout.contains("1 command(s) dispatched"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_command_accepts_wire_strings_and_pauses() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43",
        "send",
        "TAILHM",
        "pause:1",
        "TAILHM",
    ])
    .await?;

    assert!(stdout.contains("pause"));
    assert!(stdout.contains("2 command(s) dispatched"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn send_command_reports_a_batch_that_matches_nothing() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43",
        "send",
        "No Such Move",
    ])
    .await?;

    assert!(stdout.contains("Nothing queued; no entry matched the catalog."));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn listen_command_stops_at_the_event_limit() -> anyhow::Result<()> {
    let stdout = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43;hci0|CC:DD|EG2|-55",
        "listen",
        "--max-events",
        "2",
    ])
    .await?;

    assert!(stdout.contains("Listening on"));
    assert!(stdout.contains("2 device(s)"));
    assert!(stdout.contains("reached event limit"));
    assert!(stdout.contains("2 status event(s)"));
    Ok(())
}

#[tokio::test]
async fn connecting_fails_when_only_unsupported_gear_advertises() {
    let result = run_with_argv([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|CC:DD|Speaker|-50",
        "catalog",
    ])
    .await;

    let error = result.expect_err("a fixture without supported gear should fail");
    assert_matches!(
        error.downcast_ref::<gearlink::InteractionError>(),
        Some(gearlink::InteractionError::NoMatchingDevice { name }) if name == "any supported gear"
    );
}

#[test]
fn fake_args_builder_rejects_an_invalid_fixture() {
    let result = gearlink::FakeArgs::builder()
        .scan_fixture("invalid-record")
        .map(|_| ());

    assert_matches!(result, Err(gearlink::FixtureError::InvalidRecordFieldCount));
}

#[test]
fn send_requires_at_least_one_command() {
    let result = gearlink::Args::try_parse_from([
        "gearlink",
        "--fake",
        "--fake-scan",
        "hci0|AA:BB|mitail|-43",
        "send",
    ]);

    let error = result.expect_err("an empty batch should fail command parsing");
    assert_eq!(
        clap::error::ErrorKind::MissingRequiredArgument,
        error.kind()
    );
}
