//! High-level command orchestration for the CLI.
//!
//! Each function here corresponds to a subcommand in `main.rs`. They resolve
//! the user's account reference, call into `crate::engine`, and render the
//! result through `crate::ui`. Caller-side policy lives here too, such as
//! offering an update instead of saving a duplicate account.

use anstyle::AnsiColor;
use anyhow::{Result, bail};
use chrono::{DateTime, Local, Utc};

use crate::config::Config;
use crate::doctor::run_doctor;
use crate::engine::{CaptureReport, SwitchEngine};
use crate::fs_utils::{dir_size, format_bytes};
use crate::identities::{Identity, RegionTag};
use crate::linkstore::LinkStatus;
use crate::paths::Paths;
use crate::roots::StateRoot;
use crate::ui::Ui;

/// Resolve an id or label to a known identity
fn resolve(engine: &SwitchEngine, query: &str) -> Result<Identity> {
    match engine.find(query) {
        Some(identity) => Ok(identity),
        None => bail!(
            "Account '{}' does not exist.\nHint: Use 'bnswap list' to see saved accounts.",
            query
        ),
    }
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// The live identity, else the last one switched to
fn live_or_active(engine: &SwitchEngine) -> Option<String> {
    engine
        .detect_live_identity()
        .or_else(|| engine.active_identity())
}

/// List all saved accounts
pub fn list(engine: &SwitchEngine, ui: &Ui) -> Result<()> {
    let summaries = engine.summaries();

    if summaries.is_empty() {
        ui.warn("No accounts saved yet.");
        ui.newline();
        ui.println("Log in to the client, then save the session with:");
        ui.println(format!("  {} save", ui.bold("bnswap")));
        return Ok(());
    }

    let live = live_or_active(engine);

    let mut table = ui.table();
    table.set_header(vec![
        ui.header_cell(""),
        ui.header_cell("Id"),
        ui.header_cell("Label"),
        ui.header_cell("Account"),
        ui.header_cell("Region"),
        ui.header_cell("Last used"),
        ui.header_cell("Data"),
    ]);

    for summary in &summaries {
        let identity = &summary.identity;
        let is_live = live.as_deref() == Some(identity.id.as_str());
        let data_cell = if summary.has_data {
            ui.cell("saved")
        } else {
            ui.colored_cell("empty", AnsiColor::Yellow)
        };

        table.add_row(vec![
            ui.cell(if is_live { ui.icon_ok() } else { " " }),
            ui.cell(&identity.id),
            if is_live {
                ui.colored_cell(&identity.label, AnsiColor::Green)
            } else {
                ui.cell(&identity.label)
            },
            ui.cell(identity.masked_contact().unwrap_or_else(|| "-".to_string())),
            ui.region_cell(identity.region_tag),
            ui.cell(format_time(identity.last_activated_at)),
            data_cell,
        ]);
    }

    ui.section("Accounts");
    ui.println(table.to_string());
    Ok(())
}

/// Show which account is live
pub fn current(engine: &SwitchEngine, ui: &Ui) -> Result<()> {
    ui.section("Current Account");
    ui.newline();

    let mut table = ui.simple_table();

    match engine.detect_live_identity().and_then(|id| engine.get(&id)) {
        Some(identity) => {
            table.add_row(vec![
                ui.cell("Live account:"),
                ui.header_cell(format!("{} ({})", identity.label, identity.id)),
            ]);
            if let Some(contact) = identity.masked_contact() {
                table.add_row(vec![ui.cell("Login:"), ui.cell(contact)]);
            }
            table.add_row(vec![
                ui.cell("Region:"),
                ui.region_cell(identity.region_tag),
            ]);
        }
        None => {
            table.add_row(vec![
                ui.cell("Live account:"),
                ui.colored_cell("(not a saved account)", AnsiColor::Yellow),
            ]);
            let hint = engine.current_hint();
            if let Some(tag) = &hint.display_tag {
                table.add_row(vec![ui.cell("Seen in logs:"), ui.cell(tag)]);
            }
        }
    }

    if let Some(identity) = engine.active_identity().and_then(|id| engine.get(&id)) {
        table.add_row(vec![
            ui.cell("Last switched to:"),
            ui.cell(format!(
                "{} at {}",
                identity.label,
                format_time(identity.last_activated_at)
            )),
        ]);
    }

    ui.println(table.to_string());
    Ok(())
}

fn print_capture(ui: &Ui, report: &CaptureReport) {
    ui.warnings(&report.warnings);
    if report.stopped_client {
        ui.println(format!("  {} Stopped the running client", ui.icon_info()));
    }
    if let Some(contact) = &report.contact_identifier {
        ui.println(format!(
            "  {} Login: {}",
            ui.icon_info(),
            crate::identities::mask_contact(contact)
        ));
    }
    if !report.registry_exported {
        ui.println(format!("  {} Registry tokens not saved", ui.icon_info()));
    }
}

/// Save the live session. If its login is already saved, offer to update
/// that account instead of creating a duplicate.
pub fn save(
    engine: &SwitchEngine,
    ui: &Ui,
    label: Option<String>,
    region: RegionTag,
    force_update: bool,
) -> Result<()> {
    let contact = engine
        .live_contact()
        .or_else(|| engine.current_hint().contact_identifier);
    let existing = contact
        .as_deref()
        .and_then(|contact| engine.find_by_contact(contact));

    if let Some(existing) = existing {
        let update = force_update
            || ui.confirm(
                &format!(
                    "This login is already saved as '{}'. Update it instead?",
                    existing.label
                ),
                true,
            )?;
        if update {
            return update_identity(engine, ui, &existing);
        }
    } else if force_update {
        bail!(
            "The live login is not a saved account.\nHint: Run 'bnswap save' without --update to add it."
        );
    }

    let spinner = ui.spinner("Saving live session...");
    match engine.create_from_current(label.as_deref(), region) {
        Ok(report) => {
            ui.spinner_finish_ok(
                &spinner,
                format!("Saved '{}' as {}", report.label, report.id),
            );
            print_capture(ui, &report);
            Ok(())
        }
        Err(e) => {
            ui.spinner_finish_err(&spinner, format!("Failed to save: {}", e));
            if !e.is_precondition() {
                ui.println("Hint: Saving is not resumable; run the same command again.");
            }
            Err(e.into())
        }
    }
}

/// Add an empty account slot to be filled by a later `update`
pub fn add(engine: &SwitchEngine, ui: &Ui, label: &str) -> Result<()> {
    let id = engine.create(label)?;

    ui.ok(format!("Created account '{}' ({})", label.trim(), id));
    ui.newline();
    ui.println("To fill it with a session:");
    ui.println(format!("  {} prepare     # log in on a clean login screen", ui.bold("bnswap")));
    ui.println(format!("  {} update {}", ui.bold("bnswap"), id));
    Ok(())
}

/// Switch the live client to an account
pub fn use_identity(engine: &SwitchEngine, ui: &Ui, query: &str) -> Result<()> {
    let identity = resolve(engine, query)?;
    let spinner = ui.spinner(format!("Switching to '{}'...", identity.label));

    match engine.switch_to(&identity.id) {
        Ok(report) => {
            ui.spinner_finish_ok(&spinner, format!("Active account: {}", report.label));
            ui.warnings(&report.warnings);
            if report.stopped_client {
                ui.println(format!("  {} Stopped the running client", ui.icon_info()));
            }
            if report.launched {
                ui.println(format!(
                    "  {} Launched the client ({})",
                    ui.icon_info(),
                    identity.region_tag.display_name()
                ));
            }
            Ok(())
        }
        Err(e) => {
            ui.spinner_finish_err(&spinner, format!("Failed to switch: {}", e));
            if !e.is_precondition() {
                ui.println(format!(
                    "Hint: Run 'bnswap use {}' again; switching is safe to repeat.",
                    identity.id
                ));
            }
            Err(e.into())
        }
    }
}

fn update_identity(engine: &SwitchEngine, ui: &Ui, identity: &Identity) -> Result<()> {
    let spinner = ui.spinner(format!("Updating '{}' from the live session...", identity.label));
    match engine.update_account_data(&identity.id) {
        Ok(report) => {
            ui.spinner_finish_ok(&spinner, format!("Updated '{}'", report.label));
            print_capture(ui, &report);
            Ok(())
        }
        Err(e) => {
            ui.spinner_finish_err(&spinner, format!("Failed to update: {}", e));
            Err(e.into())
        }
    }
}

/// Refresh an account's stored session from the live client
pub fn update(engine: &SwitchEngine, ui: &Ui, query: &str) -> Result<()> {
    let identity = resolve(engine, query)?;
    update_identity(engine, ui, &identity)
}

/// Delete an account and its stored data
pub fn remove(engine: &SwitchEngine, ui: &Ui, query: &str, yes: bool) -> Result<()> {
    let identity = resolve(engine, query)?;

    if !yes {
        if !ui.interactive {
            bail!(
                "Refusing to remove '{}' without confirmation.\nHint: Pass --yes to remove it non-interactively.",
                identity.label
            );
        }
        if !ui.confirm(&format!("Remove '{}' and its saved session?", identity.label), false)? {
            ui.info("Nothing removed");
            return Ok(());
        }
    }

    engine.delete(&identity.id)?;
    ui.ok(format!("Removed '{}'", identity.label));
    Ok(())
}

pub fn rename(engine: &SwitchEngine, ui: &Ui, query: &str, label: &str) -> Result<()> {
    let identity = resolve(engine, query)?;
    engine.rename(&identity.id, label)?;
    ui.ok(format!("Renamed '{}' to '{}'", identity.label, label.trim()));
    Ok(())
}

/// Set an account's region, or flip it when none is given
pub fn region(engine: &SwitchEngine, ui: &Ui, query: &str, tag: Option<RegionTag>) -> Result<()> {
    let identity = resolve(engine, query)?;
    let tag = match tag {
        Some(tag) => {
            engine.set_region(&identity.id, tag)?;
            tag
        }
        None => engine.toggle_region(&identity.id)?,
    };
    ui.ok(format!("'{}' now uses region {}", identity.label, tag.display_name()));
    Ok(())
}

/// Open the client on a clean login screen to sign in another account
pub fn prepare(engine: &SwitchEngine, ui: &Ui, region: RegionTag) -> Result<()> {
    let spinner = ui.spinner("Preparing a fresh login...");
    let report = match engine.prepare_fresh_login(region) {
        Ok(report) => report,
        Err(e) => {
            ui.spinner_finish_err(&spinner, format!("Failed to prepare login: {}", e));
            return Err(e.into());
        }
    };

    ui.spinner_finish_ok(&spinner, "Client is ready for a new login");
    ui.warnings(&report.warnings);
    if report.caches_removed > 0 {
        ui.println(format!(
            "  {} Cleared {} browser cache(s)",
            ui.icon_info(),
            report.caches_removed
        ));
    }
    ui.newline();
    ui.println("After logging in, save the session with:");
    ui.println(format!("  {} save <label>", ui.bold("bnswap")));
    Ok(())
}

/// Client process and live state roots
pub fn status(engine: &SwitchEngine, ui: &Ui) -> Result<()> {
    let config = engine.config();

    ui.section("Client");
    let mut table = ui.simple_table();
    table.add_row(vec![
        ui.cell("Process:"),
        if engine.probe().is_running() {
            ui.colored_cell("running", AnsiColor::Green)
        } else {
            ui.cell("not running")
        },
    ]);
    table.add_row(vec![
        ui.cell("Attach mode:"),
        ui.cell(format!("{:?}", config.attach).to_lowercase()),
    ]);
    if let Some(registry) = engine.registry() {
        table.add_row(vec![
            ui.cell("Cached tokens:"),
            ui.cell(registry.list_token_names().len().to_string()),
        ]);
    }
    ui.println(table.to_string());
    ui.newline();

    ui.section("Live State");
    let mut roots = ui.simple_table();
    roots.set_header(vec![
        ui.header_cell("Root"),
        ui.header_cell("Path"),
        ui.header_cell("Status"),
        ui.header_cell("Size"),
    ]);
    for root in StateRoot::all() {
        let live = root.live_path(config);
        let status = LinkStatus::detect(&live);
        let size = match status {
            LinkStatus::Directory | LinkStatus::Link { .. } => dir_size(&live)
                .map(format_bytes)
                .unwrap_or_else(|_| "?".to_string()),
            _ => "-".to_string(),
        };
        roots.add_row(vec![
            ui.cell(root.display_name()),
            ui.cell(live.display().to_string()),
            ui.link_status_cell(&status),
            ui.cell(size),
        ]);
    }
    ui.println(roots.to_string());
    Ok(())
}

pub fn stop(engine: &SwitchEngine, ui: &Ui) -> Result<()> {
    let probe = engine.probe();
    if !probe.is_running() {
        ui.info("The client is not running");
        return Ok(());
    }

    let spinner = ui.spinner("Stopping the client...");
    probe.request_stop();
    if probe.is_running() {
        ui.spinner_finish_err(&spinner, "The client is still running");
        bail!("Could not stop the client.\nHint: Close it manually and try again.");
    }
    ui.spinner_finish_ok(&spinner, "Client stopped");
    Ok(())
}

/// Launch with the given region, else the live account's region
pub fn launch(engine: &SwitchEngine, ui: &Ui, region: Option<RegionTag>) -> Result<()> {
    let region = region
        .or_else(|| live_or_active(engine).and_then(|id| engine.get(&id)).map(|i| i.region_tag))
        .unwrap_or_default();
    let arg = engine.config().region_args.for_tag(region);

    if !engine.probe().launch(arg) {
        bail!(
            "Failed to launch {}.\nHint: Set \"launcher\" in {} to the client's launcher path.",
            engine.config().launcher.display(),
            engine.paths().config_file.display()
        );
    }
    ui.ok(format!("Launched the client ({})", region.display_name()));
    Ok(())
}

/// Show the effective configuration, or write the defaults with `init`
pub fn config(paths: &Paths, config: &Config, ui: &Ui, init: bool) -> Result<()> {
    if init {
        if paths.config_file.exists() {
            bail!(
                "Config file already exists: {}\nHint: Edit it directly, or delete it to start over.",
                paths.config_file.display()
            );
        }
        Config::default().save(&paths.config_file)?;
        ui.ok(format!("Wrote default config to {}", paths.config_file.display()));
        return Ok(());
    }

    ui.section(format!("Config ({})", paths.config_file.display()));
    if !paths.config_file.exists() {
        ui.println(ui.dim("(file missing, showing defaults)"));
    }
    ui.println(serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Run diagnostics
pub fn doctor(engine: &SwitchEngine, ui: &Ui) -> Result<()> {
    run_doctor(engine, ui);
    Ok(())
}
