//! Diagnostics for bnswap.
//!
//! Implements `bnswap doctor`, which checks:
//! - The storage directories and state file.
//! - What sits at each live state root (directory, link, broken link).
//! - That every saved account has data and a registry snapshot.
//! - Whether the client launcher and registry tooling are reachable.
//!
//! Nothing here mutates anything; it only reports.

use anstyle::AnsiColor;

use crate::engine::SwitchEngine;
use crate::linkstore::LinkStatus;
use crate::roots::StateRoot;
use crate::state::State;
use crate::ui::Ui;

/// Run the doctor diagnostics
pub fn run_doctor(engine: &SwitchEngine, ui: &Ui) {
    let paths = engine.paths();
    let config = engine.config();

    ui.section("bnswap Doctor");
    ui.newline();

    check_step(ui, "Storage", || {
        let mut ok = true;
        for (what, dir) in [("Base", &paths.base_dir), ("Accounts", &paths.accounts_dir)] {
            if dir.is_dir() {
                ui.println(format!("  {} {} directory: {}", ui.icon_ok(), what, dir.display()));
            } else {
                ui.println(format!(
                    "  {} {} directory missing: {}",
                    ui.icon_err(),
                    what,
                    dir.display()
                ));
                ok = false;
            }
        }
        if paths.config_file.exists() {
            ui.println(format!(
                "  {} Config file: {}",
                ui.icon_ok(),
                paths.config_file.display()
            ));
        } else {
            ui.println(format!(
                "  {} No config file, using defaults (bnswap config --init writes one)",
                ui.icon_info()
            ));
        }
        ok
    });

    check_step(ui, "State File", || match State::read(&paths.state_file) {
        Ok(state) => {
            ui.println(format!("  {} State file readable", ui.icon_ok()));
            match &state.active_identity {
                Some(id) if engine.get(id).is_some() => {
                    ui.println(format!("  {} Last switched to: {}", ui.icon_info(), id));
                    true
                }
                Some(id) => {
                    ui.println(format!(
                        "  {} State points at unknown account '{}'",
                        ui.icon_warn(),
                        id
                    ));
                    true
                }
                None => {
                    ui.println(format!("  {} No active account recorded", ui.icon_info()));
                    true
                }
            }
        }
        Err(e) => {
            ui.println(format!("  {} State file corrupt: {:#}", ui.icon_err(), e));
            false
        }
    });

    check_step(ui, "Live State", || {
        let mut ok = true;
        for root in StateRoot::all() {
            let live = root.live_path(config);
            let name = root.display_name();
            match LinkStatus::detect(&live) {
                LinkStatus::Missing => ui.println(format!(
                    "  {} {} missing: {} (client not installed or never started?)",
                    ui.icon_warn(),
                    name,
                    live.display()
                )),
                LinkStatus::Directory => {
                    ui.println(format!("  {} {}: {}", ui.icon_ok(), name, live.display()))
                }
                LinkStatus::File => {
                    ui.println(format!(
                        "  {} {} is a file, expected a directory: {}",
                        ui.icon_err(),
                        name,
                        live.display()
                    ));
                    ok = false;
                }
                LinkStatus::Link { target } => {
                    if paths.is_in_accounts_dir(&target) {
                        ui.println(format!(
                            "  {} {} links to saved account: {}",
                            ui.icon_ok(),
                            name,
                            target.display()
                        ));
                    } else {
                        ui.println(format!(
                            "  {} {} links outside bnswap storage: {}",
                            ui.icon_warn(),
                            name,
                            target.display()
                        ));
                    }
                }
                LinkStatus::BrokenLink { target } => {
                    ui.println(format!(
                        "  {} {} is a BROKEN link to {} (the next save or switch removes it)",
                        ui.icon_err(),
                        name,
                        target.display()
                    ));
                    ok = false;
                }
            }
        }
        ok
    });

    check_step(ui, "Accounts", || {
        let summaries = engine.summaries();
        if summaries.is_empty() {
            ui.println(format!("  {} No accounts saved", ui.icon_warn()));
            return true;
        }

        ui.println(format!("  Found {} accounts:", summaries.len()));
        for summary in summaries {
            let identity = &summary.identity;
            let name = format!("{} ({})", identity.label, identity.id);
            if !summary.has_data {
                ui.println(format!(
                    "    {} {} has no saved session (bnswap update {})",
                    ui.icon_warn(),
                    name,
                    identity.id
                ));
            } else if engine.registry().is_some() && !engine.snapshot_file(&identity.id).exists() {
                ui.println(format!(
                    "    {} {} has no registry snapshot",
                    ui.icon_warn(),
                    name
                ));
            } else {
                ui.println(format!("    {} {}", ui.icon_ok(), name));
            }
        }
        true
    });

    check_step(ui, "Client", || {
        let mut ok = true;
        if config.launcher.exists() {
            ui.println(format!(
                "  {} Launcher: {}",
                ui.icon_ok(),
                config.launcher.display()
            ));
        } else {
            ui.println(format!(
                "  {} Launcher not found: {}",
                ui.icon_err(),
                config.launcher.display()
            ));
            ok = false;
        }

        let running = if engine.probe().is_running() { "running" } else { "not running" };
        ui.println(format!("  {} Client is {}", ui.icon_info(), running));

        match engine.registry() {
            Some(registry) => ui.println(format!(
                "  {} Registry: {} cached token(s) under {}",
                ui.icon_info(),
                registry.list_token_names().len(),
                registry.token_key()
            )),
            None => ui.println(format!(
                "  {} Registry snapshots disabled",
                ui.icon_info()
            )),
        }
        ok
    });
}

fn check_step<F>(ui: &Ui, name: &str, check_fn: F)
where
    F: FnOnce() -> bool,
{
    ui.println(ui.bold(format!("Checking {}...", name)));
    if !check_fn() {
        ui.println(ui.colored("  Issues detected!", AnsiColor::Red));
    }
    ui.newline();
}
