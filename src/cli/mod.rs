//! CLI command handling
//!
//! Loads plans, drives a [`TestRun`] and formats its results.

pub mod plan;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{paths, Error, Result};
use crate::run::storage::{JsonReportStorage, LogStorage};
use crate::run::{RunEvent, RunOptions, RunSummary, TestRun};
use crate::test::{CheckResult, TestReport};
use plan::LoadedPlan;

/// Dispatch a CLI command; returns whether everything passed
pub async fn dispatch(command: Commands) -> Result<bool> {
    match command {
        Commands::Run {
            plan,
            jobs,
            workdir,
            report,
            client_id,
            no_progress,
            log_file: _,
        } => {
            let config = Config::load()?;
            let plan = plan::load(&plan)?;
            let options = run_options(&config, &plan, jobs, workdir, client_id);
            let summary = execute(&plan, options, report, !no_progress).await?;
            print_summary(&summary);
            Ok(summary.all_passed())
        }

        Commands::List { plan, json } => {
            let plan = plan::load(&plan)?;
            if json {
                print_declarations_json(&plan)?;
            } else {
                print_declarations(&plan);
            }
            Ok(true)
        }

        Commands::Config => {
            let config = Config::load()?;
            match paths::config_path() {
                Some(path) if path.exists() => println!("# {}", path.display()),
                Some(path) => println!("# {} (not found, using defaults)", path.display()),
                None => println!("# no configuration directory, using defaults"),
            }
            let text = toml::to_string_pretty(&config).map_err(|e| Error::Config(e.to_string()))?;
            print!("{}", text);
            Ok(true)
        }
    }
}

/// Combine configuration, plan settings and flags, flags winning
fn run_options(
    config: &Config,
    plan: &LoadedPlan,
    jobs: Option<usize>,
    workdir: Option<PathBuf>,
    client_id: Option<String>,
) -> RunOptions {
    let working_dir = workdir
        .or_else(|| plan.run.working_dir.clone())
        .or_else(|| config.run.working_dir.clone())
        .unwrap_or_else(paths::default_working_dir);

    let mut options = RunOptions::from_config(config, working_dir);
    if let Some(n) = jobs.or(plan.run.max_concurrent) {
        options.max_concurrent = n.max(1);
    }
    if let Some(id) = client_id.or_else(|| plan.run.client_id.clone()) {
        options.client_id = Some(id);
    }
    options
}

async fn execute(
    plan: &LoadedPlan,
    options: RunOptions,
    report: Option<PathBuf>,
    show_progress: bool,
) -> Result<RunSummary> {
    let mut run = TestRun::new(options)?;
    plan.schedule(&mut run);
    match report {
        Some(path) => run.set_storage(JsonReportStorage::new(path)),
        None => run.set_storage(LogStorage),
    }

    println!(
        "\n{} {} ({} instances, working directory {})",
        "Running Plan:".blue().bold(),
        plan.path.display().to_string().white().bold(),
        plan.instance_count(),
        run.working_directory().display().to_string().dimmed()
    );

    let bar = if show_progress {
        let bar = ProgressBar::new(plan.instance_count() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("  [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let listener_bar = bar.clone();
    run.connect(move |event| match event {
        RunEvent::SingleTestStart { test, iteration } => {
            listener_bar.set_message(format!("{} (iteration {})", test.name(), iteration));
        }
        RunEvent::SingleTestDone { test } => {
            listener_bar.println(result_line(test));
            listener_bar.inc(1);
        }
        RunEvent::Aborted => {
            listener_bar.println(format!("  {}", "Run aborted".yellow().bold()));
        }
        _ => {}
    });

    let controller = run.controller();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            controller.abort();
        }
    });

    let summary = run.run().await;
    interrupt.abort();
    bar.finish_and_clear();
    summary
}

fn percentage(value: f64) -> String {
    format!("{:>5.1}%", value)
}

fn result_line(report: &TestReport) -> String {
    let mark = if report.is_perfect() {
        "✓".green()
    } else {
        "✗".red()
    };
    format!(
        "  {} {} {}",
        mark,
        percentage(report.success_percentage),
        report.name()
    )
}

fn print_summary(summary: &RunSummary) {
    println!("\n{}", "Results:".cyan());
    for report in &summary.reports {
        println!("{}", result_line(report));
        print_failures(report, 2);
    }

    let failed = summary.failures().count();
    let total = summary.reports.len();
    println!();
    if summary.all_passed() {
        println!(
            "{} {} ({} tests)",
            "✓".green().bold(),
            "All tests passed".green().bold(),
            total
        );
    } else {
        let mut line = format!("{} of {} tests below 100%", failed, total);
        if summary.aborted {
            line.push_str(", run aborted");
        }
        println!("{} {}", "✗".red().bold(), line.red().bold());
    }
}

/// Failed items of every iteration, with their explanations
fn print_failures(report: &TestReport, indent: usize) {
    let pad = " ".repeat(indent + 4);
    for iteration in &report.iterations {
        for (item, result) in &iteration.checklist {
            if !matches!(result, CheckResult::Failure) {
                continue;
            }
            let mut line = format!("{}{} {}", pad, "-".red(), item);
            if report.iterations.len() > 1 {
                line.push_str(&format!(" (iteration {})", iteration.iteration));
            }
            if let Some(explanation) = iteration.explanations.get(item) {
                line.push_str(&format!(": {}", explanation.dimmed()));
            }
            println!("{}", line);
        }
    }
    for sub_test in &report.sub_tests {
        println!(
            "{}{} {} {}",
            pad,
            "↳".dimmed(),
            percentage(sub_test.success_percentage),
            sub_test.name()
        );
        print_failures(sub_test, indent + 4);
    }
}

fn print_declarations(plan: &LoadedPlan) {
    println!("{} {}", "Plan:".blue().bold(), plan.path.display());
    for (name, factory) in plan.registry.iter() {
        let schema = factory.schema();
        println!(
            "\n{} {}",
            name.white().bold(),
            format!("[{}]", plan::kind_label(factory.kind())).dimmed()
        );
        if !schema.description().is_empty() {
            println!("  {}", schema.description().dimmed());
        }
        if let Some(command) = plan.registry.command(name) {
            match (command.program(), command.resolve_program()) {
                (Some(program), Some(resolved)) => {
                    println!("  {} {} -> {}", "✓".green(), program, resolved.display())
                }
                (Some(program), None) => println!("  {} {} not found in PATH", "✗".red(), program),
                (None, _) => println!("  {} shell command", "·".dimmed()),
            }
        }
        println!(
            "  timeout {}s, setup timeout {}s",
            schema.timeout().as_secs_f64(),
            schema.async_setup_timeout().as_secs_f64()
        );
        println!("  {}", "Arguments:".cyan());
        for (arg, spec) in schema.arguments() {
            let global = if spec.global { " (global)" } else { "" };
            println!("    {}{}: {}", arg, global, spec.description.dimmed());
        }
        println!("  {}", "Checklist:".cyan());
        for (item, spec) in schema.checklist() {
            let global = if spec.global { " (global)" } else { "" };
            println!("    {}{}: {}", item, global, spec.description.dimmed());
        }
    }
}

fn print_declarations_json(plan: &LoadedPlan) -> Result<()> {
    let declarations: Vec<_> = plan
        .registry
        .iter()
        .map(|(name, factory)| {
            serde_json::json!({
                "name": name,
                "kind": plan::kind_label(factory.kind()),
                "program": plan.registry.command(name).and_then(|c| c.program()),
                "resolved": plan
                    .registry
                    .command(name)
                    .and_then(|c| c.resolve_program())
                    .map(|p| p.display().to_string()),
                "schema": factory.schema().as_ref(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&declarations)?);
    Ok(())
}
