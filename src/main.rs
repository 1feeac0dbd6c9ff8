use clap::Parser;
use serde_json::json;

use franken_dub::backend::{build_synthesizer, preflight};
use franken_dub::benchmark::run_benchmark;
use franken_dub::cli::{Cli, Command, RunArgs, ShutdownController};
use franken_dub::closure::run_finish;
use franken_dub::config::AppConfig;
use franken_dub::pipeline::{CancellationToken, prepare_tts_input, run_dub_with_synthesizer};
use franken_dub::report::write_tuning_report;
use franken_dub::selection::lock_recommended_profile;
use franken_dub::tuning::run_tuning;
use franken_dub::{DubError, DubResult};

fn main() {
    franken_dub::logging::init();

    let cli = Cli::parse();
    let token = cli.command.cancellation_token();
    let handler_token = token.clone();
    if let Err(e) = ShutdownController::install(Some(Box::new(move || handler_token.cancel()))) {
        tracing::warn!("failed to install Ctrl+C handler: {e}");
    }

    if let Err(error) = run(cli, &token) {
        if ShutdownController::is_shutting_down() {
            eprintln!("interrupted");
            std::process::exit(ShutdownController::signal_exit_code());
        }
        eprintln!("error[{}]: {error}", error.error_code());
        std::process::exit(error.exit_code());
    }

    if ShutdownController::is_shutting_down() {
        std::process::exit(ShutdownController::signal_exit_code());
    }
}

fn print_json(value: &serde_json::Value) -> DubResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_single(args: &RunArgs, token: &CancellationToken) -> DubResult<()> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    if args.strict {
        config.qa.fail_on_flags = true;
    }
    let issues = preflight(&config.tts);
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!(backend = %config.tts.backend, "{issue}");
        }
        return Err(DubError::CommandMissing {
            command: config.tts.backend.to_string(),
        });
    }
    let synthesizer = build_synthesizer(&config.tts)?;
    let artifacts = run_dub_with_synthesizer(&args.to_request(), &config, synthesizer.as_ref(), token)?;
    print_json(&json!({
        "run_id": artifacts.run_id,
        "tts_output_json": artifacts.tts_output_json,
        "qa_report_json": artifacts.qa_report_json,
        "run_manifest_json": artifacts.run_manifest_json,
        "stitched_preview_wav": artifacts.preview.path,
        "quality_flags": artifacts.qa_report.quality_flags,
        "qa_gate": artifacts.qa_gate,
        "postfit": artifacts.postfit,
    }))
}

fn run(cli: Cli, token: &CancellationToken) -> DubResult<()> {
    match cli.command {
        Command::Prepare(args) => {
            let document =
                prepare_tts_input(&args.translation_output, &args.output, args.language.as_deref())?;
            print_json(&json!({
                "tts_input_json": args.output,
                "language": document.language,
                "segment_count": document.segment_count,
                "total_target_word_count": document.total_target_word_count,
            }))
        }
        Command::Run(args) => run_single(&args, token),
        Command::Benchmark(args) => {
            let artifacts = run_benchmark(&args.to_request(), token)?;
            print_json(&json!({
                "report_json": artifacts.report_json,
                "ranking": artifacts.report.ranking,
                "summary": artifacts.report.summary,
            }))
        }
        Command::Tune(args) => {
            let artifacts = run_tuning(&args.to_request(), token)?;
            print_json(&json!({
                "generated_config_count": artifacts.generated_config_paths.len(),
                "benchmark_report_json": artifacts.benchmark_report_json,
                "tuning_report_markdown": artifacts.tuning_report_markdown,
                "recommended_profile": artifacts.recommended_profile,
                "recommended_config_path": artifacts.recommended_config_path,
                "selection_report_json": artifacts.selection_report_json,
                "meta_json": artifacts.meta_json,
            }))
        }
        Command::Lock(args) => {
            let artifacts = lock_recommended_profile(
                &args.report,
                &args.output_config,
                args.selection_report.as_deref(),
            )?;
            print_json(&json!({
                "recommended_profile": artifacts.recommended_profile,
                "source_config_path": artifacts.source_config_path,
                "output_config_path": artifacts.output_config_path,
                "selection_report_json": artifacts.selection_report_json,
            }))
        }
        Command::Report(args) => {
            let markdown = write_tuning_report(&args.report, args.output.as_deref())?;
            print_json(&json!({ "tuning_report_markdown": markdown }))
        }
        Command::Finish(args) => {
            let artifacts = run_finish(&args.to_request(), token)?;
            print_json(&json!({
                "tts_input_json": artifacts.tts_input_json,
                "selected_config_path": artifacts.selected_config_path,
                "closure_report_json": artifacts.closure_report_json,
                "qa_gate": artifacts.run.qa_gate,
                "stitched_preview_wav": artifacts.run.preview.path,
            }))
        }
    }
}
