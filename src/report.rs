//! Markdown rendering of a benchmark report for human review.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::benchmark::{BenchmarkProfileResult, BenchmarkReport, ProfileStatus};
use crate::error::{DubError, DubResult};

pub const TUNING_REPORT_FILE: &str = "tuning_report.md";

fn seconds(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_owned(), |value| format!("{value:.3}"))
}

fn status_label(status: ProfileStatus) -> &'static str {
    match status {
        ProfileStatus::Ok => "ok",
        ProfileStatus::FailedPreflight => "failed_preflight",
        ProfileStatus::FailedRun => "failed_run",
    }
}

fn table_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn profile_row(profile: &BenchmarkProfileResult) -> String {
    let flags = profile
        .quality_flag_count
        .map_or_else(|| "-".to_owned(), |count| count.to_string());
    let segments = match (profile.postfit_padding_segments, profile.postfit_trim_segments) {
        (Some(pad), Some(trim)) => format!("{pad}/{trim}"),
        _ => "-".to_owned(),
    };
    let adjusted = match (
        profile.postfit_total_padded_seconds,
        profile.postfit_total_trimmed_seconds,
    ) {
        (Some(pad), Some(trim)) => format!("{pad:.3}/{trim:.3}"),
        _ => "-".to_owned(),
    };
    format!(
        "| {} | {} | {} | {} | {} | {} | {} | {} |",
        table_cell(&profile.profile_name),
        status_label(profile.status),
        seconds(profile.total_pipeline_seconds),
        seconds(profile.max_abs_duration_delta_seconds),
        flags,
        segments,
        adjusted,
        table_cell(profile.error.as_deref().unwrap_or_default()),
    )
}

#[must_use]
pub fn render_tuning_markdown(report: &BenchmarkReport, report_json: &Path) -> String {
    let mut out = String::new();
    let recommended = report
        .summary
        .recommended_profile
        .as_deref()
        .unwrap_or("None");
    let _ = writeln!(out, "# TTS Tuning Report");
    let _ = writeln!(out);
    let _ = writeln!(out, "- Input: `{}`", report.tts_input_json);
    let _ = writeln!(out, "- Benchmark report: `{}`", report_json.display());
    let _ = writeln!(out, "- Recommended profile: `{recommended}`");
    let _ = writeln!(
        out,
        "- Profiles: {} ({} ok, {} failed)",
        report.summary.profile_count, report.summary.success_count, report.summary.failed_count
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "## Profile Table");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "| Profile | Status | Total (s) | Max \\|Delta\\| (s) | Flags | Postfit Seg (pad/trim) | Postfit Sec (pad/trim) | Notes |"
    );
    let _ = writeln!(out, "| --- | --- | ---: | ---: | ---: | ---: | ---: | --- |");
    for profile in &report.profiles {
        let _ = writeln!(out, "{}", profile_row(profile));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "## Ranking");
    let _ = writeln!(out);
    if report.ranking.is_empty() {
        let _ = writeln!(out, "No successful profile ranking.");
    } else {
        let ranking = report
            .ranking
            .iter()
            .map(|name| format!("`{name}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "{ranking}");
    }
    out
}

/// Render `benchmark_report_json` to markdown. Defaults to
/// `tuning_report.md` next to the report.
pub fn write_tuning_report(
    benchmark_report_json: &Path,
    output_markdown: Option<&Path>,
) -> DubResult<PathBuf> {
    if !benchmark_report_json.is_file() {
        return Err(DubError::InputNotFound(benchmark_report_json.to_path_buf()));
    }
    let report = BenchmarkReport::load(benchmark_report_json)?;
    let target = output_markdown.map_or_else(
        || {
            benchmark_report_json
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(TUNING_REPORT_FILE)
        },
        Path::to_path_buf,
    );
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(&target, render_tuning_markdown(&report, benchmark_report_json))?;
    Ok(target)
}
