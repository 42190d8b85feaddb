// runコマンド - 画像パイプラインの組み立てと実行

use crate::core::{PipelineConfig, RunSummary};
use crate::engine::{Pipeline, PipelineBuilder, Topology};
use crate::imaging::{
    ConsoleDisplaySink, DirectoryImageSource, ImagePayload, LoadImageTransform,
    NoiseImageTransform, ScaleImageTransform,
};
use crate::services::{ConsolePipelineObserver, DefaultPipelineConfig};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// runコマンドの実行パラメータ
pub struct RunOptions {
    pub target_directory: PathBuf,
    pub topology: Topology,
    pub capacity: usize,
    pub workers: Option<usize>,
    pub limit: Option<u64>,
    pub noise: f64,
    pub width: u32,
    pub height: u32,
    pub report: Option<PathBuf>,
    pub quiet: bool,
}

/// 画像パイプラインを組み立てて実行する
///
/// Ctrl-Cでキャンセルが要求され、流れているアイテムを掃き切ってから
/// 終了する。上限未指定の場合はディレクトリを無限に巡回する。
pub async fn execute_run(options: RunOptions) -> Result<()> {
    if !options.target_directory.exists() {
        anyhow::bail!(
            "対象ディレクトリが存在しません: {}",
            options.target_directory.display()
        );
    }

    let workers = options.workers.unwrap_or_else(|| num_cpus::get().max(1));
    let config = DefaultPipelineConfig::default()
        .with_capacity(options.capacity)
        .with_worker_count(workers)
        .with_progress_reporting(!options.quiet);

    let sink = if options.quiet {
        Arc::new(ConsoleDisplaySink::quiet())
    } else {
        Arc::new(ConsoleDisplaySink::new())
    };
    let observer = if config.enable_progress_reporting() {
        Arc::new(ConsolePipelineObserver::new())
    } else {
        Arc::new(ConsolePipelineObserver::quiet())
    };

    let pipeline: Pipeline<ImagePayload> = PipelineBuilder::new(config)
        .topology(options.topology)
        .stage("load", Arc::new(LoadImageTransform::new()))
        .stage(
            "scale",
            Arc::new(ScaleImageTransform::new(options.width, options.height)),
        )
        .balanced_stage("filter", Arc::new(NoiseImageTransform::new(options.noise)))
        .sink(sink)
        .observer(observer)
        .on_error(|record| {
            eprintln!("❌ 最初の失敗: {record}");
        })
        .build()
        .context("パイプラインの組み立てに失敗しました")?;

    // Ctrl-Cでのキャンセル(何度押しても効果は1回分)
    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⏹  キャンセル要求を受け付けました。ドレイン中...");
            cancel.cancel();
        }
    });

    let source = DirectoryImageSource::scan(&options.target_directory, true, options.limit)?;
    if !options.quiet {
        println!(
            "📂 {} ({}ファイル) を {} トポロジで処理します",
            options.target_directory.display(),
            source.file_count(),
            pipeline.topology().as_str()
        );
    }

    let summary = pipeline.run(source).await?;

    print_summary(&summary, &pipeline, options.quiet);

    if let Some(report_path) = &options.report {
        write_report(report_path, &summary, &pipeline, options.capacity, workers)?;
        if !options.quiet {
            println!("📄 レポートを書き出しました: {}", report_path.display());
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary, pipeline: &Pipeline<ImagePayload>, quiet: bool) {
    if quiet {
        return;
    }

    println!("\n📊 実行結果:");
    println!("   - 投入: {}", summary.admitted);
    println!("   - 完了: {}", summary.completed);
    println!("   - 失敗: {}", summary.failed);
    println!("   - スキップ: {}", summary.skipped);
    println!("   - 経過時間: {}ms", summary.total_elapsed_ms);
    println!(
        "   - 平均処理時間: {:.2}ms/item",
        summary.average_time_per_item_ms
    );
    println!("   - 同時アイテム数の最大値: {}", pipeline.peak_in_flight());

    let statistics = pipeline.statistics();
    for (stage, average_ms) in statistics.stage_averages() {
        println!("   - {stage}: 平均 {average_ms:.2}ms");
    }
}

fn write_report(
    path: &PathBuf,
    summary: &RunSummary,
    pipeline: &Pipeline<ImagePayload>,
    capacity: usize,
    workers: usize,
) -> Result<()> {
    let statistics = pipeline.statistics();
    let report = serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "topology": pipeline.topology().as_str(),
        "settings": {
            "capacity": capacity,
            "workers": workers,
        },
        "summary": summary,
        "peak_in_flight": pipeline.peak_in_flight(),
        "average_latency_ms": statistics.average_latency_ms(),
        "stage_averages_ms": statistics
            .stage_averages()
            .into_iter()
            .collect::<std::collections::BTreeMap<String, f64>>(),
        "queue_depths": pipeline
            .queue_depths()
            .into_iter()
            .collect::<std::collections::BTreeMap<String, usize>>(),
    });

    std::fs::write(path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("レポート書き出しエラー: {}", path.display()))?;
    Ok(())
}
