// 该文件是 Posekit 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use posekit::{
  list_models,
  model::ModelOptions,
  registry::EstimatorRegistry,
  task::{FrameProcessor, ProcessError, ProcessFlags, StopHandle},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// 对视频逐帧做姿态估计
  Process {
    /// 视频文件、图像序列目录或输入 URL
    video: String,

    /// 模型名称
    #[arg(short, long, default_value = "stub")]
    model: String,

    /// 输出目录
    #[arg(short, long, default_value = "results")]
    output_dir: PathBuf,

    /// 不生成标注视频
    #[arg(long)]
    no_video: bool,

    /// 不保存关键点报告
    #[arg(long)]
    no_keypoints: bool,

    /// 最多处理的帧数
    #[arg(long)]
    max_frames: Option<u64>,

    /// 模型参数，格式为 key=value，可重复
    #[arg(long = "option", value_name = "KEY=VALUE")]
    options: Vec<String>,

    /// 模型复杂度，原样传给模型
    #[arg(long)]
    model_complexity: Option<u32>,

    /// 最低检测置信度
    #[arg(long)]
    min_detection_confidence: Option<f64>,
  },
  /// 列出可用的模型
  Models,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let args = Args::parse();
  let registry = EstimatorRegistry::with_builtin();

  match args.command {
    Command::Models => {
      for model in list_models(&registry) {
        println!("{:<12} {}", model.id, model.display_name);
      }
      Ok(())
    }
    Command::Process {
      video,
      model,
      output_dir,
      no_video,
      no_keypoints,
      max_frames,
      options,
      model_complexity,
      min_detection_confidence,
    } => {
      let mut model_options = ModelOptions::new();
      for option in &options {
        let parsed: ModelOptions = option
          .parse()
          .with_context(|| format!("无效的模型参数: {}", option))?;
        model_options = model_options.merged(&parsed);
      }
      if let Some(complexity) = model_complexity {
        model_options.insert("model_complexity", complexity);
      }
      if let Some(confidence) = min_detection_confidence {
        model_options.insert("min_detection_confidence", confidence);
      }

      let stop = StopHandle::new();
      let handler_stop = stop.clone();
      ctrlc::set_handler(move || {
        info!("收到中断信号，处理完当前帧后停止...");
        handler_stop.request_stop();
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })
      .context("无法设置 Ctrl-C 处理函数")?;

      let processor = FrameProcessor::new(&registry, &model)
        .with_options(model_options)
        .with_output_dir(&output_dir)
        .with_flags(ProcessFlags {
          save_annotated_video: !no_video,
          save_report: !no_keypoints,
        })
        .with_max_frames(max_frames)
        .with_stop_handle(stop);

      let report = match processor.process(&video) {
        Ok(report) => report,
        Err(ProcessError::FrameDecode {
          frame, partial, ..
        }) if partial.artifacts.report_path.is_some() => {
          anyhow::bail!(
            "第 {} 帧解码失败, 部分结果 ({} 帧) 已保存到 {}",
            frame,
            partial.frames.len(),
            partial
              .artifacts
              .report_path
              .as_deref()
              .map(|p| p.display().to_string())
              .unwrap_or_default()
          );
        }
        Err(e) => return Err(e.into()),
      };

      let stats = &report.processing_stats;
      println!("处理完成!");
      println!("模型: {}", report.model_info.name);
      println!("总帧数: {}", stats.total_frames);
      println!(
        "检测到姿态: {} 帧 ({:.1}%)",
        stats.frames_with_pose,
        stats.pose_detection_rate * 100.0
      );
      if stats.frames_failed_detection > 0 {
        println!("检测失败: {} 帧", stats.frames_failed_detection);
      }
      println!("平均速度: {:.2} fps", stats.avg_fps);
      if report.incomplete {
        println!("处理被中断, 结果不完整");
      }
      if let Some(path) = &report.artifacts.report_path {
        println!("关键点报告: {}", path.display());
      }
      if let Some(path) = &report.artifacts.annotated_video_path {
        println!("标注视频: {}", path.display());
      }
      Ok(())
    }
  }
}
