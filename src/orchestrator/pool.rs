// 该文件是 Shanan （山南西风） 项目的一部分。
// src/orchestrator/pool.rs - 工作进程池
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use std::{env, thread};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::partition::IndexRange;

/// 工作进程可执行文件名
pub const WORKER_BINARY: &str = "test-net";

#[derive(Error, Debug)]
pub enum LaunchError {
  #[error("找不到工作进程可执行文件 {0}")]
  BinaryNotFound(PathBuf),
  #[error("启动工作进程 {binary} 失败: {source}")]
  Spawn {
    binary: PathBuf,
    source: std::io::Error,
  },
  #[error("创建日志文件 {path} 失败: {source}")]
  LogFile {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("区间 {range} 的工作进程异常退出 ({status})，详见 {log}")]
  Exit {
    range: IndexRange,
    status: ExitStatus,
    log: PathBuf,
  },
  #[error("区间 {range} 的工作进程超过 {timeout:?} 仍未结束")]
  Timeout { range: IndexRange, timeout: Duration },
  #[error("查询区间 {range} 的工作进程状态失败: {source}")]
  Wait {
    range: IndexRange,
    source: std::io::Error,
  },
  #[error("收到中断信号，已终止所有工作进程")]
  Interrupted,
  #[error("设置中断处理失败: {0}")]
  Signal(#[from] ctrlc::Error),
}

/// 查找工作进程可执行文件：优先使用配置，否则在当前可执行文件所在目录查找
pub fn locate_worker_binary(config: &Config) -> Result<PathBuf, LaunchError> {
  let candidate = match &config.workers.binary {
    Some(binary) => binary.clone(),
    None => {
      let name = format!("{}{}", WORKER_BINARY, env::consts::EXE_SUFFIX);
      env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
    }
  };
  if candidate.is_file() {
    Ok(candidate)
  } else {
    Err(LaunchError::BinaryNotFound(candidate))
  }
}

/// 安装 Ctrl-C 处理，返回中断通知通道；整个进程只能调用一次
pub fn install_interrupt_handler() -> Result<Receiver<()>, LaunchError> {
  let (tx, rx) = std::sync::mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备终止工作进程...");
    let _ = tx.send(());
    thread::spawn(|| {
      thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })?;
  Ok(rx)
}

/// 单个工作进程的启动参数
#[derive(Debug, Clone)]
pub struct WorkerSpec {
  pub range: IndexRange,
  pub device: usize,
  pub args: Vec<OsString>,
  /// 标准输出与标准错误重定向到该文件
  pub log_path: PathBuf,
  /// 工作进程写出的结果文件
  pub artifact: PathBuf,
}

struct WorkerHandle {
  spec: WorkerSpec,
  child: Child,
  started: Instant,
  done: bool,
}

/// 一组并行运行的工作进程
///
/// 任意一个进程启动失败、异常退出或超时都会终止其余进程。
pub struct WorkerPool<'a> {
  binary: PathBuf,
  timeout: Option<Duration>,
  poll_interval: Duration,
  interrupt: Option<&'a Receiver<()>>,
  workers: Vec<WorkerHandle>,
}

impl<'a> WorkerPool<'a> {
  pub fn new(binary: &Path, timeout: Option<Duration>, poll_interval: Duration) -> Self {
    Self {
      binary: binary.to_path_buf(),
      timeout,
      poll_interval,
      interrupt: None,
      workers: Vec::new(),
    }
  }

  pub fn with_interrupt(mut self, interrupt: Option<&'a Receiver<()>>) -> Self {
    self.interrupt = interrupt;
    self
  }

  pub fn len(&self) -> usize {
    self.workers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.workers.is_empty()
  }

  pub fn launch(&mut self, spec: WorkerSpec) -> Result<(), LaunchError> {
    let log = File::create(&spec.log_path).map_err(|source| LaunchError::LogFile {
      path: spec.log_path.clone(),
      source,
    })?;
    let log_err = log.try_clone().map_err(|source| LaunchError::LogFile {
      path: spec.log_path.clone(),
      source,
    })?;

    let child = Command::new(&self.binary)
      .args(&spec.args)
      .stdin(Stdio::null())
      .stdout(Stdio::from(log))
      .stderr(Stdio::from(log_err))
      .spawn()
      .map_err(|source| LaunchError::Spawn {
        binary: self.binary.clone(),
        source,
      });
    let child = match child {
      Ok(child) => child,
      Err(e) => {
        self.kill_all();
        return Err(e);
      }
    };

    info!(
      "启动工作进程 pid={} 区间 {} 设备 {}，日志 {}",
      child.id(),
      spec.range,
      spec.device,
      spec.log_path.display()
    );
    self.workers.push(WorkerHandle {
      spec,
      child,
      started: Instant::now(),
      done: false,
    });
    Ok(())
  }

  /// 等待所有工作进程结束，返回按区间起点排序的 `(区间, 结果文件)`
  pub fn wait_all(mut self) -> Result<Vec<(IndexRange, PathBuf)>, LaunchError> {
    loop {
      if self.interrupt.is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，终止所有工作进程");
        self.kill_all();
        return Err(LaunchError::Interrupted);
      }

      if let Err(e) = self.poll() {
        error!("{}", e);
        self.kill_all();
        return Err(e);
      }
      if self.workers.iter().all(|w| w.done) {
        break;
      }
      thread::sleep(self.poll_interval);
    }

    let mut finished: Vec<(IndexRange, PathBuf)> = self
      .workers
      .iter()
      .map(|w| (w.spec.range, w.spec.artifact.clone()))
      .collect();
    finished.sort_by_key(|(range, _)| range.start);
    Ok(finished)
  }

  fn poll(&mut self) -> Result<(), LaunchError> {
    let timeout = self.timeout;
    for worker in self.workers.iter_mut().filter(|w| !w.done) {
      let range = worker.spec.range;
      match worker.child.try_wait() {
        Ok(Some(status)) if status.success() => {
          worker.done = true;
          info!(
            "区间 {} 的工作进程完成，耗时 {:.1}s",
            range,
            worker.started.elapsed().as_secs_f64()
          );
        }
        Ok(Some(status)) => {
          worker.done = true;
          return Err(LaunchError::Exit {
            range,
            status,
            log: worker.spec.log_path.clone(),
          });
        }
        Ok(None) => {
          if let Some(timeout) = timeout {
            if worker.started.elapsed() > timeout {
              return Err(LaunchError::Timeout { range, timeout });
            }
          }
        }
        Err(source) => return Err(LaunchError::Wait { range, source }),
      }
    }
    Ok(())
  }

  fn kill_all(&mut self) {
    for worker in self.workers.iter_mut().filter(|w| !w.done) {
      warn!("终止区间 {} 的工作进程 pid={}", worker.spec.range, worker.child.id());
      let _ = worker.child.kill();
      let _ = worker.child.wait();
      worker.done = true;
    }
  }
}

impl Drop for WorkerPool<'_> {
  fn drop(&mut self) {
    self.kill_all();
  }
}
