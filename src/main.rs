//! Noori - 指令派发引擎
//!
//! 入口：初始化日志、加载配置、创建引擎与编排器，并运行命令行对话循环。
//! 输入 exit / quit 退出；Ctrl+C 取消正在进行的对话。

use std::sync::Arc;

use anyhow::Context;
use noori::config::{load_config, AppConfig};
use noori::core::{spawn_engine, Command, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    noori::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let engine = Arc::new(Engine::from_config(&cfg).context("Failed to build engine")?);
    let (cmd_tx, mut out_rx) = spawn_engine(engine);

    // Ctrl+C：取消当前对话而不是退出
    let cancel_tx = cmd_tx.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if cancel_tx.send(Command::Cancel).is_err() {
                break;
            }
        }
    });

    println!("Noori initialized. Type 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\nYou: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }

        cmd_tx
            .send(Command::Submit(input.to_string()))
            .context("Engine stopped")?;
        let Some(outcome) = out_rx.recv().await else {
            break;
        };
        match outcome.result {
            Ok(answer) if answer.trim().is_empty() => println!("\nNoori: (no answer)"),
            Ok(answer) => println!("\nNoori: {}", answer),
            Err(e) => println!("\nNoori: I encountered an error - {}", e),
        }
    }

    let _ = cmd_tx.send(Command::Quit);
    Ok(())
}
